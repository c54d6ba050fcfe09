//! Test doubles for the agent contract.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncReadExt;

use crate::agent::{AgentError, AgentFactory, AgentRuntime, ApiServerConfig, ServeOptions};
use crate::improver::Improver;

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    RunUntilCancelled,
    Fail(String),
    Panic,
}

pub(crate) struct MockAgent {
    behavior: Behavior,
    plain_starts: AtomicUsize,
    api_configs: Mutex<Vec<ApiServerConfig>>,
    signal_handlers_requested: AtomicUsize,
    improver: Option<Arc<dyn Improver>>,
}

impl MockAgent {
    pub(crate) fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            plain_starts: AtomicUsize::new(0),
            api_configs: Mutex::new(Vec::new()),
            signal_handlers_requested: AtomicUsize::new(0),
            improver: None,
        }
    }

    pub(crate) fn plain_starts(&self) -> usize {
        self.plain_starts.load(Ordering::SeqCst)
    }

    pub(crate) fn api_configs(&self) -> Vec<ApiServerConfig> {
        self.api_configs.lock().unwrap().clone()
    }

    pub(crate) fn signal_handlers_requested(&self) -> usize {
        self.signal_handlers_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn improver_name(&self) -> Option<String> {
        self.improver.as_ref().map(|i| i.name().to_string())
    }

    async fn run(&self, opts: ServeOptions) -> Result<(), AgentError> {
        if opts.install_signal_handlers {
            self.signal_handlers_requested.fetch_add(1, Ordering::SeqCst);
        }
        match &self.behavior {
            Behavior::RunUntilCancelled => {
                opts.shutdown.cancelled().await;
                Ok(())
            }
            Behavior::Fail(msg) => Err(AgentError::Serve(msg.clone())),
            Behavior::Panic => panic!("mock agent exploded"),
        }
    }
}

#[async_trait]
impl AgentRuntime for MockAgent {
    async fn start_server(&self, opts: ServeOptions) -> Result<(), AgentError> {
        self.plain_starts.fetch_add(1, Ordering::SeqCst);
        self.run(opts).await
    }

    async fn start_server_api(
        &self,
        config: ApiServerConfig,
        opts: ServeOptions,
    ) -> Result<(), AgentError> {
        self.api_configs.lock().unwrap().push(config);
        self.run(opts).await
    }
}

pub(crate) struct MockFactory {
    behavior: Behavior,
    fail_create: bool,
    created: Mutex<Vec<Arc<MockAgent>>>,
}

impl MockFactory {
    pub(crate) fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            fail_create: false,
            created: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::new(Behavior::RunUntilCancelled)
        }
    }

    pub(crate) fn created(&self) -> Vec<Arc<MockAgent>> {
        self.created.lock().unwrap().clone()
    }
}

impl AgentFactory for MockFactory {
    fn create(&self, improver: Arc<dyn Improver>) -> Result<Arc<dyn AgentRuntime>, AgentError> {
        if self.fail_create {
            return Err(AgentError::Unavailable("mock backend offline".to_string()));
        }
        let agent = Arc::new(MockAgent {
            improver: Some(improver),
            ..MockAgent::new(self.behavior.clone())
        });
        self.created.lock().unwrap().push(Arc::clone(&agent));
        Ok(agent)
    }
}

/// Read every JSON line until the writer side closes.
pub(crate) async fn read_frames(mut reader: tokio::io::DuplexStream) -> Vec<Value> {
    let mut text = String::new();
    reader.read_to_string(&mut text).await.unwrap();
    text.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}
