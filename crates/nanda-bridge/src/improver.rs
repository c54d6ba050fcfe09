//! Improvement functions: the `(text) -> text` transform an agent applies to
//! every message.

use std::sync::Arc;

use async_trait::async_trait;

use crate::callback::CallbackExecutor;

/// Name used when the host registers logic without one.
pub const DEFAULT_LOGIC_NAME: &str = "nodejs_custom";

/// A message transform. Infallible by contract: implementations fall back to
/// the input text rather than fail.
#[async_trait]
pub trait Improver: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn improve(&self, text: &str) -> String;
}

/// Built-in transform used when no logic has been registered: trims the text,
/// uppercases the first character and lowercases the rest.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultImprover;

#[async_trait]
impl Improver for DefaultImprover {
    fn name(&self) -> &str {
        "default"
    }

    async fn improve(&self, text: &str) -> String {
        capitalize(text)
    }
}

pub fn capitalize(text: &str) -> String {
    let mut chars = text.trim().chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

/// Improvement logic registered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredCallback {
    pub name: String,
    pub source: String,
}

/// Improver backed by a registered callback run through the executor.
///
/// Any execution failure (timeout, missing runtime) yields the original text.
pub struct CallbackImprover {
    callback: RegisteredCallback,
    executor: Arc<CallbackExecutor>,
}

impl CallbackImprover {
    pub fn new(callback: RegisteredCallback, executor: Arc<CallbackExecutor>) -> Self {
        Self { callback, executor }
    }
}

#[async_trait]
impl Improver for CallbackImprover {
    fn name(&self) -> &str {
        &self.callback.name
    }

    async fn improve(&self, text: &str) -> String {
        match self.executor.execute(&self.callback.source, text).await {
            Ok(improved) => improved,
            Err(e) => {
                tracing::warn!(
                    logic = %self.callback.name,
                    error = %e,
                    "Improvement logic failed, keeping original text"
                );
                text.to_string()
            }
        }
    }
}
