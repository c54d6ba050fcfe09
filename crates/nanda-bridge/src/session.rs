//! Bridge session: the read-dispatch-respond loop.
//!
//! A session announces itself with a `ready` notice, then handles one line at
//! a time until `shutdown` or end of input:
//!
//! ```text
//! Created ─> Ready ─> Idle / CallbackRegistered ─> ServerStarting ─> ServerRunning
//!                                                                        │
//!                                     ShuttingDown ─> Terminated <───────┘
//! ```

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::{DEFAULT_MAX_LINE_BYTES, JsonLinesCodec};
use crate::bridge::protocol::{Command, Response};
use crate::router::{self, BridgeState, CommandKind};
use crate::server::panic_message;
use crate::version::VersionInfo;

/// Message sent in the `ready` notice.
pub const READY_MESSAGE: &str = "Bridge initialized";

thread_local! {
    static LAST_PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a panic hook that records location and stack of the latest panic on
/// the panicking thread. The previous hook still runs.
fn install_panic_capture() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            let trace = format!(
                "panicked at {location}\nstack backtrace:\n{}",
                Backtrace::force_capture()
            );
            LAST_PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    LAST_PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Ready,
    Idle,
    CallbackRegistered,
    ServerStarting,
    ServerRunning,
    ShuttingDown,
    Terminated,
}

/// Why [`BridgeSession::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// The host sent `shutdown`.
    Shutdown,
    /// The host closed stdin.
    EndOfInput,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("control channel I/O error: {0}")]
    Io(#[from] io::Error),
}

pub struct BridgeSession {
    state: BridgeState,
    max_line_bytes: usize,
}

impl BridgeSession {
    /// Emit the `ready` notice. Nothing is read before this returns.
    pub async fn start(mut state: BridgeState, version: VersionInfo) -> Result<Self, BridgeError> {
        install_panic_capture();
        state.emitter().ready(READY_MESSAGE, version).await?;
        state.set_phase(SessionState::Ready);
        tracing::info!("Bridge ready");
        state.set_phase(SessionState::Idle);
        Ok(Self {
            state,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        })
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    pub fn state(&self) -> &BridgeState {
        &self.state
    }

    /// Process lines from `reader` until shutdown or end of input.
    ///
    /// Only I/O failures on the control channel are returned as errors; bad
    /// lines and failing commands are answered and the loop continues.
    pub async fn run<R>(&mut self, reader: R) -> Result<SessionExit, BridgeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames =
            FramedRead::new(reader, JsonLinesCodec::<Value>::with_max_length(self.max_line_bytes));

        while let Some(item) = frames.next().await {
            let frame = match item? {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "Rejected inbound line");
                    self.state
                        .emitter()
                        .respond(Response::rejected(None, e.to_string()))
                        .await?;
                    continue;
                }
            };

            if self.handle_frame(frame).await? == Some(SessionExit::Shutdown) {
                self.state.set_phase(SessionState::Terminated);
                tracing::info!("Bridge shut down by host");
                return Ok(SessionExit::Shutdown);
            }
        }

        tracing::info!("Control channel closed, stopping");
        self.state.stop_servers();
        self.state.set_phase(SessionState::Terminated);
        Ok(SessionExit::EndOfInput)
    }

    async fn handle_frame(&mut self, frame: Value) -> Result<Option<SessionExit>, BridgeError> {
        let command = match Command::from_frame(frame) {
            Ok(command) => command,
            Err((id, e)) => {
                tracing::warn!(error = %e, "Malformed command");
                let response = Response::rejected(id, format!("Invalid command: {e}"));
                self.state.emitter().respond(response).await?;
                return Ok(None);
            }
        };

        let kind = CommandKind::parse(command.name());
        take_panic_trace();
        let dispatched = AssertUnwindSafe(router::dispatch(&mut self.state, &command))
            .catch_unwind()
            .await;

        let response = match dispatched {
            Ok(outcome) if kind == Some(CommandKind::Shutdown) => {
                outcome.into_full_response(command.id.clone())
            }
            Ok(outcome) => outcome.into_response(command.id.clone()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(command = command.name(), error = %message, "Command handler panicked");
                let trace = take_panic_trace().unwrap_or_else(|| "no trace captured".to_string());
                let traceback = format!(
                    "panic while handling command '{}': {}\n{}",
                    command.name(),
                    message,
                    trace
                );
                Response::rejected(command.id.clone(), message).with_traceback(traceback)
            }
        };
        self.state.emitter().respond(response).await?;

        Ok((kind == Some(CommandKind::Shutdown)).then_some(SessionExit::Shutdown))
    }
}
