//! IPC bridge for host-bridge communication.
//!
//! This module provides the wire protocol and codec for communication between
//! the Node.js host (parent) and this bridge process.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Command, Response, Notice)
//! - **codec**: newline-delimited JSON codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
