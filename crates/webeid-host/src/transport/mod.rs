//! Transports carrying browser messages
//!
//! Each accepted connection becomes one browser context. Reading happens on a
//! transport thread that posts [`HostEvent`](crate::host::HostEvent)s; writing
//! happens on the host thread through an [`Outbound`].

pub mod pipe;
pub mod socket;

use std::io;

use serde_json::{Map, Value};
use thiserror::Error;

/// How a context is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Native messaging on stdio; one context per process
    Pipe,
    /// Local socket; any number of long-lived contexts
    Socket,
}

/// Reasons an inbound frame is not a message
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty message")]
    Empty,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

/// Parse one JSON object; an empty object counts as an empty message
pub fn parse_message(bytes: &[u8]) -> Result<Map<String, Value>, FrameError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(FrameError::Empty);
    }
    match serde_json::from_slice(bytes) {
        Ok(Value::Object(map)) if map.is_empty() => Err(FrameError::Empty),
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(FrameError::Malformed("not a JSON object".into())),
        Err(e) => Err(FrameError::Malformed(e.to_string())),
    }
}

/// Writing half of a connection, owned by its context
pub trait Outbound: Send {
    fn send(&mut self, message: &Map<String, Value>) -> io::Result<()>;

    /// Stop the connection; the reading side reports the close
    fn close(&mut self);
}
