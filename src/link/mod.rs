//! TCP control link to the vehicle.
//!
//! Owns exactly one connection at a time and reports everything that happens
//! on it (connect, disconnect, inbound lines, failures) over an event
//! channel, so the owning shell never touches the socket directly.

pub mod control_link;

pub use control_link::ControlLink;

use std::fmt;
use thiserror::Error;

/// Remote endpoint of a control session, supplied at connect time.
///
/// Not retained beyond the active session; the shell persists the last used
/// endpoint through the settings store if it wants to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection lifecycle state. Any failure moves back to `Disconnected`.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Events reported by the link to its owner.
///
/// One channel replaces a four-method listener interface; the receiver
/// returned by [`ControlLink::new`] delivers these in order.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    /// Connection established and ready to send
    Connected,
    /// Session ended; emitted exactly once per successful connect
    Disconnected,
    /// Inbound line from the vehicle (informational, not interpreted here)
    Message(String),
    /// A failure on the connect, send, or read path
    Error(LinkError),
}

/// Errors surfaced through [`LinkEvent::Error`].
///
/// All of them are terminal for the current connection. The link performs no
/// retries; after teardown it is ready for a fresh `connect`, and any retry
/// policy belongs to the caller.
#[derive(Clone, Debug, Error)]
pub enum LinkError {
    /// Handshake, timeout, or resolution failure during connect
    #[error("Connect error: {0}")]
    Connect(String),

    /// Send attempted with no active connection
    #[error("Not connected")]
    NotConnected,

    /// I/O failure while writing a command
    #[error("Send error: {0}")]
    Send(String),

    /// I/O failure while consuming the inbound stream
    #[error("Read error: {0}")]
    Read(String),
}
