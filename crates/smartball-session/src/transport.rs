//! Transport port -- the one seam between the session engine and a link.
//!
//! Two implementations live in the binary crate: a notify-driven BLE port
//! and a polling serial port. The engine is written once against this trait.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use smartball_protocol::{Frame, FrameError, ProtocolError};

/// Which kind of link a port drives. Decides protocol-level differences:
/// only BLE devices erase in the background and announce READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Ble,
    Serial,
}

impl TransportKind {
    pub fn awaits_ready(&self) -> bool {
        matches!(self, TransportKind::Ble)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Ble => "ble",
            TransportKind::Serial => "serial",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("link disconnected")]
    Disconnected,
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad reply: {0}")]
    BadReply(#[from] ProtocolError),
    #[error("{0}")]
    Link(String),
}

impl TransportError {
    /// The link is unusable; no further writes should be attempted.
    pub fn is_fatal_to_link(&self) -> bool {
        match self {
            TransportError::Frame(FrameError::Io(_)) => true,
            TransportError::Timeout(_) | TransportError::Frame(_) | TransportError::BadReply(_) => {
                false
            }
            _ => true,
        }
    }
}

/// A connected (or connectable) frame pipe to one device.
///
/// A port is exclusively owned by one session attempt. Every wait is bounded.
#[async_trait]
pub trait TransportPort: Send {
    /// What identifies the device on this link (BLE name/address, serial path).
    type Handle: Clone + fmt::Display + Send + Sync;

    fn kind(&self) -> TransportKind;

    async fn connect(&mut self, handle: &Self::Handle, timeout: Duration)
        -> Result<(), TransportError>;

    /// Write a frame without waiting for any reply.
    ///
    /// Replies still pending from earlier requests are dropped first, so the
    /// next `recv` only sees what arrives after this write.
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Wait for the next inbound frame whose type is in `accept`.
    /// Frames of other types are discarded.
    async fn recv(&mut self, accept: &[u8], timeout: Duration) -> Result<Frame, TransportError>;

    /// Write, then block for the matching reply.
    async fn send_and_wait(
        &mut self,
        frame: &Frame,
        accept: &[u8],
        timeout: Duration,
    ) -> Result<Frame, TransportError> {
        self.send(frame).await?;
        self.recv(accept, timeout).await
    }

    /// Best-effort teardown. Safe to call more than once.
    async fn disconnect(&mut self);
}

/// Creates fresh ports (one per attempt) and answers presence queries.
#[async_trait]
pub trait PortFactory: Send + Sync {
    type Port: TransportPort;

    fn open(&self) -> Self::Port;

    /// Whether the device is currently visible on this link
    /// (advertising over BLE, port enumerated over serial).
    async fn is_present(
        &self,
        handle: &<Self::Port as TransportPort>::Handle,
        timeout: Duration,
    ) -> bool;
}
