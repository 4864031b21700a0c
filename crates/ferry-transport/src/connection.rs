use async_trait::async_trait;
use thiserror::Error;

/// Default largest frame accepted by framed links.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Link-level failures. Every variant ends the session using the link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is closed")]
    Closed,
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse per-link counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl LinkStats {
    pub(crate) fn on_send(&mut self, len: usize) {
        self.frames_sent += 1;
        self.bytes_sent += len as u64;
    }

    pub(crate) fn on_recv(&mut self, len: usize) {
        self.frames_received += 1;
        self.bytes_received += len as u64;
    }
}

/// Ordered, framed, bidirectional link to one peer.
#[async_trait]
pub trait Connection: Send {
    /// Human-readable remote label used in logs.
    fn peer_label(&self) -> &str;

    /// Sends one whole frame.
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), LinkError>;

    /// Waits for the next whole frame; `Ok(None)` when the peer closed.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError>;

    /// Closes the link. Idempotent.
    async fn disconnect(&mut self);

    fn stats(&self) -> LinkStats {
        LinkStats::default()
    }
}

/// Opens outbound links by address.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Conn: Connection + 'static;

    async fn connect(&self, addr: &str) -> Result<Self::Conn, LinkError>;
}

#[async_trait]
impl<C: Connection + ?Sized> Connection for Box<C> {
    fn peer_label(&self) -> &str {
        (**self).peer_label()
    }

    async fn send(&mut self, frame: Vec<u8>) -> Result<(), LinkError> {
        (**self).send(frame).await
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        (**self).recv().await
    }

    async fn disconnect(&mut self) {
        (**self).disconnect().await
    }

    fn stats(&self) -> LinkStats {
        (**self).stats()
    }
}
