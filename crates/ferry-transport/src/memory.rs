use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::{Connection, Dialer, LinkError, LinkStats};

const DEFAULT_CAPACITY: usize = 256;

/// In-memory link end for tests and simulations.
#[derive(Debug)]
pub struct MemoryConnection {
    label: String,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
    cut_after_sent: Option<u64>,
    stats: LinkStats,
}

/// Creates two connected link ends. `a` sees `b_label` as its peer and vice versa.
pub fn memory_pair(
    a_label: impl Into<String>,
    b_label: impl Into<String>,
) -> (MemoryConnection, MemoryConnection) {
    let (a_tx, b_rx) = mpsc::channel(DEFAULT_CAPACITY);
    let (b_tx, a_rx) = mpsc::channel(DEFAULT_CAPACITY);
    let a = MemoryConnection {
        label: b_label.into(),
        tx: Some(a_tx),
        rx: a_rx,
        cut_after_sent: None,
        stats: LinkStats::default(),
    };
    let b = MemoryConnection {
        label: a_label.into(),
        tx: Some(b_tx),
        rx: b_rx,
        cut_after_sent: None,
        stats: LinkStats::default(),
    };
    (a, b)
}

impl MemoryConnection {
    /// Simulates link loss: the link drops once `frames` frames were sent.
    pub fn cut_after(mut self, frames: u64) -> Self {
        self.cut_after_sent = Some(frames);
        self
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn peer_label(&self) -> &str {
        &self.label
    }

    async fn send(&mut self, frame: Vec<u8>) -> Result<(), LinkError> {
        if let Some(limit) = self.cut_after_sent {
            if self.stats.frames_sent >= limit {
                self.tx = None;
                self.rx.close();
                return Err(LinkError::Closed);
            }
        }
        let tx = self.tx.as_ref().ok_or(LinkError::Closed)?;
        let len = frame.len();
        tx.send(frame).await.map_err(|_| LinkError::Closed)?;
        self.stats.on_send(len);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        match self.rx.recv().await {
            Some(frame) => {
                self.stats.on_recv(frame.len());
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    async fn disconnect(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    fn stats(&self) -> LinkStats {
        self.stats
    }
}

/// Accepts inbound in-memory links registered on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::Receiver<MemoryConnection>,
}

impl MemoryListener {
    /// Waits for the next dialed link; `None` once the network dropped it.
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.incoming.recv().await
    }
}

/// Address book of in-memory listeners; implements [`Dialer`].
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<MemoryConnection>>>>,
    local_label: String,
}

impl MemoryNetwork {
    /// A dialer handle whose outbound links identify as `local_label`.
    pub fn handle(&self, local_label: impl Into<String>) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
            local_label: local_label.into(),
        }
    }

    /// Registers a listener for `addr`, replacing any previous one.
    pub fn listen(&self, addr: impl Into<String>) -> MemoryListener {
        let (tx, rx) = mpsc::channel(16);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr.into(), tx);
        MemoryListener { incoming: rx }
    }
}

#[async_trait]
impl Dialer for MemoryNetwork {
    type Conn = MemoryConnection;

    async fn connect(&self, addr: &str) -> Result<MemoryConnection, LinkError> {
        let listener = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(addr)
            .cloned()
            .ok_or_else(|| LinkError::Connect {
                addr: addr.to_string(),
                reason: "no listener".into(),
            })?;
        let (local, remote) = memory_pair(self.local_label.clone(), addr.to_string());
        listener.send(remote).await.map_err(|_| LinkError::Connect {
            addr: addr.to_string(),
            reason: "listener gone".into(),
        })?;
        Ok(local)
    }
}
