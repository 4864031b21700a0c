use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::connection::{Connection, Dialer, LinkError, LinkStats, DEFAULT_MAX_FRAME_LEN};

/// TCP link carrying `u32` big-endian length-prefixed frames.
#[derive(Debug)]
pub struct TcpConnection {
    stream: Option<TcpStream>,
    label: String,
    max_frame_len: usize,
    stats: LinkStats,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, label: impl Into<String>, max_frame_len: usize) -> Self {
        Self {
            stream: Some(stream),
            label: label.into(),
            max_frame_len,
            stats: LinkStats::default(),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn peer_label(&self) -> &str {
        &self.label
    }

    async fn send(&mut self, frame: Vec<u8>) -> Result<(), LinkError> {
        if frame.len() > self.max_frame_len {
            return Err(LinkError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }
        let stream = self.stream.as_mut().ok_or(LinkError::Closed)?;
        let len = u32::try_from(frame.len()).map_err(|_| LinkError::FrameTooLarge {
            len: frame.len(),
            max: u32::MAX as usize,
        })?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&frame).await?;
        stream.flush().await?;
        self.stats.on_send(frame.len());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        let stream = self.stream.as_mut().ok_or(LinkError::Closed)?;
        let mut len_buf = [0_u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_len {
            return Err(LinkError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let mut frame = vec![0_u8; len];
        stream.read_exact(&mut frame).await?;
        self.stats.on_recv(len);
        Ok(Some(frame))
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                debug!(peer = %self.label, "tcp shutdown failed: {err}");
            }
        }
    }

    fn stats(&self) -> LinkStats {
        self.stats
    }
}

/// Outbound TCP dialer.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    pub connect_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Conn = TcpConnection;

    async fn connect(&self, addr: &str) -> Result<TcpConnection, LinkError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| LinkError::Connect {
                addr: addr.to_string(),
                reason: "timed out".into(),
            })?
            .map_err(|e| LinkError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        Ok(TcpConnection::new(stream, addr, self.max_frame_len))
    }
}

/// Inbound TCP listener producing framed links.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    max_frame_len: usize,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str, max_frame_len: usize) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            max_frame_len,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, LinkError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<TcpConnection, LinkError> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(TcpConnection::new(
            stream,
            remote.to_string(),
            self.max_frame_len,
        ))
    }
}
