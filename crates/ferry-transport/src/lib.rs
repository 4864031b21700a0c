//! Transport abstraction for ferry reconciliation sessions.
//!
//! The radio/mesh layer is external; sessions only see a framed, ordered,
//! bidirectional [`connection::Connection`] to one peer.

pub mod connection;
pub mod memory;
pub mod tcp;

pub use connection::{Connection, Dialer, LinkError, LinkStats};
pub use memory::{memory_pair, MemoryConnection, MemoryListener, MemoryNetwork};
pub use tcp::{TcpAcceptor, TcpConnection, TcpDialer};
