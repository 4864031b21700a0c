//! Core ferry primitives shared across crates.
//!
//! Includes bundle identifiers, priority classes, node roles, timestamps,
//! clocks, hash helpers, and base errors.

pub mod error;
pub mod hash;
pub mod time;
pub mod types;

pub use error::FerryError;
pub use time::{Clock, ManualClock, SystemClock};
pub use types::{BundleId, NodeRole, Priority, PublicKey, Timestamp};
