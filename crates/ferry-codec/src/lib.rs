//! Ferry bundle codec.
//!
//! Defines the canonical bundle envelope, content-hash identity, signing and
//! verification, and the CBOR wire encoding exchanged between peers.

pub mod bundle;
pub mod error;
pub mod seal;

pub use bundle::{Bundle, BundleDraft, Signature};
pub use error::CodecError;
pub use seal::{is_valid, seal_bundle, sign_draft, verify_bundle};
