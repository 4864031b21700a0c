//! Cryptographic helpers used by ferry.
//!
//! Includes Ed25519 signing/verification abstractions and node key files.

pub mod keys;
pub mod signing;
