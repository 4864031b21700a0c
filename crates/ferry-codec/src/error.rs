use ferry_crypto::signing::SigningError;
use thiserror::Error;

/// Errors returned by bundle codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// Bytes could not be decoded as a bundle envelope.
    #[error("corrupt envelope: {0}")]
    CorruptEnvelope(String),
    /// Envelope decoded but violates schema limits.
    #[error("invalid bundle: {0}")]
    InvalidBundle(&'static str),
    /// Declared id does not match the canonical content hash.
    #[error("bundle id does not match content hash")]
    IdMismatch,
    /// Signature does not verify against the author key.
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),
}

impl CodecError {
    /// True for failures that mean the envelope itself is malformed.
    pub fn is_corrupt_envelope(&self) -> bool {
        matches!(
            self,
            CodecError::CorruptEnvelope(_) | CodecError::InvalidBundle(_)
        )
    }
}
