use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FerryError {
    /// Decode/parsing failure.
    #[error("decode error: {0}")]
    Decode(&'static str),
    /// Unrecognised enumerated value (priority, role).
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::FerryError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            FerryError::Decode("bad hex").to_string(),
            "decode error: bad hex"
        );
        assert_eq!(
            FerryError::UnknownVariant {
                kind: "priority",
                value: "urgent".into()
            }
            .to_string(),
            "unknown priority: urgent"
        );
    }
}
