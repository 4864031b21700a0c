use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::signing::Ed25519Signer;

/// Errors returned by node key file helpers.
#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("failed to read key file: {0}")]
    Read(io::Error),
    #[error("failed to write key file: {0}")]
    Write(io::Error),
    #[error("key file must hold 64 hex chars")]
    Malformed,
}

/// Parses a hex-encoded 32-byte secret.
pub fn parse_secret_hex(value: &str) -> Result<[u8; 32], KeyFileError> {
    let value = value.trim();
    if value.len() != 64 {
        return Err(KeyFileError::Malformed);
    }
    let mut out = [0_u8; 32];
    hex::decode_to_slice(value, &mut out).map_err(|_| KeyFileError::Malformed)?;
    Ok(out)
}

/// Loads the node signing key from a hex key file.
pub fn load_signer(path: impl AsRef<Path>) -> Result<Ed25519Signer, KeyFileError> {
    let raw = fs::read_to_string(path.as_ref()).map_err(KeyFileError::Read)?;
    Ok(Ed25519Signer::from_secret(parse_secret_hex(&raw)?))
}

/// Writes the signer's secret as hex, replacing any existing file atomically.
pub fn save_signer(path: impl AsRef<Path>, signer: &Ed25519Signer) -> Result<(), KeyFileError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(KeyFileError::Write)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, hex::encode(signer.secret_bytes())).map_err(KeyFileError::Write)?;
    fs::rename(&tmp, path).map_err(KeyFileError::Write)
}

/// Loads the key file, generating and saving a fresh key when absent.
pub fn load_or_generate_signer(
    path: impl AsRef<Path>,
) -> Result<(Ed25519Signer, bool), KeyFileError> {
    let path = path.as_ref();
    if path.exists() {
        return Ok((load_signer(path)?, false));
    }
    let signer = Ed25519Signer::generate();
    save_signer(path, &signer)?;
    Ok((signer, true))
}
