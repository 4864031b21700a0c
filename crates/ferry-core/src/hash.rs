/// Computes BLAKE3 and returns the first-class 32-byte digest value.
pub fn blake3_32(input: &[u8]) -> [u8; 32] {
    *blake3::hash(input).as_bytes()
}

/// Computes BLAKE3 over `domain || input` for domain-separated digests.
pub fn blake3_32_domain(domain: &[u8], input: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    hasher.update(input);
    *hasher.finalize().as_bytes()
}
