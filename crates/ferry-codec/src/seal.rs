use ferry_core::BundleId;
use ferry_crypto::signing::{Signer, Verifier};

use crate::bundle::{Bundle, BundleDraft, Signature};
use crate::error::CodecError;

/// Domain separator for the signature preimage.
pub const SIGNATURE_DOMAIN: &[u8] = b"ferry/bundle-sig/v1";

fn signature_message(id: &BundleId) -> Vec<u8> {
    let mut msg = Vec::with_capacity(SIGNATURE_DOMAIN.len() + 32);
    msg.extend_from_slice(SIGNATURE_DOMAIN);
    msg.extend_from_slice(id.as_bytes());
    msg
}

/// Computes the content id of `draft` authored by the signer, and signs it.
///
/// The id already commits to every canonical field, so the signature covers
/// the whole envelope except itself.
pub fn sign_draft(
    draft: &BundleDraft,
    signer: &(impl Signer + ?Sized),
) -> Result<(BundleId, Signature), CodecError> {
    let author = signer.public_key();
    let id = draft.fields(&author).content_id()?;
    let sig = signer.sign(&signature_message(&id))?;
    Ok((id, Signature(sig)))
}

/// Turns a draft into a signed, immutable bundle.
pub fn seal_bundle(
    draft: BundleDraft,
    signer: &(impl Signer + ?Sized),
) -> Result<Bundle, CodecError> {
    let (id, signature) = sign_draft(&draft, signer)?;
    Ok(Bundle {
        id,
        created_at: draft.created_at,
        expires_at: draft.expires_at,
        priority: draft.priority,
        audience: draft.audience,
        topic: draft.topic,
        tags: draft.tags,
        payload_type: draft.payload_type,
        payload: draft.payload,
        author: signer.public_key(),
        signature,
    })
}

/// Recomputes the content id and checks the author's signature.
pub fn verify_bundle(bundle: &Bundle, verifier: &(impl Verifier + ?Sized)) -> Result<(), CodecError> {
    let expected = bundle.compute_id()?;
    if expected != bundle.id {
        return Err(CodecError::IdMismatch);
    }
    let ok = verifier
        .verify(bundle.author, &signature_message(&bundle.id), bundle.signature.0)
        .map_err(|_| CodecError::SignatureInvalid)?;
    if !ok {
        return Err(CodecError::SignatureInvalid);
    }
    Ok(())
}

/// Boolean form of [`verify_bundle`].
pub fn is_valid(bundle: &Bundle, verifier: &(impl Verifier + ?Sized)) -> bool {
    verify_bundle(bundle, verifier).is_ok()
}
