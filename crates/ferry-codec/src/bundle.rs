use std::time::Duration;

use ferry_core::hash::blake3_32_domain;
use ferry_core::{BundleId, Priority, PublicKey, Timestamp};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::{ByteBuf, Bytes};

use crate::error::CodecError;

/// Envelope schema version for `Bundle` v1.
pub const BUNDLE_V1_VERSION: u16 = 1;
/// Domain separator mixed into the content hash.
pub const BUNDLE_ID_DOMAIN: &[u8] = b"ferry/bundle-id/v1";
/// Largest accepted opaque payload.
pub const MAX_PAYLOAD_LEN: usize = 256 * 1024;
/// Largest accepted tag list.
pub const MAX_TAGS: usize = 32;
/// Largest accepted routing string (`audience`, `topic`, a tag, `payload_type`).
pub const MAX_FIELD_LEN: usize = 256;

/// 64-byte signature wrapper for serde byte encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = ByteBuf::deserialize(deserializer)?;
        if raw.len() != 64 {
            return Err(serde::de::Error::invalid_length(
                raw.len(),
                &"exactly 64 bytes",
            ));
        }

        let mut bytes = [0_u8; 64];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

/// Unsigned bundle content, before the author key, id and signature exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleDraft {
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub priority: Priority,
    pub audience: String,
    pub topic: String,
    pub tags: Vec<String>,
    pub payload_type: String,
    pub payload: Vec<u8>,
}

impl BundleDraft {
    /// Builds a draft expiring `ttl` after `created_at`.
    pub fn new(
        payload_type: impl Into<String>,
        payload: Vec<u8>,
        priority: Priority,
        created_at: Timestamp,
        ttl: Duration,
    ) -> Self {
        Self {
            created_at,
            expires_at: created_at.saturating_add(ttl),
            priority,
            audience: String::new(),
            topic: String::new(),
            tags: Vec::new(),
            payload_type: payload_type.into(),
            payload,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn fields<'a>(&'a self, author: &'a PublicKey) -> CanonicalFields<'a> {
        CanonicalFields {
            created_at: self.created_at,
            expires_at: self.expires_at,
            priority: self.priority,
            audience: &self.audience,
            topic: &self.topic,
            tags: &self.tags,
            payload_type: &self.payload_type,
            payload: &self.payload,
            author,
        }
    }
}

/// Signed, content-addressed bundle. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub id: BundleId,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub priority: Priority,
    pub audience: String,
    pub topic: String,
    pub tags: Vec<String>,
    pub payload_type: String,
    pub payload: Vec<u8>,
    pub author: PublicKey,
    pub signature: Signature,
}

/// Borrowed view of every hashed field, in canonical order.
pub(crate) struct CanonicalFields<'a> {
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub priority: Priority,
    pub audience: &'a str,
    pub topic: &'a str,
    pub tags: &'a [String],
    pub payload_type: &'a str,
    pub payload: &'a [u8],
    pub author: &'a PublicKey,
}

/// CBOR array layout hashed for identity:
/// `[version, created_at, expires_at, priority, audience, topic, tags,
///   payload_type, payload(bstr), author(bstr)]`.
#[derive(Serialize)]
struct CanonicalEnvelopeV1<'a>(
    u16,
    u64,
    u64,
    &'static str,
    &'a str,
    &'a str,
    &'a [String],
    &'a str,
    &'a Bytes,
    &'a Bytes,
);

impl CanonicalFields<'_> {
    fn validate(&self) -> Result<(), CodecError> {
        if self.expires_at <= self.created_at {
            return Err(CodecError::InvalidBundle(
                "expires_at must be after created_at",
            ));
        }
        if self.payload_type.trim().is_empty() {
            return Err(CodecError::InvalidBundle("payload_type must not be empty"));
        }
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::InvalidBundle("payload exceeds size limit"));
        }
        if self.tags.len() > MAX_TAGS {
            return Err(CodecError::InvalidBundle("too many tags"));
        }
        let too_long = [self.audience, self.topic, self.payload_type]
            .into_iter()
            .chain(self.tags.iter().map(String::as_str))
            .any(|s| s.len() > MAX_FIELD_LEN);
        if too_long {
            return Err(CodecError::InvalidBundle("routing field exceeds length limit"));
        }
        Ok(())
    }

    fn canonical_cbor(&self) -> Result<Vec<u8>, CodecError> {
        self.validate()?;
        let envelope = CanonicalEnvelopeV1(
            BUNDLE_V1_VERSION,
            self.created_at.as_secs(),
            self.expires_at.as_secs(),
            self.priority.as_str(),
            self.audience,
            self.topic,
            self.tags,
            self.payload_type,
            Bytes::new(self.payload),
            Bytes::new(self.author),
        );
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&envelope, &mut bytes)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    pub(crate) fn content_id(&self) -> Result<BundleId, CodecError> {
        let canonical = self.canonical_cbor()?;
        Ok(BundleId(blake3_32_domain(BUNDLE_ID_DOMAIN, &canonical)))
    }
}

impl Bundle {
    pub(crate) fn fields(&self) -> CanonicalFields<'_> {
        CanonicalFields {
            created_at: self.created_at,
            expires_at: self.expires_at,
            priority: self.priority,
            audience: &self.audience,
            topic: &self.topic,
            tags: &self.tags,
            payload_type: &self.payload_type,
            payload: &self.payload,
            author: &self.author,
        }
    }

    /// Canonical bytes covered by the content hash.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError> {
        self.fields().canonical_cbor()
    }

    /// Recomputes the content hash from the current field values.
    pub fn compute_id(&self) -> Result<BundleId, CodecError> {
        self.fields().content_id()
    }

    /// Schema checks that need no cryptography.
    pub fn validate(&self) -> Result<(), CodecError> {
        self.fields().validate()
    }

    /// True once `now` has reached `expires_at`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at < now
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireBundleV1 {
    version: u16,
    bundle_id: String,
    created_at: Timestamp,
    expires_at: Timestamp,
    priority: Priority,
    audience: String,
    topic: String,
    tags: Vec<String>,
    payload_type: String,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    #[serde(with = "serde_bytes")]
    author: Vec<u8>,
    signature: Signature,
}

/// Encodes a bundle as its CBOR wire envelope.
pub fn encode_bundle_cbor(bundle: &Bundle) -> Result<Vec<u8>, CodecError> {
    bundle.validate()?;
    let wire = WireBundleV1 {
        version: BUNDLE_V1_VERSION,
        bundle_id: bundle.id.to_hex(),
        created_at: bundle.created_at,
        expires_at: bundle.expires_at,
        priority: bundle.priority,
        audience: bundle.audience.clone(),
        topic: bundle.topic.clone(),
        tags: bundle.tags.clone(),
        payload_type: bundle.payload_type.clone(),
        payload: bundle.payload.clone(),
        author: bundle.author.to_vec(),
        signature: bundle.signature,
    };
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(&wire, &mut bytes).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decodes and schema-validates a CBOR wire envelope.
///
/// Does not check the id or signature; see [`crate::seal::verify_bundle`].
pub fn decode_bundle_cbor(bytes: &[u8]) -> Result<Bundle, CodecError> {
    let wire: WireBundleV1 = ciborium::de::from_reader(bytes)
        .map_err(|e| CodecError::CorruptEnvelope(e.to_string()))?;
    if wire.version != BUNDLE_V1_VERSION {
        return Err(CodecError::InvalidBundle("unsupported envelope version"));
    }
    let id = BundleId::from_hex(&wire.bundle_id)
        .map_err(|_| CodecError::InvalidBundle("bundle_id is not 64 hex chars"))?;
    let author: PublicKey = wire
        .author
        .as_slice()
        .try_into()
        .map_err(|_| CodecError::InvalidBundle("author must be 32 bytes"))?;
    let bundle = Bundle {
        id,
        created_at: wire.created_at,
        expires_at: wire.expires_at,
        priority: wire.priority,
        audience: wire.audience,
        topic: wire.topic,
        tags: wire.tags,
        payload_type: wire.payload_type,
        payload: wire.payload,
        author,
        signature: wire.signature,
    };
    bundle.validate()?;
    Ok(bundle)
}
