//! Webhook signatures and API-key hashing.
//!
//! Two distinct credential mechanisms live here:
//!
//! - [`WebhookSigner`]: HMAC-SHA256 over the request body (prefixed with the
//!   timestamp header when present) with constant-time verification. The
//!   signature header format is `sha256=<hex>`.
//! - [`ApiKeyHasher`]: salted SHA-256 of raw bearer keys. Only the salted
//!   hash is ever persisted; the raw key is shown once at creation.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Prefix on webhook signature headers.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Signs and verifies webhook payloads with a shared secret.
#[derive(Clone)]
pub struct WebhookSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for WebhookSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSigner")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl WebhookSigner {
    /// Creates a signer with the given shared secret.
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Computes the signature header value for a payload.
    ///
    /// When `timestamp` is present the signed message is
    /// `"{timestamp}.{body}"`, binding the signature to the timestamp so a
    /// captured request cannot be replayed outside the freshness window.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is empty.
    pub fn compute(&self, body: &[u8], timestamp: Option<&str>) -> Result<String> {
        let mut mac = self.mac()?;
        if let Some(ts) = timestamp {
            mac.update(ts.as_bytes());
            mac.update(b".");
        }
        mac.update(body);
        let digest = mac.finalize().into_bytes();
        Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(digest)))
    }

    /// Verifies a signature header against a payload in constant time.
    ///
    /// Accepts the `sha256=` prefix as optional on the provided header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureMismatch`] if the signature does not
    /// verify, or [`Error::InvalidInput`] if the header is malformed.
    pub fn verify(&self, body: &[u8], timestamp: Option<&str>, header: &str) -> Result<()> {
        let hex_part = header.strip_prefix(SIGNATURE_PREFIX).unwrap_or(header);
        let provided = hex::decode(hex_part)
            .map_err(|_| Error::InvalidInput("signature header is not valid hex".to_string()))?;

        let mut mac = self.mac()?;
        if let Some(ts) = timestamp {
            mac.update(ts.as_bytes());
            mac.update(b".");
        }
        mac.update(body);

        // Mac::verify_slice is a constant-time comparison.
        mac.verify_slice(&provided)
            .map_err(|_| Error::SignatureMismatch)
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| Error::Internal {
            message: "webhook secret must not be empty".to_string(),
        })
    }
}

/// Hex-encoded SHA-256 of arbitrary bytes.
///
/// Used for audit fields (e.g. recording which signature header a webhook
/// presented) where the original value should not be stored verbatim.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hashes raw API keys with a deployment-wide salt.
///
/// The stored value is `hex(sha256(raw_key || salt))`. Lookups recompute the
/// hash from the presented bearer token; raw keys never touch storage.
#[derive(Clone)]
pub struct ApiKeyHasher {
    salt: String,
}

impl std::fmt::Debug for ApiKeyHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyHasher")
            .field("salt", &"[REDACTED]")
            .finish()
    }
}

impl ApiKeyHasher {
    /// Creates a hasher with the given salt.
    #[must_use]
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Computes the storable hash of a raw key.
    #[must_use]
    pub fn hash(&self, raw_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(raw_key.as_bytes());
        hasher.update(self.salt.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Generates a new random raw key (url-safe, 32 bytes of entropy).
    ///
    /// The caller is responsible for showing this to the user exactly once
    /// and persisting only the [`hash`](Self::hash) of it.
    #[must_use]
    pub fn generate_raw_key() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        // Hex keeps the key copy-pasteable in headers and shell commands.
        format!("oxb_{}", hex::encode(bytes))
    }
}
