//! API key records and role-based access control.
//!
//! Raw keys are never stored; only the salted SHA-256 hash computed by
//! [`oxbow_core::ApiKeyHasher`] is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use oxbow_core::ApiKeyId;

/// Role attached to an API key. Higher roles subsume lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyRole {
    /// Read-only access to task status.
    Readonly,
    /// Submit and read tasks.
    Service,
    /// Full access including admin endpoints.
    Admin,
}

impl ApiKeyRole {
    const fn rank(self) -> u8 {
        match self {
            Self::Readonly => 0,
            Self::Service => 1,
            Self::Admin => 2,
        }
    }

    /// Returns true if this role satisfies the given requirement.
    #[must_use]
    pub const fn allows(self, required: Self) -> bool {
        self.rank() >= required.rank()
    }

    /// Returns the wire name of this role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Readonly => "readonly",
            Self::Service => "service",
            Self::Admin => "admin",
        }
    }
}

impl std::fmt::Display for ApiKeyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An API key record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Unique key identifier.
    pub id: ApiKeyId,
    /// Salted SHA-256 of the raw key. The raw key is never stored.
    #[serde(skip_serializing, default)]
    pub key_hash: String,
    /// Human-readable name.
    pub name: String,
    /// Access role.
    pub role: ApiKeyRole,
    /// Expiry, if the key is time-limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the key is accepted. Revocation flips this off.
    pub is_active: bool,
    /// When the key was created.
    pub created_at: DateTime<Utc>,
    /// Last time the key authenticated a request (updated opportunistically).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Creates a new active key record from a precomputed hash.
    #[must_use]
    pub fn new(
        key_hash: impl Into<String>,
        name: impl Into<String>,
        role: ApiKeyRole,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: ApiKeyId::generate(),
            key_hash: key_hash.into(),
            name: name.into(),
            role,
            expires_at,
            is_active: true,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    /// Returns true if the key is accepted at the given instant.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.is_none_or(|exp| exp > now)
    }
}
