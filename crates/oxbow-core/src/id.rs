//! Strongly-typed identifiers for Oxbow entities.
//!
//! All identifiers are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Globally unique**: Random UUIDv4, no coordination required
//!
//! # Example
//!
//! ```rust
//! use oxbow_core::id::{RunId, TaskId};
//!
//! let task = TaskId::generate();
//! let run = RunId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: TaskId = run;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from a raw UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $label, " '{}': {}"), s, e),
                })
            }
        }
    };
}

uuid_id!(
    /// A unique identifier for a task.
    ///
    /// Tasks are the unit of work accepted over HTTP and webhooks, queued
    /// durably, and dispatched to handlers.
    TaskId,
    "task ID"
);

uuid_id!(
    /// A unique identifier for a single execution attempt of a task.
    RunId,
    "run ID"
);

uuid_id!(
    /// A unique identifier for an outbox entry (pending external side-effect).
    OutboxEntryId,
    "outbox entry ID"
);

uuid_id!(
    /// A unique identifier for an inbox entry (recorded inbound webhook).
    InboxEntryId,
    "inbox entry ID"
);

uuid_id!(
    /// A unique identifier for an API key record.
    ApiKeyId,
    "API key ID"
);

uuid_id!(
    /// An opaque lease token proving ownership of a task lock.
    ///
    /// Release and extension of a lease require the matching token; a
    /// mismatch means the lease expired and was re-acquired elsewhere.
    LeaseToken,
    "lease token"
);
