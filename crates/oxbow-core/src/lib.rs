//! Core types and utilities shared across the Oxbow task orchestrator.
//!
//! This crate is the leaf of the workspace dependency graph. It provides:
//!
//! - Strongly-typed identifiers ([`id`])
//! - The shared error type ([`error`])
//! - HMAC webhook signatures and API-key hashing ([`signature`])
//! - Logging initialization and span helpers ([`observability`])

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod error;
pub mod id;
pub mod observability;
pub mod signature;

pub use error::{Error, Result};
pub use id::{ApiKeyId, InboxEntryId, LeaseToken, OutboxEntryId, RunId, TaskId};
pub use signature::{ApiKeyHasher, WebhookSigner};
