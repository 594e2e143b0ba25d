//! HTTP surface for the Oxbow task orchestrator.
//!
//! This crate wires the dispatch engine behind an axum server: task
//! submission and status, webhook intake, SSE status streaming, Prometheus
//! metrics, health, and the admin surface (DLQ, API keys, circuits,
//! budgets). Request auth is API-key based with role checks; the engine
//! itself lives in `oxbow-flow`.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod server;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use server::{AppState, Server};
