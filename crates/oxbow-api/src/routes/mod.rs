//! Request handlers, grouped by surface.

pub mod admin;
pub mod stream;
pub mod tasks;
pub mod webhooks;
