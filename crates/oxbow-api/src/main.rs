//! `oxbow-api` binary entrypoint.
//!
//! Loads configuration from environment variables and starts the HTTP
//! server with its embedded worker pool and outbox relay.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::Result;

use oxbow_api::config::Config;
use oxbow_api::server::Server;
use oxbow_core::observability::{init_logging, LogFormat};
use oxbow_flow::handler::HandlerRegistry;

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(choose_log_format(&config));

    // Handlers are registered by the deployment crate that embeds this
    // service; an empty registry fails every task terminally, which is the
    // honest behavior for an unwired binary.
    let registry = HandlerRegistry::new();
    if registry.is_empty() {
        tracing::warn!("no task handlers registered; tasks will fail terminally");
    }

    let server = Server::new(config, registry);
    server.serve().await?;
    Ok(())
}
