//! multikv: a Redis-compatible key-value cache server
//!
//! Clients speak RESP2 over TCP. Keys live in one of several storage
//! engines selected at startup:
//! - In-process memory
//! - PostgreSQL / CockroachDB
//! - SQLite
//! - Pass-through to another Redis-compatible server
//!
//! Features:
//! - String keys with get, set, delete, expiry and pattern enumeration
//! - Optional per-tenant authentication with isolated key namespaces
//! - Periodic sweep of expired keys
//! - Optional TLS for client connections
//! - Configuration via CLI arguments or TOML file

mod auth;
mod config;
mod dispatcher;
mod protocols;
mod server;
mod session;
mod storage;
mod tls;

use auth::{CredentialService, CredentialSource, PostgresCredentialSource, StorageCredentialSource};
use config::{AuthSource, Config};
use dispatcher::Dispatcher;
use server::Server;
use std::sync::Arc;
use std::time::Duration;
use storage::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.server.listen,
        storage = ?config.storage.mode,
        auth = config.auth.enabled,
        workers = ?config.server.workers,
        "Starting multikv server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.server.workers {
        builder.worker_threads(workers.max(1));
    }

    builder.build()?.block_on(run(config))
}

/// Open storage and credentials, then serve until shutdown.
async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let acceptor = match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert), Some(key)) => Some(tls::acceptor(cert, key)?),
        _ => None,
    };

    let storage = storage::open(&config.storage).await?;

    let credentials = if config.auth.enabled {
        Some(Arc::new(credential_service(&config, Arc::clone(&storage))?))
    } else {
        None
    };

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&storage), credentials));
    let mut server = Server::new(&config, storage, dispatcher);
    if let Some(acceptor) = acceptor {
        server = server.with_tls(acceptor);
    }
    server.run().await
}

fn credential_service(
    config: &Config,
    storage: Arc<dyn Storage>,
) -> Result<CredentialService, Box<dyn std::error::Error>> {
    let source: Arc<dyn CredentialSource> = match &config.auth.source {
        AuthSource::Storage => Arc::new(StorageCredentialSource::new(storage)),
        AuthSource::Postgres(dsn) => {
            Arc::new(PostgresCredentialSource::new(dsn, config.storage.pool_size)?)
        }
    };

    info!(policy = ?config.auth.policy, "Authentication enabled");

    Ok(CredentialService::new(
        source,
        config.auth.policy,
        Duration::from_secs(config.auth.cache_ttl),
    )?)
}
