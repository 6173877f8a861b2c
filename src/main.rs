/* src/main.rs */

mod api;
mod config;
mod dns_server;
mod error;
mod materializer;
mod models;
mod resolver;
mod stats;
mod storage;
mod transfer;
mod tsig;
mod ttl;

use crate::config::AppConfig;
use crate::dns_server::QueryHandler;
use crate::resolver::DnsResolver;
use crate::stats::MeterRegistry;
use crate::storage::SqlStorage;
use crate::tsig::{Authenticator, TsigKey};
use dotenvy::dotenv;
use fancy_log::{LogLevel, log, set_log_level};
use lazy_motd::lazy_motd;
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // --- Initialization ---
    dotenv().ok();
    let level = env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase();
    let log_level = match level.as_str() {
        "debug" => LogLevel::Debug,
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    };
    set_log_level(log_level);
    lazy_motd!();

    // --- Load Config ---
    let config = match AppConfig::load_or_create_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            log(LogLevel::Error, &format!("Failed to load config: {}", e));
            return Err(e.into());
        }
    };
    set_log_level(config.log_level());

    // --- Initialize Services ---
    let storage = match SqlStorage::connect(&config.storage).await {
        Ok(storage) => storage,
        Err(e) => {
            log(LogLevel::Error, &format!("Failed to open storage: {}", e));
            return Err(e.into());
        }
    };
    storage.check().await?;

    let auth = if config.nameserver.secret.is_empty() {
        None
    } else {
        let key = TsigKey::parse(&config.nameserver.secret)?;
        log(
            LogLevel::Info,
            &format!("Verifying signed requests with TSIG key {}", key.name()),
        );
        Some(Authenticator::new(&key)?)
    };

    let registry = Arc::new(MeterRegistry::with_query_meters());
    let resolver = Arc::new(DnsResolver::new(Arc::new(storage)));
    let nameserver = Arc::new(config.nameserver.clone());
    let handler = Arc::new(QueryHandler::new(
        resolver,
        registry.clone(),
        nameserver.clone(),
        auth,
    ));

    if config.api.enabled {
        let api_config = config.api.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(&api_config, registry).await {
                log(LogLevel::Error, &format!("Stats API stopped: {}", e));
            }
        });
    }

    // --- Start DNS Server ---
    log(
        LogLevel::Info,
        &format!("rowdns starting on {}", nameserver.listen_addr()),
    );

    tokio::select! {
        result = dns_server::run_server(nameserver, handler) => result?,
        _ = shutdown_signal() => {
            log(LogLevel::Info, "Shutdown signal received, stopping");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log(LogLevel::Warn, &format!("Failed to listen for Ctrl-C: {}", e));
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log(LogLevel::Warn, &format!("Failed to listen for SIGTERM: {}", e));
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
