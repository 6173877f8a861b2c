/* src/api.rs */

use crate::config::ApiConfig;
use crate::stats::{MeterRegistry, MeterSnapshot};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use fancy_log::{LogLevel, log};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpListener;

pub fn create_router(registry: Arc<MeterRegistry>) -> Router {
    Router::new()
        .route("/stats", get(get_stats))
        .with_state(registry)
}

async fn get_stats(State(registry): State<Arc<MeterRegistry>>) -> Json<BTreeMap<String, MeterSnapshot>> {
    Json(registry.snapshot())
}

/// Serves the stats API until the process exits.
pub async fn serve(config: &ApiConfig, registry: Arc<MeterRegistry>) -> std::io::Result<()> {
    let bind_addr = config.listen_addr();
    let listener = TcpListener::bind(&bind_addr).await?;
    log(
        LogLevel::Info,
        &format!("Stats API listening on http://{}/stats", bind_addr),
    );
    axum::serve(listener, create_router(registry)).await
}
