// bittle-server: collaborative line-based editing over WebSocket.

pub mod access;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod repo;
pub mod session;
pub mod store;
pub mod ws;

use std::sync::Arc;

use anyhow::Context;
use axum::{http::StatusCode, routing::get, Router};
use tracing::{info, warn};

use crate::auth::{Accounts, Mailer};
use crate::config::ServerConfig;
use crate::db::{
    migrations::run_migrations,
    pool::{check_pool_health, create_pg_pool},
};
use crate::repo::RepoRegistry;
use crate::session::ClientRegistry;
use crate::store::Store;
use crate::ws::AppState;

/// Postgres when a database URL is configured, otherwise the in-memory store.
pub async fn open_store(config: &ServerConfig) -> anyhow::Result<Store> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("BITTLE_DATABASE_URL is not set; using the in-memory store, data is lost on exit");
        return Ok(Store::memory());
    };

    let pool = create_pg_pool(database_url, config.pool.clone())
        .await
        .context("failed to initialize bittle PostgreSQL pool")?;
    check_pool_health(&pool).await?;
    run_migrations(&pool).await?;
    info!("postgres store ready");
    Ok(Store::Postgres(pool))
}

pub fn build_state(store: Store, config: ServerConfig, mailer: Arc<dyn Mailer>) -> AppState {
    let repos = RepoRegistry::new(
        store.clone(),
        ClientRegistry::default(),
        config.default_line_id.as_str(),
    );
    AppState { repos, accounts: Accounts::new(store, mailer), config: Arc::new(config) }
}

pub fn build_router(state: AppState) -> Router {
    Router::new().route("/healthz", get(healthz)).merge(ws::router(state))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}
