pub mod appresult;
pub mod auth;
pub mod client;
pub mod config;
pub mod conversations;
pub mod fanout;
pub mod model;
pub mod presence;
pub mod profiles;
pub mod protocol;
pub mod session;
pub mod store;
pub mod sync;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::FromRef,
    http::{
        Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::get,
};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};

pub use appresult::{AppError, AppResult};

use crate::{
    auth::TokenAuthority,
    config::Config,
    presence::Presence,
    store::{SqliteStore, StorageError},
    sync::SyncService,
};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub sync: SyncService,
    pub tokens: TokenAuthority,
}

impl AppState {
    pub fn new(store: SqliteStore, tokens: TokenAuthority, connection_buffer: usize) -> Self {
        Self {
            db_pool: store.pool().clone(),
            sync: SyncService::new(Arc::new(store), Presence::new(connection_buffer)),
            tokens,
        }
    }

    /// Opens and migrates the database named in `config`.
    pub async fn from_config(config: &Config) -> Result<Self, StorageError> {
        let db_pool = store::connect(&config.database_url, config.max_db_connections).await?;
        let store = SqliteStore::new(db_pool, config.display_offset);
        store.migrate().await?;

        Ok(Self::new(
            store,
            TokenAuthority::new(&config.auth_secret),
            config.connection_buffer,
        ))
    }
}

pub fn app(state: AppState, config: &Config) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(
            config.session_inactivity_minutes,
        )));

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(config.cors_origins.clone()))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(conversations::conversations_ws))
        .merge(auth::router())
        .nest("/conversations", conversations::router())
        .nest("/profiles", profiles::router())
        .with_state(state)
        .layer(session_layer)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> AppResult<Json<Value>> {
    Ok(Json(json!({
        "status": "ok",
        "time": OffsetDateTime::now_utc().format(&Rfc3339)?,
    })))
}
