mod config;
mod db;
mod error;
mod handlers;
mod hub;
mod models;
mod state;

use axum::extract::MatchedPath;
use axum::http::{header, header::HeaderName, Method, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Duration as ChronoDuration;
use config::{Config, StoreBackend};
use hub::Hub;
use relay_core::broadcast::ScopedBroadcaster;
use relay_core::envelope::EnvelopeLimits;
use relay_core::presence::PresenceTracker;
use relay_core::session::{SessionConfig, SessionIssuer};
use relay_core::store::memory::MemoryStore;
use relay_core::store::RelayStore;
use serde_json::json;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let store: Arc<dyn RelayStore> = match cfg.store_backend {
        StoreBackend::Memory => {
            tracing::warn!(env = %cfg.env_name, "using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Postgres => {
            let pool = match db::connect(&cfg.db_url, cfg.store_timeout).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = %e, "db connect failed");
                    std::process::exit(2);
                }
            };
            if let Err(e) = db::ensure_schema(&pool, &cfg.db_schema).await {
                tracing::error!(error = %e, "db ensure_schema failed");
                std::process::exit(2);
            }
            Arc::new(db::PgStore::new(
                pool,
                cfg.db_schema.clone(),
                cfg.store_timeout,
            ))
        }
    };

    let mut session_cfg = SessionConfig::new(cfg.jwt_secret.clone());
    session_cfg.access_ttl = ChronoDuration::seconds(cfg.access_ttl_secs);
    session_cfg.refresh_ttl = ChronoDuration::seconds(cfg.refresh_ttl_secs);
    session_cfg.rotate_refresh = cfg.rotate_refresh;

    let (presence_tx, presence_rx) = mpsc::unbounded_channel();
    let tracker = Arc::new(PresenceTracker::with_notifier(presence_tx));
    let hub = Arc::new(Hub::new(cfg.event_buffer));
    let broadcaster = ScopedBroadcaster::new(store.clone(), hub.clone());
    tokio::spawn(broadcaster.run(presence_rx));

    let state = AppState {
        store,
        sessions: Arc::new(SessionIssuer::new(session_cfg)),
        tracker,
        hub,
        env_name: cfg.env_name.clone(),
        internal_secret: cfg.internal_secret.clone(),
        limits: EnvelopeLimits {
            max_ciphertext_bytes: cfg.max_ciphertext_bytes,
            max_recipients: cfg.max_recipients,
        },
    };

    let cors = if cfg.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(relay_cors_allowed_headers())
            .allow_credentials(false)
    } else {
        let origins: Vec<axum::http::HeaderValue> = cfg
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(relay_cors_allowed_headers())
            .allow_credentials(false)
            .allow_origin(AllowOrigin::list(origins))
    };

    let request_id = HeaderName::from_static("x-request-id");
    let app = api_routes()
        .fallback(|| async {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "detail": "not found" })),
            )
        })
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(cfg.max_body_bytes))
        .layer(cors)
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        // Log the matched route template only; access tokens may ride in the
        // query string of /events.
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(MatchedPath::as_str)
                    .unwrap_or_else(|| req.uri().path());
                let request_id = req
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                tracing::span!(
                    tracing::Level::INFO,
                    "http_request",
                    method = %req.method(),
                    path = %path,
                    request_id = %request_id
                )
            }),
        )
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid));

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));
    tracing::info!(%addr, env = %cfg.env_name, "starting relay_service");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, %addr, "bind failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

pub(crate) fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions/issue", post(handlers::issue_session))
        .route("/sessions/refresh", post(handlers::refresh_session))
        .route("/sessions/logout", post(handlers::logout))
        .route("/me", get(handlers::me))
        .route("/groups/:group_id/keys", post(handlers::register_key))
        .route("/groups/:group_id/keys/revoke", post(handlers::revoke_key))
        .route(
            "/groups/:group_id/keys/reenroll",
            post(handlers::reenroll_key),
        )
        .route("/groups/:group_id/presence", get(handlers::group_presence))
        .route(
            "/conversations/:conversation_id/messages",
            post(handlers::send_message).get(handlers::history),
        )
        .route(
            "/conversations/:conversation_id/read",
            post(handlers::mark_read),
        )
        .route(
            "/conversations/:conversation_id/readers",
            get(handlers::readers),
        )
        .route("/messages/:message_id", delete(handlers::delete_message))
        .route("/events", get(handlers::events))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

fn relay_cors_allowed_headers() -> Vec<HeaderName> {
    vec![
        header::ACCEPT,
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        HeaderName::from_static("x-request-id"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_cors_whitelist_excludes_internal_and_proxy_headers() {
        let headers = relay_cors_allowed_headers();
        let has = |name: &str| {
            headers
                .iter()
                .any(|h| h.as_str().eq_ignore_ascii_case(name))
        };

        assert!(has("authorization"));
        assert!(has("content-type"));
        assert!(has("x-request-id"));

        assert!(!has("x-internal-secret"));
        assert!(!has("x-forwarded-for"));
        assert!(!has("x-real-ip"));
        assert!(!has("cookie"));
    }
}
