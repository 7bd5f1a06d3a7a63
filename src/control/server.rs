use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use super::api::{self, AppState};
use super::db::{ControlDb, DbHandle};
use crate::config::Settings;

/// Configuration for the Mission Control server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub settings: Settings,
}

impl ServerConfig {
    pub fn from_settings(settings: Settings, dev_mode: bool) -> Self {
        Self {
            port: settings.port,
            db_path: settings.database_path.clone(),
            dev_mode,
            settings,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(Settings::default(), false)
    }
}

/// Build the full application router: API routes plus a JSON 404 fallback.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().fallback(not_found).with_state(state)
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "Route not found"})),
    )
}

/// Dev mode allows any origin; otherwise only the configured ones.
pub fn cors_layer(origins: &[String], dev_mode: bool) -> CorsLayer {
    if dev_mode {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Start the Mission Control server and block until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = ControlDb::new(&config.db_path).context("Failed to initialize database")?;
    let cors = cors_layer(&config.settings.cors_origins, config.dev_mode);
    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        settings: config.settings,
    });

    let app = build_router(state).layer(cors);

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, db = %config.db_path.display(), "Mission Control listening");
    println!("Mission Control running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a handler the server runs until killed.
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let state = Arc::new(AppState {
            db: DbHandle::new(ControlDb::new_in_memory().unwrap()),
            settings: Settings::default(),
        });
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router();
        let req = Request::builder().uri("/api/tasks").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let app = test_router();
        let req = Request::builder()
            .uri("/no/such/route")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Route not found");
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin_only() {
        let origins = vec!["http://localhost:5173".to_string()];
        let app = test_router().layer(cors_layer(&origins, false));

        let req = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:5173"
        );

        let req = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "http://evil.example")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[test]
    fn test_config_from_settings() {
        let settings = Settings {
            port: 9999,
            database_path: PathBuf::from("/tmp/mc.db"),
            ..Settings::default()
        };
        let config = ServerConfig::from_settings(settings, true);
        assert_eq!(config.port, 9999);
        assert_eq!(config.db_path, PathBuf::from("/tmp/mc.db"));
        assert!(config.dev_mode);
    }
}
