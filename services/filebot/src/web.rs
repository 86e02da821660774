use crate::config::ApiConfig;
use crate::error::LookupError;
use crate::metadata_store::{FileRecord, MetadataStore};
use crate::object_gateway::ObjectStorageGateway;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MetadataStore>,
    pub gateway: Arc<dyn ObjectStorageGateway>,
    pub download_url_expiry: Duration,
}

/// Public URLs of the web surface, derived from the configured domain
#[derive(Debug, Clone)]
pub struct PublicLinks {
    base_url: String,
}

impl PublicLinks {
    /// `None` when no public domain is configured
    pub fn from_config(config: &ApiConfig) -> Option<Self> {
        let domain = config.public_domain.as_deref()?.trim().trim_end_matches('/');
        if domain.is_empty() {
            return None;
        }

        let base_url = if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("https://{}", domain)
        };
        Some(Self { base_url })
    }

    pub fn home(&self) -> &str {
        &self.base_url
    }

    pub fn stream(&self, file_id: Uuid) -> String {
        format!("{}/stream/{}", self.base_url, file_id)
    }

    pub fn player(&self, file_id: Uuid) -> String {
        format!("{}/player/{}", self.base_url, file_id)
    }
}

/// Look up a file and presign a download URL for it
pub async fn download_link(
    store: &dyn MetadataStore,
    gateway: &dyn ObjectStorageGateway,
    file_id: Uuid,
    expiry: Duration,
) -> Result<(FileRecord, String), LookupError> {
    let record = store
        .get_file(file_id)
        .await?
        .ok_or(LookupError::NotFound(file_id))?;

    let url = gateway
        .presigned_url(&record.storage_key, expiry)
        .await
        .ok_or(LookupError::UrlUnavailable(file_id))?;

    Ok((record, url))
}

/// Look up a file and build its external player link
pub async fn player_link(
    store: &dyn MetadataStore,
    gateway: &dyn ObjectStorageGateway,
    file_id: Uuid,
) -> Result<(FileRecord, String), LookupError> {
    let record = store
        .get_file(file_id)
        .await?
        .ok_or(LookupError::NotFound(file_id))?;

    let url = gateway
        .external_player_url(&record.storage_key, &record.original_name)
        .await
        .ok_or(LookupError::UrlUnavailable(file_id))?;

    Ok((record, url))
}

/// Player endpoint response
#[derive(Debug, Serialize)]
pub struct PlayerResponse {
    pub file_id: Uuid,
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    /// Direct presigned URL
    pub stream_url: String,
    /// When `stream_url` stops working
    pub expires_at: DateTime<Utc>,
    /// MX Player intent link
    pub player_url: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "File not found".to_string(),
            code: "NOT_FOUND".to_string(),
        }),
    )
}

impl From<LookupError> for ApiError {
    fn from(e: LookupError) -> Self {
        match e {
            LookupError::NotFound(_) => not_found(),
            LookupError::UrlUnavailable(file_id) => {
                warn!(file_id = %file_id, "Failed to generate presigned URL");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(ErrorResponse {
                        error: "Failed to generate URL".to_string(),
                        code: "PRESIGN_ERROR".to_string(),
                    }),
                )
            }
            LookupError::Store(e) => {
                error!(error = ?e, "Failed to get file");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: "Failed to get file".to_string(),
                        code: "QUERY_ERROR".to_string(),
                    }),
                )
            }
        }
    }
}

/// Unparsable ids are reported the same way as unknown ones
fn parse_file_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| not_found())
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stream/:file_id", get(stream_file))
        .route("/player/:file_id", get(player))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "filebot",
        "endpoints": ["/stream/{file_id}", "/player/{file_id}", "/health", "/ready"]
    }))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "filebot"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let (store, storage) = tokio::join!(state.store.health(), state.gateway.health());
    let connected = |check: &Result<()>| {
        if check.is_ok() {
            "connected"
        } else {
            "disconnected"
        }
    };
    let mut body = serde_json::json!({
        "status": "ready",
        "metadata_store": connected(&store),
        "object_storage": connected(&storage),
    });

    match store.and(storage) {
        Ok(()) => (StatusCode::OK, Json(body)),
        Err(e) => {
            body["status"] = "not_ready".into();
            body["error"] = e.to_string().into();
            (StatusCode::SERVICE_UNAVAILABLE, Json(body))
        }
    }
}

/// Redirect to a short-lived presigned URL for the file
#[instrument(skip(state))]
async fn stream_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Response, ApiError> {
    let file_id = parse_file_id(&file_id)?;
    let (_, url) = download_link(
        state.store.as_ref(),
        state.gateway.as_ref(),
        file_id,
        state.download_url_expiry,
    )
    .await?;

    metrics::counter!("filebot.links.served", "kind" => "stream").increment(1);
    Ok(Redirect::temporary(&url).into_response())
}

/// Stream URL plus external player link for the file
#[instrument(skip(state))]
async fn player(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Json<PlayerResponse>, ApiError> {
    let file_id = parse_file_id(&file_id)?;
    let (record, stream_url) = download_link(
        state.store.as_ref(),
        state.gateway.as_ref(),
        file_id,
        state.download_url_expiry,
    )
    .await?;

    let player_url = state
        .gateway
        .external_player_url(&record.storage_key, &record.original_name)
        .await
        .ok_or(LookupError::UrlUnavailable(file_id))?;

    let expires_at = Utc::now()
        + chrono::Duration::from_std(state.download_url_expiry).unwrap_or(chrono::Duration::zero());

    metrics::counter!("filebot.links.served", "kind" => "player").increment(1);
    Ok(Json(PlayerResponse {
        file_id,
        file_name: record.original_name,
        size_bytes: record.size_bytes,
        mime_type: record.mime_type,
        stream_url,
        expires_at,
        player_url,
    }))
}

/// Start the web API server; returns when `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting web API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_store::tests::sample_record;
    use crate::metadata_store::{InMemoryMetadataStore, MockMetadataStore};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use tower::ServiceExt;

    #[derive(Default)]
    struct StaticGateway {
        unreachable: bool,
    }

    #[async_trait]
    impl ObjectStorageGateway for StaticGateway {
        async fn upload(
            &self,
            _: &std::path::Path,
            _: &str,
            _: &(dyn Fn(u64) + Send + Sync),
        ) -> bool {
            true
        }

        async fn presigned_url(&self, key: &str, expiry: Duration) -> Option<String> {
            Some(format!(
                "https://bucket.example.com/{}?expires={}",
                key,
                expiry.as_secs()
            ))
        }

        async fn delete(&self, _: &str) -> bool {
            true
        }

        async fn health(&self) -> anyhow::Result<()> {
            if self.unreachable {
                anyhow::bail!("bucket unreachable");
            }
            Ok(())
        }
    }

    async fn router_with(record: Option<FileRecord>) -> Router {
        let store = InMemoryMetadataStore::new();
        if let Some(record) = record {
            store.save_file(&record).await.unwrap();
        }
        let state = AppState {
            store: Arc::new(store),
            gateway: Arc::new(StaticGateway::default()),
            download_url_expiry: Duration::from_secs(3600),
        };
        create_router(state, &ApiConfig::default())
    }

    async fn get(router: Router, uri: &str) -> Response {
        router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_stream_redirects_to_presigned_url() {
        let record = sample_record(1, "clip.mp4");
        let uri = format!("/stream/{}", record.file_id);
        let expected = format!(
            "https://bucket.example.com/{}?expires=3600",
            record.storage_key
        );
        let router = router_with(Some(record)).await;

        let response = get(router, &uri).await;

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], expected.as_str());
    }

    #[tokio::test]
    async fn test_player_returns_both_urls() {
        let record = sample_record(1, "clip.mp4");
        let uri = format!("/player/{}", record.file_id);
        let router = router_with(Some(record.clone())).await;

        let response = get(router, &uri).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["file_name"], "clip.mp4");
        assert!(body["stream_url"]
            .as_str()
            .unwrap()
            .ends_with("?expires=3600"));
        let player_url = body["player_url"].as_str().unwrap();
        assert!(player_url.starts_with("intent://bucket.example.com/"));
        assert!(player_url.contains("expires=86400"));
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_found() {
        for uri in [
            format!("/stream/{}", Uuid::new_v4()),
            format!("/player/{}", Uuid::new_v4()),
            "/stream/not-a-uuid".to_string(),
        ] {
            let response = get(router_with(None).await, &uri).await;

            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(json_body(response).await["error"], "File not found");
        }
    }

    #[tokio::test]
    async fn test_readiness_reports_store_failure() {
        let mut store = MockMetadataStore::new();
        store
            .expect_health()
            .returning(|| Err(anyhow::anyhow!("connection refused")));
        let state = AppState {
            store: Arc::new(store),
            gateway: Arc::new(StaticGateway::default()),
            download_url_expiry: Duration::from_secs(3600),
        };

        let response = get(create_router(state, &ApiConfig::default()), "/ready").await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["status"], "not_ready");
        assert_eq!(body["metadata_store"], "disconnected");
        assert_eq!(body["object_storage"], "connected");
    }

    #[tokio::test]
    async fn test_readiness_reports_storage_failure() {
        let state = AppState {
            store: Arc::new(InMemoryMetadataStore::new()),
            gateway: Arc::new(StaticGateway { unreachable: true }),
            download_url_expiry: Duration::from_secs(3600),
        };

        let response = get(create_router(state, &ApiConfig::default()), "/ready").await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["metadata_store"], "connected");
        assert_eq!(body["object_storage"], "disconnected");
        assert_eq!(body["error"], "bucket unreachable");
    }

    #[tokio::test]
    async fn test_readiness_when_both_reachable() {
        let response = get(router_with(None).await, "/ready").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ready");
    }

    #[tokio::test]
    async fn test_health() {
        let response = get(router_with(None).await, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_public_links() {
        let mut config = ApiConfig::default();
        assert!(PublicLinks::from_config(&config).is_none());

        config.public_domain = Some("mybot.example.com/".to_string());
        let links = PublicLinks::from_config(&config).unwrap();
        let file_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();

        assert_eq!(links.home(), "https://mybot.example.com");
        assert_eq!(
            links.stream(file_id),
            "https://mybot.example.com/stream/550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(
            links.player(file_id),
            "https://mybot.example.com/player/550e8400-e29b-41d4-a716-446655440000"
        );
    }
}
