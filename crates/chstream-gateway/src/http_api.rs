//! HTTP surface: the streaming `/query` route plus health endpoints

use crate::connection::ConnectionDescriptor;
use crate::emitter;
use crate::engine::Engine;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chstream_common::{EngineDefaults, StreamSettings};
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, Instrument};
use uuid::Uuid;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn Engine>,
    pub defaults: Arc<EngineDefaults>,
    pub stream: StreamSettings,
}

/// Query-string parameters of `/query`
#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub query: String,
    pub url: Option<String>,
    pub compression: Option<String>,
    pub database: Option<String>,
}

/// Build the gateway router
pub fn router(state: AppState) -> Router {
    // Browsers read the feed through EventSource from any origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", get(stream_query))
        .route("/health", get(health))
        .route("/", get(root))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run a query and stream its progress and result as Server-Sent Events
pub async fn stream_query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Response {
    let request_id = Uuid::new_v4();
    let descriptor = ConnectionDescriptor::resolve(
        params.url.as_deref(),
        params.compression.as_deref(),
        params.database.as_deref(),
        &state.defaults,
    );
    info!(
        request_id = %request_id,
        host = %descriptor.host,
        port = descriptor.port,
        "Streaming query: {}",
        params.query
    );

    let (tx, rx) = mpsc::channel(state.stream.event_buffer);
    let engine = state.engine.clone();
    let span = tracing::info_span!("query_stream", request_id = %request_id);
    tokio::spawn(
        async move {
            let outcome = emitter::run(engine.as_ref(), &descriptor, &params.query, tx).await;
            info!(events = outcome.events(), outcome = ?outcome, "Stream finished");
        }
        .instrument(span),
    );

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

/// Root endpoint
pub async fn root() -> &'static str {
    concat!("ChStream Gateway ", env!("CARGO_PKG_VERSION"), " - GET /query?query=<SQL>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{ScriptedEngine, Step};
    use crate::types::{Cell, Column, ResultSet};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(engine: ScriptedEngine) -> Router {
        router(AppState {
            engine: Arc::new(engine),
            defaults: Arc::new(EngineDefaults::default()),
            stream: StreamSettings::default(),
        })
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_query_route_streams_events() {
        let result = ResultSet {
            rows: vec![vec![Cell::UInt(1)]],
            columns: vec![Column::new("1", "UInt8")],
        };
        let engine = ScriptedEngine::new(vec![Step::Progress(1, 8, 1)], result);
        let calls = engine.calls.clone();

        let response = app(engine)
            .oneshot(
                Request::builder()
                    .uri("/query?query=SELECT%201&url=ch://example.com:1234&compression=0&database=web")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let text = body_text(response).await;
        assert!(text.starts_with("retry: 10000\nid: 0\nevent: progress\n"));
        assert!(text.contains("id: 1\nevent: result\n"));
        assert!(text.ends_with("\n\n"));

        let descriptor = calls.last_descriptor.lock().unwrap().clone().unwrap();
        assert_eq!(descriptor.host, "example.com");
        assert_eq!(descriptor.port, 1234);
        assert!(!descriptor.compression);
        assert_eq!(descriptor.database, "web");
        assert_eq!(calls.last_sql.lock().unwrap().as_deref(), Some("SELECT 1"));
        assert_eq!(calls.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_engine_error_is_in_band() {
        let engine = ScriptedEngine::rejecting(60, "Table not found");
        let response = app(engine)
            .oneshot(
                Request::builder()
                    .uri("/query?query=SELECT%20*%20FROM%20nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.starts_with("retry: 10000\nid: 0\nevent: result\n"));
        assert!(text.contains(r#""error":{"code":60,"message":"Table not found"}"#));
    }

    #[tokio::test]
    async fn test_missing_query_is_rejected() {
        let response = app(ScriptedEngine::default())
            .oneshot(Request::builder().uri("/query").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health() {
        let response = app(ScriptedEngine::default())
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(body_text(response).await, "OK");
    }

    #[tokio::test]
    async fn test_preflight_allows_any_origin() {
        let response = app(ScriptedEngine::default())
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/query")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
