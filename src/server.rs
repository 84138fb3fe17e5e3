//! Admin HTTP router.
//!
//! Served by long-running processes (the replication worker) for health
//! checks, Prometheus scraping and a small status document.  The blob
//! protocol front end lives elsewhere and drives [`crate::ops`] directly.

use axum::{
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::metrics::metrics_handler;
use crate::AppState;

/// Build the admin [`Router`].
pub fn admin_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status))
        .with_state(state)
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Stamp every response with a request id, `Date` and `Server`.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    let request_id = uuid::Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("x-ms-request-id", value);
    }
    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("blobshard"));

    response
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /status` -- shard accounts and replication queue depth.
async fn status(State(state): State<AppState>) -> Response {
    let depth = match state.queue.approximate_len().await {
        Ok(depth) => depth,
        Err(e) => {
            warn!("Replication queue unavailable: {}", e);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };
    let shards: Vec<&str> = state.shards.iter().map(|(_, s)| s.account()).collect();
    Json(serde_json::json!({
        "shards": shards,
        "namespace": state.directory.account(),
        "replication_queue_depth": depth,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestCluster;
    use axum::body::Body;
    use tower::ServiceExt;

    async fn get_path(app: Router, path: &str) -> Response {
        app.oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let cluster = TestCluster::new(2);
        let response = get_path(admin_app(cluster.state.clone()), "/healthz").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["server"], "blobshard");
        assert!(response.headers().contains_key("x-ms-request-id"));
        assert!(response.headers().contains_key("date"));
    }

    #[tokio::test]
    async fn test_status_reports_queue_depth() {
        let cluster = TestCluster::new(3);
        cluster.put_replicated("c", "foo", b"x").await;
        cluster.state.coordinator.flush().await;

        let response = get_path(admin_app(cluster.state.clone()), "/status").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["replication_queue_depth"], 2);
        assert_eq!(json["shards"], serde_json::json!(["shard0", "shard1", "shard2"]));
        assert_eq!(json["namespace"], "namespace");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let cluster = TestCluster::new(1);
        let response = get_path(admin_app(cluster.state.clone()), "/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
