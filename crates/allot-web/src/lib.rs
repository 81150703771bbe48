//! Thin JSON mount point for the resolution engine. The full REST product
//! (auth, uploads, notifications) lives in the surrounding system; this
//! router only exposes the polling surface the engine needs to be useful.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::warn;
use uuid::Uuid;

use allot_engine::{ResolveError, Resolver};

pub const CRATE_NAME: &str = "allot-web";

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<Resolver>,
}

impl AppState {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self { resolver }
    }
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    tax_ids: Vec<String>,
    #[serde(default)]
    client_ref: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/ipos/{ipo_id}/allotment", post(resolve_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(ipo_id): AxumPath<Uuid>,
    Json(request): Json<ResolveRequest>,
) -> Response {
    match state
        .resolver
        .resolve(ipo_id, &request.tax_ids, request.client_ref.as_deref())
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(err @ ResolveError::IpoNotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => {
            warn!(%ipo_id, error = %err, "resolve request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use allot_core::IpoRecord;
    use allot_store::memory::{MemoryIpoDirectory, MemoryJobQueue, MemoryResultStore};
    use allot_store::{IpoDirectory, JobQueue, ResultStore};

    use super::*;

    async fn test_state() -> (AppState, Uuid) {
        let store = Arc::new(MemoryResultStore::new());
        let queue = Arc::new(MemoryJobQueue::default());
        let ipos = Arc::new(MemoryIpoDirectory::new());
        let ipo = IpoRecord {
            ipo_id: Uuid::new_v4(),
            company_name: "Tata Technologies Limited".into(),
            registrar_name: "Link Intime India Pvt Ltd".into(),
            listing_date: Utc::now().date_naive(),
            allotment_out: false,
        };
        ipos.insert(ipo.clone()).await;
        let resolver = Resolver::new(
            store as Arc<dyn ResultStore>,
            queue as Arc<dyn JobQueue>,
            ipos as Arc<dyn IpoDirectory>,
        );
        (AppState::new(Arc::new(resolver)), ipo.ipo_id)
    }

    fn resolve_request(ipo_id: Uuid) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(format!("/api/ipos/{ipo_id}/allotment"))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"tax_ids": ["abcde1234f"]}"#))
            .unwrap()
    }

    #[tokio::test]
    async fn health_route_responds() {
        let (state, _) = test_state().await;
        let resp = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn resolve_route_returns_in_flight_for_a_fresh_id() {
        let (state, ipo_id) = test_state().await;
        let resp = app(state).oneshot(resolve_request(ipo_id)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["summary"]["checking"], 1);
        assert_eq!(value["details"][0]["tax_id"], "ABCDE1234F");
        assert_eq!(value["details"][0]["status"], "in_flight");
    }

    #[tokio::test]
    async fn resolve_route_404s_for_unknown_ipo() {
        let (state, _) = test_state().await;
        let resp = app(state)
            .oneshot(resolve_request(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
