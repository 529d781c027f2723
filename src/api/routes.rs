//! HTTP routes over the feed session.
//!
//! Reads come from the latest published snapshot; writes are forwarded to
//! the session as commands and answered with 202.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::api::ws::websocket_handler;
use crate::feed::reconciler::ViewportMetrics;
use crate::feed::session::{FeedHandle, FeedSnapshot, SessionCommand};
use crate::models::{validate_token_address, RecentSearch};
use crate::storage::RecentSearchStore;

#[derive(Clone)]
pub struct AppState {
    pub feed: FeedHandle,
    pub recent: Arc<dyn RecentSearchStore>,
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn dispatch(state: &AppState, command: SessionCommand) -> Response {
    if state.feed.send(command) {
        StatusCode::ACCEPTED.into_response()
    } else {
        error(StatusCode::SERVICE_UNAVAILABLE, "feed session stopped")
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/feed", get(get_feed))
        .route("/api/select", post(post_select))
        .route("/api/viewport", post(post_viewport))
        .route("/api/flush", post(post_flush))
        .route("/api/load-more", post(post_load_more))
        .route("/api/recent", get(get_recent))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "ok"
}

pub async fn get_feed(State(state): State<AppState>) -> Json<FeedSnapshot> {
    Json(state.feed.snapshot())
}

pub async fn post_select(
    State(state): State<AppState>,
    Json(req): Json<SelectRequest>,
) -> Response {
    match validate_token_address(&req.address) {
        Ok(address) => dispatch(&state, SessionCommand::SelectToken(address)),
        Err(e) => error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

pub async fn post_viewport(
    State(state): State<AppState>,
    Json(viewport): Json<ViewportMetrics>,
) -> Response {
    dispatch(&state, SessionCommand::Viewport(viewport))
}

pub async fn post_flush(State(state): State<AppState>) -> Response {
    dispatch(&state, SessionCommand::FlushPending)
}

pub async fn post_load_more(State(state): State<AppState>) -> Response {
    dispatch(&state, SessionCommand::LoadMore)
}

pub async fn get_recent(State(state): State<AppState>) -> Result<Json<Vec<RecentSearch>>, Response> {
    state.recent.load().map(Json).map_err(|e| {
        warn!(error = %e, "Failed to load recent searches");
        error(StatusCode::INTERNAL_SERVER_ERROR, "recent searches unavailable")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRecentSearches;
    use axum::body::Body;
    use axum::http::Request;
    use tokio::sync::{mpsc, watch};
    use tower::ServiceExt;

    fn app() -> (Router, mpsc::UnboundedReceiver<SessionCommand>) {
        // Commands land on a plain channel so the test can inspect them
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (_snapshot_tx, snapshot_rx) = watch::channel(FeedSnapshot {
            at_newest_edge: true,
            ..Default::default()
        });
        let state = AppState {
            feed: FeedHandle::new(command_tx, snapshot_rx),
            recent: Arc::new(MemoryRecentSearches::default()),
        };
        (router(state), command_rx)
    }

    fn json_post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_select_validates_address() {
        let (app, mut commands) = app();

        let resp = app
            .clone()
            .oneshot(json_post("/api/select", r#"{"address":"short"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(commands.try_recv().is_err());

        let addr = "So11111111111111111111111111111111111111112";
        let resp = app
            .oneshot(json_post("/api/select", &format!(r#"{{"address":" {addr} "}}"#)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(
            commands.try_recv().unwrap(),
            SessionCommand::SelectToken(addr.to_string())
        );
    }

    #[tokio::test]
    async fn test_viewport_and_flush_forward_commands() {
        let (app, mut commands) = app();

        let resp = app
            .clone()
            .oneshot(json_post(
                "/api/viewport",
                r#"{"scroll_top":10.0,"scroll_height":900.0,"client_height":600.0}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(
            commands.try_recv().unwrap(),
            SessionCommand::Viewport(ViewportMetrics {
                scroll_top: 10.0,
                scroll_height: 900.0,
                client_height: 600.0,
            })
        );

        let resp = app.oneshot(json_post("/api/flush", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(commands.try_recv().unwrap(), SessionCommand::FlushPending);
    }

    #[tokio::test]
    async fn test_feed_snapshot_and_recent() {
        let (app, _commands) = app();

        let resp = app
            .clone()
            .oneshot(Request::get("/api/feed").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let snapshot: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot["at_newest_edge"], true);
        assert_eq!(snapshot["transport"], "closed");

        let resp = app
            .oneshot(Request::get("/api/recent").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"[]");
    }
}
