use std::collections::HashMap;

use application::{ApplicationError, HubStats};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::HeaderMap,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use domain::{ConversationId, PresenceStatus, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{error::ApiError, state::AppState, ws_connection};

/// 批量查询一次最多的用户数
const MAX_BULK_USERS: usize = 500;

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkPresencePayload {
    user_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceView {
    user_id: UserId,
    status: PresenceStatus,
    last_seen_at: Option<Timestamp>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BulkPresenceView {
    statuses: HashMap<String, PresenceStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TypingView {
    conversation_id: ConversationId,
    user_ids: Vec<UserId>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(websocket_upgrade))
        .route("/stats", get(connection_stats))
        .route("/presence/bulk", post(bulk_presence))
        .route("/presence/{user_id}", get(user_presence))
        .route("/conversations/{conversation_id}/typing", get(typing_users))
}

async fn health() -> &'static str {
    "ok"
}

/// WebSocket 升级：先校验 Origin，再认证，都通过才完成握手
async fn websocket_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    state.origin_policy.check(&headers)?;
    let identity = state
        .jwt_service
        .authenticate(&headers, query.token.as_deref())?;

    tracing::debug!(user_id = %identity.user_id, "WebSocket 升级请求已通过认证");

    let realtime = state.realtime.clone();
    Ok(ws.on_upgrade(move |socket| ws_connection::serve_socket(socket, realtime, identity)))
}

async fn connection_stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.realtime.stats())
}

async fn user_presence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Result<Json<PresenceView>, ApiError> {
    state.jwt_service.authenticate(&headers, None)?;
    let user_id = UserId::from(user_id);
    let presence = state.realtime.presence();

    let status = presence.status(user_id).await;
    let last_seen_at = presence
        .last_seen(user_id)
        .await
        .map_err(ApplicationError::from)?;

    Ok(Json(PresenceView {
        user_id,
        status,
        last_seen_at,
    }))
}

async fn bulk_presence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BulkPresencePayload>,
) -> Result<Json<BulkPresenceView>, ApiError> {
    state.jwt_service.authenticate(&headers, None)?;
    if payload.user_ids.len() > MAX_BULK_USERS {
        return Err(ApiError::bad_request(format!(
            "at most {MAX_BULK_USERS} users per request"
        )));
    }

    let user_ids: Vec<UserId> = payload.user_ids.into_iter().map(UserId::from).collect();
    let statuses = state
        .realtime
        .presence()
        .get_bulk_status(&user_ids)
        .await
        .into_iter()
        .map(|(user_id, status)| (user_id.to_string(), status))
        .collect();

    Ok(Json(BulkPresenceView { statuses }))
}

async fn typing_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<TypingView>, ApiError> {
    state.jwt_service.authenticate(&headers, None)?;
    let conversation_id = ConversationId::from(conversation_id);
    let user_ids = state
        .realtime
        .presence()
        .typing_users(conversation_id)
        .await
        .map_err(ApplicationError::from)?;

    Ok(Json(TypingView {
        conversation_id,
        user_ids,
    }))
}
