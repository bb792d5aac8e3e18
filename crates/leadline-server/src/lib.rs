pub mod config;
pub mod realtime;
pub mod subscription_db;

use axum::{
    extract::{rejection::JsonRejection, ws::WebSocketUpgrade, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use jsonwebtoken::{decode, DecodingKey, Validation};
use leadline_proto::{
    ApiResponse, AssignLeadRequest, PushSubscriptionPayload, RealtimeMessage,
    ReminderChangedRequest, SubscribeRequest, UnsubscribeRequest,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::realtime::RealtimeHub;
use crate::subscription_db::SubscriptionDb;

/// Session claims issued by the auth provider. `sub` is the user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub db: SubscriptionDb,
    pub hub: Arc<RealtimeHub>,
    decoding_key: Arc<DecodingKey>,
}

impl AppState {
    pub fn new(db: SubscriptionDb, jwt_secret: &[u8]) -> Self {
        Self {
            db,
            hub: Arc::new(RealtimeHub::default()),
            decoding_key: Arc::new(DecodingKey::from_secret(jwt_secret)),
        }
    }
}

type ApiError = (StatusCode, Json<ApiResponse>);

fn reject(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ApiResponse::error(message)))
}

fn internal(context: &str, e: anyhow::Error) -> ApiError {
    error!("{context}: {e:#}");
    reject(StatusCode::INTERNAL_SERVER_ERROR, context)
}

/// Build the HTTP application.
pub fn app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/notifications/subscribe", post(subscribe_handler))
        .route("/notifications/unsubscribe", post(unsubscribe_handler))
        .route("/notifications/assign", post(assign_handler))
        .route("/notifications/reminder", post(reminder_handler))
        .route("/realtime", get(realtime_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_middleware,
        ));

    let api = Router::new()
        .route("/health", get(health_handler))
        .merge(protected);

    Router::new()
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}

// --- JWT Auth Middleware ---
async fn jwt_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "Unauthorized"))?;

    match decode::<Claims>(token, &state.decoding_key, &Validation::default()) {
        Ok(token_data) => {
            req.extensions_mut().insert(token_data.claims);
            Ok(next.run(req).await)
        }
        Err(e) => {
            warn!("JWT validation error: {e}");
            Err(reject(StatusCode::UNAUTHORIZED, "Unauthorized"))
        }
    }
}

fn check_subscription(subscription: &PushSubscriptionPayload) -> Result<(), ApiError> {
    let endpoint = subscription.endpoint.trim();
    if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "Subscription endpoint must be an http(s) URL",
        ));
    }
    if subscription.keys.p256dh.is_empty() || subscription.keys.auth.is_empty() {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "Subscription keys are required",
        ));
    }
    Ok(())
}

async fn subscribe_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Result<Json<SubscribeRequest>, JsonRejection>,
) -> Result<Json<ApiResponse>, ApiError> {
    let Json(req) = body.map_err(|e| reject(StatusCode::BAD_REQUEST, e.body_text()))?;
    check_subscription(&req.subscription)?;

    state
        .db
        .upsert(&claims.sub, &req.subscription)
        .await
        .map_err(|e| internal("Failed to save subscription", e))?;
    info!("Saved push subscription for {}", claims.sub);
    Ok(Json(ApiResponse::ok()))
}

async fn unsubscribe_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Result<Json<UnsubscribeRequest>, JsonRejection>,
) -> Result<Json<ApiResponse>, ApiError> {
    let Json(req) = body.map_err(|e| reject(StatusCode::BAD_REQUEST, e.body_text()))?;
    if req.endpoint.trim().is_empty() {
        return Err(reject(StatusCode::BAD_REQUEST, "Endpoint is required"));
    }

    let removed = state
        .db
        .delete(&claims.sub, &req.endpoint)
        .await
        .map_err(|e| internal("Failed to remove subscription", e))?;
    if removed {
        info!("Removed push subscription for {}", claims.sub);
    }
    Ok(Json(ApiResponse::ok()))
}

/// Tell the assignee's connected devices that a lead was transferred to them.
async fn assign_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Result<Json<AssignLeadRequest>, JsonRejection>,
) -> Result<Json<ApiResponse>, ApiError> {
    let Json(req) = body.map_err(|e| reject(StatusCode::BAD_REQUEST, e.body_text()))?;
    if req.lead_id.trim().is_empty() || req.assignee_id.trim().is_empty() {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "lead_id and assignee_id are required",
        ));
    }

    let delivered = state.hub.publish(
        &req.assignee_id,
        RealtimeMessage::LeadAssigned {
            lead_id: req.lead_id,
            lead_name: req.lead_name,
            assigned_by: Some(claims.sub),
            assigned_at: Utc::now(),
        },
    );
    info!(
        "Lead assignment for {} delivered to {delivered} connection(s)",
        req.assignee_id
    );
    Ok(Json(ApiResponse::ok()))
}

/// Tell the user's connected devices to poll reminders now.
async fn reminder_handler(
    State(state): State<AppState>,
    body: Result<Json<ReminderChangedRequest>, JsonRejection>,
) -> Result<Json<ApiResponse>, ApiError> {
    let Json(req) = body.map_err(|e| reject(StatusCode::BAD_REQUEST, e.body_text()))?;
    if req.reminder_id.trim().is_empty() || req.user_id.trim().is_empty() {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "reminder_id and user_id are required",
        ));
    }

    let delivered = state.hub.publish(
        &req.user_id,
        RealtimeMessage::ReminderChanged {
            reminder_id: req.reminder_id,
        },
    );
    info!(
        "Reminder change for {} delivered to {delivered} connection(s)",
        req.user_id
    );
    Ok(Json(ApiResponse::ok()))
}

async fn realtime_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    // Subscribe before the upgrade so nothing published after the handshake is missed
    let rx = state.hub.subscribe(&claims.sub);
    info!("Realtime connection opened for {}", claims.sub);
    ws.on_upgrade(move |socket| realtime::serve_socket(socket, rx))
}
