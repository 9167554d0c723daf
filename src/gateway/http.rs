use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::{Json, Router};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};

use super::{CallPayload, CallerInfo, Gateway, GatewayRejection, PermitConfig};
use crate::GatewayError;

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    admin_token: Option<String>,
}

impl GatewayHttpState {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway: Arc::new(gateway),
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: GatewayHttpState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics));

    // Admin routes exist only when an admin token is configured.
    if state.admin_token.is_some() {
        router = router
            .route("/admin/permits", get(admin_list_permits))
            .route("/admin/accounts/:user_id", get(admin_account))
            .route("/admin/accounts/:user_id/deposit", post(admin_deposit))
            .route("/admin/accounts/:user_id/withdraw", post(admin_withdraw))
            .route("/admin/usage", get(admin_usage));
    }

    router
        .route("/:identifier/:version", post(handle_call))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<GatewayHttpState>) -> Response {
    Json(state.gateway.observability()).into_response()
}

async fn handle_call(
    State(state): State<GatewayHttpState>,
    Path((identifier, version)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<CallPayload>,
) -> Response {
    let Ok(version) = version.parse::<u32>() else {
        return error_body(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("api version `{version}` is not numeric"),
        );
    };
    let caller = CallerInfo {
        ip: extract_header(&headers, "x-forwarded-for"),
    };

    match state.gateway.execute(&identifier, version, payload, caller).await {
        Ok(reply) => {
            let status =
                StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = (status, Body::from(reply.body)).into_response();
            insert_headers(response.headers_mut(), &reply.headers);
            response
        }
        Err(rejection) => rejection_response(rejection),
    }
}

fn rejection_response(rejection: GatewayRejection) -> Response {
    let GatewayRejection { error, headers } = rejection;
    let status = match &error {
        GatewayError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
        GatewayError::InvalidState { .. } => StatusCode::CONFLICT,
        GatewayError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::Transport { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = error_body(status, error.code(), error.to_string());
    insert_headers(response.headers_mut(), &headers);
    response
}

fn error_body(status: StatusCode, code: &'static str, message: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail { code, message },
        }),
    )
        .into_response()
}

fn insert_headers(target: &mut HeaderMap, headers: &BTreeMap<String, String>) {
    for (name, value) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        target.insert(name, value);
    }
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn require_admin(
    state: &GatewayHttpState,
    headers: &HeaderMap,
) -> Result<(), Response> {
    let expected = state.admin_token.as_deref();
    let supplied = extract_header(headers, "x-admin-token");
    match (expected, supplied) {
        (Some(expected), Some(supplied)) if expected == supplied => Ok(()),
        _ => Err(error_body(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid admin token".to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ListPermitsQuery {
    #[serde(default)]
    include_keys: bool,
}

async fn admin_list_permits(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Query(query): Query<ListPermitsQuery>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let permits: Vec<PermitConfig> = state
        .gateway
        .config()
        .permits
        .iter()
        .map(|permit| {
            let mut permit = permit.clone();
            if !query.include_keys {
                permit.api_key = "redacted".to_string();
            }
            permit
        })
        .collect();
    Json(permits).into_response()
}

async fn admin_account(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state.gateway.ledger().user_account(&user_id).await {
        Ok(account) => Json(account).into_response(),
        Err(error) => rejection_response(GatewayRejection::from(error)),
    }
}

#[derive(Debug, Deserialize)]
struct MovementRequest {
    amount: i64,
    #[serde(default)]
    description: Option<String>,
}

/// Integration point for the external top-up flow: a successful outside
/// payment lands here and is settled into the ledger.
async fn admin_deposit(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(request): Json<MovementRequest>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let ledger = state.gateway.ledger();
    let description = request
        .description
        .unwrap_or_else(|| format!("deposit for user {user_id}"));
    let result = async {
        let account = ledger.ensure_user_account(&user_id).await?;
        ledger
            .deposit_into_account(&account.id, request.amount, &description)
            .await
    }
    .await;
    match result {
        Ok(transfer) => (StatusCode::CREATED, Json(transfer)).into_response(),
        Err(error) => rejection_response(GatewayRejection::from(error)),
    }
}

async fn admin_withdraw(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(request): Json<MovementRequest>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let ledger = state.gateway.ledger();
    let description = request
        .description
        .unwrap_or_else(|| format!("withdrawal for user {user_id}"));
    let result = async {
        let account = ledger.user_account(&user_id).await?;
        ledger
            .withdraw_from_account(&account.id, request.amount, &description)
            .await
    }
    .await;
    match result {
        Ok(transfer) => (StatusCode::CREATED, Json(transfer)).into_response(),
        Err(error) => rejection_response(GatewayRejection::from(error)),
    }
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    #[serde(default = "default_usage_limit")]
    limit: usize,
    #[serde(default)]
    since_ms: Option<u64>,
}

fn default_usage_limit() -> usize {
    100
}

async fn admin_usage(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state
        .gateway
        .store()
        .list_usage_logs(query.limit, query.since_ms)
        .await
    {
        Ok(records) => Json(records).into_response(),
        Err(error) => rejection_response(GatewayRejection::from(GatewayError::from(error))),
    }
}
