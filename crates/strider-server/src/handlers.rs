use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use strider_core::{ExecutionContext, Identity, Route, RouteError, RouteStep};

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// The caller's identity, decoded from `?token=`.
pub struct ViewerToken(pub Identity);

impl FromRequestParts<AppState> for ViewerToken {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<TokenQuery>::try_from_uri(&parts.uri).map_err(|_| ApiError::NoToken)?;
        let raw = query.token.ok_or(ApiError::NoToken)?;
        let identity = state.tokens.decode(&raw)?;
        Ok(Self(identity))
    }
}

/// Body of `POST /api/execRoutes`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRoutesRequest {
    pub routes: Vec<RouteStep>,
    /// Seconds between steps.
    pub interval: f64,
    /// km/h.
    pub speed: f64,
    pub battery_level: f64,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl ExecRoutesRequest {
    pub fn into_context(self, identity: Identity) -> Result<ExecutionContext, RouteError> {
        if !self.interval.is_finite() || self.interval <= 0.0 {
            return Err(RouteError::InvalidInterval);
        }
        let interval = Duration::try_from_secs_f64(self.interval).map_err(|_| RouteError::InvalidInterval)?;
        ExecutionContext::new(
            identity,
            Route::new(self.routes)?,
            interval,
            self.speed,
            self.battery_level,
            self.expires,
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// `GET /`: connectivity check.
pub async fn root(ViewerToken(identity): ViewerToken) -> String {
    format!("token is {identity}")
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "viewers": state.registry.count(),
            "walking": state.orchestrator.active_count(),
            "counters": state.counters.snapshot(),
        })),
    )
}

pub async fn exec_routes(
    State(state): State<AppState>,
    ViewerToken(identity): ViewerToken,
    body: Result<Json<ExecRoutesRequest>, JsonRejection>,
) -> Result<&'static str, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let ctx = request.into_context(identity)?;
    state.orchestrator.start(ctx)?;
    Ok("success")
}

pub async fn stop(
    State(state): State<AppState>,
    ViewerToken(identity): ViewerToken,
) -> Json<serde_json::Value> {
    let stopped = state.orchestrator.request_stop(&identity);
    Json(json!({ "stopped": stopped }))
}

pub async fn me(
    State(state): State<AppState>,
    ViewerToken(identity): ViewerToken,
) -> Result<impl IntoResponse, ApiError> {
    let profile = state.upstream.get_profile(&identity).await?;
    Ok(Json(profile))
}

pub async fn locations(
    State(state): State<AppState>,
    ViewerToken(identity): ViewerToken,
) -> Result<impl IntoResponse, ApiError> {
    let friends = state.upstream.friend_locations(&identity).await?;
    Ok(Json(json!({ "locations": friends })))
}

/// Sign in upstream and hand back a token the client can present here.
pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if request.email.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::BadRequest("email and password are required".into()));
    }
    let access_token = state.upstream.login(&request.email, &request.password).await?;
    let sealed = state
        .tokens
        .seal(&Identity::new(access_token))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "accessToken": sealed })))
}
