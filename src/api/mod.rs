// HTTP trigger surface for the drip engine

use axum::{
    Router,
    extract::{Query, State},
    response::Json,
    routing::{get, post},
};
use chrono::Utc;
use http::{HeaderMap, StatusCode, header};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::db::{LegacyFlags, PauseReason};
use crate::engine::{Engine, TickOptions};
use crate::seed::{SeedError, SeedRequest, seed_enrollments};
use crate::types::{CampaignId, LeadId, TenantId, enrollment_record_id};

pub type AppState = Arc<Engine>;

const CRON_KEY_HEADER: &str = "x-cron-key";
const CRON_TOKEN_HEADER: &str = "x-cron-token";

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/cron/drip", get(trigger_tick).post(trigger_tick))
        .route("/enrollments/seed", post(seed))
        .route("/enrollments/control", post(control))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Why a trigger request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerAuthError {
    /// A secret is configured but the request carried none.
    MissingSecret,
    InvalidSecret,
}

impl fmt::Display for TriggerAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSecret => write!(f, "Trigger secret required"),
            Self::InvalidSecret => write!(f, "Invalid trigger secret"),
        }
    }
}

impl std::error::Error for TriggerAuthError {}

/// Check the shared trigger secret.
///
/// The secret may arrive as `?token=`, in `x-cron-key` or `x-cron-token`, or
/// as a bearer token. With no secret configured every request is accepted.
pub fn authorize_trigger(
    expected: Option<&str>,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<(), TriggerAuthError> {
    let Some(expected) = expected.filter(|s| !s.is_empty()) else {
        return Ok(());
    };

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let presented = query_token
        .or_else(|| headers.get(CRON_KEY_HEADER).and_then(|v| v.to_str().ok()))
        .or_else(|| headers.get(CRON_TOKEN_HEADER).and_then(|v| v.to_str().ok()))
        .or(bearer)
        .map(str::trim);

    match presented {
        None | Some("") => Err(TriggerAuthError::MissingSecret),
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(TriggerAuthError::InvalidSecret),
    }
}

fn check_auth(state: &AppState, headers: &HeaderMap, token: Option<&str>) -> Result<(), StatusCode> {
    authorize_trigger(state.config().cron_secret.as_deref(), headers, token).map_err(|e| {
        warn!("Rejected trigger request: {}", e);
        StatusCode::UNAUTHORIZED
    })
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339()
    })))
}

#[derive(Debug, Default, Deserialize)]
struct TickQuery {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    dry: bool,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

async fn trigger_tick(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TickQuery>,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers, query.token.as_deref())?;

    let options = TickOptions {
        force: query.force,
        dry: query.dry,
        limit: query.limit,
    };

    let report = state.run_tick(options, Utc::now()).await.map_err(|e| {
        error!("Tick failed: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let body = serde_json::to_value(&report).map_err(|_e| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(body))
}

async fn seed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(request): Json<SeedRequest>,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers, query.token.as_deref())?;

    let report = seed_enrollments(state.store(), state.config(), &request, Utc::now())
        .await
        .map_err(|e| match e {
            SeedError::Campaign(_) | SeedError::EmptyCampaign => {
                warn!("Seed request rejected: {}", e);
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SeedError::Store(_) => {
                error!("Seed failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "campaign_id": request.campaign_id,
        "requested": report.requested,
        "created": report.created,
        "already_enrolled": report.already_enrolled,
        "missing_leads": report.missing_leads,
    })))
}

/// Pause, resume or stop one enrollment.
///
/// Accepts the canonical `pause_reason` alongside any of the legacy flag
/// aliases (`active`, `isActive`, `enabled`, `paused`, `isPaused`, `stopAll`).
#[derive(Debug, Deserialize)]
struct ControlRequest {
    tenant: TenantId,
    lead_id: LeadId,
    campaign_id: CampaignId,
    #[serde(default)]
    pause_reason: Option<PauseReason>,
    #[serde(flatten)]
    flags: LegacyFlags,
}

async fn control(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(request): Json<ControlRequest>,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers, query.token.as_deref())?;

    if request.flags.is_empty() && request.pause_reason.is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let (enabled, reason) = if request.flags.is_empty() {
        (false, request.pause_reason)
    } else {
        let (enabled, reason) = request.flags.canonicalize();
        (enabled, if enabled { None } else { request.pause_reason.or(reason) })
    };

    let id = enrollment_record_id(&request.tenant, &request.lead_id, &request.campaign_id);
    let record = state
        .store()
        .set_enabled(&id, enabled, reason, Utc::now())
        .await
        .map_err(|e| {
            error!("Failed to update enrollment {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    info!(
        "Enrollment {} is {} (enabled={} reason={:?})",
        id,
        record.status.as_str(),
        enabled,
        reason
    );

    Ok(Json(serde_json::json!({
        "status": "ok",
        "enrollment": id.to_string(),
        "enabled": record.enabled,
        "pause_reason": record.pause_reason,
        "enrollment_status": record.status,
    })))
}
