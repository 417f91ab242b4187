//! Admin API: rule management, runtime anti-bot settings and analytics.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use super::state::AppState;
use crate::analytics::{Summary, TrafficRecord};
use crate::antibot::ConfigEntry;
use crate::error::Result;
use crate::rules::{BodyLimitSettings, QueueSettings, Rule, RuleSpec};

pub const ADMIN_PREFIX: &str = "/poormansRateLimit/api/admin";

const DEFAULT_TRAFFIC_LIMIT: usize = 100;

pub async fn list_rules(State(state): State<AppState>) -> Json<Vec<Rule>> {
    Json(state.rules.list())
}

pub async fn list_active_rules(State(state): State<AppState>) -> Json<Vec<Rule>> {
    Json(state.rules.list_active())
}

#[instrument(skip_all)]
pub async fn create_rule(
    State(state): State<AppState>,
    Json(spec): Json<RuleSpec>,
) -> Result<(StatusCode, Json<Rule>)> {
    let rule = state.rules.create(spec)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn get_rule(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Rule>> {
    Ok(Json(state.rules.get(id)?))
}

#[instrument(skip_all, fields(rule_id = %id))]
pub async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(spec): Json<RuleSpec>,
) -> Result<Json<Rule>> {
    Ok(Json(state.rules.update(id, spec)?))
}

#[instrument(skip_all, fields(rule_id = %id))]
pub async fn patch_queue(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(settings): Json<QueueSettings>,
) -> Result<Json<Rule>> {
    let rule = state.rules.patch_queue_config(id, settings)?;
    info!(
        queue_enabled = rule.spec.queue_enabled,
        max_queue_size = rule.spec.max_queue_size,
        delay_per_request_ms = rule.spec.delay_per_request_ms,
        "Queue settings patched"
    );
    Ok(Json(rule))
}

#[instrument(skip_all, fields(rule_id = %id))]
pub async fn patch_body_limit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(settings): Json<BodyLimitSettings>,
) -> Result<Json<Rule>> {
    Ok(Json(state.rules.patch_body_limit(id, settings)?))
}

#[instrument(skip_all, fields(rule_id = %id))]
pub async fn delete_rule(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    state.rules.delete(id)?;
    state.limiter.forget_rule(&id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn refresh_rules(State(state): State<AppState>) -> StatusCode {
    let version = state.rules.refresh();
    info!(version, "Rule snapshot republished");
    StatusCode::NO_CONTENT
}

pub async fn list_config(State(state): State<AppState>) -> Json<Vec<ConfigEntry>> {
    Json(state.antibot.settings().entries())
}

#[derive(Debug, Deserialize)]
pub struct ConfigValue {
    pub value: String,
}

#[instrument(skip_all, fields(key = %key))]
pub async fn set_config(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<ConfigValue>,
) -> Result<Json<ConfigEntry>> {
    Ok(Json(state.antibot.settings().set(&key, &body.value)?))
}

#[instrument(skip_all, fields(key = %key))]
pub async fn reset_config(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ConfigEntry>> {
    Ok(Json(state.antibot.settings().reset(&key)?))
}

pub async fn analytics_summary(State(state): State<AppState>) -> Json<Summary> {
    Json(state.analytics.summary())
}

#[derive(Debug, Default, Deserialize)]
pub struct TrafficQuery {
    pub limit: Option<usize>,
}

pub async fn analytics_traffic(
    State(state): State<AppState>,
    Query(query): Query<TrafficQuery>,
) -> Json<Vec<TrafficRecord>> {
    Json(
        state
            .analytics
            .recent(query.limit.unwrap_or(DEFAULT_TRAFFIC_LIMIT)),
    )
}
