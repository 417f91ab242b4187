//! Form token and challenge endpoints.

use axum::extract::{Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::state::AppState;
use crate::antibot::{Challenge, FormToken};

#[derive(Debug, Default, Deserialize)]
pub struct ChallengeQuery {
    pub redirect: Option<String>,
}

#[instrument(skip_all)]
pub async fn form_token(State(state): State<AppState>) -> Json<FormToken> {
    let token = state.antibot.issue_form_token();
    debug!(expires_in = token.expires_in, "Issued form token");
    Json(token)
}

#[instrument(skip_all)]
pub async fn challenge(
    State(state): State<AppState>,
    uri: Uri,
    Query(query): Query<ChallengeQuery>,
) -> Challenge {
    let redirect = redirect_target(query.redirect.as_deref(), uri.path());
    state.antibot.issue_challenge(redirect)
}

pub async fn preflight() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Only same-origin absolute paths are honoured; anything else reloads the
/// challenge path itself.
fn redirect_target<'a>(requested: Option<&'a str>, fallback: &'a str) -> &'a str {
    match requested {
        Some(path) if is_local_path(path) => path,
        _ => fallback,
    }
}

/// Browsers read `/\host` as `//host` and drop tabs and newlines before
/// parsing, so both would turn a path into a protocol-relative URL.
fn is_local_path(path: &str) -> bool {
    path.starts_with('/')
        && !path.starts_with("//")
        && !path.contains('\\')
        && !path.chars().any(char::is_control)
}
