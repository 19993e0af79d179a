//! Group message history endpoint.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::middleware::{ClientIp, MaybeBearer};
use crate::error::{ApiError, FieldError};
use crate::history::clamp_limit;
use crate::models::message::{Cursor, StoredMessage};
use crate::ratelimit::{Caller, RouteClass};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/messages", get(list_history))
}

// ---------------------------------------------------------------------------
// GET /api/v1/messages
// ---------------------------------------------------------------------------

/// Query parameters are taken as strings and parsed here so that malformed
/// values produce the JSON error envelope.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryParams {
    /// Group to read.
    pub group_id: Option<String>,
    /// Page size, clamped to 1..=100. Defaults to 50.
    pub limit: Option<String>,
    /// Only messages with a smaller id.
    pub before_id: Option<String>,
    /// Only messages created before this RFC 3339 timestamp.
    pub before_ts: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HistoryResponse {
    /// Oldest first.
    pub messages: Vec<StoredMessage>,
    pub has_more: bool,
    /// Number of messages in this page.
    pub total: usize,
}

#[derive(Debug)]
struct HistoryQuery {
    group_id: String,
    limit: usize,
    before: Option<Cursor>,
}

fn field_error(field: &str, message: &str) -> FieldError {
    FieldError {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn parse_params(params: HistoryParams) -> Result<HistoryQuery, ApiError> {
    let mut errors = Vec::new();

    let group_id = params.group_id.as_deref().map(str::trim).unwrap_or("");
    if group_id.is_empty() {
        errors.push(field_error("group_id", "group_id is required"));
    }

    let limit = match params.limit.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => match raw.parse::<i64>() {
            Ok(n) => Some(n),
            Err(_) => {
                errors.push(field_error("limit", "limit must be an integer"));
                None
            }
        },
    };

    let before_id = match params.before_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => match raw.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                errors.push(field_error("before_id", "before_id must be a message id"));
                None
            }
        },
    };

    let before_ts = match params.before_ts.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(_) => {
                errors.push(field_error("before_ts", "before_ts must be an RFC 3339 timestamp"));
                None
            }
        },
    };

    let before = match (before_id, before_ts) {
        (Some(_), Some(_)) => {
            errors.push(field_error(
                "before_id",
                "before_id and before_ts cannot be combined",
            ));
            None
        }
        (Some(id), None) => Some(Cursor::BeforeId(id)),
        (None, Some(ts)) => Some(Cursor::BeforeTs(ts)),
        (None, None) => None,
    };

    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    Ok(HistoryQuery {
        group_id: group_id.to_string(),
        limit: clamp_limit(limit),
        before,
    })
}

#[utoipa::path(
    get,
    path = "/api/v1/messages",
    tag = "Messages",
    params(HistoryParams),
    responses(
        (status = 200, description = "One page of history, oldest first", body = HistoryResponse),
        (status = 400, description = "Invalid parameters", body = crate::error::ApiErrorBody),
        (status = 401, description = "Invalid bearer token", body = crate::error::ApiErrorBody),
        (status = 429, description = "Rate limited", body = crate::error::ApiErrorBody),
    ),
    security((), ("bearer" = []))
)]
pub async fn list_history(
    MaybeBearer(token): MaybeBearer,
    ClientIp(ip): ClientIp,
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let caller = match token {
        Some(token) => authenticate(&state, &token, ip).await?,
        None => Caller::Ip(ip),
    };
    if let Err(info) = state.limiter.check(&caller, RouteClass::History) {
        tracing::debug!(?caller, retry_after = info.retry_after_secs, "history rate limited");
        return Err(ApiError::rate_limited(info));
    }

    let query = parse_params(params)?;
    let page = state
        .history
        .load(&query.group_id, query.before, query.limit)
        .await?;

    Ok(Json(HistoryResponse {
        total: page.messages.len(),
        has_more: page.has_more,
        messages: page.messages,
    }))
}

/// Resolve a bearer token to its identity's bucket.
///
/// The caller's address bucket gates every attempt: an exhausted address is
/// refused before the token is looked up, and each rejected token spends one
/// of its tokens.
async fn authenticate(state: &AppState, token: &str, ip: String) -> Result<Caller, ApiError> {
    let by_ip = Caller::Ip(ip);
    if let Err(info) = state.limiter.peek(&by_ip, RouteClass::History) {
        tracing::debug!(caller = ?by_ip, "bearer attempt from rate-limited address");
        return Err(ApiError::rate_limited(info));
    }

    match state.validator.validate(token).await? {
        Some(identity) => Ok(Caller::User(identity.user_id)),
        None => {
            if let Err(info) = state.limiter.check(&by_ip, RouteClass::History) {
                return Err(ApiError::rate_limited(info));
            }
            Err(ApiError::unauthorized("Invalid or expired token"))
        }
    }
}
