//! HTTP request handlers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use log::info;
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;

use crate::deploy::PushEvent;
use crate::deployment::DeploymentRecord;
use crate::repository::{NewRepository, RepositoryRecord, RepositoryUpdate};
use crate::runtime::{SessionStatus, TeardownReport, WebhookDisposition};

use super::error::ApiError;
use super::state::AppState;

type HmacSha256 = Hmac<Sha256>;

const OWNER_HEADER: &str = "x-owner-id";
const DEFAULT_OWNER: &str = "default";
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

fn owner_id(headers: &HeaderMap) -> String {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_OWNER)
        .to_string()
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /repositories
pub async fn create_repository(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<NewRepository>,
) -> Result<(StatusCode, Json<RepositoryRecord>), ApiError> {
    let owner = owner_id(&headers);
    let record = state.repositories.create(&owner, input).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /repositories
pub async fn list_repositories(
    State(state): State<AppState>,
) -> Result<Json<Vec<RepositoryRecord>>, ApiError> {
    Ok(Json(state.repositories.list().await?))
}

/// GET /repositories/{id}
pub async fn get_repository(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RepositoryRecord>, ApiError> {
    state
        .repositories
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("repository {}", id)))
}

/// PATCH /repositories/{id}
pub async fn update_repository(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(changes): Json<RepositoryUpdate>,
) -> Result<Json<RepositoryRecord>, ApiError> {
    state
        .repositories
        .update(&id, changes)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("repository {}", id)))
}

/// DELETE /repositories/{id}
pub async fn delete_repository(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TeardownReport>, ApiError> {
    state
        .repositories
        .delete(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("repository {}", id)))
}

/// POST /repositories/{id}/restart
pub async fn restart_repository(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .repositories
        .restart(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("repository {}", id)))?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /repositories/{id}/status
pub async fn repository_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    state
        .manager
        .status(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no session for repository {}", id)))
}

#[derive(Serialize)]
pub struct LogHistory {
    pub repository_id: String,
    pub history: String,
}

/// GET /repositories/{id}/logs
pub async fn repository_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LogHistory>, ApiError> {
    let Some(sink) = state.manager.logs().get(&id) else {
        return Err(ApiError::not_found(format!("no logs for repository {}", id)));
    };
    let history = sink.history().await?;
    Ok(Json(LogHistory {
        repository_id: id,
        history,
    }))
}

/// GET /repositories/{id}/deployments
pub async fn list_deployments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DeploymentRecord>>, ApiError> {
    let records = state
        .deployments
        .list_for_repository(&id)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(records))
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub disposition: &'static str,
}

/// POST /webhooks/{id}
///
/// Provider push intake. The payload is authenticated with an HMAC-SHA256
/// signature over the raw body before it is parsed.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing webhook signature"))?;

    if !verify_signature(&state.webhook_secret, &body, signature) {
        return Err(ApiError::unauthorized("invalid webhook signature"));
    }

    let event: PushEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("malformed push payload: {}", e)))?;

    info!("Webhook push for repository {} ({})", id, event.git_ref);

    let disposition = state
        .repositories
        .handle_push(&id, &event)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("repository {}", id)))?;

    Ok(Json(WebhookResponse {
        disposition: match disposition {
            WebhookDisposition::Redeployed => "redeployed",
            WebhookDisposition::Ignored => "ignored",
        },
    }))
}

/// Constant-time verification of a `sha256=<hex>` signature header.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}
