//! Webhook ingress
//!
//! `POST /workflows/webhook/{token}` with an arbitrary JSON body. When
//! the registration carries a secret, the request must present
//! `x-webhook-signature: sha256=<hex>` (or `x-hub-signature`) computed as
//! HMAC-SHA-256 over the raw body. Responses: 202 accepted-and-queued,
//! 400 invalid token, 401 signature mismatch, 429 rate limited.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::json;

use crate::common::ApiResult;
use crate::AppState;

#[utoipa::path(
    post,
    path = "/workflows/webhook/{token}",
    tag = "webhooks",
    request_body(content = String, description = "Arbitrary JSON payload"),
    responses(
        (status = 202, description = "Accepted and queued"),
        (status = 400, description = "Invalid token"),
        (status = 401, description = "Signature mismatch"),
        (status = 429, description = "Rate limit exceeded"),
    )
)]
pub async fn ingress(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let workflow_id = state.manager.handle_webhook(&token, &body, &headers).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "workflow_id": workflow_id})),
    ))
}
