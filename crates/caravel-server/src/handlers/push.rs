use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use caravel_core::planner::PushManifest;
use caravel_core::ActivePushTransactions;
use caravel_types::{CaravelError, URI_PUSH};

use crate::error::ServerError;
use crate::state::AppState;

fn registry(state: &AppState) -> Result<&ActivePushTransactions, ServerError> {
    // The routes only exist when the registry is configured; an absent
    // registry here would be a wiring bug.
    state
        .inner
        .push_transactions
        .as_ref()
        .ok_or_else(|| ServerError::not_found("push transactions are disabled"))
}

/// POST `/transfers/push` — open a transaction for the given manifest.
pub async fn create_transaction(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ServerError> {
    let manifest: PushManifest = serde_json::from_value(body)
        .map_err(|e| CaravelError::BadFileFormat(format!("invalid push manifest: {e}")))?;

    let uuid = registry(&state)?.create(&manifest.instances, manifest.buckets, manifest.compression)?;

    Ok(Json(json!({
        "ID": uuid,
        "Path": format!("{URI_PUSH}/{uuid}"),
    })))
}

/// PUT `/transfers/push/{uuid}/{index}` — store one bucket payload.
pub async fn store_bucket(
    State(state): State<AppState>,
    Path((uuid, index)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ServerError> {
    let index: usize = index
        .parse()
        .map_err(|_| ServerError::not_found(format!("not a bucket index: {index}")))?;

    let context = state.inner.clone();
    tokio::task::spawn_blocking(move || {
        context
            .push_transactions
            .as_ref()
            .expect("push routes exist only with a registry")
            .store(&uuid, index, &body)
    })
    .await
    .map_err(|e| ServerError::from(CaravelError::Internal(e.to_string())))??;

    Ok(Json(json!({})))
}

/// POST `/transfers/push/{uuid}/commit` — finalise a transaction.
pub async fn commit_transaction(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<Value>, ServerError> {
    let context = state.inner.clone();
    tokio::task::spawn_blocking(move || {
        context
            .push_transactions
            .as_ref()
            .expect("push routes exist only with a registry")
            .commit(&uuid)
    })
    .await
    .map_err(|e| ServerError::from(CaravelError::Internal(e.to_string())))??;

    Ok(Json(json!({})))
}

/// DELETE `/transfers/push/{uuid}` — abort a transaction.
pub async fn discard_transaction(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<Value>, ServerError> {
    registry(&state)?.discard(&uuid)?;
    Ok(Json(json!({})))
}
