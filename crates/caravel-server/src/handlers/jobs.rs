use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, info};

use caravel_core::jobs::{JobDriver, PullJob, PushJob, TransferQuery};
use caravel_core::peers::post_peer_with_retry;
use caravel_types::{CaravelError, URI_JOBS, URI_PULL};

use crate::error::ServerError;
use crate::state::AppState;

fn job_submission_reply(id: &str) -> Json<Value> {
    Json(json!({
        "ID": id,
        "Path": format!("{URI_JOBS}/{id}"),
    }))
}

/// POST `/transfers/pull` — start pulling the queried resources from
/// the remote peer into this node.
pub async fn schedule_pull(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ServerError> {
    let query = TransferQuery::parse(&body)?;
    let priority = query.priority();

    let job = PullJob::new(
        query,
        state.inner.peers.clone(),
        Arc::clone(&state.inner.archive),
        &state.inner.transfers,
    )?;

    let id = state.inner.jobs.submit(JobDriver::new(Box::new(job)), priority);
    Ok(job_submission_reply(&id))
}

/// POST `/transfers/send` — send the queried resources to a peer.
///
/// When the peer is configured with `RemoteSelf`, the send runs in pull
/// mode: the remote node is asked to pull from us, and validates our
/// originator against its lookup answers. Otherwise a local push job is
/// submitted.
pub async fn schedule_send(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ServerError> {
    let query = TransferQuery::parse(&body)?;
    let peer = query.peer().to_string();
    let remote_self = state
        .inner
        .peers
        .directory()
        .remote_self(&peer)
        .map(str::to_string);

    info!(
        peer,
        mode = if remote_self.is_some() { "pull" } else { "push" },
        "sending resources to peer"
    );

    match remote_self {
        Some(remote_self) => {
            let peer_url = state.inner.peers.directory().url(&peer)?;

            let pull_query = json!({
                "Peer": remote_self,
                "Resources": query.resources_json(),
                "Compression": query.compression().as_str(),
                "Originator": state.inner.node_uuid,
            });
            let pull_body = serde_json::to_vec(&pull_query)
                .map_err(|e| CaravelError::Internal(e.to_string()))?;

            let context = state.inner.clone();
            let peer_for_request = peer.clone();
            let answer = tokio::task::spawn_blocking(move || {
                post_peer_with_retry(
                    &context.peers,
                    &peer_for_request,
                    URI_PULL,
                    &pull_body,
                    context.transfers.max_http_retries,
                )
            })
            .await
            .map_err(|e| ServerError::from(CaravelError::Internal(e.to_string())))?;

            let remote_job = answer.as_ref().and_then(|a| {
                Some((
                    a.get("ID")?.as_str()?.to_string(),
                    a.get("Path")?.as_str()?.to_string(),
                ))
            });

            let Some((remote_id, remote_path)) = remote_job else {
                error!(
                    peer,
                    "cannot trigger a pull-mode send \
                     (check the remote logs and that the peer runs the transfer service)"
                );
                return Err(ServerError::bad_gateway(format!(
                    "peer '{peer}' did not accept the pull request"
                )));
            };

            Ok(Json(json!({
                "Peer": peer,
                "RemoteJob": remote_id,
                "URL": format!("{peer_url}{remote_path}"),
            })))
        }

        None => {
            let priority = query.priority();
            let job = PushJob::new(
                query,
                state.inner.peers.clone(),
                Arc::clone(&state.inner.cache),
                &state.inner.transfers,
            )?;

            let id = state.inner.jobs.submit(JobDriver::new(Box::new(job)), priority);
            Ok(job_submission_reply(&id))
        }
    }
}

/// GET `/jobs/{id}` — status snapshot of a submitted job.
pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    let record = state
        .inner
        .jobs
        .get(&id)
        .ok_or_else(|| ServerError::not_found(format!("unknown job: {id}")))?;

    let (status, progress, content) = record.status();

    Ok(Json(json!({
        "ID": record.id,
        "Type": record.job_type,
        "State": status.as_str(),
        "Progress": progress,
        "Priority": record.priority,
        "Content": content,
        "Query": record.serialized,
    })))
}

/// POST `/jobs/{id}/cancel` — best-effort cancellation.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    let record = state
        .inner
        .jobs
        .get(&id)
        .ok_or_else(|| ServerError::not_found(format!("unknown job: {id}")))?;

    record.request_cancel();
    Ok(Json(json!({})))
}
