use axum::extract::State;
use axum::Json;
use serde_json::{Map, Value};

use caravel_core::detect::detect_peers;
use caravel_types::CaravelError;

use crate::error::ServerError;
use crate::state::AppState;

/// GET `/transfers/peers` — probe every configured peer and classify
/// it as `disabled`, `installed` or `bidirectional`.
pub async fn serve_peers(State(state): State<AppState>) -> Result<Json<Value>, ServerError> {
    let context = state.inner.clone();

    let statuses = tokio::task::spawn_blocking(move || {
        detect_peers(&context.peers, context.transfers.threads)
    })
    .await
    .map_err(|e| ServerError::from(CaravelError::Internal(e.to_string())))??;

    let mut answer = Map::new();
    for (peer, status) in statuses {
        answer.insert(peer, Value::String(status.as_str().to_string()));
    }

    Ok(Json(Value::Object(answer)))
}
