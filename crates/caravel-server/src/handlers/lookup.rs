use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use caravel_core::{ResourceSpec, TransferPlanner};
use caravel_types::{to_megabytes, CaravelError};

use crate::error::ServerError;
use crate::state::AppState;

/// POST `/transfers/lookup` — expand a resource list into the instance
/// descriptors a peer would pull.
pub async fn lookup_instances(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ServerError> {
    let resources: Vec<ResourceSpec> = serde_json::from_value(body)
        .map_err(|e| CaravelError::BadFileFormat(format!("invalid resource list: {e}")))?;

    let context = state.inner.clone();
    let planner = tokio::task::spawn_blocking(move || -> Result<TransferPlanner, CaravelError> {
        let mut planner = TransferPlanner::new();
        planner.add_resources(&context.cache, &resources)?;
        Ok(planner)
    })
    .await
    .map_err(|e| ServerError::from(CaravelError::Internal(e.to_string())))??;

    Ok(Json(json!({
        "Instances": planner.instances(),
        "Originator": state.inner.node_uuid,
        "CountInstances": planner.instance_count(),
        "TotalSize": planner.total_size().to_string(),
        "TotalSizeMB": to_megabytes(planner.total_size()),
    })))
}
