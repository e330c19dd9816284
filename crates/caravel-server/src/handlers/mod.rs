pub mod chunks;
pub mod jobs;
pub mod lookup;
pub mod peers;
pub mod push;

use axum::routing::{get, post, put};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use caravel_types::PLUGIN_NAME;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let mut transfers = Router::new()
        .route("/chunks/{ids}", get(chunks::serve_chunks))
        .route("/lookup", post(lookup::lookup_instances))
        .route("/pull", post(jobs::schedule_pull))
        .route("/send", post(jobs::schedule_send))
        .route("/peers", get(peers::serve_peers));

    // Without push capacity the push endpoints do not exist at all
    if state.inner.push_transactions.is_some() {
        transfers = transfers
            .route("/push", post(push::create_transaction))
            .route("/push/{uuid}", axum::routing::delete(push::discard_transaction))
            .route("/push/{uuid}/commit", post(push::commit_transaction))
            .route("/push/{uuid}/{index}", put(push::store_bucket));
    }

    Router::new()
        .route("/plugins", get(list_plugins))
        .route("/jobs/{id}", get(jobs::job_status))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        .nest("/transfers", transfers)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Advertise the transfer feature so peers can discover this node.
async fn list_plugins() -> Json<Vec<&'static str>> {
    Json(vec![PLUGIN_NAME])
}
