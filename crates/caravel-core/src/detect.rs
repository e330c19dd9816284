//! Parallel discovery of which configured peers run the transfer
//! service.
//!
//! Every peer is probed with a short-timeout `GET /plugins`; a peer
//! advertising the transfer feature is `installed`, and `bidirectional`
//! when it is additionally configured with `RemoteSelf`. Unreachable or
//! plain peers report `disabled`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use caravel_types::{Result, PLUGIN_NAME, URI_PLUGINS};

use crate::peers::Peers;
use crate::queue::{HttpQueriesQueue, HttpQuery, QueryMethod};
use crate::runner::QueriesRunner;

/// Classification of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Disabled,
    Installed,
    Bidirectional,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Disabled => "disabled",
            PeerStatus::Installed => "installed",
            PeerStatus::Bidirectional => "bidirectional",
        }
    }
}

struct PluginDetectQuery {
    peer: String,
    result: Arc<Mutex<BTreeMap<String, bool>>>,
}

impl HttpQuery for PluginDetectQuery {
    fn method(&self) -> QueryMethod {
        QueryMethod::Get
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn uri(&self) -> &str {
        URI_PLUGINS
    }

    fn read_body(&self) -> Result<Vec<u8>> {
        Err(caravel_types::CaravelError::Internal(
            "a detection probe has no body".into(),
        ))
    }

    fn handle_answer(&self, answer: &[u8]) -> Result<()> {
        let enabled = serde_json::from_slice::<Value>(answer)
            .ok()
            .and_then(|value| {
                value.as_array().map(|plugins| {
                    plugins
                        .iter()
                        .any(|plugin| plugin.as_str() == Some(PLUGIN_NAME))
                })
            })
            .unwrap_or(false);

        if enabled {
            info!(peer = %self.peer, "peer has the transfer service enabled");
            self.result.lock().unwrap().insert(self.peer.clone(), true);
        } else {
            warn!(peer = %self.peer, "peer does *not* have the transfer service enabled");
        }

        Ok(())
    }
}

/// Probe every configured peer and classify it.
pub fn detect_peers(peers: &Peers, threads: usize) -> Result<BTreeMap<String, PeerStatus>> {
    let directory = peers.directory().clone();

    // Probes use a tight timeout so one dead peer does not stall the
    // whole sweep.
    let probe_client = Peers::with_timeouts(
        directory.clone(),
        Duration::from_secs(2),
        Duration::from_secs(2),
    );

    let result = Arc::new(Mutex::new(BTreeMap::new()));
    let queue = Arc::new(HttpQueriesQueue::new(probe_client));

    for name in directory.names() {
        result.lock().unwrap().insert(name.to_string(), false);
        queue.enqueue(Arc::new(PluginDetectQuery {
            peer: name.to_string(),
            result: Arc::clone(&result),
        }));
    }

    {
        let _runner = QueriesRunner::new(Arc::clone(&queue), threads)?;
        queue.wait_complete_blocking();
    }

    let detected = result.lock().unwrap();
    Ok(directory
        .names()
        .map(|name| {
            let status = if !detected.get(name).copied().unwrap_or(false) {
                PeerStatus::Disabled
            } else if directory.remote_self(name).is_some() {
                PeerStatus::Bidirectional
            } else {
                PeerStatus::Installed
            };
            (name.to_string(), status)
        })
        .collect())
}
