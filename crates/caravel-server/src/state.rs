use std::sync::Arc;

use tokio::sync::Semaphore;

use caravel_core::{
    ActivePushTransactions, Archive, InstancesCache, MemoryArchive, PeerDirectory, Peers,
    RestArchive, TransfersConfig,
};
use caravel_types::Result;

use crate::config::NodeConfig;
use crate::jobs::JobExecutor;

/// Engine services of one node, shared by every handler.
pub struct ServiceContext {
    pub transfers: TransfersConfig,
    pub peers: Peers,
    pub archive: Arc<dyn Archive>,
    pub cache: Arc<InstancesCache>,
    /// `None` when `MaxPushTransactions` is 0 (push endpoints disabled).
    pub push_transactions: Option<ActivePushTransactions>,
    pub jobs: JobExecutor,
    /// Identifier of this node, answered as the lookup `Originator`.
    pub node_uuid: String,
    /// Bounds the number of concurrently served chunk requests.
    pub chunk_permits: Semaphore,
}

/// Shared application state, wrapped in `Arc` for axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<ServiceContext>,
}

impl AppState {
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        let archive: Arc<dyn Archive> = match &config.archive.url {
            Some(url) => Arc::new(RestArchive::new(url)),
            None => Arc::new(MemoryArchive::new()),
        };
        Self::with_archive(config, archive)
    }

    /// Build the state around an externally constructed archive, which
    /// also lets tests wire in a seeded in-memory archive.
    pub fn with_archive(config: &NodeConfig, archive: Arc<dyn Archive>) -> Result<Self> {
        let transfers = config.transfers.clone();
        transfers.validate()?;

        let peers = Peers::new(PeerDirectory::new(config.peers.clone()));
        let cache = Arc::new(InstancesCache::new(
            Arc::clone(&archive),
            transfers.cache_size_bytes(),
        ));

        let push_transactions = if transfers.max_push_transactions > 0 {
            Some(ActivePushTransactions::new(
                Arc::clone(&archive),
                transfers.max_push_transactions,
            )?)
        } else {
            None
        };

        let chunk_permits = Semaphore::new(transfers.threads);

        Ok(Self {
            inner: Arc::new(ServiceContext {
                transfers,
                peers,
                archive,
                cache,
                push_transactions,
                jobs: JobExecutor::new(),
                node_uuid: uuid::Uuid::new_v4().to_string(),
                chunk_permits,
            }),
        })
    }
}
