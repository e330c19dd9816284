//! Server-side registry of in-flight push transactions.
//!
//! Each transaction owns a download area sized for its manifest. The
//! registry is a bounded LRU: opening one transaction too many evicts
//! the least recently touched transaction, which protects the node
//! against clients that never commit nor abort.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::{info, warn};

use caravel_types::{
    to_megabytes, BucketCompression, CaravelError, InstanceInfo, Result, TransferBucket,
};

use crate::archive::Archive;
use crate::download_area::DownloadArea;

struct Transaction {
    area: DownloadArea,
    buckets: Vec<TransferBucket>,
    compression: BucketCompression,
}

/// Bounded LRU of receiving transactions, keyed by uuid.
pub struct ActivePushTransactions {
    archive: Arc<dyn Archive>,
    content: Mutex<LruCache<String, Transaction>>,
}

impl ActivePushTransactions {
    pub fn new(archive: Arc<dyn Archive>, max_transactions: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_transactions).ok_or_else(|| {
            CaravelError::ParameterOutOfRange(
                "the push transaction registry needs a positive capacity".into(),
            )
        })?;

        Ok(Self {
            archive,
            content: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Open a transaction for the given manifest, allocating its
    /// download area. Returns the fresh transaction uuid.
    pub fn create(
        &self,
        instances: &[InstanceInfo],
        buckets: Vec<TransferBucket>,
        compression: BucketCompression,
    ) -> Result<String> {
        let uuid = uuid::Uuid::new_v4().to_string();

        let transaction = Transaction {
            area: DownloadArea::new(instances)?,
            buckets,
            compression,
        };

        info!(
            transaction = %uuid,
            instances = instances.len(),
            size_mb = to_megabytes(transaction.area.total_size()),
            "creating a transaction to receive instances in push mode"
        );

        let mut content = self.content.lock().unwrap();
        if content.len() == content.cap().get() {
            // Drop the oldest active transaction to make room
            if let Some((oldest, _)) = content.pop_lru() {
                warn!(transaction = %oldest, "an inactive push transaction has been discarded");
            }
        }
        content.push(uuid.clone(), transaction);

        Ok(uuid)
    }

    /// Store one bucket payload into a transaction, refreshing its
    /// recency.
    pub fn store(&self, uuid: &str, bucket_index: usize, payload: &[u8]) -> Result<()> {
        let mut content = self.content.lock().unwrap();

        let transaction = content.get_mut(uuid).ok_or_else(|| {
            CaravelError::UnknownResource(format!("unknown push transaction: {uuid}"))
        })?;

        let bucket = transaction.buckets.get(bucket_index).ok_or_else(|| {
            CaravelError::ParameterOutOfRange(format!(
                "no bucket {bucket_index} in push transaction {uuid}"
            ))
        })?;

        transaction.area.write_bucket(bucket, payload, transaction.compression)
    }

    /// Commit a transaction into the archive and remove it. A failed
    /// commit keeps the transaction in place so the client can abort
    /// it explicitly.
    pub fn commit(&self, uuid: &str) -> Result<()> {
        let mut content = self.content.lock().unwrap();

        let transaction = content.get_mut(uuid).ok_or_else(|| {
            CaravelError::UnknownResource(format!("unknown push transaction: {uuid}"))
        })?;

        transaction.area.commit(self.archive.as_ref())?;
        content.pop(uuid);
        Ok(())
    }

    /// Drop a transaction without committing anything.
    pub fn discard(&self, uuid: &str) -> Result<()> {
        let mut content = self.content.lock().unwrap();
        content.pop(uuid).ok_or_else(|| {
            CaravelError::UnknownResource(format!("unknown push transaction: {uuid}"))
        })?;
        Ok(())
    }

    pub fn transaction_uuids(&self) -> Vec<String> {
        self.content
            .lock()
            .unwrap()
            .iter()
            .map(|(uuid, _)| uuid.clone())
            .collect()
    }
}

impl Drop for ActivePushTransactions {
    fn drop(&mut self) {
        for (uuid, _) in self.content.lock().unwrap().iter() {
            warn!(transaction = %uuid, "discarding an uncommitted push transaction");
        }
    }
}
