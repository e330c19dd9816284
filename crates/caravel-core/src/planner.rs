//! Bucket planner: turns a set of instances into a small number of
//! URL-addressable transfer units.
//!
//! Instances are classified against two thresholds. Small instances
//! (`< group`) are packed together to amortise per-request overhead,
//! medium ones travel whole, and large ones (`>= separate`) are sharded
//! into contiguous chunks so several connections can work on one
//! instance in parallel. In pull mode the packing additionally keeps
//! the resulting GET URL inside practical client/server/proxy limits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use caravel_types::{
    BucketCompression, CaravelError, InstanceInfo, Result, TransferBucket, MAX_URL_LENGTH,
};

use crate::archive::{ResourceLevel, ResourceSpec};
use crate::cache::InstancesCache;

/// Manifest opening a push transaction on the receiving node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushManifest {
    #[serde(rename = "Instances")]
    pub instances: Vec<InstanceInfo>,

    #[serde(rename = "Buckets")]
    pub buckets: Vec<TransferBucket>,

    #[serde(rename = "Compression")]
    pub compression: BucketCompression,
}

/// Accumulates the instances of a transfer and plans its buckets.
#[derive(Default)]
pub struct TransferPlanner {
    // BTreeMap keeps planning deterministic; the id order is an
    // implementation detail, not a wire contract.
    instances: BTreeMap<String, InstanceInfo>,
}

impl TransferPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instance_info(&mut self, info: InstanceInfo) {
        self.instances.insert(info.id().to_string(), info);
    }

    /// Add one instance, resolving its descriptor through the cache.
    pub fn add_instance(&mut self, cache: &InstancesCache, instance_id: &str) -> Result<()> {
        let info = cache.instance_info(instance_id)?;
        self.add_instance_info(info);
        Ok(())
    }

    /// Add every instance of a patient/study/series.
    pub fn add_container(
        &mut self,
        cache: &InstancesCache,
        level: ResourceLevel,
        id: &str,
    ) -> Result<()> {
        for instance_id in cache.archive().expand_resource(level, id)? {
            self.add_instance(cache, &instance_id)?;
        }
        Ok(())
    }

    /// Add every resource of a transfer query.
    pub fn add_resources(&mut self, cache: &InstancesCache, specs: &[ResourceSpec]) -> Result<()> {
        for spec in specs {
            match spec.level {
                ResourceLevel::Instance => self.add_instance(cache, &spec.id)?,
                level => self.add_container(cache, level, &spec.id)?,
            }
        }
        Ok(())
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Instances in planning order.
    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.instances.values().cloned().collect()
    }

    pub fn total_size(&self) -> u64 {
        self.instances.values().map(|i| i.size()).sum()
    }

    /// Plan the GET buckets of a pull transfer. `base_url` is the peer
    /// base URL, used to enforce the URL-length budget.
    pub fn compute_pull_buckets(
        &self,
        group_threshold: u64,
        separate_threshold: u64,
        base_url: &str,
        compression: BucketCompression,
    ) -> Result<Vec<TransferBucket>> {
        self.compute_buckets(group_threshold, separate_threshold, base_url, compression)
    }

    /// Plan the PUT buckets of a push transfer and format the manifest
    /// opening the remote transaction.
    pub fn format_push_manifest(
        &self,
        group_threshold: u64,
        separate_threshold: u64,
        compression: BucketCompression,
    ) -> Result<(PushManifest, Vec<TransferBucket>)> {
        let buckets =
            self.compute_buckets(group_threshold, separate_threshold, "", BucketCompression::None)?;

        let manifest = PushManifest {
            instances: self.instances(),
            buckets: buckets.clone(),
            compression,
        };

        Ok((manifest, buckets))
    }

    fn compute_buckets(
        &self,
        group_threshold: u64,
        separate_threshold: u64,
        base_url: &str,
        compression: BucketCompression,
    ) -> Result<Vec<TransferBucket>> {
        if group_threshold > separate_threshold || separate_threshold == 0 {
            return Err(CaravelError::ParameterOutOfRange(format!(
                "invalid bucket thresholds: group {group_threshold}, separate {separate_threshold}"
            )));
        }

        let mut buckets = Vec::new();
        let mut to_group = Vec::new();

        for info in self.instances.values() {
            let size = info.size();

            if size < group_threshold {
                to_group.push(info);
            } else if size < separate_threshold {
                // Send the whole instance as it is
                let mut bucket = TransferBucket::new();
                bucket.add_chunk(info, 0, size)?;
                buckets.push(bucket);
            } else {
                // Shard this large instance into contiguous chunks
                let count = size.div_ceil(separate_threshold);
                let chunk_size = size / count;

                let mut offset = 0;
                for index in 0..count {
                    let mut bucket = TransferBucket::new();
                    if index + 1 == count {
                        // The last chunk absorbs the rounding remainder
                        bucket.add_chunk(info, offset, size - offset)?;
                    } else {
                        bucket.add_chunk(info, offset, chunk_size)?;
                    }
                    buckets.push(bucket);
                    offset += chunk_size;
                }
            }
        }

        // Group the remaining small instances, keeping pull URLs under
        // the length budget.
        let mut bucket = TransferBucket::new();

        for info in to_group {
            bucket.add_chunk(info, 0, info.size())?;

            let mut full = bucket.total_size() >= group_threshold;

            if !full && !base_url.is_empty() && !bucket.is_empty() {
                let url_length = base_url.len() + bucket.pull_uri(compression)?.len();
                full = url_length >= MAX_URL_LENGTH;
            }

            if full {
                buckets.push(std::mem::take(&mut bucket));
            }
        }

        if !bucket.is_empty() {
            buckets.push(bucket);
        }

        Ok(buckets)
    }
}
