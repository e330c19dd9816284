//! Stateful transfer jobs, driven step by step from the host job
//! scheduler.

mod harness;
mod pull;
mod push;
mod query;

pub use harness::{JobDriver, JobInfo, JobState, StateUpdate, StatefulJob, StepStatus, StopReason};
pub use pull::PullJob;
pub use push::PushJob;
pub use query::TransferQuery;

use std::sync::Arc;

use caravel_types::{CaravelError, Result, JOB_TYPE_PULL, JOB_TYPE_PUSH};

use crate::archive::Archive;
use crate::cache::InstancesCache;
use crate::config::TransfersConfig;
use crate::peers::Peers;

/// Rebuild a job driver from its persisted form, `(job type,
/// serialised transfer query)`. Used by the host scheduler to resume
/// jobs after a restart; reruns start from the initial state.
pub fn unserialize_job(
    job_type: &str,
    serialized: &serde_json::Value,
    peers: &Peers,
    cache: &Arc<InstancesCache>,
    archive: &Arc<dyn Archive>,
    config: &TransfersConfig,
) -> Result<JobDriver> {
    let query = TransferQuery::parse(serialized)?;

    let job: Box<dyn StatefulJob> = match job_type {
        JOB_TYPE_PULL => Box::new(PullJob::new(query, peers.clone(), Arc::clone(archive), config)?),
        JOB_TYPE_PUSH => Box::new(PushJob::new(query, peers.clone(), Arc::clone(cache), config)?),
        other => {
            return Err(CaravelError::BadFileFormat(format!(
                "unknown job type: {other}"
            )))
        }
    };

    Ok(JobDriver::new(job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::testutil::single_peer_directory;

    #[test]
    fn jobs_are_rebuilt_from_their_persisted_query() {
        let peers = Peers::new(single_peer_directory("remote", "http://localhost:1"));
        let archive: Arc<dyn Archive> = Arc::new(MemoryArchive::new());
        let cache = Arc::new(InstancesCache::new(Arc::clone(&archive), 1024));
        let config = TransfersConfig::default();

        let query = serde_json::json!({
            "Peer": "remote",
            "Resources": [{"Level": "Instance", "ID": "i1"}],
            "Compression": "gzip",
        });

        for job_type in [JOB_TYPE_PULL, JOB_TYPE_PUSH] {
            let driver =
                unserialize_job(job_type, &query, &peers, &cache, &archive, &config).unwrap();
            assert_eq!(driver.job_type(), job_type);
            assert_eq!(driver.serialized()["Peer"], "remote");
        }

        assert!(unserialize_job("Mystery", &query, &peers, &cache, &archive, &config).is_err());

        let unknown_peer = serde_json::json!({
            "Peer": "stranger",
            "Resources": [],
            "Compression": "none",
        });
        assert!(
            unserialize_job(JOB_TYPE_PULL, &unknown_peer, &peers, &cache, &archive, &config)
                .is_err()
        );
    }
}
