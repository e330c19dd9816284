//! Pull transfer: discover the instances on the remote peer, stream
//! the planned buckets over parallel GETs, then commit the download
//! area into the local archive.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::error;

use caravel_types::{
    to_megabytes, BucketCompression, CaravelError, InstanceInfo, Result, TransferBucket,
    JOB_TYPE_PULL, URI_LOOKUP,
};

use crate::archive::Archive;
use crate::config::TransfersConfig;
use crate::download_area::DownloadArea;
use crate::jobs::harness::{JobInfo, JobState, StateUpdate, StatefulJob, StopReason};
use crate::jobs::query::TransferQuery;
use crate::peers::{post_peer_with_retry, Peers};
use crate::planner::TransferPlanner;
use crate::queue::{HttpQueriesQueue, HttpQuery, QueryMethod, QueueStatus};
use crate::runner::QueriesRunner;

#[derive(Clone)]
struct PullContext {
    query: TransferQuery,
    peers: Peers,
    archive: Arc<dyn Archive>,
    threads: usize,
    target_bucket_size: u64,
    max_retries: u32,
}

/// GET one bucket from the peer and scatter it into the download area.
struct BucketPullQuery {
    area: Arc<DownloadArea>,
    bucket: TransferBucket,
    peer: String,
    uri: String,
    compression: BucketCompression,
}

impl BucketPullQuery {
    fn new(
        area: Arc<DownloadArea>,
        bucket: TransferBucket,
        peer: &str,
        compression: BucketCompression,
    ) -> Result<Self> {
        let uri = bucket.pull_uri(compression)?;
        Ok(Self {
            area,
            bucket,
            peer: peer.to_string(),
            uri,
            compression,
        })
    }
}

impl HttpQuery for BucketPullQuery {
    fn method(&self) -> QueryMethod {
        QueryMethod::Get
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn read_body(&self) -> Result<Vec<u8>> {
        Err(CaravelError::Internal("a pull query has no body".into()))
    }

    fn handle_answer(&self, answer: &[u8]) -> Result<()> {
        self.area.write_bucket(&self.bucket, answer, self.compression)
    }
}

/// Resolve the resource list into instance descriptors on the peer.
struct LookupInstancesState {
    ctx: PullContext,
}

impl JobState for LookupInstancesState {
    fn step(&mut self, _info: &mut JobInfo) -> Result<StateUpdate> {
        let peer = self.ctx.query.peer();
        let body = serde_json::to_vec(&self.ctx.query.resources_json())
            .map_err(|e| CaravelError::Internal(format!("serialising resources: {e}")))?;

        let Some(answer) = post_peer_with_retry(
            &self.ctx.peers,
            peer,
            URI_LOOKUP,
            &body,
            self.ctx.max_retries,
        ) else {
            error!(
                peer,
                "cannot retrieve the list of instances to pull \
                 (check that the peer runs the transfer service)"
            );
            return Ok(StateUpdate::Failure);
        };

        let (Some(instances), Some(originator)) = (
            answer.get("Instances").and_then(Value::as_array),
            answer.get("Originator").and_then(Value::as_str),
        ) else {
            error!(peer, "bad network protocol in the lookup answer");
            return Ok(StateUpdate::Failure);
        };

        if let Some(expected) = self.ctx.query.originator() {
            if expected != originator {
                error!(
                    peer,
                    "invalid originator, check the \"RemoteSelf\" \
                     configuration of the peer"
                );
                return Ok(StateUpdate::Failure);
            }
        }

        let mut planner = TransferPlanner::new();
        for instance in instances {
            let info: InstanceInfo = serde_json::from_value(instance.clone())
                .map_err(|e| CaravelError::BadFileFormat(format!("instance descriptor: {e}")))?;
            planner.add_instance_info(info);
        }

        if planner.instance_count() == 0 {
            // Nothing to retrieve, we are already done
            return Ok(StateUpdate::Success);
        }

        Ok(StateUpdate::Next(Box::new(PullBucketsState::new(
            self.ctx.clone(),
            &planner,
        )?)))
    }

    fn stop(&mut self, _reason: StopReason) {}
}

/// Stream the planned buckets through the worker pool.
struct PullBucketsState {
    ctx: PullContext,
    area: Arc<DownloadArea>,
    queue: Arc<HttpQueriesQueue>,
    runner: Option<QueriesRunner>,
    total_instances: usize,
    total_size: u64,
}

impl PullBucketsState {
    fn new(ctx: PullContext, planner: &TransferPlanner) -> Result<Self> {
        let instances = planner.instances();
        let area = Arc::new(DownloadArea::new(&instances)?);

        let peer = ctx.query.peer();
        let base_url = ctx.peers.directory().url(peer)?;
        let compression = ctx.query.compression();

        let buckets = planner.compute_pull_buckets(
            ctx.target_bucket_size,
            2 * ctx.target_bucket_size,
            &base_url,
            compression,
        )?;

        let queue = Arc::new(HttpQueriesQueue::new(ctx.peers.clone()));
        queue.set_max_retries(ctx.max_retries);

        for bucket in buckets {
            queue.enqueue(Arc::new(BucketPullQuery::new(
                Arc::clone(&area),
                bucket,
                peer,
                compression,
            )?));
        }

        Ok(Self {
            total_instances: planner.instance_count(),
            total_size: planner.total_size(),
            ctx,
            area,
            queue,
            runner: None,
        })
    }

    fn update_info(&self, info: &mut JobInfo) {
        let stats = self.queue.statistics();

        info.set_content("TotalInstances", self.total_instances as u64);
        info.set_content("TotalSizeMB", to_megabytes(self.total_size));
        info.set_content("DownloadedSizeMB", to_megabytes(stats.downloaded_size));
        info.set_content("CompletedHttpQueries", stats.succeeded as u64);

        if let Some(runner) = &self.runner {
            info.set_content("NetworkSpeedKBs", runner.speed_kbps() as u64);
        }

        // The two extra steps are the lookup before us and the commit
        // after us, which also keeps the denominator positive.
        info.set_progress((1 + stats.succeeded) as f32 / (2 + stats.scheduled) as f32);
    }
}

impl JobState for PullBucketsState {
    fn step(&mut self, info: &mut JobInfo) -> Result<StateUpdate> {
        if self.runner.is_none() {
            self.runner = Some(QueriesRunner::new(
                Arc::clone(&self.queue),
                self.ctx.threads,
            )?);
        }

        let status = self.queue.wait_complete(Duration::from_millis(200));
        self.update_info(info);

        match status {
            QueueStatus::Running => Ok(StateUpdate::Continue),
            QueueStatus::Success => Ok(StateUpdate::Next(Box::new(CommitState {
                area: Arc::clone(&self.area),
                archive: Arc::clone(&self.ctx.archive),
            }))),
            QueueStatus::Failure => Ok(StateUpdate::Failure),
        }
    }

    fn stop(&mut self, _reason: StopReason) {
        // Cancel the running download workers
        self.runner = None;
    }
}

/// Atomically hand the reassembled instances to the local archive.
struct CommitState {
    area: Arc<DownloadArea>,
    archive: Arc<dyn Archive>,
}

impl JobState for CommitState {
    fn step(&mut self, _info: &mut JobInfo) -> Result<StateUpdate> {
        self.area.commit(self.archive.as_ref())?;
        Ok(StateUpdate::Success)
    }

    fn stop(&mut self, _reason: StopReason) {}
}

/// Pull job: `LookupInstances → PullBuckets → Commit`.
pub struct PullJob {
    ctx: PullContext,
}

impl PullJob {
    pub fn new(
        query: TransferQuery,
        peers: Peers,
        archive: Arc<dyn Archive>,
        config: &TransfersConfig,
    ) -> Result<Self> {
        if !peers.directory().contains(query.peer()) {
            return Err(CaravelError::UnknownResource(format!(
                "unknown peer: {}",
                query.peer()
            )));
        }

        Ok(Self {
            ctx: PullContext {
                query,
                peers,
                archive,
                threads: config.threads,
                target_bucket_size: config.bucket_size_bytes(),
                max_retries: config.max_http_retries,
            },
        })
    }
}

impl StatefulJob for PullJob {
    fn job_type(&self) -> &'static str {
        JOB_TYPE_PULL
    }

    fn serialized(&self) -> Value {
        self.ctx.query.serialized()
    }

    fn create_initial_state(&self, info: &mut JobInfo) -> Result<Box<dyn JobState>> {
        let query = &self.ctx.query;
        if let Some(originator) = query.originator() {
            info.set_content("Originator", originator);
        }
        info.set_content("Resources", query.resources_json());
        info.set_content("Peer", query.peer());
        info.set_content("Compression", query.compression().as_str());

        Ok(Box::new(LookupInstancesState {
            ctx: self.ctx.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::jobs::harness::{JobDriver, StepStatus};
    use crate::testutil::{scripted_peer, single_peer_directory};

    fn pull_query(compression: BucketCompression) -> TransferQuery {
        TransferQuery::parse(&serde_json::json!({
            "Peer": "remote",
            "Resources": [{"Level": "Study", "ID": "st"}],
            "Compression": compression.as_str(),
        }))
        .unwrap()
    }

    fn drive_to_end(driver: &mut JobDriver) -> StepStatus {
        for _ in 0..1000 {
            match driver.step() {
                StepStatus::Continue => continue,
                done => return done,
            }
        }
        panic!("job did not settle");
    }

    fn config() -> TransfersConfig {
        TransfersConfig {
            threads: 1,
            ..TransfersConfig::default()
        }
    }

    #[test]
    fn unknown_peer_is_rejected_at_construction() {
        let peers = Peers::new(single_peer_directory("remote", "http://localhost:1"));
        let archive: Arc<dyn Archive> = Arc::new(MemoryArchive::new());

        let query = TransferQuery::parse(&serde_json::json!({
            "Peer": "stranger",
            "Resources": [],
            "Compression": "none",
        }))
        .unwrap();

        assert!(matches!(
            PullJob::new(query, peers, archive, &config()),
            Err(CaravelError::UnknownResource(_))
        ));
    }

    #[test]
    fn empty_lookup_succeeds_without_transferring() {
        let lookup = serde_json::json!({"Instances": [], "Originator": "node-a"});
        let (url, hits) = scripted_peer(vec![(200, lookup.to_string().into_bytes())]);

        let peers = Peers::new(single_peer_directory("remote", &url));
        let archive: Arc<dyn Archive> = Arc::new(MemoryArchive::new());
        let job = PullJob::new(pull_query(BucketCompression::None), peers, archive, &config())
            .unwrap();

        let mut driver = JobDriver::new(Box::new(job));
        assert_eq!(drive_to_end(&mut driver), StepStatus::Success);
        assert_eq!(driver.info().progress(), 1.0);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn mismatched_originator_fails_the_job() {
        let lookup = serde_json::json!({"Instances": [], "Originator": "somebody-else"});
        let (url, _) = scripted_peer(vec![(200, lookup.to_string().into_bytes())]);

        let peers = Peers::new(single_peer_directory("remote", &url));
        let archive: Arc<dyn Archive> = Arc::new(MemoryArchive::new());
        let query = pull_query(BucketCompression::None).with_originator("node-b");
        let job = PullJob::new(query, peers, archive, &config()).unwrap();

        let mut driver = JobDriver::new(Box::new(job));
        assert_eq!(drive_to_end(&mut driver), StepStatus::Failure);
    }

    #[test]
    fn malformed_lookup_answer_fails_the_job() {
        let (url, _) = scripted_peer(vec![(200, b"{\"Instances\": 5}".to_vec())]);

        let peers = Peers::new(single_peer_directory("remote", &url));
        let archive: Arc<dyn Archive> = Arc::new(MemoryArchive::new());
        let job = PullJob::new(pull_query(BucketCompression::None), peers, archive, &config())
            .unwrap();

        let mut driver = JobDriver::new(Box::new(job));
        assert_eq!(drive_to_end(&mut driver), StepStatus::Failure);
    }

    #[test]
    fn pulls_buckets_and_commits_into_the_archive() {
        let s1 = b"Hello".to_vec();
        let s2 = b"Hello, World!".to_vec();
        let d1 = InstanceInfo::from_content("d1", &s1);
        let d2 = InstanceInfo::from_content("d2", &s2);

        let lookup = serde_json::json!({
            "Instances": [d1, d2],
            "Originator": "node-a",
        });

        // Both instances are small against the default bucket size, so
        // the planner groups them into a single bucket: d1 then d2.
        let payload = [s1.clone(), s2.clone()].concat();
        let (url, hits) = scripted_peer(vec![
            (200, lookup.to_string().into_bytes()),
            (200, payload),
        ]);

        let peers = Peers::new(single_peer_directory("remote", &url));
        let archive = Arc::new(MemoryArchive::new());
        let job = PullJob::new(
            pull_query(BucketCompression::None),
            peers,
            Arc::clone(&archive) as Arc<dyn Archive>,
            &config(),
        )
        .unwrap();

        let mut driver = JobDriver::new(Box::new(job));
        assert_eq!(drive_to_end(&mut driver), StepStatus::Success);

        assert_eq!(archive.instance_count(), 2);
        let ids = archive.instance_ids();
        let stored: Vec<Vec<u8>> = ids
            .iter()
            .map(|id| archive.read_instance(id).unwrap())
            .collect();
        assert!(stored.contains(&s1));
        assert!(stored.contains(&s2));

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 2);
        let content = driver.info().content();
        assert_eq!(content["TotalInstances"], 2);
        assert_eq!(content["CompletedHttpQueries"], 1);
    }

    #[test]
    fn gzip_buckets_are_inflated_before_scattering() {
        let s1 = b"compressible compressible compressible".to_vec();
        let d1 = InstanceInfo::from_content("d1", &s1);

        let lookup = serde_json::json!({"Instances": [d1], "Originator": "node-a"});
        let payload = crate::compress::gzip_compress(&s1).unwrap();
        let (url, _) = scripted_peer(vec![
            (200, lookup.to_string().into_bytes()),
            (200, payload),
        ]);

        let peers = Peers::new(single_peer_directory("remote", &url));
        let archive = Arc::new(MemoryArchive::new());
        let job = PullJob::new(
            pull_query(BucketCompression::Gzip),
            peers,
            Arc::clone(&archive) as Arc<dyn Archive>,
            &config(),
        )
        .unwrap();

        let mut driver = JobDriver::new(Box::new(job));
        assert_eq!(drive_to_end(&mut driver), StepStatus::Success);
        assert_eq!(archive.instance_count(), 1);
    }

    #[test]
    fn corrupted_bucket_payload_fails_the_job() {
        let s1 = b"Hello".to_vec();
        let d1 = InstanceInfo::from_content("d1", &s1);

        let lookup = serde_json::json!({"Instances": [d1], "Originator": "node-a"});
        let (url, _) = scripted_peer(vec![
            (200, lookup.to_string().into_bytes()),
            (200, b"Hellx".to_vec()),
        ]);

        let peers = Peers::new(single_peer_directory("remote", &url));
        let archive = Arc::new(MemoryArchive::new());
        let job = PullJob::new(
            pull_query(BucketCompression::None),
            peers,
            Arc::clone(&archive) as Arc<dyn Archive>,
            &config(),
        )
        .unwrap();

        let mut driver = JobDriver::new(Box::new(job));
        // The payload length matches but the digest cannot: the commit
        // refuses the reassembled instance.
        assert_eq!(drive_to_end(&mut driver), StepStatus::Failure);
        assert_eq!(archive.instance_count(), 0);
    }
}
