//! Push transfer: open a transaction on the receiving peer, stream the
//! planned buckets over parallel PUTs reading from the local instance
//! cache, then commit (or abort) the remote transaction.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::error;

use caravel_types::{
    to_megabytes, BucketCompression, CaravelError, Result, TransferBucket, JOB_TYPE_PUSH, URI_PUSH,
};

use crate::cache::InstancesCache;
use crate::compress::gzip_compress;
use crate::config::TransfersConfig;
use crate::jobs::harness::{JobInfo, JobState, StateUpdate, StatefulJob, StopReason};
use crate::jobs::query::TransferQuery;
use crate::peers::{delete_peer_with_retry, post_peer_with_retry, Peers};
use crate::planner::TransferPlanner;
use crate::queue::{HttpQueriesQueue, HttpQuery, QueryMethod, QueueStatus};
use crate::runner::QueriesRunner;

#[derive(Clone)]
struct PushContext {
    query: TransferQuery,
    peers: Peers,
    cache: Arc<InstancesCache>,
    threads: usize,
    target_bucket_size: u64,
    max_retries: u32,
}

/// PUT one bucket into the remote transaction, reading the chunk bytes
/// from the local instance cache.
struct BucketPushQuery {
    cache: Arc<InstancesCache>,
    bucket: TransferBucket,
    peer: String,
    uri: String,
    compression: BucketCompression,
}

impl HttpQuery for BucketPushQuery {
    fn method(&self) -> QueryMethod {
        QueryMethod::Put
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn read_body(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.bucket.total_size() as usize);

        for index in 0..self.bucket.chunk_count() {
            let (chunk, _md5) = self.cache.bucket_chunk(&self.bucket, index)?;
            body.extend_from_slice(&chunk);
        }

        match self.compression {
            BucketCompression::None => Ok(body),
            BucketCompression::Gzip => gzip_compress(&body),
        }
    }

    fn handle_answer(&self, _answer: &[u8]) -> Result<()> {
        Err(CaravelError::Internal("a push query expects no answer".into()))
    }
}

/// Plan the buckets and open the transaction on the receiving peer.
struct CreateTransactionState {
    ctx: PushContext,
    manifest: Vec<u8>,
    buckets: Vec<TransferBucket>,
}

impl CreateTransactionState {
    fn new(ctx: PushContext, info: &mut JobInfo) -> Result<Self> {
        let mut planner = TransferPlanner::new();
        planner.add_resources(&ctx.cache, ctx.query.resources())?;

        let (manifest, buckets) = planner.format_push_manifest(
            ctx.target_bucket_size,
            2 * ctx.target_bucket_size,
            ctx.query.compression(),
        )?;

        info.set_content("TotalInstances", planner.instance_count() as u64);
        info.set_content("TotalSizeMB", to_megabytes(planner.total_size()));

        let manifest = serde_json::to_vec(&manifest)
            .map_err(|e| CaravelError::Internal(format!("serialising push manifest: {e}")))?;

        Ok(Self {
            ctx,
            manifest,
            buckets,
        })
    }
}

impl JobState for CreateTransactionState {
    fn step(&mut self, _info: &mut JobInfo) -> Result<StateUpdate> {
        let peer = self.ctx.query.peer();

        let Some(answer) = post_peer_with_retry(
            &self.ctx.peers,
            peer,
            URI_PUSH,
            &self.manifest,
            self.ctx.max_retries,
        ) else {
            error!(
                peer,
                "cannot create a push transaction \
                 (check that the peer runs the transfer service)"
            );
            return Ok(StateUpdate::Failure);
        };

        let Some(transaction_uri) = answer.get("Path").and_then(Value::as_str) else {
            error!(peer, "bad network protocol in the push transaction answer");
            return Ok(StateUpdate::Failure);
        };

        Ok(StateUpdate::Next(Box::new(PushBucketsState::new(
            self.ctx.clone(),
            transaction_uri,
            std::mem::take(&mut self.buckets),
        ))))
    }

    fn stop(&mut self, _reason: StopReason) {}
}

/// Stream the buckets into the remote transaction.
struct PushBucketsState {
    ctx: PushContext,
    transaction_uri: String,
    queue: Arc<HttpQueriesQueue>,
    runner: Option<QueriesRunner>,
}

impl PushBucketsState {
    fn new(ctx: PushContext, transaction_uri: &str, buckets: Vec<TransferBucket>) -> Self {
        let queue = Arc::new(HttpQueriesQueue::new(ctx.peers.clone()));
        queue.set_max_retries(ctx.max_retries);

        for (index, bucket) in buckets.into_iter().enumerate() {
            queue.enqueue(Arc::new(BucketPushQuery {
                cache: Arc::clone(&ctx.cache),
                bucket,
                peer: ctx.query.peer().to_string(),
                uri: format!("{transaction_uri}/{index}"),
                compression: ctx.query.compression(),
            }));
        }

        Self {
            ctx,
            transaction_uri: transaction_uri.to_string(),
            queue,
            runner: None,
        }
    }

    fn update_info(&self, info: &mut JobInfo) {
        let stats = self.queue.statistics();

        info.set_content("UploadedSizeMB", to_megabytes(stats.uploaded_size));
        info.set_content("CompletedHttpQueries", stats.succeeded as u64);

        if let Some(runner) = &self.runner {
            info.set_content("NetworkSpeedKBs", runner.speed_kbps() as u64);
        }

        // The two extra steps are the transaction creation before us
        // and the finalisation after us.
        info.set_progress((1 + stats.succeeded) as f32 / (2 + stats.scheduled) as f32);
    }

    fn finalise(&self, commit: bool) -> StateUpdate {
        StateUpdate::Next(Box::new(FinalState {
            ctx: self.ctx.clone(),
            transaction_uri: self.transaction_uri.clone(),
            commit,
        }))
    }
}

impl JobState for PushBucketsState {
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
            // Commit the transaction on the receiving peer
            QueueStatus::Success => Ok(self.finalise(true)),
            // Abort the transaction on the receiving peer
            QueueStatus::Failure => Ok(self.finalise(false)),
        }
    }

    fn stop(&mut self, _reason: StopReason) {
        // Cancel the running upload workers
        self.runner = None;
    }
}

/// Commit or abort the remote transaction. An abort always surfaces
/// the job as failed.
struct FinalState {
    ctx: PushContext,
    transaction_uri: String,
    commit: bool,
}

impl JobState for FinalState {
    fn step(&mut self, _info: &mut JobInfo) -> Result<StateUpdate> {
        let peer = self.ctx.query.peer();

        if self.commit {
            let uri = format!("{}/commit", self.transaction_uri);
            if post_peer_with_retry(&self.ctx.peers, peer, &uri, b"", self.ctx.max_retries)
                .is_none()
            {
                error!(peer, "cannot commit the push transaction on the remote peer");
                return Ok(StateUpdate::Failure);
            }
            Ok(StateUpdate::Success)
        } else {
            delete_peer_with_retry(
                &self.ctx.peers,
                peer,
                &self.transaction_uri,
                self.ctx.max_retries,
            );
            Ok(StateUpdate::Failure)
        }
    }

    fn stop(&mut self, _reason: StopReason) {}
}

/// Push job: `CreateTransaction → PushBuckets → Final`.
pub struct PushJob {
    ctx: PushContext,
}

impl PushJob {
    pub fn new(
        query: TransferQuery,
        peers: Peers,
        cache: Arc<InstancesCache>,
        config: &TransfersConfig,
    ) -> Result<Self> {
        if !peers.directory().contains(query.peer()) {
            return Err(CaravelError::UnknownResource(format!(
                "unknown peer: {}",
                query.peer()
            )));
        }

        Ok(Self {
            ctx: PushContext {
                query,
                peers,
                cache,
                threads: config.threads,
                target_bucket_size: config.bucket_size_bytes(),
                max_retries: config.max_http_retries,
            },
        })
    }
}

impl StatefulJob for PushJob {
    fn job_type(&self) -> &'static str {
        JOB_TYPE_PUSH
    }

    fn serialized(&self) -> Value {
        self.ctx.query.serialized()
    }

    fn create_initial_state(&self, info: &mut JobInfo) -> Result<Box<dyn JobState>> {
        let query = &self.ctx.query;
        info.set_content("Resources", query.resources_json());
        info.set_content("Peer", query.peer());
        info.set_content("Compression", query.compression().as_str());

        Ok(Box::new(CreateTransactionState::new(
            self.ctx.clone(),
            info,
        )?))
    }
}
