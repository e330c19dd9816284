//! Minimal job scheduler driving the engine's stateful jobs.
//!
//! Each submitted job runs on its own worker thread that repeatedly
//! calls the driver's step function until it settles, publishing a
//! status snapshot after every step. The full-featured host scheduler
//! of a production deployment owns priorities and persistence; this
//! executor keeps the same contract (step, stop, serialised query) at
//! node scale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{Map, Value};
use tracing::info;

use caravel_core::jobs::{JobDriver, StepStatus, StopReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Success,
    Failure,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "Running",
            JobStatus::Success => "Success",
            JobStatus::Failure => "Failure",
            JobStatus::Canceled => "Canceled",
        }
    }
}

struct JobSnapshot {
    status: JobStatus,
    progress: f32,
    content: Map<String, Value>,
}

pub struct JobRecord {
    pub id: String,
    pub job_type: &'static str,
    pub priority: i32,
    /// Persistable form of the job (its transfer query).
    pub serialized: Value,
    snapshot: Mutex<JobSnapshot>,
    cancel: AtomicBool,
}

impl JobRecord {
    pub fn status(&self) -> (JobStatus, f32, Map<String, Value>) {
        let snapshot = self.snapshot.lock().unwrap();
        (snapshot.status, snapshot.progress, snapshot.content.clone())
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    fn publish(&self, status: JobStatus, driver: &mut JobDriver) {
        let mut snapshot = self.snapshot.lock().unwrap();
        snapshot.status = status;
        snapshot.progress = driver.info().progress();
        if let Some(content) = driver.info_mut().take_published() {
            snapshot.content = content;
        }
    }
}

/// Registry of submitted jobs, one worker thread per job.
#[derive(Default)]
pub struct JobExecutor {
    jobs: RwLock<HashMap<String, Arc<JobRecord>>>,
}

impl JobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a job and start stepping it. Returns the job identifier.
    pub fn submit(&self, mut driver: JobDriver, priority: i32) -> String {
        let id = uuid::Uuid::new_v4().to_string();

        let record = Arc::new(JobRecord {
            id: id.clone(),
            job_type: driver.job_type(),
            priority,
            serialized: driver.serialized(),
            snapshot: Mutex::new(JobSnapshot {
                status: JobStatus::Running,
                progress: 0.0,
                content: Map::new(),
            }),
            cancel: AtomicBool::new(false),
        });

        self.jobs
            .write()
            .unwrap()
            .insert(id.clone(), Arc::clone(&record));

        info!(job = %id, job_type = record.job_type, priority, "job submitted");

        std::thread::spawn(move || loop {
            if record.cancel.load(Ordering::Acquire) {
                driver.stop(StopReason::Canceled);
                record.publish(JobStatus::Canceled, &mut driver);
                info!(job = %record.id, "job canceled");
                return;
            }

            match driver.step() {
                StepStatus::Continue => {
                    record.publish(JobStatus::Running, &mut driver);
                }
                StepStatus::Success => {
                    record.publish(JobStatus::Success, &mut driver);
                    info!(job = %record.id, "job completed");
                    return;
                }
                StepStatus::Failure => {
                    record.publish(JobStatus::Failure, &mut driver);
                    info!(job = %record.id, "job failed");
                    return;
                }
            }
        });

        id
    }

    pub fn get(&self, id: &str) -> Option<Arc<JobRecord>> {
        self.jobs.read().unwrap().get(id).cloned()
    }
}
