//! Generic state-machine harness between a transfer job and the host
//! job scheduler.
//!
//! A job is a sequence of states; each scheduler step runs the current
//! state once and applies its verdict. The harness keeps the public
//! contract small: `step`, `stop`, `reset`, a progress value and a
//! JSON content object published at most once per step.

use serde_json::{Map, Value};
use tracing::error;

use caravel_types::{CaravelError, Result};

/// Why the scheduler is stopping a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Paused,
    Canceled,
    Failure,
    Success,
}

/// Verdict of one state step.
pub enum StateUpdate {
    /// Keep stepping the same state.
    Continue,
    /// Replace the state and report Continue to the scheduler.
    Next(Box<dyn JobState>),
    Success,
    Failure,
}

/// What the scheduler sees after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Continue,
    Success,
    Failure,
}

/// One state of a transfer job.
pub trait JobState: Send {
    fn step(&mut self, info: &mut JobInfo) -> Result<StateUpdate>;

    /// Release resources on cancellation. In-flight HTTP calls are
    /// allowed to finish; no new ones are started.
    fn stop(&mut self, reason: StopReason);
}

/// A job the harness can drive.
pub trait StatefulJob: Send {
    fn job_type(&self) -> &'static str;

    /// Persistable form of the job, from which it can be resubmitted.
    fn serialized(&self) -> Value;

    fn create_initial_state(&self, info: &mut JobInfo) -> Result<Box<dyn JobState>>;
}

/// Progress and content published to the scheduler, batched so each
/// step produces at most one publication.
pub struct JobInfo {
    progress: f32,
    content: Map<String, Value>,
    updated: bool,
}

impl JobInfo {
    fn new() -> Self {
        Self {
            progress: 0.0,
            content: Map::new(),
            updated: true,
        }
    }

    pub fn set_progress(&mut self, progress: f32) {
        self.progress = progress.clamp(0.0, 1.0);
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn set_content(&mut self, key: &str, value: impl Into<Value>) {
        self.content.insert(key.to_string(), value.into());
        self.updated = true;
    }

    pub fn content(&self) -> &Map<String, Value> {
        &self.content
    }

    /// The content object, if it changed since the last publication.
    pub fn take_published(&mut self) -> Option<Map<String, Value>> {
        if self.updated {
            self.updated = false;
            Some(self.content.clone())
        } else {
            None
        }
    }
}

/// Drives one job for the scheduler.
pub struct JobDriver {
    job: Box<dyn StatefulJob>,
    state: Option<Box<dyn JobState>>,
    info: JobInfo,
}

impl JobDriver {
    pub fn new(job: Box<dyn StatefulJob>) -> Self {
        Self {
            job,
            state: None,
            info: JobInfo::new(),
        }
    }

    pub fn job_type(&self) -> &'static str {
        self.job.job_type()
    }

    pub fn serialized(&self) -> Value {
        self.job.serialized()
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut JobInfo {
        &mut self.info
    }

    /// Run one scheduler step.
    ///
    /// A state error is fatal to the job: it is logged, recorded in the
    /// content object and surfaced as `Failure` with no partial state
    /// kept around.
    pub fn step(&mut self) -> StepStatus {
        let update = match self.state.as_mut() {
            None => self
                .job
                .create_initial_state(&mut self.info)
                .map(StateUpdate::Next),
            Some(state) => state.step(&mut self.info),
        };

        match update {
            Ok(StateUpdate::Continue) => StepStatus::Continue,
            Ok(StateUpdate::Next(state)) => {
                self.state = Some(state);
                StepStatus::Continue
            }
            Ok(StateUpdate::Success) => {
                self.info.set_progress(1.0);
                self.state = None;
                StepStatus::Success
            }
            Ok(StateUpdate::Failure) => {
                self.state = None;
                StepStatus::Failure
            }
            Err(e) => {
                error!(job = self.job.job_type(), "job step failed: {e}");
                self.info.set_content("Error", e.to_string());
                self.state = None;
                StepStatus::Failure
            }
        }
    }

    /// Propagate a stop to the current state. Unless the job is merely
    /// paused, the accumulated state is dropped so a resubmission
    /// starts over from the initial state.
    pub fn stop(&mut self, reason: StopReason) {
        if let Some(state) = self.state.as_mut() {
            state.stop(reason);

            if reason != StopReason::Paused {
                self.state = None;
            }
        }
    }

    /// `reset` is only valid on a stateless (post-failure) job; the
    /// scheduler calling it with live state is a protocol violation.
    pub fn reset(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(CaravelError::BadSequenceOfCalls(
                "reset of a job that still holds a state".into(),
            ));
        }
        self.info = JobInfo::new();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown {
        remaining: u32,
        verdict: fn() -> StateUpdate,
        stopped: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl JobState for Countdown {
        fn step(&mut self, info: &mut JobInfo) -> Result<StateUpdate> {
            if self.remaining > 0 {
                self.remaining -= 1;
                info.set_content("Remaining", self.remaining);
                return Ok(StateUpdate::Continue);
            }
            Ok((self.verdict)())
        }

        fn stop(&mut self, _reason: StopReason) {
            self.stopped
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    struct TestJob {
        steps: u32,
        verdict: fn() -> StateUpdate,
        stopped: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl StatefulJob for TestJob {
        fn job_type(&self) -> &'static str {
            "TestTransfer"
        }

        fn serialized(&self) -> Value {
            serde_json::json!({"Steps": self.steps})
        }

        fn create_initial_state(&self, info: &mut JobInfo) -> Result<Box<dyn JobState>> {
            info.set_content("Started", true);
            Ok(Box::new(Countdown {
                remaining: self.steps,
                verdict: self.verdict,
                stopped: self.stopped.clone(),
            }))
        }
    }

    fn driver(steps: u32, verdict: fn() -> StateUpdate) -> JobDriver {
        JobDriver::new(Box::new(TestJob {
            steps,
            verdict,
            stopped: Default::default(),
        }))
    }

    #[test]
    fn runs_to_success_and_forces_full_progress() {
        let mut driver = driver(2, || StateUpdate::Success);

        assert_eq!(driver.step(), StepStatus::Continue); // initial state
        assert_eq!(driver.step(), StepStatus::Continue);
        assert_eq!(driver.step(), StepStatus::Continue);
        assert_eq!(driver.step(), StepStatus::Success);
        assert_eq!(driver.info().progress(), 1.0);
    }

    #[test]
    fn failure_drops_the_state() {
        let mut driver = driver(0, || StateUpdate::Failure);
        assert_eq!(driver.step(), StepStatus::Continue);
        assert_eq!(driver.step(), StepStatus::Failure);

        // Stateless now: reset is legal, and stepping restarts
        driver.reset().unwrap();
        assert_eq!(driver.step(), StepStatus::Continue);
    }

    #[test]
    fn reset_with_live_state_is_a_protocol_violation() {
        let mut driver = driver(5, || StateUpdate::Success);
        assert_eq!(driver.step(), StepStatus::Continue);
        assert!(matches!(
            driver.reset(),
            Err(CaravelError::BadSequenceOfCalls(_))
        ));
    }

    #[test]
    fn non_paused_stop_drops_the_state() {
        let stopped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut driver = JobDriver::new(Box::new(TestJob {
            steps: 5,
            verdict: || StateUpdate::Success,
            stopped: stopped.clone(),
        }));

        assert_eq!(driver.step(), StepStatus::Continue);
        driver.stop(StopReason::Canceled);
        assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));

        // The state was dropped, so the next step recreates it
        driver.reset().unwrap();
        assert_eq!(driver.step(), StepStatus::Continue);
    }

    #[test]
    fn paused_stop_keeps_the_state() {
        let mut driver = driver(1, || StateUpdate::Success);
        assert_eq!(driver.step(), StepStatus::Continue);
        driver.stop(StopReason::Paused);
        assert!(driver.reset().is_err()); // state still live
    }

    #[test]
    fn content_publication_is_batched() {
        let mut driver = driver(1, || StateUpdate::Success);
        driver.step();
        let published = driver.info_mut().take_published().unwrap();
        assert_eq!(published.get("Started"), Some(&Value::Bool(true)));

        // Nothing changed since the last publication
        assert!(driver.info_mut().take_published().is_none());
    }
}
