//! FIFO queue of typed HTTP requests, executed by the worker pool of
//! [`crate::runner::QueriesRunner`].
//!
//! The queue owns its requests and a strictly-increasing dispatch
//! cursor. Workers take the request at the cursor, perform it outside
//! the lock, and retry the same request with a fixed backoff until the
//! retry budget is spent. The first exhausted request fails the whole
//! queue; the remaining workers drain out without starting new calls.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use caravel_types::Result;

use crate::peers::{Peers, RETRY_DELAY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// One closed HTTP request of a transfer.
///
/// `read_body` is consulted for PUT/POST requests before the first
/// attempt; `handle_answer` runs on the GET/POST answer after a
/// successful exchange. Implementations are shared between workers and
/// synchronise internally where needed.
pub trait HttpQuery: Send + Sync {
    fn method(&self) -> QueryMethod;

    fn peer(&self) -> &str;

    fn uri(&self) -> &str;

    /// Body of a PUT/POST request.
    fn read_body(&self) -> Result<Vec<u8>>;

    /// Consume the answer of a GET/POST request.
    fn handle_answer(&self, answer: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Running,
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStatistics {
    pub scheduled: usize,
    pub succeeded: usize,
    pub downloaded_size: u64,
    pub uploaded_size: u64,
}

struct QueueState {
    queries: Vec<Arc<dyn HttpQuery>>,
    max_retries: u32,
    position: usize,
    succeeded: usize,
    downloaded_size: u64,
    uploaded_size: u64,
    is_failure: bool,
}

impl QueueState {
    fn status(&self) -> QueueStatus {
        if self.succeeded == self.queries.len() {
            QueueStatus::Success
        } else if self.is_failure {
            QueueStatus::Failure
        } else {
            QueueStatus::Running
        }
    }
}

/// Thread-safe FIFO of HTTP requests with completion signalling.
pub struct HttpQueriesQueue {
    peers: Peers,
    state: Mutex<QueueState>,
    completed: Condvar,
}

impl HttpQueriesQueue {
    pub fn new(peers: Peers) -> Self {
        Self {
            peers,
            state: Mutex::new(QueueState {
                queries: Vec::new(),
                max_retries: 0,
                position: 0,
                succeeded: 0,
                downloaded_size: 0,
                uploaded_size: 0,
                is_failure: false,
            }),
            completed: Condvar::new(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.state.lock().unwrap().max_retries
    }

    pub fn set_max_retries(&self, max_retries: u32) {
        self.state.lock().unwrap().max_retries = max_retries;
    }

    pub fn enqueue(&self, query: Arc<dyn HttpQuery>) {
        self.state.lock().unwrap().queries.push(query);
    }

    pub fn status(&self) -> QueueStatus {
        self.state.lock().unwrap().status()
    }

    pub fn statistics(&self) -> QueueStatistics {
        let state = self.state.lock().unwrap();
        QueueStatistics {
            scheduled: state.queries.len(),
            succeeded: state.succeeded,
            downloaded_size: state.downloaded_size,
            uploaded_size: state.uploaded_size,
        }
    }

    /// Take and execute the request at the cursor.
    ///
    /// Returns the network traffic of a successful exchange, or `None`
    /// when the worker should exit (queue exhausted or failed).
    pub fn execute_one_query(&self) -> Option<u64> {
        let (query, max_retries) = {
            let mut state = self.state.lock().unwrap();
            if state.is_failure || state.position == state.queries.len() {
                return None;
            }
            let query = Arc::clone(&state.queries[state.position]);
            state.position += 1;
            (query, state.max_retries)
        };

        let method = query.method();

        // The body is read once; retries resend the same bytes.
        let body = match method {
            QueryMethod::Post | QueryMethod::Put => match query.read_body() {
                Ok(body) => body,
                Err(e) => {
                    warn!(peer = query.peer(), uri = query.uri(), "cannot prepare request body: {e}");
                    self.fail();
                    return None;
                }
            },
            _ => Vec::new(),
        };

        let mut retry = 0u32;

        loop {
            let outcome = match method {
                QueryMethod::Get => self.peers.do_get(query.peer(), query.uri()).map(Some),
                QueryMethod::Post => self
                    .peers
                    .do_post(query.peer(), query.uri(), &body)
                    .map(Some),
                QueryMethod::Put => self
                    .peers
                    .do_put(query.peer(), query.uri(), &body)
                    .map(|_| None),
                QueryMethod::Delete => self.peers.do_delete(query.peer(), query.uri()).map(|_| None),
            };

            match outcome {
                Ok(answer) => {
                    let downloaded = answer.as_ref().map_or(0, |a| a.len() as u64);

                    if let Some(answer) = answer {
                        if let Err(e) = query.handle_answer(&answer) {
                            // A bad payload is not a transient network
                            // condition; retrying cannot help.
                            warn!(peer = query.peer(), uri = query.uri(), "invalid answer from peer: {e}");
                            self.fail();
                            return None;
                        }
                    }

                    let uploaded = match method {
                        QueryMethod::Post | QueryMethod::Put => body.len() as u64,
                        _ => 0,
                    };

                    let mut state = self.state.lock().unwrap();
                    state.downloaded_size += downloaded;
                    state.uploaded_size += uploaded;
                    state.succeeded += 1;
                    if state.succeeded == state.queries.len() {
                        self.completed.notify_all();
                    }

                    return Some(downloaded + uploaded);
                }

                Err(e) => {
                    retry += 1;
                    if retry <= max_retries {
                        warn!(
                            peer = query.peer(),
                            uri = query.uri(),
                            "HTTP query failed (attempt {retry}/{max_retries}), retrying: {e}"
                        );
                        std::thread::sleep(RETRY_DELAY);
                    } else {
                        info!(
                            peer = query.peer(),
                            uri = query.uri(),
                            "reached the maximum number of retries for an HTTP query: {e}"
                        );
                        self.fail();
                        return None;
                    }
                }
            }
        }
    }

    fn fail(&self) {
        let mut state = self.state.lock().unwrap();
        state.is_failure = true;
        self.completed.notify_all();
    }

    /// Wait for completion for at most `timeout`, returning the status
    /// observed when the wait ends.
    pub fn wait_complete(&self, timeout: Duration) -> QueueStatus {
        let state = self.state.lock().unwrap();
        if state.status() != QueueStatus::Running {
            return state.status();
        }

        let (state, _) = self.completed.wait_timeout(state, timeout).unwrap();
        state.status()
    }

    /// Block until the queue is no longer running.
    pub fn wait_complete_blocking(&self) -> QueueStatus {
        let mut state = self.state.lock().unwrap();
        while state.status() == QueueStatus::Running {
            let (next, _) = self
                .completed
                .wait_timeout(state, Duration::from_millis(200))
                .unwrap();
            state = next;
        }
        state.status()
    }
}
