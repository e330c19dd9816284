//! Fixed-size worker pool draining an [`HttpQueriesQueue`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use caravel_types::{CaravelError, Result};

use crate::queue::HttpQueriesQueue;

struct TrafficStats {
    total_traffic: u64,
    last_update: Instant,
}

/// Runs `threads` workers against a queue until it is drained or
/// failed. Dropping the runner stops the pool: workers observe the stop
/// flag between requests, so no new HTTP call is started, but a call
/// already on the wire finishes first.
pub struct QueriesRunner {
    keep_running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    start: Instant,
    stats: Arc<Mutex<TrafficStats>>,
}

impl QueriesRunner {
    pub fn new(queue: Arc<HttpQueriesQueue>, threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(CaravelError::ParameterOutOfRange(
                "a query runner needs at least one worker".into(),
            ));
        }

        let start = Instant::now();
        let keep_running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(TrafficStats {
            total_traffic: 0,
            last_update: start,
        }));

        let workers = (0..threads)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let keep_running = Arc::clone(&keep_running);
                let stats = Arc::clone(&stats);

                std::thread::spawn(move || {
                    while keep_running.load(Ordering::Acquire) {
                        match queue.execute_one_query() {
                            Some(traffic) => {
                                let mut stats = stats.lock().unwrap();
                                stats.total_traffic += traffic;
                                stats.last_update = Instant::now();
                            }
                            // Done: either failure or no more pending queries
                            None => return,
                        }
                    }
                })
            })
            .collect();

        Ok(Self {
            keep_running,
            workers,
            start,
            stats,
        })
    }

    /// Average transfer speed in kB/s, clamped to zero on transfers too
    /// short to measure.
    pub fn speed_kbps(&self) -> f64 {
        let stats = self.stats.lock().unwrap();
        let elapsed_ms = stats
            .last_update
            .duration_since(self.start)
            .as_millis() as f64;

        if elapsed_ms < 10.0 {
            0.0
        } else {
            stats.total_traffic as f64 * 1000.0 / (1024.0 * elapsed_ms)
        }
    }
}

impl Drop for QueriesRunner {
    fn drop(&mut self) {
        self.keep_running.store(false, Ordering::Release);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::Peers;
    use crate::queue::{HttpQuery, QueryMethod, QueueStatus};
    use crate::testutil::{counting_peer, single_peer_directory, CannedResponse};
    use std::sync::atomic::AtomicUsize;

    struct Fetch {
        uri: String,
        handled: Arc<AtomicUsize>,
    }

    impl HttpQuery for Fetch {
        fn method(&self) -> QueryMethod {
            QueryMethod::Get
        }

        fn peer(&self) -> &str {
            "peer"
        }

        fn uri(&self) -> &str {
            &self.uri
        }

        fn read_body(&self) -> Result<Vec<u8>> {
            Err(CaravelError::Internal("GET has no body".into()))
        }

        fn handle_answer(&self, _answer: &[u8]) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn run_pool(threads: usize, queries: usize) {
        let (url, hits) = counting_peer(CannedResponse::ok(b"payload"), queries);
        let queue = Arc::new(HttpQueriesQueue::new(Peers::new(single_peer_directory(
            "peer", &url,
        ))));

        let handled = Arc::new(AtomicUsize::new(0));
        for i in 0..queries {
            queue.enqueue(Arc::new(Fetch {
                uri: format!("/q/{i}"),
                handled: Arc::clone(&handled),
            }));
        }

        let runner = QueriesRunner::new(Arc::clone(&queue), threads).unwrap();
        assert_eq!(queue.wait_complete_blocking(), QueueStatus::Success);
        drop(runner);

        let stats = queue.statistics();
        assert_eq!(stats.succeeded, queries);
        assert_eq!(stats.downloaded_size, 7 * queries as u64);
        assert_eq!(handled.load(Ordering::SeqCst), queries);
        assert_eq!(hits.load(Ordering::SeqCst), queries);
    }

    #[test]
    fn drains_the_queue_with_one_worker() {
        run_pool(1, 5);
    }

    #[test]
    fn drains_the_queue_with_many_workers() {
        for threads in [2, 4, 8, 32] {
            run_pool(threads, 3 * threads);
        }
    }

    #[test]
    fn zero_workers_is_rejected() {
        let (url, _) = counting_peer(CannedResponse::ok(b""), 0);
        let queue = Arc::new(HttpQueriesQueue::new(Peers::new(single_peer_directory(
            "peer", &url,
        ))));
        assert!(QueriesRunner::new(queue, 0).is_err());
    }

    #[test]
    fn failure_is_reported_exactly_once() {
        let (url, _) = counting_peer(CannedResponse::error(503), 1);
        let queue = Arc::new(HttpQueriesQueue::new(Peers::new(single_peer_directory(
            "peer", &url,
        ))));

        let handled = Arc::new(AtomicUsize::new(0));
        for i in 0..6 {
            queue.enqueue(Arc::new(Fetch {
                uri: format!("/q/{i}"),
                handled: Arc::clone(&handled),
            }));
        }

        let runner = QueriesRunner::new(Arc::clone(&queue), 4).unwrap();
        assert_eq!(queue.wait_complete_blocking(), QueueStatus::Failure);
        drop(runner);

        assert_eq!(queue.status(), QueueStatus::Failure);
        let stats = queue.statistics();
        assert!(stats.succeeded < stats.scheduled);
    }

    #[test]
    fn speed_is_clamped_on_very_short_transfers() {
        let (url, _) = counting_peer(CannedResponse::ok(b""), 0);
        let queue = Arc::new(HttpQueriesQueue::new(Peers::new(single_peer_directory(
            "peer", &url,
        ))));
        let runner = QueriesRunner::new(queue, 1).unwrap();
        assert_eq!(runner.speed_kbps(), 0.0);
    }

    #[test]
    fn retries_eventually_succeed_under_injected_failures() {
        // 3 failures spread over 4 queries, each with enough budget
        let (url, hits) = counting_peer(CannedResponse::flaky(3, b"x"), 16);
        let queue = Arc::new(HttpQueriesQueue::new(Peers::new(single_peer_directory(
            "peer", &url,
        ))));
        queue.set_max_retries(3);

        let handled = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            queue.enqueue(Arc::new(Fetch {
                uri: format!("/q/{i}"),
                handled: Arc::clone(&handled),
            }));
        }

        let runner = QueriesRunner::new(Arc::clone(&queue), 2).unwrap();
        assert_eq!(queue.wait_complete_blocking(), QueueStatus::Success);
        drop(runner);

        assert_eq!(handled.load(Ordering::SeqCst), 4);
        assert_eq!(hits.load(Ordering::SeqCst), 4 + 3);
    }
}
