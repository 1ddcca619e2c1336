//! Two-level cooperative concurrency lanes.
//!
//! Every turn acquires its session lane (default width 1, strict
//! serialization of a conversation) and then the global lane (bounded
//! concurrency across all sessions). Session lanes are created lazily in an
//! arena and retired on session deletion. Slots release on completion,
//! error, cancellation, or timeout; a timeout cancels the task through its
//! token and returns a timeout error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use valet_domain::error::{Error, Result};

use crate::cancel::CancelToken;

const DEFAULT_SESSION_CONCURRENCY: usize = 1;
const DEFAULT_GLOBAL_CONCURRENCY: usize = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lane
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Lane {
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_concurrent: usize,
}

impl Lane {
    fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            queued: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
        }
    }

    fn stats(&self, name: &str) -> QueueStats {
        QueueStats {
            name: name.to_owned(),
            queued: self.queued.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            max_concurrent: self.max_concurrent,
        }
    }
}

/// Counter that decrements on drop, so bookkeeping survives timeouts that
/// drop the task mid-flight.
struct CounterGuard(Arc<AtomicUsize>);

impl CounterGuard {
    fn increment(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot of one lane, exposed via `agent.queue.status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub name: String,
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LaneArena {
    lanes: Vec<Lane>,
    by_session: HashMap<String, usize>,
    free: Vec<usize>,
}

pub struct QueueManager {
    global: Lane,
    session_concurrency: usize,
    arena: Mutex<LaneArena>,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CONCURRENCY, DEFAULT_GLOBAL_CONCURRENCY)
    }
}

impl QueueManager {
    pub fn new(session_concurrency: usize, global_concurrency: usize) -> Self {
        Self {
            global: Lane::new(global_concurrency),
            session_concurrency,
            arena: Mutex::new(LaneArena {
                lanes: Vec::new(),
                by_session: HashMap::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Handles of a session's lane, created lazily.
    fn session_lane(&self, session_id: &str) -> (Arc<Semaphore>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let mut arena = self.arena.lock();
        let index = match arena.by_session.get(session_id) {
            Some(&index) => index,
            None => {
                let lane = Lane::new(self.session_concurrency);
                let index = match arena.free.pop() {
                    Some(slot) => {
                        arena.lanes[slot] = lane;
                        slot
                    }
                    None => {
                        arena.lanes.push(lane);
                        arena.lanes.len() - 1
                    }
                };
                arena.by_session.insert(session_id.to_owned(), index);
                index
            }
        };
        let lane = &arena.lanes[index];
        (
            lane.semaphore.clone(),
            lane.queued.clone(),
            lane.active.clone(),
        )
    }

    /// Retire a session's lane (called on session deletion).
    pub fn retire_session(&self, session_id: &str) {
        let mut arena = self.arena.lock();
        if let Some(index) = arena.by_session.remove(session_id) {
            arena.free.push(index);
        }
    }

    /// Run `task` holding both the session and the global lane slots.
    ///
    /// Either gate may block the caller. On timeout the task is cancelled
    /// through its token and a timeout error returned; slots release in all
    /// exit paths.
    pub async fn enqueue_both<T, F>(
        &self,
        session_id: &str,
        timeout: Option<Duration>,
        cancel: &CancelToken,
        task: F,
    ) -> Result<T>
    where
        F: Future<Output = T> + Send,
        T: Send,
    {
        let (session_sem, session_queued, session_active) = self.session_lane(session_id);

        let run = async {
            let _session_wait = CounterGuard::increment(&session_queued);
            let session_permit = session_sem
                .acquire_owned()
                .await
                .map_err(|_| Error::Other("session lane closed".into()))?;
            drop(_session_wait);

            let _global_wait = CounterGuard::increment(&self.global.queued);
            let global_permit = self
                .global
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Other("global lane closed".into()))?;
            drop(_global_wait);

            let session_slot = CounterGuard::increment(&session_active);
            let global_slot = CounterGuard::increment(&self.global.active);

            let result = task.await;

            // Counters drop before the permits so `active` never reads
            // above the lane bound.
            drop(global_slot);
            drop(session_slot);
            drop(global_permit);
            drop(session_permit);
            Ok(result)
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    Err(Error::Timeout(format!(
                        "queued task for session {session_id} exceeded {limit:?}"
                    )))
                }
            },
            None => run.await,
        }
    }

    /// Stats for the global lane plus every live session lane.
    pub fn stats(&self) -> Vec<QueueStats> {
        let mut out = vec![self.global.stats("global")];
        let arena = self.arena.lock();
        let mut sessions: Vec<(&String, &usize)> = arena.by_session.iter().collect();
        sessions.sort();
        for (session_id, &index) in sessions {
            out.push(arena.lanes[index].stats(session_id));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serializes_same_session() {
        let queue = Arc::new(QueueManager::new(1, 5));
        let order = Arc::new(Mutex::new(Vec::new()));

        let queue1 = queue.clone();
        let order1 = order.clone();
        let first = tokio::spawn(async move {
            queue1
                .enqueue_both("s1", None, &CancelToken::new(), async {
                    order1.lock().push("first-start");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    order1.lock().push("first-end");
                })
                .await
                .unwrap();
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        let queue2 = queue.clone();
        let order2 = order.clone();
        let second = tokio::spawn(async move {
            queue2
                .enqueue_both("s1", None, &CancelToken::new(), async {
                    order2.lock().push("second-start");
                })
                .await
                .unwrap();
        });

        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(
            *order.lock(),
            vec!["first-start", "first-end", "second-start"]
        );
    }

    #[tokio::test]
    async fn different_sessions_run_concurrently() {
        let queue = Arc::new(QueueManager::new(1, 5));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..3 {
            let queue = queue.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue_both(&format!("s{i}"), None, &CancelToken::new(), async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn global_lane_bounds_concurrency() {
        let queue = Arc::new(QueueManager::new(1, 2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..6 {
            let queue = queue.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue_both(&format!("s{i}"), None, &CancelToken::new(), async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn timeout_cancels_and_reports() {
        let queue = QueueManager::new(1, 5);
        let cancel = CancelToken::new();

        let result = queue
            .enqueue_both(
                "s1",
                Some(Duration::from_millis(20)),
                &cancel,
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                },
            )
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(cancel.is_cancelled());

        // Slots released: a follow-up task runs immediately.
        let ok = queue
            .enqueue_both("s1", Some(Duration::from_millis(500)), &CancelToken::new(), async {
                42
            })
            .await
            .unwrap();
        assert_eq!(ok, 42);
    }

    #[tokio::test]
    async fn stats_expose_lanes() {
        let queue = QueueManager::new(1, 5);
        queue
            .enqueue_both("s1", None, &CancelToken::new(), async {})
            .await
            .unwrap();

        let stats = queue.stats();
        assert_eq!(stats[0].name, "global");
        assert_eq!(stats[0].max_concurrent, 5);
        assert_eq!(stats[0].active, 0);
        assert!(stats.iter().any(|s| s.name == "s1"));
    }

    #[tokio::test]
    async fn retired_lane_slot_is_reused() {
        let queue = QueueManager::new(1, 5);
        queue
            .enqueue_both("s1", None, &CancelToken::new(), async {})
            .await
            .unwrap();
        queue.retire_session("s1");
        queue
            .enqueue_both("s2", None, &CancelToken::new(), async {})
            .await
            .unwrap();

        let arena = queue.arena.lock();
        assert_eq!(arena.lanes.len(), 1);
        assert!(arena.by_session.contains_key("s2"));
    }
}
