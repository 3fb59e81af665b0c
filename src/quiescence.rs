//! Quiescence Monitor (QM): declares a study complete a configurable number
//! of seconds after its most recent C-STORE.
//!
//! Grounded in `original_source/dicom_receiver/core/storage.py`'s
//! `StudyMonitor`: a lock-guarded activity table, a 1-second poll loop that
//! moves timed-out studies into a finalisation batch under the lock, then
//! invokes registered callbacks outside the lock. The background loop here
//! follows the `tokio::select!` / `CancellationToken` shutdown idiom the
//! `dimse` crate's `DimseScp::run` uses, in place of the source's daemon
//! thread.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const POLL_PERIOD: Duration = Duration::from_secs(1);

type Callback = Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct State {
    last_activity: HashMap<String, Instant>,
    active: std::collections::HashSet<String>,
}

/// Tracks per-study activity and fires registered callbacks once a study has
/// gone quiet for `timeout`.
pub struct QuiescenceMonitor {
    timeout: Duration,
    state: Mutex<State>,
    callbacks: Mutex<Vec<Callback>>,
}

impl QuiescenceMonitor {
    pub fn new(timeout_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            timeout: Duration::from_secs(timeout_secs),
            state: Mutex::new(State {
                last_activity: HashMap::new(),
                active: std::collections::HashSet::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    /// Idempotent update of a study's last-activity timestamp; marks it
    /// active if it wasn't already.
    pub async fn touch(&self, study_uid: &str) {
        let mut state = self.state.lock().await;
        state
            .last_activity
            .insert(study_uid.to_string(), Instant::now());
        state.active.insert(study_uid.to_string());
    }

    /// Register a callback invoked exactly once per study per activation.
    /// Callbacks for distinct studies may run concurrently or in any order;
    /// a study is removed from the active set before its callback runs, so
    /// callbacks for the same study can never overlap.
    pub async fn on_complete<F, Fut>(&self, callback: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: Callback = Arc::new(move |study_uid| Box::pin(callback(study_uid)));
        self.callbacks.lock().await.push(wrapped);
    }

    /// Run the background poll loop until `shutdown` is cancelled. Intended
    /// to be spawned as its own task.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("quiescence monitor shutting down");
                    return;
                }
                _ = tokio::time::sleep(POLL_PERIOD) => {
                    self.sweep().await;
                }
            }
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let timed_out: Vec<String> = {
            let mut state = self.state.lock().await;
            let expired: Vec<String> = state
                .last_activity
                .iter()
                .filter(|(_, last)| now.duration_since(**last) > self.timeout)
                .map(|(uid, _)| uid.clone())
                .collect();
            for uid in &expired {
                state.last_activity.remove(uid);
            }
            expired
                .into_iter()
                .filter(|uid| state.active.remove(uid))
                .collect()
        };

        if timed_out.is_empty() {
            return;
        }

        let callbacks = self.callbacks.lock().await.clone();
        for study_uid in timed_out {
            info!(study_uid = %study_uid, "study quiescent, finalising");
            for callback in &callbacks {
                let callback = Arc::clone(callback);
                let study_uid = study_uid.clone();
                tokio::spawn(async move {
                    callback(study_uid.clone()).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[tokio::test(flavor = "multi_thread")]
    async fn callback_fires_once_after_timeout() {
        let monitor = QuiescenceMonitor::new(0);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        monitor
            .on_complete(move |study_uid| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(study_uid);
                }
            })
            .await;

        monitor.touch("STUDY-A").await;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&monitor).run(shutdown.clone()));

        let completed = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("callback should fire within timeout")
            .expect("channel should not close");
        assert_eq!(completed, "STUDY-A");

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn touch_resets_the_timeout() {
        let monitor = QuiescenceMonitor::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        monitor
            .on_complete(move |_study_uid| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        monitor.touch("STUDY-B").await;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&monitor).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(600)).await;
        monitor.touch("STUDY-B").await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        let _ = handle.await;
    }
}
