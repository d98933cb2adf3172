//! Bounded dispatch of per-issue actions.
//!
//! The dispatcher owns the in-flight map: at most one action per issue,
//! at most `width` actions in total. Submissions that would violate
//! either bound are dropped with a diagnostic — never queued; the next
//! poll re-submits anything still needed. Every action carries a
//! cancellation token so reset and shutdown can stop it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ticket::IssueRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started,
    /// The issue already has an in-flight action.
    DroppedBusyIssue,
    /// All workers are busy; backpressure drops, the poll loop goes on.
    DroppedAtCapacity,
}

struct InFlight {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Dispatcher {
    width: usize,
    in_flight: Arc<Mutex<HashMap<IssueRef, InFlight>>>,
}

impl Dispatcher {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active_count(&self) -> usize {
        let mut map = self.in_flight.lock().expect("in-flight map poisoned");
        map.retain(|_, entry| !entry.handle.is_finished());
        map.len()
    }

    pub fn has_in_flight(&self, key: &IssueRef) -> bool {
        let mut map = self.in_flight.lock().expect("in-flight map poisoned");
        map.retain(|_, entry| !entry.handle.is_finished());
        map.contains_key(key)
    }

    /// Submit an action for an issue. `work` receives the action's
    /// cancellation token and runs on its own task.
    pub fn try_submit<F, Fut>(&self, key: &IssueRef, action: &str, work: F) -> SubmitOutcome
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // The lock is held across the spawn so the task's own cleanup
        // (which takes this lock) cannot run before the entry exists.
        let mut map = self.in_flight.lock().expect("in-flight map poisoned");
        map.retain(|_, entry| !entry.handle.is_finished());

        if map.contains_key(key) {
            debug!(issue = %key, action, "dropped: action already in flight for issue");
            return SubmitOutcome::DroppedBusyIssue;
        }
        if map.len() >= self.width {
            debug!(
                issue = %key,
                action,
                width = self.width,
                "dropped: dispatcher at capacity"
            );
            return SubmitOutcome::DroppedAtCapacity;
        }

        let cancel = CancellationToken::new();
        let fut = work(cancel.clone());
        let map_ref = Arc::clone(&self.in_flight);
        let owned_key = key.clone();
        let handle = tokio::spawn(async move {
            fut.await;
            map_ref
                .lock()
                .expect("in-flight map poisoned")
                .remove(&owned_key);
        });
        map.insert(key.clone(), InFlight { cancel, handle });
        info!(issue = %key, action, "action dispatched");
        SubmitOutcome::Started
    }

    /// Cancel the issue's in-flight action, if any, and wait for it to
    /// finish. Reset uses this before it starts tearing state down.
    pub async fn cancel_issue(&self, key: &IssueRef) {
        let entry = self
            .in_flight
            .lock()
            .expect("in-flight map poisoned")
            .remove(key);
        if let Some(entry) = entry {
            info!(issue = %key, "cancelling in-flight action");
            entry.cancel.cancel();
            let _ = entry.handle.await;
        }
    }

    /// Cancel everything and wait up to `grace` for actions to unwind.
    pub async fn shutdown(&self, grace: Duration) {
        let entries: Vec<(IssueRef, InFlight)> = {
            let mut map = self.in_flight.lock().expect("in-flight map poisoned");
            map.drain().collect()
        };
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "cancelling in-flight actions for shutdown");
        for (_, entry) in &entries {
            entry.cancel.cancel();
        }
        let wait_all = async {
            for (key, entry) in entries {
                if entry.handle.await.is_err() {
                    warn!(issue = %key, "action panicked during shutdown");
                }
            }
        };
        if tokio::time::timeout(grace, wait_all).await.is_err() {
            warn!("shutdown grace period elapsed with actions still running");
        }
    }
}
