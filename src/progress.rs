use crate::models::{JobRecord, ProgressEvent};
use crate::state_manager::StateManager;
use crate::store::SharedStore;
use futures_util::Stream;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::warn;
use uuid::Uuid;

/// Samples job records on a fixed interval and turns them into progress events.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    store: SharedStore,
    history: Option<StateManager>,
    interval: Duration,
}

impl ProgressBroadcaster {
    pub fn new(store: SharedStore, interval: Duration) -> Self {
        Self {
            store,
            history: None,
            interval,
        }
    }

    /// Look up jobs already evicted from memory in `history`.
    pub fn with_history(mut self, history: StateManager) -> Self {
        self.history = Some(history);
        self
    }

    /// Events for one subscriber of `job_id`.
    ///
    /// Ticks where the job is unknown emit nothing. The stream ends right after
    /// the first `done` or `error` event. Dropping it stops the timer.
    pub fn subscribe(&self, job_id: Uuid) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        let store = self.store.clone();
        let history = self.history.clone();
        let period = self.interval;

        async_stream::stream! {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let job = match store.get(&job_id) {
                    Some(job) => job,
                    None => match load_from_history(history.as_ref(), job_id).await {
                        Some(job) => job,
                        None => continue,
                    },
                };
                let event = job.to_event();
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
        }
    }
}

async fn load_from_history(history: Option<&StateManager>, job_id: Uuid) -> Option<JobRecord> {
    match history?.load_job(job_id).await {
        Ok(job) => job,
        Err(e) => {
            warn!(job_id = %job_id, "history lookup failed: {e}");
            None
        }
    }
}
