//! Job state notifications and a bounded memory of finished jobs.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, oneshot};

use crate::job::{FailureReason, JobId, JobState};

/// Capacity of the broadcast channel behind [`JobTracker::subscribe`].
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A job changed state.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub factory_key: String,
    pub state: JobState,
    /// Set when `state` is `FailedPermanent`.
    pub reason: Option<FailureReason>,
}

impl JobEvent {
    pub fn new(job_id: JobId, factory_key: impl Into<String>, state: JobState) -> Self {
        Self {
            job_id,
            factory_key: factory_key.into(),
            state,
            reason: None,
        }
    }

    pub fn failed(job_id: JobId, factory_key: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            job_id,
            factory_key: factory_key.into(),
            state: JobState::FailedPermanent,
            reason: Some(reason),
        }
    }
}

/// Publishes state changes and remembers recent terminal states so callers
/// can wait on jobs that already finished.
#[derive(Debug)]
pub struct JobTracker {
    events: broadcast::Sender<JobEvent>,
    terminal: FxHashMap<JobId, JobState>,
    terminal_order: VecDeque<JobId>,
    capacity: usize,
    waiters: FxHashMap<JobId, Vec<oneshot::Sender<JobState>>>,
}

impl JobTracker {
    /// Create a tracker remembering at most `capacity` terminal states.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::with_sender(events, capacity)
    }

    /// Create a tracker that publishes on an existing channel.
    pub fn with_sender(events: broadcast::Sender<JobEvent>, capacity: usize) -> Self {
        Self {
            events,
            terminal: FxHashMap::default(),
            terminal_order: VecDeque::new(),
            capacity: capacity.max(1),
            waiters: FxHashMap::default(),
        }
    }

    /// The channel events are published on.
    pub fn sender(&self) -> broadcast::Sender<JobEvent> {
        self.events.clone()
    }

    /// Receive every subsequent event.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Publish an event, resolving waiters when the state is terminal.
    pub fn publish(&mut self, event: JobEvent) {
        let job_id = event.job_id;
        let state = event.state;

        // No subscribers is fine.
        let _ = self.events.send(event);

        if state.is_terminal() {
            self.remember(job_id, state);
            for waiter in self.waiters.remove(&job_id).unwrap_or_default() {
                let _ = waiter.send(state);
            }
        }
    }

    /// Terminal state of a recently finished job.
    pub fn terminal_state(&self, job_id: &JobId) -> Option<JobState> {
        self.terminal.get(job_id).copied()
    }

    /// Resolve `waiter` when the job reaches a terminal state, immediately if
    /// it already has.
    pub fn watch(&mut self, job_id: JobId, waiter: oneshot::Sender<JobState>) {
        if let Some(state) = self.terminal_state(&job_id) {
            let _ = waiter.send(state);
        } else {
            self.waiters.entry(job_id).or_default().push(waiter);
        }
    }

    /// Drop waiters whose receiver is gone.
    pub fn prune_waiters(&mut self) {
        self.waiters.retain(|_, waiters| {
            waiters.retain(|w| !w.is_closed());
            !waiters.is_empty()
        });
    }

    /// Number of remembered terminal states.
    pub fn remembered(&self) -> usize {
        self.terminal.len()
    }

    fn remember(&mut self, job_id: JobId, state: JobState) {
        if self.terminal.insert(job_id, state).is_none() {
            self.terminal_order.push_back(job_id);
        }
        // Evict oldest entries when the cache exceeds its limit
        while self.terminal_order.len() > self.capacity {
            if let Some(old) = self.terminal_order.pop_front() {
                self.terminal.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let mut tracker = JobTracker::new(16);
        let mut rx = tracker.subscribe();
        let id = JobId::new();

        tracker.publish(JobEvent::new(id, "SendJob", JobState::Running));
        tracker.publish(JobEvent::failed(id, "SendJob", FailureReason::Expired));

        assert_eq!(rx.recv().await.unwrap().state, JobState::Running);
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.state, JobState::FailedPermanent);
        assert_eq!(failed.reason, Some(FailureReason::Expired));
        assert_eq!(tracker.terminal_state(&id), Some(JobState::FailedPermanent));
    }

    #[tokio::test]
    async fn test_sender_shares_channel() {
        let mut tracker = JobTracker::new(16);
        let events = tracker.sender();
        let mut rx = events.subscribe();
        let id = JobId::new();

        tracker.publish(JobEvent::new(id, "SendJob", JobState::Pending));
        assert_eq!(rx.recv().await.unwrap().job_id, id);
        assert_eq!(events.receiver_count(), 1);
    }

    #[tokio::test]
    async fn test_watch_before_and_after() {
        let mut tracker = JobTracker::new(16);
        let id = JobId::new();

        let (tx, rx) = oneshot::channel();
        tracker.watch(id, tx);
        tracker.publish(JobEvent::new(id, "SendJob", JobState::Succeeded));
        assert_eq!(rx.await.unwrap(), JobState::Succeeded);

        let (tx, rx) = oneshot::channel();
        tracker.watch(id, tx);
        assert_eq!(rx.await.unwrap(), JobState::Succeeded);
    }

    #[test]
    fn test_terminal_cache_eviction() {
        let mut tracker = JobTracker::new(2);
        let ids: Vec<_> = (0..3).map(|_| JobId::new()).collect();
        for id in &ids {
            tracker.publish(JobEvent::new(*id, "SendJob", JobState::Succeeded));
        }

        assert_eq!(tracker.remembered(), 2);
        assert_eq!(tracker.terminal_state(&ids[0]), None);
        assert_eq!(tracker.terminal_state(&ids[2]), Some(JobState::Succeeded));
    }

    #[test]
    fn test_prune_waiters() {
        let mut tracker = JobTracker::new(4);
        let (tx, rx) = oneshot::channel();
        tracker.watch(JobId::new(), tx);
        drop(rx);
        tracker.prune_waiters();
        assert!(tracker.waiters.is_empty());
    }
}
