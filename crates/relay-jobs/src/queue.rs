//! Per-key FIFO serialization of jobs.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::job::JobId;

/// Ordered lists of pending job IDs, one per queue key.
///
/// Only the head of a list may run. The head stays in place while it retries,
/// so its successors keep waiting until it reaches a terminal state and is
/// removed.
#[derive(Debug, Default)]
pub struct QueueSerializer {
    queues: FxHashMap<String, VecDeque<JobId>>,
}

impl QueueSerializer {
    /// Create an empty serializer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job to the tail of its queue.
    pub fn push(&mut self, queue_key: &str, job_id: JobId) {
        self.queues
            .entry(queue_key.to_string())
            .or_default()
            .push_back(job_id);
    }

    /// Job at the head of a queue.
    pub fn head(&self, queue_key: &str) -> Option<JobId> {
        self.queues.get(queue_key).and_then(|q| q.front().copied())
    }

    /// Whether the job may run as far as ordering is concerned.
    pub fn is_head(&self, queue_key: &str, job_id: &JobId) -> bool {
        self.head(queue_key).as_ref() == Some(job_id)
    }

    /// Remove a job from its queue, wherever it sits.
    ///
    /// Returns the new head if the removed job was the head.
    pub fn remove(&mut self, queue_key: &str, job_id: &JobId) -> Option<JobId> {
        let queue = self.queues.get_mut(queue_key)?;
        let position = queue.iter().position(|id| id == job_id)?;
        queue.remove(position);

        let next = if position == 0 {
            queue.front().copied()
        } else {
            None
        };
        if queue.is_empty() {
            self.queues.remove(queue_key);
        }
        next
    }

    /// Remove and return every job in a queue, in order.
    pub fn drain_queue(&mut self, queue_key: &str) -> Vec<JobId> {
        self.queues
            .remove(queue_key)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Jobs in a queue, in order.
    pub fn job_ids(&self, queue_key: &str) -> Vec<JobId> {
        self.queues
            .get(queue_key)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Check if a job is in the given queue.
    pub fn contains(&self, queue_key: &str, job_id: &JobId) -> bool {
        self.queues
            .get(queue_key)
            .is_some_and(|q| q.contains(job_id))
    }

    /// Number of jobs in one queue.
    pub fn queue_len(&self, queue_key: &str) -> usize {
        self.queues.get(queue_key).map_or(0, VecDeque::len)
    }

    /// Number of jobs across all queues.
    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Check if no queue holds a job.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Keys of non-empty queues.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    /// Clear all queues.
    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_head() {
        let mut queues = QueueSerializer::new();
        let (t1, t2, t3) = (JobId::new(), JobId::new(), JobId::new());

        queues.push("typing-5", t1);
        queues.push("typing-5", t2);
        queues.push("typing-5", t3);

        assert!(queues.is_head("typing-5", &t1));
        assert!(!queues.is_head("typing-5", &t2));

        assert_eq!(queues.remove("typing-5", &t1), Some(t2));
        assert!(queues.is_head("typing-5", &t2));
        assert_eq!(queues.remove("typing-5", &t2), Some(t3));
        assert_eq!(queues.remove("typing-5", &t3), None);
        assert!(queues.is_empty());
    }

    #[test]
    fn test_remove_from_middle_keeps_head() {
        let mut queues = QueueSerializer::new();
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());
        queues.push("conv-1", a);
        queues.push("conv-1", b);
        queues.push("conv-1", c);

        assert_eq!(queues.remove("conv-1", &b), None);
        assert!(queues.is_head("conv-1", &a));
        assert_eq!(queues.job_ids("conv-1"), vec![a, c]);
        assert_eq!(queues.remove("conv-1", &JobId::new()), None);
    }

    #[test]
    fn test_independent_queues() {
        let mut queues = QueueSerializer::new();
        let (a, b) = (JobId::new(), JobId::new());
        queues.push("conv-1", a);
        queues.push("conv-2", b);

        assert!(queues.is_head("conv-1", &a));
        assert!(queues.is_head("conv-2", &b));
        assert_eq!(queues.len(), 2);
        assert_eq!(queues.queue_len("conv-1"), 1);

        let mut keys: Vec<_> = queues.keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["conv-1", "conv-2"]);
    }

    #[test]
    fn test_drain_queue() {
        let mut queues = QueueSerializer::new();
        let (a, b) = (JobId::new(), JobId::new());
        queues.push("conv-1", a);
        queues.push("conv-1", b);

        assert_eq!(queues.drain_queue("conv-1"), vec![a, b]);
        assert!(queues.drain_queue("conv-1").is_empty());
        assert!(!queues.contains("conv-1", &a));
    }
}
