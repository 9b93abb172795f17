//! Debounced intake for repository change events.
//!
//! External watchers call [`ChangeQueue::add`] every time a repo changes on
//! disk. The queue keeps one entry per repo stamped with the latest change
//! instant; an entry becomes ready only after staying quiet for the debounce
//! window, so a burst of saves coalesces into a single sync.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, sleep_until};
use tracing::debug;

/// Coalescing queue of changed repos.
pub struct ChangeQueue {
    debounce: Duration,
    pending: Mutex<HashMap<String, Instant>>,
    notify: Notify,
}

impl ChangeQueue {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Record a change for `repo_id`, restarting its quiet window.
    pub async fn add(&self, repo_id: &str) {
        {
            let mut pending = self.pending.lock().await;
            pending.insert(repo_id.to_string(), Instant::now());
        }
        self.notify.notify_one();
        debug!(repo_id, "Change recorded");
    }

    /// Drain every repo whose quiet window has elapsed, leaving the rest
    /// pending. Results are sorted for deterministic scheduling.
    pub async fn get_ready(&self) -> Vec<String> {
        let now = Instant::now();
        let mut pending = self.pending.lock().await;
        let mut ready: Vec<String> = pending
            .iter()
            .filter(|(_, last_change)| now.duration_since(**last_change) >= self.debounce)
            .map(|(repo_id, _)| repo_id.clone())
            .collect();
        for repo_id in &ready {
            pending.remove(repo_id);
        }
        ready.sort();
        ready
    }

    /// Sleep until a pending entry becomes ready or `max_wait` elapses,
    /// waking early when new changes arrive. Returns whether any entry was
    /// pending when the wait ended.
    pub async fn wait(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let next_ready = {
                let pending = self.pending.lock().await;
                pending
                    .values()
                    .map(|last_change| *last_change + self.debounce)
                    .min()
            };

            let wake_at = match next_ready {
                Some(ready_at) if ready_at <= Instant::now() => return true,
                Some(ready_at) => ready_at.min(deadline),
                None => deadline,
            };

            tokio::select! {
                _ = sleep_until(wake_at) => {
                    if wake_at >= deadline {
                        let pending = self.pending.lock().await;
                        return !pending.is_empty();
                    }
                    // The earliest entry's window has elapsed; re-check.
                }
                _ = self.notify.notified() => {
                    // A new change moved the earliest ready time; recompute.
                }
            }
        }
    }

    /// Number of repos currently inside their quiet window or awaiting drain.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn entries_are_held_until_the_quiet_window_elapses() {
        let queue = ChangeQueue::new(Duration::from_millis(100));
        queue.add("repo-a").await;

        assert!(queue.get_ready().await.is_empty());
        assert_eq!(queue.pending_len().await, 1);

        sleep(Duration::from_millis(140)).await;
        assert_eq!(queue.get_ready().await, vec!["repo-a".to_string()]);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn rapid_changes_coalesce_into_one_ready_event() {
        let queue = ChangeQueue::new(Duration::from_millis(200));

        queue.add("repo-a").await;
        sleep(Duration::from_millis(50)).await;
        queue.add("repo-a").await;
        sleep(Duration::from_millis(50)).await;
        queue.add("repo-a").await;

        // The window restarts from the last add, so nothing is ready yet.
        sleep(Duration::from_millis(100)).await;
        assert!(queue.get_ready().await.is_empty());

        sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.get_ready().await, vec!["repo-a".to_string()]);
        assert!(queue.get_ready().await.is_empty());
    }

    #[tokio::test]
    async fn only_quiet_repos_drain() {
        let queue = ChangeQueue::new(Duration::from_millis(100));
        queue.add("old").await;
        sleep(Duration::from_millis(140)).await;
        queue.add("fresh").await;

        assert_eq!(queue.get_ready().await, vec!["old".to_string()]);
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn wait_wakes_when_an_entry_becomes_ready() {
        let queue = ChangeQueue::new(Duration::from_millis(80));
        queue.add("repo-a").await;

        let started = Instant::now();
        let pending = queue.wait(Duration::from_secs(5)).await;
        assert!(pending);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(70), "woke too early: {waited:?}");
        assert!(waited < Duration::from_secs(1), "missed the ready wake: {waited:?}");
    }

    #[tokio::test]
    async fn wait_times_out_when_nothing_is_pending() {
        let queue = ChangeQueue::new(Duration::from_millis(50));
        let pending = queue.wait(Duration::from_millis(60)).await;
        assert!(!pending);
    }
}
