use std::time::Duration;
use tokio::time::Instant;

/// Keyed one-shot deadlines polled from a session's select loop.
/// Scheduling a key again replaces its previous deadline.
pub struct Timers<K> {
    deadlines: Vec<(K, Instant)>,
}

impl<K: Copy + PartialEq> Timers<K> {
    pub fn new() -> Self {
        Self {
            deadlines: Vec::new(),
        }
    }

    pub fn schedule(&mut self, key: K, after: Duration) {
        self.cancel(key);
        self.deadlines.push((key, Instant::now() + after));
    }

    pub fn cancel(&mut self, key: K) {
        self.deadlines.retain(|(k, _)| *k != key);
    }

    pub fn is_scheduled(&self, key: K) -> bool {
        self.deadlines.iter().any(|(k, _)| *k == key)
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    /// Resolves with the key of the earliest deadline; never resolves when empty
    pub async fn expired(&mut self) -> K {
        let earliest = self
            .deadlines
            .iter()
            .enumerate()
            .min_by_key(|(_, (_, at))| *at)
            .map(|(i, (_, at))| (i, *at));

        match earliest {
            Some((index, at)) => {
                tokio::time::sleep_until(at).await;
                self.deadlines.swap_remove(index).0
            }
            None => std::future::pending().await,
        }
    }
}

impl<K: Copy + PartialEq> Default for Timers<K> {
    fn default() -> Self {
        Self::new()
    }
}
