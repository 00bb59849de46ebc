use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::{select, sync::Notify};
use tokio_util::sync::CancellationToken;

struct Lanes<T> {
    local: VecDeque<T>,
    remote: VecDeque<T>,
    prefer_local: bool,
}

/// A work item queue fed from two sources. When both have items waiting, the
/// consumer takes from each in turn so neither starves the other.
pub struct DoubleWorkItemQueue<T> {
    lanes: Mutex<Lanes<T>>,
    available: Notify,
}

impl<T> Default for DoubleWorkItemQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DoubleWorkItemQueue<T> {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                local: VecDeque::new(),
                remote: VecDeque::new(),
                prefer_local: true,
            }),
            available: Notify::new(),
        }
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes<T>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_local(&self, item: T) {
        self.lanes().local.push_back(item);
        self.available.notify_one();
    }

    pub fn add_remote(&self, item: T) {
        self.lanes().remote.push_back(item);
        self.available.notify_one();
    }

    pub fn try_next(&self) -> Option<T> {
        let mut lanes = self.lanes();
        let take_local = match (lanes.local.is_empty(), lanes.remote.is_empty()) {
            (true, true) => return None,
            (false, true) => true,
            (true, false) => false,
            (false, false) => {
                let take_local = lanes.prefer_local;
                lanes.prefer_local = !take_local;
                take_local
            }
        };
        if take_local {
            lanes.local.pop_front()
        } else {
            lanes.remote.pop_front()
        }
    }

    /// Waits for the next item. Returns `None` once `cancellation` fires.
    pub async fn next(&self, cancellation: &CancellationToken) -> Option<T> {
        loop {
            let available = self.available.notified();
            if let Some(item) = self.try_next() {
                return Some(item);
            }
            select! {
                _ = available => {}
                _ = cancellation.cancelled() => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes();
        lanes.local.len() + lanes.remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternates_when_both_lanes_are_busy() {
        let queue = DoubleWorkItemQueue::new();
        for i in 0..3 {
            queue.add_local(("local", i));
            queue.add_remote(("remote", i));
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.try_next()).collect();
        assert_eq!(
            order,
            vec![
                ("local", 0),
                ("remote", 0),
                ("local", 1),
                ("remote", 1),
                ("local", 2),
                ("remote", 2),
            ]
        );
        assert!(queue.is_empty());
    }
}
