//! Count of streams currently open for one client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared counter of open streams. Every open stream holds a [`StreamGuard`];
/// dropping it releases the slot, so the count cannot go below zero.
#[derive(Debug, Clone)]
pub struct StreamTracker {
    open: Arc<AtomicUsize>,
    expected: usize,
}

/// Held by a pump while its stream is open.
#[derive(Debug)]
pub struct StreamGuard {
    open: Arc<AtomicUsize>,
}

impl StreamTracker {
    pub fn new(expected: usize) -> Self {
        Self {
            open: Arc::new(AtomicUsize::new(0)),
            expected,
        }
    }

    /// Records a newly opened stream.
    pub fn register(&self) -> StreamGuard {
        self.open.fetch_add(1, Ordering::SeqCst);
        StreamGuard {
            open: Arc::clone(&self.open),
        }
    }

    pub fn open_streams(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Number of streams a healthy connection keeps open.
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.open_streams() >= self.expected
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        // saturating; a failed update means the count is already zero
        let _ = self
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_release() {
        let tracker = StreamTracker::new(2);
        assert_eq!(tracker.open_streams(), 0);

        let first = tracker.register();
        assert!(!tracker.is_complete());
        let second = tracker.register();
        assert_eq!(tracker.open_streams(), 2);
        assert!(tracker.is_complete());

        drop(first);
        drop(second);
        assert_eq!(tracker.open_streams(), 0);
    }

    #[test]
    fn test_never_negative() {
        let tracker = StreamTracker::new(1);
        let guard = tracker.register();
        tracker.open.store(0, Ordering::SeqCst);
        drop(guard);
        assert_eq!(tracker.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_guards() {
        let tracker = StreamTracker::new(7);
        let mut handles = Vec::new();
        for _ in 0..7 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let _guard = tracker.register();
                tokio::task::yield_now().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(tracker.open_streams(), 0);
    }
}
