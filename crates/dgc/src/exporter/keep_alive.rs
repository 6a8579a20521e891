//! Keep-alive accounting for the reclamation watcher
//!
//! Counts non-permanent exported objects and in-flight calls. The
//! reclamation watcher only needs to run while the count is non-zero, so
//! it is started on the 0 -> 1 transition and stopped on 1 -> 0.

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

type WatcherFactory = Box<dyn Fn() -> Option<JoinHandle<()>> + Send + Sync>;

/// Keep-alive counter owning the reclamation watcher task
pub struct KeepAlive {
    count: Mutex<usize>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    start_watcher: WatcherFactory,
}

impl KeepAlive {
    /// Create a counter that starts watchers with `start_watcher`
    pub fn new<F>(start_watcher: F) -> Self
    where
        F: Fn() -> Option<JoinHandle<()>> + Send + Sync + 'static,
    {
        Self {
            count: Mutex::new(0),
            watcher: Mutex::new(None),
            start_watcher: Box::new(start_watcher),
        }
    }

    /// Counter that never starts a watcher
    pub fn detached() -> Self {
        Self::new(|| None)
    }

    /// Raise the count, starting the watcher when leaving zero
    pub fn increment(&self) {
        let mut count = self.count.lock();
        *count += 1;
        if *count == 1 {
            let handle = (self.start_watcher)();
            if handle.is_some() {
                debug!("keep-alive raised, reclamation watcher started");
            }
            if let Some(old) = std::mem::replace(&mut *self.watcher.lock(), handle) {
                old.abort();
            }
        }
    }

    /// Lower the count, stopping the watcher when reaching zero
    pub fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            if let Some(handle) = self.watcher.lock().take() {
                debug!("keep-alive dropped to zero, reclamation watcher stopped");
                handle.abort();
            }
        }
    }

    /// Current count
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Whether a watcher task is currently installed
    pub fn watcher_running(&self) -> bool {
        self.watcher
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the watcher regardless of the count
    pub fn shutdown(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}
