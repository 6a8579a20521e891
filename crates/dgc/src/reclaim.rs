//! Reclamation notification queue
//!
//! Rust has no phantom references, so reclamation is observed through a
//! [`Tracker`] embedded in the tracked value: when the value is dropped
//! the tracker pushes its key onto the queue it was created from. Both
//! the server (exported implementations) and the client (local instances
//! of remote references) consume cleared keys from a
//! [`ReclamationQueue`].

use std::future::poll_fn;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Queue of keys whose tracked values were reclaimed
pub struct ReclamationQueue<K> {
    tx: UnboundedSender<K>,
    rx: Mutex<UnboundedReceiver<K>>,
}

impl<K: Send + 'static> ReclamationQueue<K> {
    /// Create an empty queue
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Create a tracker that enqueues `key` when dropped
    pub fn track(&self, key: K) -> Tracker<K> {
        Tracker {
            key: Some(key),
            tx: self.tx.clone(),
        }
    }

    /// Drain every key cleared so far without waiting
    pub fn poll_cleared(&self) -> Vec<K> {
        let mut rx = self.rx.lock();
        let mut cleared = Vec::new();
        while let Ok(key) = rx.try_recv() {
            cleared.push(key);
        }
        cleared
    }

    /// Wait for the next cleared key
    ///
    /// Only one task should wait on a queue at a time.
    pub async fn cleared(&self) -> K {
        loop {
            // The queue owns a sender, so the channel never reports closed.
            if let Some(key) = poll_fn(|cx| self.rx.lock().poll_recv(cx)).await {
                return key;
            }
        }
    }
}

impl<K: Send + 'static> Default for ReclamationQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop-triggered notification handle
pub struct Tracker<K: Send + 'static> {
    key: Option<K>,
    tx: UnboundedSender<K>,
}

impl<K: Send + 'static> Tracker<K> {
    /// Key that will be enqueued on drop
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    /// Drop without notifying the queue
    pub fn disarm(mut self) {
        self.key = None;
    }
}

impl<K: Send + 'static> Drop for Tracker<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            // Receiver gone means the owner shut down; nothing left to notify.
            let _ = self.tx.send(key);
        }
    }
}

impl<K: Send + std::fmt::Debug + 'static> std::fmt::Debug for Tracker<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker").field("key", &self.key).finish()
    }
}
