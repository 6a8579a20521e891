//! Acknowledgment holds for marshaled objects
//!
//! An exported object written into an outbound message may become locally
//! unreachable before the peer has dirtied its reference. The
//! [`AckCoordinator`] keeps such objects strongly held, keyed by the
//! message's [`AckId`], until the peer acknowledges the message or the
//! ack timeout elapses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::exporter::Exported;
use crate::types::AckId;

struct Held {
    objects: Vec<Exported>,
    deadline: Instant,
    timer: Option<JoinHandle<()>>,
}

struct AckState {
    held: Mutex<HashMap<AckId, Held>>,
    next_id: AtomicU64,
    timeout: Duration,
    runtime: Option<Handle>,
    shutdown: AtomicBool,
}

impl AckState {
    fn release(&self, id: AckId) -> Option<Held> {
        let held = self.held.lock().remove(&id)?;
        if let Some(timer) = &held.timer {
            timer.abort();
        }
        Some(held)
    }

    fn expire(&self, id: AckId) {
        if let Some(held) = self.held.lock().remove(&id) {
            debug!("ack {} timed out, releasing {} object(s)", id, held.objects.len());
        }
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Holds marshaled objects until their message is acknowledged
#[derive(Clone)]
pub struct AckCoordinator {
    state: Arc<AckState>,
}

impl AckCoordinator {
    /// Create a coordinator releasing holds after `timeout`
    ///
    /// Timers run on `runtime`, or on the ambient runtime when `None`.
    /// Without any runtime, expired holds are only dropped by
    /// [`purge_expired`](Self::purge_expired).
    pub fn new(timeout: Duration, runtime: Option<Handle>) -> Self {
        Self {
            state: Arc::new(AckState {
                held: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                timeout,
                runtime,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Start collecting objects for a new outbound message
    pub fn begin(&self) -> PendingAck {
        PendingAck {
            id: AckId(self.state.next_id.fetch_add(1, Ordering::Relaxed)),
            objects: Vec::new(),
            state: Arc::downgrade(&self.state),
        }
    }

    /// Hold `objects` under a fresh id and start its timer
    pub fn hold(&self, objects: impl IntoIterator<Item = Exported>) -> AckId {
        let mut pending = self.begin();
        for object in objects {
            pending.add(object);
        }
        pending.start_timer()
    }

    /// The peer acknowledged `id`; returns whether anything was held
    pub fn received(&self, id: AckId) -> bool {
        match self.state.release(id) {
            Some(held) => {
                trace!("ack {} received, releasing {} object(s)", id, held.objects.len());
                true
            }
            None => false,
        }
    }

    /// Drop every hold whose deadline has passed; returns how many
    pub fn purge_expired(&self) -> usize {
        let now = now();
        let expired: Vec<Held> = {
            let mut held = self.state.held.lock();
            let ids: Vec<AckId> = held
                .iter()
                .filter(|(_, h)| h.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| held.remove(id)).collect()
        };
        for held in &expired {
            if let Some(timer) = &held.timer {
                timer.abort();
            }
        }
        if !expired.is_empty() {
            debug!("purged {} expired ack hold(s)", expired.len());
        }
        expired.len()
    }

    /// Number of messages awaiting acknowledgment
    pub fn held_count(&self) -> usize {
        self.state.held.lock().len()
    }

    /// Whether `id` is still held
    pub fn is_held(&self, id: AckId) -> bool {
        self.state.held.lock().contains_key(&id)
    }

    pub fn timeout(&self) -> Duration {
        self.state.timeout
    }

    /// Release every hold and cancel all timers
    pub fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::Release);
        let held: Vec<Held> = self.state.held.lock().drain().map(|(_, h)| h).collect();
        for h in &held {
            if let Some(timer) = &h.timer {
                timer.abort();
            }
        }
        if !held.is_empty() {
            debug!("released {} ack hold(s) on shutdown", held.len());
        }
    }
}

/// Objects collected for one outbound message
///
/// The id is available up front so it can be written into the message.
/// Nothing is held until [`start_timer`](Self::start_timer) is called;
/// dropping a `PendingAck` releases its objects.
pub struct PendingAck {
    id: AckId,
    objects: Vec<Exported>,
    state: Weak<AckState>,
}

impl PendingAck {
    pub fn id(&self) -> AckId {
        self.id
    }

    /// Keep `object` alive until this message is acknowledged
    pub fn add(&mut self, object: Exported) {
        self.objects.push(object);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Message sent: hold the objects until ack or timeout
    pub fn start_timer(self) -> AckId {
        let id = self.id;
        if self.objects.is_empty() {
            return id;
        }
        let Some(state) = self.state.upgrade() else {
            return id;
        };
        if state.shutdown.load(Ordering::Acquire) {
            return id;
        }

        let timer = match state.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(handle) => {
                let weak = Arc::downgrade(&state);
                let timeout = state.timeout;
                Some(handle.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(state) = weak.upgrade() {
                        state.expire(id);
                    }
                }))
            }
            None => None,
        };

        trace!("holding {} object(s) for ack {}", self.objects.len(), id);
        state.held.lock().insert(
            id,
            Held {
                objects: self.objects,
                deadline: now() + state.timeout,
                timer,
            },
        );
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::exporter::{CallFuture, ExportOptions, LeaseRegistry, ObjectTable, RemoteObject};
    use crate::types::{Endpoint, ObjectId};
    use bytes::Bytes;

    struct Echo;

    impl RemoteObject for Echo {
        fn invoke(&self, _opnum: u16, args: Bytes) -> CallFuture {
            Box::pin(async move { Ok(args) })
        }
    }

    fn table() -> Arc<ObjectTable> {
        let leases = Arc::new(LeaseRegistry::new(Arc::new(ManualClock::new())));
        ObjectTable::new(
            Endpoint::new("localhost", 1099),
            leases,
            Duration::from_secs(3600),
            None,
        )
    }

    fn is_live(table: &ObjectTable, id: ObjectId) -> bool {
        table.get_target(id).map(|t| t.is_live()).unwrap_or(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_until_received() {
        let table = table();
        let acks = AckCoordinator::new(Duration::from_secs(300), None);
        let exported = table.export(Arc::new(Echo), ExportOptions::default()).unwrap();
        let id = exported.id();

        let ack = acks.hold([exported]);
        assert!(is_live(&table, id));
        assert!(acks.is_held(ack));

        assert!(acks.received(ack));
        assert!(!is_live(&table, id));
        assert!(!acks.received(ack));
        assert_eq!(acks.held_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_released_on_timeout() {
        let table = table();
        let acks = AckCoordinator::new(Duration::from_secs(300), None);
        let exported = table.export(Arc::new(Echo), ExportOptions::default()).unwrap();
        let id = exported.id();
        let ack = acks.hold([exported]);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(acks.is_held(ack));
        assert!(is_live(&table, id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!acks.is_held(ack));
        assert!(!is_live(&table, id));
    }

    #[tokio::test]
    async fn test_pending_ack_ids_are_unique() {
        let acks = AckCoordinator::new(Duration::from_secs(300), None);
        let a = acks.begin();
        let b = acks.begin();
        assert_ne!(a.id(), b.id());
        assert!(a.is_empty());

        // Nothing to protect, nothing held.
        let id = a.start_timer();
        assert!(!acks.is_held(id));
        drop(b);
        assert_eq!(acks.held_count(), 0);
    }

    #[test]
    fn test_purge_without_runtime() {
        let table = table();
        let acks = AckCoordinator::new(Duration::ZERO, None);
        let exported = table.export(Arc::new(Echo), ExportOptions::default()).unwrap();

        let mut pending = acks.begin();
        pending.add(exported.clone());
        pending.add(exported);
        assert_eq!(pending.len(), 2);
        let ack = pending.start_timer();
        assert!(acks.is_held(ack));

        assert_eq!(acks.purge_expired(), 1);
        assert!(!acks.is_held(ack));
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let table = table();
        let acks = AckCoordinator::new(Duration::from_secs(300), None);
        for _ in 0..3 {
            let exported = table.export(Arc::new(Echo), ExportOptions::default()).unwrap();
            acks.hold([exported]);
        }
        assert_eq!(acks.held_count(), 3);

        acks.shutdown();
        assert_eq!(acks.held_count(), 0);

        let exported = table.export(Arc::new(Echo), ExportOptions::default()).unwrap();
        let ack = acks.hold([exported]);
        assert!(!acks.is_held(ack));
    }
}
