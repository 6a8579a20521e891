//! Per-endpoint client state
//!
//! An [`EndpointState`] owns the ref entries for one remote endpoint and
//! a background loop that renews the lease, turns reclaimed local
//! instances into clean calls, and retries failed calls. All network
//! calls are made without holding the state lock, from batches copied
//! out under it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::backoff::DirtyBackoff;
use super::ledger::{ClientIdentity, EndpointLedger, LedgerKey};
use super::live_ref::LiveRef;
use crate::config::DgcConfig;
use crate::protocol::DgcProxy;
use crate::reclaim::ReclamationQueue;
use crate::types::{Lease, ObjectId, RemoteRef};

pub(crate) type EntryId = u64;

/// Identifies one tracked local instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TrackerKey {
    pub entry: EntryId,
    pub instance: u64,
}

/// Lifecycle of an endpoint's client state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointPhase {
    /// Holds at least one ref entry
    Active,
    /// No entries left, clean calls still pending
    Draining,
    /// Gone from the ledger
    Removed,
}

struct RefEntry {
    remote: RemoteRef,
    instances: HashSet<u64>,
    /// A dirty call naming this entry failed; its clean must be strong
    dirty_failed: bool,
}

#[derive(Clone, Debug)]
struct CleanRequest {
    ids: Vec<ObjectId>,
    sequence_num: i64,
    strong: bool,
    failures: u32,
}

struct EndpointInner {
    entries: HashMap<EntryId, RefEntry>,
    by_id: HashMap<ObjectId, EntryId>,
    invalid: HashSet<EntryId>,
    next_entry: EntryId,
    next_instance: u64,
    /// `None` means no renewal is scheduled
    renew_time: Option<Instant>,
    /// `None` means no lease was ever granted
    expiration_time: Option<Instant>,
    backoff: DirtyBackoff,
    pending_cleans: Vec<CleanRequest>,
}

impl EndpointInner {
    /// Move the renewal time; returns true when it moved earlier
    fn set_renew_time(&mut self, renew_time: Option<Instant>) -> bool {
        let earlier = match (renew_time, self.renew_time) {
            (Some(new), Some(current)) => new < current,
            (Some(_), None) => true,
            (None, _) => false,
        };
        self.renew_time = renew_time;
        earlier
    }

    fn lease_lapsed(&self) -> bool {
        match (self.renew_time, self.expiration_time) {
            (Some(renew), Some(expiration)) => renew >= expiration,
            _ => true,
        }
    }
}

/// Client state for one remote endpoint
pub(crate) struct EndpointState {
    key: LedgerKey,
    proxy: Arc<dyn DgcProxy>,
    identity: Arc<ClientIdentity>,
    ledger: Weak<EndpointLedger>,
    queue: ReclamationQueue<TrackerKey>,
    wake: Notify,
    removed: AtomicBool,
    inner: Mutex<EndpointInner>,
    task: Mutex<Option<JoinHandle<()>>>,
    lease_value: Duration,
    clean_interval: Duration,
    gc_interval: Duration,
    clean_failure_retries: u32,
}

/// Current time on the clock tokio timers run on
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl EndpointState {
    pub(crate) fn new(
        key: LedgerKey,
        proxy: Arc<dyn DgcProxy>,
        identity: Arc<ClientIdentity>,
        ledger: Weak<EndpointLedger>,
        config: &DgcConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            proxy,
            identity,
            ledger,
            queue: ReclamationQueue::new(),
            wake: Notify::new(),
            removed: AtomicBool::new(false),
            inner: Mutex::new(EndpointInner {
                entries: HashMap::new(),
                by_id: HashMap::new(),
                invalid: HashSet::new(),
                next_entry: 0,
                next_instance: 0,
                renew_time: None,
                expiration_time: None,
                backoff: DirtyBackoff::new(config),
                pending_cleans: Vec::new(),
            }),
            task: Mutex::new(None),
            lease_value: config.lease_value,
            clean_interval: config.clean_interval,
            gc_interval: config.client_gc_interval,
            clean_failure_retries: config.clean_failure_retries,
        })
    }

    /// Start the renewal loop on `runtime`, or the ambient runtime
    pub(crate) fn start(self: &Arc<Self>, runtime: Option<&Handle>) {
        let handle = match runtime.cloned().or_else(|| Handle::try_current().ok()) {
            Some(handle) => handle,
            None => {
                warn!("no tokio runtime, {} will not be renewed", self.key.0);
                return;
            }
        };
        let task = handle.spawn(self.clone().run());
        *self.task.lock() = Some(task);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Track local instances of `refs`, dirtying new entries
    ///
    /// Returns `None` when this state was removed concurrently; the caller
    /// must look the endpoint up again.
    pub(crate) async fn register_refs(self: &Arc<Self>, refs: &[RemoteRef]) -> Option<Vec<LiveRef>> {
        let (live, to_dirty, sequence_num) = {
            let mut inner = self.inner.lock();
            if self.is_removed() {
                return None;
            }

            let mut to_dirty = Vec::new();
            let mut live = Vec::with_capacity(refs.len());
            for remote in refs {
                let existing = inner.by_id.get(&remote.id).copied();
                let entry_id = match existing {
                    Some(id) => id,
                    None => {
                        let id = inner.next_entry;
                        inner.next_entry += 1;
                        inner.by_id.insert(remote.id, id);
                        inner.entries.insert(
                            id,
                            RefEntry {
                                remote: remote.clone(),
                                instances: HashSet::new(),
                                dirty_failed: false,
                            },
                        );
                        to_dirty.push(id);
                        id
                    }
                };

                let instance = inner.next_instance;
                inner.next_instance += 1;
                if let Some(entry) = inner.entries.get_mut(&entry_id) {
                    entry.instances.insert(instance);
                }
                let tracker = self.queue.track(TrackerKey {
                    entry: entry_id,
                    instance,
                });
                live.push(LiveRef::tracked(remote.clone(), tracker));
            }

            if to_dirty.is_empty() {
                return Some(live);
            }
            to_dirty.extend(inner.invalid.drain());
            to_dirty.sort_unstable();
            to_dirty.dedup();
            (live, to_dirty, self.identity.next_sequence())
        };

        self.make_dirty_call(to_dirty, sequence_num).await;
        Some(live)
    }

    /// Send a dirty call naming `entries` (possibly none, to just renew)
    async fn make_dirty_call(&self, entries: Vec<EntryId>, sequence_num: i64) {
        let ids: Vec<ObjectId> = {
            let inner = self.inner.lock();
            entries
                .iter()
                .filter_map(|id| inner.entries.get(id).map(|entry| entry.remote.id))
                .collect()
        };

        let requested = Lease::new(Some(self.identity.vmid()), self.lease_value);
        let start = now();
        let result = self.proxy.dirty(&ids, sequence_num, requested).await;
        let end = now();

        let earlier = match result {
            Ok(lease) => {
                self.identity.confirm(lease.vmid);
                let mut inner = self.inner.lock();
                inner.backoff.on_success();
                inner.expiration_time = Some(start + lease.duration);
                debug!(
                    "lease on {} granted for {:?} ({} new id(s))",
                    self.key.0,
                    lease.duration,
                    ids.len()
                );
                inner.set_renew_time(Some(start + lease.duration / 2))
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                let expiration = inner.expiration_time;
                let next = inner.backoff.on_failure(start, end, expiration);
                match next {
                    Some(at) => warn!(
                        "dirty call to {} failed ({} in a row), retrying in {:?}: {}",
                        self.key.0,
                        inner.backoff.failures(),
                        at.saturating_duration_since(end),
                        e
                    ),
                    None => warn!(
                        "dirty call to {} failed ({} in a row), giving up until new refs arrive: {}",
                        self.key.0,
                        inner.backoff.failures(),
                        e
                    ),
                }
                let earlier = inner.set_renew_time(next);

                for id in &entries {
                    if let Some(entry) = inner.entries.get_mut(id) {
                        entry.dirty_failed = true;
                    }
                }
                inner.invalid.extend(entries.iter().copied());
                if inner.lease_lapsed() {
                    let all: Vec<EntryId> = inner.entries.keys().copied().collect();
                    inner.invalid.extend(all);
                }
                let EndpointInner {
                    invalid,
                    entries: live,
                    ..
                } = &mut *inner;
                invalid.retain(|id| live.contains_key(id));
                earlier
            }
        };

        if earlier {
            self.wake.notify_one();
        }
    }

    /// Drop reclaimed instances; queue clean calls for emptied entries
    fn process_cleared(&self, inner: &mut EndpointInner, cleared: Vec<TrackerKey>) {
        let mut normal = Vec::new();
        let mut strong = Vec::new();

        for key in cleared {
            let Some(entry) = inner.entries.get_mut(&key.entry) else {
                continue;
            };
            entry.instances.remove(&key.instance);
            if !entry.instances.is_empty() {
                continue;
            }
            if let Some(entry) = inner.entries.remove(&key.entry) {
                inner.by_id.remove(&entry.remote.id);
                inner.invalid.remove(&key.entry);
                trace!("{} no longer referenced locally", entry.remote);
                if entry.dirty_failed {
                    strong.push(entry.remote.id);
                } else {
                    normal.push(entry.remote.id);
                }
            }
        }

        for (ids, strong) in [(normal, false), (strong, true)] {
            if ids.is_empty() {
                continue;
            }
            inner.pending_cleans.push(CleanRequest {
                ids,
                sequence_num: self.identity.next_sequence(),
                strong,
                failures: 0,
            });
        }

        if inner.entries.is_empty() && !self.is_removed() {
            self.removed.store(true, Ordering::Release);
            // Nothing left to renew; only clean calls keep the loop going.
            inner.renew_time = None;
            if let Some(ledger) = self.ledger.upgrade() {
                ledger.remove(&self.key, self);
            }
            debug!("no refs left on {}, removed from ledger", self.key.0);
        }
    }

    /// Attempt every pending clean call
    async fn make_clean_calls(&self) {
        let requests = self.inner.lock().pending_cleans.clone();
        if requests.is_empty() {
            return;
        }

        let vmid = self.identity.vmid();
        let mut done = HashSet::new();
        let mut failed = HashSet::new();
        for request in &requests {
            match self
                .proxy
                .clean(&request.ids, request.sequence_num, vmid, request.strong)
                .await
            {
                Ok(()) => {
                    trace!("clean of {} id(s) on {} done", request.ids.len(), self.key.0);
                    done.insert(request.sequence_num);
                }
                Err(e) => {
                    warn!("clean call to {} failed: {}", self.key.0, e);
                    failed.insert(request.sequence_num);
                }
            }
        }

        let retries = self.clean_failure_retries;
        let endpoint = &self.key.0;
        self.inner.lock().pending_cleans.retain_mut(|request| {
            if done.contains(&request.sequence_num) {
                return false;
            }
            if failed.contains(&request.sequence_num) {
                request.failures += 1;
                if request.failures >= retries {
                    warn!(
                        "giving up clean of {} id(s) on {} after {} attempt(s)",
                        request.ids.len(),
                        endpoint,
                        request.failures
                    );
                    return false;
                }
            }
            true
        });
    }

    fn time_to_wait(&self) -> Duration {
        let inner = self.inner.lock();
        let renew_time = inner.renew_time.filter(|_| !self.is_removed());
        let mut wait = match renew_time {
            Some(at) => at.saturating_duration_since(now()).max(Duration::from_millis(1)),
            None => self.gc_interval,
        };
        if !inner.pending_cleans.is_empty() {
            wait = wait.min(self.clean_interval);
        }
        wait.min(self.gc_interval)
    }

    /// Renewal loop; exits once removed with no clean calls pending
    async fn run(self: Arc<Self>) {
        trace!("renewal loop for {} started", self.key.0);
        loop {
            let deadline = tokio::time::Instant::now() + self.time_to_wait();
            let first = tokio::select! {
                key = self.queue.cleared() => Some(key),
                _ = tokio::time::sleep_until(deadline) => None,
                _ = self.wake.notified() => None,
            };

            let renewal = {
                let mut inner = self.inner.lock();
                let mut cleared: Vec<TrackerKey> = first.into_iter().collect();
                cleared.extend(self.queue.poll_cleared());
                if !cleared.is_empty() {
                    self.process_cleared(&mut inner, cleared);
                }

                let due = inner.renew_time.map(|at| now() > at).unwrap_or(false);
                if due && !self.is_removed() {
                    let entries: Vec<EntryId> = inner.invalid.drain().collect();
                    Some((entries, self.identity.next_sequence()))
                } else {
                    None
                }
            };

            if let Some((entries, sequence_num)) = renewal {
                self.make_dirty_call(entries, sequence_num).await;
            }
            self.make_clean_calls().await;

            if self.is_removed() && self.inner.lock().pending_cleans.is_empty() {
                break;
            }
        }
        debug!("renewal loop for {} finished", self.key.0);
    }

    /// Stop the loop without sending further calls
    pub(crate) fn shutdown(&self) {
        self.removed.store(true, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub(crate) fn phase(&self) -> EndpointPhase {
        let inner = self.inner.lock();
        if !self.is_removed() {
            EndpointPhase::Active
        } else if !inner.pending_cleans.is_empty() {
            EndpointPhase::Draining
        } else {
            EndpointPhase::Removed
        }
    }

    pub(crate) fn ref_entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub(crate) fn instance_count(&self, id: ObjectId) -> usize {
        let inner = self.inner.lock();
        inner
            .by_id
            .get(&id)
            .and_then(|entry| inner.entries.get(entry))
            .map(|entry| entry.instances.len())
            .unwrap_or(0)
    }

    pub(crate) fn pending_clean_count(&self) -> usize {
        self.inner.lock().pending_cleans.len()
    }

    pub(crate) fn invalid_count(&self) -> usize {
        self.inner.lock().invalid.len()
    }

    pub(crate) fn renew_time(&self) -> Option<Instant> {
        self.inner.lock().renew_time
    }

    pub(crate) fn expiration_time(&self) -> Option<Instant> {
        self.inner.lock().expiration_time
    }

    pub(crate) fn dirty_failures(&self) -> u32 {
        self.inner.lock().backoff.failures()
    }

    pub(crate) fn is_dirty_failed(&self, id: ObjectId) -> bool {
        let inner = self.inner.lock();
        inner
            .by_id
            .get(&id)
            .and_then(|entry| inner.entries.get(entry))
            .map(|entry| entry.dirty_failed)
            .unwrap_or(false)
    }
}
