//! Table of exported objects
//!
//! Maps object identifiers to their [`Target`]s and implementation
//! identities to object identifiers (so one implementation is exported
//! at most once). Entries are removed when an object is unexported or,
//! for objects nobody references, when the implementation is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::keep_alive::KeepAlive;
use super::lease_registry::LeaseRegistry;
use super::remote_object::{Exported, ExportedObject, RemoteObject};
use super::target::Target;
use crate::reclaim::ReclamationQueue;
use crate::types::{DgcError, Endpoint, ObjectId, ObjectIdAllocator, RemoteRef, Result};

/// Options for [`ObjectTable::export`]
#[derive(Clone, Copy, Debug, Default)]
pub struct ExportOptions {
    /// Export under this identifier instead of allocating one
    pub id: Option<ObjectId>,
    /// Never collect the object, even with no remote references
    pub permanent: bool,
}

impl ExportOptions {
    /// Export under a fixed identifier
    pub fn with_id(mut self, id: ObjectId) -> Self {
        self.id = Some(id);
        self
    }

    /// Mark the export permanent
    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }
}

#[derive(Default)]
struct TableState {
    targets: HashMap<ObjectId, Arc<Target>>,
    impls: HashMap<usize, (ObjectId, Weak<ExportedObject>)>,
}

impl TableState {
    fn forget_impl(&mut self, target: &Target) {
        if let Some((id, _)) = self.impls.get(&target.impl_key()) {
            if *id == target.id() {
                self.impls.remove(&target.impl_key());
            }
        }
    }
}

/// Reference table of a server process
pub struct ObjectTable {
    endpoint: Endpoint,
    state: RwLock<TableState>,
    ids: ObjectIdAllocator,
    queue: Arc<ReclamationQueue<ObjectId>>,
    keep_alive: Arc<KeepAlive>,
    leases: Arc<LeaseRegistry>,
}

impl ObjectTable {
    /// Create a table for objects reachable at `endpoint`
    ///
    /// The reaper runs on `runtime` (or the ambient runtime, if any) while
    /// reclaimable objects exist, and rescans the table at least every
    /// `gc_interval`.
    pub fn new(
        endpoint: Endpoint,
        leases: Arc<LeaseRegistry>,
        gc_interval: Duration,
        runtime: Option<Handle>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|table: &Weak<ObjectTable>| {
            let queue = Arc::new(ReclamationQueue::new());
            let keep_alive = {
                let table = table.clone();
                let queue = queue.clone();
                Arc::new(KeepAlive::new(move || {
                    let handle = runtime.clone().or_else(|| Handle::try_current().ok())?;
                    Some(handle.spawn(reaper(table.clone(), queue.clone(), gc_interval)))
                }))
            };
            Self {
                endpoint,
                state: RwLock::new(TableState::default()),
                ids: ObjectIdAllocator::new(),
                queue,
                keep_alive,
                leases,
            }
        })
    }

    /// Endpoint exported objects are reachable at
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Export `object` and return the local handle keeping it reachable
    pub fn export(&self, object: Arc<dyn RemoteObject>, options: ExportOptions) -> Result<Exported> {
        let impl_key = Arc::as_ptr(&object) as *const () as usize;
        let mut state = self.state.write();

        if let Some((id, weak)) = state.impls.get(&impl_key) {
            if weak.strong_count() > 0 {
                return Err(DgcError::AlreadyExported(*id));
            }
        }

        let id = match options.id {
            Some(id) => {
                if state.targets.contains_key(&id) {
                    return Err(DgcError::AlreadyExported(id));
                }
                id
            }
            None => self.ids.allocate(),
        };

        let stub = RemoteRef::new(id, self.endpoint.clone());
        let exported = Arc::new(ExportedObject::new(id, stub, object, self.queue.track(id)));
        let target = Arc::new(Target::new(
            &exported,
            impl_key,
            options.permanent,
            self.keep_alive.clone(),
        ));

        state.impls.insert(impl_key, (id, Arc::downgrade(&exported)));
        state.targets.insert(id, target);
        if !options.permanent {
            self.keep_alive.increment();
        }
        drop(state);

        debug!(
            "exported {}{}",
            id,
            if options.permanent { " (permanent)" } else { "" }
        );
        Ok(Exported::new(exported))
    }

    /// Remove `id` from the table
    ///
    /// Returns `Ok(false)` when calls are in flight and `force` is false.
    pub fn unexport(&self, id: ObjectId, force: bool) -> Result<bool> {
        let mut state = self.state.write();
        let target = state
            .targets
            .get(&id)
            .cloned()
            .ok_or(DgcError::NoSuchObject(id))?;
        let retired = match target.retire(force) {
            Some(retired) => retired,
            None => {
                debug!("unexport of {} refused: calls in progress", id);
                return Ok(false);
            }
        };
        state.targets.remove(&id);
        state.forget_impl(&target);
        drop(state);

        for vmid in &retired.vmids {
            self.leases.unregister_target(*vmid, id);
        }
        if !target.is_permanent() {
            self.keep_alive.decrement();
        }
        debug!("unexported {} ({} lease(s) dropped)", id, retired.vmids.len());
        drop(retired);
        Ok(true)
    }

    /// Look up the target for `id`
    pub fn get_target(&self, id: ObjectId) -> Option<Arc<Target>> {
        self.state.read().targets.get(&id).cloned()
    }

    /// Identifier `object` is exported under, if any
    pub fn find_exported(&self, object: &Arc<dyn RemoteObject>) -> Option<ObjectId> {
        let impl_key = Arc::as_ptr(object) as *const () as usize;
        self.state
            .read()
            .impls
            .get(&impl_key)
            .filter(|(_, weak)| weak.strong_count() > 0)
            .map(|(id, _)| *id)
    }

    /// Remove `id` if its implementation has been reclaimed
    pub fn reap(&self, id: ObjectId) -> bool {
        let mut state = self.state.write();
        let target = match state.targets.get(&id) {
            Some(target) if target.is_reclaimable() => target.clone(),
            _ => return false,
        };
        state.targets.remove(&id);
        state.forget_impl(&target);
        drop(state);

        trace!("reclaimed {}", id);
        if !target.is_permanent() {
            self.keep_alive.decrement();
        }
        true
    }

    /// Reap every identifier already reported by the reclamation queue
    pub fn reap_cleared(&self) -> usize {
        self.queue
            .poll_cleared()
            .into_iter()
            .filter(|id| self.reap(*id))
            .count()
    }

    /// Full scan for targets whose implementation is gone
    pub fn scan_reclaimed(&self) -> usize {
        let mut reaped = self.reap_cleared();
        let candidates: Vec<ObjectId> = self
            .state
            .read()
            .targets
            .values()
            .filter(|target| target.is_reclaimable())
            .map(|target| target.id())
            .collect();
        for id in candidates {
            if self.reap(id) {
                reaped += 1;
            }
        }
        if reaped > 0 {
            debug!("reclamation scan removed {} object(s)", reaped);
        }
        reaped
    }

    /// Shared keep-alive counter
    pub fn keep_alive(&self) -> &Arc<KeepAlive> {
        &self.keep_alive
    }

    /// Exported identifiers
    pub fn ids(&self) -> Vec<ObjectId> {
        self.state.read().targets.keys().copied().collect()
    }

    /// Check if `id` is in the table
    pub fn contains(&self, id: ObjectId) -> bool {
        self.state.read().targets.contains_key(&id)
    }

    /// Number of exported objects
    pub fn len(&self) -> usize {
        self.state.read().targets.len()
    }

    /// Check if nothing is exported
    pub fn is_empty(&self) -> bool {
        self.state.read().targets.is_empty()
    }

    /// Unexport everything and stop the reaper
    pub fn clear(&self) {
        for id in self.ids() {
            let _ = self.unexport(id, true);
        }
        self.keep_alive.shutdown();
    }
}

/// Reclamation watcher: reaps cleared objects as they are reported and
/// rescans the whole table every `interval`
async fn reaper(
    table: Weak<ObjectTable>,
    queue: Arc<ReclamationQueue<ObjectId>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            id = queue.cleared() => {
                let Some(table) = table.upgrade() else { break };
                table.reap(id);
            }
            _ = ticker.tick() => {
                let Some(table) = table.upgrade() else { break };
                table.scan_reclaimed();
            }
        }
    }
    trace!("reaper exiting");
}
