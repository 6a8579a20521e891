//! Per-object server bookkeeping
//!
//! A [`Target`] tracks which client VMs hold leases on one exported
//! object. The implementation is pinned (held strongly) while the ref
//! set is non-empty, while calls are in flight, or forever for permanent
//! exports; otherwise only a weak handle remains and the object may be
//! reclaimed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::keep_alive::KeepAlive;
use super::lease_registry::LeaseRegistry;
use super::remote_object::{CallFuture, ExportedObject};
use crate::types::{DgcError, ObjectId, RemoteRef, Result, VmId};

/// Result of applying a sequenced dirty/clean to a target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// The call changed (or confirmed) the target's state
    Applied,
    /// The sequence number was not newer than the last one seen
    Stale,
    /// The target is no longer exported or its object was reclaimed
    Unknown,
}

/// Last sequence number seen from one VM
#[derive(Clone, Copy, Debug)]
struct SequenceEntry {
    sequence_num: i64,
    /// Set by a strong clean; the entry outlives the registration
    keep: bool,
}

struct TargetState {
    ref_set: HashSet<VmId>,
    sequence_table: HashMap<VmId, SequenceEntry>,
    pending_calls: usize,
    pinned: Option<Arc<ExportedObject>>,
    accepting: bool,
}

impl TargetState {
    /// Take the pin if nothing requires the object to stay reachable
    fn release_pin(&mut self, permanent: bool) -> Option<Arc<ExportedObject>> {
        if !permanent && self.ref_set.is_empty() && self.pending_calls == 0 {
            self.pinned.take()
        } else {
            None
        }
    }
}

/// Registrations stripped from a target when it is unexported
pub(crate) struct Retired {
    pub vmids: Vec<VmId>,
    pub released: Option<Arc<ExportedObject>>,
}

/// Server-side record for one exported object
pub struct Target {
    id: ObjectId,
    stub: RemoteRef,
    permanent: bool,
    impl_key: usize,
    weak_impl: Weak<ExportedObject>,
    keep_alive: Arc<KeepAlive>,
    state: Mutex<TargetState>,
}

impl Target {
    pub(crate) fn new(
        exported: &Arc<ExportedObject>,
        impl_key: usize,
        permanent: bool,
        keep_alive: Arc<KeepAlive>,
    ) -> Self {
        Self {
            id: exported.id(),
            stub: exported.stub().clone(),
            permanent,
            impl_key,
            weak_impl: Arc::downgrade(exported),
            keep_alive,
            state: Mutex::new(TargetState {
                ref_set: HashSet::new(),
                sequence_table: HashMap::new(),
                pending_calls: 0,
                pinned: if permanent { Some(exported.clone()) } else { None },
                accepting: true,
            }),
        }
    }

    /// Object identifier
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Reference handed to clients
    pub fn stub(&self) -> &RemoteRef {
        &self.stub
    }

    /// Whether this target is exempt from collection
    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub(crate) fn impl_key(&self) -> usize {
        self.impl_key
    }

    /// Record that `vmid` holds a reference, as of `sequence_num`
    pub fn referenced(
        self: &Arc<Self>,
        sequence_num: i64,
        vmid: VmId,
        leases: &LeaseRegistry,
    ) -> SequenceOutcome {
        let mut state = self.state.lock();
        if !state.accepting {
            return SequenceOutcome::Unknown;
        }

        let newly_pinned = if state.ref_set.contains(&vmid) || state.pinned.is_some() {
            None
        } else {
            match self.weak_impl.upgrade() {
                Some(object) => Some(object),
                None => {
                    debug!("{}: dirty from {} after object was reclaimed", self.id, vmid);
                    return SequenceOutcome::Unknown;
                }
            }
        };

        match state.sequence_table.get_mut(&vmid) {
            Some(entry) if entry.sequence_num >= sequence_num => {
                trace!(
                    "{}: stale dirty from {} (seq {} <= {})",
                    self.id, vmid, sequence_num, entry.sequence_num
                );
                return SequenceOutcome::Stale;
            }
            Some(entry) => entry.sequence_num = sequence_num,
            None => {
                state.sequence_table.insert(
                    vmid,
                    SequenceEntry {
                        sequence_num,
                        keep: false,
                    },
                );
            }
        }

        if !state.ref_set.contains(&vmid) {
            if let Some(object) = newly_pinned {
                state.pinned = Some(object);
            }
            state.ref_set.insert(vmid);
            trace!("{}: added {} (refs: {})", self.id, vmid, state.ref_set.len());
        }

        // Re-register on every accepted dirty so a renewal racing a sweep
        // ends up in the fresh lease entry.
        if !leases.register_target(vmid, self) {
            debug!("{}: {} has no lease, dropping registration", self.id, vmid);
            let released = self.remove_vmid(&mut state, vmid);
            drop(state);
            drop(released);
        }
        SequenceOutcome::Applied
    }

    /// Record that `vmid` released its reference, as of `sequence_num`
    ///
    /// A strong clean retains the sequence number so that a late dirty
    /// retry with an older number can never re-register `vmid`.
    pub fn unreferenced(
        &self,
        sequence_num: i64,
        vmid: VmId,
        strong: bool,
        leases: &LeaseRegistry,
    ) -> SequenceOutcome {
        let mut state = self.state.lock();

        match state.sequence_table.get_mut(&vmid) {
            Some(entry) if entry.sequence_num > sequence_num => {
                trace!(
                    "{}: stale clean from {} (seq {} < {})",
                    self.id, vmid, sequence_num, entry.sequence_num
                );
                return SequenceOutcome::Stale;
            }
            Some(entry) if strong || entry.keep => {
                entry.sequence_num = sequence_num;
                entry.keep = true;
            }
            Some(_) => {
                state.sequence_table.remove(&vmid);
            }
            None if strong => {
                state.sequence_table.insert(
                    vmid,
                    SequenceEntry {
                        sequence_num,
                        keep: true,
                    },
                );
            }
            None => {}
        }

        leases.unregister_target(vmid, self.id);
        let released = self.remove_vmid(&mut state, vmid);
        drop(state);
        drop(released);
        SequenceOutcome::Applied
    }

    /// Drop `vmid` after its lease expired
    ///
    /// No sequence number accompanies an expiry, so a retained strong
    /// entry is left alone and a plain one is forgotten.
    pub fn vmid_dead(&self, vmid: VmId, leases: &LeaseRegistry) {
        let mut state = self.state.lock();
        if leases.is_registered(vmid, self.id) {
            // Renewed between the sweep and this notification.
            return;
        }
        if let Some(entry) = state.sequence_table.get(&vmid) {
            if !entry.keep {
                state.sequence_table.remove(&vmid);
            }
        }
        debug!("{}: {} is dead", self.id, vmid);
        let released = self.remove_vmid(&mut state, vmid);
        drop(state);
        drop(released);
    }

    /// Remove `vmid` from the ref set; returns the pin to drop unlocked
    fn remove_vmid(&self, state: &mut TargetState, vmid: VmId) -> Option<Arc<ExportedObject>> {
        if !state.ref_set.remove(&vmid) || !state.ref_set.is_empty() {
            return None;
        }
        trace!("{}: ref set empty", self.id);
        if let Some(object) = state.pinned.clone() {
            spawn_unreferenced(object);
        }
        state.release_pin(self.permanent)
    }

    /// Start an in-flight call, pinning the object until the guard drops
    pub fn begin_call(self: &Arc<Self>) -> Result<CallGuard> {
        let object = {
            let mut state = self.state.lock();
            if !state.accepting {
                return Err(DgcError::NoSuchObject(self.id));
            }
            let object = match state.pinned.clone().or_else(|| self.weak_impl.upgrade()) {
                Some(object) => object,
                None => return Err(DgcError::NoSuchObject(self.id)),
            };
            if state.pinned.is_none() {
                state.pinned = Some(object.clone());
            }
            state.pending_calls += 1;
            object
        };
        self.keep_alive.increment();
        Ok(CallGuard {
            target: self.clone(),
            object,
        })
    }

    fn end_call(&self) {
        let released = {
            let mut state = self.state.lock();
            state.pending_calls = state.pending_calls.saturating_sub(1);
            state.release_pin(self.permanent)
        };
        self.keep_alive.decrement();
        drop(released);
    }

    /// Route an invocation to the implementation
    pub fn dispatch(self: &Arc<Self>, opnum: u16, args: Bytes) -> Result<CallFuture> {
        let guard = self.begin_call()?;
        let call = guard.object().object().invoke(opnum, args);
        Ok(Box::pin(async move {
            let result = call.await;
            drop(guard);
            result
        }))
    }

    /// Stop accepting calls and strip all registrations
    ///
    /// Returns `None` when calls are pending and `force` is false.
    pub(crate) fn retire(&self, force: bool) -> Option<Retired> {
        let mut state = self.state.lock();
        if !force && state.pending_calls > 0 {
            return None;
        }
        state.accepting = false;
        state.sequence_table.clear();
        let vmids = state.ref_set.drain().collect();
        Some(Retired {
            vmids,
            released: state.pinned.take(),
        })
    }

    /// Whether the implementation is gone and nothing references it
    pub fn is_reclaimable(&self) -> bool {
        if self.weak_impl.strong_count() > 0 {
            return false;
        }
        let state = self.state.lock();
        state.ref_set.is_empty() && state.pending_calls == 0
    }

    /// VMs currently holding a lease on this object
    pub fn ref_set(&self) -> Vec<VmId> {
        self.state.lock().ref_set.iter().copied().collect()
    }

    /// Check if `vmid` is in the ref set
    pub fn is_referenced_by(&self, vmid: VmId) -> bool {
        self.state.lock().ref_set.contains(&vmid)
    }

    /// Last sequence number recorded for `vmid`
    pub fn last_sequence(&self, vmid: VmId) -> Option<i64> {
        self.state.lock().sequence_table.get(&vmid).map(|e| e.sequence_num)
    }

    /// Whether the implementation is currently held strongly
    pub fn is_pinned(&self) -> bool {
        self.state.lock().pinned.is_some()
    }

    /// Number of in-flight calls
    pub fn pending_calls(&self) -> usize {
        self.state.lock().pending_calls
    }

    /// Whether the implementation is still reachable
    pub fn is_live(&self) -> bool {
        self.weak_impl.strong_count() > 0
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests(id: ObjectId) -> Arc<Self> {
        use crate::types::Endpoint;
        Arc::new(Self {
            id,
            stub: RemoteRef::local(id, Endpoint::new("localhost", 0)),
            permanent: false,
            impl_key: 0,
            weak_impl: Weak::new(),
            keep_alive: Arc::new(KeepAlive::detached()),
            state: Mutex::new(TargetState {
                ref_set: HashSet::new(),
                sequence_table: HashMap::new(),
                pending_calls: 0,
                pinned: None,
                accepting: true,
            }),
        })
    }
}

/// RAII guard for an in-flight call
pub struct CallGuard {
    target: Arc<Target>,
    object: Arc<ExportedObject>,
}

impl CallGuard {
    /// The pinned implementation
    pub fn object(&self) -> &Arc<ExportedObject> {
        &self.object
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.target.end_call();
    }
}

/// Run the object's unreferenced callback off the calling thread
fn spawn_unreferenced(object: Arc<ExportedObject>) {
    if object.object().as_unreferenced().is_none() {
        return;
    }
    let run = move || {
        if let Some(callback) = object.object().as_unreferenced() {
            callback.unreferenced();
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(run);
        }
        Err(_) => {
            if let Err(e) = std::thread::Builder::new()
                .name("dgc-unreferenced".to_string())
                .spawn(run)
            {
                warn!("failed to start unreferenced callback thread: {}", e);
            }
        }
    }
}
