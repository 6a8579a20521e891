//! Server-side lease table
//!
//! One entry per client VM: when its lease runs out, every target that
//! VM referenced is told the VM is dead. Clients must keep renewing
//! (via dirty calls) to stay registered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::target::Target;
use crate::clock::LeaseClock;
use crate::types::{ObjectId, VmId};

/// Lease state for one client VM
pub struct LeaseEntry {
    /// Expiry instant
    pub expiration: Instant,
    /// Targets to notify when the lease expires
    notify_set: HashMap<ObjectId, Arc<Target>>,
}

impl LeaseEntry {
    fn new(now: Instant, duration: Duration) -> Self {
        Self {
            expiration: now + duration,
            notify_set: HashMap::new(),
        }
    }

    /// Extend the lease; never shortens it
    fn renew(&mut self, now: Instant, duration: Duration) {
        let candidate = now + duration;
        if candidate > self.expiration {
            self.expiration = candidate;
        }
    }

    /// Check if the lease ran out before `now`
    fn expired(&self, now: Instant) -> bool {
        self.expiration < now
    }
}

/// Table of client leases
pub struct LeaseRegistry {
    leases: Mutex<HashMap<VmId, LeaseEntry>>,
    clock: Arc<dyn LeaseClock>,
}

impl LeaseRegistry {
    /// Create an empty registry
    pub fn new(clock: Arc<dyn LeaseClock>) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Create or renew the lease for `vmid`; returns the new expiry
    pub fn renew(&self, vmid: VmId, duration: Duration) -> Instant {
        let now = self.clock.now();
        let mut leases = self.leases.lock();
        match leases.get_mut(&vmid) {
            Some(entry) => {
                entry.renew(now, duration);
                entry.expiration
            }
            None => {
                debug!("new lease for {} ({:?})", vmid, duration);
                let entry = LeaseEntry::new(now, duration);
                let expiration = entry.expiration;
                leases.insert(vmid, entry);
                expiration
            }
        }
    }

    /// Add `target` to the notify set of `vmid`'s lease
    ///
    /// Returns false when `vmid` holds no lease, in which case the caller
    /// must treat the VM as dead.
    pub fn register_target(&self, vmid: VmId, target: &Arc<Target>) -> bool {
        let mut leases = self.leases.lock();
        match leases.get_mut(&vmid) {
            Some(entry) => {
                entry.notify_set.insert(target.id(), target.clone());
                true
            }
            None => false,
        }
    }

    /// Remove a target from `vmid`'s notify set
    pub fn unregister_target(&self, vmid: VmId, id: ObjectId) {
        let mut leases = self.leases.lock();
        if let Some(entry) = leases.get_mut(&vmid) {
            entry.notify_set.remove(&id);
        }
    }

    /// Check if `vmid`'s current lease will notify target `id`
    pub fn is_registered(&self, vmid: VmId, id: ObjectId) -> bool {
        self.leases
            .lock()
            .get(&vmid)
            .map(|entry| entry.notify_set.contains_key(&id))
            .unwrap_or(false)
    }

    /// Remove every expired lease and notify its targets
    ///
    /// Targets are notified after the table lock is released.
    pub fn sweep(&self) -> Vec<VmId> {
        let now = self.clock.now();
        let expired: Vec<(VmId, Vec<Arc<Target>>)> = {
            let mut leases = self.leases.lock();
            let dead: Vec<VmId> = leases
                .iter()
                .filter(|(_, entry)| entry.expired(now))
                .map(|(vmid, _)| *vmid)
                .collect();
            dead.into_iter()
                .filter_map(|vmid| {
                    leases
                        .remove(&vmid)
                        .map(|entry| (vmid, entry.notify_set.into_values().collect()))
                })
                .collect()
        };

        let mut vmids = Vec::with_capacity(expired.len());
        for (vmid, targets) in expired {
            info!("lease for {} expired, releasing {} object(s)", vmid, targets.len());
            for target in targets {
                target.vmid_dead(vmid, self);
            }
            vmids.push(vmid);
        }
        vmids
    }

    /// Expiry of `vmid`'s lease, if any
    pub fn expiration(&self, vmid: VmId) -> Option<Instant> {
        self.leases.lock().get(&vmid).map(|entry| entry.expiration)
    }

    /// Check if `vmid` holds a lease
    pub fn contains(&self, vmid: VmId) -> bool {
        self.leases.lock().contains_key(&vmid)
    }

    /// Number of live leases
    pub fn len(&self) -> usize {
        self.leases.lock().len()
    }

    /// Check if no client holds a lease
    pub fn is_empty(&self) -> bool {
        self.leases.lock().is_empty()
    }
}
