//! Server half of the collector: the `dirty` and `clean` operations
//!
//! `dirty` grants (or renews) a lease for the calling VM and adds it to
//! each named object's ref set; `clean` removes it again. A background
//! checker sweeps expired leases every `lease_check_interval` while any
//! lease exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::lease_registry::LeaseRegistry;
use super::object_table::ObjectTable;
use super::target::SequenceOutcome;
use crate::config::DgcConfig;
use crate::types::{DgcError, Lease, ObjectId, Result, VmId};

/// DGC service of one server process
pub struct DgcServer {
    table: Arc<ObjectTable>,
    leases: Arc<LeaseRegistry>,
    lease_value: Duration,
    check_interval: Duration,
    runtime: Option<Handle>,
    checker: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
    this: Weak<DgcServer>,
}

impl DgcServer {
    /// Create a server over `table` and `leases`
    pub fn new(
        table: Arc<ObjectTable>,
        leases: Arc<LeaseRegistry>,
        config: &DgcConfig,
        runtime: Option<Handle>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            table,
            leases,
            lease_value: config.lease_value,
            check_interval: config.check_interval(),
            runtime,
            checker: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Register `lease.vmid` as a holder of every object in `ids`
    ///
    /// The requested duration is ignored; the server always grants its
    /// configured lease value. A missing VMID is minted here.
    pub fn dirty(&self, ids: &[ObjectId], sequence_num: i64, lease: Lease) -> Result<Lease> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(DgcError::Shutdown);
        }

        let vmid = match lease.vmid {
            Some(vmid) => vmid,
            None => {
                let vmid = VmId::generate();
                debug!("assigned {} to new client", vmid);
                vmid
            }
        };
        let duration = self.lease_value;
        self.leases.renew(vmid, duration);
        trace!("dirty from {} seq {} for {} object(s)", vmid, sequence_num, ids.len());

        for id in ids {
            match self.table.get_target(*id) {
                Some(target) => match target.referenced(sequence_num, vmid, &self.leases) {
                    SequenceOutcome::Applied => {}
                    SequenceOutcome::Stale => trace!("ignored stale dirty for {}", id),
                    SequenceOutcome::Unknown => trace!("dirty for reclaimed object {}", id),
                },
                None => trace!("dirty for unknown object {}", id),
            }
        }

        self.ensure_lease_checker();
        Ok(Lease::new(Some(vmid), duration))
    }

    /// Remove `vmid` from the ref set of every object in `ids`
    pub fn clean(&self, ids: &[ObjectId], sequence_num: i64, vmid: VmId, strong: bool) -> Result<()> {
        trace!(
            "clean from {} seq {} for {} object(s){}",
            vmid,
            sequence_num,
            ids.len(),
            if strong { " (strong)" } else { "" }
        );
        for id in ids {
            match self.table.get_target(*id) {
                Some(target) => {
                    if target.unreferenced(sequence_num, vmid, strong, &self.leases)
                        == SequenceOutcome::Stale
                    {
                        trace!("ignored stale clean for {}", id);
                    }
                }
                None => trace!("clean for unknown object {}", id),
            }
        }
        Ok(())
    }

    /// Sweep expired leases now; returns the VMs declared dead
    pub fn check_leases(&self) -> Vec<VmId> {
        self.leases.sweep()
    }

    /// Object table served by this instance
    pub fn table(&self) -> &Arc<ObjectTable> {
        &self.table
    }

    /// Lease registry served by this instance
    pub fn leases(&self) -> &Arc<LeaseRegistry> {
        &self.leases
    }

    /// Lease duration granted to clients
    pub fn lease_value(&self) -> Duration {
        self.lease_value
    }

    /// Whether the background lease checker is running
    pub fn lease_checker_running(&self) -> bool {
        self.checker
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Whether [`DgcServer::shutdown`] has been called
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Refuse further dirty calls and stop the lease checker
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.checker.lock().take() {
            handle.abort();
        }
        info!("DGC server shut down");
    }

    fn ensure_lease_checker(&self) {
        let mut checker = self.checker.lock();
        if checker.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let Some(handle) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            trace!("no runtime, leases are only swept on demand");
            return;
        };
        debug!("starting lease checker (every {:?})", self.check_interval);
        *checker = Some(handle.spawn(lease_checker(self.this.clone(), self.check_interval)));
    }
}

/// Periodic sweep; exits once no lease remains
async fn lease_checker(server: Weak<DgcServer>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(server) = server.upgrade() else { break };
        server.check_leases();

        // Decide to exit under the checker lock so a concurrent dirty
        // either sees this task gone or has its lease seen here.
        let mut checker = server.checker.lock();
        if server.leases.is_empty() {
            checker.take();
            debug!("no leases left, lease checker exiting");
            break;
        }
    }
}
