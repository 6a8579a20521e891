//! Table of remote endpoints this client holds references into

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use super::endpoint::{EndpointPhase, EndpointState};
use super::live_ref::LiveRef;
use crate::config::DgcConfig;
use crate::protocol::DgcConnector;
use crate::types::{DgcError, Endpoint, FactoryId, ObjectId, RemoteRef, Result, VmId};

/// Endpoints are told apart by address and socket factory
pub(crate) type LedgerKey = (Endpoint, Option<FactoryId>);

fn key_of(endpoint: &Endpoint) -> LedgerKey {
    (endpoint.clone(), endpoint.factory())
}

/// Identity shared by every endpoint of one client
///
/// The VMID is fixed at construction so that every dirty call, including
/// concurrent first calls to different endpoints, names the same client.
pub(crate) struct ClientIdentity {
    vmid: VmId,
    next_sequence: AtomicI64,
}

impl ClientIdentity {
    fn new() -> Self {
        let vmid = VmId::generate();
        info!("client identity is {}", vmid);
        Self {
            vmid,
            next_sequence: AtomicI64::new(i64::MIN),
        }
    }

    pub(crate) fn vmid(&self) -> VmId {
        self.vmid
    }

    /// Check the VMID a server echoed back
    pub(crate) fn confirm(&self, granted: Option<VmId>) {
        match granted {
            Some(vmid) if vmid != self.vmid => {
                warn!("server answered with {} but client is {}", vmid, self.vmid)
            }
            Some(_) => {}
            None => warn!("server granted a lease without naming {}", self.vmid),
        }
    }

    /// Next sequence number; strictly increasing across all endpoints
    pub(crate) fn next_sequence(&self) -> i64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }
}

/// Client-side reference ledger
pub struct EndpointLedger {
    endpoints: Mutex<HashMap<LedgerKey, Arc<EndpointState>>>,
    identity: Arc<ClientIdentity>,
    connector: Arc<dyn DgcConnector>,
    config: DgcConfig,
    runtime: Option<Handle>,
    shutdown: AtomicBool,
    this: Weak<EndpointLedger>,
}

impl EndpointLedger {
    pub fn new(
        config: DgcConfig,
        connector: Arc<dyn DgcConnector>,
        runtime: Option<Handle>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            endpoints: Mutex::new(HashMap::new()),
            identity: Arc::new(ClientIdentity::new()),
            connector,
            config,
            runtime,
            shutdown: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Track local instances of `refs`, all exported at `endpoint`
    ///
    /// Returns one [`LiveRef`] per input, in order. New references are
    /// dirtied before this returns; a failed dirty call is retried in the
    /// background rather than reported.
    pub async fn register_refs(&self, endpoint: &Endpoint, refs: &[RemoteRef]) -> Result<Vec<LiveRef>> {
        if self.is_shut_down() {
            return Err(DgcError::Shutdown);
        }

        let mut out: Vec<Option<LiveRef>> = Vec::with_capacity(refs.len());
        let mut slots = Vec::new();
        let mut remote = Vec::new();
        for (i, r) in refs.iter().enumerate() {
            if r.is_local {
                out.push(Some(LiveRef::untracked(r.clone())));
            } else {
                out.push(None);
                slots.push(i);
                remote.push(r.clone());
            }
        }

        if !remote.is_empty() {
            let live = loop {
                if self.is_shut_down() {
                    return Err(DgcError::Shutdown);
                }
                let state = self.lookup_or_create(endpoint)?;
                match state.register_refs(&remote).await {
                    Some(live) => break live,
                    None => trace!("{} removed concurrently, retrying", endpoint),
                }
            };
            for (slot, live) in slots.into_iter().zip(live) {
                out[slot] = Some(live);
            }
        }

        Ok(out.into_iter().flatten().collect())
    }

    fn lookup_or_create(&self, endpoint: &Endpoint) -> Result<Arc<EndpointState>> {
        let key = key_of(endpoint);
        let mut endpoints = self.endpoints.lock();
        if let Some(state) = endpoints.get(&key) {
            if !state.is_removed() {
                return Ok(state.clone());
            }
        }

        let proxy = self.connector.connect(endpoint)?;
        let state = EndpointState::new(
            key.clone(),
            proxy,
            self.identity.clone(),
            self.this.clone(),
            &self.config,
        );
        state.start(self.runtime.as_ref());
        endpoints.insert(key, state.clone());
        debug!("tracking references into {}", endpoint);
        Ok(state)
    }

    /// Drop `state` from the table if it is still the current one
    pub(crate) fn remove(&self, key: &LedgerKey, state: &EndpointState) {
        let mut endpoints = self.endpoints.lock();
        let current = endpoints
            .get(key)
            .map(|s| std::ptr::eq(Arc::as_ptr(s), state))
            .unwrap_or(false);
        if current {
            endpoints.remove(key);
        }
    }

    fn state(&self, endpoint: &Endpoint) -> Option<Arc<EndpointState>> {
        self.endpoints.lock().get(&key_of(endpoint)).cloned()
    }

    /// VMID this client names itself by in every dirty and clean call
    pub fn vmid(&self) -> VmId {
        self.identity.vmid()
    }

    /// Number of endpoints with live state
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }

    /// Lifecycle phase of `endpoint`; `None` if it was never tracked or
    /// has been fully removed
    pub fn endpoint_phase(&self, endpoint: &Endpoint) -> Option<EndpointPhase> {
        self.state(endpoint).map(|state| state.phase())
    }

    /// Number of distinct remote objects tracked at `endpoint`
    pub fn ref_entry_count(&self, endpoint: &Endpoint) -> usize {
        self.state(endpoint).map(|s| s.ref_entry_count()).unwrap_or(0)
    }

    /// Number of local instances of `remote`
    pub fn instance_count(&self, remote: &RemoteRef) -> usize {
        self.state(&remote.endpoint)
            .map(|s| s.instance_count(remote.id))
            .unwrap_or(0)
    }

    /// Clean calls waiting to be sent to `endpoint`
    pub fn pending_clean_count(&self, endpoint: &Endpoint) -> usize {
        self.state(endpoint).map(|s| s.pending_clean_count()).unwrap_or(0)
    }

    /// Entries at `endpoint` awaiting a retried dirty call
    pub fn invalid_count(&self, endpoint: &Endpoint) -> usize {
        self.state(endpoint).map(|s| s.invalid_count()).unwrap_or(0)
    }

    /// Next scheduled lease renewal for `endpoint`
    pub fn renew_time(&self, endpoint: &Endpoint) -> Option<Instant> {
        self.state(endpoint).and_then(|s| s.renew_time())
    }

    /// Expiry of the last lease granted by `endpoint`
    pub fn expiration_time(&self, endpoint: &Endpoint) -> Option<Instant> {
        self.state(endpoint).and_then(|s| s.expiration_time())
    }

    /// Consecutive failed dirty calls to `endpoint`
    pub fn dirty_failures(&self, endpoint: &Endpoint) -> u32 {
        self.state(endpoint).map(|s| s.dirty_failures()).unwrap_or(0)
    }

    /// Whether a dirty call naming `remote` has failed
    pub fn is_dirty_failed(&self, remote: &RemoteRef) -> bool {
        self.state(&remote.endpoint)
            .map(|s| s.is_dirty_failed(remote.id))
            .unwrap_or(false)
    }

    /// Whether `id` is tracked at `endpoint`
    pub fn is_tracking(&self, endpoint: &Endpoint, id: ObjectId) -> bool {
        self.state(endpoint)
            .map(|s| s.instance_count(id) > 0)
            .unwrap_or(false)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop every endpoint loop; pending clean calls are abandoned
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let states: Vec<Arc<EndpointState>> = self.endpoints.lock().drain().map(|(_, s)| s).collect();
        for state in &states {
            state.shutdown();
        }
        if !states.is_empty() {
            debug!("client ledger shut down ({} endpoint(s))", states.len());
        }
    }
}
