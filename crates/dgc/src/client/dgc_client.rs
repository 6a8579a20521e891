//! Client half of the collector

use std::collections::HashMap;
use std::sync::Arc;

use tokio::runtime::Handle;

use super::ledger::EndpointLedger;
use super::live_ref::LiveRef;
use crate::config::DgcConfig;
use crate::protocol::DgcConnector;
use crate::types::{DgcError, Endpoint, FactoryId, RemoteRef, Result, VmId};

/// Tracks remote references held by this process
///
/// References arriving from the wire are registered here; the returned
/// [`LiveRef`]s keep the remote objects leased until they are dropped.
#[derive(Clone)]
pub struct DgcClient {
    ledger: Arc<EndpointLedger>,
}

impl DgcClient {
    pub fn new(config: DgcConfig, connector: Arc<dyn DgcConnector>, runtime: Option<Handle>) -> Self {
        Self {
            ledger: EndpointLedger::new(config, connector, runtime),
        }
    }

    /// The endpoint ledger
    pub fn ledger(&self) -> &Arc<EndpointLedger> {
        &self.ledger
    }

    /// Register references that may span several endpoints
    ///
    /// Each endpoint receives one batched dirty call for its new refs.
    pub async fn register(&self, refs: Vec<RemoteRef>) -> Result<Vec<LiveRef>> {
        let mut groups: HashMap<(Endpoint, Option<FactoryId>), Vec<(usize, RemoteRef)>> = HashMap::new();
        let mut order = Vec::new();
        for (i, remote) in refs.into_iter().enumerate() {
            let key = (remote.endpoint.clone(), remote.endpoint.factory());
            let group = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                Vec::new()
            });
            group.push((i, remote));
        }

        let mut out: Vec<Option<LiveRef>> = Vec::new();
        for key in order {
            let Some(group) = groups.remove(&key) else { continue };
            let (slots, refs): (Vec<usize>, Vec<RemoteRef>) = group.into_iter().unzip();
            let live = self.ledger.register_refs(&key.0, &refs).await?;
            for (slot, live) in slots.into_iter().zip(live) {
                if out.len() <= slot {
                    out.resize_with(slot + 1, || None);
                }
                out[slot] = Some(live);
            }
        }
        Ok(out.into_iter().flatten().collect())
    }

    /// Register a single reference
    pub async fn register_ref(&self, remote: RemoteRef) -> Result<LiveRef> {
        let endpoint = remote.endpoint.clone();
        let mut live = self.ledger.register_refs(&endpoint, &[remote]).await?;
        live.pop().ok_or(DgcError::Shutdown)
    }

    /// VMID naming this client to every server
    pub fn vmid(&self) -> VmId {
        self.ledger.vmid()
    }

    /// Stop all background activity
    pub fn shutdown(&self) {
        self.ledger.shutdown();
    }
}
