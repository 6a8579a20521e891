//! Top-level DGC runtime
//!
//! Ties the server half (object table, lease registry, dirty/clean
//! service) and the client half (endpoint ledger) of one process
//! together, along with the acknowledgment coordinator.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use crate::ack::AckCoordinator;
use crate::client::{DgcClient, LiveRef};
use crate::clock::{LeaseClock, SystemClock};
use crate::config::DgcConfig;
use crate::exporter::{DgcServer, ExportOptions, Exported, LeaseRegistry, ObjectTable, RemoteObject};
use crate::protocol::{DgcConnector, DgcDispatcher, DgcListener, LoopbackConnector, TcpConnector};
use crate::types::{Endpoint, ObjectId, RemoteRef, Result};

/// Builder for [`DgcRuntime`]
pub struct DgcRuntimeBuilder {
    endpoint: Endpoint,
    config: DgcConfig,
    clock: Arc<dyn LeaseClock>,
    connector: Option<Arc<dyn DgcConnector>>,
    runtime: Option<Handle>,
}

impl DgcRuntimeBuilder {
    /// Start building a runtime whose objects are reachable at `endpoint`
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            config: DgcConfig::default(),
            clock: Arc::new(SystemClock),
            connector: None,
            runtime: None,
        }
    }

    pub fn config(mut self, config: DgcConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for server-side lease arithmetic
    pub fn clock(mut self, clock: Arc<dyn LeaseClock>) -> Self {
        self.clock = clock;
        self
    }

    /// How the client reaches remote DGC servers; TCP by default
    pub fn connector(mut self, connector: Arc<dyn DgcConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Runtime background tasks are spawned on; the ambient one by default
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<DgcRuntime> {
        self.config.validate()?;

        let leases = Arc::new(LeaseRegistry::new(self.clock));
        let table = ObjectTable::new(
            self.endpoint.clone(),
            leases.clone(),
            self.config.server_gc_interval,
            self.runtime.clone(),
        );
        let server = DgcServer::new(table.clone(), leases.clone(), &self.config, self.runtime.clone());
        let dispatcher = Arc::new(DgcDispatcher::new(server.clone(), self.config.max_array_len));

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new()));
        let client = DgcClient::new(self.config.clone(), connector, self.runtime.clone());
        let acks = AckCoordinator::new(self.config.ack_timeout, self.runtime);

        info!(
            "DGC runtime for {} (lease {:?})",
            self.endpoint, self.config.lease_value
        );
        Ok(DgcRuntime {
            endpoint: self.endpoint,
            config: self.config,
            table,
            leases,
            server,
            dispatcher,
            client,
            acks,
        })
    }
}

/// Distributed garbage collection for one process
///
/// Manages:
/// - the object table of exported objects
/// - the lease registry and the `dirty`/`clean` service
/// - the client ledger of references into other processes
/// - acknowledgment holds for marshaled objects
pub struct DgcRuntime {
    endpoint: Endpoint,
    config: DgcConfig,
    table: Arc<ObjectTable>,
    leases: Arc<LeaseRegistry>,
    server: Arc<DgcServer>,
    dispatcher: Arc<DgcDispatcher>,
    client: DgcClient,
    acks: AckCoordinator,
}

impl DgcRuntime {
    pub fn builder(endpoint: Endpoint) -> DgcRuntimeBuilder {
        DgcRuntimeBuilder::new(endpoint)
    }

    /// Create a runtime with default settings
    pub fn new(endpoint: Endpoint, config: DgcConfig) -> Result<Self> {
        DgcRuntimeBuilder::new(endpoint).config(config).build()
    }

    /// Export `object` under a fresh id
    pub fn export(&self, object: Arc<dyn RemoteObject>) -> Result<Exported> {
        self.table.export(object, ExportOptions::default())
    }

    pub fn export_with(&self, object: Arc<dyn RemoteObject>, options: ExportOptions) -> Result<Exported> {
        self.table.export(object, options)
    }

    /// Withdraw an exported object
    ///
    /// Returns `Ok(false)` if calls are in flight and `force` is not set.
    pub fn unexport(&self, id: ObjectId, force: bool) -> Result<bool> {
        self.table.unexport(id, force)
    }

    /// Track references received from other processes
    pub async fn register_refs(&self, refs: Vec<RemoteRef>) -> Result<Vec<LiveRef>> {
        self.client.register(refs).await
    }

    /// Make this runtime reachable through `connector`
    pub fn attach_loopback(&self, connector: &LoopbackConnector) {
        connector.attach(self.endpoint.clone(), self.dispatcher.clone());
    }

    /// TCP accept loop serving this runtime's DGC requests
    pub fn listener(&self) -> DgcListener {
        DgcListener::new(self.dispatcher.clone())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &DgcConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<ObjectTable> {
        &self.table
    }

    pub fn leases(&self) -> &Arc<LeaseRegistry> {
        &self.leases
    }

    pub fn server(&self) -> &Arc<DgcServer> {
        &self.server
    }

    pub fn dispatcher(&self) -> &Arc<DgcDispatcher> {
        &self.dispatcher
    }

    pub fn client(&self) -> &DgcClient {
        &self.client
    }

    pub fn acks(&self) -> &AckCoordinator {
        &self.acks
    }

    /// Stop every background task and withdraw all exports
    pub fn shutdown(&self) {
        self.server.shutdown();
        self.client.shutdown();
        self.acks.shutdown();
        self.table.clear();
        info!("DGC runtime for {} shut down", self.endpoint);
    }
}
