//! Common test utilities for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use dgc::exporter::CallFuture;
use dgc::protocol::{DgcConnector, DgcProxy};
use dgc::{
    DgcConfig, DgcError, DgcRuntime, Endpoint, Lease, LoopbackConnector, ObjectId, RemoteObject,
    Result, Unreferenced, VmId,
};

/// Install a tracing subscriber once; honours `RUST_LOG`
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Object that echoes its arguments
pub struct Echo;

impl RemoteObject for Echo {
    fn invoke(&self, _opnum: u16, args: Bytes) -> CallFuture {
        Box::pin(async move { Ok(args) })
    }
}

/// Object counting how often it became unreferenced
#[derive(Default)]
pub struct Watched {
    pub unreferenced: AtomicUsize,
}

impl RemoteObject for Watched {
    fn invoke(&self, _opnum: u16, args: Bytes) -> CallFuture {
        Box::pin(async move { Ok(args) })
    }

    fn as_unreferenced(&self) -> Option<&dyn Unreferenced> {
        Some(self)
    }
}

impl Unreferenced for Watched {
    fn unreferenced(&self) {
        self.unreferenced.fetch_add(1, Ordering::SeqCst);
    }
}

/// A runtime serving DGC over TCP on an ephemeral local port
pub struct TcpServer {
    pub runtime: Arc<DgcRuntime>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl TcpServer {
    pub async fn start(config: DgcConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let runtime = Arc::new(DgcRuntime::new(Endpoint::new("127.0.0.1", port), config).unwrap());

        let (tx, rx) = oneshot::channel();
        let dgc = runtime.listener();
        let task = tokio::spawn(async move {
            dgc.serve_until(listener, async {
                let _ = rx.await;
            })
            .await
        });

        Self {
            runtime,
            shutdown: Some(tx),
            task,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.runtime.endpoint()
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
        self.runtime.shutdown();
    }
}

/// A client runtime that talks TCP
pub fn tcp_client(config: DgcConfig) -> DgcRuntime {
    DgcRuntime::new(Endpoint::new("127.0.0.1", 1), config).unwrap()
}

/// Knobs and counters shared by every [`FaultyProxy`] of one connector
#[derive(Default)]
pub struct FaultSwitch {
    pub fail_dirty: AtomicBool,
    pub fail_clean: AtomicBool,
    /// Milliseconds every dirty call is held before it is forwarded
    pub dirty_delay_ms: AtomicU64,
    pub dirty_calls: AtomicUsize,
    pub clean_calls: AtomicUsize,
    pub dirtied: Mutex<Vec<Vec<ObjectId>>>,
    /// VMID each dirty call named, in send order
    pub dirty_vmids: Mutex<Vec<Option<VmId>>>,
    pub cleaned: Mutex<Vec<(Vec<ObjectId>, bool)>>,
}

impl FaultSwitch {
    pub fn fail_dirty(&self, fail: bool) {
        self.fail_dirty.store(fail, Ordering::SeqCst);
    }

    pub fn fail_clean(&self, fail: bool) {
        self.fail_clean.store(fail, Ordering::SeqCst);
    }

    pub fn delay_dirty(&self, delay: Duration) {
        self.dirty_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Dirty calls that named `id`
    pub fn dirties_naming(&self, id: ObjectId) -> usize {
        self.dirtied.lock().iter().filter(|ids| ids.contains(&id)).count()
    }

    /// Successful clean calls that named `id`
    pub fn cleans_naming(&self, id: ObjectId) -> Vec<bool> {
        self.cleaned
            .lock()
            .iter()
            .filter(|(ids, _)| ids.contains(&id))
            .map(|(_, strong)| *strong)
            .collect()
    }
}

fn injected() -> DgcError {
    DgcError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "injected failure",
    ))
}

/// Proxy that can be told to fail, recording what got through
pub struct FaultyProxy {
    inner: Arc<dyn DgcProxy>,
    switch: Arc<FaultSwitch>,
}

#[async_trait]
impl DgcProxy for FaultyProxy {
    async fn dirty(&self, ids: &[ObjectId], sequence_num: i64, lease: Lease) -> Result<Lease> {
        self.switch.dirty_calls.fetch_add(1, Ordering::SeqCst);
        self.switch.dirty_vmids.lock().push(lease.vmid);
        let delay = self.switch.dirty_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.switch.fail_dirty.load(Ordering::SeqCst) {
            return Err(injected());
        }
        let granted = self.inner.dirty(ids, sequence_num, lease).await?;
        self.switch.dirtied.lock().push(ids.to_vec());
        Ok(granted)
    }

    async fn clean(&self, ids: &[ObjectId], sequence_num: i64, vmid: VmId, strong: bool) -> Result<()> {
        self.switch.clean_calls.fetch_add(1, Ordering::SeqCst);
        if self.switch.fail_clean.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.clean(ids, sequence_num, vmid, strong).await?;
        self.switch.cleaned.lock().push((ids.to_vec(), strong));
        Ok(())
    }
}

/// Loopback connector whose proxies pass through a [`FaultSwitch`]
pub struct FaultyConnector {
    pub loopback: LoopbackConnector,
    pub switch: Arc<FaultSwitch>,
}

impl FaultyConnector {
    pub fn new(loopback: LoopbackConnector) -> Arc<Self> {
        Arc::new(Self {
            loopback,
            switch: Arc::new(FaultSwitch::default()),
        })
    }
}

impl DgcConnector for FaultyConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn DgcProxy>> {
        Ok(Arc::new(FaultyProxy {
            inner: self.loopback.connect(endpoint)?,
            switch: self.switch.clone(),
        }))
    }
}

/// Server and client runtimes joined by a fault-injecting loopback
pub struct LoopbackPair {
    pub server: DgcRuntime,
    pub client: DgcRuntime,
    pub connector: Arc<FaultyConnector>,
}

impl LoopbackPair {
    pub fn new(server: DgcRuntime, client_config: DgcConfig) -> Self {
        let loopback = LoopbackConnector::new();
        server.attach_loopback(&loopback);
        let connector = FaultyConnector::new(loopback);
        let client = DgcRuntime::builder(Endpoint::new("client", 1))
            .config(client_config)
            .connector(connector.clone())
            .build()
            .unwrap();
        Self {
            server,
            client,
            connector,
        }
    }

    pub fn switch(&self) -> &FaultSwitch {
        &self.connector.switch
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` passes
pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Result of a test category run by the harness
#[derive(Debug, Default)]
pub struct TestSuiteResults {
    pub passed: usize,
    pub failed: usize,
}

impl TestSuiteResults {
    pub fn record(&mut self, success: bool) {
        if success {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}
