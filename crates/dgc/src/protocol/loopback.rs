//! In-process channel
//!
//! Drives a [`DgcDispatcher`] directly, still passing every message
//! through the wire codec. Endpoints can be detached to simulate an
//! unreachable server.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::trace;

use super::channel::{DgcConnector, DgcProxy, RpcChannel, RpcDgcProxy};
use super::dispatch::DgcDispatcher;
use super::wire;
use crate::types::{DgcError, Endpoint, Result};

type Registry = Arc<RwLock<HashMap<Endpoint, Arc<DgcDispatcher>>>>;

/// Channel to a dispatcher registered with a [`LoopbackConnector`]
pub struct LoopbackChannel {
    endpoint: Endpoint,
    registry: Registry,
}

#[async_trait]
impl RpcChannel for LoopbackChannel {
    async fn call(&self, opnum: u16, args: Bytes) -> Result<Bytes> {
        let dispatcher = self.registry.read().get(&self.endpoint).cloned();
        let dispatcher = dispatcher.ok_or_else(|| {
            DgcError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no loopback server at {}", self.endpoint),
            ))
        })?;
        trace!("loopback call {} to {}", opnum, self.endpoint);
        let reply = dispatcher.handle(wire::encode_request(opnum, &args));
        wire::decode_response(reply)
    }
}

/// Connector resolving endpoints to in-process dispatchers
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    registry: Registry,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `endpoint` with `dispatcher`
    pub fn attach(&self, endpoint: Endpoint, dispatcher: Arc<DgcDispatcher>) {
        self.registry.write().insert(endpoint, dispatcher);
    }

    /// Make `endpoint` unreachable; returns its dispatcher
    pub fn detach(&self, endpoint: &Endpoint) -> Option<Arc<DgcDispatcher>> {
        self.registry.write().remove(endpoint)
    }

    /// Raw channel to `endpoint`
    pub fn channel(&self, endpoint: &Endpoint) -> LoopbackChannel {
        LoopbackChannel {
            endpoint: endpoint.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl DgcConnector for LoopbackConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn DgcProxy>> {
        Ok(Arc::new(RpcDgcProxy::new(self.channel(endpoint))))
    }
}
