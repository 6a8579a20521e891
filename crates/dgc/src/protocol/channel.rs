//! Seams between the collector and the RPC layer
//!
//! [`RpcChannel`] is the opaque request/response channel to one remote
//! endpoint. [`DgcProxy`] is the typed view of the remote DGC service
//! the client half talks to; [`RpcDgcProxy`] implements it over any
//! channel through the wire codec.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::wire::{self, CleanArgs, DirtyArgs};
use crate::types::{Endpoint, Lease, ObjectId, Result, VmId};

/// Request/response channel to a remote endpoint
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Send `args` for operation `opnum` and return the reply value.
    /// A fault reply surfaces as [`crate::DgcError::RemoteFault`].
    async fn call(&self, opnum: u16, args: Bytes) -> Result<Bytes>;
}

/// The remote DGC service of one endpoint
#[async_trait]
pub trait DgcProxy: Send + Sync {
    /// Acquire or renew a lease on `ids`
    async fn dirty(&self, ids: &[ObjectId], sequence_num: i64, lease: Lease) -> Result<Lease>;

    /// Release `ids`
    async fn clean(&self, ids: &[ObjectId], sequence_num: i64, vmid: VmId, strong: bool)
        -> Result<()>;
}

/// Creates proxies for remote endpoints
pub trait DgcConnector: Send + Sync {
    /// Proxy for the DGC service at `endpoint`; connecting may be deferred
    /// to the first call
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn DgcProxy>>;
}

/// [`DgcProxy`] speaking the wire codec over an [`RpcChannel`]
pub struct RpcDgcProxy<C> {
    channel: C,
}

impl<C: RpcChannel> RpcDgcProxy<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }
}

#[async_trait]
impl<C: RpcChannel> DgcProxy for RpcDgcProxy<C> {
    async fn dirty(&self, ids: &[ObjectId], sequence_num: i64, lease: Lease) -> Result<Lease> {
        let args = DirtyArgs {
            ids: ids.to_vec(),
            sequence_num,
            lease,
        };
        let reply = self.channel.call(wire::OP_DIRTY, args.encode()).await?;
        wire::decode_lease_result(&reply)
    }

    async fn clean(
        &self,
        ids: &[ObjectId],
        sequence_num: i64,
        vmid: VmId,
        strong: bool,
    ) -> Result<()> {
        let args = CleanArgs {
            ids: ids.to_vec(),
            sequence_num,
            vmid,
            strong,
        };
        let reply = self.channel.call(wire::OP_CLEAN, args.encode()).await?;
        wire::decode_void_result(&reply)
    }
}
