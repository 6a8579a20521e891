//! Server-side entry point for DGC requests
//!
//! Decodes a framed request, runs it against the [`DgcServer`] and frames
//! the reply. Failures never escape as errors: every request gets either
//! a result or a fault from the fixed [`FaultKind`] set.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::wire::{self, CleanArgs, DirtyArgs};
use crate::exporter::DgcServer;
use crate::types::{DgcError, FaultKind, Result};

/// Routes framed DGC requests to a [`DgcServer`]
pub struct DgcDispatcher {
    server: Arc<DgcServer>,
    max_array_len: usize,
}

impl DgcDispatcher {
    pub fn new(server: Arc<DgcServer>, max_array_len: usize) -> Self {
        Self {
            server,
            max_array_len,
        }
    }

    /// Server this dispatcher drives
    pub fn server(&self) -> &Arc<DgcServer> {
        &self.server
    }

    /// Handle one framed request and return the framed response
    pub fn handle(&self, payload: Bytes) -> Bytes {
        let result = wire::decode_request(payload).and_then(|(opnum, args)| self.dispatch(opnum, &args));
        match result {
            Ok(reply) => wire::encode_reply(&reply),
            Err(e) => {
                let kind = fault_kind(&e);
                match kind {
                    FaultKind::ProtocolViolation | FaultKind::UnknownOperation => {
                        warn!("rejected DGC request: {}", e)
                    }
                    _ => debug!("DGC request failed: {}", e),
                }
                wire::encode_fault(kind, &e.to_string())
            }
        }
    }

    /// Run operation `opnum` on already-unframed arguments
    pub fn dispatch(&self, opnum: u16, args: &[u8]) -> Result<Bytes> {
        match opnum {
            wire::OP_DIRTY => {
                let args = DirtyArgs::decode(args, self.max_array_len)?;
                let lease = self.server.dirty(&args.ids, args.sequence_num, args.lease)?;
                Ok(wire::encode_lease_result(lease))
            }
            wire::OP_CLEAN => {
                let args = CleanArgs::decode(args, self.max_array_len)?;
                self.server
                    .clean(&args.ids, args.sequence_num, args.vmid, args.strong)?;
                Ok(wire::encode_void_result())
            }
            other => Err(DgcError::RemoteFault {
                kind: FaultKind::UnknownOperation,
                message: format!("unknown DGC operation {}", other),
            }),
        }
    }
}

fn fault_kind(error: &DgcError) -> FaultKind {
    match error {
        DgcError::ProtocolViolation(_) | DgcError::BufferUnderflow { .. } => {
            FaultKind::ProtocolViolation
        }
        DgcError::RemoteFault { kind, .. } => *kind,
        DgcError::Shutdown => FaultKind::ShuttingDown,
        _ => FaultKind::ServerError,
    }
}
