//! Exported implementation objects

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::reclaim::Tracker;
use crate::types::{ObjectId, RemoteRef, Result};

/// Future returned by a remote invocation
pub type CallFuture = BoxFuture<'static, Result<Bytes>>;

/// An object that can be exported for remote invocation
pub trait RemoteObject: Send + Sync + 'static {
    /// Invoke an operation on this object
    fn invoke(&self, opnum: u16, args: Bytes) -> CallFuture;

    /// Callback capability fired when the last remote client lets go
    fn as_unreferenced(&self) -> Option<&dyn Unreferenced> {
        None
    }
}

/// Notification that no remote client references an object any more
pub trait Unreferenced: Send + Sync {
    /// Called off the DGC thread after the ref set becomes empty
    fn unreferenced(&self);
}

/// An exported implementation together with its reclamation tracker
///
/// Targets only hold this weakly unless pinned; when the last strong
/// reference goes away the tracker reports the object id to the table's
/// reclamation queue.
pub struct ExportedObject {
    id: ObjectId,
    stub: RemoteRef,
    object: Arc<dyn RemoteObject>,
    _tracker: Tracker<ObjectId>,
}

impl ExportedObject {
    pub(crate) fn new(
        id: ObjectId,
        stub: RemoteRef,
        object: Arc<dyn RemoteObject>,
        tracker: Tracker<ObjectId>,
    ) -> Self {
        Self {
            id,
            stub,
            object,
            _tracker: tracker,
        }
    }

    /// Object identifier
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Reference handed to remote clients
    pub fn stub(&self) -> &RemoteRef {
        &self.stub
    }

    /// The implementation
    pub fn object(&self) -> &Arc<dyn RemoteObject> {
        &self.object
    }
}

impl fmt::Debug for ExportedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedObject")
            .field("id", &self.id)
            .field("stub", &self.stub)
            .finish()
    }
}

/// Local handle that keeps an exported object reachable
///
/// Dropping every `Exported` clone makes the object collectable once no
/// remote client holds a lease on it.
#[derive(Clone, Debug)]
pub struct Exported {
    inner: Arc<ExportedObject>,
}

impl Exported {
    pub(crate) fn new(inner: Arc<ExportedObject>) -> Self {
        Self { inner }
    }

    /// Object identifier
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Reference to hand to remote clients
    pub fn stub(&self) -> &RemoteRef {
        &self.inner.stub
    }

    /// The implementation
    pub fn object(&self) -> &Arc<dyn RemoteObject> {
        &self.inner.object
    }

    pub(crate) fn inner(&self) -> &Arc<ExportedObject> {
        &self.inner
    }
}
