//! Locally held instances of remote references

use std::fmt;

use super::endpoint::TrackerKey;
use crate::reclaim::Tracker;
use crate::types::{Endpoint, ObjectId, RemoteRef};

/// One local instance of a remote reference
///
/// While any `LiveRef` for a remote object exists, the client keeps its
/// lease renewed. Dropping the last one schedules a clean call. Refs to
/// objects exported by this process are untracked.
pub struct LiveRef {
    remote: RemoteRef,
    tracker: Option<Tracker<TrackerKey>>,
}

impl LiveRef {
    pub(crate) fn tracked(remote: RemoteRef, tracker: Tracker<TrackerKey>) -> Self {
        Self {
            remote,
            tracker: Some(tracker),
        }
    }

    pub(crate) fn untracked(remote: RemoteRef) -> Self {
        Self {
            remote,
            tracker: None,
        }
    }

    /// The remote reference
    pub fn remote(&self) -> &RemoteRef {
        &self.remote
    }

    /// Object identifier
    pub fn id(&self) -> ObjectId {
        self.remote.id
    }

    /// Endpoint of the exporting process
    pub fn endpoint(&self) -> &Endpoint {
        &self.remote.endpoint
    }

    /// Whether dropping this instance is reported to the collector
    pub fn is_tracked(&self) -> bool {
        self.tracker.is_some()
    }
}

impl fmt::Debug for LiveRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveRef")
            .field("remote", &self.remote)
            .field("tracked", &self.is_tracked())
            .finish()
    }
}
