//! Lease value exchanged by dirty calls

use std::time::Duration;

use super::VmId;

/// A time-bounded grant that a client VM holds references
///
/// Clients may omit the VMID on first contact; the server always answers
/// with a concrete one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    /// Client VM identifier, absent on first contact
    pub vmid: Option<VmId>,
    /// Requested (client) or granted (server) duration
    pub duration: Duration,
}

impl Lease {
    /// Create a lease
    pub fn new(vmid: Option<VmId>, duration: Duration) -> Self {
        Self { vmid, duration }
    }

    /// Duration in milliseconds as carried on the wire
    pub fn duration_millis(&self) -> i64 {
        i64::try_from(self.duration.as_millis()).unwrap_or(i64::MAX)
    }

    /// Build a lease from a wire duration; negative values clamp to zero
    pub fn from_millis(vmid: Option<VmId>, millis: i64) -> Self {
        Self::new(vmid, Duration::from_millis(millis.max(0) as u64))
    }
}
