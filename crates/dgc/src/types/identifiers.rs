//! DGC identifier types
//!
//! - `ObjectId`: identifies an exported object within a server process
//! - `VmId`: identifies a client process holding leases
//! - `AckId`: identifies one outbound message awaiting acknowledgment

use bytes::{Buf, BufMut};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Object Identifier (8 bytes)
///
/// Unique within the exporting process for its whole lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Size of an ObjectId in bytes
    pub const SIZE: usize = 8;

    /// Identifier of the DGC service object itself
    pub const DGC: ObjectId = ObjectId(2);

    /// First identifier handed out by [`ObjectIdAllocator`]; lower values
    /// are reserved for well-known objects and explicit exports.
    pub const FIRST_DYNAMIC: u64 = 1 << 16;

    /// Create a new ObjectId
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Encode to buffer (little endian)
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.0);
    }

    /// Decode from buffer (little endian)
    pub fn decode<B: Buf>(buf: &mut B) -> Self {
        Self(buf.get_u64_le())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjID({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocator for dynamically exported object identifiers
#[derive(Debug)]
pub struct ObjectIdAllocator {
    next: AtomicU64,
}

impl ObjectIdAllocator {
    /// Create an allocator starting at [`ObjectId::FIRST_DYNAMIC`]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(ObjectId::FIRST_DYNAMIC),
        }
    }

    /// Allocate the next identifier
    pub fn allocate(&self) -> ObjectId {
        ObjectId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ObjectIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Client VM Identifier (16 bytes / UUID)
///
/// Minted by a server on a client's first dirty call and reused by that
/// client for every later call to any server.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(pub uuid::Uuid);

impl VmId {
    /// Size of a VmId in bytes
    pub const SIZE: usize = 16;

    /// Generate a random VmId
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// Encode to buffer
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.0.as_bytes());
    }

    /// Decode from buffer
    pub fn decode<B: Buf>(buf: &mut B) -> Self {
        let mut bytes = [0u8; 16];
        buf.copy_to_slice(&mut bytes);
        Self::from_bytes(bytes)
    }
}

impl fmt::Debug for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VMID({})", self.0)
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Acknowledgment identifier for one outbound message
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AckId(pub u64);

impl AckId {
    /// Create a new AckId
    pub fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Debug for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AckId({:016x})", self.0)
    }
}

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
