//! Core DGC types
//!
//! - Identifiers: `ObjectId`, `VmId`, `AckId`
//! - Endpoints and remote references
//! - Leases
//! - Errors

mod endpoint;
mod error;
mod identifiers;
mod lease;

pub use endpoint::{Endpoint, FactoryId, RemoteRef};
pub use error::*;
pub use identifiers::{AckId, ObjectId, ObjectIdAllocator, VmId};
pub use lease::Lease;
