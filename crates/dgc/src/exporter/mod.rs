//! Server side of the collector
//!
//! - [`ObjectTable`]: exported objects and their [`Target`]s
//! - [`LeaseRegistry`]: per-VM leases and the expiry sweep
//! - [`DgcServer`]: the `dirty`/`clean` operations
//! - [`KeepAlive`]: runs the reclamation watcher while needed

mod dgc_server;
mod keep_alive;
mod lease_registry;
mod object_table;
mod remote_object;
mod target;

pub use dgc_server::DgcServer;
pub use keep_alive::KeepAlive;
pub use lease_registry::{LeaseEntry, LeaseRegistry};
pub use object_table::{ExportOptions, ObjectTable};
pub use remote_object::{CallFuture, Exported, ExportedObject, RemoteObject, Unreferenced};
pub use target::{CallGuard, SequenceOutcome, Target};
