//! Client-side reference tracking
//!
//! Remote references received by this process are grouped per endpoint.
//! Each endpoint keeps its lease alive with periodic dirty calls and
//! tells the server, with clean calls, once no local instance of a
//! reference is left.

mod backoff;
mod dgc_client;
mod endpoint;
mod ledger;
mod live_ref;

pub use backoff::DirtyBackoff;
pub use dgc_client::DgcClient;
pub use endpoint::EndpointPhase;
pub use ledger::EndpointLedger;
pub use live_ref::LiveRef;
