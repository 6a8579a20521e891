//! Common definitions shared between the demo client and server

use tracing_subscriber::EnvFilter;

/// Default server address
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default DGC port
pub const DEFAULT_PORT: u16 = 12360;
/// First object id exported by the demo server
pub const FIRST_OBJECT_ID: u64 = 100;

/// Log to stderr, `info` unless `RUST_LOG` says otherwise
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
