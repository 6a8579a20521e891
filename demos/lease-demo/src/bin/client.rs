//! DGC Demo Client
//!
//! Registers references to objects on a demo server, holds them while the
//! lease is renewed in the background, then drops them.
//!
//! USAGE:
//!   dgc-client [OPTIONS] [IDS]...
//!
//! EXAMPLES:
//!   dgc-client                           # hold objects 100..104 for 20s
//!   dgc-client 100 101 --hold-secs 60
//!   dgc-client --crash                   # vanish without cleaning

use std::time::Duration;

use clap::Parser;
use dgc::{DgcConfig, DgcRuntime, Endpoint, ObjectId, RemoteRef};
use lease_demo::*;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dgc-client")]
#[command(version)]
#[command(about = "Holds remote references on a demo server for a while")]
struct Args {
    /// Host address to connect to
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port number to connect to
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Object ids to reference
    #[arg(value_name = "IDS")]
    ids: Vec<u64>,

    /// Seconds to hold the references
    #[arg(long, default_value_t = 20)]
    hold_secs: u64,

    /// Exit without sending clean calls, leaving the server to expire the lease
    #[arg(long)]
    crash: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();

    let server = Endpoint::new(args.host.as_str(), args.port);
    let ids = if args.ids.is_empty() {
        (FIRST_OBJECT_ID..FIRST_OBJECT_ID + 4).collect()
    } else {
        args.ids.clone()
    };

    // This process exports nothing; its own endpoint is never dialled.
    let runtime = DgcRuntime::new(Endpoint::new("127.0.0.1", 0), DgcConfig::from_env()?)?;
    let refs: Vec<RemoteRef> = ids
        .iter()
        .map(|id| RemoteRef::new(ObjectId(*id), server.clone()))
        .collect();
    let live = runtime.register_refs(refs).await?;

    let ledger = runtime.client().ledger();
    let vmid = runtime.client().vmid();
    if ledger.dirty_failures(&server) == 0 {
        println!("[DGC] holding {} reference(s) on {} as {}", live.len(), server, vmid);
    } else {
        println!(
            "[DGC] holding {} reference(s) on {} as {}; dirty failed, retrying in the background",
            live.len(),
            server,
            vmid
        );
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let hold = tokio::time::sleep(Duration::from_secs(args.hold_secs));
    tokio::pin!(hold);
    loop {
        tokio::select! {
            _ = &mut hold => break,
            _ = ticker.tick() => {
                if let Some(expiry) = ledger.expiration_time(&server) {
                    info!(
                        "lease on {} valid for another {:?}",
                        server,
                        expiry.saturating_duration_since(std::time::Instant::now())
                    );
                }
            }
        }
    }

    if args.crash {
        println!("[DGC] exiting without cleaning");
        runtime.shutdown();
        return Ok(());
    }

    drop(live);
    for _ in 0..50 {
        if ledger.endpoint_count() == 0 && ledger.pending_clean_count(&server) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    println!("[DGC] references released");
    runtime.shutdown();
    Ok(())
}
