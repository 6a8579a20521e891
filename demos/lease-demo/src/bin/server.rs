//! DGC Demo Server
//!
//! Exports a handful of objects and reports which of them are still
//! alive. The server drops its own handles after `--hold-secs`; from then
//! on only client leases keep the objects around.
//!
//! USAGE:
//!   dgc-server [OPTIONS]
//!
//! EXAMPLES:
//!   dgc-server                           # 4 objects on 127.0.0.1:12360
//!   dgc-server --objects 10 --lease-ms 20000
//!   dgc-server --host 0.0.0.0 --port 9000

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use dgc::exporter::CallFuture;
use dgc::{DgcConfig, DgcRuntime, Endpoint, ExportOptions, ObjectId, RemoteObject, Unreferenced};
use lease_demo::*;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dgc-server")]
#[command(version)]
#[command(about = "Exports objects and reclaims them once no client holds a lease")]
struct Args {
    /// Host address to bind to
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port number to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Number of objects to export
    #[arg(long, default_value_t = 4)]
    objects: u64,

    /// Lease granted to clients, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    lease_ms: u64,

    /// Seconds before the server lets go of its own handles
    #[arg(long, default_value_t = 30)]
    hold_secs: u64,

    /// Seconds between status reports
    #[arg(long, default_value_t = 5)]
    report_secs: u64,
}

struct Greeter {
    id: u64,
}

impl RemoteObject for Greeter {
    fn invoke(&self, _opnum: u16, _args: Bytes) -> CallFuture {
        let reply = Bytes::from(format!("hello from object {}", self.id));
        Box::pin(async move { Ok(reply) })
    }

    fn as_unreferenced(&self) -> Option<&dyn Unreferenced> {
        Some(self)
    }
}

impl Unreferenced for Greeter {
    fn unreferenced(&self) {
        println!("[DGC] object {} has no remote clients", self.id);
    }
}

fn report(runtime: &DgcRuntime) {
    let mut ids = runtime.table().ids();
    ids.sort();
    println!(
        "[DGC] {} object(s) exported, {} lease(s) held",
        ids.len(),
        runtime.leases().len()
    );
    for id in ids {
        if let Some(target) = runtime.table().get_target(id) {
            println!(
                "        {}  clients: {}  pinned: {}",
                id,
                target.ref_set().len(),
                target.is_pinned()
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();

    let config = DgcConfig::from_env()?.with_lease_value(Duration::from_millis(args.lease_ms));
    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    let runtime = Arc::new(DgcRuntime::new(Endpoint::new(args.host.as_str(), args.port), config)?);

    let mut handles = Vec::new();
    for n in 0..args.objects {
        let id = ObjectId(FIRST_OBJECT_ID + n);
        let exported = runtime.export_with(Arc::new(Greeter { id: id.0 }), ExportOptions::default().with_id(id))?;
        handles.push(exported);
    }

    println!("========================================================");
    println!("         DGC Demo Server");
    println!("========================================================");
    println!("  Listening: {}", runtime.endpoint());
    println!("  Objects:   {}..{}", FIRST_OBJECT_ID, FIRST_OBJECT_ID + args.objects);
    println!("  Lease:     {} ms", args.lease_ms);
    println!("  Press Ctrl+C to stop");
    println!("========================================================");

    let dgc = runtime.listener();
    let server = tokio::spawn(async move { dgc.serve(listener).await });

    let mut ticker = tokio::time::interval(Duration::from_secs(args.report_secs.max(1)));
    let release = tokio::time::sleep(Duration::from_secs(args.hold_secs));
    tokio::pin!(release);
    let mut released = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut release, if !released => {
                info!("dropping local handles; only leases keep objects alive now");
                handles.clear();
                released = true;
            }
            _ = ticker.tick() => report(&runtime),
        }
    }

    server.abort();
    runtime.shutdown();
    Ok(())
}
