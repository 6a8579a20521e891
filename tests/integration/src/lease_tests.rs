//! Lease Tests - dirty/clean and lease expiry end to end
//!
//! These tests run a DGC server behind a real TCP listener (or an
//! in-process loopback where the server clock must be driven by hand) and
//! check that:
//! - a registered reference grants a lease and pins the object
//! - dropping the last local instance cleans and reclaims the object
//! - renewals keep a lease alive past its original expiry
//! - a client that disappears loses its lease on the next sweep

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use dgc::{DgcConfig, DgcRuntime, Endpoint, ManualClock};

#[tokio::test]
async fn test_dirty_over_tcp_grants_lease() {
    init_logging();

    let server = TcpServer::start(DgcConfig::default()).await;
    let client = tcp_client(DgcConfig::default());

    let exported = server.runtime.export(Arc::new(Echo)).unwrap();
    let live = client
        .register_refs(vec![exported.stub().clone()])
        .await
        .unwrap();

    let vmid = client.client().vmid();
    let target = server.runtime.table().get_target(exported.id()).unwrap();
    assert!(target.is_referenced_by(vmid));
    assert!(target.is_pinned());
    assert!(server.runtime.leases().expiration(vmid).is_some());
    assert!(server.runtime.server().lease_checker_running());

    let renew = client.client().ledger().renew_time(server.endpoint()).unwrap();
    let expiry = client.client().ledger().expiration_time(server.endpoint()).unwrap();
    assert!(renew < expiry);

    drop(live);
    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_clean_over_tcp_reclaims_object() {
    init_logging();

    let server = TcpServer::start(DgcConfig::default()).await;
    let client = tcp_client(DgcConfig::default());

    let exported = server.runtime.export(Arc::new(Echo)).unwrap();
    let id = exported.id();
    let live = client
        .register_refs(vec![exported.stub().clone()])
        .await
        .unwrap();
    drop(exported);

    // Only the remote lease keeps it now.
    assert!(server.runtime.table().contains(id));

    drop(live);
    assert!(wait_for(Duration::from_secs(5), || !server.runtime.table().contains(id)).await);
    assert_eq!(client.client().ledger().endpoint_count(), 0);

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_second_instance_does_not_dirty_again() {
    init_logging();

    let server = DgcRuntime::builder(Endpoint::new("server", 1099))
        .build()
        .unwrap();
    let pair = LoopbackPair::new(server, DgcConfig::default());

    let exported = pair.server.export(Arc::new(Echo)).unwrap();
    let stub = exported.stub().clone();
    let first = pair.client.register_refs(vec![stub.clone()]).await.unwrap();
    let second = pair.client.register_refs(vec![stub.clone()]).await.unwrap();

    assert_eq!(pair.switch().dirties_naming(exported.id()), 1);
    assert_eq!(pair.client.client().ledger().instance_count(&stub), 2);

    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pair.switch().cleans_naming(exported.id()).is_empty());

    drop(second);
    assert!(
        wait_for(Duration::from_secs(5), || {
            pair.switch().cleans_naming(exported.id()) == vec![false]
        })
        .await
    );
}

#[tokio::test]
async fn test_renewal_outlives_original_lease() {
    init_logging();

    let config = DgcConfig::default().with_lease_value(Duration::from_millis(400));
    let server = TcpServer::start(config.clone()).await;
    let client = tcp_client(config);

    let exported = server.runtime.export(Arc::new(Echo)).unwrap();
    let id = exported.id();
    let _live = client
        .register_refs(vec![exported.stub().clone()])
        .await
        .unwrap();
    drop(exported);
    let vmid = client.client().vmid();

    // Several lease lifetimes pass; renewals at half-life keep it alive.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let target = server.runtime.table().get_target(id).unwrap();
    assert!(target.is_referenced_by(vmid));
    assert!(target.is_live());

    client.shutdown();
    server.stop().await;
}

#[tokio::test]
async fn test_vanished_client_loses_lease() {
    init_logging();

    let clock = Arc::new(ManualClock::new());
    let server = DgcRuntime::builder(Endpoint::new("server", 1099))
        .clock(clock.clone())
        .build()
        .unwrap();
    let pair = LoopbackPair::new(server, DgcConfig::default());

    let watched = Arc::new(Watched::default());
    let exported = pair.server.export(watched.clone()).unwrap();
    let id = exported.id();
    let live = pair
        .client
        .register_refs(vec![exported.stub().clone()])
        .await
        .unwrap();
    drop(exported);
    let vmid = pair.client.client().vmid();

    // The client goes away without cleaning.
    pair.client.shutdown();
    drop(live);

    let lease = pair.server.server().lease_value();
    clock.advance(lease);
    assert!(pair.server.server().check_leases().is_empty());
    assert!(pair.server.table().contains(id));

    clock.advance(Duration::from_millis(1));
    assert_eq!(pair.server.server().check_leases(), vec![vmid]);
    assert!(!pair.server.leases().contains(vmid));

    assert!(wait_for(Duration::from_secs(5), || !pair.server.table().contains(id)).await);
    assert!(
        wait_for(Duration::from_secs(5), || {
            watched.unreferenced.load(Ordering::SeqCst) == 1
        })
        .await
    );
}

#[tokio::test]
async fn test_permanent_export_survives_clean() {
    init_logging();

    let server = DgcRuntime::builder(Endpoint::new("server", 1099))
        .build()
        .unwrap();
    let pair = LoopbackPair::new(server, DgcConfig::default());

    let exported = pair
        .server
        .export_with(
            Arc::new(Echo),
            dgc::ExportOptions::default().with_id(dgc::ObjectId(7)).permanent(),
        )
        .unwrap();
    let stub = exported.stub().clone();
    drop(exported);

    let live = pair.client.register_refs(vec![stub.clone()]).await.unwrap();
    drop(live);
    assert!(wait_for(Duration::from_secs(5), || !pair.switch().cleaned.lock().is_empty()).await);

    let target = pair.server.table().get_target(stub.id).unwrap();
    assert!(target.ref_set().is_empty());
    assert!(target.is_pinned());
    assert!(target.is_live());
}
