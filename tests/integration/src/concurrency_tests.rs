//! Concurrency Tests - many clients, many references, racing drops
//!
//! These tests exercise the locking around ref tables by:
//! - registering the same reference from many tasks at once
//! - running many client runtimes against one TCP server
//! - racing registrations against drops of the same reference
//! - checking that no object is reclaimed while a reference is held

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Barrier;

use common::*;
use dgc::{DgcConfig, DgcRuntime, Endpoint};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_registration_dirties_once() {
    init_logging();

    const TASKS: usize = 32;

    let server = DgcRuntime::builder(Endpoint::new("server", 1099))
        .build()
        .unwrap();
    let pair = Arc::new(LoopbackPair::new(server, DgcConfig::default()));
    let exported = pair.server.export(Arc::new(Echo)).unwrap();
    let stub = exported.stub().clone();
    let barrier = Arc::new(Barrier::new(TASKS));

    let handles = (0..TASKS).map(|_| {
        let pair = pair.clone();
        let stub = stub.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            pair.client.register_refs(vec![stub]).await.unwrap()
        })
    });
    let live: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(pair.switch().dirties_naming(stub.id), 1);
    assert_eq!(pair.client.client().ledger().instance_count(&stub), TASKS);

    drop(live);
    assert!(wait_for(Duration::from_secs(5), || !pair.switch().cleans_naming(stub.id).is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pair.switch().cleans_naming(stub.id), vec![false]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_many_clients_over_tcp() {
    init_logging();

    const CLIENTS: usize = 8;
    const OBJECTS: usize = 20;

    let server = TcpServer::start(DgcConfig::default()).await;
    let exported: Vec<_> = (0..OBJECTS)
        .map(|_| server.runtime.export(Arc::new(Echo)).unwrap())
        .collect();
    let stubs: Vec<_> = exported.iter().map(|e| e.stub().clone()).collect();
    let ids: Vec<_> = exported.iter().map(|e| e.id()).collect();

    let clients: Vec<_> = (0..CLIENTS)
        .map(|_| Arc::new(tcp_client(DgcConfig::default())))
        .collect();
    let barrier = Arc::new(Barrier::new(CLIENTS));
    let handles = clients.iter().map(|client| {
        let client = client.clone();
        let stubs = stubs.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            client.register_refs(stubs).await.unwrap()
        })
    });
    let live: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let vmids: Vec<_> = clients.iter().map(|c| c.client().vmid()).collect();
    for id in &ids {
        let target = server.runtime.table().get_target(*id).unwrap();
        assert_eq!(target.ref_set().len(), CLIENTS);
        for vmid in &vmids {
            assert!(target.is_referenced_by(*vmid));
        }
    }
    assert_eq!(server.runtime.leases().len(), CLIENTS);

    drop(exported);
    drop(live);
    assert!(wait_for(Duration::from_secs(10), || server.runtime.table().is_empty()).await);

    for client in &clients {
        assert_eq!(client.client().ledger().endpoint_count(), 0);
        client.shutdown();
    }
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_held_reference_survives_churn() {
    init_logging();

    const TASKS: usize = 16;
    const ROUNDS: usize = 25;

    let server = DgcRuntime::builder(Endpoint::new("server", 1099))
        .build()
        .unwrap();
    let pair = Arc::new(LoopbackPair::new(server, DgcConfig::default()));
    let exported = pair.server.export(Arc::new(Echo)).unwrap();
    let id = exported.id();
    let stub = exported.stub().clone();
    drop(exported);

    // One reference is held throughout.
    let anchor = pair.client.register_refs(vec![stub.clone()]).await.unwrap();

    let handles = (0..TASKS).map(|_| {
        let pair = pair.clone();
        let stub = stub.clone();
        tokio::spawn(async move {
            for _ in 0..ROUNDS {
                let live = pair.client.register_refs(vec![stub.clone()]).await.unwrap();
                tokio::task::yield_now().await;
                drop(live);
            }
        })
    });
    for result in join_all(handles).await {
        result.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let target = pair.server.table().get_target(id).unwrap();
    assert!(target.is_live());
    assert!(pair.switch().cleans_naming(id).is_empty());

    drop(anchor);
    assert!(wait_for(Duration::from_secs(5), || !pair.server.table().contains(id)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_reregistration_after_release() {
    init_logging();

    const ROUNDS: usize = 10;

    let server = DgcRuntime::builder(Endpoint::new("server", 1099))
        .build()
        .unwrap();
    let pair = LoopbackPair::new(server, DgcConfig::default());
    let watched = Arc::new(Watched::default());
    let exported = pair.server.export(watched.clone()).unwrap();
    let stub = exported.stub().clone();

    for round in 1..=ROUNDS {
        let live = pair.client.register_refs(vec![stub.clone()]).await.unwrap();
        let vmid = pair.client.client().vmid();
        let target = pair.server.table().get_target(stub.id).unwrap();
        assert!(target.is_referenced_by(vmid));

        drop(live);
        assert!(wait_for(Duration::from_secs(5), || !target.is_referenced_by(vmid)).await);
        assert!(
            wait_for(Duration::from_secs(5), || {
                watched.unreferenced.load(Ordering::SeqCst) == round
            })
            .await
        );
    }

    assert_eq!(pair.switch().dirties_naming(stub.id), ROUNDS);
    assert_eq!(pair.switch().cleans_naming(stub.id).len(), ROUNDS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_contact_keeps_both_objects() {
    init_logging();

    let config = DgcConfig::default().with_lease_value(Duration::from_millis(400));
    let server = DgcRuntime::builder(Endpoint::new("server", 1099))
        .config(config.clone())
        .build()
        .unwrap();
    let pair = LoopbackPair::new(server, config);
    pair.switch().delay_dirty(Duration::from_millis(50));

    let first = pair.server.export(Arc::new(Echo)).unwrap();
    let second = pair.server.export(Arc::new(Echo)).unwrap();
    let ids = [first.id(), second.id()];
    let (a, b) = tokio::join!(
        pair.client.register_refs(vec![first.stub().clone()]),
        pair.client.register_refs(vec![second.stub().clone()]),
    );
    let (_a, _b) = (a.unwrap(), b.unwrap());
    drop(first);
    drop(second);

    // Several lease lifetimes pass on renewals alone.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let vmid = pair.client.client().vmid();
    for id in ids {
        let target = pair.server.table().get_target(id).unwrap();
        assert!(target.is_referenced_by(vmid));
        assert_eq!(target.ref_set(), vec![vmid]);
    }
    assert!(pair
        .switch()
        .dirty_vmids
        .lock()
        .iter()
        .all(|named| *named == Some(vmid)));
    assert_eq!(pair.server.leases().len(), 1);
}
