//! Failure Tests - lost calls, unreachable servers and hostile input
//!
//! These tests inject failures between client and server and check that:
//! - failed dirty calls are retried and force strong cleans
//! - a late dirty retry cannot resurrect a strongly cleaned reference
//! - exhausted clean retries fall back to lease expiry
//! - malformed or oversized requests are answered with faults

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;

use common::*;
use dgc::protocol::{wire, DgcProxy, FrameTransport, RpcDgcProxy};
use dgc::{
    DgcConfig, DgcError, DgcRuntime, Endpoint, FaultKind, Lease, LoopbackConnector, ManualClock,
    ObjectId, VmId,
};

fn server() -> DgcRuntime {
    DgcRuntime::builder(Endpoint::new("server", 1099))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_failed_dirty_is_retried_then_cleaned_strongly() {
    init_logging();

    let config = DgcConfig::default().with_dirty_retry_floor(Duration::from_millis(20));
    let pair = LoopbackPair::new(server(), config);
    let exported = pair.server.export(Arc::new(Echo)).unwrap();
    let stub = exported.stub().clone();

    pair.switch().fail_dirty(true);
    let live = pair.client.register_refs(vec![stub.clone()]).await.unwrap();
    let ledger = pair.client.client().ledger();
    assert!(ledger.is_dirty_failed(&stub));
    assert_eq!(ledger.invalid_count(&stub.endpoint), 1);
    let vmid = pair.client.client().vmid();
    let target = pair.server.table().get_target(stub.id).unwrap();
    assert!(!target.is_referenced_by(vmid));

    pair.switch().fail_dirty(false);
    assert!(wait_for(Duration::from_secs(5), || target.is_referenced_by(vmid)).await);
    assert_eq!(ledger.invalid_count(&stub.endpoint), 0);

    drop(live);
    assert!(wait_for(Duration::from_secs(5), || !pair.switch().cleans_naming(stub.id).is_empty()).await);
    assert_eq!(pair.switch().cleans_naming(stub.id), vec![true]);

    // The strong clean leaves a sequence entry behind.
    assert!(!target.is_referenced_by(vmid));
    assert!(target.last_sequence(vmid).is_some());
}

#[tokio::test]
async fn test_late_dirty_after_strong_clean_is_ignored() {
    init_logging();

    let server = server();
    let loopback = LoopbackConnector::new();
    server.attach_loopback(&loopback);
    let proxy = RpcDgcProxy::new(loopback.channel(server.endpoint()));

    let exported = server.export(Arc::new(Echo)).unwrap();
    let ids = [exported.id()];
    let vmid = VmId::generate();
    let lease = Lease::new(Some(vmid), Duration::from_secs(60));

    let granted = proxy.dirty(&ids, 10, lease).await.unwrap();
    assert_eq!(granted.vmid, Some(vmid));
    assert_eq!(granted.duration, server.server().lease_value());

    proxy.clean(&ids, 11, vmid, true).await.unwrap();
    let target = server.table().get_target(exported.id()).unwrap();
    assert!(!target.is_referenced_by(vmid));

    // A delayed retry of the first dirty arrives after the clean.
    proxy.dirty(&ids, 10, lease).await.unwrap();
    assert!(!target.is_referenced_by(vmid));
    assert_eq!(target.last_sequence(vmid), Some(11));

    // Newer dirties still apply.
    proxy.dirty(&ids, 12, lease).await.unwrap();
    assert!(target.is_referenced_by(vmid));
}

#[tokio::test]
async fn test_exhausted_cleans_fall_back_to_lease_expiry() {
    init_logging();

    let clock = Arc::new(ManualClock::new());
    let server = DgcRuntime::builder(Endpoint::new("server", 1099))
        .clock(clock.clone())
        .build()
        .unwrap();
    let config = DgcConfig::default()
        .with_clean_failure_retries(2)
        .with_clean_interval(Duration::from_millis(30));
    let pair = LoopbackPair::new(server, config);

    let exported = pair.server.export(Arc::new(Echo)).unwrap();
    let id = exported.id();
    let live = pair
        .client
        .register_refs(vec![exported.stub().clone()])
        .await
        .unwrap();
    drop(exported);
    let vmid = pair.client.client().vmid();

    pair.switch().fail_clean(true);
    drop(live);
    assert!(
        wait_for(Duration::from_secs(5), || {
            pair.switch().clean_calls.load(std::sync::atomic::Ordering::SeqCst) == 2
                && pair.client.client().ledger().endpoint_count() == 0
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pair.switch().clean_calls.load(std::sync::atomic::Ordering::SeqCst), 2);

    // Still referenced until the lease runs out.
    assert!(pair.server.table().get_target(id).unwrap().is_referenced_by(vmid));

    clock.advance(pair.server.server().lease_value() + Duration::from_millis(1));
    assert_eq!(pair.server.server().check_leases(), vec![vmid]);
    assert!(wait_for(Duration::from_secs(5), || !pair.server.table().contains(id)).await);
}

#[tokio::test]
async fn test_unreachable_server_marks_refs_invalid() {
    init_logging();

    let pair = LoopbackPair::new(server(), DgcConfig::default());
    let exported = pair.server.export(Arc::new(Echo)).unwrap();
    pair.connector.loopback.detach(pair.server.endpoint());

    let stub = exported.stub().clone();
    let live = pair.client.register_refs(vec![stub.clone()]).await.unwrap();
    assert!(live[0].is_tracked());
    assert!(pair.client.client().ledger().is_dirty_failed(&stub));
    assert_eq!(pair.client.client().ledger().dirty_failures(&stub.endpoint), 1);
    assert!(pair.server.table().get_target(stub.id).unwrap().ref_set().is_empty());
}

#[tokio::test]
async fn test_shut_down_server_faults_dirty() {
    init_logging();

    let server = server();
    let loopback = LoopbackConnector::new();
    server.attach_loopback(&loopback);
    let proxy = RpcDgcProxy::new(loopback.channel(server.endpoint()));
    server.server().shutdown();

    let result = proxy.dirty(&[ObjectId(1)], 0, Lease::new(None, Duration::ZERO)).await;
    match result {
        Err(DgcError::RemoteFault { kind, .. }) => assert_eq!(kind, FaultKind::ShuttingDown),
        other => panic!("expected a fault, got {:?}", other),
    }
}

#[tokio::test]
async fn test_oversized_id_array_is_rejected() {
    init_logging();

    let server = DgcRuntime::builder(Endpoint::new("server", 1099))
        .config(DgcConfig::default().with_max_array_len(4))
        .build()
        .unwrap();
    let loopback = LoopbackConnector::new();
    server.attach_loopback(&loopback);
    let proxy = RpcDgcProxy::new(loopback.channel(server.endpoint()));

    let ids: Vec<ObjectId> = (0..5).map(ObjectId).collect();
    let result = proxy.dirty(&ids, 0, Lease::new(None, Duration::ZERO)).await;
    match result {
        Err(DgcError::RemoteFault { kind, .. }) => assert_eq!(kind, FaultKind::ProtocolViolation),
        other => panic!("expected a fault, got {:?}", other),
    }
    assert!(server.leases().is_empty());

    proxy.dirty(&ids[..4], 1, Lease::new(None, Duration::ZERO)).await.unwrap();
}

#[tokio::test]
async fn test_garbage_over_tcp_gets_fault() {
    init_logging();

    let server = TcpServer::start(DgcConfig::default()).await;
    let stream = TcpStream::connect((server.endpoint().host(), server.endpoint().port()))
        .await
        .unwrap();
    let mut transport = FrameTransport::new(stream);

    transport.write_frame(1, b"\x07not a dgc request").await.unwrap();
    let (call_id, reply) = transport.read_frame().await.unwrap();
    assert_eq!(call_id, 1);
    match wire::decode_response(reply) {
        Err(DgcError::RemoteFault { kind, .. }) => assert_eq!(kind, FaultKind::ProtocolViolation),
        other => panic!("expected a fault, got {:?}", other),
    }

    // The connection survives and serves a proper request.
    let args = wire::DirtyArgs {
        ids: vec![],
        sequence_num: 0,
        lease: Lease::new(None, Duration::ZERO),
    };
    let request = wire::encode_request(wire::OP_DIRTY, &args.encode());
    transport.write_frame(2, &request).await.unwrap();
    let (call_id, reply) = transport.read_frame().await.unwrap();
    assert_eq!(call_id, 2);
    let lease = wire::decode_lease_result(&wire::decode_response(reply).unwrap()).unwrap();
    assert!(lease.vmid.is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_operation_faults() {
    init_logging();

    let server = server();
    let reply = server
        .dispatcher()
        .handle(wire::encode_request(42, &Bytes::new()));
    match wire::decode_response(reply) {
        Err(DgcError::RemoteFault { kind, .. }) => assert_eq!(kind, FaultKind::UnknownOperation),
        other => panic!("expected a fault, got {:?}", other),
    }
}
