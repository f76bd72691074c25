//! Session managers exchanging frames over the in-process bus.

use busseal_core::{Error, HandshakeState};
use busseal_integration_tests::*;
use busseal_transport::{BusTransport, MemoryBus, MemoryPort};
use std::time::Duration;
use tokio::time::timeout;

async fn recv(port: &MemoryPort) -> Vec<u8> {
    timeout(Duration::from_secs(1), port.recv_frame())
        .await
        .expect("frame within timeout")
        .expect("bus open")
        .data
}

#[tokio::test]
async fn test_handshake_and_data_over_bus() {
    let keystore = keystore();
    let a = manager(1, &keystore, 1);
    let b = manager(2, &keystore, 2);
    let bus = MemoryBus::new(16);
    let port_a = bus.port();
    let port_b = bus.port();

    let request = a.pack(&a.build_request(GROUP).unwrap()).unwrap();
    port_a.send_frame(0x101, &request).await.unwrap();

    let frame = recv(&port_b).await;
    let response = b.process_received(&frame).unwrap().reaction.unwrap();
    port_b.send_frame(0x102, &b.pack(&response).unwrap()).await.unwrap();

    let frame = recv(&port_a).await;
    a.process_received(&frame).unwrap();
    assert_eq!(a.state(GROUP), Some(HandshakeState::Established));

    port_a
        .send_frame(0x101, &secured_frame(&a, b"LOCK"))
        .await
        .unwrap();
    let frame = recv(&port_b).await;
    let message = b.process_received(&frame).unwrap().message.unwrap();
    assert_eq!(message.plaintext, b"LOCK");
}

#[tokio::test]
async fn test_eavesdropper_replay_rejected() {
    let (a, b) = established_pair();
    let bus = MemoryBus::new(16);
    let port_a = bus.port();
    let port_b = bus.port();
    let attacker = bus.port();

    port_a
        .send_frame(0x101, &secured_frame(&a, b"UNLOCK"))
        .await
        .unwrap();
    let captured = recv(&attacker).await;
    b.process_received(&recv(&port_b).await).unwrap();

    attacker.send_frame(0x101, &captured).await.unwrap();
    let replayed = recv(&port_b).await;
    assert!(matches!(
        b.process_received(&replayed),
        Err(Error::ReplayedOrStale { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_senders() {
    let (a, b) = established_pair();
    let bus = MemoryBus::new(64);
    let port_a = bus.port();
    let port_b = bus.port();

    let sender = tokio::spawn(async move {
        for i in 0..20u8 {
            port_a
                .send_frame(0x101, &secured_frame(&a, &[i]))
                .await
                .unwrap();
        }
    });

    let mut received = Vec::new();
    while received.len() < 20 {
        let frame = recv(&port_b).await;
        received.push(b.process_received(&frame).unwrap().message.unwrap());
    }
    sender.await.unwrap();

    let counters: Vec<u32> = received.iter().map(|m| m.counter).collect();
    assert_eq!(counters, (1..=20).collect::<Vec<_>>());
    assert_eq!(received[19].plaintext, [19]);
}
