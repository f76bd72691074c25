//! Fuzz target for inbound frames against an established session
//!
//! No sequence of unauthenticated frames may panic or change session state.

#![no_main]

use busseal_core::{
    GroupConfig, GroupId, HandshakeState, KeyStore, NodeId, SessionConfig, SessionManager,
};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

const GROUP: GroupId = GroupId::new(1);

fn established() -> SessionManager {
    let config = GroupConfig {
        id: 1,
        long_term_key: vec![0x5A; 32],
        members: vec![1, 2],
    };
    let keystore = Arc::new(KeyStore::from_configs([&config]).expect("valid group"));
    let a = SessionManager::new(NodeId::new(1), Arc::clone(&keystore), SessionConfig::default());
    let b = SessionManager::new(NodeId::new(2), keystore, SessionConfig::default());

    let request = a.pack(&a.build_request(GROUP).expect("request")).expect("pack");
    let response = b
        .process_received(&request)
        .expect("response")
        .reaction
        .expect("reaction");
    a.process_received(&b.pack(&response).expect("pack")).expect("established");
    a
}

fuzz_target!(|frames: Vec<Vec<u8>>| {
    let node = established();
    let session = node.session_id(GROUP);
    for frame in &frames {
        let _ = node.process_received(frame);
    }
    assert_eq!(node.state(GROUP), Some(HandshakeState::Established));
    assert_eq!(node.session_id(GROUP), session);
});
