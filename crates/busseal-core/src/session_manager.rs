//! Node-level session management.
//!
//! The [`SessionManager`] holds one [`ClientContext`] per group the node is a
//! member of and routes inbound frames to them. Contexts live in a
//! [`DashMap`], so different groups are processed concurrently through
//! `&self` while a single context is only ever touched by one caller.

use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::context::{ClientContext, HandshakeState};
use crate::error::{Error, Result};
use crate::frame::{FrameCodec, Payload, Pdu, SessionId};
use crate::keystore::{GroupId, KeyStore, NodeId};
use busseal_crypto::{OsRandom, RandomSource};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Application message recovered from a secured-data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxMessage {
    /// Group the message was sent to
    pub group_id: GroupId,
    /// Session it was sent in
    pub session_id: SessionId,
    /// Member that sent it
    pub sender: NodeId,
    /// Sender's counter
    pub counter: u32,
    /// Decrypted payload
    pub plaintext: Vec<u8>,
}

/// Outcome of processing one inbound frame.
///
/// A request yields a `reaction` (the response to transmit); secured data
/// yields a `message`; a response yields neither.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Received {
    /// PDU the caller must transmit in reply
    pub reaction: Option<Pdu>,
    /// Message to deliver to the application
    pub message: Option<RxMessage>,
}

/// Protocol endpoint for one node.
pub struct SessionManager<R = OsRandom, C = SystemClock> {
    node_id: NodeId,
    keystore: Arc<KeyStore>,
    codec: FrameCodec,
    contexts: DashMap<GroupId, ClientContext>,
    random: R,
    clock: C,
}

impl SessionManager {
    /// Create a manager drawing from the OS CSPRNG and the system clock.
    #[must_use]
    pub fn new(node_id: NodeId, keystore: Arc<KeyStore>, config: SessionConfig) -> Self {
        Self::with_sources(node_id, keystore, config, OsRandom, SystemClock)
    }
}

impl<R: RandomSource, C: Clock> SessionManager<R, C> {
    /// Create a manager with explicit randomness and time sources.
    ///
    /// One context is created for each group in `keystore` that lists
    /// `node_id` as a member.
    pub fn with_sources(
        node_id: NodeId,
        keystore: Arc<KeyStore>,
        config: SessionConfig,
        random: R,
        clock: C,
    ) -> Self {
        let contexts = DashMap::new();
        for group in keystore.groups_of(node_id) {
            contexts.insert(group.id(), ClientContext::new(Arc::clone(group), node_id, config.clone()));
        }
        debug!(node = %node_id, groups = contexts.len(), "session manager created");

        Self {
            node_id,
            keystore,
            codec: FrameCodec::new(config.header_type),
            contexts,
            random,
            clock,
        }
    }

    /// This node's identifier
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Key store the manager was built from
    #[must_use]
    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    /// Frame codec in use
    #[must_use]
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Groups this node holds a context for
    #[must_use]
    pub fn groups(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.contexts.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Handshake state of a group's context
    #[must_use]
    pub fn state(&self, group_id: GroupId) -> Option<HandshakeState> {
        self.contexts.get(&group_id).map(|ctx| ctx.state())
    }

    /// Pending or established session identifier of a group
    #[must_use]
    pub fn session_id(&self, group_id: GroupId) -> Option<SessionId> {
        self.contexts.get(&group_id).and_then(|ctx| ctx.session_id())
    }

    /// Start a handshake for `group_id` as initiator.
    ///
    /// # Errors
    ///
    /// `UnknownGroup` if the node holds no context for the group; otherwise
    /// see [`ClientContext::build_request`].
    pub fn build_request(&self, group_id: GroupId) -> Result<Pdu> {
        let mut ctx = self
            .contexts
            .get_mut(&group_id)
            .ok_or(Error::UnknownGroup(group_id))?;
        ctx.build_request(&self.random, &self.clock)
    }

    /// Encrypt `plaintext` for `group_id`.
    ///
    /// # Errors
    ///
    /// `UnknownGroup` if the node holds no context for the group; otherwise
    /// see [`ClientContext::build_secured_message`].
    pub fn build_secured_message(&self, group_id: GroupId, plaintext: &[u8]) -> Result<Pdu> {
        let mut ctx = self
            .contexts
            .get_mut(&group_id)
            .ok_or(Error::UnknownGroup(group_id))?;
        ctx.build_secured_message(plaintext)
    }

    /// Serialize a PDU for transmission.
    ///
    /// # Errors
    ///
    /// See [`FrameCodec::pack`].
    pub fn pack(&self, pdu: &Pdu) -> Result<Vec<u8>> {
        self.codec.pack(pdu)
    }

    /// Process one inbound frame.
    ///
    /// # Errors
    ///
    /// - `NullPdu` for an empty frame
    /// - `MalformedFrame` if it cannot be decoded
    /// - `UnknownGroup` if the node holds no context for its group
    /// - any error of the handshake or secured-data step it triggers
    ///
    /// A failed frame leaves the context exactly as it was.
    pub fn process_received(&self, frame: &[u8]) -> Result<Received> {
        if frame.is_empty() {
            return Err(Error::NullPdu);
        }
        let pdu = self.codec.unpack(frame)?;
        let group_id = pdu.group_id;
        trace!(group = %group_id, msg_type = ?pdu.msg_type(), len = frame.len(), "frame received");

        let mut ctx = self
            .contexts
            .get_mut(&group_id)
            .ok_or(Error::UnknownGroup(group_id))?;

        let result = match &pdu.payload {
            Payload::Request { random } => ctx
                .process_request(pdu.session_id, random, &pdu.tag, &self.random)
                .map(|response| Received {
                    reaction: Some(response),
                    message: None,
                }),
            Payload::Response { random } => ctx
                .process_response(pdu.session_id, random, &pdu.tag, &self.clock)
                .map(|()| Received::default()),
            Payload::SecuredData {
                counter,
                ciphertext,
            } => ctx
                .process_secured(pdu.session_id, *counter, ciphertext, &pdu.tag)
                .map(|(sender, plaintext)| Received {
                    reaction: None,
                    message: Some(RxMessage {
                        group_id,
                        session_id: pdu.session_id,
                        sender,
                        counter: *counter,
                        plaintext,
                    }),
                }),
        };

        result.inspect_err(|err| {
            if err.is_security_warning() {
                warn!(
                    group = %group_id,
                    session = %hex::encode([pdu.session_id.as_u8()]),
                    msg_type = ?pdu.msg_type(),
                    error = %err,
                    "frame dropped"
                );
            }
        })
    }

    /// Wipe a group's session and return it to `Uninitialized`.
    ///
    /// # Errors
    ///
    /// `UnknownGroup` if the node holds no context for the group.
    pub fn reset(&self, group_id: GroupId) -> Result<()> {
        self.contexts
            .get_mut(&group_id)
            .ok_or(Error::UnknownGroup(group_id))?
            .reset();
        Ok(())
    }
}

impl<R, C> std::fmt::Debug for SessionManager<R, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("node_id", &self.node_id)
            .field("codec", &self.codec)
            .field("groups", &self.contexts.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HeaderType;
    use crate::keystore::GroupConfig;
    use busseal_crypto::{CryptoError, RngSource};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    struct Broken;

    impl RandomSource for Broken {
        fn try_fill(&self, _buf: &mut [u8]) -> std::result::Result<(), CryptoError> {
            Err(CryptoError::RandomFailed)
        }
    }

    struct Zeros;

    impl RandomSource for Zeros {
        fn try_fill(&self, buf: &mut [u8]) -> std::result::Result<(), CryptoError> {
            buf.fill(0);
            Ok(())
        }
    }

    const G1: GroupId = GroupId::new(1);

    fn store(groups: &[(u32, &[u8])]) -> Arc<KeyStore> {
        let configs: Vec<GroupConfig> = groups
            .iter()
            .map(|(id, members)| GroupConfig {
                id: *id,
                long_term_key: vec![0x11; 32],
                members: members.to_vec(),
            })
            .collect();
        Arc::new(KeyStore::from_configs(&configs).unwrap())
    }

    fn node(id: u8, keystore: &Arc<KeyStore>, seed: u64) -> SessionManager<RngSource<StdRng>> {
        SessionManager::with_sources(
            NodeId::new(id),
            Arc::clone(keystore),
            SessionConfig::default(),
            RngSource::new(StdRng::seed_from_u64(seed)),
            SystemClock,
        )
    }

    fn handshake<R: RandomSource, C: Clock>(a: &SessionManager<R, C>, b: &SessionManager<R, C>) {
        let request = a.pack(&a.build_request(G1).unwrap()).unwrap();
        let response = b.process_received(&request).unwrap().reaction.unwrap();
        let response = b.pack(&response).unwrap();
        assert_eq!(a.process_received(&response).unwrap(), Received::default());
    }

    #[test]
    fn test_lock_scenario() {
        let keystore = store(&[(1, &[1, 2])]);
        let a = node(1, &keystore, 1);
        let b = node(2, &keystore, 2);

        handshake(&a, &b);
        assert_eq!(a.state(G1), Some(HandshakeState::Established));
        assert_eq!(b.state(G1), Some(HandshakeState::Established));

        let frame = a.pack(&a.build_secured_message(G1, b"LOCK").unwrap()).unwrap();
        let message = b.process_received(&frame).unwrap().message.unwrap();
        assert_eq!(message.plaintext, b"LOCK");
        assert_eq!(message.counter, 1);

        assert_eq!(
            b.process_received(&frame),
            Err(Error::ReplayedOrStale {
                counter: 1,
                last_accepted: 1
            })
        );
    }

    #[test]
    fn test_empty_and_unknown() {
        let keystore = store(&[(1, &[1, 2]), (2, &[2, 3])]);
        let a = node(1, &keystore, 1);
        let c = node(3, &keystore, 3);

        assert_eq!(a.process_received(&[]), Err(Error::NullPdu));
        assert_eq!(a.groups(), vec![G1]);
        assert_eq!(
            a.build_request(GroupId::new(2)),
            Err(Error::UnknownGroup(GroupId::new(2)))
        );

        let request = a.pack(&a.build_request(G1).unwrap()).unwrap();
        assert_eq!(c.process_received(&request), Err(Error::UnknownGroup(G1)));
    }

    #[test]
    fn test_secured_before_handshake() {
        let keystore = store(&[(1, &[1, 2])]);
        let a = node(1, &keystore, 1);
        assert_eq!(
            a.build_secured_message(G1, b"x"),
            Err(Error::SessionNotEstablished)
        );
    }

    #[test]
    fn test_payload_limits() {
        let keystore = store(&[(1, &[1, 2])]);
        let a = node(1, &keystore, 1);
        let b = node(2, &keystore, 2);
        handshake(&a, &b);

        assert_eq!(a.build_secured_message(G1, b""), Err(Error::NullPayload));
        let max = a.codec().max_plaintext_len();
        assert!(a.build_secured_message(G1, &vec![1; max]).is_ok());
        assert_eq!(
            a.build_secured_message(G1, &vec![1; max + 1]),
            Err(Error::PayloadTooLong { len: max + 1, max })
        );
    }

    #[test]
    fn test_state_preconditions() {
        let keystore = store(&[(1, &[1, 2])]);
        let a = node(1, &keystore, 1);
        let b = node(2, &keystore, 2);

        let request = a.pack(&a.build_request(G1).unwrap()).unwrap();
        assert_eq!(
            a.build_request(G1),
            Err(Error::InvalidState(HandshakeState::HandshakeSent))
        );

        let response = b.process_received(&request).unwrap().reaction.unwrap();
        let response = b.pack(&response).unwrap();

        assert_eq!(
            b.process_received(&request),
            Err(Error::InvalidState(HandshakeState::Established))
        );
        // a known response is ignored until traffic settles the key
        assert_eq!(b.process_received(&response), Ok(Received::default()));

        a.process_received(&response).unwrap();
        assert_eq!(a.process_received(&response), Ok(Received::default()));

        let frame = a.pack(&a.build_secured_message(G1, b"x").unwrap()).unwrap();
        b.process_received(&frame).unwrap();
        assert_eq!(
            a.process_received(&response),
            Err(Error::InvalidState(HandshakeState::Established))
        );
        assert_eq!(
            b.process_received(&response),
            Err(Error::InvalidState(HandshakeState::Established))
        );
    }

    #[test]
    fn test_own_request_echo_ignored() {
        let keystore = store(&[(1, &[1, 2])]);
        let a = node(1, &keystore, 1);
        let b = node(2, &keystore, 2);

        let request = a.pack(&a.build_request(G1).unwrap()).unwrap();
        assert_eq!(a.process_received(&request), Err(Error::EchoedRequest));
        assert_eq!(a.state(G1), Some(HandshakeState::HandshakeSent));

        let response = b.process_received(&request).unwrap().reaction.unwrap();
        a.process_received(&b.pack(&response).unwrap()).unwrap();
        let frame = a.pack(&a.build_secured_message(G1, b"LOCK").unwrap()).unwrap();
        assert_eq!(b.process_received(&frame).unwrap().message.unwrap().plaintext, b"LOCK");
    }

    #[test]
    fn test_three_members_share_session() {
        let keystore = store(&[(1, &[1, 2, 3])]);
        let a = node(1, &keystore, 1);
        let b = node(2, &keystore, 2);
        let c = node(3, &keystore, 3);

        let request = a.pack(&a.build_request(G1).unwrap()).unwrap();
        let from_b = b.pack(&b.process_received(&request).unwrap().reaction.unwrap()).unwrap();
        let from_c = c.pack(&c.process_received(&request).unwrap().reaction.unwrap()).unwrap();
        for (receiver, frame) in [(&a, &from_b), (&a, &from_c), (&b, &from_c), (&c, &from_b)] {
            assert_eq!(receiver.process_received(frame), Ok(Received::default()));
        }

        let frame = a.pack(&a.build_secured_message(G1, b"LOCK").unwrap()).unwrap();
        for receiver in [&b, &c] {
            let message = receiver.process_received(&frame).unwrap().message.unwrap();
            assert_eq!(message.plaintext, b"LOCK");
            assert_eq!(message.sender, NodeId::new(1));
        }
    }

    #[test]
    fn test_response_for_other_session() {
        let keystore = store(&[(1, &[1, 2])]);
        let a = node(1, &keystore, 1);
        let b = node(2, &keystore, 2);

        let request = a.pack(&a.build_request(G1).unwrap()).unwrap();
        let response = b.process_received(&request).unwrap().reaction.unwrap();
        let mut frame = b.pack(&response).unwrap();
        let sid = response.session_id.as_u8();
        let other = if sid == u8::MAX { 1 } else { sid + 1 };
        frame[3] = other;

        assert!(matches!(
            a.process_received(&frame),
            Err(Error::SessionMismatch { .. })
        ));
        assert_eq!(a.state(G1), Some(HandshakeState::HandshakeSent));
    }

    #[test]
    fn test_reset_returns_to_uninitialized() {
        let keystore = store(&[(1, &[1, 2])]);
        let a = node(1, &keystore, 1);
        let b = node(2, &keystore, 2);
        handshake(&a, &b);

        b.reset(G1).unwrap();
        assert_eq!(b.state(G1), Some(HandshakeState::Uninitialized));
        assert_eq!(b.session_id(G1), None);
        assert_eq!(b.reset(GroupId::new(9)), Err(Error::UnknownGroup(GroupId::new(9))));
    }

    #[test]
    fn test_random_failures() {
        let keystore = store(&[(1, &[1, 2])]);
        let broken = SessionManager::with_sources(
            NodeId::new(1),
            Arc::clone(&keystore),
            SessionConfig::default(),
            Broken,
            SystemClock,
        );
        assert_eq!(broken.build_request(G1), Err(Error::CannotGenerateRandom));
        assert_eq!(broken.state(G1), Some(HandshakeState::Uninitialized));

        let zeros = SessionManager::with_sources(
            NodeId::new(1),
            keystore,
            SessionConfig::default(),
            Zeros,
            SystemClock,
        );
        assert_eq!(zeros.build_request(G1), Err(Error::CannotGenerateNonZeroRandom));
    }

    #[test]
    fn test_responder_random_failure_keeps_state() {
        let keystore = store(&[(1, &[1, 2])]);
        let a = node(1, &keystore, 1);
        let b = SessionManager::with_sources(
            NodeId::new(2),
            Arc::clone(&keystore),
            SessionConfig::default(),
            Broken,
            SystemClock,
        );
        let request = a.pack(&a.build_request(G1).unwrap()).unwrap();
        assert_eq!(b.process_received(&request), Err(Error::CannotGenerateRandom));
        assert_eq!(b.state(G1), Some(HandshakeState::Uninitialized));
    }

    #[test]
    fn test_compact_header_group_bound() {
        let keystore = store(&[(300, &[1, 2])]);
        let a = SessionManager::with_sources(
            NodeId::new(1),
            keystore,
            SessionConfig::default().with_header_type(HeaderType::Compact),
            OsRandom,
            SystemClock,
        );
        assert_eq!(
            a.build_request(GroupId::new(300)),
            Err(Error::GroupIdTooLargeForHeader(GroupId::new(300)))
        );
        assert_eq!(a.state(GroupId::new(300)), Some(HandshakeState::Uninitialized));
    }

    #[test]
    fn test_groups_processed_concurrently() {
        let ids: Vec<u32> = (1..=8).collect();
        let groups: Vec<(u32, &[u8])> = ids.iter().map(|id| (*id, &[1u8, 2][..])).collect();
        let keystore = store(&groups);
        let a = Arc::new(SessionManager::new(NodeId::new(1), Arc::clone(&keystore), SessionConfig::default()));
        let b = Arc::new(SessionManager::new(NodeId::new(2), keystore, SessionConfig::default()));

        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let a = Arc::clone(&a);
                let b = Arc::clone(&b);
                let gid = GroupId::try_from(*id).unwrap();
                std::thread::spawn(move || {
                    let request = a.pack(&a.build_request(gid).unwrap()).unwrap();
                    let response = b.process_received(&request).unwrap().reaction.unwrap();
                    a.process_received(&b.pack(&response).unwrap()).unwrap();
                    for i in 0..16u8 {
                        let frame = a.pack(&a.build_secured_message(gid, &[i]).unwrap()).unwrap();
                        let msg = b.process_received(&frame).unwrap().message.unwrap();
                        assert_eq!(msg.plaintext, vec![i]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
