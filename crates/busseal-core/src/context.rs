//! Per-group handshake state machine and secured-data processing.
//!
//! A [`ClientContext`] exists for every group a node belongs to. It moves
//! through three states:
//!
//! ```text
//!                 build_request             process_response
//! Uninitialized ───────────────► HandshakeSent ───────────────► Established
//!       │                              │                             ▲
//!       │        process_request       │      process_request        │
//!       └──────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! `reset` returns any state to `Uninitialized` and wipes the session.
//!
//! Handshake messages are authenticated under the group's long-term key.
//! Secured data is encrypted under a session key derived from the request
//! random and one response random.
//!
//! Every member that hears a request may answer it, so a session starts out
//! with one candidate key per response seen. Until the first secured frame is
//! sent or verified, each member sends under the candidate with the lowest
//! response random and keeps collecting responses for the session. The first
//! secured frame settles the key: the candidates that did not carry it are
//! dropped and later responses are rejected.
//!
//! All members share the session key, so the sender's node id is part of
//! every secured-data nonce and each peer has its own replay guard. The
//! receiver finds the sender by trying each peer's nonce.

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::frame::{FrameCodec, Header, MessageType, Payload, Pdu, SessionId};
use crate::keystore::{Group, GroupId, NodeId};
use crate::replay::ReplayGuard;
use crate::{COUNTER_SIZE, HANDSHAKE_RANDOM_SIZE};
use busseal_crypto::random::{random_array, random_nonzero_u8};
use busseal_crypto::{AeadCodec, NONCE_SIZE, Nonce, RandomSource, SALT_SIZE, SessionMaterial, Tag};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HandshakeRandom = [u8; HANDSHAKE_RANDOM_SIZE];

/// Handshake state of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// No session; a request may be sent or answered
    Uninitialized,
    /// Request sent, waiting for the response
    HandshakeSent,
    /// Session key derived; secured data may flow
    Established,
}

/// Role taken in the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sent the request
    Initiator,
    /// Answered the request
    Responder,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct PendingRequest {
    #[zeroize(skip)]
    session_id: SessionId,
    random: HandshakeRandom,
    #[zeroize(skip)]
    sent_at: Option<Duration>,
}

struct Candidate {
    response_random: HandshakeRandom,
    material: SessionMaterial,
}

/// Key index of a verified frame: `None` for the active candidate.
struct Opened {
    key: Option<usize>,
    sender: NodeId,
    plaintext: Vec<u8>,
}

struct Session {
    session_id: SessionId,
    role: Role,
    request_random: HandshakeRandom,
    /// Candidate with the lowest response random; used for sending
    active: Candidate,
    alternates: Vec<Candidate>,
    settled: bool,
    send_counter: u32,
    replay: BTreeMap<NodeId, ReplayGuard>,
}

impl Session {
    fn new(
        group: &Group,
        own: NodeId,
        session_id: SessionId,
        role: Role,
        request_random: HandshakeRandom,
        active: Candidate,
    ) -> Self {
        trace!(
            group = %group.id(),
            session = %hex::encode([session_id.as_u8()]),
            ?role,
            "session material derived"
        );
        Self {
            session_id,
            role,
            request_random,
            active,
            alternates: Vec::new(),
            settled: false,
            send_counter: 0,
            replay: group
                .members()
                .iter()
                .copied()
                .filter(|member| *member != own)
                .map(|member| (member, ReplayGuard::new()))
                .collect(),
        }
    }

    fn candidate_count(&self) -> usize {
        1 + self.alternates.len()
    }

    fn knows(&self, response_random: &HandshakeRandom) -> bool {
        self.active.response_random == *response_random
            || self
                .alternates
                .iter()
                .any(|c| c.response_random == *response_random)
    }

    fn add_candidate(&mut self, candidate: Candidate) {
        if candidate.response_random < self.active.response_random {
            let previous = std::mem::replace(&mut self.active, candidate);
            self.alternates.push(previous);
        } else {
            self.alternates.push(candidate);
        }
    }

    fn settle(&mut self, key: Option<usize>) {
        if let Some(index) = key {
            self.active = self.alternates.swap_remove(index);
        }
        self.alternates.clear();
        self.settled = true;
    }

    fn nonce(&self, material: &SessionMaterial, group_id: GroupId, counter: u32, sender: NodeId) -> Nonce {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&u64::from(counter).to_le_bytes());
        nonce[8..10].copy_from_slice(&group_id.as_u16().to_be_bytes());
        nonce[10] = self.session_id.as_u8();
        nonce[11] = sender.as_u8();
        nonce[12..].copy_from_slice(material.nonce_salt());
        debug_assert_eq!(NONCE_SIZE - 12, SALT_SIZE);
        Nonce::from_bytes(nonce)
    }

    fn codec(&self, material: &SessionMaterial, group_id: GroupId, counter: u32, sender: NodeId) -> AeadCodec {
        AeadCodec::new(material.key(), &self.nonce(material, group_id, counter, sender))
    }

    /// Try every candidate key and every peer whose guard's verdict on
    /// `counter` matches `fresh`.
    fn open(
        &self,
        group_id: GroupId,
        counter: u32,
        aad: &[u8],
        ciphertext: &[u8],
        tag: &Tag,
        fresh: bool,
    ) -> Option<Opened> {
        let keys = std::iter::once((None, &self.active))
            .chain(self.alternates.iter().enumerate().map(|(i, c)| (Some(i), c)));
        for (key, candidate) in keys {
            for (&sender, guard) in &self.replay {
                if guard.check(counter).is_ok() != fresh {
                    continue;
                }
                if let Ok(plaintext) = self
                    .codec(&candidate.material, group_id, counter, sender)
                    .decrypt(aad, ciphertext, tag)
                {
                    return Some(Opened {
                        key,
                        sender,
                        plaintext,
                    });
                }
            }
        }
        None
    }
}

/// Protocol state for one group on one node.
pub struct ClientContext {
    group: Arc<Group>,
    node_id: NodeId,
    codec: FrameCodec,
    config: SessionConfig,
    state: HandshakeState,
    pending: Option<PendingRequest>,
    session: Option<Session>,
}

impl ClientContext {
    /// Create an uninitialized context for `group` on node `node_id`.
    #[must_use]
    pub fn new(group: Arc<Group>, node_id: NodeId, config: SessionConfig) -> Self {
        Self {
            group,
            node_id,
            codec: FrameCodec::new(config.header_type),
            config,
            state: HandshakeState::Uninitialized,
            pending: None,
            session: None,
        }
    }

    /// Group this context belongs to
    #[must_use]
    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    /// Group identifier
    #[must_use]
    pub fn group_id(&self) -> GroupId {
        self.group.id()
    }

    /// Node this context runs on
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Current handshake state
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Role in the established session
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|s| s.role)
    }

    /// Identifier of the pending or established session
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        match (&self.session, &self.pending) {
            (Some(session), _) => Some(session.session_id),
            (None, Some(pending)) => Some(pending.session_id),
            (None, None) => None,
        }
    }

    /// Whether the session key is fixed by secured traffic.
    ///
    /// An established but unsettled session still records responses from
    /// other members.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.settled)
    }

    /// Last counter used for sending (zero before the first message)
    #[must_use]
    pub fn send_counter(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.send_counter)
    }

    /// Highest counter accepted from `peer`
    #[must_use]
    pub fn last_accepted(&self, peer: NodeId) -> u32 {
        self.session
            .as_ref()
            .and_then(|s| s.replay.get(&peer))
            .map_or(0, ReplayGuard::last_accepted)
    }

    /// Drop any pending request and session, back to `Uninitialized`.
    pub fn reset(&mut self) {
        if self.state != HandshakeState::Uninitialized {
            debug!(group = %self.group_id(), from = ?self.state, "context reset");
        }
        self.pending = None;
        self.session = None;
        self.state = HandshakeState::Uninitialized;
    }

    /// Start a handshake as initiator.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the context is `Uninitialized`
    /// - `CannotGenerateNonZeroRandom` / `CannotGenerateRandom` on random failure
    /// - `GroupIdTooLargeForHeader` if the group does not fit the header
    /// - `CannotGetCurrentTime` if a timeout is configured and the clock fails
    pub fn build_request<R, C>(&mut self, random: &R, clock: &C) -> Result<Pdu>
    where
        R: RandomSource + ?Sized,
        C: Clock + ?Sized,
    {
        if self.state != HandshakeState::Uninitialized {
            return Err(Error::InvalidState(self.state));
        }

        let session_id = random_nonzero_u8(random, self.config.session_id_attempts)
            .map_err(Error::from)
            .and_then(|id| SessionId::new(id).ok_or(Error::CannotGenerateNonZeroRandom))?;
        let request_random: HandshakeRandom = random_array(random)?;

        let tag = self.handshake_tag(
            MessageType::Request,
            session_id,
            &request_random,
            None,
        )?;

        let sent_at = match self.config.handshake_timeout {
            Some(_) => Some(clock.now().ok_or(Error::CannotGetCurrentTime)?),
            None => None,
        };

        self.session = None;
        self.pending = Some(PendingRequest {
            session_id,
            random: request_random,
            sent_at,
        });
        self.state = HandshakeState::HandshakeSent;
        debug!(
            group = %self.group_id(),
            session = %hex::encode([session_id.as_u8()]),
            "handshake request sent"
        );

        Ok(Pdu {
            group_id: self.group_id(),
            session_id,
            payload: Payload::Request {
                random: request_random,
            },
            tag,
        })
    }

    /// Answer a peer's request, becoming responder. Returns the response PDU.
    ///
    /// A pending request of our own is abandoned.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if a session is already established
    /// - `EchoedRequest` if this is our own pending request
    /// - `InvalidTag` if the request does not verify under the long-term key
    /// - `CannotGenerateRandom` on random failure
    pub fn process_request<R>(
        &mut self,
        session_id: SessionId,
        request_random: &HandshakeRandom,
        tag: &Tag,
        random: &R,
    ) -> Result<Pdu>
    where
        R: RandomSource + ?Sized,
    {
        if self.state == HandshakeState::Established {
            return Err(Error::InvalidState(self.state));
        }
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.session_id == session_id && p.random == *request_random)
        {
            return Err(Error::EchoedRequest);
        }

        self.verify_handshake(MessageType::Request, session_id, request_random, None, tag)?;

        let response_random: HandshakeRandom = random_array(random)?;
        let response_tag = self.handshake_tag(
            MessageType::Response,
            session_id,
            &response_random,
            Some(request_random),
        )?;
        let material = self.derive(session_id, request_random, &response_random);

        if self.state == HandshakeState::HandshakeSent {
            debug!(group = %self.group_id(), "own request abandoned for peer request");
        }
        self.pending = None;
        self.session = Some(Session::new(
            &self.group,
            self.node_id,
            session_id,
            Role::Responder,
            *request_random,
            Candidate {
                response_random,
                material,
            },
        ));
        self.state = HandshakeState::Established;
        debug!(
            group = %self.group_id(),
            session = %hex::encode([session_id.as_u8()]),
            role = ?Role::Responder,
            "session established"
        );

        Ok(Pdu {
            group_id: self.group_id(),
            session_id,
            payload: Payload::Response {
                random: response_random,
            },
            tag: response_tag,
        })
    }

    /// Process a response to the group's current request.
    ///
    /// In `HandshakeSent` it completes our own handshake. In an unsettled
    /// established session it records the response as a candidate key; a
    /// response already recorded is ignored.
    ///
    /// # Errors
    ///
    /// - `InvalidState` in `Uninitialized` or once the session settled
    /// - `SessionMismatch` if the response is for another session
    /// - `CannotGetCurrentTime` / `HandshakeExpired` when a timeout is configured
    /// - `InvalidTag` if the response does not verify under the long-term key
    pub fn process_response<C>(
        &mut self,
        session_id: SessionId,
        response_random: &HandshakeRandom,
        tag: &Tag,
        clock: &C,
    ) -> Result<()>
    where
        C: Clock + ?Sized,
    {
        match self.state {
            HandshakeState::HandshakeSent => self.complete_request(session_id, response_random, tag, clock),
            HandshakeState::Established => self.record_response(session_id, response_random, tag),
            HandshakeState::Uninitialized => Err(Error::InvalidState(self.state)),
        }
    }

    fn complete_request<C>(
        &mut self,
        session_id: SessionId,
        response_random: &HandshakeRandom,
        tag: &Tag,
        clock: &C,
    ) -> Result<()>
    where
        C: Clock + ?Sized,
    {
        let Some(pending) = &self.pending else {
            return Err(Error::InvalidState(self.state));
        };

        if pending.session_id != session_id {
            return Err(Error::SessionMismatch {
                expected: pending.session_id,
                actual: session_id,
            });
        }

        if let (Some(timeout), Some(sent_at)) = (self.config.handshake_timeout, pending.sent_at) {
            let now = clock.now().ok_or(Error::CannotGetCurrentTime)?;
            if now.checked_sub(sent_at).is_none_or(|elapsed| elapsed > timeout) {
                return Err(Error::HandshakeExpired);
            }
        }

        let request_random = pending.random;
        self.verify_handshake(
            MessageType::Response,
            session_id,
            response_random,
            Some(&request_random),
            tag,
        )?;
        let material = self.derive(session_id, &request_random, response_random);

        self.pending = None;
        self.session = Some(Session::new(
            &self.group,
            self.node_id,
            session_id,
            Role::Initiator,
            request_random,
            Candidate {
                response_random: *response_random,
                material,
            },
        ));
        self.state = HandshakeState::Established;
        debug!(
            group = %self.group_id(),
            session = %hex::encode([session_id.as_u8()]),
            role = ?Role::Initiator,
            "session established"
        );
        Ok(())
    }

    fn record_response(
        &mut self,
        session_id: SessionId,
        response_random: &HandshakeRandom,
        tag: &Tag,
    ) -> Result<()> {
        let (expected, request_random, known, count) = match &self.session {
            Some(session) if !session.settled => (
                session.session_id,
                session.request_random,
                session.knows(response_random),
                session.candidate_count(),
            ),
            _ => return Err(Error::InvalidState(self.state)),
        };

        if expected != session_id {
            return Err(Error::SessionMismatch {
                expected,
                actual: session_id,
            });
        }

        self.verify_handshake(
            MessageType::Response,
            session_id,
            response_random,
            Some(&request_random),
            tag,
        )?;

        // one response per member is the most a request can draw
        if known || count >= self.group.members().len() {
            trace!(group = %self.group_id(), "response ignored");
            return Ok(());
        }

        let group_id = self.group_id();
        let material = self.derive(session_id, &request_random, response_random);
        if let Some(session) = self.session.as_mut() {
            session.add_candidate(Candidate {
                response_random: *response_random,
                material,
            });
            debug!(
                group = %group_id,
                session = %hex::encode([session_id.as_u8()]),
                candidates = session.candidate_count(),
                "response recorded"
            );
        }
        Ok(())
    }

    /// Encrypt `plaintext` into a secured-data PDU.
    ///
    /// # Errors
    ///
    /// - `SessionNotEstablished` before the handshake completed
    /// - `NullPayload` for an empty plaintext
    /// - `PayloadTooLong` if it does not fit one frame
    /// - `CounterExhausted` once the send counter limit is reached
    pub fn build_secured_message(&mut self, plaintext: &[u8]) -> Result<Pdu> {
        let group_id = self.group_id();
        let node_id = self.node_id;
        let codec = self.codec;
        let max_counter = self.config.max_counter;
        let session = match (&mut self.session, self.state) {
            (Some(session), HandshakeState::Established) => session,
            _ => return Err(Error::SessionNotEstablished),
        };

        if plaintext.is_empty() {
            return Err(Error::NullPayload);
        }
        let max = codec.max_plaintext_len();
        if plaintext.len() > max {
            return Err(Error::PayloadTooLong {
                len: plaintext.len(),
                max,
            });
        }

        let counter = session
            .send_counter
            .checked_add(1)
            .filter(|c| *c <= max_counter)
            .ok_or(Error::CounterExhausted)?;

        let aad = secured_aad(&codec, group_id, session.session_id, counter, plaintext.len())?;
        let (ciphertext, tag) = session
            .codec(&session.active.material, group_id, counter, node_id)
            .encrypt(&aad, plaintext)?;
        session.send_counter = counter;
        if !session.settled {
            session.settle(None);
        }

        trace!(group = %group_id, counter, len = plaintext.len(), "secured message built");
        Ok(Pdu {
            group_id,
            session_id: session.session_id,
            payload: Payload::SecuredData {
                counter,
                ciphertext,
            },
            tag,
        })
    }

    /// Verify and decrypt a secured-data PDU from a peer. Returns the sender
    /// and the plaintext.
    ///
    /// A counter that is stale for every peer is rejected before any
    /// decryption. The sender's replay guard only advances once the tag
    /// verified.
    ///
    /// # Errors
    ///
    /// - `SessionNotEstablished` before the handshake completed
    /// - `SessionMismatch` if the frame belongs to another session
    /// - `ReplayedOrStale` if the counter is not fresh for its sender
    /// - `InvalidTag` if authentication fails
    pub fn process_secured(
        &mut self,
        session_id: SessionId,
        counter: u32,
        ciphertext: &[u8],
        tag: &Tag,
    ) -> Result<(NodeId, Vec<u8>)> {
        let group_id = self.group_id();
        let codec = self.codec;
        let session = match (&mut self.session, self.state) {
            (Some(session), HandshakeState::Established) => session,
            _ => return Err(Error::SessionNotEstablished),
        };

        if session.session_id != session_id {
            return Err(Error::SessionMismatch {
                expected: session.session_id,
                actual: session_id,
            });
        }

        if !session.replay.values().any(|guard| guard.check(counter).is_ok()) {
            let most_lenient = session.replay.values().min_by_key(|guard| guard.last_accepted());
            return Err(most_lenient
                .and_then(|guard| guard.check(counter).err())
                .unwrap_or(Error::InvalidTag));
        }

        let aad = secured_aad(&codec, group_id, session_id, counter, ciphertext.len())?;
        let Some(opened) = session.open(group_id, counter, &aad, ciphertext, tag, true) else {
            // a frame that verifies for a stale sender is a replay
            let replayed = session
                .open(group_id, counter, &aad, ciphertext, tag, false)
                .and_then(|opened| session.replay.get(&opened.sender))
                .and_then(|guard| guard.check(counter).err());
            return Err(replayed.unwrap_or(Error::InvalidTag));
        };

        session
            .replay
            .get_mut(&opened.sender)
            .ok_or(Error::InvalidTag)?
            .accept(counter)?;
        if !session.settled {
            session.settle(opened.key);
            debug!(group = %group_id, sender = %opened.sender, "session key settled");
        }
        trace!(
            group = %group_id,
            sender = %opened.sender,
            counter,
            len = opened.plaintext.len(),
            "secured message accepted"
        );
        Ok((opened.sender, opened.plaintext))
    }

    fn derive(
        &self,
        session_id: SessionId,
        initiator_random: &HandshakeRandom,
        responder_random: &HandshakeRandom,
    ) -> SessionMaterial {
        let mut context = [0u8; 3];
        context[..2].copy_from_slice(&self.group_id().as_u16().to_be_bytes());
        context[2] = session_id.as_u8();
        SessionMaterial::derive(
            self.group.long_term_key(),
            initiator_random,
            responder_random,
            &context,
        )
    }

    fn handshake_codec(
        &self,
        msg_type: MessageType,
        session_id: SessionId,
        random: &HandshakeRandom,
    ) -> AeadCodec {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..HANDSHAKE_RANDOM_SIZE].copy_from_slice(random);
        nonce[16] = msg_type as u8;
        nonce[17..19].copy_from_slice(&self.group_id().as_u16().to_be_bytes());
        nonce[19] = session_id.as_u8();
        AeadCodec::new(self.group.long_term_key(), &Nonce::from_bytes(nonce))
    }

    fn handshake_aad(
        &self,
        msg_type: MessageType,
        session_id: SessionId,
        random: &HandshakeRandom,
        request_random: Option<&HandshakeRandom>,
    ) -> Result<Vec<u8>> {
        let header = Header {
            msg_type,
            group_id: self.group_id(),
            session_id,
            #[allow(clippy::cast_possible_truncation)]
            body_len: HANDSHAKE_RANDOM_SIZE as u8,
        };
        let mut aad = self.codec.encode_header(&header)?;
        aad.extend_from_slice(random);
        if let Some(request_random) = request_random {
            aad.extend_from_slice(request_random);
        }
        Ok(aad)
    }

    fn handshake_tag(
        &self,
        msg_type: MessageType,
        session_id: SessionId,
        random: &HandshakeRandom,
        request_random: Option<&HandshakeRandom>,
    ) -> Result<Tag> {
        let aad = self.handshake_aad(msg_type, session_id, random, request_random)?;
        Ok(self
            .handshake_codec(msg_type, session_id, random)
            .authenticate(&aad)?)
    }

    fn verify_handshake(
        &self,
        msg_type: MessageType,
        session_id: SessionId,
        random: &HandshakeRandom,
        request_random: Option<&HandshakeRandom>,
        tag: &Tag,
    ) -> Result<()> {
        let aad = self.handshake_aad(msg_type, session_id, random, request_random)?;
        Ok(self
            .handshake_codec(msg_type, session_id, random)
            .verify(&aad, tag)?)
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("group", &self.group_id())
            .field("node", &self.node_id)
            .field("state", &self.state)
            .field("session_id", &self.session_id())
            .field("role", &self.role())
            .field("settled", &self.is_settled())
            .field("send_counter", &self.send_counter())
            .finish_non_exhaustive()
    }
}

fn secured_aad(
    codec: &FrameCodec,
    group_id: GroupId,
    session_id: SessionId,
    counter: u32,
    ciphertext_len: usize,
) -> Result<Vec<u8>> {
    let body_len = COUNTER_SIZE + ciphertext_len;
    let header = Header {
        msg_type: MessageType::SecuredData,
        group_id,
        session_id,
        body_len: u8::try_from(body_len).map_err(|_| Error::PayloadTooLarge {
            len: body_len,
            capacity: crate::FRAME_CAPACITY,
        })?,
    };
    let mut aad = codec.encode_header(&header)?;
    aad.extend_from_slice(&counter.to_be_bytes());
    Ok(aad)
}
