//! Frame encoding and decoding for the BusSeal wire format.
//!
//! Every PDU fits one bus frame of at most [`FRAME_CAPACITY`] bytes:
//!
//! ```text
//! +---------+-------------+-----------+---------+----------------+---------+
//! | msgType | groupId     | sessionId | bodyLen | body           | tag     |
//! | 1 byte  | 1 or 2 bytes| 1 byte    | 1 byte  | bodyLen bytes  | 16 bytes|
//! +---------+-------------+-----------+---------+----------------+---------+
//! ```
//!
//! The group identifier width is fixed per node by the [`HeaderType`]. All
//! multi-byte fields are big-endian. Bytes after the tag are ignored, since
//! CAN FD pads the data field up to the next DLC size.
//!
//! Body per message type:
//! - Request / Response: the sender's 16-byte random contribution
//! - SecuredData: 4-byte counter followed by the ciphertext

use crate::error::{Error, Result};
use crate::keystore::GroupId;
use crate::{AUTH_TAG_SIZE, COUNTER_SIZE, FRAME_CAPACITY, HANDSHAKE_RANDOM_SIZE};
use busseal_crypto::Tag;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message types carried in the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Handshake initiation
    Request = 0x01,
    /// Handshake answer
    Response = 0x02,
    /// Encrypted application data
    SecuredData = 0x03,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::SecuredData),
            _ => Err(Error::MalformedFrame("unknown message type")),
        }
    }
}

/// Width of the group identifier field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderType {
    /// One-byte group identifier (groups 0..=255)
    Compact,
    /// Two-byte group identifier (groups 0..=65535)
    #[default]
    Extended,
}

impl HeaderType {
    /// Header length in bytes
    #[must_use]
    pub const fn len(self) -> usize {
        match self {
            Self::Compact => 4,
            Self::Extended => 5,
        }
    }

    /// Largest group identifier the header can carry
    #[must_use]
    pub const fn max_group_id(self) -> u16 {
        match self {
            Self::Compact => u8::MAX as u16,
            Self::Extended => u16::MAX,
        }
    }

    /// Whether `group` fits the header
    #[must_use]
    pub const fn fits(self, group: GroupId) -> bool {
        group.as_u16() <= self.max_group_id()
    }
}

/// Session identifier. Zero is reserved and never appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u8);

impl SessionId {
    /// Create a session identifier, rejecting the reserved zero value.
    #[must_use]
    pub const fn new(id: u8) -> Option<Self> {
        if id == 0 { None } else { Some(Self(id)) }
    }

    /// Raw value
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Decoded header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message type
    pub msg_type: MessageType,
    /// Destination group
    pub group_id: GroupId,
    /// Session within the group
    pub session_id: SessionId,
    /// Length of the body following the header
    pub body_len: u8,
}

/// PDU body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Handshake initiation carrying the initiator's random contribution
    Request {
        /// Initiator random
        random: [u8; HANDSHAKE_RANDOM_SIZE],
    },
    /// Handshake answer carrying the responder's random contribution
    Response {
        /// Responder random
        random: [u8; HANDSHAKE_RANDOM_SIZE],
    },
    /// Encrypted application data
    SecuredData {
        /// Sender's message counter
        counter: u32,
        /// Ciphertext, same length as the plaintext
        ciphertext: Vec<u8>,
    },
}

impl Payload {
    /// Message type for this body
    #[must_use]
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Request { .. } => MessageType::Request,
            Self::Response { .. } => MessageType::Response,
            Self::SecuredData { .. } => MessageType::SecuredData,
        }
    }

    /// Serialized body length
    #[must_use]
    pub fn body_len(&self) -> usize {
        match self {
            Self::Request { .. } | Self::Response { .. } => HANDSHAKE_RANDOM_SIZE,
            Self::SecuredData { ciphertext, .. } => COUNTER_SIZE + ciphertext.len(),
        }
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        match self {
            Self::Request { random } | Self::Response { random } => out.extend_from_slice(random),
            Self::SecuredData {
                counter,
                ciphertext,
            } => {
                out.extend_from_slice(&counter.to_be_bytes());
                out.extend_from_slice(ciphertext);
            }
        }
    }

    fn parse(msg_type: MessageType, body: &[u8]) -> Result<Self> {
        match msg_type {
            MessageType::Request | MessageType::Response => {
                let random: [u8; HANDSHAKE_RANDOM_SIZE] = body
                    .try_into()
                    .map_err(|_| Error::MalformedFrame("handshake body has wrong length"))?;
                Ok(if msg_type == MessageType::Request {
                    Self::Request { random }
                } else {
                    Self::Response { random }
                })
            }
            MessageType::SecuredData => {
                if body.len() <= COUNTER_SIZE {
                    return Err(Error::MalformedFrame("secured data body without ciphertext"));
                }
                let (counter, ciphertext) = body.split_at(COUNTER_SIZE);
                let counter = u32::from_be_bytes([counter[0], counter[1], counter[2], counter[3]]);
                Ok(Self::SecuredData {
                    counter,
                    ciphertext: ciphertext.to_vec(),
                })
            }
        }
    }
}

/// Protocol data unit: one frame's worth of structured content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    /// Destination group
    pub group_id: GroupId,
    /// Session within the group
    pub session_id: SessionId,
    /// Body
    pub payload: Payload,
    /// Authentication tag
    pub tag: Tag,
}

impl Pdu {
    /// Message type
    #[must_use]
    pub fn msg_type(&self) -> MessageType {
        self.payload.msg_type()
    }

    /// Header derived from the PDU's fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::PayloadTooLarge` if the body cannot be described by the
    /// one-byte length field.
    pub fn header(&self) -> Result<Header> {
        let body_len = self.payload.body_len();
        let body_len = u8::try_from(body_len).map_err(|_| Error::PayloadTooLarge {
            len: body_len,
            capacity: FRAME_CAPACITY,
        })?;
        Ok(Header {
            msg_type: self.msg_type(),
            group_id: self.group_id,
            session_id: self.session_id,
            body_len,
        })
    }
}

/// Packs and unpacks PDUs for one header layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    header_type: HeaderType,
}

impl FrameCodec {
    /// Create a codec for the given header layout
    #[must_use]
    pub const fn new(header_type: HeaderType) -> Self {
        Self { header_type }
    }

    /// Configured header layout
    #[must_use]
    pub const fn header_type(&self) -> HeaderType {
        self.header_type
    }

    /// Header length in bytes
    #[must_use]
    pub const fn header_len(&self) -> usize {
        self.header_type.len()
    }

    /// Largest body that fits one frame
    #[must_use]
    pub const fn max_body_len(&self) -> usize {
        FRAME_CAPACITY - self.header_len() - AUTH_TAG_SIZE
    }

    /// Largest plaintext a secured-data frame can carry
    #[must_use]
    pub const fn max_plaintext_len(&self) -> usize {
        self.max_body_len() - COUNTER_SIZE
    }

    /// Serialize header fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::GroupIdTooLargeForHeader` if the group identifier does
    /// not fit the configured layout.
    pub fn encode_header(&self, header: &Header) -> Result<Vec<u8>> {
        if !self.header_type.fits(header.group_id) {
            return Err(Error::GroupIdTooLargeForHeader(header.group_id));
        }

        let mut buf = Vec::with_capacity(FRAME_CAPACITY);
        buf.push(header.msg_type as u8);
        let gid = header.group_id.as_u16();
        match self.header_type {
            #[allow(clippy::cast_possible_truncation)]
            HeaderType::Compact => buf.push(gid as u8),
            HeaderType::Extended => buf.extend_from_slice(&gid.to_be_bytes()),
        }
        buf.push(header.session_id.as_u8());
        buf.push(header.body_len);
        Ok(buf)
    }

    /// Serialize a PDU into frame bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::PayloadTooLarge` if header, body and tag exceed the
    /// frame capacity, or `Error::GroupIdTooLargeForHeader` if the group does
    /// not fit the header.
    pub fn pack(&self, pdu: &Pdu) -> Result<Vec<u8>> {
        let total = self.header_len() + pdu.payload.body_len() + AUTH_TAG_SIZE;
        if total > FRAME_CAPACITY {
            return Err(Error::PayloadTooLarge {
                len: total,
                capacity: FRAME_CAPACITY,
            });
        }

        let mut buf = self.encode_header(&pdu.header()?)?;
        pdu.payload.write_body(&mut buf);
        buf.extend_from_slice(pdu.tag.as_bytes());
        debug_assert_eq!(buf.len(), total);
        Ok(buf)
    }

    /// Decode only the header of a frame.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedFrame` if the frame is too short or too long,
    /// the message type is unknown, the session identifier is zero, or the
    /// declared body length does not fit the frame.
    pub fn decode_header(&self, frame: &[u8]) -> Result<Header> {
        let header_len = self.header_len();
        if frame.len() > FRAME_CAPACITY {
            return Err(Error::MalformedFrame("frame exceeds bus capacity"));
        }
        if frame.len() < header_len + AUTH_TAG_SIZE {
            return Err(Error::MalformedFrame("frame shorter than header and tag"));
        }

        let msg_type = MessageType::try_from(frame[0])?;
        let (group_id, rest) = match self.header_type {
            HeaderType::Compact => (u16::from(frame[1]), &frame[2..header_len]),
            HeaderType::Extended => (u16::from_be_bytes([frame[1], frame[2]]), &frame[3..header_len]),
        };
        let session_id =
            SessionId::new(rest[0]).ok_or(Error::MalformedFrame("reserved session id"))?;
        let body_len = rest[1];

        if header_len + usize::from(body_len) + AUTH_TAG_SIZE > frame.len() {
            return Err(Error::MalformedFrame("declared body length exceeds frame"));
        }

        Ok(Header {
            msg_type,
            group_id: GroupId::new(group_id),
            session_id,
            body_len,
        })
    }

    /// Parse frame bytes into a PDU.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedFrame` for any frame that cannot be a valid
    /// PDU under the configured header layout.
    pub fn unpack(&self, frame: &[u8]) -> Result<Pdu> {
        let header = self.decode_header(frame)?;
        let body_start = self.header_len();
        let tag_start = body_start + usize::from(header.body_len);

        let payload = Payload::parse(header.msg_type, &frame[body_start..tag_start])?;
        let tag = Tag::from_slice(&frame[tag_start..tag_start + AUTH_TAG_SIZE])
            .ok_or(Error::MalformedFrame("truncated tag"))?;

        Ok(Pdu {
            group_id: header.group_id,
            session_id: header.session_id,
            payload,
            tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(id: u8) -> SessionId {
        SessionId::new(id).unwrap()
    }

    fn secured(group: u16, ciphertext: &[u8]) -> Pdu {
        Pdu {
            group_id: GroupId::new(group),
            session_id: sid(7),
            payload: Payload::SecuredData {
                counter: 0x0102_0304,
                ciphertext: ciphertext.to_vec(),
            },
            tag: Tag::from_bytes([0xEE; AUTH_TAG_SIZE]),
        }
    }

    #[test]
    fn test_extended_layout() {
        let codec = FrameCodec::new(HeaderType::Extended);
        let frame = codec.pack(&secured(0x0201, b"LOCK")).unwrap();

        assert_eq!(&frame[..5], &[0x03, 0x02, 0x01, 0x07, 8]);
        assert_eq!(&frame[5..9], &[1, 2, 3, 4]);
        assert_eq!(&frame[9..13], b"LOCK");
        assert_eq!(&frame[13..], &[0xEE; AUTH_TAG_SIZE]);

        assert_eq!(codec.unpack(&frame).unwrap(), secured(0x0201, b"LOCK"));
    }

    #[test]
    fn test_compact_layout_and_gid_bound() {
        let codec = FrameCodec::new(HeaderType::Compact);
        let frame = codec.pack(&secured(200, b"x")).unwrap();
        assert_eq!(frame.len(), 4 + 5 + AUTH_TAG_SIZE);
        assert_eq!(frame[1], 200);

        assert_eq!(
            codec.pack(&secured(256, b"x")),
            Err(Error::GroupIdTooLargeForHeader(GroupId::new(256)))
        );
    }

    #[test]
    fn test_capacity() {
        let codec = FrameCodec::new(HeaderType::Extended);
        assert_eq!(codec.max_plaintext_len(), 64 - 5 - 4 - 16);
        assert_eq!(FrameCodec::new(HeaderType::Compact).max_plaintext_len(), 40);

        let max = vec![0u8; codec.max_plaintext_len()];
        assert_eq!(codec.pack(&secured(1, &max)).unwrap().len(), FRAME_CAPACITY);

        let over = vec![0u8; codec.max_plaintext_len() + 1];
        assert_eq!(
            codec.pack(&secured(1, &over)),
            Err(Error::PayloadTooLarge {
                len: FRAME_CAPACITY + 1,
                capacity: FRAME_CAPACITY
            })
        );
    }

    #[test]
    fn test_handshake_pdu() {
        let codec = FrameCodec::default();
        let pdu = Pdu {
            group_id: GroupId::new(1),
            session_id: sid(0x42),
            payload: Payload::Request { random: [9; 16] },
            tag: Tag::from_bytes([1; AUTH_TAG_SIZE]),
        };
        let frame = codec.pack(&pdu).unwrap();
        assert_eq!(frame.len(), 5 + 16 + 16);
        assert_eq!(codec.unpack(&frame).unwrap(), pdu);
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let codec = FrameCodec::default();
        let mut frame = codec.pack(&secured(1, b"abc")).unwrap();
        frame.resize(32, 0);
        assert_eq!(codec.unpack(&frame).unwrap(), secured(1, b"abc"));
    }

    #[test]
    fn test_malformed_frames() {
        let codec = FrameCodec::default();
        let good = codec.pack(&secured(1, b"abc")).unwrap();

        assert!(matches!(codec.unpack(&good[..10]), Err(Error::MalformedFrame(_))));

        let mut bad_type = good.clone();
        bad_type[0] = 0x7F;
        assert!(matches!(codec.unpack(&bad_type), Err(Error::MalformedFrame(_))));

        let mut bad_len = good.clone();
        bad_len[4] = 40;
        assert!(matches!(codec.unpack(&bad_len), Err(Error::MalformedFrame(_))));

        let mut zero_sid = good.clone();
        zero_sid[3] = 0;
        assert!(matches!(codec.unpack(&zero_sid), Err(Error::MalformedFrame(_))));

        let mut short_body = good.clone();
        short_body[4] = 4;
        assert!(matches!(codec.unpack(&short_body), Err(Error::MalformedFrame(_))));

        let mut handshake_len = good;
        handshake_len[0] = MessageType::Request as u8;
        assert!(matches!(codec.unpack(&handshake_len), Err(Error::MalformedFrame(_))));

        assert!(matches!(codec.unpack(&[0u8; 65]), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_session_id_zero_reserved() {
        assert!(SessionId::new(0).is_none());
        assert_eq!(SessionId::new(5).unwrap().to_string(), "0x05");
    }
}
