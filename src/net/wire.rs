/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The peering wire format.
//!
//! Every datagram is a fixed-size header followed by `payload_len`
//! payload bytes. All integers are little-endian; node ids travel as
//! their opaque 20-byte representation.

use crate::data::BinaryDeserializer;
use crate::data::BinarySerializer;
use crate::data::CodecError;
use crate::data::Deserializer;
use crate::data::Serializer;
use crate::reference::ActorId;
use crate::reference::NODE_ID_LEN;
use crate::reference::NodeId;

/// The protocol version spoken by this crate, carried in the
/// `operation_data` field of every server handshake.
pub const PROTOCOL_VERSION: u64 = 1;

/// The encoded header size: two node ids, two actor ids, the payload
/// length, the opcode, and the operation data word.
pub const HEADER_SIZE: usize = 2 * NODE_ID_LEN + 4 + 4 + 4 + 4 + 8;

/// Wire opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Op {
    /// Sent by an accepting peer to an initiating peer;
    /// `operation_data` carries the protocol version.
    ServerHandshake = 0,
    /// Confirms acceptance; empty payload.
    ClientHandshake = 1,
    /// Carries a user message; `operation_data` is the message id.
    DispatchMessage = 2,
    /// "I created a proxy for your actor"; empty payload.
    AnnounceProxyInstance = 3,
    /// "My local actor has exited"; `operation_data` is the exit
    /// reason.
    KillProxyInstance = 4,
    /// Direct-connection negotiation; `operation_data` 0 asks for
    /// endpoints, 1 offers them.
    DirectConnRequest = 5,
    /// Direct-connection acknowledgement; empty payload.
    DirectConnResponse = 6,
}

impl Op {
    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::ServerHandshake),
            1 => Some(Self::ClientHandshake),
            2 => Some(Self::DispatchMessage),
            3 => Some(Self::AnnounceProxyInstance),
            4 => Some(Self::KillProxyInstance),
            5 => Some(Self::DirectConnRequest),
            6 => Some(Self::DirectConnResponse),
            _ => None,
        }
    }
}

/// Errors raised while decoding or validating a header.
#[derive(thiserror::Error, Debug)]
pub enum WireError {
    /// The header bytes were malformed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The opcode field named no known operation.
    #[error("unknown opcode: {0}")]
    UnknownOp(u32),

    /// The header fields are inconsistent with the opcode.
    #[error("invalid header for {0:?}")]
    Invalid(Op),
}

/// The fixed-size frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// The originating node.
    pub source_node: NodeId,
    /// The target node; invalid during the server handshake.
    pub dest_node: NodeId,
    /// The originating actor; may be invalid.
    pub source_actor: ActorId,
    /// The target actor; may be invalid.
    pub dest_actor: ActorId,
    /// Payload length in bytes; zero allowed.
    pub payload_len: u32,
    /// The operation.
    pub operation: Op,
    /// Per-operation data word.
    pub operation_data: u64,
}

impl Header {
    /// Encode into the sink.
    pub fn write<S: Serializer + ?Sized>(&self, sink: &mut S) {
        sink.write_raw(self.source_node.as_bytes());
        sink.write_raw(self.dest_node.as_bytes());
        sink.write_u32(self.source_actor.0);
        sink.write_u32(self.dest_actor.0);
        sink.write_u32(self.payload_len);
        sink.write_u32(self.operation as u32);
        sink.write_u64(self.operation_data);
    }

    /// Encode into a fresh byte vector of [`HEADER_SIZE`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut sink = BinarySerializer::new();
        self.write(&mut sink);
        sink.into_bytes()
    }

    /// Decode from the source.
    pub fn read<D: Deserializer + ?Sized>(src: &mut D) -> Result<Self, WireError> {
        let mut node = |src: &mut D| -> Result<NodeId, CodecError> {
            let bytes = src.read_raw(NODE_ID_LEN)?;
            let mut raw = [0u8; NODE_ID_LEN];
            raw.copy_from_slice(&bytes);
            Ok(NodeId::from_bytes(raw))
        };
        let source_node = node(src)?;
        let dest_node = node(src)?;
        let source_actor = ActorId(src.read_u32()?);
        let dest_actor = ActorId(src.read_u32()?);
        let payload_len = src.read_u32()?;
        let raw_op = src.read_u32()?;
        let operation = Op::from_u32(raw_op).ok_or(WireError::UnknownOp(raw_op))?;
        let operation_data = src.read_u64()?;
        Ok(Self {
            source_node,
            dest_node,
            source_actor,
            dest_actor,
            payload_len,
            operation,
            operation_data,
        })
    }

    /// Decode from exactly [`HEADER_SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut src = BinaryDeserializer::new(bytes);
        Self::read(&mut src)
    }

    /// Structural validation: fields must be consistent with the
    /// opcode. Anything that fails here closes the connection.
    pub fn valid(&self) -> bool {
        if self.source_node.is_invalid() {
            return false;
        }
        match self.operation {
            Op::ServerHandshake => self.dest_node.is_invalid() && self.payload_len > 0,
            Op::ClientHandshake => self.payload_len == 0,
            Op::DispatchMessage => {
                self.payload_len > 0 && !self.dest_node.is_invalid() && !self.dest_actor.is_invalid()
            }
            Op::AnnounceProxyInstance => {
                self.payload_len == 0
                    && !self.dest_node.is_invalid()
                    && !self.dest_actor.is_invalid()
            }
            Op::KillProxyInstance => {
                self.payload_len == 0
                    && !self.dest_node.is_invalid()
                    && !self.source_actor.is_invalid()
            }
            Op::DirectConnRequest => {
                self.payload_len > 0 && !self.dest_node.is_invalid() && self.operation_data <= 1
            }
            Op::DirectConnResponse => self.payload_len == 0 && !self.dest_node.is_invalid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(op: Op) -> Header {
        Header {
            source_node: NodeId::from_bytes([7u8; NODE_ID_LEN]),
            dest_node: NodeId::from_bytes([9u8; NODE_ID_LEN]),
            source_actor: ActorId(11),
            dest_actor: ActorId(13),
            payload_len: 17,
            operation: op,
            operation_data: 0xfeed_beef_dead_cafe,
        }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(HEADER_SIZE, 64);
        assert_eq!(sample(Op::DispatchMessage).encode().len(), HEADER_SIZE);
    }

    #[test]
    fn test_header_roundtrip() {
        for op in [
            Op::ServerHandshake,
            Op::ClientHandshake,
            Op::DispatchMessage,
            Op::AnnounceProxyInstance,
            Op::KillProxyInstance,
            Op::DirectConnRequest,
            Op::DirectConnResponse,
        ] {
            for payload_len in [0u32, 1, u32::MAX] {
                let mut hdr = sample(op);
                hdr.payload_len = payload_len;
                assert_eq!(Header::decode(&hdr.encode()).unwrap(), hdr);
            }
        }
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut bytes = sample(Op::DispatchMessage).encode();
        // The opcode lives at offset 52 (two node ids + three u32s).
        bytes[52] = 0xff;
        assert!(matches!(
            Header::decode(&bytes),
            Err(WireError::UnknownOp(_))
        ));
    }

    #[test]
    fn test_short_header_rejected() {
        let bytes = sample(Op::DispatchMessage).encode();
        assert!(Header::decode(&bytes[..HEADER_SIZE - 1]).is_err());
    }

    #[test]
    fn test_validation() {
        let mut hdr = sample(Op::DispatchMessage);
        assert!(hdr.valid());
        hdr.payload_len = 0;
        assert!(!hdr.valid());

        let mut hs = sample(Op::ServerHandshake);
        hs.dest_node = NodeId::INVALID;
        assert!(hs.valid());
        hs.dest_node = NodeId::from_bytes([1u8; NODE_ID_LEN]);
        assert!(!hs.valid());

        let mut kill = sample(Op::KillProxyInstance);
        kill.payload_len = 0;
        assert!(kill.valid());
        kill.source_actor = ActorId::INVALID;
        assert!(!kill.valid());

        let mut from_nowhere = sample(Op::DispatchMessage);
        from_nowhere.source_node = NodeId::INVALID;
        assert!(!from_nowhere.valid());
    }
}
