/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The serialization contract.
//!
//! The core consumes a narrow stream surface: a [`Serializer`] sink and
//! a [`Deserializer`] source over primitives, plus a [`TypeRegistry`]
//! mapping registered type names to codecs for payload elements whose
//! static type the core never sees. [`BinarySerializer`] and
//! [`BinaryDeserializer`] are the crate's little-endian implementation,
//! used by the wire protocol.
//!
//! All integers are little-endian; floats travel as their IEEE-754 bit
//! patterns; strings are u32-length-prefixed UTF-8.

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::message::Atom;
use crate::message::DownMsg;
use crate::message::ExitMsg;
use crate::message::ExitReason;
use crate::message::LinkMsg;
use crate::message::Message;
use crate::message::MessageId;
use crate::message::SyncExitedMsg;
use crate::message::TimeoutMsg;
use crate::message::Value;
use crate::reference::ActorAddress;
use crate::reference::ActorId;
use crate::reference::NODE_ID_LEN;
use crate::reference::NodeId;

/// Errors surfaced by codecs and the binary stream implementation.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// The input ended before the expected value.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A string was not valid UTF-8.
    #[error("invalid utf-8 in string")]
    InvalidUtf8,

    /// An unknown value tag was read.
    #[error("invalid value tag: {0}")]
    InvalidTag(u8),

    /// A custom value named a type that is not registered.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// A registered codec failed.
    #[error("codec: {0}")]
    Codec(String),
}

/// A stream-like sink for the primitives the core serializes.
pub trait Serializer {
    /// Open an object of the named type.
    fn begin_object(&mut self, type_name: &str);
    /// Close the innermost object.
    fn end_object(&mut self);
    /// Open a sequence of `len` elements.
    fn begin_sequence(&mut self, len: u32);
    /// Close the innermost sequence.
    fn end_sequence(&mut self);
    /// Write a boolean.
    fn write_bool(&mut self, v: bool);
    /// Write an 8-bit signed integer.
    fn write_i8(&mut self, v: i8);
    /// Write a 16-bit signed integer.
    fn write_i16(&mut self, v: i16);
    /// Write a 32-bit signed integer.
    fn write_i32(&mut self, v: i32);
    /// Write a 64-bit signed integer.
    fn write_i64(&mut self, v: i64);
    /// Write an 8-bit unsigned integer.
    fn write_u8(&mut self, v: u8);
    /// Write a 16-bit unsigned integer.
    fn write_u16(&mut self, v: u16);
    /// Write a 32-bit unsigned integer.
    fn write_u32(&mut self, v: u32);
    /// Write a 64-bit unsigned integer.
    fn write_u64(&mut self, v: u64);
    /// Write a 32-bit float as its bit pattern.
    fn write_f32(&mut self, v: f32);
    /// Write a 64-bit float as its bit pattern.
    fn write_f64(&mut self, v: f64);
    /// Write a packed symbol.
    fn write_atom(&mut self, v: Atom);
    /// Write a length-prefixed UTF-8 string.
    fn write_str(&mut self, v: &str);
    /// Write raw bytes with no framing.
    fn write_raw(&mut self, bytes: &[u8]);
}

/// The mirror image of [`Serializer`].
pub trait Deserializer {
    /// Open an object, returning its type name.
    fn begin_object(&mut self) -> Result<String, CodecError>;
    /// Close the innermost object.
    fn end_object(&mut self) -> Result<(), CodecError>;
    /// Open a sequence, returning its length.
    fn begin_sequence(&mut self) -> Result<u32, CodecError>;
    /// Close the innermost sequence.
    fn end_sequence(&mut self) -> Result<(), CodecError>;
    /// Read a boolean.
    fn read_bool(&mut self) -> Result<bool, CodecError>;
    /// Read an 8-bit signed integer.
    fn read_i8(&mut self) -> Result<i8, CodecError>;
    /// Read a 16-bit signed integer.
    fn read_i16(&mut self) -> Result<i16, CodecError>;
    /// Read a 32-bit signed integer.
    fn read_i32(&mut self) -> Result<i32, CodecError>;
    /// Read a 64-bit signed integer.
    fn read_i64(&mut self) -> Result<i64, CodecError>;
    /// Read an 8-bit unsigned integer.
    fn read_u8(&mut self) -> Result<u8, CodecError>;
    /// Read a 16-bit unsigned integer.
    fn read_u16(&mut self) -> Result<u16, CodecError>;
    /// Read a 32-bit unsigned integer.
    fn read_u32(&mut self) -> Result<u32, CodecError>;
    /// Read a 64-bit unsigned integer.
    fn read_u64(&mut self) -> Result<u64, CodecError>;
    /// Read a 32-bit float.
    fn read_f32(&mut self) -> Result<f32, CodecError>;
    /// Read a 64-bit float.
    fn read_f64(&mut self) -> Result<f64, CodecError>;
    /// Read a packed symbol.
    fn read_atom(&mut self) -> Result<Atom, CodecError>;
    /// Read a length-prefixed UTF-8 string.
    fn read_str(&mut self) -> Result<String, CodecError>;
    /// Read exactly `len` raw bytes.
    fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, CodecError>;
}

/// Little-endian sink over a growable buffer.
pub struct BinarySerializer {
    buf: BytesMut,
}

impl Default for BinarySerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl BinarySerializer {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Take the accumulated bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    /// The accumulated bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl Serializer for BinarySerializer {
    fn begin_object(&mut self, type_name: &str) {
        self.write_str(type_name);
    }

    fn end_object(&mut self) {}

    fn begin_sequence(&mut self, len: u32) {
        self.write_u32(len);
    }

    fn end_sequence(&mut self) {}

    fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    fn write_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    fn write_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    fn write_f32(&mut self, v: f32) {
        self.buf.put_u32_le(v.to_bits());
    }

    fn write_f64(&mut self, v: f64) {
        self.buf.put_u64_le(v.to_bits());
    }

    fn write_atom(&mut self, v: Atom) {
        self.buf.put_u64_le(v.raw());
    }

    fn write_str(&mut self, v: &str) {
        self.buf.put_u32_le(v.len() as u32);
        self.buf.put_slice(v.as_bytes());
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }
}

/// Little-endian source over a byte slice.
pub struct BinaryDeserializer<'a> {
    buf: &'a [u8],
}

impl<'a> BinaryDeserializer<'a> {
    /// Wrap a byte slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// The number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            Err(CodecError::UnexpectedEof)
        } else {
            Ok(())
        }
    }
}

impl<'a> Deserializer for BinaryDeserializer<'a> {
    fn begin_object(&mut self) -> Result<String, CodecError> {
        self.read_str()
    }

    fn end_object(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn begin_sequence(&mut self) -> Result<u32, CodecError> {
        self.read_u32()
    }

    fn end_sequence(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_i8(&mut self) -> Result<i8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_i8())
    }

    fn read_i16(&mut self) -> Result<i16, CodecError> {
        self.need(2)?;
        Ok(self.buf.get_i16_le())
    }

    fn read_i32(&mut self) -> Result<i32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    fn read_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    fn read_atom(&mut self) -> Result<Atom, CodecError> {
        Ok(Atom::from_raw(self.read_u64()?))
    }

    fn read_str(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_raw(len)?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, CodecError> {
        self.need(len)?;
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }
}

/// A registered codec mapping one user type to and from bytes.
pub struct ValueCodec {
    name: Arc<str>,
    encode: Box<dyn Fn(&(dyn Any + Send)) -> Result<Vec<u8>, CodecError> + Send + Sync>,
    decode: Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, CodecError> + Send + Sync>,
}

impl ValueCodec {
    /// The registered type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encode a value of the registered type.
    pub fn encode(&self, value: &(dyn Any + Send)) -> Result<Vec<u8>, CodecError> {
        (self.encode)(value)
    }

    /// Decode a value of the registered type.
    pub fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send>, CodecError> {
        (self.decode)(bytes)
    }
}

/// A thread-safe map from type identifiers to codecs. Reads are
/// common (every remote receive validates payload types); writes
/// happen at startup.
pub struct TypeRegistry {
    by_name: RwLock<HashMap<String, Arc<ValueCodec>>>,
    by_type: RwLock<HashMap<TypeId, Arc<ValueCodec>>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            by_name: RwLock::new(HashMap::new()),
            by_type: RwLock::new(HashMap::new()),
        }
    }

    /// Register a serde-serializable type under `name`.
    pub fn register<T: Serialize + DeserializeOwned + Send + 'static>(&self, name: &str) {
        let shared: Arc<str> = name.into();
        let codec = Arc::new(ValueCodec {
            name: Arc::clone(&shared),
            encode: Box::new(|value| {
                let value = value
                    .downcast_ref::<T>()
                    .ok_or_else(|| CodecError::Codec("type mismatch".to_string()))?;
                bincode::serialize(value).map_err(|e| CodecError::Codec(e.to_string()))
            }),
            decode: Box::new(|bytes| {
                let value: T = bincode::deserialize(bytes)
                    .map_err(|e| CodecError::Codec(e.to_string()))?;
                Ok(Box::new(value) as Box<dyn Any + Send>)
            }),
        });
        self.by_name
            .write()
            .insert(name.to_string(), Arc::clone(&codec));
        self.by_type.write().insert(TypeId::of::<T>(), codec);
    }

    /// Look up a codec by its registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<ValueCodec>> {
        self.by_name.read().get(name).cloned()
    }

    /// Look up a codec by its Rust type.
    pub fn lookup(&self, type_id: TypeId) -> Option<Arc<ValueCodec>> {
        self.by_type.read().get(&type_id).cloned()
    }

    /// Tells whether `name` is registered.
    pub fn knows(&self, name: &str) -> bool {
        self.by_name.read().contains_key(name)
    }
}

// Value tags used by the message codec.
const TAG_BOOL: u8 = 1;
const TAG_I8: u8 = 2;
const TAG_I16: u8 = 3;
const TAG_I32: u8 = 4;
const TAG_I64: u8 = 5;
const TAG_U8: u8 = 6;
const TAG_U16: u8 = 7;
const TAG_U32: u8 = 8;
const TAG_U64: u8 = 9;
const TAG_F32: u8 = 10;
const TAG_F64: u8 = 11;
const TAG_STR: u8 = 12;
const TAG_ATOM: u8 = 13;
const TAG_NODE: u8 = 14;
const TAG_ADDR: u8 = 15;
const TAG_EXIT: u8 = 16;
const TAG_DOWN: u8 = 17;
const TAG_SYNC_EXITED: u8 = 18;
const TAG_TIMEOUT: u8 = 19;
const TAG_LINK: u8 = 20;
const TAG_UNLINK: u8 = 21;
const TAG_CUSTOM: u8 = 22;

fn write_node<S: Serializer + ?Sized>(sink: &mut S, node: NodeId) {
    sink.write_raw(node.as_bytes());
}

fn read_node<D: Deserializer + ?Sized>(src: &mut D) -> Result<NodeId, CodecError> {
    let bytes = src.read_raw(NODE_ID_LEN)?;
    let mut raw = [0u8; NODE_ID_LEN];
    raw.copy_from_slice(&bytes);
    Ok(NodeId::from_bytes(raw))
}

fn write_addr<S: Serializer + ?Sized>(sink: &mut S, addr: &ActorAddress) {
    write_node(sink, addr.node());
    sink.write_u32(addr.id().0);
}

fn read_addr<D: Deserializer + ?Sized>(src: &mut D) -> Result<ActorAddress, CodecError> {
    let node = read_node(src)?;
    let id = ActorId(src.read_u32()?);
    Ok(ActorAddress::unresolved(node, id))
}

/// Encode a message tuple into the sink.
pub fn write_message<S: Serializer + ?Sized>(sink: &mut S, msg: &Message) {
    sink.begin_sequence(msg.len() as u32);
    for value in msg.values() {
        match value {
            Value::Bool(v) => {
                sink.write_u8(TAG_BOOL);
                sink.write_bool(*v);
            }
            Value::I8(v) => {
                sink.write_u8(TAG_I8);
                sink.write_i8(*v);
            }
            Value::I16(v) => {
                sink.write_u8(TAG_I16);
                sink.write_i16(*v);
            }
            Value::I32(v) => {
                sink.write_u8(TAG_I32);
                sink.write_i32(*v);
            }
            Value::I64(v) => {
                sink.write_u8(TAG_I64);
                sink.write_i64(*v);
            }
            Value::U8(v) => {
                sink.write_u8(TAG_U8);
                sink.write_u8(*v);
            }
            Value::U16(v) => {
                sink.write_u8(TAG_U16);
                sink.write_u16(*v);
            }
            Value::U32(v) => {
                sink.write_u8(TAG_U32);
                sink.write_u32(*v);
            }
            Value::U64(v) => {
                sink.write_u8(TAG_U64);
                sink.write_u64(*v);
            }
            Value::F32(v) => {
                sink.write_u8(TAG_F32);
                sink.write_f32(*v);
            }
            Value::F64(v) => {
                sink.write_u8(TAG_F64);
                sink.write_f64(*v);
            }
            Value::Str(v) => {
                sink.write_u8(TAG_STR);
                sink.write_str(v);
            }
            Value::Atom(v) => {
                sink.write_u8(TAG_ATOM);
                sink.write_atom(*v);
            }
            Value::Node(v) => {
                sink.write_u8(TAG_NODE);
                write_node(sink, *v);
            }
            Value::Addr(v) => {
                sink.write_u8(TAG_ADDR);
                write_addr(sink, v);
            }
            Value::Exit(m) => {
                sink.write_u8(TAG_EXIT);
                write_addr(sink, &m.source);
                sink.write_u32(m.reason.to_u32());
            }
            Value::Down(m) => {
                sink.write_u8(TAG_DOWN);
                write_addr(sink, &m.source);
                sink.write_u32(m.reason.to_u32());
            }
            Value::SyncExited(m) => {
                sink.write_u8(TAG_SYNC_EXITED);
                write_addr(sink, &m.source);
                sink.write_u32(m.reason.to_u32());
            }
            Value::Timeout(m) => {
                sink.write_u8(TAG_TIMEOUT);
                sink.write_u64(m.id.raw());
            }
            Value::Link(LinkMsg::Link(addr)) => {
                sink.write_u8(TAG_LINK);
                write_addr(sink, addr);
            }
            Value::Link(LinkMsg::Unlink(addr)) => {
                sink.write_u8(TAG_UNLINK);
                write_addr(sink, addr);
            }
            Value::Custom { type_name, bytes } => {
                sink.write_u8(TAG_CUSTOM);
                sink.write_str(type_name);
                sink.begin_sequence(bytes.len() as u32);
                sink.write_raw(bytes);
                sink.end_sequence();
            }
        }
    }
    sink.end_sequence();
}

/// Decode a message tuple. Custom elements are checked against the
/// registry; an unregistered type name fails the whole message.
pub fn read_message<D: Deserializer + ?Sized>(
    src: &mut D,
    types: &TypeRegistry,
) -> Result<Message, CodecError> {
    let len = src.begin_sequence()?;
    let mut values = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let tag = src.read_u8()?;
        let value = match tag {
            TAG_BOOL => Value::Bool(src.read_bool()?),
            TAG_I8 => Value::I8(src.read_i8()?),
            TAG_I16 => Value::I16(src.read_i16()?),
            TAG_I32 => Value::I32(src.read_i32()?),
            TAG_I64 => Value::I64(src.read_i64()?),
            TAG_U8 => Value::U8(src.read_u8()?),
            TAG_U16 => Value::U16(src.read_u16()?),
            TAG_U32 => Value::U32(src.read_u32()?),
            TAG_U64 => Value::U64(src.read_u64()?),
            TAG_F32 => Value::F32(src.read_f32()?),
            TAG_F64 => Value::F64(src.read_f64()?),
            TAG_STR => Value::Str(src.read_str()?),
            TAG_ATOM => Value::Atom(src.read_atom()?),
            TAG_NODE => Value::Node(read_node(src)?),
            TAG_ADDR => Value::Addr(read_addr(src)?),
            TAG_EXIT => Value::Exit(ExitMsg {
                source: read_addr(src)?,
                reason: ExitReason::from_u32(src.read_u32()?),
            }),
            TAG_DOWN => Value::Down(DownMsg {
                source: read_addr(src)?,
                reason: ExitReason::from_u32(src.read_u32()?),
            }),
            TAG_SYNC_EXITED => Value::SyncExited(SyncExitedMsg {
                source: read_addr(src)?,
                reason: ExitReason::from_u32(src.read_u32()?),
            }),
            TAG_TIMEOUT => Value::Timeout(TimeoutMsg {
                id: MessageId::from_raw(src.read_u64()?),
            }),
            TAG_LINK => Value::Link(LinkMsg::Link(read_addr(src)?)),
            TAG_UNLINK => Value::Link(LinkMsg::Unlink(read_addr(src)?)),
            TAG_CUSTOM => {
                let type_name = src.read_str()?;
                if !types.knows(&type_name) {
                    return Err(CodecError::UnknownType(type_name));
                }
                let len = src.begin_sequence()? as usize;
                let bytes = src.read_raw(len)?;
                src.end_sequence()?;
                Value::Custom { type_name, bytes }
            }
            other => return Err(CodecError::InvalidTag(other)),
        };
        values.push(value);
    }
    src.end_sequence()?;
    Ok(Message::new(values))
}

/// Serialize an envelope payload to bytes.
pub(crate) fn encode_payload(msg: &Message) -> Vec<u8> {
    let mut sink = BinarySerializer::new();
    write_message(&mut sink, msg);
    sink.into_bytes()
}

/// Walk a decoded message and resolve every embedded address through
/// `resolve`; used by the broker after payload ingest.
pub(crate) fn resolve_addresses(
    msg: Message,
    mut resolve: impl FnMut(&ActorAddress) -> ActorAddress,
) -> Message {
    let values = msg
        .values()
        .iter()
        .map(|value| match value {
            Value::Addr(a) => Value::Addr(resolve(a)),
            Value::Exit(m) => Value::Exit(ExitMsg {
                source: resolve(&m.source),
                reason: m.reason,
            }),
            Value::Down(m) => Value::Down(DownMsg {
                source: resolve(&m.source),
                reason: m.reason,
            }),
            Value::SyncExited(m) => Value::SyncExited(SyncExitedMsg {
                source: resolve(&m.source),
                reason: m.reason,
            }),
            Value::Link(LinkMsg::Link(a)) => Value::Link(LinkMsg::Link(resolve(a))),
            Value::Link(LinkMsg::Unlink(a)) => Value::Link(LinkMsg::Unlink(resolve(a))),
            other => other.clone(),
        })
        .collect();
    Message::new(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::atom;

    #[test]
    fn test_primitive_roundtrip() {
        let mut sink = BinarySerializer::new();
        sink.write_bool(true);
        sink.write_i8(-5);
        sink.write_i64(i64::MIN);
        sink.write_u16(0xbeef);
        sink.write_f32(1.5);
        sink.write_f64(-2.25);
        sink.write_atom(atom("hello"));
        sink.write_str("grüße");
        let bytes = sink.into_bytes();

        let mut src = BinaryDeserializer::new(&bytes);
        assert!(src.read_bool().unwrap());
        assert_eq!(src.read_i8().unwrap(), -5);
        assert_eq!(src.read_i64().unwrap(), i64::MIN);
        assert_eq!(src.read_u16().unwrap(), 0xbeef);
        assert_eq!(src.read_f32().unwrap(), 1.5);
        assert_eq!(src.read_f64().unwrap(), -2.25);
        assert_eq!(src.read_atom().unwrap(), atom("hello"));
        assert_eq!(src.read_str().unwrap(), "grüße");
        assert_eq!(src.remaining(), 0);
    }

    #[test]
    fn test_eof_detected() {
        let mut src = BinaryDeserializer::new(&[1, 2]);
        assert!(matches!(src.read_u64(), Err(CodecError::UnexpectedEof)));
    }

    #[test]
    fn test_message_roundtrip() {
        let types = TypeRegistry::new();
        let node = NodeId::derive();
        let msg = Message::new(vec![
            Value::Atom(atom("ping")),
            Value::I32(-42),
            Value::Str("payload".to_string()),
            Value::Addr(ActorAddress::unresolved(node, ActorId(9))),
            Value::U64(u64::MAX),
            Value::Exit(ExitMsg {
                source: ActorAddress::unresolved(node, ActorId(3)),
                reason: ExitReason::RemoteLinkUnreachable,
            }),
        ]);
        let bytes = encode_payload(&msg);
        let mut src = BinaryDeserializer::new(&bytes);
        let decoded = read_message(&mut src, &types).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(src.remaining(), 0);
    }

    #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Quote {
        px: u64,
    }

    #[test]
    fn test_custom_requires_registration() {
        let msg = Message::new(vec![Value::custom("test::Quote", &Quote { px: 10 }).unwrap()]);
        let bytes = encode_payload(&msg);

        let types = TypeRegistry::new();
        let mut src = BinaryDeserializer::new(&bytes);
        assert!(matches!(
            read_message(&mut src, &types),
            Err(CodecError::UnknownType(_))
        ));

        types.register::<Quote>("test::Quote");
        let mut src = BinaryDeserializer::new(&bytes);
        let decoded = read_message(&mut src, &types).unwrap();
        assert_eq!(decoded.get_custom::<Quote>(0, "test::Quote"), Some(Quote { px: 10 }));
    }

    #[test]
    fn test_registry_lookup() {
        let types = TypeRegistry::new();
        types.register::<Quote>("test::Quote");
        let codec = types.lookup_by_name("test::Quote").unwrap();
        assert_eq!(codec.name(), "test::Quote");
        let same = types.lookup(TypeId::of::<Quote>()).unwrap();
        assert_eq!(same.name(), "test::Quote");

        let bytes = codec.encode(&Quote { px: 7 }).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<Quote>(), Some(&Quote { px: 7 }));
    }
}
