/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Messages and envelopes.
//!
//! A [`Message`] is a dynamically typed tuple of [`Value`]s; the core
//! never inspects payload contents beyond the system messages it
//! intercepts. Every envelope carries a [`MessageId`] tag encoding the
//! request/response correlation state of the message.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::reference::ActorAddress;
use crate::reference::NodeId;

/// The 64-bit tag carried on each envelope: a 62-bit correlation
/// counter plus a request flag and a response flag. Counter value 0
/// with both flags clear denotes an ordinary asynchronous message.
///
/// A request's [`MessageId::response_id`] is the same counter with the
/// flags swapped; at most one outstanding response ever matches a given
/// request id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct MessageId(u64);

const REQUEST_FLAG: u64 = 1 << 63;
const RESPONSE_FLAG: u64 = 1 << 62;
const COUNTER_MASK: u64 = RESPONSE_FLAG - 1;

impl MessageId {
    /// The id of an ordinary asynchronous message.
    pub const ASYNC: MessageId = MessageId(0);

    /// Make a request id from a correlation counter. The counter must
    /// be nonzero and fit in 62 bits.
    pub fn make_request(counter: u64) -> Self {
        debug_assert!(counter != 0 && counter <= COUNTER_MASK);
        Self(counter | REQUEST_FLAG)
    }

    /// The raw 64-bit wire representation.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Reconstruct an id from its wire representation.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The correlation counter.
    pub fn counter(&self) -> u64 {
        self.0 & COUNTER_MASK
    }

    /// Tells whether this id tags a request.
    pub fn is_request(&self) -> bool {
        self.0 & REQUEST_FLAG != 0
    }

    /// Tells whether this id tags a response.
    pub fn is_response(&self) -> bool {
        self.0 & RESPONSE_FLAG != 0
    }

    /// Tells whether this id tags an ordinary asynchronous message.
    pub fn is_async(&self) -> bool {
        !self.is_request() && !self.is_response()
    }

    /// The id that a response to this request will carry: the same
    /// counter with the flags swapped.
    pub fn response_id(&self) -> Self {
        Self(self.counter() | RESPONSE_FLAG)
    }

    /// The request id this response answers.
    pub fn request_id(&self) -> Self {
        Self(self.counter() | REQUEST_FLAG)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_request() {
            write!(f, "req:{}", self.counter())
        } else if self.is_response() {
            write!(f, "resp:{}", self.counter())
        } else {
            write!(f, "async")
        }
    }
}

/// A 64-bit packed symbol: up to ten characters drawn from
/// `[0-9A-Za-z_]`, packed six bits per character. Atoms give cheap,
/// order-preserving message selectors.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Atom(u64);

impl Atom {
    /// Pack a string into an atom. Panics if the input is longer than
    /// ten characters or uses a character outside the atom alphabet;
    /// atom literals are programmer-provided constants.
    pub fn from_str(s: &str) -> Self {
        assert!(s.len() <= 10, "atom too long: {:?}", s);
        let mut value = 0u64;
        for &b in s.as_bytes() {
            value = (value << 6) | u64::from(encode_atom_char(b));
        }
        Self(value)
    }

    /// The packed representation.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Reconstruct an atom from its packed representation.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

const fn encode_atom_char(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0' + 1,
        b'A'..=b'Z' => b - b'A' + 11,
        b'_' => 37,
        b'a'..=b'z' => b - b'a' + 38,
        _ => panic!("invalid atom character"),
    }
}

fn decode_atom_char(code: u8) -> char {
    match code {
        1..=10 => (b'0' + code - 1) as char,
        11..=36 => (b'A' + code - 11) as char,
        37 => '_',
        38..=63 => (b'a' + code - 38) as char,
        _ => '?',
    }
}

/// Pack an atom literal.
pub fn atom(s: &str) -> Atom {
    Atom::from_str(s)
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut chars = Vec::new();
        let mut v = self.0;
        while v != 0 {
            chars.push(decode_atom_char((v & 0x3f) as u8));
            v >>= 6;
        }
        for c in chars.iter().rev() {
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atom({})", self)
    }
}

/// The reason an actor finished, carried in exit and down messages and
/// on the wire in `kill_proxy_instance` frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// The actor has not exited. Never a valid exit reason; used as the
    /// registry's "still alive" marker.
    NotExited,
    /// Clean finish.
    Normal,
    /// A behavior invocation returned an error.
    UnhandledException,
    /// A response frame received an unmatched or ill-typed reply.
    UnhandledSyncFailure,
    /// A caller-provided shutdown code.
    UserShutdown,
    /// The peer hosting the actor became unreachable.
    RemoteLinkUnreachable,
    /// A user-defined exit code.
    User(u32),
}

const USER_REASON_BASE: u32 = 1 << 16;

impl ExitReason {
    /// The wire representation of this reason.
    pub fn to_u32(self) -> u32 {
        match self {
            Self::NotExited => 0,
            Self::Normal => 1,
            Self::UnhandledException => 2,
            Self::UnhandledSyncFailure => 4,
            Self::UserShutdown => 16,
            Self::RemoteLinkUnreachable => 257,
            Self::User(code) => USER_REASON_BASE.max(code),
        }
    }

    /// Reconstruct a reason from its wire representation. Unknown
    /// codes map onto [`ExitReason::User`].
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::NotExited,
            1 => Self::Normal,
            2 => Self::UnhandledException,
            4 => Self::UnhandledSyncFailure,
            16 => Self::UserShutdown,
            257 => Self::RemoteLinkUnreachable,
            code => Self::User(code),
        }
    }

    /// Tells whether this marks an actual exit.
    pub fn is_exited(&self) -> bool {
        !matches!(self, Self::NotExited)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotExited => write!(f, "not exited"),
            Self::Normal => write!(f, "normal"),
            Self::UnhandledException => write!(f, "unhandled exception"),
            Self::UnhandledSyncFailure => write!(f, "unhandled sync failure"),
            Self::UserShutdown => write!(f, "user shutdown"),
            Self::RemoteLinkUnreachable => write!(f, "remote link unreachable"),
            Self::User(code) => write!(f, "user defined ({})", code),
        }
    }
}

/// Sent to linked actors when an actor exits.
#[derive(Clone, Debug, PartialEq)]
pub struct ExitMsg {
    /// The exiting actor.
    pub source: ActorAddress,
    /// Why it exited.
    pub reason: ExitReason,
}

/// Sent to monitoring actors when an actor exits.
#[derive(Clone, Debug, PartialEq)]
pub struct DownMsg {
    /// The exiting actor.
    pub source: ActorAddress,
    /// Why it exited.
    pub reason: ExitReason,
}

/// Synthesized into a requester's mailbox when the target of a pending
/// request becomes unreachable; delivered under the response id of the
/// lost request.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncExitedMsg {
    /// The unreachable target.
    pub source: ActorAddress,
    /// Why the request was bounced.
    pub reason: ExitReason,
}

/// Synthesized by the timer when a response frame's timeout expires;
/// delivered under the awaited response id and terminal for that frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeoutMsg {
    /// The response id whose wait expired.
    pub id: MessageId,
}

/// Link-management requests carried between nodes.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkMsg {
    /// Establish a link with the carried address.
    Link(ActorAddress),
    /// Dissolve a link with the carried address.
    Unlink(ActorAddress),
}

/// One element of a message tuple.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// Signed integers.
    I8(i8),
    /// 16-bit signed.
    I16(i16),
    /// 32-bit signed.
    I32(i32),
    /// 64-bit signed.
    I64(i64),
    /// Unsigned integers.
    U8(u8),
    /// 16-bit unsigned.
    U16(u16),
    /// 32-bit unsigned.
    U32(u32),
    /// 64-bit unsigned.
    U64(u64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// A UTF-8 string.
    Str(String),
    /// A packed symbol.
    Atom(Atom),
    /// A node identity.
    Node(NodeId),
    /// An actor address. Serialized as the identity pair; resolution
    /// back to a live cell happens at the receiving broker.
    Addr(ActorAddress),
    /// An exit notification.
    Exit(ExitMsg),
    /// A monitor notification.
    Down(DownMsg),
    /// A bounced-request notification.
    SyncExited(SyncExitedMsg),
    /// A request-timeout notification.
    Timeout(TimeoutMsg),
    /// A link-management request.
    Link(LinkMsg),
    /// A registry-encoded user type: its registered name plus its
    /// encoded bytes. The core never inspects the bytes.
    Custom {
        /// The registered type name.
        type_name: String,
        /// The codec output.
        bytes: Vec<u8>,
    },
}

impl Value {
    /// Encode a serde-serializable user value under its registered
    /// type name.
    pub fn custom<T: Serialize>(type_name: &str, value: &T) -> Result<Self, bincode::Error> {
        Ok(Self::Custom {
            type_name: type_name.to_string(),
            bytes: bincode::serialize(value)?,
        })
    }
}

/// A dynamically typed message tuple. Cloning is cheap; the elements
/// are shared.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    values: Arc<[Value]>,
}

impl Message {
    /// Build a message from its elements.
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values: values.into(),
        }
    }

    /// An empty message.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// The number of elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Tells whether the tuple is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The elements.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The element at `idx`, if present.
    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Typed access to the element at `idx`.
    pub fn get<'a, T: FromValue<'a>>(&'a self, idx: usize) -> Option<T> {
        self.values.get(idx).and_then(T::from_value)
    }

    /// Decode a [`Value::Custom`] element at `idx` whose registered
    /// name matches `type_name`.
    pub fn get_custom<T: DeserializeOwned>(&self, idx: usize, type_name: &str) -> Option<T> {
        match self.values.get(idx) {
            Some(Value::Custom { type_name: name, bytes }) if name == type_name => {
                bincode::deserialize(bytes).ok()
            }
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", v)?;
        }
        write!(f, ")")
    }
}

impl FromIterator<Value> for Message {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Typed extraction from a [`Value`].
pub trait FromValue<'a>: Sized {
    /// Extract `Self` from the value, if the variant matches.
    fn from_value(value: &'a Value) -> Option<Self>;
}

macro_rules! from_value_prim {
    ($ty:ty, $variant:ident) => {
        impl<'a> FromValue<'a> for $ty {
            fn from_value(value: &'a Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(*v),
                    _ => None,
                }
            }
        }
    };
}

from_value_prim!(bool, Bool);
from_value_prim!(i8, I8);
from_value_prim!(i16, I16);
from_value_prim!(i32, I32);
from_value_prim!(i64, I64);
from_value_prim!(u8, U8);
from_value_prim!(u16, U16);
from_value_prim!(u32, U32);
from_value_prim!(u64, U64);
from_value_prim!(f32, F32);
from_value_prim!(f64, F64);
from_value_prim!(Atom, Atom);
from_value_prim!(NodeId, Node);

impl<'a> FromValue<'a> for &'a str {
    fn from_value(value: &'a Value) -> Option<Self> {
        match value {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl<'a> FromValue<'a> for ActorAddress {
    fn from_value(value: &'a Value) -> Option<Self> {
        match value {
            Value::Addr(a) => Some(a.clone()),
            _ => None,
        }
    }
}

impl<'a> FromValue<'a> for &'a ExitMsg {
    fn from_value(value: &'a Value) -> Option<Self> {
        match value {
            Value::Exit(m) => Some(m),
            _ => None,
        }
    }
}

impl<'a> FromValue<'a> for &'a DownMsg {
    fn from_value(value: &'a Value) -> Option<Self> {
        match value {
            Value::Down(m) => Some(m),
            _ => None,
        }
    }
}

impl<'a> FromValue<'a> for &'a SyncExitedMsg {
    fn from_value(value: &'a Value) -> Option<Self> {
        match value {
            Value::SyncExited(m) => Some(m),
            _ => None,
        }
    }
}

impl<'a> FromValue<'a> for TimeoutMsg {
    fn from_value(value: &'a Value) -> Option<Self> {
        match value {
            Value::Timeout(m) => Some(*m),
            _ => None,
        }
    }
}

/// Build a [`Message`] from a list of expressions convertible into
/// [`Value`]s.
#[macro_export]
macro_rules! msg {
    ($($value:expr),* $(,)?) => {
        $crate::message::Message::new(vec![$($crate::message::Value::from($value)),*])
    };
}

macro_rules! value_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    };
}

value_from!(bool, Bool);
value_from!(i8, I8);
value_from!(i16, I16);
value_from!(i32, I32);
value_from!(i64, I64);
value_from!(u8, U8);
value_from!(u16, U16);
value_from!(u32, U32);
value_from!(u64, U64);
value_from!(f32, F32);
value_from!(f64, F64);
value_from!(String, Str);
value_from!(Atom, Atom);
value_from!(NodeId, Node);
value_from!(ActorAddress, Addr);
value_from!(ExitMsg, Exit);
value_from!(DownMsg, Down);
value_from!(SyncExitedMsg, SyncExited);
value_from!(TimeoutMsg, Timeout);
value_from!(LinkMsg, Link);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

/// A unit of delivery: sender, receiver, correlation tag, and payload.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// The sending actor; may be invalid for runtime-synthesized
    /// messages.
    pub sender: ActorAddress,
    /// The target actor.
    pub receiver: ActorAddress,
    /// The correlation tag.
    pub mid: MessageId,
    /// The payload tuple.
    pub message: Message,
}

impl Envelope {
    /// Build an envelope.
    pub fn new(
        sender: ActorAddress,
        receiver: ActorAddress,
        mid: MessageId,
        message: Message,
    ) -> Self {
        Self {
            sender,
            receiver,
            mid,
            message,
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} > {} [{:?}]: {}",
            self.sender, self.receiver, self.mid, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_flags() {
        let req = MessageId::make_request(42);
        assert!(req.is_request());
        assert!(!req.is_response());
        assert!(!req.is_async());

        let resp = req.response_id();
        assert!(resp.is_response());
        assert!(!resp.is_request());
        assert_eq!(resp.counter(), 42);
        assert_eq!(resp.request_id(), req);
        assert!(MessageId::ASYNC.is_async());
    }

    #[test]
    fn test_message_id_raw_roundtrip() {
        for counter in [1u64, 2, 1000, COUNTER_MASK] {
            let id = MessageId::make_request(counter);
            assert_eq!(MessageId::from_raw(id.raw()), id);
        }
    }

    #[test]
    fn test_atom_roundtrip() {
        for s in ["ping", "pong", "SEND", "a", "0123456789", "with_under"] {
            let a = atom(s);
            assert_eq!(a.to_string(), s);
            assert_eq!(Atom::from_raw(a.raw()), a);
        }
        assert_ne!(atom("ping"), atom("pong"));
    }

    #[test]
    fn test_exit_reason_codes() {
        for reason in [
            ExitReason::Normal,
            ExitReason::UnhandledException,
            ExitReason::UnhandledSyncFailure,
            ExitReason::UserShutdown,
            ExitReason::RemoteLinkUnreachable,
            ExitReason::User(70000),
        ] {
            assert_eq!(ExitReason::from_u32(reason.to_u32()), reason);
        }
        assert!(!ExitReason::NotExited.is_exited());
        assert!(ExitReason::Normal.is_exited());
    }

    #[test]
    fn test_message_accessors() {
        let m = msg![atom("ping"), 42i32, "hello"];
        assert_eq!(m.len(), 3);
        assert_eq!(m.get::<Atom>(0), Some(atom("ping")));
        assert_eq!(m.get::<i32>(1), Some(42));
        assert_eq!(m.get::<&str>(2), Some("hello"));
        assert_eq!(m.get::<i32>(0), None);
        assert_eq!(m.get::<i32>(9), None);
    }

    #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Order {
        qty: u32,
        sym: String,
    }

    #[test]
    fn test_custom_value_roundtrip() {
        let order = Order {
            qty: 7,
            sym: "X".into(),
        };
        let v = Value::custom("test::Order", &order).unwrap();
        let m = Message::new(vec![v]);
        assert_eq!(m.get_custom::<Order>(0, "test::Order"), Some(order));
        assert_eq!(m.get_custom::<Order>(0, "test::Other"), None);
    }
}
