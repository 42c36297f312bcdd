/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The network layer: the multiplexer contract, the peering wire
//! format, and the broker that ties local actor traffic to the
//! network.
//!
//! The transport itself lives behind the [`Multiplexer`] trait: the
//! broker asks it for stream ("scribe") and listener ("doorman")
//! handles and consumes the readiness events it posts. All broker
//! state is confined to the broker's service thread; everything else
//! funnels through its message channel.

use crossbeam_channel::Sender;

pub mod broker;
pub mod loopback;
pub mod proxy;
pub mod wire;

/// A connected stream endpoint handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

/// A listening endpoint handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AcceptHandle(pub u64);

/// How much data the broker wants before the next read event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceivePolicy {
    /// Deliver exactly `n` bytes.
    Exactly(usize),
    /// Deliver at most `n` bytes, as soon as any are available.
    AtMost(usize),
}

/// Readiness events posted by the multiplexer to the broker.
#[derive(Debug)]
pub enum NetEvent {
    /// A doorman accepted a connection.
    NewConnection {
        /// The accepting doorman.
        acceptor: AcceptHandle,
        /// The new connection.
        hdl: ConnectionHandle,
    },
    /// A read satisfying the connection's receive policy completed.
    NewData {
        /// The connection.
        hdl: ConnectionHandle,
        /// The bytes read.
        buf: Vec<u8>,
    },
    /// The peer closed the connection, or it failed.
    ConnectionClosed {
        /// The connection.
        hdl: ConnectionHandle,
    },
    /// A doorman stopped accepting.
    AcceptorClosed {
        /// The doorman.
        hdl: AcceptHandle,
    },
}

/// Errors surfaced by multiplexer operations.
#[derive(thiserror::Error, Debug)]
pub enum NetError {
    /// No listener was reachable at the requested endpoint.
    #[error("connection refused: {0}:{1}")]
    ConnectionRefused(String, u16),

    /// The requested port is already bound.
    #[error("port in use: {0}")]
    PortInUse(u16),

    /// The handle is unknown or already closed.
    #[error("invalid handle")]
    InvalidHandle,

    /// The multiplexer has shut down.
    #[error("multiplexer stopped")]
    Stopped,
}

/// The nonblocking transport surface the broker consumes.
///
/// One multiplexer instance backs one node. Readiness events flow
/// through the sender registered with [`Multiplexer::start`]; every
/// other method is called from the broker thread only.
pub trait Multiplexer: Send + Sync {
    /// Register the event sink and start delivering events.
    fn start(&self, events: Sender<NetEvent>);

    /// Open a connection to a remote listener.
    fn new_tcp_scribe(&self, host: &str, port: u16) -> Result<ConnectionHandle, NetError>;

    /// Open a listener. Port 0 picks a free port; the bound port is
    /// returned.
    fn new_tcp_doorman(&self, port: u16) -> Result<(AcceptHandle, u16), NetError>;

    /// Take ownership of a scribe handle obtained elsewhere.
    fn assign_tcp_scribe(&self, hdl: ConnectionHandle) -> Result<(), NetError>;

    /// Take ownership of a doorman handle obtained elsewhere.
    fn assign_tcp_doorman(&self, hdl: AcceptHandle) -> Result<(), NetError>;

    /// Set the read policy and arm the next read event for `hdl`.
    fn configure_read(&self, hdl: ConnectionHandle, policy: ReceivePolicy);

    /// Append bytes to the connection's write buffer.
    fn write(&self, hdl: ConnectionHandle, bytes: &[u8]);

    /// Transmit the write buffer.
    fn flush(&self, hdl: ConnectionHandle);

    /// Close a connection.
    fn close(&self, hdl: ConnectionHandle);

    /// Close a listener.
    fn close_doorman(&self, hdl: AcceptHandle);

    /// The `(family, address)` pairs under which this node's listeners
    /// are reachable, advertised in direct-connection offers.
    fn local_endpoints(&self) -> Vec<(String, String)>;
}
