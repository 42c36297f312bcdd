/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The observability hook surface.
//!
//! The broker invokes hooks at well-defined protocol events and never
//! observes their return values. Every method defaults to a no-op, so
//! implementations override only what they watch.

use crate::message::Message;
use crate::message::MessageId;
use crate::reference::ActorAddress;
use crate::reference::NodeId;

/// Callbacks for network-layer events. Implementations must be cheap
/// and non-blocking; they run on the broker thread.
#[allow(unused_variables)]
pub trait Hook: Send + Sync {
    /// A message addressed to a remote actor left this node, routed via
    /// `route`.
    fn message_sent(
        &self,
        from: &ActorAddress,
        route: NodeId,
        to: &ActorAddress,
        mid: MessageId,
        msg: &Message,
    ) {
    }

    /// A message addressed to a local actor arrived from the network.
    fn message_received(
        &self,
        from_node: NodeId,
        from: &ActorAddress,
        to: &ActorAddress,
        mid: MessageId,
        msg: &Message,
    ) {
    }

    /// No route was available for an outbound message.
    fn message_sending_failed(
        &self,
        from: &ActorAddress,
        to: &ActorAddress,
        mid: MessageId,
        msg: &Message,
    ) {
    }

    /// A frame not addressed to this node was relayed.
    fn message_forwarded(&self, from_node: NodeId, to_node: NodeId, payload_len: usize) {}

    /// A frame not addressed to this node had no route and was dropped.
    fn message_forwarding_failed(&self, from_node: NodeId, to_node: NodeId, payload_len: usize) {}

    /// A frame addressed a local actor that does not exist.
    fn invalid_message_received(
        &self,
        from_node: NodeId,
        from: &ActorAddress,
        to_id: u32,
        mid: MessageId,
        msg: &Message,
    ) {
    }

    /// A handshake completed and a default route was installed.
    fn new_connection_established(&self, node: NodeId) {}

    /// A proxy for a remote actor was created.
    fn new_remote_actor(&self, addr: &ActorAddress) {}

    /// An auxiliary route to `dest` via `via` was learned.
    fn new_route_added(&self, via: NodeId, dest: NodeId) {}

    /// An actor was published on a local port.
    fn actor_published(&self, addr: &ActorAddress, port: u16) {}
}

/// The default hook: observes nothing.
pub struct NoopHook;

impl Hook for NoopHook {}
