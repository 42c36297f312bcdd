/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Spindle is a distributed actor runtime: concurrent computation is
//! expressed as isolated actors that communicate only by asynchronous
//! messages, with transparent extension across a network of processes.
//!
//! # Local runtime
//!
//! A [`Runtime`] hosts actors on a work-stealing pool of OS threads.
//! Each actor owns a mailbox and a stack of behaviors; an actor
//! occupies a worker from the start of a behavior invocation until it
//! returns, and parks itself when its mailbox runs dry. Producers that
//! wake a parked mailbox hand the actor back to the scheduler, so a
//! runnable actor is always in exactly one place.
//!
//! ```
//! use spindle::{behavior, Config, Handled, Runtime};
//!
//! let rt = Runtime::new(Config::default());
//! let (client, inbox) = rt.spawn_client();
//! let echo = rt.spawn((), move |_, _| {
//!     behavior(move |_, ctx| {
//!         ctx.reply(ctx.message().clone());
//!         Ok(Handled::Done)
//!     })
//! });
//! # let _ = (client, echo, inbox);
//! ```
//!
//! # Network peering
//!
//! Runtimes peer over a binary protocol: a fixed header plus a
//! serialized payload per frame. Publishing an actor binds a listener;
//! connecting resolves the published actor into a proxy address that
//! forwards transparently through the broker. Routes may be indirect
//! (through an intermediary node), in which case the broker negotiates
//! a direct connection in the background. The transport itself is
//! abstract; see [`net::Multiplexer`] and the in-process
//! [`net::loopback::LoopbackNet`].

#![deny(missing_docs)]

pub mod actor;
pub mod behavior;
pub mod data;
pub mod hook;
pub mod mailbox;
pub mod message;
pub mod net;
pub mod reference;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod timer;

pub use actor::ActorCell;
pub use actor::Context;
pub use behavior::Behavior;
pub use behavior::BehaviorStack;
pub use behavior::Handled;
pub use behavior::behavior;
pub use hook::Hook;
pub use hook::NoopHook;
pub use message::Atom;
pub use message::DownMsg;
pub use message::Envelope;
pub use message::ExitMsg;
pub use message::ExitReason;
pub use message::Message;
pub use message::MessageId;
pub use message::SyncExitedMsg;
pub use message::TimeoutMsg;
pub use message::Value;
pub use message::atom;
pub use net::broker::BrokerError;
pub use net::broker::NetStats;
pub use reference::ActorAddress;
pub use reference::ActorId;
pub use reference::NodeId;
pub use runtime::Config;
pub use runtime::Runtime;
