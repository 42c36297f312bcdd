/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The process-wide actor directory.
//!
//! The registry is the single source of truth for "is this local actor
//! alive right now". It holds the strong reference that keeps a local
//! actor's cell alive; erasing an entry releases the cell and records
//! the exit reason for later lookups. Reads vastly outnumber writes
//! (every remote receive resolves through here), so the map is sharded.

use std::sync::Arc;

use dashmap::DashMap;

use crate::actor::ActorCell;
use crate::actor::ExitFunctor;
use crate::message::ExitReason;
use crate::reference::ActorId;

struct Entry {
    cell: Option<Arc<dyn ActorCell>>,
    reason: ExitReason,
}

/// Mapping from [`ActorId`] to the live cell or the recorded exit
/// reason.
pub struct ActorRegistry {
    entries: DashMap<ActorId, Entry>,
}

impl Default for ActorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert (or re-insert) a live actor. Idempotent for an actor that
    /// is already present and alive; a no-op for one that has exited.
    pub fn put(&self, id: ActorId, cell: Arc<dyn ActorCell>) {
        if id.is_invalid() {
            return;
        }
        let mut entry = self.entries.entry(id).or_insert(Entry {
            cell: None,
            reason: ExitReason::NotExited,
        });
        if !entry.reason.is_exited() {
            entry.cell = Some(cell);
        }
    }

    /// The live cell for `id`, if the actor has not exited.
    pub fn get(&self, id: ActorId) -> Option<Arc<dyn ActorCell>> {
        self.entries.get(&id).and_then(|e| e.cell.clone())
    }

    /// Both fields of the entry: the cell (when alive) and the exit
    /// reason ([`ExitReason::NotExited`] while alive or unknown).
    pub fn get_entry(&self, id: ActorId) -> (Option<Arc<dyn ActorCell>>, ExitReason) {
        match self.entries.get(&id) {
            Some(e) => (e.cell.clone(), e.reason),
            None => (None, ExitReason::NotExited),
        }
    }

    /// Mark `id` exited with `reason`, releasing the strong reference.
    pub fn erase(&self, id: ActorId, reason: ExitReason) {
        let mut entry = self.entries.entry(id).or_insert(Entry {
            cell: None,
            reason: ExitReason::NotExited,
        });
        if !entry.reason.is_exited() {
            entry.reason = reason;
        }
        entry.cell = None;
    }

    /// Run `f(reason)` when the actor exits, or immediately and
    /// synchronously when it already has. The cell's own functor list
    /// carries the deferred case, so attachment and exit cannot race.
    pub fn attach_functor(&self, id: ActorId, f: ExitFunctor) {
        let (cell, reason) = self.get_entry(id);
        match cell {
            Some(cell) => cell.attach_functor(f),
            None => f(if reason.is_exited() {
                reason
            } else {
                ExitReason::Normal
            }),
        }
    }

    /// The number of live entries. Used by shutdown diagnostics.
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.cell.is_some()).count()
    }

    /// Drop every entry, releasing all strong references. Runtime
    /// teardown only.
    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}
