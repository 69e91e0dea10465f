//! Registration tables shared by the features.
//!
//! Every registration has two names: a local id that never changes, and the
//! conversation id of the request that registered it with the server. The
//! server names the registration by the latter in its pushes and expects it
//! back in follow-up requests. A reconnection replay registers everything
//! again under fresh conversation ids, so the second name moves.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::conversation::ConversationId;

struct Slot<E> {
    wire: ConversationId,
    entry: E,
}

struct Slots<E> {
    next_id: u64,
    entries: HashMap<u64, Slot<E>>,
    by_wire: HashMap<ConversationId, u64>,
}

/// Entries of type `E` indexed by local id and by wire id.
///
/// Closures passed in run under the table's lock. They must not call back
/// into the session; collect what is needed and act after they return.
pub(crate) struct WireRegistry<E> {
    slots: Mutex<Slots<E>>,
}

impl<E> WireRegistry<E> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                next_id: 0,
                entries: HashMap::new(),
                by_wire: HashMap::new(),
            }),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    /// Add `entry`, known to the server as `wire`. Returns its local id.
    pub(crate) fn insert(&self, entry: E, wire: ConversationId) -> u64 {
        let mut slots = self.slots.lock();
        slots.next_id += 1;
        let id = slots.next_id;
        slots.entries.insert(id, Slot { wire, entry });
        slots.by_wire.insert(wire, id);
        id
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.slots.lock().entries.contains_key(&id)
    }

    /// Wire id of a live entry.
    pub(crate) fn wire(&self, id: u64) -> Option<ConversationId> {
        self.slots.lock().entries.get(&id).map(|slot| slot.wire)
    }

    /// Run `f` on the entry with local id `id`.
    pub(crate) fn with<R>(&self, id: u64, f: impl FnOnce(&mut E) -> R) -> Option<R> {
        let mut slots = self.slots.lock();
        slots.entries.get_mut(&id).map(|slot| f(&mut slot.entry))
    }

    /// Run `f` on the entry the server calls `wire`.
    pub(crate) fn with_wire<R>(
        &self,
        wire: ConversationId,
        f: impl FnOnce(u64, &mut E) -> R,
    ) -> Option<R> {
        let mut slots = self.slots.lock();
        let id = slots.by_wire.get(&wire).copied()?;
        slots.entries.get_mut(&id).map(|slot| f(id, &mut slot.entry))
    }

    pub(crate) fn remove(&self, id: u64) -> Option<E> {
        let mut slots = self.slots.lock();
        let slot = slots.entries.remove(&id)?;
        slots.by_wire.remove(&slot.wire);
        Some(slot.entry)
    }

    /// Remove every entry, oldest first.
    pub(crate) fn drain(&self) -> Vec<E> {
        let mut drained: Vec<(u64, Slot<E>)> = {
            let mut slots = self.slots.lock();
            slots.by_wire.clear();
            slots.entries.drain().collect()
        };
        drained.sort_by_key(|(id, _)| *id);
        drained.into_iter().map(|(_, slot)| slot.entry).collect()
    }

    /// Give every entry `plan` accepts a fresh wire id from `allocate` and
    /// collect what `plan` extracted from it, oldest first.
    ///
    /// Ids the server knew the moved entries by stop resolving at once.
    /// Entries `plan` declines keep their wire id.
    pub(crate) fn rebind<P>(
        &self,
        mut allocate: impl FnMut() -> ConversationId,
        mut plan: impl FnMut(&E) -> Option<P>,
    ) -> Vec<(u64, ConversationId, P)> {
        let mut slots = self.slots.lock();
        let mut ids: Vec<u64> = slots.entries.keys().copied().collect();
        ids.sort_unstable();

        let mut plans = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(slot) = slots.entries.get_mut(&id) else {
                continue;
            };
            let Some(planned) = plan(&slot.entry) else {
                continue;
            };
            let wire = allocate();
            let old = std::mem::replace(&mut slot.wire, wire);
            slots.by_wire.remove(&old);
            slots.by_wire.insert(wire, id);
            plans.push((id, wire, planned));
        }
        plans
    }
}
