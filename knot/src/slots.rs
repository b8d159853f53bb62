use serde::{Deserialize, Serialize};

use crate::{Fatal, Handle, Index, fatal};

/// Content of one table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    Null,
    Ref(Handle),
}

impl Slot {
    pub fn handle(self) -> Option<Handle> {
        match self {
            Slot::Null => None,
            Slot::Ref(handle) => Some(handle),
        }
    }
}

/// Append-only sequence of slots.
///
/// Slot 0 is the null placeholder and exists from construction. Slots are
/// never removed or renumbered. The store does not touch the heap; whether a
/// handle is still valid is the caller's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStore {
    slots: Vec<Slot>,
}

impl Default for SlotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::Null],
        }
    }

    /// Adds a slot and returns its index, which is always the previous size.
    pub fn append(&mut self, handle: Handle) -> Index {
        let index = self.size();
        if index.next().is_unknown() {
            fatal(Fatal::TableExhausted);
        }
        self.slots.push(Slot::Ref(handle));
        index
    }

    /// One past the highest index in use.
    #[inline]
    pub fn size(&self) -> Index {
        Index::new(self.slots.len() as u32)
    }

    #[track_caller]
    pub fn get(&self, index: Index) -> Slot {
        match self.slots.get(index.as_usize()) {
            Some(&slot) if !index.is_unknown() => slot,
            _ => fatal(Fatal::IndexOutOfRange {
                index,
                end: self.size(),
            }),
        }
    }

    /// Non-null slots in index order.
    pub fn refs(&self) -> impl Iterator<Item = (Index, Handle)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(i, slot)| slot.handle().map(|h| (Index::new(i as u32), h)))
    }
}
