use std::fmt;

use crate::{
    Address, Channel, ChannelError, DumpOptions, Fatal, Index, IndexSet, KnownObjectTable,
    Location, OrFatal, Request, Response, Role, Slot, SlotStore, dump, fatal,
};

/// Compiler-side table of a split compilation.
///
/// The server cannot read the client's heap, so it never resolves an object
/// itself. Every lookup goes to the client, and the reply is reconciled into
/// the local slots: the server learns indices in the order the client hands
/// them out and refuses any reply that contradicts what it already knows.
pub struct RemoteTable<C> {
    channel: C,
    slots: SlotStore,
    constant_elements: IndexSet,
}

impl<C: fmt::Debug> fmt::Debug for RemoteTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTable")
            .field("channel", &self.channel)
            .field("end", &self.slots.size())
            .finish()
    }
}

impl<C: Channel> RemoteTable<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            slots: SlotStore::new(),
            constant_elements: IndexSet::new(),
        }
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Only null can be answered here. Any other address seen by the server
    /// may already be stale at the client, so asking is fatal.
    pub fn index_of(&mut self, object: Address) -> Index {
        if object.is_null() {
            return Index::NULL;
        }
        fatal(Fatal::ForbiddenOnServer {
            operation: "index_of",
        })
    }

    /// Null for index 0, fatal for anything else.
    pub fn pointer_of(&self, index: Index) -> Address {
        if index.is_null() {
            return Address::NULL;
        }
        fatal(Fatal::ForbiddenOnServer {
            operation: "pointer_of",
        })
    }

    fn call(&mut self, request: Request) -> Response {
        match self.channel.call(request).or_fatal() {
            Response::Error(message) => fatal(Fatal::ClientRejected(message)),
            response => response,
        }
    }

    /// Folds a client answer `(index, slot)` into the server's slots.
    pub(crate) fn reconcile(&mut self, index: Index, slot: Slot) {
        if index.is_unknown() {
            return;
        }

        let next = self.slots.size();
        if index > next {
            fatal(Fatal::IndexAhead { index, next });
        }
        if index == next {
            if let Slot::Ref(handle) = slot {
                self.slots.append(handle);
                log::debug!("server learned obj{index} ({handle})");
                return;
            }
            fatal(Fatal::HandleMismatch {
                index,
                server: Slot::Null,
                client: slot,
            });
        }

        let known = self.slots.get(index);
        if known != slot {
            fatal(Fatal::HandleMismatch {
                index,
                server: known,
                client: slot,
            });
        }
    }
}

impl<C: Channel + Send> KnownObjectTable for RemoteTable<C> {
    fn role(&self) -> Role {
        Role::ServerSide
    }

    fn end_index(&self) -> Index {
        self.slots.size()
    }

    fn slot(&self, index: Index) -> Slot {
        self.slots.get(index)
    }

    fn index_at(&mut self, location: &Location) -> Index {
        match self.call(Request::GetIndexAt {
            location: *location,
        }) {
            Response::Index { index, slot } => {
                self.reconcile(index, slot);
                index
            }
            other => fatal(
                ChannelError::UnexpectedResponse {
                    expected: "Index",
                    got: other,
                }
                .into(),
            ),
        }
    }

    fn existing_index_at(&mut self, location: &Location) -> Index {
        match self.call(Request::GetExistingIndexAt {
            location: *location,
        }) {
            Response::ExistingIndex(index) => index,
            other => fatal(
                ChannelError::UnexpectedResponse {
                    expected: "ExistingIndex",
                    got: other,
                }
                .into(),
            ),
        }
    }

    fn add_array_with_constant_elements(&mut self, index: Index) {
        if !index.is_null() && !index.is_unknown() {
            self.constant_elements.insert(index);
        }
    }

    fn is_array_with_constant_elements(&self, index: Index) -> bool {
        self.constant_elements.contains(index)
    }

    fn dump(&self, out: &mut dyn fmt::Write, _options: &DumpOptions) -> fmt::Result {
        dump::dump_summary(self.end_index(), out)
    }
}
