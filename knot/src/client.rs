use std::fmt;

use crate::{
    AccessToken, Address, DirectAccess, DumpOptions, Fatal, Heap, HeapError, Index,
    KnownObjectTable, LocalTable, Location, Request, Response, Role, Slot,
};

/// Runtime-side table of a split compilation.
///
/// Behaves like a [`LocalTable`] and also answers the server's requests. The
/// client alone decides index order; the server only mirrors it.
#[derive(Debug)]
pub struct ClientTable {
    table: LocalTable,
}

impl ClientTable {
    pub fn new(heap: &Heap) -> Self {
        Self {
            table: LocalTable::new(heap),
        }
    }

    pub fn heap(&self) -> &Heap {
        self.table.heap()
    }

    /// Answers one request under the client's own heap access.
    ///
    /// Bad requests get a [`Response::Error`] instead of aborting: the
    /// server's compilation fails, the runtime keeps going.
    pub fn serve(&mut self, request: Request) -> Response {
        log::trace!("client serving {request:?}");
        let heap = self.table.heap().clone();
        let token = heap.acquire();

        match request {
            Request::GetIndex { object } => {
                if !object.is_null() && !token.is_live(object) {
                    return Response::Error(HeapError::StaleAddress(object).to_string());
                }
                self.resolve(&token, object)
            }
            Request::GetIndexAt { location } => match token.read(&location) {
                Ok(object) => self.resolve(&token, object),
                Err(err) => Response::Error(err.to_string()),
            },
            Request::GetExistingIndexAt { location } => match token.read(&location) {
                Ok(object) => Response::ExistingIndex(self.table.existing_index_of(&token, object)),
                Err(err) => Response::Error(err.to_string()),
            },
            Request::GetPointer { index } => {
                let end = self.table.end_index();
                if index.is_unknown() || index >= end {
                    return Response::Error(Fatal::IndexOutOfRange { index, end }.to_string());
                }
                Response::Pointer(self.table.pointer_of(&token, index))
            }
        }
    }

    fn resolve(&mut self, token: &AccessToken<'_>, object: Address) -> Response {
        let index = self.table.index_of(token, object);
        Response::Index {
            index,
            slot: self.table.slot(index),
        }
    }
}

impl KnownObjectTable for ClientTable {
    fn role(&self) -> Role {
        Role::ClientSide
    }

    fn end_index(&self) -> Index {
        self.table.end_index()
    }

    fn slot(&self, index: Index) -> Slot {
        self.table.slot(index)
    }

    fn index_at(&mut self, location: &Location) -> Index {
        self.table.index_at(location)
    }

    fn existing_index_at(&mut self, location: &Location) -> Index {
        self.table.existing_index_at(location)
    }

    fn add_array_with_constant_elements(&mut self, index: Index) {
        self.table.add_array_with_constant_elements(index)
    }

    fn is_array_with_constant_elements(&self, index: Index) -> bool {
        self.table.is_array_with_constant_elements(index)
    }

    fn dump(&self, out: &mut dyn fmt::Write, options: &DumpOptions) -> fmt::Result {
        self.table.dump(out, options)
    }
}

impl DirectAccess for ClientTable {
    fn index_of(&mut self, token: &AccessToken<'_>, object: Address) -> Index {
        self.table.index_of(token, object)
    }

    fn existing_index_of(&self, token: &AccessToken<'_>, object: Address) -> Index {
        self.table.existing_index_of(token, object)
    }

    fn pointer_of(&self, token: &AccessToken<'_>, index: Index) -> Address {
        self.table.pointer_of(token, index)
    }
}
