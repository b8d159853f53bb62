use std::fmt;

use crate::{
    AccessToken, Address, DumpOptions, Fatal, Heap, Index, IndexSet, Location, OrFatal, Slot,
    SlotStore, dump, fatal,
};

/// Which side of a compilation a table lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// compiler and runtime share a process
    Local,
    /// compiler in a separate process, cannot read the heap
    ServerSide,
    /// runtime answering a remote compiler
    ClientSide,
}

/// Operations every known object table supports, whatever its role.
pub trait KnownObjectTable: Send {
    fn role(&self) -> Role;

    /// One past the highest index handed out so far.
    fn end_index(&self) -> Index;

    fn is_null(&self, index: Index) -> bool {
        index.is_null()
    }

    /// Slot bound to `index`. Fatal if `index` is `UNKNOWN` or out of range.
    fn slot(&self, index: Index) -> Slot;

    /// Index of the object stored at `location`, allocating one if needed.
    fn index_at(&mut self, location: &Location) -> Index;

    fn index_at_with_constant_elements(
        &mut self,
        location: &Location,
        constant_elements: bool,
    ) -> Index {
        let index = self.index_at(location);
        if constant_elements {
            self.add_array_with_constant_elements(index);
        }
        index
    }

    /// Like [`index_at`](Self::index_at) but never allocates, `UNKNOWN` if the
    /// object has no slot.
    fn existing_index_at(&mut self, location: &Location) -> Index;

    /// Null and `UNKNOWN` are ignored.
    fn add_array_with_constant_elements(&mut self, index: Index);

    fn is_array_with_constant_elements(&self, index: Index) -> bool;

    fn dump(&self, out: &mut dyn fmt::Write, options: &DumpOptions) -> fmt::Result;
}

/// Identity-based operations, only available where the heap can be read.
pub trait DirectAccess: KnownObjectTable {
    fn index_of(&mut self, token: &AccessToken<'_>, object: Address) -> Index;

    fn index_of_with_constant_elements(
        &mut self,
        token: &AccessToken<'_>,
        object: Address,
        constant_elements: bool,
    ) -> Index {
        let index = self.index_of(token, object);
        if constant_elements {
            self.add_array_with_constant_elements(index);
        }
        index
    }

    fn existing_index_of(&self, token: &AccessToken<'_>, object: Address) -> Index;

    /// Live address of the object at `index`, null for index 0.
    fn pointer_of(&self, token: &AccessToken<'_>, index: Index) -> Address;
}

/// Table for a compilation running in the same process as the heap.
#[derive(Debug)]
pub struct LocalTable {
    heap: Heap,
    slots: SlotStore,
    constant_elements: IndexSet,
}

impl LocalTable {
    pub fn new(heap: &Heap) -> Self {
        Self {
            heap: heap.clone(),
            slots: SlotStore::new(),
            constant_elements: IndexSet::new(),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[track_caller]
    fn check_token(&self, token: &AccessToken<'_>) {
        if !self.heap.same_heap(token.heap()) {
            fatal(Fatal::ForeignToken);
        }
    }
}

impl Drop for LocalTable {
    fn drop(&mut self) {
        let released = self
            .heap
            .release_handles(self.slots.refs().map(|(_, handle)| handle));
        log::trace!("known object table dropped, released {released} handles");
    }
}

impl KnownObjectTable for LocalTable {
    fn role(&self) -> Role {
        Role::Local
    }

    fn end_index(&self) -> Index {
        self.slots.size()
    }

    fn slot(&self, index: Index) -> Slot {
        self.slots.get(index)
    }

    fn index_at(&mut self, location: &Location) -> Index {
        let heap = self.heap.clone();
        let token = heap.acquire();
        let object = token.read(location).or_fatal();
        self.index_of(&token, object)
    }

    fn existing_index_at(&mut self, location: &Location) -> Index {
        let heap = self.heap.clone();
        let token = heap.acquire();
        let object = token.read(location).or_fatal();
        self.existing_index_of(&token, object)
    }

    fn add_array_with_constant_elements(&mut self, index: Index) {
        if !index.is_null() && !index.is_unknown() {
            self.constant_elements.insert(index);
        }
    }

    fn is_array_with_constant_elements(&self, index: Index) -> bool {
        self.constant_elements.contains(index)
    }

    fn dump(&self, out: &mut dyn fmt::Write, options: &DumpOptions) -> fmt::Result {
        dump::dump_local(self, out, options)
    }
}

impl DirectAccess for LocalTable {
    fn index_of(&mut self, token: &AccessToken<'_>, object: Address) -> Index {
        if object.is_null() {
            return Index::NULL;
        }
        self.check_token(token);

        for (index, handle) in self.slots.refs() {
            if token.resolve(handle).or_fatal() == object {
                log::trace!("known object {object} already at obj{index}");
                return index;
            }
        }

        let handle = token.new_handle(object).or_fatal();
        let index = self.slots.append(handle);
        log::debug!("known object {object} assigned obj{index} ({handle})");
        index
    }

    fn existing_index_of(&self, token: &AccessToken<'_>, object: Address) -> Index {
        if object.is_null() {
            return Index::NULL;
        }
        self.check_token(token);

        self.slots
            .refs()
            .find(|&(_, handle)| token.resolve(handle).or_fatal() == object)
            .map_or(Index::UNKNOWN, |(index, _)| index)
    }

    fn pointer_of(&self, token: &AccessToken<'_>, index: Index) -> Address {
        match self.slots.get(index) {
            Slot::Null => Address::NULL,
            Slot::Ref(handle) => {
                self.check_token(token);
                token.resolve(handle).or_fatal()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use proptest::prelude::*;

    use super::*;
    use crate::{
        ClassInfo, Compilation, FieldDescriptor, Handle, HeapCreateInfo, Store, catch_fatal,
    };

    fn heap_with(count: usize) -> (Heap, Vec<Handle>) {
        let heap = Heap::new(HeapCreateInfo::default()).expect("heap");
        let class = heap.define_class(
            ClassInfo::new("knot/test/Box")
                .field(FieldDescriptor::new("value", "Ljava/lang/Object;").immutable()),
        );
        let handles = (0..count).map(|_| heap.allocate(class)).collect();
        (heap, handles)
    }

    #[test]
    fn indices_follow_first_appearance() {
        let (heap, objects) = heap_with(2);
        let mut table = LocalTable::new(&heap);
        assert_eq!(table.end_index(), Index::new(1));

        let token = heap.acquire();
        let a = token.resolve(objects[0]).expect("a");
        let b = token.resolve(objects[1]).expect("b");

        assert_eq!(table.index_of(&token, a), Index::new(1));
        assert_eq!(table.index_of(&token, b), Index::new(2));
        assert_eq!(table.index_of(&token, a), Index::new(1));
        assert_eq!(table.end_index(), Index::new(3), "no growth on repeat");
    }

    #[test]
    fn null_maps_to_index_zero() {
        let (heap, _) = heap_with(0);
        let mut table = LocalTable::new(&heap);
        let token = heap.acquire();
        assert_eq!(table.index_of(&token, Address::NULL), Index::NULL);
        assert_eq!(table.pointer_of(&token, Index::NULL), Address::NULL);
        assert_eq!(table.existing_index_of(&token, Address::NULL), Index::NULL);
        assert_eq!(table.end_index(), Index::new(1));
        assert!(table.is_null(Index::NULL));
    }

    #[test]
    fn indices_survive_collection() {
        let (heap, objects) = heap_with(2);
        let mut table = LocalTable::new(&heap);
        let first = table.index_at(&Location::Handle(objects[0]));
        let second = table.index_at(&Location::Handle(objects[1]));

        heap.collect();

        assert_eq!(table.index_at(&Location::Handle(objects[0])), first);
        assert_eq!(table.existing_index_at(&Location::Handle(objects[1])), second);
        let token = heap.acquire();
        assert_eq!(
            table.pointer_of(&token, first),
            token.resolve(objects[0]).expect("a"),
            "pointer_of follows the object after it moved"
        );
    }

    #[test]
    fn index_at_reads_field_locations() {
        let (heap, objects) = heap_with(2);
        heap.store(objects[0], "value", Store::Ref(objects[1]))
            .expect("store");
        let mut table = LocalTable::new(&heap);

        let through_field = table.index_at(&Location::Field {
            holder: objects[0],
            field: 0,
        });
        let direct = table.index_at(&Location::Handle(objects[1]));
        assert_eq!(through_field, direct);

        let empty_field = table.index_at(&Location::Field {
            holder: objects[1],
            field: 0,
        });
        assert_eq!(empty_field, Index::NULL);
    }

    #[test]
    fn existing_index_never_allocates() {
        let (heap, objects) = heap_with(3);
        let mut table = LocalTable::new(&heap);
        table.index_at(&Location::Handle(objects[0]));
        let size = table.end_index();

        for _ in 0..3 {
            assert_eq!(
                table.existing_index_at(&Location::Handle(objects[2])),
                Index::UNKNOWN
            );
            assert_eq!(
                table.existing_index_at(&Location::Handle(objects[0])),
                Index::new(1)
            );
        }
        assert_eq!(table.end_index(), size);
    }

    #[test]
    fn constant_elements_tag_skips_null() {
        let (heap, objects) = heap_with(2);
        let mut table = LocalTable::new(&heap);

        let tagged = table.index_at_with_constant_elements(&Location::Handle(objects[0]), true);
        let untagged = table.index_at_with_constant_elements(&Location::Handle(objects[1]), false);
        table.add_array_with_constant_elements(Index::NULL);
        table.add_array_with_constant_elements(Index::UNKNOWN);

        assert!(table.is_array_with_constant_elements(tagged));
        assert!(!table.is_array_with_constant_elements(untagged));
        assert!(!table.is_array_with_constant_elements(Index::NULL));

        let token = heap.acquire();
        let object = token.resolve(objects[1]).expect("b");
        let again = table.index_of_with_constant_elements(&token, object, true);
        assert_eq!(again, untagged, "tagging does not change identity resolution");
        assert!(table.is_array_with_constant_elements(untagged));
    }

    #[test]
    fn pointer_of_out_of_range_is_fatal() {
        let (heap, _) = heap_with(0);
        let table = LocalTable::new(&heap);
        let token = heap.acquire();
        let result = catch_fatal(|| table.pointer_of(&token, Index::new(4)));
        assert!(matches!(result, Err(Fatal::IndexOutOfRange { .. })));
        let result = catch_fatal(|| table.pointer_of(&token, Index::UNKNOWN));
        assert!(matches!(result, Err(Fatal::IndexOutOfRange { .. })));
    }

    #[test]
    fn foreign_tokens_are_rejected() {
        let (heap, objects) = heap_with(1);
        let (other, _) = heap_with(0);
        let mut table = LocalTable::new(&heap);

        let object = heap.acquire().resolve(objects[0]).expect("a");
        let token = other.acquire();
        let result = catch_fatal(|| table.index_of(&token, object));
        assert!(matches!(result, Err(Fatal::ForeignToken)));
    }

    #[test]
    fn stale_addresses_are_fatal() {
        let (heap, objects) = heap_with(1);
        let mut table = LocalTable::new(&heap);
        let stale = heap.acquire().resolve(objects[0]).expect("a");
        heap.collect();

        let token = heap.acquire();
        let result = catch_fatal(|| table.index_of(&token, stale));
        assert!(matches!(result, Err(Fatal::Heap(_))));
        assert_eq!(table.end_index(), Index::new(1));
    }

    #[test]
    fn dropped_tables_release_their_handles() {
        let (heap, objects) = heap_with(4);
        let baseline = heap.handle_count();

        for _ in 0..20 {
            let finished = Compilation::new(LocalTable::new(&heap))
                .run(|table| {
                    for &object in &objects {
                        table.index_at(&Location::Handle(object));
                    }
                })
                .expect("compilation");
            assert_eq!(heap.handle_count(), baseline + objects.len());
            drop(finished);
            assert_eq!(heap.handle_count(), baseline);
        }

        let aborted = Compilation::new(LocalTable::new(&heap)).run(|table| {
            table.index_at(&Location::Handle(objects[0]));
            table.slot(Index::new(9))
        });
        assert!(aborted.is_err());
        assert_eq!(heap.handle_count(), baseline, "aborted compilations release too");

        let mut table = LocalTable::new(&heap);
        let index = table.index_at(&Location::Handle(objects[0]));
        let handle = table.slot(index).handle().expect("handle");
        assert!(
            (handle.raw() as usize) < baseline + objects.len(),
            "released slots are reused"
        );
    }

    #[test]
    fn lookups_proceed_while_a_collector_waits() {
        let (heap, objects) = heap_with(2);
        let mut table = LocalTable::new(&heap);

        let token = heap.acquire();
        let collector = {
            let heap = heap.clone();
            thread::spawn(move || heap.collect())
        };
        // let the collector queue up behind the held token
        thread::sleep(Duration::from_millis(50));

        let first = table.index_at(&Location::Handle(objects[0]));
        assert_eq!(table.existing_index_at(&Location::Handle(objects[0])), first);
        assert_eq!(
            table.pointer_of(&token, first),
            token.resolve(objects[0]).expect("a")
        );
        drop(token);

        assert_eq!(collector.join().expect("collector"), 2);
        assert_eq!(table.index_at(&Location::Handle(objects[0])), first);
    }

    proptest! {
        #[test]
        fn indices_are_unique_and_stable(picks in prop::collection::vec(0usize..12, 1..64)) {
            let (heap, objects) = heap_with(12);
            let mut table = LocalTable::new(&heap);
            let token = heap.acquire();

            let mut first_seen: Vec<usize> = Vec::new();
            for &pick in &picks {
                let object = token.resolve(objects[pick]).expect("resolve");
                let index = table.index_of(&token, object);
                let expected = match first_seen.iter().position(|&p| p == pick) {
                    Some(position) => position + 1,
                    None => {
                        first_seen.push(pick);
                        first_seen.len()
                    }
                };
                prop_assert_eq!(index, Index::new(expected as u32));
            }
            prop_assert_eq!(table.end_index(), Index::new(first_seen.len() as u32 + 1));
        }
    }
}
