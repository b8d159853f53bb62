use std::{
    collections::HashMap,
    fmt,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use crate::HeapError;

/// Raw object identity.
///
/// Only meaningful while an [`AccessToken`] is held: a collection moves every
/// object, so an address read before [`Heap::collect`] is stale afterwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);

    #[inline(always)]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}", self.0)
    }
}

/// Durable reference to an object.
///
/// A handle is a slot in the heap's handle table. The collector rewrites the
/// slot when it moves the object, so the handle itself never goes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u8 {
        const REFERENCE = 1 << 0;
        const FINAL = 1 << 1;
    }
}

/// Declared field of a class, as reported by the class metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub signature: String,
    pub flags: FieldFlags,
}

impl FieldDescriptor {
    /// `signature` uses JVM descriptor syntax: `I`, `J`, `Lpkg/Name;` or `[...`.
    pub fn new(name: &str, signature: &str) -> Self {
        let mut flags = FieldFlags::empty();
        if signature.starts_with(['L', '[']) {
            flags |= FieldFlags::REFERENCE;
        }
        Self {
            name: name.to_owned(),
            signature: signature.to_owned(),
            flags,
        }
    }

    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.flags |= FieldFlags::FINAL;
        self
    }

    #[inline]
    pub fn is_reference(&self) -> bool {
        self.flags.contains(FieldFlags::REFERENCE)
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        self.flags.contains(FieldFlags::FINAL)
    }

    fn zero(&self) -> Value {
        match self.signature.as_bytes().first() {
            Some(b'J') => Value::Long(0),
            Some(b'L' | b'[') => Value::Ref(Address::NULL),
            _ => Value::Int(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    pub is_array: bool,
}

impl ClassInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            fields: Vec::new(),
            is_array: false,
        }
    }

    /// Array classes expose no declared fields.
    pub fn array(name: &str) -> Self {
        Self {
            is_array: true,
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn field_slot(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Class name without its package, `java/lang/String` -> `String`.
    pub fn simple_name(&self) -> &str {
        match self.name.rfind('/') {
            Some(offset) => &self.name[offset + 1..],
            None => &self.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Ref(Address),
}

impl Value {
    pub fn as_reference(self) -> Option<Address> {
        match self {
            Value::Ref(address) => Some(address),
            _ => None,
        }
    }
}

/// Value written by a mutator. References are passed as handles so mutator
/// code never holds a raw address outside an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    Int(i32),
    Long(i64),
    Ref(Handle),
    Null,
}

/// A place that holds an object reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    Handle(Handle),
    Field { holder: Handle, field: usize },
}

#[derive(Debug, Default)]
pub struct HeapCreateInfo {
    /// first address handed out, must be non-zero
    pub base_address: Option<usize>,
    /// power of two, at least 8
    pub alignment: Option<usize>,
    pub hash_seed: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct HeapSettings {
    base_address: usize,
    alignment: usize,
    hash_seed: u32,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            base_address: 0x1000,
            alignment: 16,
            hash_seed: 0x9e37_79b9,
        }
    }
}

impl HeapSettings {
    fn from_info(info: HeapCreateInfo) -> Self {
        let mut settings = HeapSettings::default();
        info.base_address.inspect(|&val| settings.base_address = val);
        info.alignment.inspect(|&val| settings.alignment = val);
        info.hash_seed.inspect(|&val| settings.hash_seed = val);
        settings
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.base_address == 0 {
            return Err("base_address must be non-zero");
        }
        if self.alignment < 8 || !self.alignment.is_power_of_two() {
            return Err("alignment must be a power of two of at least 8");
        }
        if self.base_address % self.alignment != 0 {
            return Err("base_address must be aligned");
        }
        if self.hash_seed == 0 {
            return Err("hash_seed must be non-zero");
        }
        Ok(())
    }

    fn footprint(&self, fields: usize) -> usize {
        self.alignment * (1 + fields)
    }
}

#[derive(Debug)]
struct Object {
    class: ClassId,
    hash: u32,
    fields: Vec<Value>,
}

#[derive(Debug)]
struct HeapState {
    classes: Vec<ClassInfo>,
    objects: HashMap<Address, Object, ahash::RandomState>,
    next_address: usize,
    hash_state: u32,
}

impl HeapState {
    fn object(&self, address: Address) -> Result<&Object, HeapError> {
        self.objects
            .get(&address)
            .ok_or(HeapError::StaleAddress(address))
    }

    // xorshift32, deterministic per seed
    fn next_hash(&mut self) -> u32 {
        let mut x = self.hash_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.hash_state = x;
        x
    }
}

/// Durable handle slots. A released slot holds `Address::NULL` until reused.
#[derive(Debug, Default)]
struct HandleTable {
    slots: Vec<Address>,
    free: Vec<u32>,
}

impl HandleTable {
    fn insert(&mut self, address: Address) -> Handle {
        if let Some(raw) = self.free.pop() {
            self.slots[raw as usize] = address;
            return Handle(raw);
        }
        self.slots.push(address);
        Handle(self.slots.len() as u32 - 1)
    }

    fn get(&self, handle: Handle) -> Result<Address, HeapError> {
        match self.slots.get(handle.0 as usize) {
            Some(&address) if !address.is_null() => Ok(address),
            _ => Err(HeapError::InvalidHandle(handle)),
        }
    }

    /// `false` if the handle was not live.
    fn release(&mut self, handle: Handle) -> bool {
        match self.slots.get_mut(handle.0 as usize) {
            Some(slot) if !slot.is_null() => {
                *slot = Address::NULL;
                self.free.push(handle.0);
                true
            }
            _ => false,
        }
    }

    fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[derive(Debug)]
pub struct HeapShared {
    settings: HeapSettings,
    state: RwLock<HeapState>,
    // lock order: state before handles
    handles: Mutex<HandleTable>,
    collections: AtomicUsize,
}

/// In-process model of the managed heap the compiler reads from.
///
/// Compiler threads read it under an [`AccessToken`]; mutators and the
/// collector take the lock exclusively.
#[derive(Debug, Clone)]
pub struct Heap(Arc<HeapShared>);

impl Deref for Heap {
    type Target = HeapShared;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Heap {
    pub fn new(info: HeapCreateInfo) -> Result<Self, HeapError> {
        let settings = HeapSettings::from_info(info);
        settings.validate().map_err(HeapError::InvalidSettings)?;

        let state = HeapState {
            classes: Vec::new(),
            objects: HashMap::default(),
            next_address: settings.base_address,
            hash_state: settings.hash_seed,
        };
        Ok(Self(Arc::new(HeapShared {
            settings,
            state: RwLock::new(state),
            handles: Mutex::new(HandleTable::default()),
            collections: AtomicUsize::new(0),
        })))
    }

    pub fn define_class(&self, class: ClassInfo) -> ClassId {
        let mut state = self.state.write();
        let id = ClassId(state.classes.len() as u32);
        state.classes.push(class);
        id
    }

    /// Allocates a zeroed instance of `class` and returns a handle to it.
    pub fn allocate(&self, class: ClassId) -> Handle {
        let mut state = self.state.write();
        let fields: Vec<Value> = state.classes[class.0 as usize]
            .fields
            .iter()
            .map(FieldDescriptor::zero)
            .collect();

        let address = Address(state.next_address);
        state.next_address += self.settings.footprint(fields.len());
        let hash = state.next_hash();
        state.objects.insert(
            address,
            Object {
                class,
                hash,
                fields,
            },
        );

        self.handles.lock().insert(address)
    }

    /// Writes field `field` of the object behind `holder`.
    pub fn store(&self, holder: Handle, field: &str, value: Store) -> Result<(), HeapError> {
        let mut state = self.state.write();
        let handles = self.handles.lock();
        let resolve = |handle: Handle| handles.get(handle);

        let address = resolve(holder)?;
        let new_value = match value {
            Store::Int(v) => Value::Int(v),
            Store::Long(v) => Value::Long(v),
            Store::Ref(target) => Value::Ref(resolve(target)?),
            Store::Null => Value::Ref(Address::NULL),
        };

        let class_id = state.object(address)?.class;
        let class = &state.classes[class_id.0 as usize];
        let slot = class
            .field_slot(field)
            .ok_or_else(|| HeapError::UnknownField {
                class: class.name.clone(),
                field: field.to_owned(),
            })?;
        let descriptor = &class.fields[slot];
        let fits = match new_value {
            Value::Ref(_) => descriptor.is_reference(),
            Value::Long(_) => descriptor.signature == "J",
            Value::Int(_) => !descriptor.is_reference() && descriptor.signature != "J",
        };
        if !fits {
            return Err(HeapError::TypeMismatch {
                field: descriptor.name.clone(),
                signature: descriptor.signature.clone(),
            });
        }

        if let Some(object) = state.objects.get_mut(&address) {
            object.fields[slot] = new_value;
        }
        Ok(())
    }

    /// Blocks while the collector holds the heap.
    ///
    /// A queued collector does not hold back new tokens, so a thread that
    /// already has one can take another without waiting on a collection that
    /// in turn waits on it.
    pub fn acquire(&self) -> AccessToken<'_> {
        AccessToken {
            heap: &self.0,
            state: self.state.read_recursive(),
        }
    }

    pub fn try_acquire(&self) -> Option<AccessToken<'_>> {
        let state = self.state.try_read_recursive()?;
        Some(AccessToken {
            heap: &self.0,
            state,
        })
    }

    /// Moves every object to a fresh address and rewrites all references and
    /// handle slots. Returns the number of objects moved.
    pub fn collect(&self) -> usize {
        let mut guard = self.state.write();
        let mut handles = self.handles.lock();
        let state = &mut *guard;

        let mut live: Vec<Address> = state.objects.keys().copied().collect();
        live.sort_unstable();

        let mut forwarding: HashMap<Address, Address, ahash::RandomState> =
            HashMap::with_capacity_and_hasher(live.len(), Default::default());
        for old in &live {
            let fields = state.objects[old].fields.len();
            let new = Address(state.next_address);
            state.next_address += self.settings.footprint(fields);
            forwarding.insert(*old, new);
        }

        let forward = |address: &mut Address| {
            if let Some(&new) = forwarding.get(address) {
                *address = new;
            }
        };

        let mut moved: HashMap<Address, Object, ahash::RandomState> =
            HashMap::with_capacity_and_hasher(live.len(), Default::default());
        for (mut address, mut object) in state.objects.drain() {
            for value in &mut object.fields {
                if let Value::Ref(target) = value {
                    forward(target);
                }
            }
            forward(&mut address);
            moved.insert(address, object);
        }
        state.objects = moved;
        handles.slots.iter_mut().for_each(forward);

        let count = self.collections.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("collection {count}: relocated {} objects", live.len());
        live.len()
    }

    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Number of live handles.
    pub fn handle_count(&self) -> usize {
        self.handles.lock().live()
    }

    /// Gives back handles, their slots get reused. Unknown or already
    /// released handles are skipped. Returns the number released.
    pub fn release_handles(&self, handles: impl IntoIterator<Item = Handle>) -> usize {
        let mut table = self.handles.lock();
        handles
            .into_iter()
            .filter(|&handle| table.release(handle))
            .count()
    }

    #[cfg(test)]
    pub(crate) fn lock_exclusive(&self) -> impl Sized + '_ {
        self.state.write()
    }

    pub(crate) fn same_heap(&self, other: &HeapShared) -> bool {
        std::ptr::eq(&*self.0, other)
    }
}

/// Heap-access token.
///
/// While one is alive the collector cannot run, so raw addresses obtained
/// through it stay valid. Every operation that reads object state lives here.
pub struct AccessToken<'h> {
    heap: &'h HeapShared,
    state: RwLockReadGuard<'h, HeapState>,
}

impl fmt::Debug for AccessToken<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("heap", &(self.heap as *const HeapShared))
            .finish()
    }
}

impl<'h> AccessToken<'h> {
    pub(crate) fn heap(&self) -> &'h HeapShared {
        self.heap
    }

    pub fn is_live(&self, address: Address) -> bool {
        self.state.objects.contains_key(&address)
    }

    pub fn resolve(&self, handle: Handle) -> Result<Address, HeapError> {
        self.heap.handles.lock().get(handle)
    }

    /// Creates a durable handle for a live object.
    pub fn new_handle(&self, address: Address) -> Result<Handle, HeapError> {
        if !self.is_live(address) {
            return Err(HeapError::StaleAddress(address));
        }
        Ok(self.heap.handles.lock().insert(address))
    }

    /// Reads the reference currently stored at `location`.
    pub fn read(&self, location: &Location) -> Result<Address, HeapError> {
        match *location {
            Location::Handle(handle) => self.resolve(handle),
            Location::Field { holder, field } => {
                let address = self.resolve(holder)?;
                self.field_at(address, field)?
                    .as_reference()
                    .ok_or(HeapError::NotAReference(*location))
            }
        }
    }

    pub fn class_of(&self, address: Address) -> Result<&ClassInfo, HeapError> {
        let object = self.state.object(address)?;
        Ok(&self.state.classes[object.class.0 as usize])
    }

    /// Identity hash, stable across relocation.
    pub fn hash_code(&self, address: Address) -> Result<u32, HeapError> {
        Ok(self.state.object(address)?.hash)
    }

    pub fn field_at(&self, address: Address, slot: usize) -> Result<Value, HeapError> {
        self.state
            .object(address)?
            .fields
            .get(slot)
            .copied()
            .ok_or(HeapError::FieldOutOfRange { address, slot })
    }

    pub fn field(&self, address: Address, name: &str) -> Result<Value, HeapError> {
        let class = self.class_of(address)?;
        let slot = class
            .field_slot(name)
            .ok_or_else(|| HeapError::UnknownField {
                class: class.name.clone(),
                field: name.to_owned(),
            })?;
        self.field_at(address, slot)
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    fn node_class(heap: &Heap) -> ClassId {
        heap.define_class(
            ClassInfo::new("knot/test/Node")
                .field(FieldDescriptor::new("next", "Lknot/test/Node;").immutable())
                .field(FieldDescriptor::new("label", "I"))
                .field(FieldDescriptor::new("stamp", "J")),
        )
    }

    #[test]
    fn settings_are_validated() {
        let err = Heap::new(HeapCreateInfo {
            alignment: Some(12),
            ..Default::default()
        })
        .expect_err("alignment 12 is not a power of two");
        assert!(matches!(err, HeapError::InvalidSettings(_)));

        assert!(
            Heap::new(HeapCreateInfo {
                base_address: Some(0),
                ..Default::default()
            })
            .is_err()
        );
    }

    #[test]
    fn descriptors_classify_signatures() {
        let field = FieldDescriptor::new("f", "Ljava/lang/Object;");
        assert!(field.is_reference());
        assert!(!field.is_final());
        assert!(field.immutable().is_final());
        assert!(FieldDescriptor::new("a", "[I").is_reference());
        assert!(!FieldDescriptor::new("i", "I").is_reference());
        assert_eq!(ClassInfo::new("java/lang/String").simple_name(), "String");
        assert_eq!(ClassInfo::new("Bare").simple_name(), "Bare");
    }

    #[test]
    fn allocation_zeroes_fields() {
        let heap = Heap::new(HeapCreateInfo::default()).expect("heap");
        let node = node_class(&heap);
        let a = heap.allocate(node);

        let token = heap.acquire();
        let address = token.resolve(a).expect("resolve");
        assert!(!address.is_null());
        assert_eq!(token.field(address, "next").expect("next"), Value::Ref(Address::NULL));
        assert_eq!(token.field(address, "label").expect("label"), Value::Int(0));
        assert_eq!(token.field(address, "stamp").expect("stamp"), Value::Long(0));
        assert_eq!(token.class_of(address).expect("class").name, "knot/test/Node");
    }

    #[test]
    fn stores_are_type_checked() {
        let heap = Heap::new(HeapCreateInfo::default()).expect("heap");
        let node = node_class(&heap);
        let a = heap.allocate(node);
        let b = heap.allocate(node);

        heap.store(a, "next", Store::Ref(b)).expect("ref store");
        heap.store(a, "label", Store::Int(5)).expect("int store");
        assert!(matches!(
            heap.store(a, "label", Store::Ref(b)),
            Err(HeapError::TypeMismatch { .. })
        ));
        assert!(matches!(
            heap.store(a, "missing", Store::Null),
            Err(HeapError::UnknownField { .. })
        ));

        let token = heap.acquire();
        let location = Location::Field {
            holder: a,
            field: 0,
        };
        assert_eq!(token.read(&location).expect("read"), token.resolve(b).expect("b"));
        let label = Location::Field {
            holder: a,
            field: 1,
        };
        assert!(matches!(token.read(&label), Err(HeapError::NotAReference(_))));
    }

    #[test]
    fn collection_moves_objects_but_not_handles() {
        let heap = Heap::new(HeapCreateInfo::default()).expect("heap");
        let node = node_class(&heap);
        let a = heap.allocate(node);
        let b = heap.allocate(node);
        heap.store(a, "next", Store::Ref(b)).expect("store");

        let (old_a, hash_a) = {
            let token = heap.acquire();
            let address = token.resolve(a).expect("a");
            (address, token.hash_code(address).expect("hash"))
        };

        assert_eq!(heap.collect(), 2);
        assert_eq!(heap.collections(), 1);

        let token = heap.acquire();
        let new_a = token.resolve(a).expect("a");
        assert_ne!(old_a, new_a, "object must have moved");
        assert!(!token.is_live(old_a), "old address is stale");
        assert_eq!(token.hash_code(new_a).expect("hash"), hash_a);
        assert_eq!(
            token.field(new_a, "next").expect("next"),
            Value::Ref(token.resolve(b).expect("b")),
            "references are forwarded"
        );
    }

    #[test]
    fn try_acquire_fails_while_collector_holds_the_heap() {
        let heap = Heap::new(HeapCreateInfo::default()).expect("heap");
        let exclusive = heap.state.write();
        assert!(heap.try_acquire().is_none());
        drop(exclusive);
        assert!(heap.try_acquire().is_some());
    }

    #[test]
    fn released_handles_are_invalid_and_reused() {
        let heap = Heap::new(HeapCreateInfo::default()).expect("heap");
        let node = node_class(&heap);
        let a = heap.allocate(node);
        let extra = {
            let token = heap.acquire();
            let address = token.resolve(a).expect("a");
            token.new_handle(address).expect("handle")
        };
        assert_eq!(heap.handle_count(), 2);

        assert_eq!(heap.release_handles([extra, extra]), 1, "second release is a no-op");
        assert_eq!(heap.handle_count(), 1);
        assert!(matches!(
            heap.acquire().resolve(extra),
            Err(HeapError::InvalidHandle(_))
        ));

        heap.collect();
        let token = heap.acquire();
        let address = token.resolve(a).expect("a");
        let reused = token.new_handle(address).expect("handle");
        assert_eq!(reused, extra, "released slot is handed out again");
        assert_eq!(token.resolve(reused).expect("reused"), address);
    }

    #[test]
    fn queued_collector_does_not_block_a_second_token() {
        let heap = Heap::new(HeapCreateInfo::default()).expect("heap");
        let a = heap.allocate(node_class(&heap));

        let outer = heap.acquire();
        let collector = {
            let heap = heap.clone();
            thread::spawn(move || heap.collect())
        };
        // let the collector queue up behind the outer token
        thread::sleep(Duration::from_millis(50));

        let inner = heap.acquire();
        assert_eq!(inner.resolve(a).expect("a"), outer.resolve(a).expect("a"));
        assert!(heap.try_acquire().is_some());
        drop(inner);
        drop(outer);
        assert_eq!(collector.join().expect("collector"), 1);
    }

    #[test]
    fn handles_for_dead_addresses_are_refused() {
        let heap = Heap::new(HeapCreateInfo::default()).expect("heap");
        let token = heap.acquire();
        assert!(matches!(
            token.new_handle(Address::from_raw(0x10)),
            Err(HeapError::StaleAddress(_))
        ));
        assert!(matches!(
            token.resolve(Handle::from_raw(99)),
            Err(HeapError::InvalidHandle(_))
        ));
    }
}
