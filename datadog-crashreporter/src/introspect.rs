// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime-object introspection capability and the zombie registry.
//!
//! The engine itself knows nothing about any managed runtime's object
//! layout. A host that embeds one (an Objective-C bridge, a scripting VM,
//! a GC'd plugin runtime) registers an [`ObjectIntrospector`] at install
//! time; the report writer then consults it to classify register and
//! stack values and to read fields out of live objects. Without a
//! registered introspector every address classifies as `NotAnObject` and
//! the writer falls back to raw C-string probing.
//!
//! All registration goes through atomic pointer swaps so the fault path
//! can read without locks.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering::SeqCst};

/// What an address turned out to be, per the registered runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    NotAnObject,
    OpaqueClass,
    String,
    Url,
    Date,
    Number,
    Array,
    Dictionary,
    Exception,
    Block,
    TaggedPointer,
    UnknownRuntimeObject,
}

/// One enumerated instance field.
pub struct FieldInfo {
    pub name: [u8; 64],
    pub name_len: usize,
    pub kind: FieldKind,
}

impl FieldInfo {
    pub fn zeroed() -> Self {
        Self {
            name: [0; 64],
            name_len: 0,
            kind: FieldKind::Unknown,
        }
    }

    pub fn name_bytes(&self) -> &[u8] {
        &self.name[..self.name_len.min(self.name.len())]
    }

    /// The single-character type tag recorded alongside scalar fields.
    pub fn type_tag(&self) -> u8 {
        match self.kind {
            FieldKind::Pointer(_) => b'*',
            FieldKind::Int(_) => b'i',
            FieldKind::Uint(_) => b'u',
            FieldKind::Float(_) => b'f',
            FieldKind::Bool(_) => b'B',
            FieldKind::Unknown => b'?',
        }
    }
}

pub enum FieldKind {
    Pointer(usize),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Unknown,
}

/// Capability interface to a managed runtime's object model.
///
/// Every method is invoked on the faulting thread, possibly inside a
/// signal handler with peers suspended, so implementations must not
/// allocate, lock, or fault: address validation should lean on
/// [`crate::memory`].
pub trait ObjectIntrospector: Sync + Send {
    fn classify(&self, address: usize) -> ObjectClass;

    /// Copies the object's class name into `buf`, returning its length
    /// (0 when unknown).
    fn class_name(&self, address: usize, buf: &mut [u8]) -> usize;

    /// Copies string contents (String/Url classifications) into `buf`,
    /// returning the byte length.
    fn copy_string(&self, address: usize, buf: &mut [u8]) -> usize;

    /// Numeric payload of a Date object, as seconds.
    fn date_value(&self, address: usize) -> Option<f64>;

    /// Numeric payload of a Number object.
    fn number_value(&self, address: usize) -> Option<f64>;

    /// Address of the first element of an Array object.
    fn array_first_element(&self, address: usize) -> Option<usize>;

    /// Number of enumerable instance fields.
    fn field_count(&self, address: usize) -> usize;

    /// Fills `out` for field `index`; false when unreadable.
    fn field(&self, address: usize, index: usize, out: &mut FieldInfo) -> bool;

    /// Payload bits of a tagged-pointer value.
    fn tagged_payload(&self, address: usize) -> Option<u64> {
        let _ = address;
        None
    }
}

static INTROSPECTOR: AtomicPtr<Box<dyn ObjectIntrospector>> = AtomicPtr::new(ptr::null_mut());

/// Registers the runtime introspector. Replaces any previous one; the old
/// box is leaked deliberately, since the fault path may still hold a
/// reference and a crash engine replaces its introspector at most once or
/// twice per process lifetime.
pub fn install_introspector(introspector: Box<dyn ObjectIntrospector>) {
    let ptr = Box::into_raw(Box::new(introspector));
    INTROSPECTOR.swap(ptr, SeqCst);
}

pub fn introspector() -> Option<&'static dyn ObjectIntrospector> {
    let ptr = INTROSPECTOR.load(SeqCst);
    if ptr.is_null() {
        return None;
    }
    // SAFETY: set only from Box::into_raw above and never freed.
    Some(unsafe { (*ptr).as_ref() })
}

// Class names the writer must not dereference into, recorded name-only.
static DO_NOT_INTROSPECT: AtomicPtr<Vec<String>> = AtomicPtr::new(ptr::null_mut());

/// Installs the do-not-introspect class list. The previous list is leaked
/// for the same reason as the introspector itself.
pub fn set_do_not_introspect_classes(classes: Vec<String>) {
    let ptr = Box::into_raw(Box::new(classes));
    DO_NOT_INTROSPECT.swap(ptr, SeqCst);
}

pub fn should_introspect_class(name: &[u8]) -> bool {
    let ptr = DO_NOT_INTROSPECT.load(SeqCst);
    if ptr.is_null() {
        return true;
    }
    // SAFETY: set only from Box::into_raw above and never freed.
    let list = unsafe { &*ptr };
    !list.iter().any(|c| c.as_bytes() == name)
}

// ---------------------------------------------------------------------------
// Zombie registry: recently-deallocated objects, fed by the host runtime.
// A fixed power-of-two table addressed by pointer hash; collisions simply
// overwrite, which is the right bias for "recently".

const ZOMBIE_CACHE_SIZE: usize = 512;

struct ZombieSlot {
    address: AtomicUsize,
    name: AtomicPtr<String>,
}

static ZOMBIES: [ZombieSlot; ZOMBIE_CACHE_SIZE] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const SLOT: ZombieSlot = ZombieSlot {
        address: AtomicUsize::new(0),
        name: AtomicPtr::new(ptr::null_mut()),
    };
    [SLOT; ZOMBIE_CACHE_SIZE]
};

fn zombie_slot(address: usize) -> &'static ZombieSlot {
    // Low bits are alignment zeros; fold some higher bits in.
    let hash = (address >> 4) ^ (address >> 13);
    &ZOMBIES[hash & (ZOMBIE_CACHE_SIZE - 1)]
}

/// Records that the object at `address` was deallocated. Called by the
/// host runtime's deallocation hook, from any thread.
pub fn note_deallocated(address: usize, class_name: &str) {
    if address == 0 {
        return;
    }
    let slot = zombie_slot(address);
    let name = Box::new(class_name.to_string());
    let old = slot.name.swap(Box::into_raw(name), SeqCst);
    slot.address.store(address, SeqCst);
    if !old.is_null() {
        // SAFETY: only ever set from Box::into_raw above.
        drop(unsafe { Box::from_raw(old) });
    }
}

/// Records that the object at `address` is alive again (reallocation of
/// the same chunk), clearing the zombie entry.
pub fn note_reallocated(address: usize) {
    let slot = zombie_slot(address);
    if slot.address.load(SeqCst) == address {
        slot.address.store(0, SeqCst);
    }
}

/// Copies the former class name of a zombie at `address` into `buf`,
/// returning its length, or 0 when `address` is not a known zombie.
///
/// The name pointer is read without taking ownership. A replacement frees
/// the old name, so this must only run while peers are suspended, which is
/// the only time the capture path consults the registry.
pub fn zombie_class_name(address: usize, buf: &mut [u8]) -> usize {
    if address == 0 {
        return 0;
    }
    let slot = zombie_slot(address);
    if slot.address.load(SeqCst) != address {
        return 0;
    }
    let name = slot.name.load(SeqCst);
    if name.is_null() {
        return 0;
    }
    // SAFETY: see above; the string data stays live for the process.
    let bytes = unsafe { (*name).as_bytes() };
    let len = bytes.len().min(buf.len());
    buf[..len].copy_from_slice(&bytes[..len]);
    len
}

pub fn is_zombie(address: usize) -> bool {
    address != 0 && zombie_slot(address).address.load(SeqCst) == address
}

// The most recent deallocated exception object, surfaced in the report's
// process-state section.
static LAST_EXCEPTION: AtomicPtr<(usize, String, String)> = AtomicPtr::new(ptr::null_mut());

/// Records the most recently deallocated exception object, with its
/// rendered name and reason.
pub fn note_deallocated_exception(address: usize, name: &str, reason: &str) {
    let entry = Box::into_raw(Box::new((address, name.to_string(), reason.to_string())));
    let old = LAST_EXCEPTION.swap(entry, SeqCst);
    if !old.is_null() {
        // SAFETY: only ever set from Box::into_raw above.
        drop(unsafe { Box::from_raw(old) });
    }
}

pub fn last_deallocated_exception() -> Option<&'static (usize, String, String)> {
    let ptr = LAST_EXCEPTION.load(SeqCst);
    if ptr.is_null() {
        return None;
    }
    // SAFETY: swapped-out entries are freed, but the current one lives
    // until replaced; the fault path reads it exactly once.
    Some(unsafe { &*ptr })
}

/// Introspector used when the host registers nothing: no address is a
/// runtime object.
pub struct NullIntrospector;

impl ObjectIntrospector for NullIntrospector {
    fn classify(&self, _address: usize) -> ObjectClass {
        ObjectClass::NotAnObject
    }
    fn class_name(&self, _address: usize, _buf: &mut [u8]) -> usize {
        0
    }
    fn copy_string(&self, _address: usize, _buf: &mut [u8]) -> usize {
        0
    }
    fn date_value(&self, _address: usize) -> Option<f64> {
        None
    }
    fn number_value(&self, _address: usize) -> Option<f64> {
        None
    }
    fn array_first_element(&self, _address: usize) -> Option<usize> {
        None
    }
    fn field_count(&self, _address: usize) -> usize {
        0
    }
    fn field(&self, _address: usize, _index: usize, _out: &mut FieldInfo) -> bool {
        false
    }
}
