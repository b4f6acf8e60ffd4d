//! Type descriptors and their slots

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::RwLock;
use region::Protection;

use super::builtins::builtins;
use super::object::{ObjRef, ObjectHead, IMMORTAL_REFCNT};
use super::registry;

bitflags::bitflags! {
    /// Flags stored in every type descriptor
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct TypeFlags: usize {
        /// The runtime refuses attribute assignment on this type
        const SEALED = 1 << 0;
        /// The descriptor lives in a read-only page
        const READONLY = 1 << 1;
        /// Missing slot tables may be allocated on demand
        const EXTENSIBLE = 1 << 2;
        /// Instances of this type are type descriptors
        const METATYPE = 1 << 3;
    }
}

/// Custom attribute storage of a type
pub type AttrTable = RwLock<BTreeMap<String, ObjRef>>;

/// Slots stored directly in the descriptor
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TypeSlot {
    /// Constructor, called with the type followed by the arguments
    New,
    /// Printable representation
    Repr,
    /// String conversion
    Str,
    /// Call on instances
    Call,
    /// Hash
    Hash,
}

/// Slots stored in the number table
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NumberSlot {
    /// `+`
    Add,
    /// `-`
    Subtract,
    /// `*`
    Multiply,
    /// `/`
    TrueDivide,
    /// Unary `-`
    Negative,
}

impl NumberSlot {
    /// Every number slot, in table order
    pub const ALL: [NumberSlot; 5] = [
        NumberSlot::Add,
        NumberSlot::Subtract,
        NumberSlot::Multiply,
        NumberSlot::TrueDivide,
        NumberSlot::Negative,
    ];

    /// Position of the slot inside [`NumberSlots`]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Operator symbol used in error messages
    pub const fn symbol(self) -> &'static str {
        match self {
            NumberSlot::Add => "+",
            NumberSlot::Subtract => "-",
            NumberSlot::Multiply => "*",
            NumberSlot::TrueDivide => "/",
            NumberSlot::Negative => "unary -",
        }
    }
}

/// Slots stored in the sequence table
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SequenceSlot {
    /// `len()`
    Length,
    /// Subscript
    Item,
    /// `in`
    Contains,
    /// Concatenation
    Concat,
}

impl SequenceSlot {
    /// Every sequence slot, in table order
    pub const ALL: [SequenceSlot; 4] = [
        SequenceSlot::Length,
        SequenceSlot::Item,
        SequenceSlot::Contains,
        SequenceSlot::Concat,
    ];

    /// Position of the slot inside [`SequenceSlots`]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Symbolic id of a native slot
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SlotId {
    /// Slot stored in the descriptor itself
    Type(TypeSlot),
    /// Slot stored in the number table
    Number(NumberSlot),
    /// Slot stored in the sequence table
    Sequence(SequenceSlot),
}

/// Special method names and the native slot each one lives in.
/// `__div__` is kept as an alias of `__truediv__`.
pub const DUNDER_SLOTS: &[(&str, SlotId)] = &[
    ("__repr__", SlotId::Type(TypeSlot::Repr)),
    ("__str__", SlotId::Type(TypeSlot::Str)),
    ("__call__", SlotId::Type(TypeSlot::Call)),
    ("__hash__", SlotId::Type(TypeSlot::Hash)),
    ("__add__", SlotId::Number(NumberSlot::Add)),
    ("__sub__", SlotId::Number(NumberSlot::Subtract)),
    ("__mul__", SlotId::Number(NumberSlot::Multiply)),
    ("__truediv__", SlotId::Number(NumberSlot::TrueDivide)),
    ("__div__", SlotId::Number(NumberSlot::TrueDivide)),
    ("__neg__", SlotId::Number(NumberSlot::Negative)),
    ("__len__", SlotId::Sequence(SequenceSlot::Length)),
    ("__getitem__", SlotId::Sequence(SequenceSlot::Item)),
    ("__contains__", SlotId::Sequence(SequenceSlot::Contains)),
    ("__concat__", SlotId::Sequence(SequenceSlot::Concat)),
];

impl SlotId {
    /// Looks up the slot behind a special method name
    pub fn from_dunder(name: &str) -> Option<SlotId> {
        DUNDER_SLOTS
            .iter()
            .find(|(dunder, _)| *dunder == name)
            .map(|(_, slot)| *slot)
    }

    /// Canonical special method name of the slot
    pub fn dunder(self) -> &'static str {
        match self {
            SlotId::Type(TypeSlot::New) => "__new__",
            _ => DUNDER_SLOTS
                .iter()
                .find(|(_, slot)| *slot == self)
                .map_or("?", |(dunder, _)| dunder),
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dunder())
    }
}

/// Number table. Every entry is a callable object or null.
#[repr(C)]
#[derive(Debug, Default)]
pub struct NumberSlots {
    /// `+`
    pub(crate) add: AtomicPtr<ObjectHead>,
    /// `-`
    pub(crate) subtract: AtomicPtr<ObjectHead>,
    /// `*`
    pub(crate) multiply: AtomicPtr<ObjectHead>,
    /// `/`
    pub(crate) true_divide: AtomicPtr<ObjectHead>,
    /// Unary `-`
    pub(crate) negative: AtomicPtr<ObjectHead>,
}

impl NumberSlots {
    /// Cell holding `slot`
    fn cell(&self, slot: NumberSlot) -> &AtomicPtr<ObjectHead> {
        match slot {
            NumberSlot::Add => &self.add,
            NumberSlot::Subtract => &self.subtract,
            NumberSlot::Multiply => &self.multiply,
            NumberSlot::TrueDivide => &self.true_divide,
            NumberSlot::Negative => &self.negative,
        }
    }
}

/// Sequence table. Every entry is a callable object or null.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SequenceSlots {
    /// `len()`
    pub(crate) length: AtomicPtr<ObjectHead>,
    /// Subscript
    pub(crate) item: AtomicPtr<ObjectHead>,
    /// `in`
    pub(crate) contains: AtomicPtr<ObjectHead>,
    /// Concatenation
    pub(crate) concat: AtomicPtr<ObjectHead>,
}

impl SequenceSlots {
    /// Cell holding `slot`
    fn cell(&self, slot: SequenceSlot) -> &AtomicPtr<ObjectHead> {
        match slot {
            SequenceSlot::Length => &self.length,
            SequenceSlot::Item => &self.item,
            SequenceSlot::Contains => &self.contains,
            SequenceSlot::Concat => &self.concat,
        }
    }
}

/// Type descriptor.
///
/// The field order is mirrored by the offset tables in [`crate::layout`]; changing it here without
/// changing the tables makes the layout probe abort.
#[repr(C)]
pub struct TypeObject {
    /// Common header. Type objects are immortal.
    pub(crate) head: ObjectHead,
    /// Type name
    pub(crate) name: &'static str,
    /// Flags
    pub(crate) flags: TypeFlags,
    /// Parent type, or null for roots
    pub(crate) base: *const TypeObject,
    /// Custom attribute storage, or null when the type has none
    pub(crate) attrs: *const AttrTable,
    /// Constructor
    pub(crate) tp_new: AtomicPtr<ObjectHead>,
    /// Printable representation
    pub(crate) tp_repr: AtomicPtr<ObjectHead>,
    /// String conversion
    pub(crate) tp_str: AtomicPtr<ObjectHead>,
    /// Call on instances
    pub(crate) tp_call: AtomicPtr<ObjectHead>,
    /// Hash
    pub(crate) tp_hash: AtomicPtr<ObjectHead>,
    /// Number table, or null when the type reserves none
    pub(crate) tp_as_number: AtomicPtr<NumberSlots>,
    /// Sequence table, or null when the type reserves none
    pub(crate) tp_as_sequence: AtomicPtr<SequenceSlots>,
}

// SAFETY: descriptors are never freed, and every field that changes after construction is atomic
unsafe impl Send for TypeObject {}
// SAFETY: see above
unsafe impl Sync for TypeObject {}

impl TypeObject {
    /// Type name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Flags
    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    /// Whether the runtime refuses to modify this type
    pub fn is_sealed(&self) -> bool {
        self.flags.contains(TypeFlags::SEALED)
    }

    /// Parent type
    pub fn base(&self) -> Option<&'static TypeObject> {
        // SAFETY: bases are registered descriptors, which are never freed
        unsafe { self.base.as_ref() }
    }

    /// Custom attribute storage
    pub(crate) fn attrs(&self) -> Option<&'static AttrTable> {
        // SAFETY: attribute tables are leaked alongside their descriptor
        unsafe { self.attrs.as_ref() }
    }

    /// Whether the type has custom attribute storage
    pub fn has_attrs(&self) -> bool {
        !self.attrs.is_null()
    }

    /// Address of the descriptor, used as its identity
    pub fn address(&self) -> usize {
        self as *const TypeObject as usize
    }

    /// This type followed by its bases
    pub fn mro(&'static self) -> impl Iterator<Item = &'static TypeObject> {
        std::iter::successors(Some(self), |ty| ty.base())
    }

    /// Whether `other` is this type or one of its bases
    pub fn inherits(&'static self, other: &TypeObject) -> bool {
        self.mro().any(|ty| ptr::eq(ty, other))
    }

    /// The type as an object
    pub fn as_object(&'static self) -> ObjRef {
        ObjRef::from_type(self)
    }

    /// Cell holding `slot`, or `None` when its table is not allocated
    pub(crate) fn slot_cell(&self, slot: SlotId) -> Option<&AtomicPtr<ObjectHead>> {
        match slot {
            SlotId::Type(slot) => Some(match slot {
                TypeSlot::New => &self.tp_new,
                TypeSlot::Repr => &self.tp_repr,
                TypeSlot::Str => &self.tp_str,
                TypeSlot::Call => &self.tp_call,
                TypeSlot::Hash => &self.tp_hash,
            }),
            SlotId::Number(slot) => {
                // SAFETY: tables are never freed once installed
                let table = unsafe { self.tp_as_number.load(Ordering::Acquire).as_ref() }?;
                Some(table.cell(slot))
            }
            SlotId::Sequence(slot) => {
                // SAFETY: tables are never freed once installed
                let table = unsafe { self.tp_as_sequence.load(Ordering::Acquire).as_ref() }?;
                Some(table.cell(slot))
            }
        }
    }

    /// Whether the descriptor reserves storage for `slot`
    pub fn reserves(&self, slot: SlotId) -> bool {
        self.slot_cell(slot).is_some()
    }

    /// Value of `slot` on this type only
    pub fn slot(&self, slot: SlotId) -> Option<ObjRef> {
        // Patches swap occupants under the same lock, so the loaded occupant stays owned by the
        // slot until the new reference is taken
        let _lock = super::lock();
        let cell = self.slot_cell(slot)?;
        // SAFETY: a slot owns a strong reference to its occupant
        unsafe { ObjRef::from_borrowed(cell.load(Ordering::Acquire)) }
    }

    /// Value of `slot` on this type or the nearest base defining it
    pub fn resolve_slot(&'static self, slot: SlotId) -> Option<ObjRef> {
        let _lock = super::lock();
        self.mro().find_map(|ty| ty.slot(slot))
    }
}

impl fmt::Debug for TypeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeObject")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("address", &format_args!("{:#x}", self.address()))
            .finish()
    }
}

/// Storage of a descriptor and the tables it may point at, allocated together
#[repr(C)]
struct TypeStorage {
    /// The descriptor. Must stay the first field.
    ty: TypeObject,
    /// Number table, used when reserved
    number: NumberSlots,
    /// Sequence table, used when reserved
    sequence: SequenceSlots,
}

/// Builds and registers type descriptors.
///
/// Sealed types are written into their own page, which is made read-only once the descriptor is
/// complete.
pub struct TypeBuilder {
    /// Type name
    name: String,
    /// Flags
    flags: TypeFlags,
    /// Explicit parent type
    base: Option<&'static TypeObject>,
    /// Whether a missing base defaults to `object`
    default_base: bool,
    /// Explicit metatype. `None` means `type`.
    meta: Option<&'static TypeObject>,
    /// Initial attributes. `None` means no attribute storage.
    attrs: Option<BTreeMap<String, ObjRef>>,
    /// Initial slot values
    slots: Vec<(SlotId, ObjRef)>,
    /// Whether to reserve a number table
    number: bool,
    /// Whether to reserve a sequence table
    sequence: bool,
}

impl TypeBuilder {
    /// Starts a type deriving from `object`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: TypeFlags::empty(),
            base: None,
            default_base: true,
            meta: None,
            attrs: Some(BTreeMap::new()),
            slots: Vec::new(),
            number: false,
            sequence: false,
        }
    }

    /// Starts a type with no implicit base, used while the builtins are being created
    pub(crate) fn root(name: impl Into<String>) -> Self {
        Self {
            default_base: false,
            ..Self::new(name)
        }
    }

    /// Makes the type's instances type descriptors. The type becomes its own metatype.
    pub(crate) fn metatype(mut self) -> Self {
        self.flags |= TypeFlags::METATYPE;
        self
    }

    /// Sets the metatype explicitly
    pub(crate) fn with_meta(mut self, meta: &'static TypeObject) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Seals the type and places it in read-only memory
    pub fn sealed(mut self) -> Self {
        self.flags |= TypeFlags::SEALED | TypeFlags::READONLY;
        self
    }

    /// Allows slot tables to be allocated when a missing one is patched
    pub fn extensible(mut self) -> Self {
        self.flags |= TypeFlags::EXTENSIBLE;
        self
    }

    /// Sets the parent type
    pub fn base(mut self, base: &'static TypeObject) -> Self {
        self.base = Some(base);
        self
    }

    /// Removes custom attribute storage
    pub fn without_attrs(mut self) -> Self {
        self.attrs = None;
        self
    }

    /// Adds an attribute. Gives the type attribute storage if it had none.
    pub fn attr(mut self, name: impl Into<String>, value: ObjRef) -> Self {
        self.attrs
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value);
        self
    }

    /// Reserves an empty number table
    pub fn number_table(mut self) -> Self {
        self.number = true;
        self
    }

    /// Reserves an empty sequence table
    pub fn sequence_table(mut self) -> Self {
        self.sequence = true;
        self
    }

    /// Sets a native slot, reserving its table if needed
    pub fn slot(mut self, slot: SlotId, value: ObjRef) -> Self {
        match slot {
            SlotId::Number(_) => self.number = true,
            SlotId::Sequence(_) => self.sequence = true,
            SlotId::Type(_) => {}
        }
        self.slots.push((slot, value));
        self
    }

    /// Allocates, fills, protects and registers the descriptor
    pub fn build(self) -> Result<&'static TypeObject, region::Error> {
        let readonly = self.flags.contains(TypeFlags::READONLY);
        let meta: *const TypeObject = match self.meta {
            Some(meta) => meta,
            None if self.flags.contains(TypeFlags::METATYPE) => ptr::null(),
            None => builtins().type_type,
        };
        let base: *const TypeObject = match self.base {
            Some(base) => base,
            None if self.default_base => builtins().object,
            None => ptr::null(),
        };
        let attrs: *const AttrTable = self.attrs.map_or(ptr::null(), |attrs| {
            Box::into_raw(Box::new(RwLock::new(attrs))) as *const AttrTable
        });

        let storage = TypeStorage {
            ty: TypeObject {
                head: ObjectHead::new(meta, IMMORTAL_REFCNT),
                name: Box::leak(self.name.into_boxed_str()),
                flags: self.flags,
                base,
                attrs,
                tp_new: AtomicPtr::default(),
                tp_repr: AtomicPtr::default(),
                tp_str: AtomicPtr::default(),
                tp_call: AtomicPtr::default(),
                tp_hash: AtomicPtr::default(),
                tp_as_number: AtomicPtr::default(),
                tp_as_sequence: AtomicPtr::default(),
            },
            number: NumberSlots::default(),
            sequence: SequenceSlots::default(),
        };

        let storage = if readonly {
            let mut allocation = region::alloc(mem::size_of::<TypeStorage>(), Protection::READ_WRITE)?;
            let ptr = allocation.as_mut_ptr::<TypeStorage>();
            // Descriptors are immortal, the page is never unmapped
            mem::forget(allocation);
            // SAFETY: the allocation is page aligned and large enough for `TypeStorage`
            unsafe { ptr.write(storage) };
            ptr
        } else {
            Box::into_raw(Box::new(storage))
        };

        // SAFETY: `storage` is initialized, writable and not yet shared
        unsafe {
            let ty = ptr::addr_of_mut!((*storage).ty);
            if (*ty).head.ty.is_null() {
                (*ty).head.ty = ty;
            }
            if self.number {
                *(*ty).tp_as_number.get_mut() = ptr::addr_of_mut!((*storage).number);
            }
            if self.sequence {
                *(*ty).tp_as_sequence.get_mut() = ptr::addr_of_mut!((*storage).sequence);
            }
            for (slot, value) in self.slots {
                if let Some(cell) = (*ty).slot_cell(slot) {
                    cell.store(value.into_raw(), Ordering::Release);
                }
            }
            if readonly {
                region::protect(storage, mem::size_of::<TypeStorage>(), Protection::READ)?;
            }

            let ty: &'static TypeObject = &*ty;
            registry::register(ty);
            log::debug!("registered type '{}' at {:#x} ({:?})", ty.name, ty.address(), ty.flags);
            Ok(ty)
        }
    }
}

#[cfg(test)]
mod tests {
    use region::Protection;

    use super::*;
    use crate::runtime::{new_function, new_int};

    #[test]
    /// Sealed descriptors end up in read-only memory
    fn test_sealed_is_readonly() {
        let ty = TypeBuilder::new("ReadOnly").sealed().build().unwrap();
        for region in region::query_range(ty as *const TypeObject, mem::size_of::<TypeObject>()).unwrap() {
            let region = region.unwrap();
            assert_eq!(region.protection(), Protection::READ);
        }
        assert!(ty.is_sealed());
        assert!(ty.flags().contains(TypeFlags::READONLY));
    }

    #[test]
    /// Tables are reserved only when asked for
    fn test_reserved_tables() {
        let plain = TypeBuilder::new("Plain").build().unwrap();
        assert!(plain.reserves(SlotId::Type(TypeSlot::Repr)));
        assert!(!plain.reserves(SlotId::Number(NumberSlot::Add)));
        assert!(!plain.reserves(SlotId::Sequence(SequenceSlot::Length)));

        let add = new_function("Numeric.__add__", |args, _| Ok(args[0].clone()));
        let numeric = TypeBuilder::new("Numeric")
            .slot(SlotId::Number(NumberSlot::Add), add.clone())
            .build()
            .unwrap();
        assert!(numeric.reserves(SlotId::Number(NumberSlot::Subtract)));
        assert!(numeric.slot(SlotId::Number(NumberSlot::Add)).unwrap().is(&add));
        assert!(numeric.slot(SlotId::Number(NumberSlot::Subtract)).is_none());
    }

    #[test]
    /// Slots are inherited through the base chain
    fn test_resolve_slot_inherits() {
        let repr = new_function("Parent.__repr__", |_, _| Ok(new_int(0)));
        let parent = TypeBuilder::new("Parent")
            .slot(SlotId::Type(TypeSlot::Repr), repr.clone())
            .build()
            .unwrap();
        let child = TypeBuilder::new("Child").base(parent).build().unwrap();

        assert!(child.slot(SlotId::Type(TypeSlot::Repr)).is_none());
        assert!(child.resolve_slot(SlotId::Type(TypeSlot::Repr)).unwrap().is(&repr));
        assert!(child.inherits(parent));
        assert!(!parent.inherits(child));
    }

    #[test]
    fn test_dunder_names() {
        assert_eq!(SlotId::from_dunder("__add__"), Some(SlotId::Number(NumberSlot::Add)));
        assert_eq!(SlotId::from_dunder("__div__"), Some(SlotId::Number(NumberSlot::TrueDivide)));
        assert_eq!(SlotId::Number(NumberSlot::TrueDivide).dunder(), "__truediv__");
        assert_eq!(SlotId::from_dunder("__init__"), None);
    }
}
