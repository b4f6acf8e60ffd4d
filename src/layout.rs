//! # Layout
//!
//! This module covers the layout probe, which pins down the byte layout of object headers and type
//! descriptors for the running build.
//!
//! Every supported configuration is one [`LayoutVariant`] with a fixed offset table. The probe picks
//! the variant from the target and the `trace-refs` feature, then checks each table entry against
//! the compiled structures. A table that disagrees with the compiler is never used: the process
//! aborts instead, since every later patch would write to the wrong address.

use std::mem::{offset_of, size_of};

use lazy_static::lazy_static;
use log::info;
use thiserror::Error;

use crate::runtime::types::{
    NumberSlot, NumberSlots, SequenceSlot, SequenceSlots, SlotId, TypeObject, TypeSlot,
};
use crate::runtime::{fatal, ObjectHead};

#[cfg(not(any(target_pointer_width = "32", target_pointer_width = "64")))]
compile_error!("object header layout is only known for 32-bit and 64-bit targets");

/// Errors when resolving the layout
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// A table entry disagrees with the compiled structures
    #[error("layout {variant:?} unresolvable: {field} expected at {expected}, compiled at {actual}")]
    Unresolvable {
        /// Variant that was selected
        variant: LayoutVariant,
        /// Field that disagreed
        field: &'static str,
        /// Offset or size from the table
        expected: usize,
        /// Offset or size from the compiler
        actual: usize,
    },
    /// The header size a caller expects is not the one in effect
    #[error("object header is {actual} bytes, caller expected {expected}")]
    HeaderMismatch {
        /// Size the caller was built against
        expected: usize,
        /// Size of the running build
        actual: usize,
    },
}

/// Known header layouts
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LayoutVariant {
    /// Plain header on 32-bit targets
    Standard32,
    /// Plain header on 64-bit targets
    Standard64,
    /// Instrumented header on 32-bit targets
    TraceRefs32,
    /// Instrumented header on 64-bit targets
    TraceRefs64,
}

impl LayoutVariant {
    /// Every variant
    pub const ALL: [LayoutVariant; 4] = [
        LayoutVariant::Standard32,
        LayoutVariant::Standard64,
        LayoutVariant::TraceRefs32,
        LayoutVariant::TraceRefs64,
    ];

    /// Variant of the running build
    pub const fn current() -> Self {
        match (
            cfg!(feature = "trace-refs"),
            cfg!(target_pointer_width = "64"),
        ) {
            (false, false) => LayoutVariant::Standard32,
            (false, true) => LayoutVariant::Standard64,
            (true, false) => LayoutVariant::TraceRefs32,
            (true, true) => LayoutVariant::TraceRefs64,
        }
    }

    /// Header table of this variant
    pub const fn header(self) -> HeaderLayout {
        match self {
            LayoutVariant::Standard32 => STANDARD_32,
            LayoutVariant::Standard64 => STANDARD_64,
            LayoutVariant::TraceRefs32 => TRACE_REFS_32,
            LayoutVariant::TraceRefs64 => TRACE_REFS_64,
        }
    }
}

/// Byte layout of the object header
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeaderLayout {
    /// Variant this table describes
    pub variant: LayoutVariant,
    /// Pointer width in bytes
    pub word: usize,
    /// Bytes taken by the diagnostic fields in front of the count
    pub extra_size: usize,
    /// Total header size
    pub size: usize,
    /// Offset of the reference count
    pub refcnt_offset: usize,
    /// Offset of the type pointer
    pub type_offset: usize,
}

impl HeaderLayout {
    /// Header of `word`-byte pointers preceded by `extra_words` diagnostic words
    const fn new(variant: LayoutVariant, word: usize, extra_words: usize) -> Self {
        let extra_size = extra_words * word;
        Self {
            variant,
            word,
            extra_size,
            size: extra_size + 2 * word,
            refcnt_offset: extra_size,
            type_offset: extra_size + word,
        }
    }
}

/// Header of release builds on 32-bit targets
pub const STANDARD_32: HeaderLayout = HeaderLayout::new(LayoutVariant::Standard32, 4, 0);
/// Header of release builds on 64-bit targets
pub const STANDARD_64: HeaderLayout = HeaderLayout::new(LayoutVariant::Standard64, 8, 0);
/// Header of instrumented builds on 32-bit targets
pub const TRACE_REFS_32: HeaderLayout = HeaderLayout::new(LayoutVariant::TraceRefs32, 4, 2);
/// Header of instrumented builds on 64-bit targets
pub const TRACE_REFS_64: HeaderLayout = HeaderLayout::new(LayoutVariant::TraceRefs64, 8, 2);

/// Fields of a type descriptor, in storage order
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TypeField {
    /// Name, two words
    Name,
    /// Flags
    Flags,
    /// Parent type
    Base,
    /// Attribute table
    Attrs,
    /// Constructor slot
    New,
    /// Repr slot
    Repr,
    /// Str slot
    Str,
    /// Call slot
    Call,
    /// Hash slot
    Hash,
    /// Number table pointer
    NumberTable,
    /// Sequence table pointer
    SequenceTable,
}

impl TypeField {
    /// Every field
    pub const ALL: [TypeField; 11] = [
        TypeField::Name,
        TypeField::Flags,
        TypeField::Base,
        TypeField::Attrs,
        TypeField::New,
        TypeField::Repr,
        TypeField::Str,
        TypeField::Call,
        TypeField::Hash,
        TypeField::NumberTable,
        TypeField::SequenceTable,
    ];

    /// Words between the end of the header and the field
    const fn word_index(self) -> usize {
        match self {
            TypeField::Name => 0,
            TypeField::Flags => 2,
            TypeField::Base => 3,
            TypeField::Attrs => 4,
            TypeField::New => 5,
            TypeField::Repr => 6,
            TypeField::Str => 7,
            TypeField::Call => 8,
            TypeField::Hash => 9,
            TypeField::NumberTable => 10,
            TypeField::SequenceTable => 11,
        }
    }

    /// Descriptor field holding a direct slot
    pub const fn of_slot(slot: TypeSlot) -> Self {
        match slot {
            TypeSlot::New => TypeField::New,
            TypeSlot::Repr => TypeField::Repr,
            TypeSlot::Str => TypeField::Str,
            TypeSlot::Call => TypeField::Call,
            TypeSlot::Hash => TypeField::Hash,
        }
    }
}

/// Words in a descriptor after the header
const TYPE_WORDS: usize = 12;

/// Where a slot lives
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotLocation {
    /// Directly in the descriptor, at this offset
    Direct(usize),
    /// In a sub-table whose pointer is at `table`; the slot is at `offset` inside the table
    Indirect {
        /// Offset of the table pointer in the descriptor
        table: usize,
        /// Offset of the slot in the table
        offset: usize,
    },
}

/// Byte layout of a type descriptor
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TypeLayout {
    /// Header the descriptor starts with
    pub header: HeaderLayout,
}

impl TypeLayout {
    /// Descriptor layout for a header layout
    pub const fn new(header: HeaderLayout) -> Self {
        Self { header }
    }

    /// Offset of `field` from the start of the descriptor
    pub const fn field_offset(&self, field: TypeField) -> usize {
        self.header.size + field.word_index() * self.header.word
    }

    /// Size of the descriptor
    pub const fn size(&self) -> usize {
        self.header.size + TYPE_WORDS * self.header.word
    }

    /// Location of `slot`
    pub const fn slot_location(&self, slot: SlotId) -> SlotLocation {
        match slot {
            SlotId::Type(slot) => SlotLocation::Direct(self.field_offset(TypeField::of_slot(slot))),
            SlotId::Number(slot) => SlotLocation::Indirect {
                table: self.field_offset(TypeField::NumberTable),
                offset: slot.index() * self.header.word,
            },
            SlotId::Sequence(slot) => SlotLocation::Indirect {
                table: self.field_offset(TypeField::SequenceTable),
                offset: slot.index() * self.header.word,
            },
        }
    }
}

/// Compiled offset of `field`
fn compiled_field_offset(field: TypeField) -> usize {
    match field {
        TypeField::Name => offset_of!(TypeObject, name),
        TypeField::Flags => offset_of!(TypeObject, flags),
        TypeField::Base => offset_of!(TypeObject, base),
        TypeField::Attrs => offset_of!(TypeObject, attrs),
        TypeField::New => offset_of!(TypeObject, tp_new),
        TypeField::Repr => offset_of!(TypeObject, tp_repr),
        TypeField::Str => offset_of!(TypeObject, tp_str),
        TypeField::Call => offset_of!(TypeObject, tp_call),
        TypeField::Hash => offset_of!(TypeObject, tp_hash),
        TypeField::NumberTable => offset_of!(TypeObject, tp_as_number),
        TypeField::SequenceTable => offset_of!(TypeObject, tp_as_sequence),
    }
}

/// Compiled offset of a number slot inside its table
fn compiled_number_offset(slot: NumberSlot) -> usize {
    match slot {
        NumberSlot::Add => offset_of!(NumberSlots, add),
        NumberSlot::Subtract => offset_of!(NumberSlots, subtract),
        NumberSlot::Multiply => offset_of!(NumberSlots, multiply),
        NumberSlot::TrueDivide => offset_of!(NumberSlots, true_divide),
        NumberSlot::Negative => offset_of!(NumberSlots, negative),
    }
}

/// Compiled offset of a sequence slot inside its table
fn compiled_sequence_offset(slot: SequenceSlot) -> usize {
    match slot {
        SequenceSlot::Length => offset_of!(SequenceSlots, length),
        SequenceSlot::Item => offset_of!(SequenceSlots, item),
        SequenceSlot::Contains => offset_of!(SequenceSlots, contains),
        SequenceSlot::Concat => offset_of!(SequenceSlots, concat),
    }
}

/// Checks one table entry against the compiler
fn check(
    variant: LayoutVariant,
    field: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), LayoutError> {
    if expected == actual {
        Ok(())
    } else {
        Err(LayoutError::Unresolvable {
            variant,
            field,
            expected,
            actual,
        })
    }
}

/// Checks every entry of `layout` against the compiled structures
pub fn verify(layout: &TypeLayout) -> Result<(), LayoutError> {
    let header = &layout.header;
    let variant = header.variant;
    check(variant, "header size", header.size, size_of::<ObjectHead>())?;
    check(variant, "reference count", header.refcnt_offset, offset_of!(ObjectHead, refcnt))?;
    check(variant, "type pointer", header.type_offset, offset_of!(ObjectHead, ty))?;
    check(variant, "word size", header.word, size_of::<usize>())?;
    check(variant, "descriptor size", layout.size(), size_of::<TypeObject>())?;

    for field in TypeField::ALL {
        check(variant, "descriptor field", layout.field_offset(field), compiled_field_offset(field))?;
    }
    for slot in NumberSlot::ALL {
        match layout.slot_location(SlotId::Number(slot)) {
            SlotLocation::Indirect { offset, .. } => {
                check(variant, "number slot", offset, compiled_number_offset(slot))?
            }
            SlotLocation::Direct(offset) => check(variant, "number slot", offset, usize::MAX)?,
        }
    }
    for slot in SequenceSlot::ALL {
        match layout.slot_location(SlotId::Sequence(slot)) {
            SlotLocation::Indirect { offset, .. } => {
                check(variant, "sequence slot", offset, compiled_sequence_offset(slot))?
            }
            SlotLocation::Direct(offset) => check(variant, "sequence slot", offset, usize::MAX)?,
        }
    }
    Ok(())
}

/// Selects and verifies the layout of the running build
pub fn resolve() -> Result<TypeLayout, LayoutError> {
    let layout = TypeLayout::new(LayoutVariant::current().header());
    verify(&layout)?;
    Ok(layout)
}

lazy_static! {
    /// Layout of the running build, resolved once
    static ref TYPE_LAYOUT: TypeLayout = match resolve() {
        Ok(layout) => {
            info!(
                "object layout {:?}: header {} bytes, descriptor {} bytes",
                layout.header.variant,
                layout.header.size,
                layout.size()
            );
            layout
        }
        Err(e) => fatal(format_args!("refusing to patch with an unknown object layout: {e}")),
    };
}

/// Descriptor layout of the running build
pub fn type_layout() -> &'static TypeLayout {
    &TYPE_LAYOUT
}

/// Header layout of the running build
pub fn header_layout() -> &'static HeaderLayout {
    &TYPE_LAYOUT.header
}

/// Size in bytes of the object header of the running build
pub fn probe_header_size() -> usize {
    header_layout().size
}

/// Compares the running header size with the one a caller was built against
pub fn verify_header_size(expected: usize) -> Result<usize, LayoutError> {
    let actual = probe_header_size();
    if actual == expected {
        Ok(actual)
    } else {
        Err(LayoutError::HeaderMismatch { expected, actual })
    }
}

/// Like [`verify_header_size`], but aborts the process on mismatch
pub fn require_header_size(expected: usize) -> usize {
    match verify_header_size(expected) {
        Ok(size) => size,
        Err(e) => fatal(format_args!("incompatible object layout: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    /// The probe answers the same thing every time, from every thread
    fn test_probe_idempotent() {
        crate::init_logging();
        let first = probe_header_size();
        for _ in 0..16 {
            assert_eq!(probe_header_size(), first);
        }
        let sizes: Vec<usize> = (0..4)
            .map(|_| thread::spawn(probe_header_size))
            .map(|handle| handle.join().unwrap())
            .collect();
        assert!(sizes.iter().all(|size| *size == first));
        assert_eq!(first, size_of::<ObjectHead>());
        assert_eq!(first, LayoutVariant::current().header().size);
    }

    #[test]
    #[cfg(all(target_pointer_width = "64", not(feature = "trace-refs")))]
    fn test_standard_64() {
        assert_eq!(LayoutVariant::current(), LayoutVariant::Standard64);
        assert_eq!(probe_header_size(), 16);
        assert_eq!(type_layout().size(), 16 + 12 * 8);
    }

    #[test]
    #[cfg(all(target_pointer_width = "64", feature = "trace-refs"))]
    fn test_trace_refs_64() {
        assert_eq!(LayoutVariant::current(), LayoutVariant::TraceRefs64);
        assert_eq!(probe_header_size(), 32);
        assert_eq!(header_layout().refcnt_offset, 16);
    }

    #[test]
    /// Tables of the other variants disagree with this build and are rejected
    fn test_other_variants_rejected() {
        for variant in LayoutVariant::ALL {
            let result = verify(&TypeLayout::new(variant.header()));
            if variant == LayoutVariant::current() {
                assert_eq!(result, Ok(()));
            } else {
                assert!(matches!(result, Err(LayoutError::Unresolvable { .. })));
            }
        }
    }

    #[test]
    fn test_slot_locations() {
        let layout = TypeLayout::new(STANDARD_64);
        assert_eq!(
            layout.slot_location(SlotId::Type(TypeSlot::Repr)),
            SlotLocation::Direct(16 + 6 * 8)
        );
        assert_eq!(
            layout.slot_location(SlotId::Number(NumberSlot::Multiply)),
            SlotLocation::Indirect {
                table: 16 + 10 * 8,
                offset: 16
            }
        );
        assert_eq!(TRACE_REFS_32.size, 16);
        assert_eq!(TRACE_REFS_32.type_offset, 12);
    }

    #[test]
    fn test_header_mismatch() {
        let actual = probe_header_size();
        assert_eq!(verify_header_size(actual), Ok(actual));
        assert_eq!(
            verify_header_size(actual + 1),
            Err(LayoutError::HeaderMismatch {
                expected: actual + 1,
                actual
            })
        );
        assert_eq!(require_header_size(actual), actual);
    }
}
