//! This module contains the entry points that patch registered types

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use log::debug;

use super::mem::{with_writable, PermissionError, PermissionWrapper};
use super::pointer::{Contended, PointerPatcher};
use super::{PatchError, SlotWriter};
use crate::layout::{self, SlotLocation};
use crate::runtime::types::{NumberSlots, SequenceSlots};
use crate::runtime::{self, cache, registry, ObjRef, ObjectHead, SlotId, TypeFlags, TypeObject};

/// A published slot patch.
///
/// Holds the slot's previous occupant. Unlike a drop guard, the patch stays in place when this is
/// dropped; call [`SlotPatch::restore`] to put the previous occupant back.
#[derive(Debug)]
#[must_use = "dropping the patch releases the previous occupant instead of restoring it"]
pub struct SlotPatch {
    /// Patched type
    ty: &'static TypeObject,
    /// Patched slot
    slot: SlotId,
    /// Occupant before the patch
    previous: Option<ObjRef>,
}

impl SlotPatch {
    /// Patched type
    pub fn target(&self) -> &'static TypeObject {
        self.ty
    }

    /// Patched slot
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Occupant before the patch
    pub fn previous(&self) -> Option<&ObjRef> {
        self.previous.as_ref()
    }

    /// Takes the previous occupant
    pub fn into_previous(self) -> Option<ObjRef> {
        self.previous
    }

    /// Re-installs the previous occupant. The returned patch holds the value being removed.
    pub fn restore(self) -> Result<SlotPatch, PatchError> {
        patch_slot(self.ty, self.slot, self.previous.as_ref())
    }
}

/// A published attribute patch
#[derive(Debug)]
#[must_use = "dropping the patch releases the previous value instead of restoring it"]
pub struct AttrPatch {
    /// Patched type
    ty: &'static TypeObject,
    /// Attribute name
    name: String,
    /// Value before the patch
    previous: Option<ObjRef>,
}

impl AttrPatch {
    /// Patched type
    pub fn target(&self) -> &'static TypeObject {
        self.ty
    }

    /// Attribute name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value before the patch
    pub fn previous(&self) -> Option<&ObjRef> {
        self.previous.as_ref()
    }

    /// Takes the previous value
    pub fn into_previous(self) -> Option<ObjRef> {
        self.previous
    }

    /// Re-installs the previous value, removing the attribute if there was none
    pub fn restore(self) -> Result<AttrPatch, PatchError> {
        patch_attr(self.ty, &self.name, self.previous)
    }
}

/// Resolves a raw descriptor pointer against the registry
fn live_type(ty: *const TypeObject) -> Result<&'static TypeObject, PatchError> {
    registry::resolve(ty).ok_or(PatchError::InvalidDescriptor {
        address: ty as usize,
    })
}

/// Error for a slot whose storage the type does not have
fn not_patchable(ty: &TypeObject, slot: SlotId) -> PatchError {
    PatchError::TypeNotPatchable {
        type_name: ty.name(),
        slot: slot.to_string(),
    }
}

/// Finds the sub-table behind `cell`, allocating it for extensible types.
///
/// # Safety
///
/// `cell` must be the table pointer of `ty` for the kind of table `T` is
unsafe fn sub_table<T: Default>(
    ty: &'static TypeObject,
    slot: SlotId,
    cell: *const AtomicPtr<T>,
) -> Result<*mut T, PatchError> {
    let current = (*cell).load(Ordering::Acquire);
    if !current.is_null() {
        return Ok(current);
    }
    if !ty.flags().contains(TypeFlags::EXTENSIBLE) {
        return Err(not_patchable(ty, slot));
    }

    // Tables are never freed once installed
    let table = Box::into_raw(Box::<T>::default());
    let install = || (*cell).compare_exchange(ptr::null_mut(), table, Ordering::AcqRel, Ordering::Acquire);
    let installed = if ty.flags().contains(TypeFlags::READONLY) {
        match with_writable(cell, install) {
            Ok(installed) => installed,
            Err(e) => {
                drop(Box::from_raw(table));
                return Err(e.into());
            }
        }
    } else {
        install()
    };

    match installed {
        Ok(_) => {
            debug!("allocated table for '{}' on '{}' at {:#x}", slot, ty.name(), table as usize);
            Ok(table)
        }
        Err(existing) => {
            drop(Box::from_raw(table));
            Ok(existing)
        }
    }
}

/// Computes the address of `slot`'s cell from the layout tables
fn locate(ty: &'static TypeObject, slot: SlotId) -> Result<*const AtomicPtr<ObjectHead>, PatchError> {
    let base = ty as *const TypeObject as *const u8;
    // Safety: offsets come from the verified layout of `TypeObject`, and `ty` is a live descriptor
    unsafe {
        let (table, offset) = match (slot, layout::type_layout().slot_location(slot)) {
            (_, SlotLocation::Direct(offset)) => return Ok(base.add(offset).cast()),
            (SlotId::Number(_), SlotLocation::Indirect { table, offset }) => {
                let table = sub_table::<NumberSlots>(ty, slot, base.add(table).cast())?;
                (table.cast_const().cast::<u8>(), offset)
            }
            (SlotId::Sequence(_), SlotLocation::Indirect { table, offset }) => {
                let table = sub_table::<SequenceSlots>(ty, slot, base.add(table).cast())?;
                (table.cast_const().cast::<u8>(), offset)
            }
            (SlotId::Type(_), SlotLocation::Indirect { .. }) => return Err(not_patchable(ty, slot)),
        };
        Ok(table.add(offset).cast())
    }
}

/// Publishes `value` into `cell`, lifting page protection for read-only descriptors
///
/// # Safety
///
/// `cell` must be a slot cell of `ty`
unsafe fn publish(
    ty: &'static TypeObject,
    slot: SlotId,
    cell: *const AtomicPtr<ObjectHead>,
    expected: *mut ObjectHead,
    value: Option<&ObjRef>,
) -> Result<Option<ObjRef>, PatchError> {
    let contended = || PatchError::ConcurrentModification {
        type_name: ty.name(),
        slot: slot.to_string(),
    };
    if ty.flags().contains(TypeFlags::READONLY) {
        PermissionWrapper::new(PointerPatcher::new())
            .publish(cell, expected, value)
            .map_err(|e| match e {
                PermissionError::ProtectionError(e) => PatchError::Protection(e),
                PermissionError::CustomError(Contended) => contended(),
            })
    } else {
        PointerPatcher::new()
            .publish(cell, expected, value)
            .map_err(|Contended| contended())
    }
}

/// Writes `value` into `slot` of `ty`, provided the slot still holds `expected`
fn write_slot(
    ty: &'static TypeObject,
    slot: SlotId,
    expected: Option<*mut ObjectHead>,
    value: Option<&ObjRef>,
) -> Result<SlotPatch, PatchError> {
    let cell = locate(ty, slot)?;
    // Safety: `cell` was computed from the layout of a live descriptor
    let expected = expected.unwrap_or_else(|| unsafe { (*cell).load(Ordering::Acquire) });
    let previous = unsafe { publish(ty, slot, cell, expected, value)? };
    cache::invalidate(ty);

    debug!(
        "patched '{}.{}': {:#x} -> {:#x}",
        ty.name(),
        slot,
        expected as usize,
        value.map_or(0, |value| value.as_ptr() as usize)
    );
    Ok(SlotPatch { ty, slot, previous })
}

/// Installs `value` in `slot` of the type at `ty`, bypassing the sealed guard. `None` clears the slot.
///
/// The slot takes a new reference to `value`; the reference it held to the previous occupant moves
/// into the returned [`SlotPatch`]. Missing sub-tables are only allocated for extensible types.
pub fn patch_slot(
    ty: *const TypeObject,
    slot: SlotId,
    value: Option<&ObjRef>,
) -> Result<SlotPatch, PatchError> {
    let _lock = runtime::lock();
    let ty = live_type(ty)?;
    write_slot(ty, slot, None, value)
}

/// Like [`patch_slot`], but fails with [`PatchError::ConcurrentModification`] unless the slot
/// still holds `expected`
pub fn compare_and_patch(
    ty: *const TypeObject,
    slot: SlotId,
    expected: Option<&ObjRef>,
    value: Option<&ObjRef>,
) -> Result<SlotPatch, PatchError> {
    let _lock = runtime::lock();
    let ty = live_type(ty)?;
    let expected = expected.map_or(ptr::null_mut(), ObjRef::as_ptr);
    write_slot(ty, slot, Some(expected), value)
}

/// Sets `name` in the attribute table of the type at `ty`, bypassing the sealed guard. `None`
/// removes the attribute.
pub fn patch_attr(
    ty: *const TypeObject,
    name: &str,
    value: Option<ObjRef>,
) -> Result<AttrPatch, PatchError> {
    let _lock = runtime::lock();
    let ty = live_type(ty)?;
    let attrs = ty.attrs().ok_or_else(|| PatchError::SlotNotSupported {
        type_name: ty.name(),
        slot: name.to_owned(),
    })?;

    let removing = value.is_none();
    let previous = match value {
        Some(value) => attrs.write().insert(name.to_owned(), value),
        None => attrs.write().remove(name),
    };
    cache::invalidate(ty);

    debug!(
        "{} attribute '{}.{}'",
        if removing { "removed" } else { "set" },
        ty.name(),
        name
    );
    Ok(AttrPatch {
        ty,
        name: name.to_owned(),
        previous,
    })
}
