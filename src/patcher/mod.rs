//! # Patch
//!
//! This module covers the slot patcher, which publishes new values into type descriptors behind the
//! runtime's back.
//!
//! Writers are layered the same way for every slot: [`pointer::PointerPatcher`] performs the
//! reference-counted compare-and-swap, and [`mem::PermissionWrapper`] lifts the page protection of
//! read-only descriptors around it. [`patch_slot`] and [`patch_attr`] tie them to the layout probe,
//! the type registry and the dispatch cache.

use std::sync::atomic::AtomicPtr;

use thiserror::Error;

use crate::runtime::{ObjRef, ObjectHead};

pub mod mem;
pub mod pointer;
mod slot;

pub use slot::{compare_and_patch, patch_attr, patch_slot, AttrPatch, SlotPatch};

/// Errors when patching a type
#[derive(Debug, Error)]
pub enum PatchError {
    /// The pointer does not reference a registered type
    #[error("InvalidDescriptor: no live type at {address:#x}")]
    InvalidDescriptor {
        /// Address that was passed in
        address: usize,
    },
    /// The slot lives in a table the type does not have, and the type may not grow one
    #[error("TypeNotPatchable: '{type_name}' has no storage for '{slot}'")]
    TypeNotPatchable {
        /// Type that was targeted
        type_name: &'static str,
        /// Slot that was requested
        slot: String,
    },
    /// The type has no custom attribute storage
    #[error("SlotNotSupported: '{type_name}' cannot hold '{slot}'")]
    SlotNotSupported {
        /// Type that was targeted
        type_name: &'static str,
        /// Attribute that was requested
        slot: String,
    },
    /// The slot changed between reading it and publishing the new value
    #[error("ConcurrentModification: '{type_name}.{slot}' changed during the patch")]
    ConcurrentModification {
        /// Type that was targeted
        type_name: &'static str,
        /// Slot that was requested
        slot: String,
    },
    /// The protection of the descriptor's page could not be changed
    #[error("Error setting memory protections")]
    Protection(#[from] region::Error),
}

/// Writers publish a new occupant into a slot cell and hand back the previous one
///
/// # Safety
///
/// Writers are inherently unsafe. The implementor must publish with a single atomic store so that
/// readers never observe a partially written slot, and must keep the slot's ownership of its
/// occupant intact: exactly one strong reference moves in, exactly one moves out.
pub unsafe trait SlotWriter {
    /// Error type that can occur when publishing
    type Error;

    /// Replaces the occupant of `slot`, provided it still is `expected`.
    ///
    /// On success, the slot owns a new reference to `value` and the reference it held to
    /// `expected` is returned to the caller.
    ///
    /// # Safety
    ///
    /// `slot` must point to a live slot cell, and `expected` must be null or an object the slot
    /// owns a reference to
    unsafe fn publish(
        &self,
        slot: *const AtomicPtr<ObjectHead>,
        expected: *mut ObjectHead,
        value: Option<&ObjRef>,
    ) -> Result<Option<ObjRef>, Self::Error>;
}
