//! This module contains a pointer patcher

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use thiserror::Error;

use super::SlotWriter;
use crate::runtime::{ObjRef, ObjectHead};

/// The slot no longer holds the expected occupant
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
#[error("slot changed before the new value could be published")]
pub struct Contended;

/// Writer for slot cells in writable memory.
/// Takes the new reference before the swap and gives the old one back after it.
#[derive(Default)]
pub struct PointerPatcher;
impl PointerPatcher {
    /// Creates a new [`PointerPatcher`]
    pub fn new() -> Self {
        Self::default()
    }
}

unsafe impl SlotWriter for PointerPatcher {
    type Error = Contended;

    unsafe fn publish(
        &self,
        slot: *const AtomicPtr<ObjectHead>,
        expected: *mut ObjectHead,
        value: Option<&ObjRef>,
    ) -> Result<Option<ObjRef>, Self::Error> {
        let new = value.map_or(ptr::null_mut(), |value| value.clone().into_raw());

        // Safety: caller must pass in a live slot cell
        match (*slot).compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire) {
            // Safety: the slot owned the reference to `expected`, which now moves to us
            Ok(previous) => Ok(ObjRef::from_owned(previous)),
            Err(_) => {
                // the reference taken for the slot was never published
                drop(ObjRef::from_owned(new));
                Err(Contended)
            }
        }
    }
}
