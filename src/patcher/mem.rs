//! This module contains a writer which adjusts memory permissions to patch read-only descriptors

use std::mem;
use std::sync::atomic::AtomicPtr;

use region::Protection;
use thiserror::Error;

use super::pointer::Contended;
use super::SlotWriter;
use crate::runtime::{ObjRef, ObjectHead};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("Error setting memory protections")]
    ProtectionError(#[from] region::Error),
    /// Custom error type from the underlying writer
    #[error("{0}")]
    CustomError(E),
}
impl From<Contended> for PermissionError<Contended> {
    fn from(e: Contended) -> Self {
        Self::CustomError(e)
    }
}

/// This struct wraps writers to allow them to write to descriptors in read-only pages.
/// It changes the permissions of the slot's page, triggers the write, and then reverts the
/// permissions before returning.
///
/// # Safety
///
/// `PermissionWrapper` only unprotects the pages covering the slot cell itself. Pairing it with a
/// writer that touches memory outside the cell is undefined behavior.
pub struct PermissionWrapper<W: SlotWriter> {
    /// Underlying writer.
    writer: W,
}
impl<W: SlotWriter> PermissionWrapper<W> {
    /// Creates a new PermissionWrapper
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

/// Runs `f` with the pages covering `location` made writable, restoring their protection afterwards.
///
/// # Safety
///
/// `location` must be mapped, and `f` must not write outside of the `T` at `location`
pub unsafe fn with_writable<T, R>(location: *const T, f: impl FnOnce() -> R) -> Result<R, region::Error> {
    let _guard = region::protect_with_handle(location, mem::size_of::<T>(), Protection::READ_WRITE)?;
    Ok(f())
}

unsafe impl<W> SlotWriter for PermissionWrapper<W>
where
    W: SlotWriter,
    PermissionError<W::Error>: From<W::Error>,
{
    type Error = PermissionError<W::Error>;

    unsafe fn publish(
        &self,
        slot: *const AtomicPtr<ObjectHead>,
        expected: *mut ObjectHead,
        value: Option<&ObjRef>,
    ) -> Result<Option<ObjRef>, Self::Error> {
        with_writable(slot, || self.writer.publish(slot, expected, value))?.map_err(Into::into)
    }
}
