//! # Runtime
//!
//! This module covers the managed runtime whose sealed types the patcher writes into.
//!
//! Objects are reference counted and share a `#[repr(C)]` [`ObjectHead`] prefix. Type descriptors
//! ([`TypeObject`]) hold fixed-offset slots, and builtin types are placed in read-only pages so the
//! only way to change them is to go around the runtime.

use lazy_static::lazy_static;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use thiserror::Error;

pub mod builtins;
pub(crate) mod cache;
pub mod dispatch;
pub mod object;
pub mod registry;
pub mod types;

pub use builtins::{
    builtins, new_classmethod, new_dict, new_float, new_function, new_instance, new_int,
    new_property, new_staticmethod, new_str, new_tuple, none, Builtins,
};
pub use dispatch::{
    binary_op, call, call_method, construct, contains, dir, get_attr, get_item, hash, len,
    negate, repr, set_type_attr, to_str, type_attr,
};
pub use object::{Body, Kwargs, ObjRef, ObjectHead, IMMORTAL_REFCNT};
pub use types::{
    NumberSlot, NumberSlots, SequenceSlot, SequenceSlots, SlotId, TypeBuilder, TypeFlags,
    TypeObject, TypeSlot,
};

/// Result of calling into the runtime
pub type CallResult = Result<ObjRef, CallError>;

/// Errors raised by runtime operations and native functions
#[derive(Debug, Error)]
pub enum CallError {
    /// Operation applied to an object of the wrong type
    #[error("TypeError: {0}")]
    Type(String),
    /// Attribute missing from both the instance and its type
    #[error("AttributeError: '{type_name}' object has no attribute '{name}'")]
    Attribute {
        /// Name of the type that was searched
        type_name: &'static str,
        /// Attribute that was requested
        name: String,
    },
    /// Raised by an implementation that declines the operation.
    /// Slot wrappers turn this into the NotImplemented sentinel.
    #[error("NotImplementedError")]
    NotImplemented,
    /// Division by zero
    #[error("ZeroDivisionError: division by zero")]
    ZeroDivision,
    /// Integer arithmetic overflowed
    #[error("OverflowError: integer result out of range")]
    Overflow,
    /// Sequence index out of range
    #[error("IndexError: {0}")]
    Index(String),
    /// Mapping key missing
    #[error("KeyError: '{0}'")]
    Key(String),
}

lazy_static! {
    /// The single global execution lock. Reentrant so native functions can call back into the runtime.
    static ref INTERPRETER_LOCK: ReentrantMutex<()> = ReentrantMutex::new(());
}

/// Acquires the interpreter lock.
///
/// Every dispatch operation and every patch runs while holding it, so patches are serialized
/// against interpreted code.
pub fn lock() -> ReentrantMutexGuard<'static, ()> {
    INTERPRETER_LOCK.lock()
}

/// Logs and aborts. Used where continuing would mean running on a corrupted object model.
pub(crate) fn fatal(message: std::fmt::Arguments<'_>) -> ! {
    log::error!("{message}");
    std::process::abort()
}
