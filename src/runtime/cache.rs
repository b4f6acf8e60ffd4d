//! Method cache
//!
//! Attribute lookups through a type's base chain are memoized per (type, name). Entries borrow the
//! value they point at, so every mutation of an attribute table or slot must invalidate the affected
//! entries before the old value is released.

use std::collections::HashMap;

use lazy_static::lazy_static;
use parking_lot::Mutex;

use super::object::{ObjRef, ObjectHead};
use super::types::TypeObject;

/// Cached result of a lookup
struct CacheEntry {
    /// Type the lookup started from
    ty: &'static TypeObject,
    /// Borrowed pointer to the value found
    value: *mut ObjectHead,
}

// SAFETY: the pointer is only dereferenced while holding the interpreter lock
unsafe impl Send for CacheEntry {}

lazy_static! {
    /// Lookups keyed by (type address, attribute name)
    static ref METHOD_CACHE: Mutex<HashMap<(usize, String), CacheEntry>> = Mutex::new(HashMap::new());
}

/// Looks `name` up on `ty` and its bases, going through the cache
pub(crate) fn lookup(ty: &'static TypeObject, name: &str) -> Option<ObjRef> {
    let _lock = super::lock();
    let key = (ty.address(), name.to_owned());

    let cached = METHOD_CACHE.lock().get(&key).map(|entry| entry.value);
    if let Some(value) = cached {
        // SAFETY: entries are invalidated before the value they borrow can be released
        return unsafe { ObjRef::from_borrowed(value) };
    }

    let found = ty
        .mro()
        .find_map(|ty| ty.attrs().and_then(|attrs| attrs.read().get(name).cloned()))?;
    METHOD_CACHE.lock().insert(
        key,
        CacheEntry {
            ty,
            value: found.as_ptr(),
        },
    );
    Some(found)
}

/// Drops every entry for `ty` and the types inheriting from it. Returns how many were dropped.
pub(crate) fn invalidate(ty: &TypeObject) -> usize {
    let mut cache = METHOD_CACHE.lock();
    let before = cache.len();
    cache.retain(|_, entry| !entry.ty.inherits(ty));
    let dropped = before - cache.len();
    log::trace!("invalidated {dropped} cached lookups for '{}'", ty.name());
    dropped
}

/// Whether a lookup of `name` on `ty` is currently cached
#[cfg(test)]
pub(crate) fn is_cached(ty: &TypeObject, name: &str) -> bool {
    METHOD_CACHE
        .lock()
        .contains_key(&(ty.address(), name.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{new_int, set_type_attr, TypeBuilder};

    #[test]
    /// Lookups populate the cache and assignments clear it, including on subclasses
    fn test_invalidate_subclasses() {
        let parent = TypeBuilder::new("CachedParent").build().unwrap();
        let child = TypeBuilder::new("CachedChild").base(parent).build().unwrap();
        set_type_attr(parent, "answer", new_int(41)).unwrap();

        assert_eq!(lookup(child, "answer").unwrap().as_int(), Some(41));
        assert!(is_cached(child, "answer"));

        set_type_attr(parent, "answer", new_int(42)).unwrap();
        assert!(!is_cached(child, "answer"));
        assert_eq!(lookup(child, "answer").unwrap().as_int(), Some(42));
    }

    #[test]
    fn test_missing_is_not_cached() {
        let ty = TypeBuilder::new("CachedMissing").build().unwrap();
        assert!(lookup(ty, "nothing").is_none());
        assert!(!is_cached(ty, "nothing"));
    }
}
