//! Registry of live type descriptors
//!
//! A descriptor pointer is only dereferenced by the patcher after it has been found here.

use std::ptr;

use lazy_static::lazy_static;
use parking_lot::RwLock;

use super::types::TypeObject;

lazy_static! {
    /// Every descriptor built so far, in creation order
    static ref TYPES: RwLock<Vec<&'static TypeObject>> = RwLock::new(Vec::new());
}

/// Records a newly built descriptor
pub(crate) fn register(ty: &'static TypeObject) {
    TYPES.write().push(ty);
}

/// Resolves a raw descriptor pointer, returning `None` when it is not a live type
pub fn resolve(ty: *const TypeObject) -> Option<&'static TypeObject> {
    TYPES.read().iter().copied().find(|known| ptr::eq(*known, ty))
}

/// Finds a type by name. Later registrations shadow earlier ones.
pub fn find(name: &str) -> Option<&'static TypeObject> {
    TYPES.read().iter().rev().copied().find(|ty| ty.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{builtins, TypeBuilder};

    #[test]
    fn test_resolve() {
        let ty = TypeBuilder::new("Registered").build().unwrap();
        assert!(resolve(ty).is_some());

        let bogus = 0x10 as *const TypeObject;
        assert!(resolve(bogus).is_none());
        assert!(resolve(ptr::null()).is_none());
    }

    #[test]
    fn test_find() {
        let int = builtins().int;
        assert!(ptr::eq(find("int").unwrap(), int));

        let first = TypeBuilder::new("Shadowed").build().unwrap();
        let second = TypeBuilder::new("Shadowed").build().unwrap();
        assert!(!ptr::eq(first, second));
        assert!(ptr::eq(find("Shadowed").unwrap(), second));
        assert!(find("NoSuchType").is_none());
    }
}
