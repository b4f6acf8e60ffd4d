//! # Sentinel
//!
//! Read-only access to the runtime's well-known singletons.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::runtime::{builtins, ObjRef};

/// Errors when looking up a sentinel
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SentinelError {
    /// No sentinel is known by that name
    #[error("UnknownSentinelKind: '{0}'")]
    UnknownKind(String),
}

/// Well-known singletons
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SentinelKind {
    /// Returned by binary operations that do not handle their operands
    NotImplemented,
}

impl SentinelKind {
    /// Every kind
    pub const ALL: [SentinelKind; 1] = [SentinelKind::NotImplemented];

    /// External spelling of the kind
    pub const fn name(self) -> &'static str {
        match self {
            SentinelKind::NotImplemented => "not-implemented",
        }
    }
}

impl fmt::Display for SentinelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SentinelKind {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SentinelKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| SentinelError::UnknownKind(s.to_owned()))
    }
}

/// New strong reference to the singleton for `kind`
pub fn get_sentinel(kind: SentinelKind) -> ObjRef {
    match kind {
        SentinelKind::NotImplemented => builtins().not_implemented.clone(),
    }
}

/// Looks a sentinel up by its external spelling
pub fn lookup(name: &str) -> Result<ObjRef, SentinelError> {
    name.parse().map(get_sentinel)
}

/// Whether `obj` is the singleton for `kind`
pub fn is_sentinel(obj: &ObjRef, kind: SentinelKind) -> bool {
    match kind {
        SentinelKind::NotImplemented => obj.is(&builtins().not_implemented),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::runtime::new_int;

    #[test]
    /// Every call hands out the same object, from any thread
    fn test_identity() {
        let first = get_sentinel(SentinelKind::NotImplemented);
        let second = get_sentinel(SentinelKind::NotImplemented);
        assert!(first.is(&second));
        assert!(first.is_not_implemented());

        let addresses: Vec<usize> = (0..4)
            .map(|_| thread::spawn(|| get_sentinel(SentinelKind::NotImplemented).as_ptr() as usize))
            .map(|handle| handle.join().unwrap())
            .collect();
        assert!(addresses.iter().all(|address| *address == first.as_ptr() as usize));
    }

    #[test]
    /// Each handed-out reference is counted until it is dropped
    fn test_counted() {
        // the registry keeps its own reference besides the two taken here
        let held = get_sentinel(SentinelKind::NotImplemented);
        let extra = get_sentinel(SentinelKind::NotImplemented);
        assert!(extra.refcount() >= 3);
        assert!(!held.head().is_immortal());
        drop(extra);
        assert!(held.refcount() >= 2);
    }

    #[test]
    fn test_lookup() {
        let sentinel = lookup("not-implemented").unwrap();
        assert!(is_sentinel(&sentinel, SentinelKind::NotImplemented));
        assert!(!is_sentinel(&new_int(0), SentinelKind::NotImplemented));
        assert_eq!(
            lookup("not_implemented").unwrap_err(),
            SentinelError::UnknownKind("not_implemented".to_owned())
        );
        assert_eq!(SentinelKind::NotImplemented.to_string(), "not-implemented");
    }
}
