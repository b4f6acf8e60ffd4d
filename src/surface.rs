//! # Surface
//!
//! This module covers the capability surface, which turns a symbolic request such as
//! "give `str` a `__mul__`" into the matching low-level patch.
//!
//! Special method names with a native slot go through [`patch_slot`]; every other name lands in the
//! type's attribute table through [`patch_attr`].

use std::collections::{BTreeSet, HashMap};

use lazy_static::lazy_static;
use log::warn;
use parking_lot::Mutex;
use thiserror::Error;

use crate::patcher::{patch_attr, patch_slot, AttrPatch, PatchError, SlotPatch};
use crate::runtime::{self, call, new_function, registry, CallError, ObjRef, SlotId, TypeObject};
use crate::sentinel::{get_sentinel, SentinelKind};

/// Errors when extending a type
#[derive(Debug, Error)]
pub enum SurfaceError {
    /// No type is registered under that name
    #[error("UnknownType: no type named '{type_name}' to hold '{slot}'")]
    UnknownType {
        /// Name that was looked up
        type_name: String,
        /// Slot that was requested
        slot: String,
    },
    /// The target object is not a type
    #[error("TypeError: expected a type to hold '{slot}', got a '{type_name}' object")]
    NotAType {
        /// Type of the object that was passed
        type_name: &'static str,
        /// Slot that was requested
        slot: String,
    },
    /// The slot name is not an identifier
    #[error("InvalidSlotName: '{slot}' on '{type_name}'")]
    InvalidSlotName {
        /// Type that was targeted
        type_name: &'static str,
        /// Name that was rejected
        slot: String,
    },
    /// Native slots only accept callables
    #[error("TypeError: '{type_name}.{slot}' needs a callable implementation")]
    NotCallable {
        /// Type that was targeted
        type_name: &'static str,
        /// Slot that was requested
        slot: String,
    },
    /// The patch itself failed
    #[error("failed to patch '{type_name}.{slot}': {source}")]
    Patch {
        /// Type that was targeted
        type_name: &'static str,
        /// Slot that was requested
        slot: String,
        /// Underlying patch error
        source: PatchError,
    },
}

/// Type to extend
#[derive(Debug, Clone)]
pub enum Target {
    /// Registered type name. The most recently registered type wins.
    Name(String),
    /// Type object
    Object(ObjRef),
    /// Type descriptor
    Type(&'static TypeObject),
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Name(name.to_owned())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Name(name)
    }
}

impl From<ObjRef> for Target {
    fn from(obj: ObjRef) -> Self {
        Target::Object(obj)
    }
}

impl From<&ObjRef> for Target {
    fn from(obj: &ObjRef) -> Self {
        Target::Object(obj.clone())
    }
}

impl From<&'static TypeObject> for Target {
    fn from(ty: &'static TypeObject) -> Self {
        Target::Type(ty)
    }
}

impl Target {
    /// Descriptor named by the target. `slot` is only used in errors.
    fn resolve(self, slot: &str) -> Result<&'static TypeObject, SurfaceError> {
        match self {
            Target::Name(name) => registry::find(&name).ok_or_else(|| SurfaceError::UnknownType {
                type_name: name,
                slot: slot.to_owned(),
            }),
            Target::Object(obj) => obj.as_type().ok_or_else(|| SurfaceError::NotAType {
                type_name: obj.type_name(),
                slot: slot.to_owned(),
            }),
            Target::Type(ty) => Ok(ty),
        }
    }
}

/// Options for [`extend_with`]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ExtendOptions {
    /// Leave a newly added attribute out of [`dir`]. Ignored when the name already existed.
    pub hide_from_dir: bool,
}

impl ExtendOptions {
    /// Options hiding the new attribute from [`dir`]
    pub fn hidden() -> Self {
        Self {
            hide_from_dir: true,
        }
    }
}

/// A binding installed by [`extend`]
#[derive(Debug)]
#[must_use = "dropping the extension keeps it installed"]
pub enum Extension {
    /// A native slot was patched
    Slot(SlotPatch),
    /// An attribute was set
    Attr {
        /// The attribute itself
        patch: AttrPatch,
        /// `_c_<name>` binding of the value the attribute replaced
        alias: Option<AttrPatch>,
    },
}

impl Extension {
    /// What the binding replaced
    pub fn previous(&self) -> Option<&ObjRef> {
        match self {
            Extension::Slot(patch) => patch.previous(),
            Extension::Attr { patch, .. } => patch.previous(),
        }
    }

    /// Puts back what the binding replaced, along with whatever `_c_<name>` held before
    pub fn restore(self) -> Result<(), SurfaceError> {
        let _lock = runtime::lock();
        match self {
            Extension::Slot(patch) => {
                let ty = patch.target();
                let slot = patch.slot();
                let key = (ty.address(), slot);
                let to_original = ORIGINALS
                    .lock()
                    .get(&key)
                    .is_some_and(|original| same_object(original.as_ref(), patch.previous()));
                drop(patch.restore().map_err(patch_failed(ty, &slot.to_string()))?);
                if to_original {
                    ORIGINALS.lock().remove(&key);
                }
            }
            Extension::Attr { patch, alias } => {
                let ty = patch.target();
                let name = patch.name().to_owned();
                if let Some(alias) = alias {
                    let alias_name = alias.name().to_owned();
                    drop(alias.restore().map_err(patch_failed(ty, &alias_name))?);
                }
                let added = patch.previous().is_none();
                drop(patch.restore().map_err(patch_failed(ty, &name))?);
                if added {
                    unhide(ty, &name);
                }
            }
        }
        Ok(())
    }
}

lazy_static! {
    /// Slot occupants as they were before the first extension, keyed by (type address, slot)
    static ref ORIGINALS: Mutex<HashMap<(usize, SlotId), Option<ObjRef>>> = Mutex::new(HashMap::new());
    /// Names left out of `dir`, keyed by type address
    static ref HIDDEN: Mutex<HashMap<usize, BTreeSet<String>>> = Mutex::new(HashMap::new());
}

/// Whether `name` can be used as an attribute name
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}

/// Native slot named by a special method name
fn special_slot(name: &str) -> Option<SlotId> {
    if name.len() > 4 && name.starts_with("__") && name.ends_with("__") {
        SlotId::from_dunder(name)
    } else {
        None
    }
}

/// Resolves the target and checks the name
fn prepare(target: Target, name: &str) -> Result<&'static TypeObject, SurfaceError> {
    let ty = target.resolve(name)?;
    if !is_identifier(name) {
        return Err(SurfaceError::InvalidSlotName {
            type_name: ty.name(),
            slot: name.to_owned(),
        });
    }
    Ok(ty)
}

/// Attaches the target's names to a patch error
fn patch_failed<'a>(ty: &'static TypeObject, slot: &'a str) -> impl FnOnce(PatchError) -> SurfaceError + 'a {
    move |source| SurfaceError::Patch {
        type_name: ty.name(),
        slot: slot.to_owned(),
        source,
    }
}

/// Whether both are the same object, or both empty
fn same_object(a: Option<&ObjRef>, b: Option<&ObjRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.is(b),
        (None, None) => true,
        _ => false,
    }
}

/// Removes `name` from the names hidden on `ty`
fn unhide(ty: &TypeObject, name: &str) {
    let mut hidden = HIDDEN.lock();
    if let Some(names) = hidden.get_mut(&ty.address()) {
        names.remove(name);
    }
}

/// Wraps a slot implementation so that declining with [`CallError::NotImplemented`] produces the
/// NotImplemented sentinel, which lets dispatch try the other operand
fn slot_wrapper(ty: &TypeObject, slot: SlotId, implementation: ObjRef) -> ObjRef {
    new_function(format!("{}.{}", ty.name(), slot), move |args, kwargs| {
        match call(&implementation, args, kwargs) {
            Err(CallError::NotImplemented) => Ok(get_sentinel(SentinelKind::NotImplemented)),
            result => result,
        }
    })
}

/// Binds `name` on `target` to `implementation` with default options. See [`extend_with`].
pub fn extend(
    target: impl Into<Target>,
    name: &str,
    implementation: ObjRef,
) -> Result<Extension, SurfaceError> {
    extend_with(target, name, implementation, ExtendOptions::default())
}

/// Binds `name` on `target` to `implementation`, even when the type is sealed.
///
/// Special method names with a native slot install a wrapper around `implementation` into that
/// slot, and `implementation` must be callable. Any other name is set in the attribute table; an
/// attribute it replaces stays reachable as `_c_<name>` until the extension is restored.
pub fn extend_with(
    target: impl Into<Target>,
    name: &str,
    implementation: ObjRef,
    options: ExtendOptions,
) -> Result<Extension, SurfaceError> {
    let ty = prepare(target.into(), name)?;
    let _lock = runtime::lock();

    if let Some(slot) = special_slot(name) {
        if !implementation.is_callable() {
            return Err(SurfaceError::NotCallable {
                type_name: ty.name(),
                slot: name.to_owned(),
            });
        }
        let wrapper = slot_wrapper(ty, slot, implementation);
        let patch = patch_slot(ty, slot, Some(&wrapper)).map_err(patch_failed(ty, name))?;
        ORIGINALS
            .lock()
            .entry((ty.address(), slot))
            .or_insert_with(|| patch.previous().cloned());
        return Ok(Extension::Slot(patch));
    }

    let patch = patch_attr(ty, name, Some(implementation)).map_err(patch_failed(ty, name))?;
    let alias = match patch.previous() {
        Some(previous) => {
            let alias = format!("_c_{name}");
            Some(patch_attr(ty, &alias, Some(previous.clone())).map_err(patch_failed(ty, &alias))?)
        }
        None => {
            if options.hide_from_dir {
                HIDDEN
                    .lock()
                    .entry(ty.address())
                    .or_default()
                    .insert(name.to_owned());
            }
            None
        }
    };
    Ok(Extension::Attr { patch, alias })
}

/// Undoes extensions of `name` on `target`, returning the value taken out.
///
/// Attributes are removed. Native slots get back the occupant they had before they were first
/// extended; a slot that was never extended is left alone.
pub fn reverse(target: impl Into<Target>, name: &str) -> Result<Option<ObjRef>, SurfaceError> {
    let ty = prepare(target.into(), name)?;
    let _lock = runtime::lock();

    if let Some(slot) = special_slot(name) {
        let Some(original) = ORIGINALS.lock().remove(&(ty.address(), slot)) else {
            return Ok(None);
        };
        let patch = patch_slot(ty, slot, original.as_ref()).map_err(patch_failed(ty, name))?;
        return Ok(patch.into_previous());
    }

    let removed = patch_attr(ty, name, None)
        .map_err(patch_failed(ty, name))?
        .into_previous();
    unhide(ty, name);
    Ok(removed)
}

/// Extension that is undone when dropped
#[derive(Debug)]
#[must_use = "the extension is undone as soon as this is dropped"]
pub struct ScopedExtension {
    /// Installed binding. `None` once restored.
    extension: Option<Extension>,
}

impl ScopedExtension {
    /// What the binding replaced
    pub fn previous(&self) -> Option<&ObjRef> {
        self.extension.as_ref().and_then(Extension::previous)
    }
}

impl Drop for ScopedExtension {
    fn drop(&mut self) {
        if let Some(extension) = self.extension.take() {
            if let Err(e) = extension.restore() {
                warn!("failed to undo scoped extension: {e}");
            }
        }
    }
}

/// Like [`extend_with`], but the previous binding comes back when the returned guard is dropped
pub fn extended(
    target: impl Into<Target>,
    name: &str,
    implementation: ObjRef,
    options: ExtendOptions,
) -> Result<ScopedExtension, SurfaceError> {
    extend_with(target, name, implementation, options).map(|extension| ScopedExtension {
        extension: Some(extension),
    })
}

/// Names visible on `target`, without the ones extended with [`ExtendOptions::hide_from_dir`].
/// Non-type objects list the names of their type.
pub fn dir(target: impl Into<Target>) -> Result<Vec<String>, SurfaceError> {
    let ty = match target.into() {
        Target::Object(obj) if obj.as_type().is_none() => obj.type_object(),
        target => target.resolve("__dir__")?,
    };
    let mut names = runtime::dir(ty);
    if let Some(hidden) = HIDDEN.lock().get(&ty.address()) {
        names.retain(|name| !hidden.contains(name));
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        binary_op, builtins, get_attr, new_classmethod, new_instance, new_int, new_property,
        new_str, repr, NumberSlot, TypeBuilder,
    };

    #[test]
    /// Sealed builtins accept new methods
    fn test_extend_builtin() {
        crate::init_logging();
        let words_of_wisdom = new_function("words_of_wisdom", |args, _| {
            let times = args[0].as_int().unwrap_or(0).max(0) as usize;
            Ok(new_str("blah ".repeat(times)))
        });
        let _extension = extend("int", "words_of_wisdom", words_of_wisdom).unwrap();

        let said = runtime::call_method(&new_int(2), "words_of_wisdom", &[], &[]).unwrap();
        assert_eq!(said.as_str(), Some("blah blah "));
        assert!(dir(builtins().int).unwrap().contains(&"words_of_wisdom".to_owned()));
    }

    #[test]
    /// A class method on a sealed builtin receives the type
    fn test_extend_with_class_method() {
        let hello = new_function("hello", |args, _| {
            let receiver = args.first().and_then(ObjRef::as_type).map_or("?", TypeObject::name);
            Ok(new_str(format!("blah from {receiver}")))
        });
        let _extension = extend(builtins().str, "hello", new_classmethod(hello)).unwrap();

        let from_type = runtime::call_method(&builtins().str.as_object(), "hello", &[], &[]).unwrap();
        assert_eq!(from_type.as_str(), Some("blah from str"));
        let from_instance = runtime::call_method(&new_str("x"), "hello", &[], &[]).unwrap();
        assert_eq!(from_instance.as_str(), Some("blah from str"));
        assert!(dir("str").unwrap().contains(&"hello".to_owned()));
    }

    #[test]
    fn test_reverse_attribute() {
        let doubled = new_property(new_function("stuff", |args, _| {
            let text = args[0].as_str().unwrap_or_default();
            Ok(new_str(text.repeat(2)))
        }));
        let _extension = extend("str", "stuff", doubled.clone()).unwrap();
        assert_eq!(get_attr(&new_str("ab"), "stuff").unwrap().as_str(), Some("abab"));
        assert!(dir("str").unwrap().contains(&"stuff".to_owned()));

        let removed = reverse("str", "stuff").unwrap().unwrap();
        assert!(removed.is(&doubled));
        assert!(!dir("str").unwrap().contains(&"stuff".to_owned()));
        assert!(get_attr(&new_str("x"), "stuff").is_err());
    }

    #[test]
    fn test_dir_filtering() {
        let _extension = extend_with("str", "my_stuff", new_str("blah"), ExtendOptions::hidden()).unwrap();
        let found = get_attr(&builtins().str.as_object(), "my_stuff").unwrap();
        assert_eq!(found.as_str(), Some("blah"));
        assert!(!dir("str").unwrap().contains(&"my_stuff".to_owned()));
    }

    #[test]
    /// Hiding is per type, not per name
    fn test_dir_filtering_same_symbol_different_type() {
        let _on_str = extend_with("str", "attr_x", new_str("blah"), ExtendOptions::hidden()).unwrap();
        let _on_int = extend("int", "attr_x", new_str("blah")).unwrap();

        assert_eq!(get_attr(&new_str("s"), "attr_x").unwrap().as_str(), Some("blah"));
        assert!(!dir("str").unwrap().contains(&"attr_x".to_owned()));
        assert_eq!(get_attr(&new_int(1), "attr_x").unwrap().as_str(), Some("blah"));
        assert!(dir("int").unwrap().contains(&"attr_x".to_owned()));
    }

    #[test]
    fn test_dir_filtering_same_symbol_different_instance() {
        let _on_str = extend_with("str", "attr_y", new_str("stuff"), ExtendOptions::hidden()).unwrap();
        let _on_int = extend("int", "attr_y", new_str("stuff")).unwrap();

        assert_eq!(get_attr(&new_str("Hello"), "attr_y").unwrap().as_str(), Some("stuff"));
        assert!(!dir(new_str("hello")).unwrap().contains(&"attr_y".to_owned()));
        assert_eq!(get_attr(&new_int(1), "attr_y").unwrap().as_str(), Some("stuff"));
        assert!(dir(new_int(1)).unwrap().contains(&"attr_y".to_owned()));
    }

    /// Sealed type with a `now` class method answering 2013
    fn clock_type() -> &'static TypeObject {
        let now = new_function("Clock.now", |args, _| {
            assert!(args[0].as_type().is_some());
            Ok(new_int(2013))
        });
        TypeBuilder::new("Clock")
            .sealed()
            .attr("now", new_classmethod(now))
            .build()
            .unwrap()
    }

    #[test]
    /// A replaced class method stays reachable under its `_c_` alias, from the type and from
    /// instances
    fn test_overriding_class_method() {
        let clock = clock_type();
        let original = type_attr_of(clock, "now");
        let replacement = new_classmethod(new_function("now", |_, _| Ok(new_int(0))));
        let extension = extend(clock, "now", replacement).unwrap();
        assert!(extension.previous().unwrap().is(&original));

        assert!(dir(clock).unwrap().contains(&"_c_now".to_owned()));
        let instance = new_instance(clock, [("year", new_int(2013))]);
        let now = |obj: &ObjRef| runtime::call_method(obj, "now", &[], &[]).unwrap().as_int();
        assert_eq!(now(&clock.as_object()), Some(0));
        assert_eq!(now(&instance), Some(0));
        let kept = runtime::call_method(&instance, "_c_now", &[], &[]).unwrap();
        assert_eq!(kept.as_int(), Some(2013));

        extension.restore().unwrap();
        assert_eq!(now(&instance), Some(2013));
        assert!(!dir(clock).unwrap().contains(&"_c_now".to_owned()));
        assert!(get_attr(&instance, "_c_now").is_err());
    }

    /// Attribute stored on `ty`, unbound
    fn type_attr_of(ty: &'static TypeObject, name: &str) -> ObjRef {
        runtime::type_attr(ty, name).unwrap()
    }

    #[test]
    /// Stacked extensions unwind their aliases in order
    fn test_nested_overrides_restore_alias() {
        let clock = clock_type();
        let original = type_attr_of(clock, "now");
        let first = new_classmethod(new_function("first", |_, _| Ok(new_int(1))));
        let second = new_classmethod(new_function("second", |_, _| Ok(new_int(2))));

        let outer = extend(clock, "now", first.clone()).unwrap();
        let inner = extend(clock, "now", second).unwrap();
        assert!(type_attr_of(clock, "_c_now").is(&first));

        inner.restore().unwrap();
        assert!(type_attr_of(clock, "now").is(&first));
        assert!(type_attr_of(clock, "_c_now").is(&original));

        outer.restore().unwrap();
        assert!(type_attr_of(clock, "now").is(&original));
        assert!(runtime::type_attr(clock, "_c_now").is_none());
    }

    #[test]
    /// Restoring the first occupant of a slot lets go of the copy kept for `reverse`
    fn test_restore_releases_original() {
        let native = new_function("Kept.__repr__", |_, _| Ok(new_str("native")));
        let ty = TypeBuilder::new("Kept")
            .sealed()
            .slot(SlotId::Type(runtime::TypeSlot::Repr), native.clone())
            .build()
            .unwrap();
        let key = (ty.address(), SlotId::Type(runtime::TypeSlot::Repr));

        let patched = new_function("patched", |_, _| Ok(new_str("patched")));
        let outer = extend(ty, "__repr__", patched.clone()).unwrap();
        let inner = extend(ty, "__repr__", patched).unwrap();
        assert!(ORIGINALS.lock().contains_key(&key));
        assert_eq!(native.refcount(), 3);

        inner.restore().unwrap();
        assert!(ORIGINALS.lock().contains_key(&key));

        outer.restore().unwrap();
        assert!(!ORIGINALS.lock().contains_key(&key));
        assert_eq!(native.refcount(), 2);
        assert!(reverse(ty, "__repr__").unwrap().is_none());

        {
            let _scope = extended(ty, "__repr__", native.clone(), ExtendOptions::default()).unwrap();
            assert!(ORIGINALS.lock().contains_key(&key));
        }
        assert!(!ORIGINALS.lock().contains_key(&key));
    }

    #[test]
    /// Declining an operation lets dispatch fall through to the other operand
    fn test_special_method_declines() {
        let repeat = new_function("repeat", |args, _| {
            let text = args[0].as_str().unwrap_or_default();
            let times = args[1].as_int().ok_or(CallError::NotImplemented)?;
            Ok(new_str(text.repeat(times.max(0) as usize)))
        });
        let _extension = extend("str", "__mul__", repeat).unwrap();

        let repeated = binary_op(&new_str("ab"), &new_int(3), NumberSlot::Multiply).unwrap();
        assert_eq!(repeated.as_str(), Some("ababab"));
        assert!(matches!(
            binary_op(&new_str("ab"), &new_str("cd"), NumberSlot::Multiply),
            Err(CallError::Type(_))
        ));

        assert!(reverse("str", "__mul__").unwrap().is_some());
        assert!(builtins().str.slot(SlotId::Number(NumberSlot::Multiply)).is_none());
        assert!(reverse("str", "__mul__").unwrap().is_none());
    }

    #[test]
    fn test_scoped_extension() {
        let native = new_function("Scoped.__repr__", |_, _| Ok(new_str("native")));
        let ty = TypeBuilder::new("Scoped")
            .sealed()
            .slot(SlotId::from_dunder("__repr__").unwrap(), native)
            .build()
            .unwrap();
        let instance = new_instance(ty, Vec::<(String, ObjRef)>::new());
        {
            let patched = new_function("patched", |_, _| Ok(new_str("patched")));
            let _scope = extended(ty, "__repr__", patched, ExtendOptions::default()).unwrap();
            assert_eq!(repr(&instance).unwrap(), "patched");
        }
        assert_eq!(repr(&instance).unwrap(), "native");

        {
            let _scope = extended(ty, "temporary", new_int(1), ExtendOptions::hidden()).unwrap();
            assert_eq!(get_attr(&instance, "temporary").unwrap().as_int(), Some(1));
        }
        assert!(get_attr(&instance, "temporary").is_err());
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            extend("NoSuchType", "x", new_int(1)),
            Err(SurfaceError::UnknownType { type_name, slot }) if type_name == "NoSuchType" && slot == "x"
        ));
        assert!(matches!(
            extend("str", "not a name", new_int(1)),
            Err(SurfaceError::InvalidSlotName { type_name: "str", slot }) if slot == "not a name"
        ));
        assert!(matches!(
            extend(new_int(1), "x", new_int(1)),
            Err(SurfaceError::NotAType { type_name: "int", slot }) if slot == "x"
        ));
        assert!(matches!(
            extend("str", "__repr__", new_int(1)),
            Err(SurfaceError::NotCallable { type_name: "str", .. })
        ));
        assert!(matches!(
            extend("tuple", "__add__", new_function("add", |_, _| Ok(new_int(0)))),
            Err(SurfaceError::Patch {
                type_name: "tuple",
                source: PatchError::TypeNotPatchable { .. },
                ..
            })
        ));
        let err = extend("NoneType", "extra", new_int(1)).unwrap_err();
        assert!(matches!(
            err,
            SurfaceError::Patch {
                type_name: "NoneType",
                ref slot,
                source: PatchError::SlotNotSupported { .. },
            } if slot == "extra"
        ));
        assert!(err.to_string().starts_with("failed to patch 'NoneType.extra'"));
    }
}
