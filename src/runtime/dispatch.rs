//! Dispatch through slots and attribute tables
//!
//! These are the operations interpreted code goes through. Each one holds the interpreter lock for
//! its duration.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use super::builtins::new_method;
use super::object::{Body, Kwargs, ObjRef};
use super::types::{NumberSlot, SequenceSlot, SlotId, TypeObject, TypeSlot, DUNDER_SLOTS};
use super::{cache, lock, CallError, CallResult};

/// Prepends `first` to `args`
fn with_receiver(first: &ObjRef, args: &[ObjRef]) -> Vec<ObjRef> {
    let mut bound = Vec::with_capacity(args.len() + 1);
    bound.push(first.clone());
    bound.extend(args.iter().cloned());
    bound
}

/// Calls `callable` with positional and keyword arguments
pub fn call(callable: &ObjRef, args: &[ObjRef], kwargs: &Kwargs) -> CallResult {
    let _lock = lock();
    match callable.body() {
        Some(Body::Function(function)) => (function.call)(args, kwargs),
        Some(Body::Method { receiver, function }) => {
            call(function, &with_receiver(receiver, args), kwargs)
        }
        None => match callable.as_type() {
            Some(ty) => construct(ty, args, kwargs),
            None => Err(not_callable(callable)),
        },
        Some(_) => match callable.type_object().resolve_slot(SlotId::Type(TypeSlot::Call)) {
            Some(slot) => call(&slot, &with_receiver(callable, args), kwargs),
            None => Err(not_callable(callable)),
        },
    }
}

/// Error for calling something that cannot be called
fn not_callable(callable: &ObjRef) -> CallError {
    CallError::Type(format!("'{}' object is not callable", callable.type_name()))
}

/// Creates an instance of `ty` through its constructor slot
pub fn construct(ty: &'static TypeObject, args: &[ObjRef], kwargs: &Kwargs) -> CallResult {
    let _lock = lock();
    let new = ty
        .resolve_slot(SlotId::Type(TypeSlot::New))
        .ok_or_else(|| CallError::Type(format!("cannot create '{}' instances", ty.name())))?;
    call(&new, &with_receiver(&ty.as_object(), args), kwargs)
}

/// Attribute of `ty` or its bases, without binding
pub fn type_attr(ty: &'static TypeObject, name: &str) -> Option<ObjRef> {
    cache::lookup(ty, name)
}

/// Binds `value`, found on a type, for a lookup through `owner` or through one of its instances
fn bind(value: ObjRef, owner: &'static TypeObject, instance: Option<&ObjRef>) -> CallResult {
    match (value.body(), instance) {
        (Some(Body::ClassMethod(function)), _) => Ok(new_method(owner.as_object(), function.clone())),
        (Some(Body::StaticMethod(function)), _) => Ok(function.clone()),
        (Some(Body::Property(getter)), Some(instance)) => {
            call(getter, std::slice::from_ref(instance), &[])
        }
        (Some(Body::Function(_)), Some(instance)) => Ok(new_method(instance.clone(), value.clone())),
        _ => Ok(value),
    }
}

/// Attribute lookup: instance attributes first, then the type.
///
/// Functions found on the type are bound to `obj` when it is an instance. Class methods are bound
/// to the type the lookup went through, static methods are unwrapped, and properties are
/// evaluated on instances.
pub fn get_attr(obj: &ObjRef, name: &str) -> CallResult {
    let _lock = lock();
    if let Some(attrs) = obj.instance_attrs() {
        if let Some(value) = attrs.lock().get(name) {
            return Ok(value.clone());
        }
    }
    let (owner, instance) = match obj.as_type() {
        Some(ty) => (ty, None),
        None => (obj.type_object(), Some(obj)),
    };
    let value = type_attr(owner, name).ok_or_else(|| CallError::Attribute {
        type_name: owner.name(),
        name: name.to_owned(),
    })?;
    bind(value, owner, instance)
}

/// Looks up `name` on `obj` and calls it
pub fn call_method(obj: &ObjRef, name: &str, args: &[ObjRef], kwargs: &Kwargs) -> CallResult {
    let _lock = lock();
    let method = get_attr(obj, name)?;
    call(&method, args, kwargs)
}

/// Assigns an attribute on a type through the public API.
///
/// Sealed types refuse, which is what the patcher exists to get around.
pub fn set_type_attr(ty: &'static TypeObject, name: &str, value: ObjRef) -> Result<(), CallError> {
    let _lock = lock();
    if ty.is_sealed() {
        return Err(CallError::Type(format!(
            "cannot set '{name}' attribute of immutable type '{}'",
            ty.name()
        )));
    }
    let attrs = ty.attrs().ok_or_else(|| CallError::Attribute {
        type_name: ty.name(),
        name: name.to_owned(),
    })?;
    let previous = attrs.write().insert(name.to_owned(), value);
    cache::invalidate(ty);
    drop(previous);
    Ok(())
}

/// Binary arithmetic. Tries the left operand's slot, then the right's, then sequence
/// concatenation for `+`.
pub fn binary_op(lhs: &ObjRef, rhs: &ObjRef, op: NumberSlot) -> CallResult {
    let _lock = lock();
    if op == NumberSlot::Negative {
        return Err(CallError::Type("unary negation takes a single operand".to_owned()));
    }
    let left = lhs.type_object();
    let right = rhs.type_object();
    let candidates = if std::ptr::eq(left, right) {
        vec![left]
    } else {
        vec![left, right]
    };
    for ty in candidates {
        if let Some(slot) = ty.resolve_slot(SlotId::Number(op)) {
            let result = call(&slot, &[lhs.clone(), rhs.clone()], &[])?;
            if !result.is_not_implemented() {
                return Ok(result);
            }
        }
    }
    if op == NumberSlot::Add {
        if let Some(concat) = left.resolve_slot(SlotId::Sequence(SequenceSlot::Concat)) {
            return call(&concat, &[lhs.clone(), rhs.clone()], &[]);
        }
    }
    Err(CallError::Type(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.name(),
        right.name()
    )))
}

/// Unary negation
pub fn negate(obj: &ObjRef) -> CallResult {
    let _lock = lock();
    if let Some(slot) = obj.type_object().resolve_slot(SlotId::Number(NumberSlot::Negative)) {
        let result = call(&slot, &[obj.clone()], &[])?;
        if !result.is_not_implemented() {
            return Ok(result);
        }
    }
    Err(CallError::Type(format!(
        "bad operand type for unary -: '{}'",
        obj.type_name()
    )))
}

/// Calls the sequence slot `slot` of `obj`
fn sequence_call(obj: &ObjRef, slot: SequenceSlot, args: &[ObjRef], what: &str) -> CallResult {
    let _lock = lock();
    let function = obj
        .type_object()
        .resolve_slot(SlotId::Sequence(slot))
        .ok_or_else(|| CallError::Type(format!("'{}' object {what}", obj.type_name())))?;
    call(&function, &with_receiver(obj, args), &[])
}

/// `len(obj)`
pub fn len(obj: &ObjRef) -> Result<usize, CallError> {
    let length = sequence_call(obj, SequenceSlot::Length, &[], "has no len()")?;
    length
        .as_int()
        .and_then(|length| usize::try_from(length).ok())
        .ok_or_else(|| CallError::Type("__len__ should return a non-negative integer".to_owned()))
}

/// `obj[key]`
pub fn get_item(obj: &ObjRef, key: &ObjRef) -> CallResult {
    sequence_call(
        obj,
        SequenceSlot::Item,
        std::slice::from_ref(key),
        "is not subscriptable",
    )
}

/// `item in container`
pub fn contains(container: &ObjRef, item: &ObjRef) -> Result<bool, CallError> {
    let found = sequence_call(
        container,
        SequenceSlot::Contains,
        std::slice::from_ref(item),
        "is not a container",
    )?;
    Ok(found.as_int().map_or(!found.is_none(), |found| found != 0))
}

/// Printable representation, through the repr slot when one is set
pub fn repr(obj: &ObjRef) -> Result<String, CallError> {
    let _lock = lock();
    match obj.type_object().resolve_slot(SlotId::Type(TypeSlot::Repr)) {
        Some(slot) => expect_str(call(&slot, std::slice::from_ref(obj), &[])?, "__repr__"),
        None => Ok(obj.default_repr()),
    }
}

/// String conversion, falling back to [`repr`]
pub fn to_str(obj: &ObjRef) -> Result<String, CallError> {
    let _lock = lock();
    match obj.type_object().resolve_slot(SlotId::Type(TypeSlot::Str)) {
        Some(slot) => expect_str(call(&slot, std::slice::from_ref(obj), &[])?, "__str__"),
        None => match obj.as_str() {
            Some(text) => Ok(text.to_owned()),
            None => repr(obj),
        },
    }
}

/// Unwraps a string returned by a conversion slot
fn expect_str(value: ObjRef, slot: &str) -> Result<String, CallError> {
    value.as_str().map(str::to_owned).ok_or_else(|| {
        CallError::Type(format!(
            "{slot} returned non-string (type {})",
            value.type_name()
        ))
    })
}

/// Hash, through the hash slot when one is set
pub fn hash(obj: &ObjRef) -> Result<i64, CallError> {
    let _lock = lock();
    if let Some(slot) = obj.type_object().resolve_slot(SlotId::Type(TypeSlot::Hash)) {
        let value = call(&slot, std::slice::from_ref(obj), &[])?;
        return value.as_int().ok_or_else(|| {
            CallError::Type("__hash__ method should return an integer".to_owned())
        });
    }
    Ok(match obj.body() {
        Some(Body::Int(value)) => *value,
        Some(Body::Str(text)) => {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            hasher.finish() as i64
        }
        _ => obj.as_ptr() as i64,
    })
}

/// Names visible on `ty`: attributes of the type and its bases plus the special methods of every
/// occupied slot
pub fn dir(ty: &'static TypeObject) -> Vec<String> {
    let _lock = lock();
    let mut names = BTreeSet::new();
    for ty in ty.mro() {
        if let Some(attrs) = ty.attrs() {
            names.extend(attrs.read().keys().cloned());
        }
    }
    for (dunder, slot) in DUNDER_SLOTS {
        if slot.dunder() == *dunder && ty.resolve_slot(*slot).is_some() {
            names.insert((*dunder).to_owned());
        }
    }
    names.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        builtins, new_classmethod, new_function, new_instance, new_int, new_property,
        new_staticmethod, new_str, TypeBuilder,
    };

    #[test]
    /// The public API refuses to touch sealed types
    fn test_sealed_refuses_assignment() {
        let err = set_type_attr(builtins().int, "blah", new_int(1)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "TypeError: cannot set 'blah' attribute of immutable type 'int'"
        );
        assert!(type_attr(builtins().int, "blah").is_none());
    }

    #[test]
    /// Open types accept assignment and their instances see the new method bound
    fn test_open_type_assignment() {
        let ty = TypeBuilder::new("Open")
            .slot(
                SlotId::Type(TypeSlot::New),
                new_function("Open.__new__", |args, _| {
                    let ty = args[0].as_type().unwrap();
                    Ok(new_instance(ty, [("value", args[1].clone())]))
                }),
            )
            .build()
            .unwrap();
        set_type_attr(
            ty,
            "double",
            new_function("double", |args, _| {
                let value = get_attr(&args[0], "value")?;
                binary_op(&value, &value, NumberSlot::Add)
            }),
        )
        .unwrap();

        let instance = construct(ty, &[new_int(21)], &[]).unwrap();
        let doubled = call_method(&instance, "double", &[], &[]).unwrap();
        assert_eq!(doubled.as_int(), Some(42));
    }

    #[test]
    /// Class methods bind to the type they are reached through, static methods are never bound
    fn test_descriptor_binding() {
        let parent = TypeBuilder::new("Described").build().unwrap();
        let child = TypeBuilder::new("DescribedChild").base(parent).build().unwrap();
        let receiver_name = new_function("which", |args, _| {
            let receiver = args.first().and_then(ObjRef::as_type).map_or("unbound", TypeObject::name);
            Ok(new_str(receiver))
        });
        set_type_attr(parent, "which", new_classmethod(receiver_name.clone())).unwrap();
        set_type_attr(parent, "plain", new_staticmethod(receiver_name)).unwrap();
        set_type_attr(
            parent,
            "label",
            new_property(new_function("label", |args, _| {
                Ok(new_str(format!("a {}", args[0].type_name())))
            })),
        )
        .unwrap();

        let which = |obj: &ObjRef| call_method(obj, "which", &[], &[]).unwrap();
        assert_eq!(which(&parent.as_object()).as_str(), Some("Described"));
        assert_eq!(which(&child.as_object()).as_str(), Some("DescribedChild"));
        let instance = new_instance(child, Vec::<(String, ObjRef)>::new());
        assert_eq!(which(&instance).as_str(), Some("DescribedChild"));

        let plain = call_method(&instance, "plain", &[], &[]).unwrap();
        assert_eq!(plain.as_str(), Some("unbound"));

        assert_eq!(get_attr(&instance, "label").unwrap().as_str(), Some("a DescribedChild"));
        let descriptor = get_attr(&child.as_object(), "label").unwrap();
        assert!(std::ptr::eq(descriptor.type_object(), builtins().property));
    }

    #[test]
    fn test_missing_attribute() {
        let err = get_attr(&new_int(1), "nope").unwrap_err();
        assert_eq!(
            err.to_string(),
            "AttributeError: 'int' object has no attribute 'nope'"
        );
    }

    #[test]
    fn test_unsupported_operands() {
        let err = binary_op(&new_str("a"), &new_int(1), NumberSlot::Subtract).unwrap_err();
        assert_eq!(
            err.to_string(),
            "TypeError: unsupported operand type(s) for -: 'str' and 'int'"
        );
    }

    #[test]
    fn test_conversions() {
        assert_eq!(repr(&new_str("x")).unwrap(), "'x'");
        assert_eq!(to_str(&new_str("x")).unwrap(), "x");
        assert_eq!(to_str(&new_int(3)).unwrap(), "3");
        assert_eq!(hash(&new_int(3)).unwrap(), 3);
        assert_eq!(hash(&new_str("x")).unwrap(), hash(&new_str("x")).unwrap());
    }

    #[test]
    /// Calling a type constructs an instance; calling an int does not work
    fn test_call() {
        let err = call(&new_int(1), &[], &[]).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: 'int' object is not callable");

        let err = call(&builtins().int.as_object(), &[], &[]).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: cannot create 'int' instances");
    }

    #[test]
    fn test_dir_lists_slots() {
        let names = dir(builtins().int);
        assert!(names.contains(&"__add__".to_owned()));
        assert!(!names.contains(&"__div__".to_owned()));
        assert!(!names.contains(&"__len__".to_owned()));
    }
}
