//! Builtin types, singletons and object constructors

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use parking_lot::Mutex;

use super::object::{Body, Function, Kwargs, ObjRef};
use super::types::{NumberSlot, SequenceSlot, SlotId, TypeBuilder, TypeObject};
use super::{fatal, CallError, CallResult};

/// Builtin types and the singletons the runtime owns
pub struct Builtins {
    /// `type`, the metatype
    pub type_type: &'static TypeObject,
    /// `object`, root of every other type
    pub object: &'static TypeObject,
    /// Type of `None`
    pub none_type: &'static TypeObject,
    /// Type of `NotImplemented`
    pub not_implemented_type: &'static TypeObject,
    /// Native functions
    pub function: &'static TypeObject,
    /// Bound methods
    pub method: &'static TypeObject,
    /// Class method wrappers
    pub classmethod: &'static TypeObject,
    /// Static method wrappers
    pub staticmethod: &'static TypeObject,
    /// Computed attributes
    pub property: &'static TypeObject,
    /// Integers
    pub int: &'static TypeObject,
    /// Floats
    pub float: &'static TypeObject,
    /// Strings
    pub str: &'static TypeObject,
    /// Tuples
    pub tuple: &'static TypeObject,
    /// Keyword dicts
    pub dict: &'static TypeObject,
    /// The `None` singleton
    pub(crate) none: ObjRef,
    /// The NotImplemented singleton
    pub(crate) not_implemented: ObjRef,
}

lazy_static! {
    /// Created on first use, never torn down
    static ref BUILTINS: Builtins = match Builtins::create() {
        Ok(builtins) => builtins,
        Err(e) => fatal(format_args!("failed to allocate builtin type descriptors: {e}")),
    };
}

/// Builtin types of the runtime
pub fn builtins() -> &'static Builtins {
    &BUILTINS
}

impl Builtins {
    /// Builds every builtin type. Order matters: functions need `function`, slots need functions.
    fn create() -> Result<Self, region::Error> {
        let type_type = TypeBuilder::root("type").metatype().sealed().build()?;
        let object = TypeBuilder::root("object")
            .with_meta(type_type)
            .sealed()
            .build()?;
        let child = |name: &str| {
            TypeBuilder::root(name)
                .with_meta(type_type)
                .base(object)
                .sealed()
        };

        let none_type = child("NoneType").without_attrs().build()?;
        let not_implemented_type = child("NotImplementedType").without_attrs().build()?;
        let none = ObjRef::alloc(none_type, Body::None);
        let not_implemented = ObjRef::alloc(not_implemented_type, Body::NotImplemented);

        let function = child("function").build()?;
        let method = child("method").build()?;
        let classmethod = child("classmethod").build()?;
        let staticmethod = child("staticmethod").build()?;
        let property = child("property").build()?;

        let float = {
            let mut builder = child("float");
            for slot in NumberSlot::ALL {
                let not_implemented = not_implemented.clone();
                builder = builder.slot(
                    SlotId::Number(slot),
                    native_fn(function, &format!("float.{}", SlotId::Number(slot)), move |args, _| {
                        float_op(slot, args, &not_implemented)
                    }),
                );
            }
            builder.build()?
        };

        let int = {
            let mut builder = child("int");
            for slot in NumberSlot::ALL {
                let not_implemented = not_implemented.clone();
                builder = builder.slot(
                    SlotId::Number(slot),
                    native_fn(function, &format!("int.{}", SlotId::Number(slot)), move |args, _| {
                        int_op(slot, float, args, &not_implemented)
                    }),
                );
            }
            builder.build()?
        };

        let str = child("str")
            .extensible()
            .slot(
                SlotId::Sequence(SequenceSlot::Length),
                native_fn(function, "str.__len__", move |args, _| {
                    let text = receiver_str(args)?;
                    Ok(ObjRef::alloc(int, Body::Int(text.chars().count() as i64)))
                }),
            )
            .slot(
                SlotId::Sequence(SequenceSlot::Concat),
                native_fn(function, "str.__concat__", |args, _| {
                    let text = receiver_str(args)?;
                    let other = argument(args, 1)?;
                    let other = other.as_str().ok_or_else(|| {
                        CallError::Type(format!(
                            "can only concatenate str (not \"{}\") to str",
                            other.type_name()
                        ))
                    })?;
                    Ok(ObjRef::alloc(args[0].type_object(), Body::Str(format!("{text}{other}"))))
                }),
            )
            .slot(
                SlotId::Sequence(SequenceSlot::Contains),
                native_fn(function, "str.__contains__", move |args, _| {
                    let text = receiver_str(args)?;
                    let needle = argument(args, 1)?;
                    let needle = needle.as_str().ok_or_else(|| {
                        CallError::Type("'in <string>' requires string as left operand".to_owned())
                    })?;
                    Ok(ObjRef::alloc(int, Body::Int(text.contains(needle) as i64)))
                }),
            )
            .build()?;

        let tuple = child("tuple")
            .slot(
                SlotId::Sequence(SequenceSlot::Length),
                native_fn(function, "tuple.__len__", move |args, _| {
                    let items = receiver_tuple(args)?;
                    Ok(ObjRef::alloc(int, Body::Int(items.len() as i64)))
                }),
            )
            .slot(
                SlotId::Sequence(SequenceSlot::Item),
                native_fn(function, "tuple.__getitem__", |args, _| {
                    let items = receiver_tuple(args)?;
                    let index = argument(args, 1)?.as_int().ok_or_else(|| {
                        CallError::Type("tuple indices must be integers".to_owned())
                    })?;
                    let resolved = if index < 0 { index + items.len() as i64 } else { index };
                    usize::try_from(resolved)
                        .ok()
                        .and_then(|index| items.get(index))
                        .cloned()
                        .ok_or_else(|| CallError::Index("tuple index out of range".to_owned()))
                }),
            )
            .slot(
                SlotId::Sequence(SequenceSlot::Contains),
                native_fn(function, "tuple.__contains__", move |args, _| {
                    let items = receiver_tuple(args)?;
                    let needle = argument(args, 1)?;
                    let found = items.iter().any(|item| item.value_eq(needle));
                    Ok(ObjRef::alloc(int, Body::Int(found as i64)))
                }),
            )
            .slot(
                SlotId::Sequence(SequenceSlot::Concat),
                native_fn(function, "tuple.__concat__", |args, _| {
                    let items = receiver_tuple(args)?;
                    let other = argument(args, 1)?;
                    let other = other.as_tuple().ok_or_else(|| {
                        CallError::Type(format!(
                            "can only concatenate tuple (not \"{}\") to tuple",
                            other.type_name()
                        ))
                    })?;
                    let joined = items.iter().chain(other).cloned().collect();
                    Ok(ObjRef::alloc(args[0].type_object(), Body::Tuple(joined)))
                }),
            )
            .build()?;

        let dict = child("dict")
            .slot(
                SlotId::Sequence(SequenceSlot::Length),
                native_fn(function, "dict.__len__", move |args, _| {
                    let entries = receiver_dict(args)?;
                    Ok(ObjRef::alloc(int, Body::Int(entries.len() as i64)))
                }),
            )
            .slot(
                SlotId::Sequence(SequenceSlot::Item),
                native_fn(function, "dict.__getitem__", |args, _| {
                    let entries = receiver_dict(args)?;
                    let key = argument(args, 1)?;
                    let key = key
                        .as_str()
                        .ok_or_else(|| CallError::Key(key.default_repr()))?;
                    entries
                        .iter()
                        .find(|(name, _)| name == key)
                        .map(|(_, value)| value.clone())
                        .ok_or_else(|| CallError::Key(key.to_owned()))
                }),
            )
            .build()?;

        log::debug!("builtin types ready");
        Ok(Self {
            type_type,
            object,
            none_type,
            not_implemented_type,
            function,
            method,
            classmethod,
            staticmethod,
            property,
            int,
            float,
            str,
            tuple,
            dict,
            none,
            not_implemented,
        })
    }
}

/// Allocates a function object of type `function`
fn native_fn<F>(function: &'static TypeObject, name: &str, call: F) -> ObjRef
where
    F: Fn(&[ObjRef], &Kwargs) -> CallResult + Send + Sync + 'static,
{
    ObjRef::alloc(
        function,
        Body::Function(Function {
            name: name.to_owned(),
            call: Box::new(call),
        }),
    )
}

/// Positional argument `index`
fn argument(args: &[ObjRef], index: usize) -> Result<&ObjRef, CallError> {
    args.get(index).ok_or_else(|| {
        CallError::Type(format!(
            "expected at least {} arguments, got {}",
            index + 1,
            args.len()
        ))
    })
}

/// Receiver as a string
fn receiver_str(args: &[ObjRef]) -> Result<&str, CallError> {
    let receiver = argument(args, 0)?;
    receiver
        .as_str()
        .ok_or_else(|| CallError::Type(format!("descriptor requires a 'str' object but received a '{}'", receiver.type_name())))
}

/// Receiver as a tuple
fn receiver_tuple(args: &[ObjRef]) -> Result<&[ObjRef], CallError> {
    let receiver = argument(args, 0)?;
    receiver
        .as_tuple()
        .ok_or_else(|| CallError::Type(format!("descriptor requires a 'tuple' object but received a '{}'", receiver.type_name())))
}

/// Receiver as a dict
fn receiver_dict(args: &[ObjRef]) -> Result<&[(String, ObjRef)], CallError> {
    let receiver = argument(args, 0)?;
    receiver
        .as_dict()
        .ok_or_else(|| CallError::Type(format!("descriptor requires a 'dict' object but received a '{}'", receiver.type_name())))
}

/// Integer arithmetic. Declines anything that is not two ints.
fn int_op(
    slot: NumberSlot,
    float: &'static TypeObject,
    args: &[ObjRef],
    not_implemented: &ObjRef,
) -> CallResult {
    let lhs = argument(args, 0)?;
    let Some(a) = lhs.as_int() else {
        return Ok(not_implemented.clone());
    };
    let ty = lhs.type_object();
    if slot == NumberSlot::Negative {
        let value = a.checked_neg().ok_or(CallError::Overflow)?;
        return Ok(ObjRef::alloc(ty, Body::Int(value)));
    }
    let Some(b) = argument(args, 1)?.as_int() else {
        return Ok(not_implemented.clone());
    };
    let value = match slot {
        NumberSlot::Add => a.checked_add(b),
        NumberSlot::Subtract => a.checked_sub(b),
        NumberSlot::Multiply => a.checked_mul(b),
        NumberSlot::TrueDivide => {
            if b == 0 {
                return Err(CallError::ZeroDivision);
            }
            return Ok(ObjRef::alloc(float, Body::Float(a as f64 / b as f64)));
        }
        NumberSlot::Negative => a.checked_neg(),
    };
    Ok(ObjRef::alloc(ty, Body::Int(value.ok_or(CallError::Overflow)?)))
}

/// Float arithmetic. Accepts ints on either side as long as one operand is a float.
fn float_op(slot: NumberSlot, args: &[ObjRef], not_implemented: &ObjRef) -> CallResult {
    let lhs = argument(args, 0)?;
    if slot == NumberSlot::Negative {
        return match lhs.body() {
            Some(Body::Float(value)) => Ok(ObjRef::alloc(lhs.type_object(), Body::Float(-value))),
            _ => Ok(not_implemented.clone()),
        };
    }
    let rhs = argument(args, 1)?;
    let float_type = match (lhs.body(), rhs.body()) {
        (Some(Body::Float(_)), _) => lhs.type_object(),
        (_, Some(Body::Float(_))) => rhs.type_object(),
        _ => return Ok(not_implemented.clone()),
    };
    let (Some(a), Some(b)) = (lhs.as_float(), rhs.as_float()) else {
        return Ok(not_implemented.clone());
    };
    let value = match slot {
        NumberSlot::Add => a + b,
        NumberSlot::Subtract => a - b,
        NumberSlot::Multiply => a * b,
        NumberSlot::TrueDivide => {
            if b == 0.0 {
                return Err(CallError::ZeroDivision);
            }
            a / b
        }
        NumberSlot::Negative => -a,
    };
    Ok(ObjRef::alloc(float_type, Body::Float(value)))
}

/// The `None` singleton
pub fn none() -> ObjRef {
    builtins().none.clone()
}

/// New integer
pub fn new_int(value: i64) -> ObjRef {
    ObjRef::alloc(builtins().int, Body::Int(value))
}

/// New float
pub fn new_float(value: f64) -> ObjRef {
    ObjRef::alloc(builtins().float, Body::Float(value))
}

/// New string
pub fn new_str(value: impl Into<String>) -> ObjRef {
    ObjRef::alloc(builtins().str, Body::Str(value.into()))
}

/// New tuple
pub fn new_tuple(items: Vec<ObjRef>) -> ObjRef {
    ObjRef::alloc(builtins().tuple, Body::Tuple(items))
}

/// New keyword dict
pub fn new_dict(entries: Vec<(String, ObjRef)>) -> ObjRef {
    ObjRef::alloc(builtins().dict, Body::Dict(entries))
}

/// New native function
pub fn new_function<F>(name: impl Into<String>, call: F) -> ObjRef
where
    F: Fn(&[ObjRef], &Kwargs) -> CallResult + Send + Sync + 'static,
{
    ObjRef::alloc(
        builtins().function,
        Body::Function(Function {
            name: name.into(),
            call: Box::new(call),
        }),
    )
}

/// New bound method
pub(crate) fn new_method(receiver: ObjRef, function: ObjRef) -> ObjRef {
    ObjRef::alloc(builtins().method, Body::Method { receiver, function })
}

/// Wraps `function` so lookups bind it to the type instead of the instance
pub fn new_classmethod(function: ObjRef) -> ObjRef {
    ObjRef::alloc(builtins().classmethod, Body::ClassMethod(function))
}

/// Wraps `function` so lookups never bind it
pub fn new_staticmethod(function: ObjRef) -> ObjRef {
    ObjRef::alloc(builtins().staticmethod, Body::StaticMethod(function))
}

/// Attribute computed by calling `getter` with the instance
pub fn new_property(getter: ObjRef) -> ObjRef {
    ObjRef::alloc(builtins().property, Body::Property(getter))
}

/// New instance of `ty` with the given attributes
pub fn new_instance<K: Into<String>>(
    ty: &'static TypeObject,
    attrs: impl IntoIterator<Item = (K, ObjRef)>,
) -> ObjRef {
    let attrs: BTreeMap<String, ObjRef> = attrs
        .into_iter()
        .map(|(name, value)| (name.into(), value))
        .collect();
    ObjRef::alloc(ty, Body::Instance(Mutex::new(attrs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{binary_op, contains, get_item, len, negate};

    #[test]
    fn test_int_arithmetic() {
        let sum = binary_op(&new_int(2), &new_int(3), NumberSlot::Add).unwrap();
        assert_eq!(sum.as_int(), Some(5));

        let quotient = binary_op(&new_int(3), &new_int(2), NumberSlot::TrueDivide).unwrap();
        assert_eq!(quotient.as_float(), Some(1.5));
        assert!(std::ptr::eq(quotient.type_object(), builtins().float));

        let negated = negate(&new_int(4)).unwrap();
        assert_eq!(negated.as_int(), Some(-4));

        assert!(matches!(
            binary_op(&new_int(1), &new_int(0), NumberSlot::TrueDivide),
            Err(CallError::ZeroDivision)
        ));
        assert!(matches!(
            binary_op(&new_int(i64::MAX), &new_int(1), NumberSlot::Add),
            Err(CallError::Overflow)
        ));
    }

    #[test]
    /// Mixed arithmetic falls through to the float slot of the right operand
    fn test_mixed_arithmetic() {
        let sum = binary_op(&new_int(1), &new_float(0.5), NumberSlot::Add).unwrap();
        assert_eq!(sum.as_float(), Some(1.5));
    }

    #[test]
    fn test_sequences() {
        let text = new_str("forbidden");
        assert_eq!(len(&text).unwrap(), 9);
        assert!(contains(&text, &new_str("bid")).unwrap());

        let joined = binary_op(&text, &new_str(" fruit"), NumberSlot::Add).unwrap();
        assert_eq!(joined.as_str(), Some("forbidden fruit"));

        let tuple = new_tuple(vec![new_int(1), new_int(2)]);
        assert_eq!(len(&tuple).unwrap(), 2);
        assert_eq!(get_item(&tuple, &new_int(-1)).unwrap().as_int(), Some(2));
        assert!(matches!(get_item(&tuple, &new_int(2)), Err(CallError::Index(_))));

        let dict = new_dict(vec![("x".to_owned(), new_int(3))]);
        assert_eq!(get_item(&dict, &new_str("x")).unwrap().as_int(), Some(3));
        assert!(matches!(get_item(&dict, &new_str("y")), Err(CallError::Key(_))));
    }

    #[test]
    /// Singletons are owned by the runtime and never freed
    fn test_singletons() {
        let first = none();
        let second = none();
        assert!(first.is(&second));
        assert!(first.refcount() >= 3);
        assert!(builtins().not_implemented.is_not_implemented());
    }
}
