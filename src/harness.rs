//! # Harness
//!
//! Reference types used to check that patched-in behavior is indistinguishable from native
//! behavior. Built fresh on every call so checks never observe each other's patches.

use crate::runtime::{
    get_attr, new_dict, new_float, new_function, new_instance, new_int, new_str, new_tuple, none,
    CallError, CallResult, Kwargs, ObjRef, SlotId, TypeBuilder, TypeObject, TypeSlot,
};

/// Type being constructed, passed first to every constructor
fn constructed_type(args: &[ObjRef]) -> Result<&'static TypeObject, CallError> {
    args.first()
        .and_then(ObjRef::as_type)
        .ok_or_else(|| CallError::Type("__new__(X): X is not a type object".to_owned()))
}

/// Echoes its positional arguments, minus the receiver, and its keyword arguments
pub fn echo(args: &[ObjRef], kwargs: &Kwargs) -> CallResult {
    let positional = args.get(1..).unwrap_or_default().to_vec();
    Ok(new_tuple(vec![new_tuple(positional), new_dict(kwargs.to_vec())]))
}

/// Sealed type with `args`, `kwargs` and `my_attr` on every instance and a `my_method` echoing its
/// arguments
pub fn dummy_type() -> Result<&'static TypeObject, region::Error> {
    TypeBuilder::new("Dummy")
        .sealed()
        .slot(
            SlotId::Type(TypeSlot::New),
            new_function("Dummy.__new__", |args, _| {
                let ty = constructed_type(args)?;
                Ok(new_instance(
                    ty,
                    [("args", none()), ("kwargs", none()), ("my_attr", new_int(0))],
                ))
            }),
        )
        .attr("my_method", new_function("Dummy.my_method", echo))
        .build()
}

/// Coordinate of a point as a float
fn coordinate(point: &ObjRef, name: &str) -> Result<f64, CallError> {
    get_attr(point, name)?
        .as_float()
        .ok_or_else(|| CallError::Type(format!("point coordinate '{name}' must be a number")))
}

/// Euclidean distance between the receiver and the first argument
pub fn distance(args: &[ObjRef], _: &Kwargs) -> CallResult {
    let [a, b, ..] = args else {
        return Err(CallError::Type(format!(
            "distance() takes 2 positional arguments but {} were given",
            args.len()
        )));
    };
    let dx = coordinate(a, "x")? - coordinate(b, "x")?;
    let dy = coordinate(a, "y")? - coordinate(b, "y")?;
    Ok(new_float(dx.hypot(dy)))
}

/// `Point(x, y)` representation
pub fn point_repr(args: &[ObjRef], _: &Kwargs) -> CallResult {
    let point = args
        .first()
        .ok_or_else(|| CallError::Type("__repr__ needs a receiver".to_owned()))?;
    let x = get_attr(point, "x")?;
    let y = get_attr(point, "y")?;
    Ok(new_str(format!(
        "Point({}, {})",
        crate::runtime::repr(&x)?,
        crate::runtime::repr(&y)?
    )))
}

/// Sealed native point type built with `x` and `y`. `native_repr` installs [`point_repr`] at
/// build time.
pub fn point_type(native_repr: bool) -> Result<&'static TypeObject, region::Error> {
    let builder = TypeBuilder::new("Point").sealed().slot(
        SlotId::Type(TypeSlot::New),
        new_function("Point.__new__", |args, _| {
            let ty = constructed_type(args)?;
            let [_, x, y] = args else {
                return Err(CallError::Type("Point() takes exactly 2 arguments".to_owned()));
            };
            Ok(new_instance(ty, [("x", x.clone()), ("y", y.clone())]))
        }),
    );
    let builder = if native_repr {
        builder.slot(
            SlotId::Type(TypeSlot::Repr),
            new_function("Point.__repr__", point_repr),
        )
    } else {
        builder
    };
    builder.build()
}
