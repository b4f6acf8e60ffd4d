//! Object headers, bodies and strong references

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, Ordering};

#[cfg(feature = "trace-refs")]
use std::sync::atomic::AtomicPtr;

use parking_lot::Mutex;

use super::types::{TypeFlags, TypeObject};
use super::CallResult;

/// Reference count of an object whose count is never written.
///
/// Type objects may live in read-only pages, so their counts must never be touched.
pub const IMMORTAL_REFCNT: isize = isize::MAX >> 2;

/// Prefix shared by every runtime object
#[repr(C)]
#[derive(Debug)]
pub struct ObjectHead {
    /// Diagnostic link to the next object, only present in instrumented builds
    #[cfg(feature = "trace-refs")]
    pub(crate) next: AtomicPtr<ObjectHead>,
    /// Diagnostic link to the previous object, only present in instrumented builds
    #[cfg(feature = "trace-refs")]
    pub(crate) prev: AtomicPtr<ObjectHead>,
    /// Strong reference count
    pub(crate) refcnt: AtomicIsize,
    /// Type of the object. Never null, never freed.
    pub(crate) ty: *const TypeObject,
}

impl ObjectHead {
    /// Creates a header for an object of type `ty` with the given starting count
    pub(crate) fn new(ty: *const TypeObject, refcnt: isize) -> Self {
        Self {
            #[cfg(feature = "trace-refs")]
            next: AtomicPtr::new(std::ptr::null_mut()),
            #[cfg(feature = "trace-refs")]
            prev: AtomicPtr::new(std::ptr::null_mut()),
            refcnt: AtomicIsize::new(refcnt),
            ty,
        }
    }

    /// Current strong reference count
    pub fn refcount(&self) -> isize {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Whether the count of this object is frozen
    pub fn is_immortal(&self) -> bool {
        self.refcount() >= IMMORTAL_REFCNT
    }

    /// Takes a strong reference
    fn incref(&self) {
        if !self.is_immortal() {
            self.refcnt.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Releases a strong reference. Returns `true` when the last one was released.
    fn decref(&self) -> bool {
        !self.is_immortal() && self.refcnt.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Keyword arguments, in call order
pub type Kwargs = [(String, ObjRef)];

/// Signature of native functions. The receiver, if any, is the first positional argument.
pub type NativeFn = dyn Fn(&[ObjRef], &Kwargs) -> CallResult + Send + Sync;

/// Native function object
pub struct Function {
    /// Name used in reprs and errors
    pub(crate) name: String,
    /// Implementation
    pub(crate) call: Box<NativeFn>,
}

/// Payload of a non-type object
pub enum Body {
    /// The `None` singleton
    None,
    /// The "operation not implemented" singleton
    NotImplemented,
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// String
    Str(String),
    /// Immutable sequence
    Tuple(Vec<ObjRef>),
    /// String-keyed mapping, used for keyword arguments
    Dict(Vec<(String, ObjRef)>),
    /// Native function
    Function(Function),
    /// Function bound to a receiver
    Method {
        /// Object passed as the first argument
        receiver: ObjRef,
        /// Function being bound
        function: ObjRef,
    },
    /// Function bound to the type it is looked up through, even from an instance
    ClassMethod(ObjRef),
    /// Function that is never bound
    StaticMethod(ObjRef),
    /// Computed attribute. The getter receives the instance.
    Property(ObjRef),
    /// Instance of a user-level type with its own attributes
    Instance(Mutex<BTreeMap<String, ObjRef>>),
}

/// Heap layout of every non-type object
#[repr(C)]
pub(crate) struct Object {
    /// Common header. Must stay the first field.
    pub(crate) head: ObjectHead,
    /// Payload
    pub(crate) body: Body,
}

/// Strong reference to a runtime object.
///
/// Cloning takes a new reference, dropping releases it and frees the object when it was the last.
pub struct ObjRef(NonNull<ObjectHead>);

// SAFETY: counts are atomic and bodies are either immutable or behind a lock
unsafe impl Send for ObjRef {}
// SAFETY: see above
unsafe impl Sync for ObjRef {}

impl ObjRef {
    /// Allocates a new object owning a single reference
    pub(crate) fn alloc(ty: &'static TypeObject, body: Body) -> Self {
        let object = Box::new(Object {
            head: ObjectHead::new(ty, 1),
            body,
        });
        // `head` is the first field of a `#[repr(C)]` struct, so the pointers coincide
        Self(NonNull::from(Box::leak(object)).cast())
    }

    /// Reference to a type object. Types are immortal so no count is taken.
    pub fn from_type(ty: &'static TypeObject) -> Self {
        Self(NonNull::from(&ty.head))
    }

    /// Adopts a reference the caller already owns.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to a live object, and the caller must own one strong reference to it
    pub(crate) unsafe fn from_owned(ptr: *mut ObjectHead) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Takes a new reference to a borrowed object.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to a live object
    pub(crate) unsafe fn from_borrowed(ptr: *mut ObjectHead) -> Option<Self> {
        let ptr = NonNull::new(ptr)?;
        ptr.as_ref().incref();
        Some(Self(ptr))
    }

    /// Gives up this reference without releasing it
    pub(crate) fn into_raw(self) -> *mut ObjectHead {
        let ptr = self.0.as_ptr();
        mem::forget(self);
        ptr
    }

    /// Address of the object header
    pub fn as_ptr(&self) -> *mut ObjectHead {
        self.0.as_ptr()
    }

    /// Object header
    pub fn head(&self) -> &ObjectHead {
        // SAFETY: we hold a strong reference, so the object is alive
        unsafe { self.0.as_ref() }
    }

    /// Current strong reference count
    pub fn refcount(&self) -> isize {
        self.head().refcount()
    }

    /// Identity comparison
    pub fn is(&self, other: &ObjRef) -> bool {
        self.0 == other.0
    }

    /// Type of this object
    pub fn type_object(&self) -> &'static TypeObject {
        // SAFETY: type pointers always reference registered, never-freed descriptors
        unsafe { &*self.head().ty }
    }

    /// Name of this object's type
    pub fn type_name(&self) -> &'static str {
        self.type_object().name()
    }

    /// Views this object as a type descriptor
    pub fn as_type(&self) -> Option<&'static TypeObject> {
        if self.type_object().flags().contains(TypeFlags::METATYPE) {
            // SAFETY: instances of a metatype are `TypeObject`s, which are immortal
            Some(unsafe { &*(self.as_ptr() as *const TypeObject) })
        } else {
            None
        }
    }

    /// Payload, or `None` for type objects
    pub fn body(&self) -> Option<&Body> {
        if self.as_type().is_some() {
            return None;
        }
        // SAFETY: every non-type object was allocated as an `Object`
        Some(unsafe { &(*(self.as_ptr() as *const Object)).body })
    }

    /// Integer value
    pub fn as_int(&self) -> Option<i64> {
        match self.body() {
            Some(Body::Int(value)) => Some(*value),
            _ => None,
        }
    }

    /// Float value. Integers are widened.
    pub fn as_float(&self) -> Option<f64> {
        match self.body() {
            Some(Body::Float(value)) => Some(*value),
            Some(Body::Int(value)) => Some(*value as f64),
            _ => None,
        }
    }

    /// String value
    pub fn as_str(&self) -> Option<&str> {
        match self.body() {
            Some(Body::Str(value)) => Some(value),
            _ => None,
        }
    }

    /// Tuple items
    pub fn as_tuple(&self) -> Option<&[ObjRef]> {
        match self.body() {
            Some(Body::Tuple(items)) => Some(items),
            _ => None,
        }
    }

    /// Mapping entries
    pub fn as_dict(&self) -> Option<&[(String, ObjRef)]> {
        match self.body() {
            Some(Body::Dict(entries)) => Some(entries),
            _ => None,
        }
    }

    /// Attribute map of an instance
    pub(crate) fn instance_attrs(&self) -> Option<&Mutex<BTreeMap<String, ObjRef>>> {
        match self.body() {
            Some(Body::Instance(attrs)) => Some(attrs),
            _ => None,
        }
    }

    /// Whether this is the `None` singleton
    pub fn is_none(&self) -> bool {
        matches!(self.body(), Some(Body::None))
    }

    /// Whether this is the NotImplemented singleton
    pub fn is_not_implemented(&self) -> bool {
        matches!(self.body(), Some(Body::NotImplemented))
    }

    /// Whether this is a plain function
    pub fn is_function(&self) -> bool {
        matches!(self.body(), Some(Body::Function(_)))
    }

    /// Whether calling this object can succeed
    pub fn is_callable(&self) -> bool {
        match self.body() {
            None | Some(Body::Function(_)) | Some(Body::Method { .. }) => true,
            Some(_) => self
                .type_object()
                .resolve_slot(super::SlotId::Type(super::TypeSlot::Call))
                .is_some(),
        }
    }

    /// Structural equality for numbers, strings, tuples and dicts; identity otherwise
    pub fn value_eq(&self, other: &ObjRef) -> bool {
        if self.is(other) {
            return true;
        }
        match (self.body(), other.body()) {
            (Some(Body::Int(a)), Some(Body::Int(b))) => a == b,
            (Some(Body::Float(_) | Body::Int(_)), Some(Body::Float(_) | Body::Int(_))) => {
                self.as_float() == other.as_float()
            }
            (Some(Body::Str(a)), Some(Body::Str(b))) => a == b,
            (Some(Body::Tuple(a)), Some(Body::Tuple(b))) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.value_eq(y))
            }
            (Some(Body::Dict(a)), Some(Body::Dict(b))) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.iter()
                            .any(|(other_key, other_value)| key == other_key && value.value_eq(other_value))
                    })
            }
            _ => false,
        }
    }

    /// Repr that never dispatches through slots
    pub(crate) fn default_repr(&self) -> String {
        let Some(body) = self.body() else {
            let name = self.as_type().map_or("?", |ty| ty.name());
            return format!("<class '{name}'>");
        };
        match body {
            Body::None => "None".to_owned(),
            Body::NotImplemented => "NotImplemented".to_owned(),
            Body::Int(value) => value.to_string(),
            Body::Float(value) => format_float(*value),
            Body::Str(value) => format!("'{value}'"),
            Body::Tuple(items) if items.len() == 1 => format!("({},)", items[0].default_repr()),
            Body::Tuple(items) => {
                let items: Vec<_> = items.iter().map(ObjRef::default_repr).collect();
                format!("({})", items.join(", "))
            }
            Body::Dict(entries) => {
                let entries: Vec<_> = entries
                    .iter()
                    .map(|(key, value)| format!("'{key}': {}", value.default_repr()))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            Body::Function(function) => format!("<function {}>", function.name),
            Body::Method { receiver, function } => format!(
                "<bound method {} of {}>",
                function.default_repr(),
                receiver.default_repr()
            ),
            Body::ClassMethod(function) => format!("<classmethod({})>", function.default_repr()),
            Body::StaticMethod(function) => format!("<staticmethod({})>", function.default_repr()),
            Body::Property(_) => format!("<property object at {:#x}>", self.as_ptr() as usize),
            Body::Instance(_) => format!("<{} object at {:#x}>", self.type_name(), self.as_ptr() as usize),
        }
    }
}

/// Formats floats the way the runtime prints them: integral values keep a `.0`
pub(crate) fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

impl Clone for ObjRef {
    fn clone(&self) -> Self {
        self.head().incref();
        Self(self.0)
    }
}

impl Drop for ObjRef {
    fn drop(&mut self) {
        if self.head().decref() {
            // SAFETY: the last reference is gone, and only `Object`s are mortal
            unsafe { drop(Box::from_raw(self.as_ptr() as *mut Object)) }
        }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.default_repr())
    }
}
