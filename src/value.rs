//! Values exchanged between fibers, stored in locals and in heap object fields.
use std::{fmt, sync::Arc};

/// Reference to an object in the collector [Heap](crate::heap::Heap).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ObjectRef(pub(crate) u32);

impl ObjectRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Word stored on fiber stacks. Zero is never a valid reference.
    #[inline]
    pub(crate) fn to_word(self) -> usize {
        self.0 as usize + 1
    }

    #[inline]
    pub(crate) fn from_word(word: usize) -> Option<Self> {
        if word == 0 || word > u32::MAX as usize {
            None
        } else {
            Some(Self((word - 1) as u32))
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Array(Vec<Value>),
    Object(ObjectRef),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Value::Bool(false))
    }

    /// Collapses a hand-off box: empty is nil, a single element is returned as is and
    /// anything longer stays an array.
    pub fn from_args(mut args: Vec<Value>) -> Value {
        match args.len() {
            0 => Value::Nil,
            1 => args.pop().unwrap_or(Value::Nil),
            _ => Value::Array(args),
        }
    }

    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Value::Object(object) => Some(*object),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Calls `f` for every object reference held by this value, arrays included.
    pub fn each_object(&self, f: &mut dyn FnMut(ObjectRef)) {
        match self {
            Value::Object(object) => f(*object),
            Value::Array(values) => {
                for value in values {
                    value.each_object(f);
                }
            }
            _ => (),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl From<i64> for Value {
    fn from(x: i64) -> Self {
        Value::Int(x)
    }
}

impl From<bool> for Value {
    fn from(x: bool) -> Self {
        Value::Bool(x)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(x: &str) -> Self {
        Value::Str(x.into())
    }
}

impl From<ObjectRef> for Value {
    fn from(x: ObjectRef) -> Self {
        Value::Object(x)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Array(values) => {
                write!(f, "[")?;
                for (i, value) in values.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                write!(f, "]")
            }
            Value::Object(object) => write!(f, "#<object {}>", object.0),
        }
    }
}
