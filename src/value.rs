//! The value model: what an endpoint's dtype/shape (or scalar payload) is,
//! once it's known.
//!
//! `ArrayValue`/`ScalarValue` are a two-variant tagged union (`Value`)
//! dispatched by tag rather than by subclass, per the arena design note.

use std::fmt;

/// The generic boundary standing in for the out-of-scope "numerical-type
/// helpers" collaborator. A computation author's concrete dtype type
/// implements this so the tree can promote across inputs and spell types
/// out in generated source, without this crate hard-coding a type system.
pub trait ElemType: Clone + PartialEq + fmt::Debug {
    /// Promote a non-empty list of dtypes to a single result dtype. Used by
    /// the default ("promote across inputs, broadcast result") derivation
    /// sentinel.
    fn promote(types: &[Self]) -> Self;

    /// The C/OpenCL/CUDA spelling of this type, used when rendering macro
    /// and helper-function signatures.
    fn ctype(&self) -> String;

    /// Canonicalizes a dtype just after it's derived from a node's children
    /// during `propagate_to_base` (e.g. folding distinct-but-equivalent
    /// dtypes, such as a sized and an unsized alias for the same C type, to
    /// one canonical representative). Most `ElemType` implementations have
    /// no such aliasing to collapse, so the default is the identity.
    fn normalize(self) -> Self {
        self
    }
}

/// An array endpoint's shape and dtype. `size` is kept consistent with
/// `shape` on every mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayValue<D> {
    shape: Option<Vec<usize>>,
    dtype: Option<D>,
}

impl<D: ElemType> ArrayValue<D> {
    pub fn new(shape: Option<Vec<usize>>, dtype: Option<D>) -> Self {
        ArrayValue { shape, dtype }
    }

    pub fn empty() -> Self {
        ArrayValue { shape: None, dtype: None }
    }

    pub fn shape(&self) -> Option<&[usize]> {
        self.shape.as_deref()
    }

    pub fn set_shape(&mut self, shape: Option<Vec<usize>>) {
        self.shape = shape;
    }

    /// `∏ shape`, or `None` if the shape isn't known yet.
    pub fn size(&self) -> Option<usize> {
        self.shape.as_ref().map(|s| s.iter().product())
    }

    pub fn dtype(&self) -> Option<&D> {
        self.dtype.as_ref()
    }

    pub fn set_dtype(&mut self, dtype: Option<D>) {
        self.dtype = dtype;
    }

    pub fn fill_with(&mut self, other: &ArrayValue<D>) {
        self.shape = other.shape.clone();
        self.dtype = other.dtype.clone();
    }

    pub fn clear(&mut self) {
        self.shape = None;
        self.dtype = None;
    }
}

/// A scalar endpoint's dtype and an opaque literal payload `L`. This crate
/// never interprets `L`; it is stored, copied and cleared on the caller's
/// behalf only (see DESIGN.md, Open Question 1).
#[derive(Clone, Debug, PartialEq)]
pub struct ScalarValue<D, L> {
    value: Option<L>,
    dtype: Option<D>,
}

impl<D: ElemType, L: Clone> ScalarValue<D, L> {
    pub fn new(value: Option<L>, dtype: Option<D>) -> Self {
        ScalarValue { value, dtype }
    }

    pub fn empty() -> Self {
        ScalarValue { value: None, dtype: None }
    }

    pub fn value(&self) -> Option<&L> {
        self.value.as_ref()
    }

    pub fn dtype(&self) -> Option<&D> {
        self.dtype.as_ref()
    }

    pub fn set_dtype(&mut self, dtype: Option<D>) {
        self.dtype = dtype;
    }

    pub fn fill_with(&mut self, other: &ScalarValue<D, L>) {
        self.value = other.value.clone();
        self.dtype = other.dtype.clone();
    }

    pub fn clear(&mut self) {
        self.value = None;
        self.dtype = None;
    }
}

/// The tagged union of the two value kinds. Dispatch is by matching on the
/// variant, not by subclassing.
#[derive(Clone, Debug, PartialEq)]
pub enum Value<D, L> {
    Array(ArrayValue<D>),
    Scalar(ScalarValue<D, L>),
}

impl<D: ElemType, L: Clone> Value<D, L> {
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn dtype(&self) -> Option<&D> {
        match self {
            Value::Array(a) => a.dtype(),
            Value::Scalar(s) => s.dtype(),
        }
    }

    pub fn set_dtype(&mut self, dtype: Option<D>) {
        match self {
            Value::Array(a) => a.set_dtype(dtype),
            Value::Scalar(s) => s.set_dtype(dtype),
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue<D>> {
        match self {
            Value::Array(a) => Some(a),
            Value::Scalar(_) => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut ArrayValue<D>> {
        match self {
            Value::Array(a) => Some(a),
            Value::Scalar(_) => None,
        }
    }

    pub fn fill_with(&mut self, other: &Value<D, L>) {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => a.fill_with(b),
            (Value::Scalar(a), Value::Scalar(b)) => a.fill_with(b),
            _ => unreachable!("fill_with between mismatched value kinds"),
        }
    }

    pub fn clear(&mut self) {
        match self {
            Value::Array(a) => a.clear(),
            Value::Scalar(s) => s.clear(),
        }
    }
}
