//! Transformation-tree core for composing GPU kernel templates.
//!
//! A computation declares a fixed set of array/scalar boundary endpoints
//! (its base arguments) and a kernel body that reads and writes them
//! through `_LOAD_*`/`_STORE_*` macros. A [`tree::TransformationTree`] lets
//! a caller attach [`transform::Transformation`]s to those endpoints —
//! scaling, splitting a complex array into separate real/imaginary arrays,
//! feeding a constant instead of reading memory — without touching the
//! computation's own template. [`codegen::transformations_for`] fuses the
//! whole attached tree into one block of macros and helper functions that
//! the computation's kernel source splices in directly, so the extra work
//! happens inline with no temporary buffers.
//!
//! [`vsize::VirtualSizeMapper`] is the tree's companion for the other half
//! of kernel launch: reshaping a logical 1-3D iteration space into a grid
//! that actually fits the target device.

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;

pub mod codegen;
pub mod errors;
pub mod func_collector;
pub mod transform;
pub mod tree;
pub mod value;
pub mod vsize;

pub use codegen::transformations_for;
pub use errors::{Error, ErrorKind, Result};
pub use func_collector::FuncCollector;
pub use transform::Transformation;
pub use tree::{Node, NodeKind, TransformationTree};
pub use value::{ArrayValue, ElemType, ScalarValue, Value};
pub use vsize::{DeviceParams, VirtualSizeMapper};
