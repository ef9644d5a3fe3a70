//! # Marten object model
//!
//! Values, interned symbols, shapes and the handle-indexed object heap used
//! by the Marten runtime core.
//!
//! ## Design principles
//!
//! - **Shapes are immutable**: objects change layout by swapping an interned
//!   shape id, never by mutating a shape in place.
//! - **Promotion is a CAS**: the per-object shape id is atomic so that the
//!   unshared-to-shared transition has exactly one winner under races.
//! - **Handles, not pointers**: objects live in an append-only arena and are
//!   referenced by `ObjectHandle`, which keeps graph walks and tests simple.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod graph;
pub mod heap;
pub mod shape;
pub mod symbol;
pub mod value;

pub use heap::{Heap, HeapObject, ObjectHandle};
pub use shape::{ModuleId, Shape, ShapeId, ShapeRegistry};
pub use symbol::{SymbolId, SymbolTable};
pub use value::{Value, ValueKind};
