//! # Marten runtime core
//!
//! The call-site resolution core of the Marten runtime: adaptive inline
//! caches for method dispatch and constant lookup, revocable assumptions
//! validating them, recursion-safe constant autoload, and the shared-object
//! promotion protocol (write barrier) that keeps the object graph safe to
//! read and mutate from multiple threads.
//!
//! ## Design principles
//!
//! - **Check assumptions, not metadata**: cached bindings are revalidated
//!   with O(1) flag reads, never by re-running the authoritative lookup.
//! - **Invalidate before publishing**: metadata mutators revoke the
//!   assumptions their change breaks before the change is visible.
//! - **Sharing is monotonic**: objects promote to shared shapes exactly
//!   once, transitively, before another thread can observe them.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod assumption;
pub mod autoload;
pub mod constant;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod loader;
pub mod module;
pub mod objectspace;
pub mod shared;
pub mod threads;

pub use assumption::Assumption;
pub use constant::{ConstantSite, LexicalScope};
pub use context::{Options, RuntimeContext};
pub use dispatch::CallSite;
pub use error::{RuntimeError, RuntimeResult};
pub use loader::{FeatureLoader, NullLoader, loader_fn};
pub use module::{ConstantState, Method, MethodLookup, Module, ModuleRegistry};
pub use shared::SharedObjects;
pub use threads::{ThreadRegistration, ThreadRegistry};

pub use marten_object::{Heap, ModuleId, ObjectHandle, ShapeId, SymbolId, Value, ValueKind};
