//! rook-runtime - Value model, heap, and virtual machine for Rook.
//!
//! This crate owns everything that exists at run time:
//!
//! - the [`Value`] representation and heap [`object`]s,
//! - the open-addressed [`Table`] used for interning, globals, fields, and
//!   methods,
//! - [`Chunk`]s of bytecode with their constant pools and line maps,
//! - the [`Heap`] slot arena with its tracing mark-and-sweep collector,
//! - the [`Vm`] dispatch loop and the built-in native functions.
//!
//! The compiler crate drives the same allocator (interned strings, function
//! objects, constants), so the collector's root set includes a compiler-root
//! list populated while compilation is in progress.

pub mod chunk;
pub mod debug;
pub mod error;
pub mod heap;
pub mod line;
pub mod natives;
pub mod object;
pub mod table;
pub mod value;
pub mod vm;

pub use chunk::{Chunk, OpCode};
pub use error::RuntimeError;
pub use heap::Heap;
pub use object::{Obj, ObjFunction, ObjRef, ObjString};
pub use table::Table;
pub use value::{values_equal, ShortString, Value, SHORT_STRING_MAX};
pub use vm::{Vm, FRAMES_MAX};
