//! rook-util - Shared utilities for the Rook interpreter.
//!
//! This crate provides the diagnostic infrastructure used by the scanner and
//! the compiler, plus re-exports of the hash map types the compiler uses for
//! compile-time bookkeeping.

pub mod diagnostic;

pub use diagnostic::{Diagnostic, Handler, Level};

// Re-export commonly used map types
pub use rustc_hash::FxHashMap;
pub use rustc_hash::FxHashSet;
