//! Heap object definitions.
//!
//! Objects live in the [`Heap`](crate::heap::Heap)'s slot arena and are
//! addressed through [`ObjRef`] handles. The arena replaces the intrusive
//! all-objects list a C implementation would thread through every header:
//! the sweep phase iterates the arena in place, and the mark bit lives next
//! to the slot.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// Handle to a heap object: an index into the heap's slot arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// The arena slot index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Signature of a built-in function.
///
/// Natives receive the VM so they can allocate result values; the argument
/// slice is copied out of the stack before the call.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

/// An interned heap string.
///
/// Content and hash are fixed at allocation. Only strings longer than
/// [`SHORT_STRING_MAX`](crate::value::SHORT_STRING_MAX) bytes reach the heap;
/// shorter ones are stored inline in their values.
#[derive(Debug)]
pub struct ObjString {
    /// The string content.
    pub chars: Box<str>,
    /// Precomputed FNV-1a hash of the content.
    pub hash: u32,
}

/// A compiled function.
#[derive(Debug)]
pub struct ObjFunction {
    /// Number of declared parameters.
    pub arity: u8,
    /// Number of variables this function captures.
    pub upvalue_count: usize,
    /// The function's bytecode.
    pub chunk: Chunk,
    /// Function name, absent for the top-level script.
    pub name: Option<ObjRef>,
}

/// A function paired with its captured upvalues.
///
/// Functions that capture nothing are loaded as plain constants and never
/// wrapped; a closure object exists only when `upvalues` is non-empty.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable.
///
/// Open upvalues point at a live stack slot; closing moves the value into
/// the upvalue itself and the stack index becomes meaningless.
#[derive(Debug)]
pub enum ObjUpvalue {
    /// Still on the stack, at this absolute slot index.
    Open(usize),
    /// Hoisted off the stack.
    Closed(Value),
}

/// A built-in function.
#[derive(Clone, Copy, Debug)]
pub struct ObjNative {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
}

/// A class: name, method table, and the cached initializer.
#[derive(Debug)]
pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
    /// Cached `init` method, looked up once when the class body is executed
    /// (and inherited along with the methods).
    pub initializer: Option<ObjRef>,
}

/// An instance of a class with its field table.
#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method bound to a receiver, created by property access.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    /// The method body: a Closure, or a bare Function when it captures
    /// nothing.
    pub method: ObjRef,
}

/// A heap object of any kind.
#[derive(Debug)]
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Native(ObjNative),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl Obj {
    /// Human-readable kind name, used in debug output.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Native(_) => "native",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }

    /// Approximate heap footprint in bytes, used for the collection
    /// threshold. Measured at allocation time; later growth of tables and
    /// upvalue lists is not re-accounted.
    pub fn size_hint(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::String(s) => s.chars.len(),
            Obj::Function(f) => f.chunk.byte_size(),
            Obj::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjRef>(),
            Obj::Class(c) => c.methods.byte_size(),
            Obj::Instance(i) => i.fields.byte_size(),
            Obj::Upvalue(_) | Obj::Native(_) | Obj::BoundMethod(_) => 0,
        }
    }
}
