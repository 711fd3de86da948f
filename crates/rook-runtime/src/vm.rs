//! The virtual machine: value stack, call frames, dispatch loop, and
//! collection orchestration.
//!
//! The VM owns the heap and both tables (the weak intern set and the
//! globals), so it is the only place that decides when to collect and what
//! the roots are. The compiler drives the same allocator while it runs;
//! objects it creates stay reachable through the compiler-root list until
//! compilation commits.

use crate::chunk::OpCode;
use crate::error::RuntimeError;
use crate::heap::Heap;
use crate::natives;
use crate::object::{
    Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjNative, ObjRef, ObjString,
    ObjUpvalue, NativeFn,
};
use crate::table::Table;
use crate::value::{hash_bytes, values_equal, Value, SHORT_STRING_MAX};

/// Maximum number of simultaneously active call frames, the top-level
/// script included.
pub const FRAMES_MAX: usize = 64;

/// One in-progress call.
#[derive(Debug)]
struct CallFrame {
    /// The running Closure, or a bare Function when nothing is captured.
    callee: ObjRef,
    /// Offset of the next instruction in the callee's chunk. Kept in a
    /// local during dispatch and written back on calls, returns, and
    /// errors.
    ip: usize,
    /// Stack index of slot zero: the callee or the bound receiver.
    base: usize,
}

/// The Rook virtual machine.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues, ordered by descending stack slot; at most one per
    /// slot.
    open_upvalues: Vec<ObjRef>,
    heap: Heap,
    /// Weak intern set: at most one heap string per content.
    strings: Table,
    globals: Table,
    /// Interned `"init"`, used to cache class initializers.
    init_string: ObjRef,
    /// Objects created by an in-progress compilation; part of the GC root
    /// set until the compiler commits.
    compiler_roots: Vec<Value>,
}

impl Vm {
    /// Creates a VM with the native registry installed.
    pub fn new() -> Vm {
        let mut heap = Heap::new();
        let mut strings = Table::new();

        // Interned directly so the field never holds a placeholder; nothing
        // can collect before the VM exists.
        let hash = hash_bytes(b"init");
        let init_string = heap.insert(Obj::String(ObjString {
            chars: "init".into(),
            hash,
        }));
        strings.set(init_string, hash, Value::Nil);

        let mut vm = Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            heap,
            strings,
            globals: Table::new(),
            init_string,
            compiler_roots: Vec::new(),
        };

        vm.define_native("clock", 0, natives::clock_native);
        vm.define_native("env", 1, natives::env_native);
        vm.define_native("rand", 2, natives::rand_native);
        vm.define_native("exit", 1, natives::exit_native);
        vm
    }

    /// Read access to the heap, for disassembly and tests.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // ------------------------------------------------------------------
    // Allocation and interning
    // ------------------------------------------------------------------

    /// Allocates a heap object, collecting first when the heap has grown
    /// past its threshold. Everything that must survive has to be reachable
    /// from a root before this is called.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.should_collect(obj.size_hint()) {
            self.collect_garbage();
        }
        self.heap.insert(obj)
    }

    /// Returns the unique heap string with this content, allocating it on
    /// first use.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = hash_bytes(chars.as_bytes());
        if let Some(existing) = self.strings.find_string(&self.heap, chars, hash) {
            return existing;
        }
        let string = self.alloc(Obj::String(ObjString {
            chars: chars.into(),
            hash,
        }));
        self.strings.set(string, hash, Value::Nil);
        string
    }

    /// Builds a string value: inline when it fits, interned otherwise.
    pub fn string_value(&mut self, chars: &str) -> Value {
        if chars.len() <= SHORT_STRING_MAX {
            Value::short_str(chars)
        } else {
            Value::Obj(self.intern(chars))
        }
    }

    /// The content of a string value, inline or heap; `None` for
    /// non-strings.
    pub fn value_as_string(&self, value: Value) -> Option<String> {
        match value {
            Value::Str(s) => Some(s.as_str().to_string()),
            Value::Obj(r) => match self.heap.get(r) {
                Obj::String(s) => Some(s.chars.to_string()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Renders a value for `print` and error messages.
    pub fn display_value(&self, value: Value) -> String {
        self.heap.value_to_string(value)
    }

    /// Defines (or overwrites) a global binding.
    pub fn define_global(&mut self, name: &str, value: Value) {
        let name_ref = self.intern(name);
        self.push(Value::Obj(name_ref));
        self.push(value);
        let hash = self.heap.string(name_ref).hash;
        self.globals.set(name_ref, hash, value);
        self.pop();
        self.pop();
    }

    /// Looks up a global by name. Mainly useful for tests and embedders.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let hash = hash_bytes(name.as_bytes());
        let key = self.strings.find_string(&self.heap, name, hash)?;
        self.globals.get(key, hash)
    }

    fn define_native(&mut self, name: &'static str, arity: u8, function: NativeFn) {
        let name_ref = self.intern(name);
        self.push(Value::Obj(name_ref));
        let native = self.alloc(Obj::Native(ObjNative {
            name,
            arity,
            function,
        }));
        self.push(Value::Obj(native));
        let hash = self.heap.string(name_ref).hash;
        self.globals.set(name_ref, hash, Value::Obj(native));
        self.pop();
        self.pop();
    }

    // ------------------------------------------------------------------
    // Compiler roots
    // ------------------------------------------------------------------

    /// Roots a value created during compilation. The chunk under
    /// construction is not a heap object yet, so its constants are not
    /// otherwise reachable.
    pub fn push_compiler_root(&mut self, value: Value) {
        self.compiler_roots.push(value);
    }

    /// Drops the compiler roots; called when compilation commits or is
    /// abandoned.
    pub fn clear_compiler_roots(&mut self) {
        self.compiler_roots.clear();
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    /// Forces a full collection cycle.
    pub fn collect_now(&mut self) {
        self.collect_garbage();
    }

    fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated();
        tracing::debug!(bytes_allocated = before, "gc cycle begin");

        // Roots: the stack, frame callees, open upvalues, globals (keys and
        // values), the interned "init" string, and whatever the compiler is
        // holding.
        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark(frame.callee);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark(upvalue);
        }
        for (key, _, value) in self.globals.entries() {
            self.heap.mark(key);
            self.heap.mark_value(value);
        }
        self.heap.mark(self.init_string);
        for &value in &self.compiler_roots {
            self.heap.mark_value(value);
        }

        self.heap.trace();

        // The intern set is weak: drop entries for strings about to die.
        self.strings.remove_unmarked(|r| self.heap.is_marked(r));

        let (freed, freed_bytes) = self.heap.sweep();
        tracing::debug!(
            freed,
            freed_bytes,
            bytes_allocated = self.heap.bytes_allocated(),
            next_gc = self.heap.next_gc(),
            "gc cycle end"
        );
    }

    // ------------------------------------------------------------------
    // Stack
    // ------------------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => panic!("value stack underflow"),
        }
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Runs a compiled top-level script function to completion.
    pub fn run(&mut self, script: ObjRef) -> Result<(), RuntimeError> {
        self.push(Value::Obj(script));
        if let Err(message) = self.call(script, 0) {
            return Err(self.fail(0, message));
        }
        self.execute()
    }

    fn execute(&mut self) -> Result<(), RuntimeError> {
        let (mut callee, mut func, mut base, mut ip) = self.frame_snapshot();

        loop {
            #[cfg(feature = "trace-execution")]
            {
                let function = self.heap.function(func);
                let (text, _) = crate::debug::disassemble_instruction(&self.heap, &function.chunk, ip);
                tracing::trace!(depth = self.stack.len(), "{}", text.trim_end());
            }

            let byte = self.code_byte(func, ip);
            ip += 1;
            let op = match OpCode::from_byte(byte) {
                Some(op) => op,
                None => panic!("invalid opcode byte {byte}"),
            };

            match op {
                OpCode::Constant | OpCode::ConstantLong => {
                    let index = self.read_index(func, &mut ip, op == OpCode::ConstantLong);
                    let value = self.constant(func, index);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.code_byte(func, ip) as usize;
                    ip += 1;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.code_byte(func, ip) as usize;
                    ip += 1;
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let index = self.read_index(func, &mut ip, op == OpCode::GetGlobalLong);
                    let name = self.constant_string(func, index);
                    if let Err(message) = self.op_get_global(name) {
                        return Err(self.fail(ip, message));
                    }
                }
                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let index = self.read_index(func, &mut ip, op == OpCode::DefineGlobalLong);
                    let name = self.constant_string(func, index);
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let index = self.read_index(func, &mut ip, op == OpCode::SetGlobalLong);
                    let name = self.constant_string(func, index);
                    if let Err(message) = self.op_set_global(name) {
                        return Err(self.fail(ip, message));
                    }
                }

                OpCode::GetUpvalue => {
                    let slot = self.code_byte(func, ip) as usize;
                    ip += 1;
                    let upvalue = self.heap.closure(callee).upvalues[slot];
                    let value = match *self.heap.upvalue(upvalue) {
                        ObjUpvalue::Open(index) => self.stack[index],
                        ObjUpvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.code_byte(func, ip) as usize;
                    ip += 1;
                    let upvalue = self.heap.closure(callee).upvalues[slot];
                    let value = self.peek(0);
                    match *self.heap.upvalue(upvalue) {
                        ObjUpvalue::Open(index) => self.stack[index] = value,
                        ObjUpvalue::Closed(_) => {
                            *self.heap.upvalue_mut(upvalue) = ObjUpvalue::Closed(value)
                        }
                    }
                }

                OpCode::GetProp | OpCode::GetPropLong | OpCode::GetPropStr => {
                    let index = self.read_index(func, &mut ip, op == OpCode::GetPropLong);
                    let name = self.resolve_name_constant(func, index);
                    if let Err(message) = self.op_get_property(name) {
                        return Err(self.fail(ip, message));
                    }
                }
                OpCode::SetProp | OpCode::SetPropLong | OpCode::SetPropStr => {
                    let index = self.read_index(func, &mut ip, op == OpCode::SetPropLong);
                    let name = self.resolve_name_constant(func, index);
                    if let Err(message) = self.op_set_property(name) {
                        return Err(self.fail(ip, message));
                    }
                }

                OpCode::GetSuper | OpCode::GetSuperLong => {
                    let index = self.read_index(func, &mut ip, op == OpCode::GetSuperLong);
                    let name = self.constant_string(func, index);
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        other => panic!("superclass slot holds {:?}", other),
                    };
                    if let Err(message) = self.bind_method(superclass, name) {
                        return Err(self.fail(ip, message));
                    }
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(values_equal(a, b)));
                }
                OpCode::Cmp => {
                    // Like Equal, but the left operand stays put for the
                    // next case test.
                    let b = self.pop();
                    let a = self.peek(0);
                    self.push(Value::Bool(values_equal(a, b)));
                }
                OpCode::Greater => {
                    if let Err(message) = self.binary_number_op(|a, b| Value::Bool(a > b)) {
                        return Err(self.fail(ip, message));
                    }
                }
                OpCode::Less => {
                    if let Err(message) = self.binary_number_op(|a, b| Value::Bool(a < b)) {
                        return Err(self.fail(ip, message));
                    }
                }

                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    if let (Value::Number(x), Value::Number(y)) = (a, b) {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(x + y));
                    } else if let Err(message) = self.concatenate() {
                        return Err(self.fail(ip, message));
                    }
                }
                OpCode::Subtract => {
                    if let Err(message) = self.binary_number_op(|a, b| Value::Number(a - b)) {
                        return Err(self.fail(ip, message));
                    }
                }
                OpCode::Multiply => {
                    if let Err(message) = self.binary_number_op(|a, b| Value::Number(a * b)) {
                        return Err(self.fail(ip, message));
                    }
                }
                OpCode::Divide => {
                    if let Err(message) = self.binary_number_op(|a, b| Value::Number(a / b)) {
                        return Err(self.fail(ip, message));
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.fail(ip, "Operand must be a number.".to_string())),
                },

                OpCode::Print => {
                    let value = self.pop();
                    println!("{}", self.display_value(value));
                }

                OpCode::Jump => {
                    let offset = self.read_u16_at(func, ip) as usize;
                    ip += 2;
                    ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16_at(func, ip) as usize;
                    ip += 2;
                    if self.peek(0).is_falsey() {
                        ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16_at(func, ip) as usize;
                    ip += 2;
                    ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.code_byte(func, ip) as usize;
                    ip += 1;
                    self.store_ip(ip);
                    let callee_value = self.peek(arg_count);
                    if let Err(message) = self.call_value(callee_value, arg_count) {
                        return Err(self.fail(ip, message));
                    }
                    (callee, func, base, ip) = self.frame_snapshot();
                }

                OpCode::Invoke | OpCode::InvokeLong => {
                    let index = self.read_index(func, &mut ip, op == OpCode::InvokeLong);
                    let arg_count = self.code_byte(func, ip) as usize;
                    ip += 1;
                    let name = self.constant_string(func, index);
                    self.store_ip(ip);
                    if let Err(message) = self.invoke(name, arg_count) {
                        return Err(self.fail(ip, message));
                    }
                    (callee, func, base, ip) = self.frame_snapshot();
                }

                OpCode::SuperInvoke | OpCode::SuperInvokeLong => {
                    let index = self.read_index(func, &mut ip, op == OpCode::SuperInvokeLong);
                    let arg_count = self.code_byte(func, ip) as usize;
                    ip += 1;
                    let name = self.constant_string(func, index);
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        other => panic!("superclass slot holds {:?}", other),
                    };
                    self.store_ip(ip);
                    let hash = self.heap.string(name).hash;
                    if let Err(message) = self.invoke_from_class(superclass, name, hash, arg_count)
                    {
                        return Err(self.fail(ip, message));
                    }
                    (callee, func, base, ip) = self.frame_snapshot();
                }

                OpCode::Closure | OpCode::ClosureLong => {
                    let index = self.read_index(func, &mut ip, op == OpCode::ClosureLong);
                    let function_ref = match self.constant(func, index) {
                        Value::Obj(r) => r,
                        other => panic!("closure constant holds {:?}", other),
                    };
                    let upvalue_count = self.heap.function(function_ref).upvalue_count;
                    let closure = self.alloc(Obj::Closure(ObjClosure {
                        function: function_ref,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // Rooted before the upvalue allocations below can
                    // trigger a collection.
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.code_byte(func, ip) != 0;
                        ip += 1;
                        let index = self.code_byte(func, ip) as usize;
                        ip += 1;
                        let upvalue = if is_local {
                            self.capture_upvalue(base + index)
                        } else {
                            self.heap.closure(callee).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }

                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = match self.frames.pop() {
                        Some(frame) => frame,
                        None => panic!("return with no active frame"),
                    };
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        // The slot holding the script function
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                    (callee, func, base, ip) = self.frame_snapshot();
                }

                OpCode::Class | OpCode::ClassLong => {
                    let index = self.read_index(func, &mut ip, op == OpCode::ClassLong);
                    let name = self.constant_string(func, index);
                    let class = self.alloc(Obj::Class(ObjClass {
                        name,
                        methods: Table::new(),
                        initializer: None,
                    }));
                    self.push(Value::Obj(class));
                }

                OpCode::Inherit => {
                    if let Err(message) = self.op_inherit() {
                        return Err(self.fail(ip, message));
                    }
                }

                OpCode::Method | OpCode::MethodLong => {
                    let index = self.read_index(func, &mut ip, op == OpCode::MethodLong);
                    let name = self.constant_string(func, index);
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Obj(r) => r,
                        other => panic!("method below class slot holds {:?}", other),
                    };
                    let hash = self.heap.string(name).hash;
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }

                OpCode::Init => {
                    let class = match self.peek(0) {
                        Value::Obj(r) => r,
                        other => panic!("init on non-class {:?}", other),
                    };
                    let init_name = self.init_string;
                    let hash = self.heap.string(init_name).hash;
                    let initializer = match self.heap.class(class).methods.get(init_name, hash) {
                        Some(Value::Obj(method)) => Some(method),
                        _ => None,
                    };
                    self.heap.class_mut(class).initializer = initializer;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Operand and frame helpers
    // ------------------------------------------------------------------

    fn frame_snapshot(&self) -> (ObjRef, ObjRef, usize, usize) {
        let frame = match self.frames.last() {
            Some(frame) => frame,
            None => panic!("no active call frame"),
        };
        let func = self.underlying_function(frame.callee);
        (frame.callee, func, frame.base, frame.ip)
    }

    fn store_ip(&mut self, ip: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = ip;
        }
    }

    fn underlying_function(&self, callee: ObjRef) -> ObjRef {
        match self.heap.get(callee) {
            Obj::Function(_) => callee,
            Obj::Closure(c) => c.function,
            other => panic!("frame callee is {}", other.kind_name()),
        }
    }

    fn code_byte(&self, func: ObjRef, ip: usize) -> u8 {
        self.heap.function(func).chunk.code[ip]
    }

    fn read_u16_at(&self, func: ObjRef, ip: usize) -> u16 {
        self.heap.function(func).chunk.read_u16(ip)
    }

    fn read_index(&self, func: ObjRef, ip: &mut usize, long: bool) -> usize {
        if long {
            let value = self.read_u16_at(func, *ip) as usize;
            *ip += 2;
            value
        } else {
            let value = self.code_byte(func, *ip) as usize;
            *ip += 1;
            value
        }
    }

    fn constant(&self, func: ObjRef, index: usize) -> Value {
        self.heap.function(func).chunk.constants[index]
    }

    /// A constant that must be an interned string (a name).
    fn constant_string(&self, func: ObjRef, index: usize) -> ObjRef {
        match self.constant(func, index) {
            Value::Obj(r) => r,
            other => panic!("name constant holds {:?}", other),
        }
    }

    /// A name constant that may be an inline short string (`*PropStr`
    /// forms); interned on access so tables stay keyed by heap strings.
    fn resolve_name_constant(&mut self, func: ObjRef, index: usize) -> ObjRef {
        match self.constant(func, index) {
            Value::Obj(r) => r,
            Value::Str(s) => self.intern(s.as_str()),
            other => panic!("name constant holds {:?}", other),
        }
    }

    // ------------------------------------------------------------------
    // Opcode bodies
    // ------------------------------------------------------------------

    fn binary_number_op(&mut self, op: impl FnOnce(f64, f64) -> Value) -> Result<(), String> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err("Operands must be numbers.".to_string());
        };
        self.pop();
        self.pop();
        self.push(op(a, b));
        Ok(())
    }

    fn concatenate(&mut self) -> Result<(), String> {
        let left = self.value_as_string(self.peek(1));
        let right = self.value_as_string(self.peek(0));
        let (Some(mut left), Some(right)) = (left, right) else {
            return Err("Operands must be two numbers or two strings.".to_string());
        };
        left.push_str(&right);
        // Operands stay on the stack until the result is live.
        let result = self.string_value(&left);
        self.pop();
        self.pop();
        self.push(result);
        Ok(())
    }

    fn op_get_global(&mut self, name: ObjRef) -> Result<(), String> {
        let hash = self.heap.string(name).hash;
        match self.globals.get(name, hash) {
            Some(value) => {
                self.push(value);
                Ok(())
            }
            None => Err(format!(
                "Undefined variable '{}'.",
                self.heap.string(name).chars
            )),
        }
    }

    fn op_set_global(&mut self, name: ObjRef) -> Result<(), String> {
        let hash = self.heap.string(name).hash;
        let value = self.peek(0);
        if self.globals.set(name, hash, value) {
            // Assignment must not create the binding.
            self.globals.delete(name, hash);
            return Err(format!(
                "Undefined variable '{}'.",
                self.heap.string(name).chars
            ));
        }
        Ok(())
    }

    fn instance_ref(&self, value: Value) -> Option<ObjRef> {
        match value {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => Some(r),
            _ => None,
        }
    }

    fn op_get_property(&mut self, name: ObjRef) -> Result<(), String> {
        let Some(instance) = self.instance_ref(self.peek(0)) else {
            return Err("Only instances have properties.".to_string());
        };
        let hash = self.heap.string(name).hash;
        if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
            self.pop();
            self.push(value);
            return Ok(());
        }
        let class = self.heap.instance(instance).class;
        self.bind_method(class, name)
    }

    fn op_set_property(&mut self, name: ObjRef) -> Result<(), String> {
        let Some(instance) = self.instance_ref(self.peek(1)) else {
            return Err("Only instances have fields.".to_string());
        };
        let hash = self.heap.string(name).hash;
        let value = self.peek(0);
        self.heap.instance_mut(instance).fields.set(name, hash, value);
        let value = self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), String> {
        let hash = self.heap.string(name).hash;
        match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => {
                let receiver = self.peek(0);
                let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }));
                self.pop();
                self.push(Value::Obj(bound));
                Ok(())
            }
            Some(other) => panic!("method table holds {:?}", other),
            None => Err(format!(
                "Undefined property '{}'.",
                self.heap.string(name).chars
            )),
        }
    }

    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), String> {
        let Some(instance) = self.instance_ref(self.peek(arg_count)) else {
            return Err("Only instances have methods.".to_string());
        };
        let hash = self.heap.string(name).hash;
        // A field shadowing a method is called as a plain value.
        if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }
        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, hash, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        hash: u32,
        arg_count: usize,
    ) -> Result<(), String> {
        match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => self.call(method, arg_count),
            Some(other) => panic!("method table holds {:?}", other),
            None => Err(format!(
                "Undefined property '{}'.",
                self.heap.string(name).chars
            )),
        }
    }

    fn op_inherit(&mut self) -> Result<(), String> {
        let superclass = match self.peek(1) {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
            _ => return Err("Superclass must be a class.".to_string()),
        };
        let subclass = match self.peek(0) {
            Value::Obj(r) => r,
            other => panic!("inherit on {:?}", other),
        };
        let methods: Vec<(ObjRef, u32, Value)> =
            self.heap.class(superclass).methods.entries().collect();
        let initializer = self.heap.class(superclass).initializer;
        {
            let subclass = self.heap.class_mut(subclass);
            for (key, hash, value) in methods {
                subclass.methods.set(key, hash, value);
            }
            subclass.initializer = initializer;
        }
        self.pop();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), String> {
        let Value::Obj(r) = callee else {
            return Err("Can only call functions and classes.".to_string());
        };
        match self.heap.get(r) {
            Obj::Function(_) | Obj::Closure(_) => self.call(r, arg_count),
            Obj::Class(_) => {
                // The class in the callee slot keeps itself alive across
                // this allocation; the new instance replaces it.
                let instance = self.alloc(Obj::Instance(ObjInstance {
                    class: r,
                    fields: Table::new(),
                }));
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = Value::Obj(instance);
                let initializer = self.heap.class(r).initializer;
                match initializer {
                    Some(init) => self.call(init, arg_count),
                    None if arg_count != 0 => {
                        Err(format!("Expected 0 arguments but got {}.", arg_count))
                    }
                    None => Ok(()),
                }
            }
            Obj::Native(native) => {
                let native = *native;
                self.call_native(native, arg_count)
            }
            Obj::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call(method, arg_count)
            }
            _ => Err("Can only call functions and classes.".to_string()),
        }
    }

    fn call(&mut self, callee: ObjRef, arg_count: usize) -> Result<(), String> {
        let function = self.underlying_function(callee);
        let arity = self.heap.function(function).arity as usize;
        if arg_count != arity {
            return Err(format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            ));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        self.frames.push(CallFrame {
            callee,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_native(&mut self, native: ObjNative, arg_count: usize) -> Result<(), String> {
        if arg_count != native.arity as usize {
            return Err(format!(
                "Expected {} arguments but got {}.",
                native.arity, arg_count
            ));
        }
        let first = self.stack.len() - arg_count;
        let args: Vec<Value> = self.stack[first..].to_vec();
        let result = (native.function)(self, &args)?;
        self.stack.truncate(first - 1);
        self.push(result);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Upvalues
    // ------------------------------------------------------------------

    /// Finds or creates the open upvalue for an absolute stack slot,
    /// keeping the list ordered by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            match *self.heap.upvalue(upvalue) {
                ObjUpvalue::Open(existing) if existing == slot => return upvalue,
                ObjUpvalue::Open(existing) if existing < slot => {
                    insert_at = i;
                    break;
                }
                ObjUpvalue::Open(_) => {}
                ObjUpvalue::Closed(_) => panic!("closed upvalue on the open list"),
            }
        }
        let created = self.alloc(Obj::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Closes every open upvalue at or above `threshold`, copying the stack
    /// value into the upvalue.
    fn close_upvalues(&mut self, threshold: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match *self.heap.upvalue(upvalue) {
                ObjUpvalue::Open(slot) => slot,
                ObjUpvalue::Closed(_) => panic!("closed upvalue on the open list"),
            };
            if slot < threshold {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(upvalue) = ObjUpvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Reports a runtime error with a stack trace and resets the machine.
    fn fail(&mut self, ip: usize, message: String) -> RuntimeError {
        self.store_ip(ip);

        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let func = self.underlying_function(frame.callee);
            let function = self.heap.function(func);
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            let location = match function.name {
                Some(name) => format!("{}()", self.heap.string(name).chars),
                None => "script".to_string(),
            };
            trace.push(format!("[line {}] in {}", line, location));
        }

        eprintln!("{}", message);
        for line in &trace {
            eprintln!("{}", line);
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        RuntimeError { message, trace }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
