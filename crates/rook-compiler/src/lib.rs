//! rook-compiler - Single-pass compiler for the Rook language.
//!
//! Parsing, scope resolution, and code generation happen in one pass: the
//! Pratt expression parser and the statement parser emit bytecode directly
//! into the chunk of the function under construction. There is no AST.
//!
//! The compiler allocates through the VM it is given - interned identifier
//! and literal strings, and one function object per compiled function - and
//! keeps everything it creates on the VM's compiler-root list so a
//! collection triggered mid-compile cannot reclaim it.

mod expr;
mod scope;
mod stmt;

use thiserror::Error;

use rook_lex::{Scanner, Token, TokenKind};
use rook_runtime::object::ObjFunction;
use rook_runtime::{Chunk, Obj, ObjRef, OpCode, Value, Vm};
use rook_util::{Diagnostic, FxHashSet, Handler};

use scope::{ClassCompiler, FunctionCompiler, FunctionKind};

/// Compilation failed. The individual diagnostics have already been written
/// to standard error.
#[derive(Debug, Error)]
#[error("{errors} compile error(s)")]
pub struct CompileError {
    pub errors: usize,
}

/// Compiles a source string into a top-level script function.
///
/// On success the returned function has arity 0 and no name, ready for
/// [`Vm::run`]. On failure every diagnostic has been reported through the
/// handler and the partial compilation is discarded.
pub fn compile(source: &str, vm: &mut Vm) -> Result<ObjRef, CompileError> {
    vm.clear_compiler_roots();

    let mut parser = Parser::new(source, vm);
    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.end_compiler();

    let errors = parser.handler.error_count();
    parser.vm.clear_compiler_roots();

    if errors > 0 {
        Err(CompileError { errors })
    } else {
        Ok(function)
    }
}

/// Parser state shared by the expression and statement modules.
pub(crate) struct Parser<'src, 'vm> {
    scanner: Scanner<'src>,
    pub(crate) current: Token<'src>,
    pub(crate) previous: Token<'src>,
    pub(crate) handler: Handler,
    panic_mode: bool,
    pub(crate) vm: &'vm mut Vm,
    /// Stack of functions under construction; the last entry is current.
    pub(crate) compilers: Vec<FunctionCompiler<'src>>,
    /// Stack of enclosing class bodies.
    pub(crate) classes: Vec<ClassCompiler>,
    /// Names bound with top-level `let` in this compilation unit.
    pub(crate) readonly_globals: FxHashSet<&'src str>,
}

impl<'src, 'vm> Parser<'src, 'vm> {
    fn new(source: &'src str, vm: &'vm mut Vm) -> Parser<'src, 'vm> {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        };
        Parser {
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            handler: Handler::new(),
            panic_mode: false,
            vm,
            compilers: vec![FunctionCompiler::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            readonly_globals: FxHashSet::default(),
        }
    }

    // ------------------------------------------------------------------
    // Token stream
    // ------------------------------------------------------------------

    pub(crate) fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if let TokenKind::Error(message) = self.current.kind {
                self.error_at_current(message);
            } else {
                break;
            }
        }
    }

    pub(crate) fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    pub(crate) fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    pub(crate) fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    pub(crate) fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    pub(crate) fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        // Panic mode suppresses cascades until the next statement boundary.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        let mut diagnostic = Diagnostic::error(token.line, message);
        match token.kind {
            TokenKind::Eof => diagnostic = diagnostic.at_end(),
            // Error tokens describe themselves
            TokenKind::Error(_) => {}
            _ => diagnostic = diagnostic.at_lexeme(token.lexeme),
        }
        self.handler.emit(diagnostic);
    }

    pub(crate) fn panic_mode(&self) -> bool {
        self.panic_mode
    }

    pub(crate) fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            if self.current.kind.starts_statement() {
                return;
            }
            self.advance();
        }
    }

    // ------------------------------------------------------------------
    // Compiler stack
    // ------------------------------------------------------------------

    pub(crate) fn compiler(&self) -> &FunctionCompiler<'src> {
        self.compilers.last().expect("compiler stack is empty")
    }

    pub(crate) fn compiler_mut(&mut self) -> &mut FunctionCompiler<'src> {
        self.compilers.last_mut().expect("compiler stack is empty")
    }

    pub(crate) fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.compiler_mut().chunk
    }

    /// Finishes the current function: emits the implicit return, allocates
    /// the function object, and roots it for the rest of the compilation.
    /// Returns the function and its upvalue metadata for the enclosing
    /// compiler to encode.
    pub(crate) fn end_compiler(&mut self) -> (ObjRef, Vec<scope::UpvalueMeta>) {
        self.emit_return();
        let compiler = match self.compilers.pop() {
            Some(compiler) => compiler,
            None => panic!("compiler stack is empty"),
        };
        let upvalues = compiler.upvalues;
        let function_ref = self.vm.alloc(Obj::Function(ObjFunction {
            arity: compiler.arity.min(255) as u8,
            upvalue_count: upvalues.len(),
            chunk: compiler.chunk,
            name: compiler.name,
        }));
        self.vm.push_compiler_root(Value::Obj(function_ref));
        (function_ref, upvalues)
    }

    /// The implicit return: `this` from an initializer, `nil` elsewhere.
    pub(crate) fn emit_return(&mut self) {
        if self.compiler().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    pub(crate) fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    pub(crate) fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_chunk().write_op(op, line);
    }

    /// Emits a constant-indexed instruction, choosing the 1-byte or 2-byte
    /// form by index width.
    pub(crate) fn emit_index_op(&mut self, short: OpCode, long: OpCode, index: u16) {
        if index <= u8::MAX as u16 {
            self.emit_op(short);
            self.emit_byte(index as u8);
        } else {
            self.emit_op(long);
            let bytes = index.to_be_bytes();
            self.emit_byte(bytes[0]);
            self.emit_byte(bytes[1]);
        }
    }

    /// Adds a constant to the current chunk, deduplicating and rooting heap
    /// values against collection for the rest of the compilation.
    pub(crate) fn make_constant(&mut self, value: Value) -> u16 {
        if matches!(value, Value::Obj(_)) {
            self.vm.push_compiler_root(value);
        }
        match self.current_chunk().add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    pub(crate) fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_index_op(OpCode::Constant, OpCode::ConstantLong, index);
    }

    /// Interns an identifier and adds it to the constant pool.
    pub(crate) fn identifier_constant(&mut self, name: Token<'src>) -> u16 {
        let name_ref = self.vm.intern(name.lexeme);
        self.make_constant(Value::Obj(name_ref))
    }

    /// Emits a jump with a placeholder offset; returns the operand offset
    /// for patching.
    pub(crate) fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    /// Back-patches a forward jump to land after the last emitted byte.
    pub(crate) fn patch_jump(&mut self, operand_offset: usize) {
        // -2 accounts for the operand itself
        let jump = self.current_chunk().code.len() - operand_offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let bytes = (jump as u16).to_be_bytes();
        let code = &mut self.current_chunk().code;
        code[operand_offset] = bytes[0];
        code[operand_offset + 1] = bytes[1];
    }

    /// Emits a backward jump to `loop_start`.
    pub(crate) fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_runtime::debug::disassemble_chunk;
    use rook_runtime::Heap;

    fn compile_ok(source: &str) -> (Vm, ObjRef) {
        let mut vm = Vm::new();
        let function = compile(source, &mut vm).expect("expected successful compile");
        (vm, function)
    }

    fn compile_err(source: &str) -> CompileError {
        let mut vm = Vm::new();
        compile(source, &mut vm).expect_err("expected compile error")
    }

    fn disassemble(vm: &Vm, function: ObjRef) -> String {
        disassemble_chunk(vm.heap(), &vm.heap().function(function).chunk, "test")
    }

    /// Finds a function constant by name in a compiled chunk.
    fn find_function(heap: &Heap, function: ObjRef, name: &str) -> Option<ObjRef> {
        for &constant in &heap.function(function).chunk.constants {
            if let Value::Obj(r) = constant {
                if let Obj::Function(f) = heap.get(r) {
                    if let Some(n) = f.name {
                        if heap.string(n).chars.as_ref() == name {
                            return Some(r);
                        }
                    }
                }
            }
        }
        None
    }

    #[test]
    fn test_expression_precedence_bytecode() {
        let (vm, function) = compile_ok("print 1 + 2 * 3;");
        let text = disassemble(&vm, function);
        let multiply = text.find("OP_MULTIPLY").unwrap();
        let add = text.find("OP_ADD").unwrap();
        let print = text.find("OP_PRINT").unwrap();
        assert!(multiply < add && add < print, "{}", text);
    }

    #[test]
    fn test_globals_use_named_constants() {
        let (vm, function) = compile_ok("var a = 1; print a; a = 2;");
        let text = disassemble(&vm, function);
        assert!(text.contains("OP_DEFINE_GLOBAL"));
        assert!(text.contains("OP_GET_GLOBAL"));
        assert!(text.contains("OP_SET_GLOBAL"));
        assert!(text.contains("'a'"));
    }

    #[test]
    fn test_locals_resolve_to_slots() {
        let (vm, function) = compile_ok("{ var a = 1; print a; }");
        let text = disassemble(&vm, function);
        assert!(text.contains("OP_GET_LOCAL"));
        assert!(!text.contains("OP_GET_GLOBAL"));
    }

    #[test]
    fn test_constant_dedup_in_source() {
        let (vm, function) = compile_ok("print 1 + 1 + 1;");
        let constants = &vm.heap().function(function).chunk.constants;
        let ones = constants
            .iter()
            .filter(|v| matches!(v, Value::Number(n) if *n == 1.0))
            .count();
        assert_eq!(ones, 1);
    }

    #[test]
    fn test_closure_emission() {
        let (vm, function) = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        let outer = find_function(vm.heap(), function, "outer").unwrap();
        let outer_text =
            disassemble_chunk(vm.heap(), &vm.heap().function(outer).chunk, "outer");
        assert!(outer_text.contains("OP_CLOSURE"), "{}", outer_text);

        let inner = find_function(vm.heap(), outer, "inner").unwrap();
        let inner_text =
            disassemble_chunk(vm.heap(), &vm.heap().function(inner).chunk, "inner");
        assert!(inner_text.contains("OP_GET_UPVALUE"), "{}", inner_text);
        assert_eq!(vm.heap().function(inner).upvalue_count, 1);
    }

    #[test]
    fn test_function_without_captures_is_plain_constant() {
        let (vm, function) = compile_ok("fun flat() { return 1; }");
        let text = disassemble(&vm, function);
        assert!(!text.contains("OP_CLOSURE"), "{}", text);
        assert!(text.contains("OP_CONSTANT"));
    }

    #[test]
    fn test_short_property_names_use_str_ops() {
        let (vm, function) = compile_ok("var o = nil; o.x = 1; print o.y;");
        let text = disassemble(&vm, function);
        assert!(text.contains("OP_SET_PROP_STR"), "{}", text);
        assert!(text.contains("OP_GET_PROP_STR"), "{}", text);
    }

    #[test]
    fn test_long_property_names_use_interned_ops() {
        let (vm, function) = compile_ok("var o = nil; print o.somelongproperty;");
        let text = disassemble(&vm, function);
        assert!(text.contains("OP_GET_PROP "), "{}", text);
        assert!(!text.contains("OP_GET_PROP_STR"), "{}", text);
    }

    #[test]
    fn test_method_call_compiles_to_invoke() {
        let (vm, function) = compile_ok("var o = nil; o.method(1, 2);");
        let text = disassemble(&vm, function);
        assert!(text.contains("OP_INVOKE"), "{}", text);
    }

    #[test]
    fn test_class_with_initializer_emits_init() {
        let (vm, function) = compile_ok("class C { init(x) { this.x = x; } }");
        let text = disassemble(&vm, function);
        assert!(text.contains("OP_CLASS"));
        assert!(text.contains("OP_METHOD"));
        assert!(text.contains("OP_INIT"));
    }

    #[test]
    fn test_inheritance_emits_inherit() {
        let (vm, function) = compile_ok("class A {} class B < A {}");
        let text = disassemble(&vm, function);
        assert!(text.contains("OP_INHERIT"));
    }

    #[test]
    fn test_super_call_compiles() {
        let (vm, function) = compile_ok(
            "class A { m() {} } class B < A { m() { super.m(); } }",
        );
        // The method body lives two levels down; just check the whole
        // compilation carries a super invoke somewhere.
        let mut found = false;
        let heap = vm.heap();
        let mut pending = vec![function];
        while let Some(f) = pending.pop() {
            let text = disassemble_chunk(heap, &heap.function(f).chunk, "f");
            if text.contains("OP_SUPER_INVOKE") {
                found = true;
                break;
            }
            for &constant in &heap.function(f).chunk.constants {
                if let Value::Obj(r) = constant {
                    if matches!(heap.get(r), Obj::Function(_)) {
                        pending.push(r);
                    }
                }
            }
        }
        assert!(found);
    }

    #[test]
    fn test_switch_compiles_to_cmp_chain() {
        let (vm, function) = compile_ok(
            "switch (2) { case 1: print \"one\"; case 2: print \"two\"; default: print \"other\"; }",
        );
        let text = disassemble(&vm, function);
        assert!(text.contains("OP_CMP"), "{}", text);
        assert!(text.contains("OP_JUMP_IF_FALSE"));
    }

    #[test]
    fn test_while_loop_emits_loop() {
        let (vm, function) = compile_ok("var i = 0; while (i < 3) i = i + 1;");
        let text = disassemble(&vm, function);
        assert!(text.contains("OP_LOOP"));
        assert!(text.contains("OP_JUMP_IF_FALSE"));
    }

    #[test]
    fn test_scenario_sources_compile() {
        let sources = [
            "print 1 + 2 * 3;",
            "var a = \"foo\"; var b = \"bar\"; print a + b;",
            "fun mkCounter() { var n = 0; fun inc() { n = n + 1; return n; } return inc; } \
             var c = mkCounter(); print c(); print c(); print c();",
            "class A { greet() { print \"hi\"; } } class B < A {} B().greet();",
            "class C { init(x) { this.x = x; } get() { return this.x; } } print C(42).get();",
            "var x = 1; { var x = 2; { var x = 3; print x; } print x; } print x;",
            "for (var i = 0; i < 3; i = i + 1) print i;",
        ];
        for source in sources {
            let mut vm = Vm::new();
            assert!(compile(source, &mut vm).is_ok(), "failed: {}", source);
        }
    }

    #[test]
    fn test_let_requires_initializer() {
        let err = compile_err("let k;");
        assert!(err.errors >= 1);
    }

    #[test]
    fn test_assign_to_readonly_global_is_rejected() {
        let err = compile_err("let k = 5; k = 6;");
        assert!(err.errors >= 1);
    }

    #[test]
    fn test_assign_to_readonly_local_is_rejected() {
        compile_err("{ let k = 5; k = 6; }");
    }

    #[test]
    fn test_assign_to_readonly_upvalue_is_rejected() {
        compile_err("fun outer() { let k = 1; fun inner() { k = 2; } }");
    }

    #[test]
    fn test_var_remains_assignable() {
        let mut vm = Vm::new();
        assert!(compile("var k = 5; k = 6;", &mut vm).is_ok());
    }

    #[test]
    fn test_return_at_top_level_is_rejected() {
        compile_err("return 1;");
    }

    #[test]
    fn test_return_value_from_initializer_is_rejected() {
        compile_err("class C { init() { return 1; } }");
        let mut vm = Vm::new();
        assert!(compile("class C { init() { return; } }", &mut vm).is_ok());
    }

    #[test]
    fn test_this_outside_class_is_rejected() {
        compile_err("print this;");
    }

    #[test]
    fn test_super_outside_class_is_rejected() {
        compile_err("print super.x;");
    }

    #[test]
    fn test_super_without_superclass_is_rejected() {
        compile_err("class A { m() { super.m(); } }");
    }

    #[test]
    fn test_class_cannot_inherit_from_itself() {
        compile_err("class A < A {}");
    }

    #[test]
    fn test_continue_outside_loop_is_rejected() {
        compile_err("continue;");
    }

    #[test]
    fn test_duplicate_declaration_in_scope_is_rejected() {
        compile_err("{ var a = 1; var a = 2; }");
    }

    #[test]
    fn test_invalid_assignment_target() {
        compile_err("1 + 2 = 3;");
    }

    #[test]
    fn test_parameter_boundary() {
        let params: Vec<String> = (0..255).map(|i| format!("p{}", i)).collect();
        let at_limit = format!("fun big({}) {{}}", params.join(", "));
        let mut vm = Vm::new();
        assert!(compile(&at_limit, &mut vm).is_ok());

        let params: Vec<String> = (0..256).map(|i| format!("p{}", i)).collect();
        let over_limit = format!("fun big({}) {{}}", params.join(", "));
        compile_err(&over_limit);
    }

    #[test]
    fn test_error_recovery_reports_multiple_statements() {
        // Two statements, each broken: panic mode resets at the boundary
        let err = compile_err("print ; print ;");
        assert_eq!(err.errors, 2);
    }
}
