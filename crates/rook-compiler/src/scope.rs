//! Compile-time scope state: function compilers, locals, upvalues, loops.

use rook_lex::Token;
use rook_runtime::{Chunk, ObjRef, OpCode};

use crate::Parser;

/// Locals per function: slot operands are single bytes.
pub(crate) const MAX_LOCALS: usize = 256;

/// Captured variables per function: the closure encoding uses byte indices.
pub(crate) const MAX_UPVALUES: usize = 255;

/// What kind of function body is being compiled; drives the implicit
/// return and the meaning of slot zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable while its scope is being compiled.
#[derive(Debug)]
pub(crate) struct Local<'src> {
    pub name: &'src str,
    /// Scope depth, or -1 while the initializer is still being compiled.
    pub depth: i32,
    /// Set when a nested function captures this local; scope exit then
    /// closes instead of popping.
    pub captured: bool,
    /// `let` binding: assignment is a compile error.
    pub readonly: bool,
}

/// Compile-time record of one captured variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct UpvalueMeta {
    /// Local slot (when `is_local`) or enclosing upvalue index.
    pub index: u8,
    pub is_local: bool,
    pub readonly: bool,
}

/// Where `continue` goes back to, and how deep the loop scope is.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LoopContext {
    pub start: usize,
    pub scope_depth: i32,
}

/// Per-class compile state.
pub(crate) struct ClassCompiler {
    pub has_superclass: bool,
}

/// One function under construction.
pub(crate) struct FunctionCompiler<'src> {
    pub kind: FunctionKind,
    /// Interned function name; `None` for the script.
    pub name: Option<ObjRef>,
    /// Declared parameter count. Tracked wider than the encoding limit so
    /// the 256th parameter errors instead of wrapping.
    pub arity: u32,
    pub chunk: Chunk,
    pub locals: Vec<Local<'src>>,
    pub upvalues: Vec<UpvalueMeta>,
    pub scope_depth: i32,
    /// Enclosing loops, innermost last; targets for `continue`.
    pub loops: Vec<LoopContext>,
}

impl<'src> FunctionCompiler<'src> {
    pub fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot zero belongs to the callee; inside methods it is `this`.
        let slot_zero = Local {
            name: match kind {
                FunctionKind::Method | FunctionKind::Initializer => "this",
                _ => "",
            },
            depth: 0,
            captured: false,
            readonly: false,
        };
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

impl<'src, 'vm> Parser<'src, 'vm> {
    pub(crate) fn begin_scope(&mut self) {
        self.compiler_mut().scope_depth += 1;
    }

    /// Leaves a scope, popping its locals and closing the captured ones.
    pub(crate) fn end_scope(&mut self) {
        self.compiler_mut().scope_depth -= 1;
        loop {
            let (has_local, captured) = {
                let compiler = self.compiler();
                match compiler.locals.last() {
                    Some(local) if local.depth > compiler.scope_depth => (true, local.captured),
                    _ => (false, false),
                }
            };
            if !has_local {
                break;
            }
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.compiler_mut().locals.pop();
        }
    }

    /// Emits pops (or closes) for locals deeper than `depth` without
    /// forgetting them; used by `continue`, which jumps back into the
    /// still-open loop scope.
    pub(crate) fn discard_locals_above(&mut self, depth: i32) {
        let captured: Vec<bool> = self
            .compiler()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| local.captured)
            .collect();
        for is_captured in captured {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    /// Declares the variable named by the previous token in the current
    /// scope. Globals are late-bound and not declared.
    pub(crate) fn declare_variable(&mut self) {
        if self.compiler().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut duplicate = false;
        {
            let compiler = self.compiler();
            for local in compiler.locals.iter().rev() {
                if local.depth != -1 && local.depth < compiler.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    pub(crate) fn add_local(&mut self, name: &'src str) {
        if self.compiler().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.compiler_mut().locals.push(Local {
            name,
            depth: -1,
            captured: false,
            readonly: false,
        });
    }

    /// Makes the just-declared local visible (and records readonly-ness).
    pub(crate) fn mark_initialized(&mut self, readonly: bool) {
        if self.compiler().scope_depth == 0 {
            return;
        }
        let depth = self.compiler().scope_depth;
        if let Some(local) = self.compiler_mut().locals.last_mut() {
            local.depth = depth;
            local.readonly = readonly;
        }
    }

    /// Consumes a variable name; returns its name-constant index for
    /// globals, 0 for locals.
    pub(crate) fn parse_variable(&mut self, message: &str) -> u16 {
        self.consume(rook_lex::TokenKind::Identifier, message);
        self.declare_variable();
        if self.compiler().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous)
    }

    pub(crate) fn define_variable(&mut self, global: u16, readonly: bool) {
        if self.compiler().scope_depth > 0 {
            self.mark_initialized(readonly);
            return;
        }
        self.emit_index_op(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global);
    }

    /// Resolves `name` as a local of compiler `ci`. Returns the slot and
    /// readonly-ness.
    pub(crate) fn resolve_local(&mut self, ci: usize, name: &str) -> Option<(u8, bool)> {
        let index = self.compilers[ci]
            .locals
            .iter()
            .rposition(|local| local.name == name)?;
        if self.compilers[ci].locals[index].depth == -1 {
            self.error("Can't read local variable in its own initializer.");
        }
        Some((index as u8, self.compilers[ci].locals[index].readonly))
    }

    /// Resolves `name` as a captured variable of compiler `ci`, threading
    /// an upvalue through every compiler between the declaring scope and
    /// `ci`. Returns the upvalue index and readonly-ness.
    pub(crate) fn resolve_upvalue(&mut self, ci: usize, name: &str) -> Option<(u8, bool)> {
        if ci == 0 {
            return None;
        }
        if let Some((local, readonly)) = self.resolve_local(ci - 1, name) {
            self.compilers[ci - 1].locals[local as usize].captured = true;
            return self.add_upvalue(ci, local, true, readonly);
        }
        if let Some((upvalue, readonly)) = self.resolve_upvalue(ci - 1, name) {
            return self.add_upvalue(ci, upvalue, false, readonly);
        }
        None
    }

    /// Records an upvalue on compiler `ci`, deduplicated by
    /// `(index, is_local)`.
    fn add_upvalue(&mut self, ci: usize, index: u8, is_local: bool, readonly: bool) -> Option<(u8, bool)> {
        if let Some(existing) = self.compilers[ci]
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local)
        {
            let readonly = self.compilers[ci].upvalues[existing].readonly;
            return Some((existing as u8, readonly));
        }
        if self.compilers[ci].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return Some((0, readonly));
        }
        self.compilers[ci].upvalues.push(UpvalueMeta {
            index,
            is_local,
            readonly,
        });
        Some((
            (self.compilers[ci].upvalues.len() - 1) as u8,
            readonly,
        ))
    }

    /// Loads or stores a variable, deciding between local, upvalue, and
    /// global access.
    pub(crate) fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        enum Access {
            Local(u8, bool),
            Upvalue(u8, bool),
            Global,
        }

        let lexeme = name.lexeme;
        let ci = self.compilers.len() - 1;
        let access = if let Some((slot, readonly)) = self.resolve_local(ci, lexeme) {
            Access::Local(slot, readonly)
        } else if let Some((slot, readonly)) = self.resolve_upvalue(ci, lexeme) {
            Access::Upvalue(slot, readonly)
        } else {
            Access::Global
        };

        let assigning = can_assign && self.match_token(rook_lex::TokenKind::Equal);

        match access {
            Access::Local(slot, readonly) => {
                if assigning {
                    if readonly {
                        self.error("Cannot assign to readonly variable.");
                    }
                    self.expression();
                    self.emit_op(OpCode::SetLocal);
                    self.emit_byte(slot);
                } else {
                    self.emit_op(OpCode::GetLocal);
                    self.emit_byte(slot);
                }
            }
            Access::Upvalue(slot, readonly) => {
                if assigning {
                    if readonly {
                        self.error("Cannot assign to readonly variable.");
                    }
                    self.expression();
                    self.emit_op(OpCode::SetUpvalue);
                    self.emit_byte(slot);
                } else {
                    self.emit_op(OpCode::GetUpvalue);
                    self.emit_byte(slot);
                }
            }
            Access::Global => {
                let index = self.identifier_constant(name);
                if assigning {
                    if self.readonly_globals.contains(lexeme) {
                        self.error("Cannot assign to readonly variable.");
                    }
                    self.expression();
                    self.emit_index_op(OpCode::SetGlobal, OpCode::SetGlobalLong, index);
                } else {
                    self.emit_index_op(OpCode::GetGlobal, OpCode::GetGlobalLong, index);
                }
            }
        }
    }
}
