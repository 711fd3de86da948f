//! Statement and declaration parsing.

use rook_lex::{Token, TokenKind};
use rook_runtime::{OpCode, Value};

use crate::scope::{ClassCompiler, FunctionCompiler, FunctionKind, LoopContext};
use crate::Parser;

impl<'src, 'vm> Parser<'src, 'vm> {
    pub(crate) fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.match_token(TokenKind::Let) {
            self.var_declaration(true);
        } else {
            self.statement();
        }

        if self.panic_mode() {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    pub(crate) fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.code_len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        let depth = self.compiler().scope_depth;
        self.compiler_mut().loops.push(LoopContext {
            start: loop_start,
            scope_depth: depth,
        });
        self.statement();
        self.compiler_mut().loops.pop();

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        // Initializer clause
        if self.match_token(TokenKind::Semicolon) {
            // No initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.match_token(TokenKind::Let) {
            self.var_declaration(true);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.code_len();

        // Condition clause
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        // Increment clause runs after the body; the loop start moves to it
        // so the body (and `continue`) falls into the increment.
        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.code_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let depth = self.compiler().scope_depth;
        self.compiler_mut().loops.push(LoopContext {
            start: loop_start,
            scope_depth: depth,
        });
        self.statement();
        self.compiler_mut().loops.pop();

        self.emit_loop(loop_start);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    /// `switch (value) { case e: ... default: ... }`
    ///
    /// Each case re-tests the switched value with `Cmp`, which leaves it on
    /// the stack. The value is popped exactly once on every path: by the
    /// matching case before its body, by `default`, or at the end when
    /// nothing matched.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after value.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch cases.");

        let mut end_jumps = Vec::new();
        let mut saw_default = false;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Case) {
                if saw_default {
                    self.error("Can't have a case after 'default'.");
                }
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after case value.");

                self.emit_op(OpCode::Cmp);
                let miss_jump = self.emit_jump(OpCode::JumpIfFalse);
                // Hit: drop the comparison result and the switched value
                self.emit_op(OpCode::Pop);
                self.emit_op(OpCode::Pop);
                while !self.check(TokenKind::Case)
                    && !self.check(TokenKind::Default)
                    && !self.check(TokenKind::RightBrace)
                    && !self.check(TokenKind::Eof)
                {
                    self.statement();
                }
                end_jumps.push(self.emit_jump(OpCode::Jump));

                // Miss: drop the comparison result, keep the value
                self.patch_jump(miss_jump);
                self.emit_op(OpCode::Pop);
            } else if self.match_token(TokenKind::Default) {
                self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
                if saw_default {
                    self.error("Can only have one 'default' case.");
                }
                saw_default = true;
                self.emit_op(OpCode::Pop);
                while !self.check(TokenKind::Case)
                    && !self.check(TokenKind::Default)
                    && !self.check(TokenKind::RightBrace)
                    && !self.check(TokenKind::Eof)
                {
                    self.statement();
                }
            } else {
                self.error_at_current("Expect 'case' or 'default'.");
                break;
            }
        }

        if !saw_default {
            self.emit_op(OpCode::Pop);
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after switch cases.");
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        let Some(context) = self.compiler().loops.last().copied() else {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        };
        self.discard_locals_above(context.scope_depth);
        self.emit_loop(context.start);
    }

    fn return_statement(&mut self) {
        if self.compiler().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.compiler().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn var_declaration(&mut self, readonly: bool) {
        let global = self.parse_variable("Expect variable name.");
        let name = self.previous.lexeme;

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else if readonly {
            self.error("Readonly variables must have an initializer.");
            self.emit_op(OpCode::Nil);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );

        let at_top_level = self.compiler().scope_depth == 0;
        self.define_variable(global, readonly);
        if readonly && at_top_level {
            self.readonly_globals.insert(name);
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; it is initialized before its body
        // is compiled.
        self.mark_initialized(false);
        self.function(FunctionKind::Function);
        self.define_variable(global, false);
    }

    /// Compiles a function body (the name is the previous token) and emits
    /// the code that loads it: a plain constant when nothing is captured,
    /// a closure instruction otherwise.
    fn function(&mut self, kind: FunctionKind) {
        let name_ref = self.vm.intern(self.previous.lexeme);
        self.vm.push_compiler_root(Value::Obj(name_ref));
        self.compilers
            .push(FunctionCompiler::new(kind, Some(name_ref)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.compiler().arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.compiler_mut().arity += 1;
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant, false);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function_ref, upvalues) = self.end_compiler();
        if upvalues.is_empty() {
            self.emit_constant(Value::Obj(function_ref));
        } else {
            let index = self.make_constant(Value::Obj(function_ref));
            self.emit_index_op(OpCode::Closure, OpCode::ClosureLong, index);
            for upvalue in upvalues {
                self.emit_byte(upvalue.is_local as u8);
                self.emit_byte(upvalue.index);
            }
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_index_op(OpCode::Class, OpCode::ClassLong, name_constant);
        self.define_variable(name_constant, false);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // The superclass lives in a scoped local named `super` so
            // methods can capture it.
            self.begin_scope();
            self.add_local(Token::synthetic("super").lexeme);
            self.mark_initialized(false);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let has_superclass = self
            .classes
            .last()
            .map(|class| class.has_superclass)
            .unwrap_or(false);
        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous;
        let index = self.identifier_constant(name);

        let kind = if name.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);

        self.emit_index_op(OpCode::Method, OpCode::MethodLong, index);
        if kind == FunctionKind::Initializer {
            self.emit_op(OpCode::Init);
        }
    }

    fn code_len(&mut self) -> usize {
        self.current_chunk().code.len()
    }
}
