//! Expression parsing: Pratt precedence climbing over a static rule table.
//!
//! Every token kind maps to `(prefix, infix, precedence)`. The table is a
//! `match` over the kind and the handlers are enum variants dispatched with
//! a second `match`, so the hot path has no indirect calls.

use rook_lex::{Token, TokenKind};
use rook_runtime::{OpCode, Value, SHORT_STRING_MAX};

use crate::Parser;

/// Operator precedence, lowest to highest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Precedence {
    None,
    /// `=`
    Assignment,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// `+` `-`
    Term,
    /// `*` `/`
    Factor,
    /// `!` unary `-`
    Unary,
    /// `.` `()`
    Call,
    Primary,
}

impl Precedence {
    /// The next-tighter level, used for left-associative infix parsing.
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

/// Parse handlers named by the rule table.
#[derive(Clone, Copy, Debug)]
enum ParseFn {
    Grouping,
    Unary,
    Binary,
    Number,
    String,
    Literal,
    Variable,
    And,
    Or,
    Call,
    Dot,
    This,
    Super,
}

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

const fn rule(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> ParseRule {
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

fn rule_for(kind: TokenKind) -> ParseRule {
    match kind {
        TokenKind::LeftParen => rule(Some(ParseFn::Grouping), Some(ParseFn::Call), Precedence::Call),
        TokenKind::Dot => rule(None, Some(ParseFn::Dot), Precedence::Call),
        TokenKind::Minus => rule(Some(ParseFn::Unary), Some(ParseFn::Binary), Precedence::Term),
        TokenKind::Plus => rule(None, Some(ParseFn::Binary), Precedence::Term),
        TokenKind::Slash | TokenKind::Star => rule(None, Some(ParseFn::Binary), Precedence::Factor),
        TokenKind::Bang => rule(Some(ParseFn::Unary), None, Precedence::None),
        TokenKind::BangEqual | TokenKind::EqualEqual => {
            rule(None, Some(ParseFn::Binary), Precedence::Equality)
        }
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => rule(None, Some(ParseFn::Binary), Precedence::Comparison),
        TokenKind::Identifier => rule(Some(ParseFn::Variable), None, Precedence::None),
        TokenKind::String => rule(Some(ParseFn::String), None, Precedence::None),
        TokenKind::Number => rule(Some(ParseFn::Number), None, Precedence::None),
        TokenKind::And => rule(None, Some(ParseFn::And), Precedence::And),
        TokenKind::Or => rule(None, Some(ParseFn::Or), Precedence::Or),
        TokenKind::True | TokenKind::False | TokenKind::Nil => {
            rule(Some(ParseFn::Literal), None, Precedence::None)
        }
        TokenKind::This => rule(Some(ParseFn::This), None, Precedence::None),
        TokenKind::Super => rule(Some(ParseFn::Super), None, Precedence::None),
        _ => rule(None, None, Precedence::None),
    }
}

impl<'src, 'vm> Parser<'src, 'vm> {
    pub(crate) fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule_for(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        // Only the loosest level may treat `=` as assignment; this is what
        // rejects `a + b = c`.
        let can_assign = precedence <= Precedence::Assignment;
        self.apply(prefix, can_assign);

        while precedence <= rule_for(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule_for(self.previous.kind).infix {
                self.apply(infix, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn apply(&mut self, function: ParseFn, can_assign: bool) {
        match function {
            ParseFn::Grouping => self.grouping(),
            ParseFn::Unary => self.unary(),
            ParseFn::Binary => self.binary(),
            ParseFn::Number => self.number(),
            ParseFn::String => self.string(),
            ParseFn::Literal => self.literal(),
            ParseFn::Variable => self.variable(can_assign),
            ParseFn::And => self.and_operator(),
            ParseFn::Or => self.or_operator(),
            ParseFn::Call => self.call(),
            ParseFn::Dot => self.dot(can_assign),
            ParseFn::This => self.this_expression(),
            ParseFn::Super => self.super_expression(),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => panic!("unary handler on {:?}", operator),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        let precedence = rule_for(operator).precedence;
        self.parse_precedence(precedence.next());

        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => panic!("binary handler on {:?}", operator),
        }
    }

    fn number(&mut self) {
        let value: f64 = match self.previous.lexeme.parse() {
            Ok(value) => value,
            Err(_) => {
                self.error("Invalid number literal.");
                0.0
            }
        };
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        // Strip the surrounding quotes
        let content = &lexeme[1..lexeme.len() - 1];
        let value = self.vm.string_value(content);
        self.emit_constant(value);
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            other => panic!("literal handler on {:?}", other),
        }
    }

    pub(crate) fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn and_operator(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_operator(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    pub(crate) fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous;

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_property_op(name, true);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            let index = self.identifier_constant(name);
            self.emit_index_op(OpCode::Invoke, OpCode::InvokeLong, index);
            self.emit_byte(arg_count);
        } else {
            self.emit_property_op(name, false);
        }
    }

    /// Emits a property access. Names that fit inline use the short-string
    /// opcode forms; long names (or constant indices past a byte) use
    /// interned-name constants.
    fn emit_property_op(&mut self, name: Token<'src>, is_set: bool) {
        let lexeme = name.lexeme;
        if lexeme.len() <= SHORT_STRING_MAX {
            let index = self.make_constant(Value::short_str(lexeme));
            if index <= u8::MAX as u16 {
                self.emit_op(if is_set {
                    OpCode::SetPropStr
                } else {
                    OpCode::GetPropStr
                });
                self.emit_byte(index as u8);
                return;
            }
        }
        let index = self.identifier_constant(name);
        if is_set {
            self.emit_index_op(OpCode::SetProp, OpCode::SetPropLong, index);
        } else {
            self.emit_index_op(OpCode::GetProp, OpCode::GetPropLong, index);
        }
    }

    fn this_expression(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_expression(&mut self) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            _ => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous;
        let index = self.identifier_constant(name);

        self.named_variable(Token::synthetic("this"), false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_index_op(OpCode::SuperInvoke, OpCode::SuperInvokeLong, index);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_index_op(OpCode::GetSuper, OpCode::GetSuperLong, index);
        }
    }
}
