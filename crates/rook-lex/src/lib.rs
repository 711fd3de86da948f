//! rook-lex - Lexical analyzer for the Rook language.
//!
//! The scanner produces tokens on demand from a source string. It is a
//! direct-coded lexer: each token class has its own scanning method, and
//! keywords are recognized with a first-character dispatch followed by a
//! suffix comparison rather than a table lookup.
//!
//! Tokens borrow their lexeme from the source buffer, so the token stream is
//! allocation-free.

pub mod cursor;
pub mod scanner;
pub mod token;

pub use cursor::Cursor;
pub use scanner::Scanner;
pub use token::{Token, TokenKind};
