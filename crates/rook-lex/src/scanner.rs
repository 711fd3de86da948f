//! Scanner producing Rook tokens on demand.

use crate::cursor::Cursor;
use crate::token::{Token, TokenKind};

/// Scanner for Rook source code.
///
/// Tokens are produced lazily: the compiler pulls one token at a time and the
/// scanner never looks past the token it is asked for. Whitespace and `//`
/// comments are skipped between tokens.
pub struct Scanner<'src> {
    /// Character cursor over the source.
    cursor: Cursor<'src>,

    /// Byte offset where the current token starts.
    token_start: usize,
}

impl<'src> Scanner<'src> {
    /// Creates a scanner over the given source.
    pub fn new(source: &'src str) -> Self {
        Self {
            cursor: Cursor::new(source),
            token_start: 0,
        }
    }

    /// Scans and returns the next token.
    ///
    /// At the end of input this returns an `Eof` token, and keeps returning
    /// it on subsequent calls.
    pub fn next_token(&mut self) -> Token<'src> {
        self.skip_whitespace_and_comments();

        self.token_start = self.cursor.position();

        if self.cursor.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.cursor.current_char();
        self.cursor.advance();

        if is_alpha(c) {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            '(' => self.make_token(TokenKind::LeftParen),
            ')' => self.make_token(TokenKind::RightParen),
            '{' => self.make_token(TokenKind::LeftBrace),
            '}' => self.make_token(TokenKind::RightBrace),
            '[' => self.make_token(TokenKind::LeftBracket),
            ']' => self.make_token(TokenKind::RightBracket),
            ',' => self.make_token(TokenKind::Comma),
            '.' => self.make_token(TokenKind::Dot),
            ';' => self.make_token(TokenKind::Semicolon),
            ':' => self.make_token(TokenKind::Colon),
            '-' => self.make_token(TokenKind::Minus),
            '+' => self.make_token(TokenKind::Plus),
            '/' => self.make_token(TokenKind::Slash),
            '*' => self.make_token(TokenKind::Star),
            '!' => {
                let kind = if self.cursor.match_char('=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.make_token(kind)
            }
            '=' => {
                let kind = if self.cursor.match_char('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.make_token(kind)
            }
            '<' => {
                let kind = if self.cursor.match_char('=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.make_token(kind)
            }
            '>' => {
                let kind = if self.cursor.match_char('=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.make_token(kind)
            }
            '"' => self.string(),
            _ => self.make_token(TokenKind::Error("Unexpected character.")),
        }
    }

    /// Skips whitespace and `//` line comments, tracking newlines.
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.cursor.current_char() {
                ' ' | '\r' | '\t' | '\n' => self.cursor.advance(),
                '/' => {
                    if self.cursor.peek_next() == '/' {
                        while self.cursor.current_char() != '\n' && !self.cursor.is_at_end() {
                            self.cursor.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Scans a string literal. The opening quote has been consumed; the
    /// lexeme includes both quotes. Strings may span lines.
    fn string(&mut self) -> Token<'src> {
        while self.cursor.current_char() != '"' && !self.cursor.is_at_end() {
            self.cursor.advance();
        }

        if self.cursor.is_at_end() {
            return self.make_token(TokenKind::Error("Unterminated string."));
        }

        self.cursor.advance(); // closing quote
        self.make_token(TokenKind::String)
    }

    /// Scans a number literal: digits with an optional fractional part.
    fn number(&mut self) -> Token<'src> {
        while self.cursor.current_char().is_ascii_digit() {
            self.cursor.advance();
        }

        if self.cursor.current_char() == '.' && self.cursor.peek_next().is_ascii_digit() {
            self.cursor.advance();
            while self.cursor.current_char().is_ascii_digit() {
                self.cursor.advance();
            }
        }

        self.make_token(TokenKind::Number)
    }

    /// Scans an identifier or keyword.
    fn identifier(&mut self) -> Token<'src> {
        while is_alpha(self.cursor.current_char()) || self.cursor.current_char().is_ascii_digit() {
            self.cursor.advance();
        }

        self.make_token(self.identifier_kind())
    }

    /// Classifies the scanned identifier, recognizing keywords with a
    /// first-character dispatch followed by a suffix comparison.
    fn identifier_kind(&self) -> TokenKind {
        let lexeme = self.cursor.slice_from(self.token_start);
        let bytes = lexeme.as_bytes();

        match bytes[0] {
            b'a' => self.check_keyword(1, "nd", TokenKind::And),
            b'c' if bytes.len() > 1 => match bytes[1] {
                b'a' => self.check_keyword(2, "se", TokenKind::Case),
                b'l' => self.check_keyword(2, "ass", TokenKind::Class),
                b'o' => self.check_keyword(2, "ntinue", TokenKind::Continue),
                _ => TokenKind::Identifier,
            },
            b'd' => self.check_keyword(1, "efault", TokenKind::Default),
            b'e' => self.check_keyword(1, "lse", TokenKind::Else),
            b'f' if bytes.len() > 1 => match bytes[1] {
                b'a' => self.check_keyword(2, "lse", TokenKind::False),
                b'o' => self.check_keyword(2, "r", TokenKind::For),
                b'u' => self.check_keyword(2, "n", TokenKind::Fun),
                _ => TokenKind::Identifier,
            },
            b'i' => self.check_keyword(1, "f", TokenKind::If),
            b'l' => self.check_keyword(1, "et", TokenKind::Let),
            b'n' => self.check_keyword(1, "il", TokenKind::Nil),
            b'o' => self.check_keyword(1, "r", TokenKind::Or),
            b'p' => self.check_keyword(1, "rint", TokenKind::Print),
            b'r' => self.check_keyword(1, "eturn", TokenKind::Return),
            b's' if bytes.len() > 1 => match bytes[1] {
                b'u' => self.check_keyword(2, "per", TokenKind::Super),
                b'w' => self.check_keyword(2, "itch", TokenKind::Switch),
                _ => TokenKind::Identifier,
            },
            b't' if bytes.len() > 1 => match bytes[1] {
                b'h' => self.check_keyword(2, "is", TokenKind::This),
                b'r' => self.check_keyword(2, "ue", TokenKind::True),
                _ => TokenKind::Identifier,
            },
            b'v' => self.check_keyword(1, "ar", TokenKind::Var),
            b'w' => self.check_keyword(1, "hile", TokenKind::While),
            _ => TokenKind::Identifier,
        }
    }

    /// Compares the identifier's suffix starting at `start` against `rest`.
    fn check_keyword(&self, start: usize, rest: &str, kind: TokenKind) -> TokenKind {
        let lexeme = self.cursor.slice_from(self.token_start);
        if lexeme.get(start..) == Some(rest) {
            kind
        } else {
            TokenKind::Identifier
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: self.cursor.slice_from(self.token_start),
            line: self.cursor.line(),
        }
    }
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

impl<'src> Iterator for Scanner<'src> {
    type Item = Token<'src>;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.next_token();
        if token.kind == TokenKind::Eof {
            None
        } else {
            Some(token)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Scanner::new(source).map(|t| t.kind).collect()
    }

    #[test]
    fn test_punctuation() {
        assert_eq!(
            kinds("(){}[],.;:-+/*"),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::LeftBracket,
                TokenKind::RightBracket,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Semicolon,
                TokenKind::Colon,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Slash,
                TokenKind::Star,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("! != = == < <= > >="),
            vec![
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
            ]
        );
    }

    #[test]
    fn test_keywords() {
        let source = "and or class else false true nil for while if fun var \
                      let print return super this case default switch continue";
        assert_eq!(
            kinds(source),
            vec![
                TokenKind::And,
                TokenKind::Or,
                TokenKind::Class,
                TokenKind::Else,
                TokenKind::False,
                TokenKind::True,
                TokenKind::Nil,
                TokenKind::For,
                TokenKind::While,
                TokenKind::If,
                TokenKind::Fun,
                TokenKind::Var,
                TokenKind::Let,
                TokenKind::Print,
                TokenKind::Return,
                TokenKind::Super,
                TokenKind::This,
                TokenKind::Case,
                TokenKind::Default,
                TokenKind::Switch,
                TokenKind::Continue,
            ]
        );
    }

    #[test]
    fn test_keyword_prefixes_are_identifiers() {
        for word in ["an", "classy", "superb", "fo", "lets", "vars", "cas", "switched"] {
            assert_eq!(kinds(word), vec![TokenKind::Identifier], "{}", word);
        }
    }

    #[test]
    fn test_identifier_lexemes() {
        let mut scanner = Scanner::new("foo _bar baz42");
        assert_eq!(scanner.next_token().lexeme, "foo");
        assert_eq!(scanner.next_token().lexeme, "_bar");
        assert_eq!(scanner.next_token().lexeme, "baz42");
        assert_eq!(scanner.next_token().kind, TokenKind::Eof);
    }

    #[test]
    fn test_numbers() {
        let mut scanner = Scanner::new("0 42 3.25 1.");
        let t = scanner.next_token();
        assert_eq!((t.kind, t.lexeme), (TokenKind::Number, "0"));
        let t = scanner.next_token();
        assert_eq!((t.kind, t.lexeme), (TokenKind::Number, "42"));
        let t = scanner.next_token();
        assert_eq!((t.kind, t.lexeme), (TokenKind::Number, "3.25"));
        // A trailing dot is not part of the number
        let t = scanner.next_token();
        assert_eq!((t.kind, t.lexeme), (TokenKind::Number, "1"));
        assert_eq!(scanner.next_token().kind, TokenKind::Dot);
    }

    #[test]
    fn test_string_literal() {
        let mut scanner = Scanner::new("\"hello\"");
        let t = scanner.next_token();
        assert_eq!(t.kind, TokenKind::String);
        assert_eq!(t.lexeme, "\"hello\"");
    }

    #[test]
    fn test_unterminated_string() {
        let mut scanner = Scanner::new("\"oops");
        let t = scanner.next_token();
        assert_eq!(t.kind, TokenKind::Error("Unterminated string."));
    }

    #[test]
    fn test_multiline_string_reports_closing_line() {
        let mut scanner = Scanner::new("\"a\nb\"");
        let t = scanner.next_token();
        assert_eq!(t.kind, TokenKind::String);
        assert_eq!(t.line, 2);
    }

    #[test]
    fn test_comments_and_lines() {
        let mut scanner = Scanner::new("// nothing here\nprint 1; // trailing\n");
        let t = scanner.next_token();
        assert_eq!((t.kind, t.line), (TokenKind::Print, 2));
        let t = scanner.next_token();
        assert_eq!((t.kind, t.line), (TokenKind::Number, 2));
        let t = scanner.next_token();
        assert_eq!(t.kind, TokenKind::Semicolon);
        assert_eq!(scanner.next_token().kind, TokenKind::Eof);
    }

    #[test]
    fn test_slash_not_comment() {
        assert_eq!(
            kinds("1 / 2"),
            vec![TokenKind::Number, TokenKind::Slash, TokenKind::Number]
        );
    }

    #[test]
    fn test_unexpected_character() {
        let mut scanner = Scanner::new("@");
        let t = scanner.next_token();
        assert_eq!(t.kind, TokenKind::Error("Unexpected character."));
    }

    #[test]
    fn test_eof_is_sticky() {
        let mut scanner = Scanner::new("");
        assert_eq!(scanner.next_token().kind, TokenKind::Eof);
        assert_eq!(scanner.next_token().kind, TokenKind::Eof);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn scanning_never_panics(source in ".*") {
                let mut scanner = Scanner::new(&source);
                // Bounded by the input: every call either consumes at least
                // one character or returns Eof.
                for _ in 0..source.len() + 1 {
                    if scanner.next_token().kind == TokenKind::Eof {
                        break;
                    }
                }
            }

            #[test]
            fn identifiers_scan_whole(ident in "[a-zA-Z_][a-zA-Z0-9_]{0,12}") {
                let mut scanner = Scanner::new(&ident);
                let token = scanner.next_token();
                // Keywords and identifiers both cover the full lexeme
                prop_assert_eq!(token.lexeme, ident.as_str());
                prop_assert_eq!(scanner.next_token().kind, TokenKind::Eof);
            }
        }
    }
}
