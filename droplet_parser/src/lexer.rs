//! Droplet lexer.
//!
//! Converts UTF-8 source text into a token stream ending in EOF. Tracks
//! 1-based line and column positions, skips whitespace and `//` comments,
//! and recognizes the complete Droplet token set: numeric and string
//! literals, identifiers, keywords, operators, punctuation, and the `@ffi` /
//! `@deprecated` annotations. An empty or unknown annotation name is a fatal
//! lex error carrying the offending position.

use crate::token::{Token, TokenKind};
use droplet_core::{DropletError, DropletResult, SourceLocation};

/// The Droplet lexer.
#[derive(Debug)]
pub struct Lexer<'src> {
    /// Raw source bytes (string literal contents are sliced out verbatim).
    source: &'src [u8],
    /// Start offset of the token being scanned.
    start: usize,
    /// Current scan offset.
    current: usize,
    /// Current line (1-based).
    line: u32,
    /// Current column (1-based).
    column: u32,
    /// Location where the current token started.
    token_start: SourceLocation,
    /// Tokens produced so far.
    tokens: Vec<Token>,
}

impl<'src> Lexer<'src> {
    /// Create a lexer over the given source text.
    #[must_use]
    pub fn new(source: &'src str) -> Self {
        Self {
            source: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            token_start: SourceLocation::start(),
            tokens: Vec::new(),
        }
    }

    /// Tokenize the whole input, ending with an EOF token.
    pub fn tokenize(mut self) -> DropletResult<Vec<Token>> {
        while self.current < self.source.len() {
            self.skip_whitespace_and_comments();
            if self.current >= self.source.len() {
                break;
            }

            self.start = self.current;
            self.token_start = SourceLocation::new(self.line, self.column);
            let c = self.advance();

            match c {
                b'+' => {
                    if self.eat(b'=') {
                        self.push(TokenKind::PlusEq);
                    } else {
                        self.push(TokenKind::Plus);
                    }
                }
                b'-' => {
                    if self.eat(b'=') {
                        self.push(TokenKind::MinusEq);
                    } else if self.eat(b'>') {
                        self.push(TokenKind::Arrow);
                    } else {
                        self.push(TokenKind::Minus);
                    }
                }
                b'*' => self.push(TokenKind::Star),
                b'/' => self.push(TokenKind::Slash),
                b'%' => self.push(TokenKind::Percent),
                b'=' => {
                    if self.eat(b'=') {
                        self.push(TokenKind::Eq);
                    } else {
                        self.push(TokenKind::Assign);
                    }
                }
                b'!' => {
                    if self.eat(b'=') {
                        self.push(TokenKind::Neq);
                    } else {
                        self.push(TokenKind::Not);
                    }
                }
                b'<' => {
                    if self.eat(b'=') {
                        self.push(TokenKind::Lte);
                    } else {
                        self.push(TokenKind::Lt);
                    }
                }
                b'>' => {
                    if self.eat(b'=') {
                        self.push(TokenKind::Gte);
                    } else {
                        self.push(TokenKind::Gt);
                    }
                }
                b'&' => {
                    if self.eat(b'&') {
                        self.push(TokenKind::AndAnd);
                    }
                }
                b'|' => {
                    if self.eat(b'|') {
                        self.push(TokenKind::OrOr);
                    }
                }
                b'.' => self.push(TokenKind::Dot),
                b',' => self.push(TokenKind::Comma),
                b':' => self.push(TokenKind::Colon),
                b';' => self.push(TokenKind::Semicolon),
                b'(' => self.push(TokenKind::LParen),
                b')' => self.push(TokenKind::RParen),
                b'{' => self.push(TokenKind::LBrace),
                b'}' => self.push(TokenKind::RBrace),
                b'[' => self.push(TokenKind::LBracket),
                b']' => self.push(TokenKind::RBracket),
                b'@' => self.annotation()?,
                b'"' => self.string_literal(),
                c if c.is_ascii_digit() => self.number(),
                c if c.is_ascii_alphabetic() || c == b'_' => self.identifier_or_keyword(),
                _ => {
                    // Bytes outside the token grammar are skipped, matching the
                    // permissive original behavior.
                }
            }
        }

        self.token_start = SourceLocation::new(self.line, self.column);
        self.push_lexeme(TokenKind::Eof, "");
        Ok(self.tokens)
    }

    // =========================================================================
    // Cursor
    // =========================================================================

    fn advance(&mut self) -> u8 {
        let c = self.source[self.current];
        self.current += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        c
    }

    fn peek(&self) -> u8 {
        if self.current < self.source.len() {
            self.source[self.current]
        } else {
            0
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 < self.source.len() {
            self.source[self.current + 1]
        } else {
            0
        }
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' | b'\n' => {
                    self.advance();
                }
                b'/' if self.peek_next() == b'/' => {
                    while self.peek() != b'\n' && self.current < self.source.len() {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    // =========================================================================
    // Token producers
    // =========================================================================

    fn push(&mut self, kind: TokenKind) {
        let text = std::str::from_utf8(&self.source[self.start..self.current])
            .unwrap_or_default()
            .to_string();
        self.tokens.push(Token::new(kind, text, self.token_start));
    }

    fn push_lexeme(&mut self, kind: TokenKind, lexeme: &str) {
        self.tokens.push(Token::new(kind, lexeme, self.token_start));
    }

    fn number(&mut self) {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance(); // dot
            while self.peek().is_ascii_digit() {
                self.advance();
            }
            self.push(TokenKind::Float);
        } else {
            self.push(TokenKind::Int);
        }
    }

    fn string_literal(&mut self) {
        while self.peek() != b'"' && self.current < self.source.len() {
            self.advance();
        }
        let inner_end = self.current;
        if self.peek() == b'"' {
            self.advance(); // closing quote
        }
        // Inner bytes only, quotes stripped; no escape processing.
        let inner = &self.source[self.start + 1..inner_end];
        let text = String::from_utf8_lossy(inner).into_owned();
        self.push_lexeme(TokenKind::Str, &text);
    }

    fn identifier_or_keyword(&mut self) {
        while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' || self.peek() == b'$' {
            self.advance();
        }
        let text = std::str::from_utf8(&self.source[self.start..self.current])
            .unwrap_or_default()
            .to_string();
        match TokenKind::keyword(&text) {
            Some(kind) => self.push_lexeme(kind, &text),
            None => self.push_lexeme(TokenKind::Identifier, &text),
        }
    }

    fn annotation(&mut self) -> DropletResult<()> {
        let name_start = self.current;
        while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
            self.advance();
        }
        let name = std::str::from_utf8(&self.source[name_start..self.current]).unwrap_or_default();

        if name.is_empty() {
            return Err(DropletError::lex(
                "expected annotation name after '@'",
                self.token_start,
            ));
        }

        match name {
            "ffi" => self.push_lexeme(TokenKind::AtFfi, "@ffi"),
            "deprecated" => self.push_lexeme(TokenKind::AtDeprecated, "@deprecated"),
            other => {
                return Err(DropletError::lex(
                    format!("unknown annotation '@{other}'"),
                    self.token_start,
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        Lexer::new(source).tokenize().expect("lex failure")
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_empty_source_yields_eof() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_integer_literal() {
        let toks = lex("12345");
        assert_eq!(toks[0].kind, TokenKind::Int);
        assert_eq!(toks[0].lexeme, "12345");
    }

    #[test]
    fn test_float_literal() {
        let toks = lex("3.14");
        assert_eq!(toks[0].kind, TokenKind::Float);
        assert_eq!(toks[0].lexeme, "3.14");
    }

    #[test]
    fn test_int_followed_by_dot_is_not_float() {
        // `1.foo` lexes as int, dot, identifier.
        assert_eq!(
            kinds("1.foo"),
            vec![
                TokenKind::Int,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_string_literal_strips_quotes() {
        let toks = lex("\"hello world\"");
        assert_eq!(toks[0].kind, TokenKind::Str);
        assert_eq!(toks[0].lexeme, "hello world");
    }

    #[test]
    fn test_empty_string_literal() {
        let toks = lex("\"\"");
        assert_eq!(toks[0].kind, TokenKind::Str);
        assert_eq!(toks[0].lexeme, "");
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            kinds("fn main self err"),
            vec![
                TokenKind::Fn,
                TokenKind::Identifier,
                TokenKind::SelfKw,
                TokenKind::Err,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_bool_and_null_literals() {
        let toks = lex("true false null");
        assert_eq!(toks[0].kind, TokenKind::Bool);
        assert_eq!(toks[0].lexeme, "true");
        assert_eq!(toks[1].kind, TokenKind::Bool);
        assert_eq!(toks[1].lexeme, "false");
        assert_eq!(toks[2].kind, TokenKind::Null);
    }

    #[test]
    fn test_identifier_with_dollar() {
        let toks = lex("op$add");
        assert_eq!(toks[0].kind, TokenKind::Identifier);
        assert_eq!(toks[0].lexeme, "op$add");
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            kinds("+= -= -> == != <= >= && ||"),
            vec![
                TokenKind::PlusEq,
                TokenKind::MinusEq,
                TokenKind::Arrow,
                TokenKind::Eq,
                TokenKind::Neq,
                TokenKind::Lte,
                TokenKind::Gte,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_comment_skipping() {
        assert_eq!(
            kinds("let x // trailing comment\nlet y"),
            vec![
                TokenKind::Let,
                TokenKind::Identifier,
                TokenKind::Let,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_line_and_column_tracking() {
        let toks = lex("let\n  x");
        assert_eq!(toks[0].location, SourceLocation::new(1, 1));
        assert_eq!(toks[1].location, SourceLocation::new(2, 3));
    }

    #[test]
    fn test_known_annotations() {
        assert_eq!(
            kinds("@ffi @deprecated"),
            vec![TokenKind::AtFfi, TokenKind::AtDeprecated, TokenKind::Eof]
        );
    }

    #[test]
    fn test_unknown_annotation_is_fatal() {
        let err = Lexer::new("@inline fn f() {}").tokenize().unwrap_err();
        assert!(err.to_string().contains("unknown annotation '@inline'"));
    }

    #[test]
    fn test_empty_annotation_is_fatal() {
        let err = Lexer::new("@ fn").tokenize().unwrap_err();
        assert!(err.to_string().contains("annotation name"));
    }

    #[test]
    fn test_arithmetic_expression() {
        assert_eq!(
            kinds("1 + 2 * 3"),
            vec![
                TokenKind::Int,
                TokenKind::Plus,
                TokenKind::Int,
                TokenKind::Star,
                TokenKind::Int,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string_reaches_eof() {
        let toks = lex("\"abc");
        assert_eq!(toks[0].kind, TokenKind::Str);
        assert_eq!(toks[0].lexeme, "abc");
        assert_eq!(toks[1].kind, TokenKind::Eof);
    }
}
