//! The lexer.
//!
//! A hand-rolled, char-at-a-time scanner rather than the teacher's
//! regex-table lexer: every token needs an exact line/column for
//! diagnostics, and `/* */` comments need state a regex alternation can't
//! express cleanly. Errors are recoverable — an illegal character or an
//! unterminated block comment is recorded to the [`Sink`] and scanning
//! resumes at the next character.

use derive_more::Display;

use crate::diag::{Category, Sink};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
pub enum TokenKind {
    #[display("identifier")]
    Ident,
    #[display("integer literal")]
    Int,

    #[display("void")]
    KwVoid,
    #[display("char")]
    KwChar,
    #[display("int")]
    KwInt,
    #[display("int8")]
    KwInt8,
    #[display("uint8")]
    KwUInt8,
    #[display("int16")]
    KwInt16,
    #[display("uint16")]
    KwUInt16,
    #[display("int32")]
    KwInt32,
    #[display("uint32")]
    KwUInt32,
    #[display("int64")]
    KwInt64,
    #[display("uint64")]
    KwUInt64,
    #[display("if")]
    KwIf,
    #[display("else")]
    KwElse,
    #[display("while")]
    KwWhile,
    #[display("return")]
    KwReturn,

    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Star,
    #[display("/")]
    Slash,
    #[display("=")]
    Assign,
    #[display("==")]
    EqEq,
    #[display("!=")]
    NotEq,
    #[display("<")]
    Lt,
    #[display("<=")]
    Le,
    #[display(">")]
    Gt,
    #[display(">=")]
    Ge,
    #[display("!")]
    Bang,
    #[display("&")]
    Amp,
    #[display("&&")]
    AmpAmp,
    #[display("|")]
    Pipe,
    #[display("||")]
    PipePipe,
    #[display("^")]
    Caret,
    #[display("~")]
    Tilde,
    #[display("<<")]
    Shl,
    #[display(">>")]
    Shr,

    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
    #[display(";")]
    Semi,
    #[display(",")]
    Comma,

    #[display("end of input")]
    Eof,
}

impl TokenKind {
    fn keyword(text: &str) -> Option<TokenKind> {
        Some(match text {
            "void" => TokenKind::KwVoid,
            "char" => TokenKind::KwChar,
            "int" => TokenKind::KwInt,
            "int8" => TokenKind::KwInt8,
            "uint8" => TokenKind::KwUInt8,
            "int16" => TokenKind::KwInt16,
            "uint16" => TokenKind::KwUInt16,
            "int32" => TokenKind::KwInt32,
            "uint32" => TokenKind::KwUInt32,
            "int64" => TokenKind::KwInt64,
            "uint64" => TokenKind::KwUInt64,
            "if" => TokenKind::KwIf,
            "else" => TokenKind::KwElse,
            "while" => TokenKind::KwWhile,
            "return" => TokenKind::KwReturn,
            _ => return None,
        })
    }

    /// True if this token spells a type keyword (used by the parser to
    /// decide "declaration vs. statement" and by panic-mode recovery).
    pub fn is_type_keyword(self) -> bool {
        matches!(
            self,
            TokenKind::KwVoid
                | TokenKind::KwChar
                | TokenKind::KwInt
                | TokenKind::KwInt8
                | TokenKind::KwUInt8
                | TokenKind::KwInt16
                | TokenKind::KwUInt16
                | TokenKind::KwInt32
                | TokenKind::KwUInt32
                | TokenKind::KwInt64
                | TokenKind::KwUInt64
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub text: &'src str,
    pub line: u32,
    pub column: u32,
}

pub struct Lexer<'src> {
    input: &'src str,
    bytes: &'src [u8],
    pos: usize,
    line: u32,
    column: u32,
    filename: String,
}

impl<'src> Lexer<'src> {
    pub fn new(input: &'src str, filename: impl Into<String>) -> Self {
        Lexer {
            input,
            bytes: input.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
            filename: filename.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    fn skip_trivia(&mut self, sink: &mut Sink) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.advance();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.advance();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let (start_line, start_col) = (self.line, self.column);
                    self.advance();
                    self.advance();
                    let mut closed = false;
                    while let Some(b) = self.peek() {
                        if b == b'*' && self.peek_at(1) == Some(b'/') {
                            self.advance();
                            self.advance();
                            closed = true;
                            break;
                        }
                        self.advance();
                    }
                    if !closed {
                        sink.error(
                            Category::Lexer,
                            Some(&self.filename),
                            start_line,
                            start_col,
                            "unterminated block comment",
                        );
                    }
                }
                _ => break,
            }
        }
    }

    /// Tokenize the entire input, recording recoverable errors to `sink`.
    /// The returned stream always ends with exactly one `Eof` token.
    pub fn tokenize(mut self, sink: &mut Sink) -> Vec<Token<'src>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia(sink);
            let (line, column) = (self.line, self.column);
            let start = self.pos;
            let Some(b) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    text: "",
                    line,
                    column,
                });
                break;
            };

            if b.is_ascii_digit() {
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.advance();
                }
                tokens.push(Token {
                    kind: TokenKind::Int,
                    text: &self.input[start..self.pos],
                    line,
                    column,
                });
                continue;
            }

            if b.is_ascii_alphabetic() || b == b'_' {
                while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
                    self.advance();
                }
                let text = &self.input[start..self.pos];
                let kind = TokenKind::keyword(text).unwrap_or(TokenKind::Ident);
                tokens.push(Token {
                    kind,
                    text,
                    line,
                    column,
                });
                continue;
            }

            let kind = match b {
                b'+' => {
                    self.advance();
                    TokenKind::Plus
                }
                b'-' => {
                    self.advance();
                    TokenKind::Minus
                }
                b'*' => {
                    self.advance();
                    TokenKind::Star
                }
                b'/' => {
                    self.advance();
                    TokenKind::Slash
                }
                b'(' => {
                    self.advance();
                    TokenKind::LParen
                }
                b')' => {
                    self.advance();
                    TokenKind::RParen
                }
                b'{' => {
                    self.advance();
                    TokenKind::LBrace
                }
                b'}' => {
                    self.advance();
                    TokenKind::RBrace
                }
                b';' => {
                    self.advance();
                    TokenKind::Semi
                }
                b',' => {
                    self.advance();
                    TokenKind::Comma
                }
                b'~' => {
                    self.advance();
                    TokenKind::Tilde
                }
                b'^' => {
                    self.advance();
                    TokenKind::Caret
                }
                b'=' => {
                    self.advance();
                    if self.peek() == Some(b'=') {
                        self.advance();
                        TokenKind::EqEq
                    } else {
                        TokenKind::Assign
                    }
                }
                b'!' => {
                    self.advance();
                    if self.peek() == Some(b'=') {
                        self.advance();
                        TokenKind::NotEq
                    } else {
                        TokenKind::Bang
                    }
                }
                b'<' => {
                    self.advance();
                    match self.peek() {
                        Some(b'=') => {
                            self.advance();
                            TokenKind::Le
                        }
                        Some(b'<') => {
                            self.advance();
                            TokenKind::Shl
                        }
                        _ => TokenKind::Lt,
                    }
                }
                b'>' => {
                    self.advance();
                    match self.peek() {
                        Some(b'=') => {
                            self.advance();
                            TokenKind::Ge
                        }
                        Some(b'>') => {
                            self.advance();
                            TokenKind::Shr
                        }
                        _ => TokenKind::Gt,
                    }
                }
                b'&' => {
                    self.advance();
                    if self.peek() == Some(b'&') {
                        self.advance();
                        TokenKind::AmpAmp
                    } else {
                        TokenKind::Amp
                    }
                }
                b'|' => {
                    self.advance();
                    if self.peek() == Some(b'|') {
                        self.advance();
                        TokenKind::PipePipe
                    } else {
                        TokenKind::Pipe
                    }
                }
                other => {
                    self.advance();
                    sink.error(
                        Category::Lexer,
                        Some(&self.filename),
                        line,
                        column,
                        format!("unexpected character {:?}", other as char),
                    );
                    continue;
                }
            };
            tokens.push(Token {
                kind,
                text: &self.input[start..self.pos],
                line,
                column,
            });
        }
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut sink = Sink::new();
        Lexer::new(src, "<test>")
            .tokenize(&mut sink)
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn skips_comments_and_whitespace() {
        let k = kinds("  // hi\n  /* block */ 42 ");
        assert_eq!(k, vec![TokenKind::Int, TokenKind::Eof]);
    }

    #[test]
    fn recognizes_multichar_operators() {
        let k = kinds("<= >= == != && || << >>");
        assert_eq!(
            k,
            vec![
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn records_unterminated_block_comment() {
        let mut sink = Sink::new();
        Lexer::new("/* never closed", "<test>").tokenize(&mut sink);
        assert!(sink.has_errors());
    }

    #[test]
    fn records_illegal_character_and_continues() {
        let mut sink = Sink::new();
        let tokens = Lexer::new("1 @ 2", "<test>").tokenize(&mut sink);
        assert!(sink.has_errors());
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TokenKind::Int, TokenKind::Int, TokenKind::Eof]);
    }
}
