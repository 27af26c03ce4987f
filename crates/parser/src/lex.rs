//! Tokenizer for the Amalgam textual syntax.

use crate::ParseWarning;
use std::fmt;

/// Line/column of a token or warning; lines start at 1.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} column {}", self.line, self.column)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    OpenParen,
    CloseParen,
    Number(f64),
    StringLit(String),
    Symbol(String),
    /// `#name`; attaches a label to the following node.
    Label(String),
    /// A `;` comment, text without the leading `;` or trailing newline.
    Comment(String),
    /// `||`; marks the following form for concurrent evaluation.
    Concurrent,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub location: Location,
}

pub struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    line_start: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Lexer<'a> {
        Lexer {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line: 1,
            line_start: 0,
        }
    }

    pub fn location(&self) -> Location {
        Location {
            line: self.line,
            column: self.pos - self.line_start + 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.line_start = self.pos;
        }
        Some(b)
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    /// Returns the next token, `None` at end of input, or a warning for an
    /// unlexable character (which is skipped).
    pub fn next_token(&mut self) -> Result<Option<Token>, ParseWarning> {
        self.skip_whitespace();
        let location = self.location();
        let Some(b) = self.peek() else {
            return Ok(None);
        };

        match b {
            b'(' => {
                self.bump();
                Ok(Some(Token {
                    kind: TokenKind::OpenParen,
                    location,
                }))
            }
            b')' => {
                self.bump();
                Ok(Some(Token {
                    kind: TokenKind::CloseParen,
                    location,
                }))
            }
            b';' => {
                self.bump();
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if b == b'\n' {
                        break;
                    }
                    self.bump();
                }
                let text = self.src[start..self.pos].trim().to_string();
                Ok(Some(Token {
                    kind: TokenKind::Comment(text),
                    location,
                }))
            }
            b'#' => {
                self.bump();
                // further leading #s are part of the name (private labels)
                let mut name = String::new();
                while self.peek() == Some(b'#') {
                    self.bump();
                    name.push('#');
                }
                name.push_str(&self.take_symbol_text());
                Ok(Some(Token {
                    kind: TokenKind::Label(name),
                    location,
                }))
            }
            b'"' => self.lex_string(location),
            b'|' if self.bytes.get(self.pos + 1) == Some(&b'|') => {
                self.bump();
                self.bump();
                Ok(Some(Token {
                    kind: TokenKind::Concurrent,
                    location,
                }))
            }
            _ => {
                let text = self.take_symbol_text();
                if text.is_empty() {
                    // an isolated unlexable byte; skip it
                    self.bump();
                    return Err(ParseWarning {
                        location,
                        message: format!("unexpected character `{}`", b as char),
                    });
                }
                if let Some(value) = crate::write::number_from_token(&text) {
                    Ok(Some(Token {
                        kind: TokenKind::Number(value),
                        location,
                    }))
                } else {
                    Ok(Some(Token {
                        kind: TokenKind::Symbol(text),
                        location,
                    }))
                }
            }
        }
    }

    fn take_symbol_text(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() || matches!(b, b'(' | b')' | b'"' | b';' | b'#') {
                break;
            }
            self.bump();
        }
        self.src[start..self.pos].to_string()
    }

    fn lex_string(&mut self, location: Location) -> Result<Option<Token>, ParseWarning> {
        self.bump();
        // bytes accumulate so multi-byte UTF-8 sequences pass through intact
        let mut value: Vec<u8> = Vec::new();
        loop {
            match self.bump() {
                Some(b'"') => {
                    return Ok(Some(Token {
                        kind: TokenKind::StringLit(String::from_utf8_lossy(&value).into_owned()),
                        location,
                    }));
                }
                Some(b'\\') => match self.bump() {
                    Some(b'n') => value.push(b'\n'),
                    Some(b't') => value.push(b'\t'),
                    Some(b'r') => value.push(b'\r'),
                    Some(b'"') => value.push(b'"'),
                    Some(b'\\') => value.push(b'\\'),
                    Some(other) => {
                        value.push(b'\\');
                        value.push(other);
                    }
                    None => {
                        return Err(ParseWarning {
                            location,
                            message: "unterminated string".to_string(),
                        });
                    }
                },
                Some(other) => value.push(other),
                None => {
                    return Err(ParseWarning {
                        location,
                        message: "unterminated string".to_string(),
                    });
                }
            }
        }
    }
}
