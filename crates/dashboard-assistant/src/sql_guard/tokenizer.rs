//! Minimal SQLite lexer for the guard
//!
//! Only needs to be precise about what is *not* code: string literals and
//! comments. Anything outside the expected character set is a lexical error.
use crate::error::{GuardError, GuardReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Bare keyword or identifier, as written
    Word(String),
    /// `"ident"`, `` `ident` `` or `[ident]`
    QuotedIdent(String),
    /// `'literal'`, content with `''` unescaped
    Str(String),
    Number(String),
    Symbol(char),
    /// Two-character operators: `<=`, `>=`, `<>`, `!=`, `==`, `||`, `<<`, `>>`
    Operator(&'static str),
}

impl Token {
    pub fn is_symbol(&self, c: char) -> bool {
        matches!(self, Token::Symbol(s) if *s == c)
    }

    pub fn is_word(&self, word: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(word))
    }

    /// Identifier text for bare or quoted identifiers.
    pub fn ident(&self) -> Option<&str> {
        match self {
            Token::Word(w) | Token::QuotedIdent(w) => Some(w.as_str()),
            _ => None,
        }
    }
}

/// Token plus its byte span in the source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

const OPERATORS: [&str; 8] = ["<=", ">=", "<>", "!=", "==", "||", "<<", ">>"];
const SYMBOLS: &str = "(),.*;+-/%=<>|&~";

pub fn tokenize(sql: &str) -> Result<Vec<Spanned>, GuardError> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if c == b'-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            match sql[i + 2..].find("*/") {
                Some(offset) => i = i + 2 + offset + 2,
                None => return Err(lexical("unterminated block comment", start)),
            }
            continue;
        }

        if c == b'\'' {
            let (content, next) = read_quoted(sql, i, '\'')
                .ok_or_else(|| lexical("unterminated string literal", start))?;
            tokens.push(Spanned { token: Token::Str(content), start, end: next });
            i = next;
            continue;
        }

        if c == b'"' || c == b'`' || c == b'[' {
            let close = match c {
                b'"' => '"',
                b'`' => '`',
                _ => ']',
            };
            let (content, next) = read_quoted(sql, i, close)
                .ok_or_else(|| lexical("unterminated quoted identifier", start))?;
            tokens.push(Spanned { token: Token::QuotedIdent(content), start, end: next });
            i = next;
            continue;
        }

        if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit())) {
            i = read_number(bytes, i);
            tokens.push(Spanned { token: Token::Number(sql[start..i].to_string()), start, end: i });
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push(Spanned { token: Token::Word(sql[start..i].to_string()), start, end: i });
            continue;
        }

        if let Some(op) = OPERATORS.iter().find(|op| sql[i..].starts_with(**op)) {
            i += 2;
            tokens.push(Spanned { token: Token::Operator(*op), start, end: i });
            continue;
        }

        if SYMBOLS.as_bytes().contains(&c) {
            i += 1;
            tokens.push(Spanned { token: Token::Symbol(c as char), start, end: i });
            continue;
        }

        let unexpected = sql[i..].chars().next().unwrap_or('?');
        return Err(lexical(&format!("unexpected character '{}'", unexpected), start));
    }

    Ok(tokens)
}

/// Reads a quoted run starting at `open`; a doubled closing quote is an escape
/// (except for `]`). Returns the unescaped content and the index past the close.
fn read_quoted(sql: &str, open: usize, close: char) -> Option<(String, usize)> {
    let mut content = String::new();
    let mut chars = sql[open + 1..].char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        if ch == close {
            if close != ']' && chars.peek().map(|(_, next)| *next) == Some(close) {
                content.push(close);
                chars.next();
                continue;
            }
            return Some((content, open + 1 + offset + ch.len_utf8()));
        }
        content.push(ch);
    }
    None
}

fn read_number(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            i = j;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    i
}

fn lexical(message: &str, at: usize) -> GuardError {
    GuardError::new(GuardReason::Lexical, format!("{} at byte {}", message, at))
}
