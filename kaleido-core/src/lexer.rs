//! Lexer for Kaleido.
//!
//! Tokens are produced lazily from a forward-only character stream, one at
//! a time, so an interactive session only asks for more input when the
//! parser actually needs another token.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead};
use std::iter::Peekable;
use std::rc::Rc;

use crate::span::Span;

/// Kind of a token produced by the lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Special
    Eof,
    /// Malformed literal, e.g. a lone `.`.
    Error,

    // Keywords
    Def,
    Extern,
    If,
    Then,
    Else,
    For,
    In,

    // Identifiers and literals
    Identifier,
    Number,

    // Punctuation
    LParen,    // (
    RParen,    // )
    Semicolon, // ;
    Comma,     // ,

    /// Any other run of symbol characters, e.g. `+` or `<=`.
    Operator,
}

impl TokenKind {
    pub fn describe(self) -> &'static str {
        match self {
            TokenKind::Eof => "end of input",
            TokenKind::Error => "malformed token",
            TokenKind::Def => "`def`",
            TokenKind::Extern => "`extern`",
            TokenKind::If => "`if`",
            TokenKind::Then => "`then`",
            TokenKind::Else => "`else`",
            TokenKind::For => "`for`",
            TokenKind::In => "`in`",
            TokenKind::Identifier => "identifier",
            TokenKind::Number => "number",
            TokenKind::LParen => "`(`",
            TokenKind::RParen => "`)`",
            TokenKind::Semicolon => "`;`",
            TokenKind::Comma => "`,`",
            TokenKind::Operator => "operator",
        }
    }
}

/// A single token.
///
/// Equality is structural over kind, literal and numeric value; the
/// position is ignored.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub literal: String,
    /// Parsed value, present only for `Number` tokens.
    pub number: Option<f64>,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, literal: impl Into<String>, span: Span) -> Self {
        Token {
            kind,
            literal: literal.into(),
            number: None,
            span,
        }
    }

    pub fn number(value: f64, literal: impl Into<String>, span: Span) -> Self {
        Token {
            kind: TokenKind::Number,
            literal: literal.into(),
            number: Some(value),
            span,
        }
    }

    pub fn eof(span: Span) -> Self {
        Token::new(TokenKind::Eof, "", span)
    }

    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }

    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.literal == op
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.literal == other.literal && self.number == other.number
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Eof => f.write_str("end of input"),
            TokenKind::Identifier | TokenKind::Number | TokenKind::Operator | TokenKind::Error => {
                write!(f, "{} `{}`", self.kind.describe(), self.literal)
            }
            kind => f.write_str(kind.describe()),
        }
    }
}

/// Tokenizer over any character iterator, with one token of lookahead.
///
/// The lexer never fails; malformed input surfaces as `Error` or
/// `Operator` tokens that the parser rejects.
pub struct Lexer<I: Iterator<Item = char>> {
    chars: Peekable<I>,
    lookahead: Option<Token>,
    line: u32,
    column: u32,
    /// Text consumed since the current top-level form started.
    form_text: String,
}

impl<I: Iterator<Item = char>> Lexer<I> {
    pub fn new(chars: I) -> Self {
        Lexer {
            chars: chars.peekable(),
            lookahead: None,
            line: 1,
            column: 0,
            form_text: String::new(),
        }
    }

    /// Returns the next token without consuming it.
    pub fn peek(&mut self) -> &Token {
        let token = match self.lookahead.take() {
            Some(token) => token,
            None => self.lex(),
        };
        self.lookahead.insert(token)
    }

    /// Consumes and returns the next token. Returns `Eof` forever once the
    /// input is exhausted.
    pub fn next_token(&mut self) -> Token {
        match self.lookahead.take() {
            Some(token) => token,
            None => self.lex(),
        }
    }

    /// Marks the start of a new top-level form.
    ///
    /// A token already sitting in the lookahead belongs to the new form.
    pub fn begin_form(&mut self) {
        self.form_text = self
            .lookahead
            .as_ref()
            .map(|token| token.literal.clone())
            .unwrap_or_default();
    }

    pub fn form_text(&self) -> &str {
        &self.form_text
    }

    /// Drops the lookahead and the rest of the current input line.
    ///
    /// Returns the discarded remainder (without the newline).
    pub fn discard_line(&mut self) -> String {
        let at_eof = self.lookahead.take().is_some_and(|t| t.is(TokenKind::Eof));
        let mut rest = String::new();
        if !at_eof {
            while let Some(ch) = self.chars.next() {
                if ch == '\n' {
                    self.line += 1;
                    self.column = 0;
                    break;
                }
                rest.push(ch);
            }
        }
        self.form_text.clear();
        rest
    }

    fn lex(&mut self) -> Token {
        while self.chars.peek().is_some_and(|&ch| is_space(ch)) {
            self.bump();
        }

        let span = Span::new(self.line, self.column);
        let Some(&first) = self.chars.peek() else {
            return Token::eof(span);
        };

        if first.is_ascii_alphabetic() {
            let literal = self.take_while(|ch| ch.is_ascii_alphanumeric());
            let kind = keyword(&literal).unwrap_or(TokenKind::Identifier);
            return Token::new(kind, literal, span);
        }

        if first.is_ascii_digit() || first == '.' {
            return self.lex_number(span);
        }

        let kind = match first {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            ';' => TokenKind::Semicolon,
            ',' => TokenKind::Comma,
            _ => {
                let literal = self.take_while(|ch| !ends_operator(ch));
                return Token::new(TokenKind::Operator, literal, span);
            }
        };
        self.bump();
        Token::new(kind, first.to_string(), span)
    }

    // [0-9]*(\.[0-9]*)?
    fn lex_number(&mut self, span: Span) -> Token {
        let mut literal = self.take_while(|ch| ch.is_ascii_digit());
        if self.chars.peek() == Some(&'.') {
            self.bump();
            literal.push('.');
            literal.push_str(&self.take_while(|ch| ch.is_ascii_digit()));
        }

        match literal.parse::<f64>() {
            Ok(value) => Token::number(value, literal, span),
            Err(_) => Token::new(TokenKind::Error, literal, span),
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut text = String::new();
        while let Some(&ch) = self.chars.peek() {
            if !pred(ch) {
                break;
            }
            self.bump();
            text.push(ch);
        }
        text
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        self.form_text.push(ch);
        if ch == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(ch)
    }
}

impl<I: Iterator<Item = char>> Iterator for Lexer<I> {
    type Item = Token;

    /// Yields tokens up to, but not including, `Eof`.
    fn next(&mut self) -> Option<Token> {
        let token = self.next_token();
        (!token.is(TokenKind::Eof)).then_some(token)
    }
}

/// Tokenize a whole string. Mostly useful for tests and tooling.
pub fn tokenize(source: &str) -> Vec<Token> {
    Lexer::new(source.chars()).collect()
}

/// Character source that pulls one line at a time from a reader.
///
/// A read error ends the character stream. The error itself is kept and
/// can be taken through the [`ReadErrorSlot`] returned by
/// [`LineSource::error_slot`], which stays usable after the source has
/// been moved into a [`Lexer`].
pub struct LineSource<R> {
    reader: R,
    pending: VecDeque<char>,
    exhausted: bool,
    error: ReadErrorSlot,
}

/// Shared holder for the read error that ended a [`LineSource`].
#[derive(Debug, Clone, Default)]
pub struct ReadErrorSlot(Rc<RefCell<Option<io::Error>>>);

impl ReadErrorSlot {
    pub fn take(&self) -> Option<io::Error> {
        self.0.borrow_mut().take()
    }

    fn set(&self, err: io::Error) {
        *self.0.borrow_mut() = Some(err);
    }
}

impl<R: BufRead> LineSource<R> {
    pub fn new(reader: R) -> Self {
        LineSource {
            reader,
            pending: VecDeque::new(),
            exhausted: false,
            error: ReadErrorSlot::default(),
        }
    }

    pub fn error_slot(&self) -> ReadErrorSlot {
        self.error.clone()
    }
}

impl<R: BufRead> Iterator for LineSource<R> {
    type Item = char;

    fn next(&mut self) -> Option<char> {
        loop {
            if let Some(ch) = self.pending.pop_front() {
                return Some(ch);
            }
            if self.exhausted {
                return None;
            }
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => self.exhausted = true,
                Ok(_) => self.pending.extend(line.chars()),
                Err(err) => {
                    self.exhausted = true;
                    self.error.set(err);
                }
            }
        }
    }
}

fn keyword(text: &str) -> Option<TokenKind> {
    let kind = match text {
        "def" => TokenKind::Def,
        "extern" => TokenKind::Extern,
        "if" => TokenKind::If,
        "then" => TokenKind::Then,
        "else" => TokenKind::Else,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        _ => return None,
    };
    Some(kind)
}

fn is_space(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\n' | '\r' | '\x0b' | '\x0c')
}

fn ends_operator(ch: char) -> bool {
    is_space(ch) || ch.is_ascii_alphanumeric() || matches!(ch, '.' | '(' | ')' | ';')
}
