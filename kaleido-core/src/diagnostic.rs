//! Caret diagnostics for parse errors.

use std::fmt;

use crate::error::ParseError;
use crate::span::Span;

/// A rendered parse error: the message, the offending source line and a
/// caret under the token that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub span: Span,
    /// Source line as far as it was read, plus the discarded remainder.
    pub line: String,
    pub caret_column: usize,
    pub unexpected: String,
}

impl Diagnostic {
    /// `remainder` is whatever followed the offending token on its line.
    pub fn from_parse_error(err: &ParseError, remainder: &str) -> Self {
        let consumed = err
            .context
            .rsplit_once('\n')
            .map_or(err.context.as_str(), |(_, last)| last);
        let caret_column = consumed
            .chars()
            .count()
            .saturating_sub(err.token.literal.chars().count());

        Diagnostic {
            message: err.to_string(),
            span: err.token.span,
            line: format!("{consumed}{remainder}"),
            caret_column,
            unexpected: err.token.to_string(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error at {}: {}", self.span, self.message)?;
        writeln!(f, "{}", self.line)?;
        writeln!(
            f,
            "{:width$}^ unexpected {}",
            "",
            self.unexpected,
            width = self.caret_column
        )
    }
}
