// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Error types for the Yue compiler.
//!
//! This module defines [`CompileError`], the single error type shared by the
//! parse and transform phases, and the framed display message that points at
//! the offending source location.
//!
//! # Error Categories
//!
//! - **Encoding errors**: the input is not valid UTF-8
//! - **Syntax errors**: the grammar could not match, or a grammar predicate
//!   rejected the input with a contextual message
//! - **Semantic errors**: transformer invariant violations (const
//!   reassignment, unresolved goto, target-gated operators, ...)
//!
//! All three carry the same payload: a message plus a 1-based line/column.
//! Any error aborts the compilation; there is no recovery or partial output.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::Span;
use crate::source::{Input, Pos};

/// A compilation failure at a known source location.
///
/// Line and column are 1-based and counted in decoded code points, matching
/// the positions carried on AST nodes.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{line}: {message}")]
pub struct CompileError {
    /// Description of the failure.
    pub message: String,
    /// 1-based source line.
    pub line: usize,
    /// 1-based source column.
    pub col: usize,
}

impl CompileError {
    /// Creates an error anchored at an explicit position.
    pub fn new(message: impl Into<String>, line: usize, col: usize) -> Self {
        Self {
            message: message.into(),
            line,
            col,
        }
    }

    /// Creates an error anchored at a parser position.
    pub fn at(message: impl Into<String>, pos: Pos) -> Self {
        Self::new(message, pos.line, pos.col)
    }

    /// Creates an error anchored at the beginning of an AST node span.
    pub fn span(message: impl Into<String>, span: Span) -> Self {
        Self::new(message, span.begin.line, span.begin.col)
    }

    /// The "invalid text encoding" error reported when input decoding fails.
    pub fn invalid_encoding() -> Self {
        Self::new("invalid text encoding", 1, 1)
    }

    /// Formats the multi-line display message framing the offending source
    /// line with a caret under the error column.
    ///
    /// Produces:
    ///
    /// ```text
    /// 3: attempt to assign to const variable 'x'
    /// x = 1
    /// ^
    /// ```
    ///
    /// Tabs in the quoted line are replaced with four spaces so the caret
    /// column stays aligned. `line_offset` is added to the reported line
    /// number, matching [`crate::YueConfig::line_offset`].
    pub fn display_message(&self, input: Option<&Input>, line_offset: i32) -> String {
        let shown_line = self.line as i64 + line_offset as i64;
        let input = match input {
            Some(input) => input,
            None => return format!("{}: {}", shown_line, self.message),
        };
        let raw = match input.line_text(self.line) {
            Some(text) => text,
            None => return format!("{}: {}", shown_line, self.message),
        };
        // Skip leading blanks past the reported column so the caret lands on
        // the first visible character of the offending token.
        let mut col = self.col.saturating_sub(1);
        let chars: Vec<char> = raw.chars().collect();
        while col < chars.len() && (chars[col] == ' ' || chars[col] == '\t') {
            col += 1;
        }
        let mut caret_col = 0usize;
        let mut line = String::new();
        for (i, ch) in chars.iter().enumerate() {
            let width = if *ch == '\t' {
                line.push_str("    ");
                4
            } else {
                line.push(*ch);
                1
            };
            if i < col {
                caret_col += width;
            }
        }
        format!(
            "{}: {}\n{}\n{}^",
            shown_line,
            self.message,
            line,
            " ".repeat(caret_col)
        )
    }
}

/// Convenience type alias for Results with [`CompileError`].
pub type Result<T> = std::result::Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_message_framing() {
        let input = Input::decode("a = 1\nb = c!\n").unwrap();
        let err = CompileError::new("syntax error", 2, 5);
        let message = err.display_message(Some(&input), 0);
        assert_eq!(message, "2: syntax error\nb = c!\n    ^");
    }

    #[test]
    fn test_display_message_tab_expansion() {
        let input = Input::decode("\tx == 1\n").unwrap();
        let err = CompileError::new("syntax error", 1, 2);
        let message = err.display_message(Some(&input), 0);
        assert_eq!(message, "1: syntax error\n    x == 1\n    ^");
    }

    #[test]
    fn test_line_offset_applies_to_header() {
        let err = CompileError::new("macro not defined", 4, 1);
        assert_eq!(err.display_message(None, 10), "14: macro not defined");
    }
}
