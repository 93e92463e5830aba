// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Decoded source buffer and position tracking.
//!
//! The parser operates on a buffer of decoded Unicode code points rather than
//! raw bytes, so that columns are counted in characters and identifiers may
//! contain non-ASCII code points. A leading UTF-8 BOM is stripped before
//! decoding. Re-encoding a span back to UTF-8 recovers leaf text and the
//! quoted line of framed error messages.

use serde::{Deserialize, Serialize};

use crate::error::CompileError;

/// A position inside the decoded source buffer.
///
/// `line` and `col` are 1-based; `col` counts decoded code points, not bytes.
/// `index` is the offset into the decoded buffer, playing the role of the
/// iterator carried by positions in parser combinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pos {
    /// 1-based source line.
    pub line: usize,
    /// 1-based source column in code points.
    pub col: usize,
    /// Offset into the decoded buffer.
    pub index: usize,
}

impl Pos {
    /// The position of the first character of the input.
    pub fn start() -> Self {
        Self {
            line: 1,
            col: 1,
            index: 0,
        }
    }
}

impl Default for Pos {
    fn default() -> Self {
        Self::start()
    }
}

/// The decoded source text of one compilation unit.
#[derive(Debug, Clone, Default)]
pub struct Input {
    chars: Vec<char>,
}

impl Input {
    /// Decodes a UTF-8 byte buffer, stripping a leading BOM.
    ///
    /// Returns the "invalid text encoding" error at line 1, column 1 when the
    /// bytes are not valid UTF-8.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CompileError> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        match std::str::from_utf8(bytes) {
            Ok(text) => Ok(Self {
                chars: text.chars().collect(),
            }),
            Err(_) => Err(CompileError::invalid_encoding()),
        }
    }

    /// Decodes an already-valid string, stripping a leading BOM.
    pub fn decode(text: &str) -> Result<Self, CompileError> {
        let text = text.strip_prefix('\u{FEFF}').unwrap_or(text);
        Ok(Self {
            chars: text.chars().collect(),
        })
    }

    /// The decoded code points.
    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    /// Number of decoded code points.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    /// True when the input is empty.
    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Re-encodes the half-open range `[begin, end)` to UTF-8.
    pub fn slice(&self, begin: usize, end: usize) -> String {
        let end = end.min(self.chars.len());
        if begin >= end {
            return String::new();
        }
        self.chars[begin..end].iter().collect()
    }

    /// The text of a 1-based source line, without its line break.
    ///
    /// Used by error display framing. Returns `None` when the line number is
    /// past the end of the input.
    pub fn line_text(&self, line: usize) -> Option<String> {
        if line == 0 {
            return None;
        }
        let mut current = 1usize;
        let mut begin = 0usize;
        for (i, ch) in self.chars.iter().enumerate() {
            if *ch == '\n' {
                if current == line {
                    let end = if i > begin && self.chars[i - 1] == '\r' {
                        i - 1
                    } else {
                        i
                    };
                    return Some(self.slice(begin, end));
                }
                current += 1;
                begin = i + 1;
            }
        }
        if current == line && begin <= self.chars.len() {
            return Some(self.slice(begin, self.chars.len()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bom_is_stripped() {
        let input = Input::from_bytes(b"\xEF\xBB\xBFx = 1").unwrap();
        assert_eq!(input.slice(0, input.len()), "x = 1");
    }

    #[test]
    fn test_invalid_encoding_is_reported_at_origin() {
        let err = Input::from_bytes(b"x = \xFF\xFE").unwrap_err();
        assert_eq!(err.message, "invalid text encoding");
        assert_eq!((err.line, err.col), (1, 1));
    }

    #[test]
    fn test_line_text_handles_crlf() {
        let input = Input::decode("a\r\nbb\r\nccc").unwrap();
        assert_eq!(input.line_text(1).as_deref(), Some("a"));
        assert_eq!(input.line_text(2).as_deref(), Some("bb"));
        assert_eq!(input.line_text(3).as_deref(), Some("ccc"));
        assert_eq!(input.line_text(4), None);
    }

    #[test]
    fn test_slice_counts_code_points() {
        let input = Input::decode("名前 = 1").unwrap();
        assert_eq!(input.slice(0, 2), "名前");
    }
}
