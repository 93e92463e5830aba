// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! The PEG engine under the Yue grammar.
//!
//! A [`Cursor`] walks the decoded input with ordered-choice backtracking.
//! Rules return [`PResult`], whose failure side distinguishes two outcomes:
//!
//! - [`Fail::Miss`] — the alternative did not match; the caller rewinds and
//!   tries the next one.
//! - [`Fail::Abort`] — a semantic predicate rejected the input with a
//!   contextual message. Aborts are never caught by ordered choice; the
//!   first one wins and surfaces as the compile error.
//!
//! The cursor also owns the mutable grammar [`State`]: the indentation
//! stack, the long-string opener count, the production-disabling stacks and
//! the per-file export bookkeeping. Rules that push state are written so
//! that pushes and pops balance on every exit path, which is what makes
//! rewinding safe.

use std::collections::HashSet;

use crate::error::CompileError;
use crate::source::{Input, Pos};

/// Why a rule did not produce a value.
#[derive(Debug)]
pub enum Fail {
    /// Soft failure: backtrack and try the next alternative.
    Miss,
    /// Hard failure raised by a semantic predicate; aborts the parse.
    Abort(CompileError),
}

/// Result type of every grammar rule.
pub type PResult<T> = Result<T, Fail>;

/// A saved cursor position for backtracking.
#[derive(Debug, Clone, Copy)]
pub struct Mark {
    index: usize,
    line: usize,
    col: usize,
}

/// Mutable parser state threaded through semantic predicates.
#[derive(Debug)]
pub struct State {
    /// Indentation levels, top = current; `-1` marks a suppressed-indent
    /// region started by `prevent_indent`.
    pub indents: Vec<i32>,
    /// `=` count of the long-bracket string being read.
    pub string_open: usize,
    /// Disables the `do` statement inside headers that would swallow it.
    pub no_do: Vec<bool>,
    /// Disables indented chain continuation blocks.
    pub no_chain_block: Vec<bool>,
    /// Disables trailing table-block invoke arguments.
    pub no_table_block: Vec<bool>,
    /// Disables `for` loop headers (inside comprehension item position).
    pub no_for: Vec<bool>,
    /// Current expression nesting depth, capped at 100.
    pub exp_level: usize,
    /// Underscore-prefixed names seen in the source, so generated module
    /// names never collide.
    pub used_names: HashSet<String>,
    /// `export default` was parsed.
    pub export_default: bool,
    /// Number of `export` statements parsed.
    pub export_count: usize,
    /// An `export macro` was parsed.
    pub export_macro: bool,
    /// `export .<>` was parsed.
    pub export_metatable: bool,
    /// `export .<name>` was parsed.
    pub export_metamethod: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            indents: vec![0],
            string_open: 0,
            no_do: Vec::new(),
            no_chain_block: Vec::new(),
            no_table_block: Vec::new(),
            no_for: Vec::new(),
            exp_level: 0,
            used_names: HashSet::new(),
            export_default: false,
            export_count: 0,
            export_macro: false,
            export_metatable: false,
            export_metamethod: false,
        }
    }
}

const MAX_EXP_LEVEL: usize = 100;

/// The backtracking cursor over one decoded input.
pub struct Cursor<'a> {
    chars: &'a [char],
    index: usize,
    line: usize,
    col: usize,
    /// Deepest position reached before any rewind; where "syntax error" is
    /// reported when no alternative matched and no predicate aborted.
    pub farthest: Pos,
    /// Grammar state available to semantic predicates.
    pub state: State,
}

impl<'a> Cursor<'a> {
    /// Creates a cursor at the start of `input` with fresh state.
    pub fn new(input: &'a Input) -> Self {
        Self {
            chars: input.chars(),
            index: 0,
            line: 1,
            col: 1,
            farthest: Pos::start(),
            state: State::default(),
        }
    }

    /// The current position.
    pub fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            col: self.col,
            index: self.index,
        }
    }

    /// True when every character has been consumed.
    pub fn at_end(&self) -> bool {
        self.index >= self.chars.len()
    }

    /// The next character without consuming it.
    pub fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    /// The character `offset` places ahead without consuming.
    pub fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.index + offset).copied()
    }

    /// Consumes and returns the next character.
    pub fn bump(&mut self) -> Option<char> {
        let ch = self.chars.get(self.index).copied()?;
        self.index += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    /// Saves the cursor position (not the state stacks; rules balance those
    /// themselves).
    pub fn mark(&self) -> Mark {
        Mark {
            index: self.index,
            line: self.line,
            col: self.col,
        }
    }

    /// Restores a saved position, remembering the deepest point reached.
    pub fn rewind(&mut self, mark: Mark) {
        if self.index > self.farthest.index {
            self.farthest = self.pos();
        }
        self.index = mark.index;
        self.line = mark.line;
        self.col = mark.col;
    }

    /// Re-encodes the characters between `begin` and the current position.
    pub fn text_from(&self, begin: usize) -> String {
        self.chars[begin..self.index].iter().collect()
    }

    /// Raises a hard parse error at the current position.
    pub fn abort<T>(&self, msg: impl Into<String>) -> PResult<T> {
        Err(Fail::Abort(CompileError::at(msg, self.pos())))
    }

    /// Raises a hard parse error at an explicit position.
    pub fn abort_at<T>(&self, msg: impl Into<String>, pos: Pos) -> PResult<T> {
        Err(Fail::Abort(CompileError::at(msg, pos)))
    }

    // -- terminal matchers --------------------------------------------------

    /// Consumes `ch` if it is next.
    pub fn match_char(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// Consumes the literal `s` if it is next.
    pub fn match_str(&mut self, s: &str) -> bool {
        let mark = self.mark();
        for ch in s.chars() {
            if !self.match_char(ch) {
                self.rewind(mark);
                return false;
            }
        }
        true
    }

    /// True when the literal `s` is next, consuming nothing.
    pub fn peek_str(&self, s: &str) -> bool {
        let mut offset = 0;
        for ch in s.chars() {
            if self.peek_at(offset) != Some(ch) {
                return false;
            }
            offset += 1;
        }
        true
    }

    /// Consumes one character from `set`.
    pub fn match_set(&mut self, set: &str) -> Option<char> {
        let ch = self.peek()?;
        if set.contains(ch) {
            self.bump();
            Some(ch)
        } else {
            None
        }
    }

    /// Consumes one character in the inclusive range.
    pub fn match_range(&mut self, lo: char, hi: char) -> Option<char> {
        let ch = self.peek()?;
        if ch >= lo && ch <= hi {
            self.bump();
            Some(ch)
        } else {
            None
        }
    }

    /// `[a-zA-Z0-9_]` test without consuming.
    pub fn peek_alpha_num(&self) -> bool {
        matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_')
    }

    /// Consumes the keyword `word` only when not followed by an identifier
    /// character.
    pub fn match_keyword(&mut self, word: &str) -> bool {
        let mark = self.mark();
        if self.match_str(word) && !self.peek_alpha_num() {
            true
        } else {
            self.rewind(mark);
            false
        }
    }

    // -- combinators --------------------------------------------------------

    /// Runs `f`, rewinding on a miss. Misses become `Ok(None)`.
    pub fn opt<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<Option<T>> {
        let mark = self.mark();
        match f(self) {
            Ok(value) => Ok(Some(value)),
            Err(Fail::Miss) => {
                self.rewind(mark);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Runs `f`, rewinding the cursor on a miss without converting the miss.
    pub fn attempt<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        let mark = self.mark();
        match f(self) {
            Err(Fail::Miss) => {
                self.rewind(mark);
                Err(Fail::Miss)
            }
            other => other,
        }
    }

    /// Greedy repetition, zero or more.
    pub fn many0<T>(&mut self, mut f: impl FnMut(&mut Self) -> PResult<T>) -> PResult<Vec<T>> {
        let mut items = Vec::new();
        loop {
            let mark = self.mark();
            match f(self) {
                Ok(value) => items.push(value),
                Err(Fail::Miss) => {
                    self.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(items)
    }

    /// Greedy repetition, one or more.
    pub fn many1<T>(&mut self, mut f: impl FnMut(&mut Self) -> PResult<T>) -> PResult<Vec<T>> {
        let first = self.attempt(&mut f)?;
        let mut items = vec![first];
        loop {
            let mark = self.mark();
            match f(self) {
                Ok(value) => items.push(value),
                Err(Fail::Miss) => {
                    self.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(items)
    }

    /// Positive lookahead: succeeds when `f` matches, consuming nothing.
    pub fn check<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        let mark = self.mark();
        let result = f(self);
        self.rewind(mark);
        result
    }

    /// Negative lookahead: succeeds when `f` misses, consuming nothing.
    pub fn not_ahead<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<()> {
        let mark = self.mark();
        let result = f(self);
        self.rewind(mark);
        match result {
            Ok(_) => Err(Fail::Miss),
            Err(Fail::Miss) => Ok(()),
            Err(err) => Err(err),
        }
    }

    // -- expression nesting cap --------------------------------------------

    /// Enters one expression level, enforcing the nesting cap.
    pub fn inc_exp_level(&mut self) -> PResult<()> {
        self.state.exp_level += 1;
        if self.state.exp_level > MAX_EXP_LEVEL {
            return self.abort("nesting expressions exceeds 100 levels");
        }
        Ok(())
    }

    /// Leaves one expression level.
    pub fn dec_exp_level(&mut self) {
        self.state.exp_level -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtracking_restores_position() {
        let input = Input::decode("abc").unwrap();
        let mut c = Cursor::new(&input);
        let mark = c.mark();
        assert!(c.match_str("ab"));
        c.rewind(mark);
        assert!(c.match_str("abc"));
        assert!(c.at_end());
    }

    #[test]
    fn test_keyword_needs_boundary() {
        let input = Input::decode("form").unwrap();
        let mut c = Cursor::new(&input);
        assert!(!c.match_keyword("for"));
        assert!(c.match_keyword("form"));
    }

    #[test]
    fn test_line_col_tracking() {
        let input = Input::decode("a\nbb").unwrap();
        let mut c = Cursor::new(&input);
        c.bump();
        c.bump();
        assert_eq!((c.pos().line, c.pos().col), (2, 1));
        c.bump();
        assert_eq!((c.pos().line, c.pos().col), (2, 2));
    }

    #[test]
    fn test_abort_wins_over_choice() {
        let input = Input::decode("x").unwrap();
        let mut c = Cursor::new(&input);
        let result: PResult<()> = c.attempt(|c| c.abort("contextual message"));
        match result {
            Err(Fail::Abort(err)) => assert_eq!(err.message, "contextual message"),
            other => panic!("expected abort, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_exp_level_cap() {
        let input = Input::decode("").unwrap();
        let mut c = Cursor::new(&input);
        for _ in 0..100 {
            c.inc_exp_level().unwrap();
        }
        assert!(matches!(c.inc_exp_level(), Err(Fail::Abort(_))));
    }
}
