// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! The indent-sensitive Yue grammar.
//!
//! Each grammar rule is a function over the PEG [`Cursor`], returning the
//! typed AST node it produces. Alternation rewinds through [`Cursor::opt`] /
//! [`Cursor::attempt`]; hard rejections raised by semantic predicates carry
//! the contextual messages users see ("unexpected indent", "can not put hash
//! pair in a list", ...).
//!
//! Blocks are driven by the indentation stack: a block is a sequence of
//! lines whose indent matches the stack top, `advance` pushes a strictly
//! deeper level for a nested suite, and `prevent_indent` pushes `-1` to keep
//! an expression header (like `extends`) from being terminated by
//! indentation rules. Rules that push a level always pop it on every exit
//! path so backtracking stays balanced.

use std::collections::HashSet;

use lazy_static::lazy_static;

use crate::ast::*;
use crate::error::CompileError;
use crate::peg::{Cursor, Fail, PResult};
use crate::source::Input;

lazy_static! {
    /// Words reserved by Lua itself.
    pub static ref LUA_KEYWORDS: HashSet<&'static str> = [
        "and", "break", "do", "else", "elseif", "end", "false", "for",
        "function", "goto", "if", "in", "local", "nil", "not", "or",
        "repeat", "return", "then", "true", "until", "while",
    ]
    .into_iter()
    .collect();

    /// Words reserved by Yue (Lua keywords plus the dialect's own).
    pub static ref KEYWORDS: HashSet<&'static str> = [
        "and", "break", "do", "else", "elseif", "end", "false", "for",
        "function", "goto", "if", "in", "local", "nil", "not", "or",
        "repeat", "return", "then", "true", "until", "while",
        "as", "class", "continue", "export", "extends", "from", "global",
        "import", "macro", "switch", "try", "unless", "using", "when",
        "with",
    ]
    .into_iter()
    .collect();
}

/// Result of parsing one compilation unit.
#[derive(Debug)]
pub struct ParseInfo {
    /// The parsed file, absent on error.
    pub node: Option<File>,
    /// The first parse failure.
    pub error: Option<CompileError>,
    /// An `export default` statement was seen.
    pub export_default: bool,
    /// An `export macro` statement was seen.
    pub export_macro: bool,
    /// `export .<name>` without a preceding `export .<>`.
    pub export_metatable: bool,
    /// Generated module-table name when the file exports anything.
    pub module_name: Option<String>,
    /// Underscore-led names observed in the source.
    pub used_names: HashSet<String>,
}

/// Parses a whole file.
pub fn parse_file(input: &Input) -> ParseInfo {
    let mut c = Cursor::new(input);
    let result = file(&mut c);
    let state = &c.state;
    let mut info = ParseInfo {
        node: None,
        error: None,
        export_default: state.export_default,
        export_macro: state.export_macro,
        export_metatable: !state.export_metatable && state.export_metamethod,
        module_name: None,
        used_names: state.used_names.clone(),
    };
    match result {
        Ok(node) => {
            if c.state.export_count > 0 {
                let mut index = 0usize;
                let name = loop {
                    let candidate = format!("_module_{}", index);
                    if !info.used_names.contains(&candidate) {
                        break candidate;
                    }
                    index += 1;
                };
                info.used_names.insert(name.clone());
                info.module_name = Some(name);
            }
            info.node = Some(node);
        }
        Err(Fail::Abort(err)) => info.error = Some(err),
        Err(Fail::Miss) => {
            let pos = if c.pos().index > c.farthest.index {
                c.pos()
            } else {
                c.farthest
            };
            info.error = Some(CompileError::at("syntax error", pos));
        }
    }
    info
}

/// Parses standalone text with one rule; used to splice generated Yue code
/// (class mixin copying, macro expansion results) back into the AST.
pub(crate) fn parse_text<T>(
    text: &str,
    rule: fn(&mut Cursor) -> PResult<T>,
) -> Result<T, CompileError> {
    let input = Input::decode(text)?;
    let mut c = Cursor::new(&input);
    match rule(&mut c) {
        Ok(value) => Ok(value),
        Err(Fail::Abort(err)) => Err(err),
        Err(Fail::Miss) => Err(CompileError::at("syntax error", c.farthest)),
    }
}

/// Parses generated text as a block.
pub(crate) fn parse_block_text(text: &str) -> Result<Block, CompileError> {
    parse_text(text, |c| {
        let b = block(c)?;
        white(c)?;
        if c.at_end() {
            Ok(b)
        } else {
            Err(Fail::Miss)
        }
    })
}

/// Parses generated text as a single expression.
pub(crate) fn parse_exp_text(text: &str) -> Result<Exp, CompileError> {
    parse_text(text, |c| {
        space(c)?;
        let e = exp(c)?;
        white(c)?;
        if c.at_end() {
            Ok(e)
        } else {
            Err(Fail::Miss)
        }
    })
}

// ---------------------------------------------------------------------------
// Whitespace, comments, line structure
// ---------------------------------------------------------------------------

fn line_break(c: &mut Cursor) -> PResult<()> {
    let mark = c.mark();
    c.match_char('\r');
    if c.match_char('\n') {
        Ok(())
    } else {
        c.rewind(mark);
        Err(Fail::Miss)
    }
}

fn at_stop(c: &mut Cursor) -> bool {
    c.at_end() || c.peek() == Some('\n') || (c.peek() == Some('\r') && c.peek_at(1) == Some('\n'))
}

/// `--[[ ... ]]`, returning the inner text.
fn multi_line_comment(c: &mut Cursor) -> PResult<String> {
    if !c.match_str("--[[") {
        return Err(Fail::Miss);
    }
    let begin = c.pos().index;
    loop {
        if c.peek_str("]]") {
            let text = c.text_from(begin);
            c.match_str("]]");
            return Ok(text);
        }
        if c.bump().is_none() {
            return Ok(c.text_from(begin));
        }
    }
}

/// `-- ...` to end of line, returning the text after `--`.
fn line_comment(c: &mut Cursor) -> PResult<String> {
    if c.peek_str("--[[") || !c.match_str("--") {
        return Err(Fail::Miss);
    }
    let begin = c.pos().index;
    while !at_stop(c) {
        c.bump();
    }
    Ok(c.text_from(begin))
}

/// `\` line continuation: backslash, blanks/comments, then a line break.
fn escape_new_line(c: &mut Cursor) -> PResult<()> {
    c.attempt(|c| {
        if !c.match_char('\\') {
            return Err(Fail::Miss);
        }
        loop {
            match c.peek() {
                Some(' ') | Some('\t') => {
                    c.bump();
                }
                Some('-') if c.peek_str("--[[") => {
                    multi_line_comment(c)?;
                }
                _ => break,
            }
        }
        let _ = c.opt(line_comment)?;
        line_break(c)
    })
}

/// Inline space: blanks, block comments, line continuations, and an optional
/// trailing line comment.
fn space(c: &mut Cursor) -> PResult<()> {
    loop {
        match c.peek() {
            Some(' ') | Some('\t') => {
                c.bump();
            }
            Some('-') if c.peek_str("--[[") => {
                multi_line_comment(c)?;
            }
            Some('\\') => {
                if escape_new_line(c).is_err() {
                    break;
                }
            }
            _ => break,
        }
    }
    if c.peek_str("--") && !c.peek_str("--[[") {
        line_comment(c)?;
    }
    Ok(())
}

fn space_break(c: &mut Cursor) -> PResult<()> {
    c.attempt(|c| {
        space(c)?;
        line_break(c)
    })
}

/// Space spanning any number of line breaks.
fn white(c: &mut Cursor) -> PResult<()> {
    space(c)?;
    loop {
        let mark = c.mark();
        if line_break(c).is_err() {
            c.rewind(mark);
            break;
        }
        space(c)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Indentation
// ---------------------------------------------------------------------------

/// Consumes leading blanks, counting spaces as 1 and tabs as 4.
fn read_indent_width(c: &mut Cursor) -> i32 {
    let mut width = 0;
    loop {
        match c.peek() {
            Some(' ') => width += 1,
            Some('\t') => width += 4,
            _ => break,
        }
        c.bump();
    }
    width
}

fn indent_top(c: &Cursor) -> i32 {
    *c.state.indents.last().expect("indent stack is empty")
}

/// Lookahead: the next line's indent equals the current level.
fn check_indent_match(c: &mut Cursor) -> PResult<()> {
    let mark = c.mark();
    let width = read_indent_width(c);
    c.rewind(mark);
    if indent_top(c) == width {
        Ok(())
    } else {
        Err(Fail::Miss)
    }
}

/// Consuming variant of [`check_indent_match`].
fn check_indent(c: &mut Cursor) -> PResult<()> {
    let mark = c.mark();
    let width = read_indent_width(c);
    if indent_top(c) == width {
        Ok(())
    } else {
        c.rewind(mark);
        Err(Fail::Miss)
    }
}

/// Lookahead: the next line is strictly deeper; pushes the new level.
fn advance_match(c: &mut Cursor) -> PResult<()> {
    let mark = c.mark();
    let width = read_indent_width(c);
    c.rewind(mark);
    let top = indent_top(c);
    if top != -1 && width > top {
        c.state.indents.push(width);
        Ok(())
    } else {
        Err(Fail::Miss)
    }
}

/// Consuming variant of [`advance_match`].
fn advance(c: &mut Cursor) -> PResult<()> {
    let mark = c.mark();
    let width = read_indent_width(c);
    let top = indent_top(c);
    if top != -1 && width > top {
        c.state.indents.push(width);
        Ok(())
    } else {
        c.rewind(mark);
        Err(Fail::Miss)
    }
}

/// Lookahead: pushes whatever indent the next line has.
fn push_indent_match(c: &mut Cursor) -> PResult<()> {
    let mark = c.mark();
    let width = read_indent_width(c);
    c.rewind(mark);
    c.state.indents.push(width);
    Ok(())
}

/// Pushes `-1`, disabling indent-based block termination for the wrapped
/// rule.
fn prevent_indent(c: &mut Cursor) {
    c.state.indents.push(-1);
}

fn pop_indent(c: &mut Cursor) {
    c.state.indents.pop();
}

/// A nested suite: a line break, blank lines, then a deeper block.
fn in_block(c: &mut Cursor) -> PResult<Block> {
    c.attempt(|c| {
        space_break(c)?;
        loop {
            let mark = c.mark();
            while matches!(c.peek(), Some(' ') | Some('\t')) {
                c.bump();
            }
            if line_break(c).is_err() {
                c.rewind(mark);
                break;
            }
        }
        advance_match(c)?;
        let result = block(c);
        pop_indent(c);
        result
    })
}

// ---------------------------------------------------------------------------
// Disable stacks
// ---------------------------------------------------------------------------

fn top_allows(stack: &[bool]) -> bool {
    stack.last().map_or(true, |disabled| !*disabled)
}

fn disable_do_chain_arg_table_block<T>(
    c: &mut Cursor,
    f: impl FnOnce(&mut Cursor) -> PResult<T>,
) -> PResult<T> {
    c.state.no_do.push(true);
    c.state.no_chain_block.push(true);
    c.state.no_table_block.push(true);
    let result = f(c);
    c.state.no_do.pop();
    c.state.no_chain_block.pop();
    c.state.no_table_block.pop();
    result
}

fn disable_chain<T>(c: &mut Cursor, f: impl FnOnce(&mut Cursor) -> PResult<T>) -> PResult<T> {
    c.state.no_chain_block.push(true);
    let result = f(c);
    c.state.no_chain_block.pop();
    result
}

fn disable_arg_table_block<T>(
    c: &mut Cursor,
    f: impl FnOnce(&mut Cursor) -> PResult<T>,
) -> PResult<T> {
    c.state.no_table_block.push(true);
    let result = f(c);
    c.state.no_table_block.pop();
    result
}

fn disable_for<T>(c: &mut Cursor, f: impl FnOnce(&mut Cursor) -> PResult<T>) -> PResult<T> {
    c.state.no_for.push(true);
    let result = f(c);
    c.state.no_for.pop();
    result
}

// ---------------------------------------------------------------------------
// Names, numbers, simple leaves
// ---------------------------------------------------------------------------

fn is_name_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || (ch as u32) > 255
}

fn is_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || (ch as u32) > 255
}

/// An identifier, ASCII or Unicode.
fn identifier(c: &mut Cursor) -> PResult<Name> {
    let begin = c.pos();
    match c.peek() {
        Some(ch) if is_name_start(ch) => {
            c.bump();
        }
        _ => return Err(Fail::Miss),
    }
    while matches!(c.peek(), Some(ch) if is_name_char(ch)) {
        c.bump();
    }
    Ok(Name {
        text: c.text_from(begin.index),
        span: Span::new(begin, c.pos()),
    })
}

/// An identifier that is not a reserved word.
fn variable(c: &mut Cursor) -> PResult<Variable> {
    c.attempt(|c| {
        let name = identifier(c)?;
        let ascii_only = name.text.chars().all(|ch| (ch as u32) <= 255);
        if ascii_only && KEYWORDS.contains(name.text.as_str()) {
            return Err(Fail::Miss);
        }
        if name.text.starts_with('_') {
            c.state.used_names.insert(name.text.clone());
        }
        Ok(Variable {
            name: name.text,
            span: name.span,
        })
    })
}

/// A label name; Lua keywords are rejected.
fn label_name(c: &mut Cursor) -> PResult<LabelName> {
    c.attempt(|c| {
        let name = identifier(c)?;
        let ascii_only = name.text.chars().all(|ch| (ch as u32) <= 255);
        if ascii_only && LUA_KEYWORDS.contains(name.text.as_str()) {
            return Err(Fail::Miss);
        }
        Ok(LabelName {
            name: name.text,
            span: name.span,
        })
    })
}

/// An identifier that *is* a Lua keyword (legal after `\`).
fn lua_keyword_name(c: &mut Cursor) -> PResult<Name> {
    c.attempt(|c| {
        let name = identifier(c)?;
        if LUA_KEYWORDS.contains(name.text.as_str()) {
            Ok(name)
        } else {
            Err(Fail::Miss)
        }
    })
}

fn num_digits(c: &mut Cursor) -> PResult<()> {
    if !matches!(c.peek(), Some(ch) if ch.is_ascii_digit()) {
        return Err(Fail::Miss);
    }
    loop {
        match c.peek() {
            Some(ch) if ch.is_ascii_digit() => {
                c.bump();
            }
            Some('_') if matches!(c.peek_at(1), Some(d) if d.is_ascii_digit()) => {
                c.bump();
            }
            _ => break,
        }
    }
    Ok(())
}

fn hex_digits(c: &mut Cursor) -> PResult<()> {
    if !matches!(c.peek(), Some(ch) if ch.is_ascii_hexdigit()) {
        return Err(Fail::Miss);
    }
    loop {
        match c.peek() {
            Some(ch) if ch.is_ascii_hexdigit() => {
                c.bump();
            }
            Some('_') if matches!(c.peek_at(1), Some(d) if d.is_ascii_hexdigit()) => {
                c.bump();
            }
            _ => break,
        }
    }
    Ok(())
}

fn num_expo(c: &mut Cursor, markers: &str) -> bool {
    let mark = c.mark();
    if c.match_set(markers).is_some() {
        c.match_set("+-");
        if num_digits(c).is_ok() {
            return true;
        }
    }
    c.rewind(mark);
    false
}

fn lj_num_suffix(c: &mut Cursor) -> bool {
    let mark = c.mark();
    c.match_set("uU");
    if c.match_set("lL").is_some() && c.match_set("lL").is_some() {
        return true;
    }
    c.rewind(mark);
    false
}

/// A numeric literal, kept verbatim.
fn num(c: &mut Cursor) -> PResult<Num> {
    c.attempt(|c| {
        let begin = c.pos();
        if c.match_str("0x") || c.match_str("0X") {
            if hex_digits(c).is_ok() {
                let mark = c.mark();
                if c.match_char('.') && hex_digits(c).is_ok() {
                    num_expo(c, "pP");
                } else {
                    c.rewind(mark);
                    if !num_expo(c, "pP") {
                        lj_num_suffix(c);
                    }
                }
            } else if c.match_char('.') {
                hex_digits(c)?;
                num_expo(c, "pP");
            } else {
                return Err(Fail::Miss);
            }
        } else if num_digits(c).is_ok() {
            let mark = c.mark();
            if c.match_char('.') && num_digits(c).is_ok() {
                num_expo(c, "eE");
            } else {
                c.rewind(mark);
                if !num_expo(c, "eE") {
                    lj_num_suffix(c);
                }
            }
        } else if c.match_char('.') {
            num_digits(c)?;
            num_expo(c, "eE");
        } else {
            return Err(Fail::Miss);
        }
        Ok(Num {
            text: c.text_from(begin.index),
            span: Span::new(begin, c.pos()),
        })
    })
}

/// `@@name` / `@@` / `@name` / `@`.
fn self_item(c: &mut Cursor) -> PResult<SelfItem> {
    let begin = c.pos();
    if c.match_str("@@") {
        if let Some(name) = c.opt(identifier)? {
            return Ok(SelfItem::SelfClassName(name));
        }
        return Ok(SelfItem::SelfClass(Span::new(begin, c.pos())));
    }
    if c.match_char('@') {
        if let Some(name) = c.opt(identifier)? {
            return Ok(SelfItem::SelfName(name));
        }
        return Ok(SelfItem::SelfValue(Span::new(begin, c.pos())));
    }
    Err(Fail::Miss)
}

fn key_name(c: &mut Cursor) -> PResult<KeyName> {
    if let Some(item) = c.opt(self_item)? {
        return Ok(KeyName::SelfItem(item));
    }
    let name = identifier(c)?;
    Ok(KeyName::Name(name))
}

fn macro_name(c: &mut Cursor) -> PResult<MacroName> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('$') {
            return Err(Fail::Miss);
        }
        let name = identifier(c)?;
        Ok(MacroName {
            name: name.text,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn const_value(c: &mut Cursor) -> PResult<ConstValue> {
    c.attempt(|c| {
        let begin = c.pos();
        for word in ["nil", "true", "false"] {
            if c.match_keyword(word) {
                return Ok(ConstValue {
                    text: word.to_string(),
                    span: Span::new(begin, c.pos()),
                });
            }
        }
        Err(Fail::Miss)
    })
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

fn single_string(c: &mut Cursor) -> PResult<SingleString> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('\'') {
            return Err(Fail::Miss);
        }
        let text_begin = c.pos().index;
        loop {
            match c.peek() {
                Some('\\') if matches!(c.peek_at(1), Some('\'') | Some('\\')) => {
                    c.bump();
                    c.bump();
                }
                Some('\'') => break,
                Some(_) => {
                    c.bump();
                }
                None => return Err(Fail::Miss),
            }
        }
        let text = c.text_from(text_begin);
        c.match_char('\'');
        Ok(SingleString {
            text,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn double_string(c: &mut Cursor) -> PResult<DoubleString> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('"') {
            return Err(Fail::Miss);
        }
        let mut segments = Vec::new();
        loop {
            if c.peek_str("#{") {
                let seg_begin = c.pos();
                c.match_str("#{");
                space(c)?;
                let value = match c.attempt(exp) {
                    Ok(value) => value,
                    Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
                    Err(Fail::Miss) => {
                        return c.abort_at("invalid string interpolation", seg_begin)
                    }
                };
                space(c)?;
                if !c.match_char('}') {
                    return c.abort_at("invalid string interpolation", seg_begin);
                }
                segments.push(DoubleStringContent::Exp(Box::new(value)));
                continue;
            }
            match c.peek() {
                Some('"') => break,
                Some(_) => {
                    let seg_begin = c.pos();
                    loop {
                        match c.peek() {
                            Some('\\')
                                if matches!(
                                    c.peek_at(1),
                                    Some('"') | Some('\\') | Some('#')
                                ) =>
                            {
                                c.bump();
                                c.bump();
                            }
                            Some('"') | None => break,
                            Some(_) if c.peek_str("#{") => break,
                            Some(_) => {
                                c.bump();
                            }
                        }
                    }
                    let text = c.text_from(seg_begin.index);
                    segments.push(DoubleStringContent::Inner(
                        text,
                        Span::new(seg_begin, c.pos()),
                    ));
                }
                None => return Err(Fail::Miss),
            }
        }
        c.match_char('"');
        Ok(DoubleString {
            segments,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn lua_string(c: &mut Cursor) -> PResult<LuaString> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('[') {
            return Err(Fail::Miss);
        }
        let mut eqs = 0usize;
        while c.match_char('=') {
            eqs += 1;
        }
        if !c.match_char('[') {
            return Err(Fail::Miss);
        }
        c.state.string_open = eqs;
        let _ = c.opt(|c| line_break(c))?;
        let content_begin = c.pos().index;
        let closer: String = format!("]{}]", "=".repeat(eqs));
        loop {
            if c.peek_str(&closer) {
                let content = c.text_from(content_begin);
                c.match_str(&closer);
                return Ok(LuaString {
                    open_eqs: eqs,
                    content,
                    span: Span::new(begin, c.pos()),
                });
            }
            if c.bump().is_none() {
                return Err(Fail::Miss);
            }
        }
    })
}

fn string_lit(c: &mut Cursor) -> PResult<Str> {
    if let Some(s) = c.opt(double_string)? {
        return Ok(Str::Double(s));
    }
    if let Some(s) = c.opt(single_string)? {
        return Ok(Str::Single(s));
    }
    if let Some(s) = c.opt(lua_string)? {
        return Ok(Str::Lua(s));
    }
    Err(Fail::Miss)
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

fn unary_operator(c: &mut Cursor) -> PResult<UnaryOperator> {
    c.attempt(|c| {
        let begin = c.pos();
        if c.match_char('-') {
            if matches!(c.peek(), Some('>') | Some('=') | Some(' ') | Some('\t') | Some('-')) {
                return Err(Fail::Miss);
            }
            return Ok(UnaryOperator {
                op: "-".to_string(),
                span: Span::new(begin, c.pos()),
            });
        }
        if c.match_char('#') {
            return Ok(UnaryOperator {
                op: "#".to_string(),
                span: Span::new(begin, c.pos()),
            });
        }
        if c.match_char('~') {
            if matches!(c.peek(), Some('=') | Some(' ') | Some('\t')) {
                return Err(Fail::Miss);
            }
            return Ok(UnaryOperator {
                op: "~".to_string(),
                span: Span::new(begin, c.pos()),
            });
        }
        if c.match_keyword("not") {
            return Ok(UnaryOperator {
                op: "not".to_string(),
                span: Span::new(begin, c.pos()),
            });
        }
        Err(Fail::Miss)
    })
}

fn binary_operator(c: &mut Cursor) -> PResult<BinaryOperator> {
    c.attempt(|c| {
        let begin = c.pos();
        let op = if c.match_keyword("or") {
            "or".to_string()
        } else if c.match_keyword("and") {
            "and".to_string()
        } else {
            let two = ["<=", ">=", "~=", "!=", "==", "..", "<<", ">>", "//"];
            let mut found = None;
            for candidate in two {
                if c.match_str(candidate) {
                    found = Some(candidate.to_string());
                    break;
                }
            }
            match found {
                Some(op) => op,
                None => match c.match_set("+-*/%><|&~") {
                    Some(ch) => ch.to_string(),
                    None => return Err(Fail::Miss),
                },
            }
        };
        Ok(BinaryOperator {
            op,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn exp_not_tab(c: &mut Cursor) -> PResult<Exp> {
    c.attempt(|c| {
        c.not_ahead(|c| {
            if let Some(t) = c.opt(simple_table)? {
                return Ok(Value::SimpleTable(t));
            }
            let t = table_lit(c)?;
            Ok(Value::Simple(SimpleValue::TableLit(t)))
        })?;
        exp(c)
    })
}

/// `[a, b, c]` / `{a, b}` discrete membership list.
fn in_discrete(c: &mut Cursor) -> PResult<Vec<Exp>> {
    c.attempt(|c| {
        let close = if c.match_char('[') {
            ']'
        } else if c.match_char('{') {
            '}'
        } else {
            return Err(Fail::Miss);
        };
        space(c)?;
        let first = exp_not_tab(c)?;
        let mut items = vec![first];
        loop {
            let mark = c.mark();
            if space(c).is_ok() && c.match_char(',') {
                space(c)?;
                match c.opt(exp_not_tab)? {
                    Some(item) => items.push(item),
                    None => break,
                }
            } else {
                c.rewind(mark);
                break;
            }
        }
        space(c)?;
        if !c.match_char(close) {
            return Err(Fail::Miss);
        }
        Ok(items)
    })
}

fn in_tail(c: &mut Cursor) -> PResult<In> {
    c.attempt(|c| {
        let begin = c.pos();
        let negated = if c.match_keyword("not") {
            space(c)?;
            true
        } else {
            false
        };
        if !c.match_keyword("in") {
            return Err(Fail::Miss);
        }
        space(c)?;
        if let Some(items) = c.opt(in_discrete)? {
            return Ok(In {
                negated,
                target: InTarget::Discrete(items),
                span: Span::new(begin, c.pos()),
            });
        }
        if c.peek_str("not") {
            let mark = c.mark();
            if c.match_keyword("not") {
                return c.abort_at("deprecated use for unary operator 'not' to be here", begin);
            }
            c.rewind(mark);
        }
        let value = exp(c)?;
        Ok(In {
            negated,
            target: InTarget::Exp(Box::new(value)),
            span: Span::new(begin, c.pos()),
        })
    })
}

fn unary_exp(c: &mut Cursor) -> PResult<UnaryExp> {
    c.attempt(|c| {
        let begin = c.pos();
        let ops = c.many0(|c| {
            c.attempt(|c| {
                let op = unary_operator(c)?;
                space(c)?;
                Ok(op)
            })
        })?;
        let first = value(c)?;
        let mut expos = vec![first];
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<Value> {
                space(c)?;
                if !c.match_char('^') {
                    return Err(Fail::Miss);
                }
                c.many0(space_break)?;
                space(c)?;
                value(c)
            })();
            match step {
                Ok(v) => expos.push(v),
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        if expos.is_empty() {
            return Err(Fail::Miss);
        }
        let in_exp = c.opt(|c| {
            c.attempt(|c| {
                space(c)?;
                in_tail(c)
            })
        })?;
        Ok(UnaryExp {
            ops,
            expos,
            in_exp,
            span: Span::new(begin, c.pos()),
        })
    })
}

/// A `|>`-joined chain of unary expressions.
fn pipe_exprs(c: &mut Cursor) -> PResult<Vec<UnaryExp>> {
    let first = unary_exp(c)?;
    let mut items = vec![first];
    loop {
        let mark = c.mark();
        let step = (|| -> PResult<UnaryExp> {
            space(c)?;
            if !c.match_str("|>") {
                return Err(Fail::Miss);
            }
            c.many0(space_break)?;
            space(c)?;
            unary_exp(c)
        })();
        match step {
            Ok(v) => items.push(v),
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(items)
}

fn exp(c: &mut Cursor) -> PResult<Exp> {
    c.attempt(|c| {
        let begin = c.pos();
        let pipes = pipe_exprs(c)?;
        let mut op_values = Vec::new();
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<ExpOpValue> {
                space(c)?;
                let op = binary_operator(c)?;
                c.many0(space_break)?;
                space(c)?;
                let rhs = pipe_exprs(c)?;
                Ok(ExpOpValue {
                    op,
                    pipe_exprs: rhs,
                })
            })();
            match step {
                Ok(v) => op_values.push(v),
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        let nil_coalesced = c.opt(|c| {
            c.attempt(|c| {
                space(c)?;
                if !c.match_str("??") || c.peek() == Some('=') {
                    return Err(Fail::Miss);
                }
                space(c)?;
                exp(c)
            })
        })?;
        Ok(Exp {
            pipe_exprs: pipes,
            op_values,
            nil_coalesced: nil_coalesced.map(Box::new),
            span: Span::new(begin, c.pos()),
        })
    })
}

fn value(c: &mut Cursor) -> PResult<Value> {
    c.inc_exp_level()?;
    let result = (|| {
        if let Some(v) = c.opt(simple_value)? {
            return Ok(Value::Simple(v));
        }
        if let Some(t) = c.opt(simple_table)? {
            return Ok(Value::SimpleTable(t));
        }
        if let Some(chain) = c.opt(chain_value)? {
            return Ok(Value::Chain(chain));
        }
        if let Some(s) = c.opt(string_lit)? {
            return Ok(Value::Str(s));
        }
        Err(Fail::Miss)
    })();
    c.dec_exp_level();
    result
}

fn unary_value(c: &mut Cursor) -> PResult<UnaryValue> {
    c.attempt(|c| {
        let begin = c.pos();
        let ops = c.many1(|c| {
            c.attempt(|c| {
                let op = unary_operator(c)?;
                space(c)?;
                Ok(op)
            })
        })?;
        let v = value(c)?;
        Ok(UnaryValue {
            ops,
            value: Box::new(v),
            span: Span::new(begin, c.pos()),
        })
    })
}

fn simple_value(c: &mut Cursor) -> PResult<SimpleValue> {
    if let Some(t) = c.opt(table_lit)? {
        return Ok(SimpleValue::TableLit(t));
    }
    if let Some(v) = c.opt(const_value)? {
        return Ok(SimpleValue::Const(v));
    }
    if let Some(v) = c.opt(if_rule)? {
        return Ok(SimpleValue::If(Box::new(v)));
    }
    if let Some(v) = c.opt(switch_rule)? {
        return Ok(SimpleValue::Switch(Box::new(v)));
    }
    if let Some(v) = c.opt(try_rule)? {
        return Ok(SimpleValue::Try(Box::new(v)));
    }
    if let Some(v) = c.opt(with_rule)? {
        return Ok(SimpleValue::With(Box::new(v)));
    }
    if let Some(v) = c.opt(class_decl)? {
        return Ok(SimpleValue::ClassDecl(Box::new(v)));
    }
    if let Some(v) = c.opt(for_each_rule)? {
        return Ok(SimpleValue::ForEach(Box::new(v)));
    }
    if let Some(v) = c.opt(for_rule)? {
        return Ok(SimpleValue::For(Box::new(v)));
    }
    if let Some(v) = c.opt(while_rule)? {
        return Ok(SimpleValue::While(Box::new(v)));
    }
    if let Some(v) = c.opt(do_rule)? {
        return Ok(SimpleValue::Do(Box::new(v)));
    }
    if let Some(v) = c.opt(unary_value)? {
        return Ok(SimpleValue::UnaryValue(v));
    }
    if let Some(v) = c.opt(tbl_comprehension)? {
        return Ok(SimpleValue::TblComprehension(Box::new(v)));
    }
    if let Some(v) = c.opt(comprehension)? {
        return Ok(SimpleValue::Comprehension(Box::new(v)));
    }
    if let Some(v) = c.opt(fun_lit)? {
        return Ok(SimpleValue::FunLit(Box::new(v)));
    }
    if let Some(v) = c.opt(num)? {
        return Ok(SimpleValue::Num(v));
    }
    if c.peek_str("...") {
        let begin = c.pos();
        c.match_str("...");
        return Ok(SimpleValue::VarArg(Span::new(begin, c.pos())));
    }
    Err(Fail::Miss)
}

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

fn parens(c: &mut Cursor) -> PResult<Parens> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('(') {
            return Err(Fail::Miss);
        }
        c.many0(space_break)?;
        space(c)?;
        let value = exp(c)?;
        c.many0(space_break)?;
        space(c)?;
        if !c.match_char(')') {
            return Err(Fail::Miss);
        }
        Ok(Parens {
            expr: Box::new(value),
            span: Span::new(begin, c.pos()),
        })
    })
}

fn callable(c: &mut Cursor) -> PResult<Callable> {
    if let Some(v) = c.opt(variable)? {
        return Ok(Callable::Variable(v));
    }
    if let Some(item) = c.opt(self_item)? {
        return Ok(Callable::SelfItem(item));
    }
    if let Some(name) = c.opt(macro_name)? {
        return Ok(Callable::MacroName(name));
    }
    if let Some(p) = c.opt(parens)? {
        return Ok(Callable::Parens(p));
    }
    Err(Fail::Miss)
}

fn existential_op(c: &mut Cursor) -> PResult<Span> {
    c.attempt(|c| {
        let begin = c.pos();
        if c.match_char('?') && c.peek() != Some('?') {
            Ok(Span::new(begin, c.pos()))
        } else {
            Err(Fail::Miss)
        }
    })
}

fn table_appending_op(c: &mut Cursor) -> PResult<Span> {
    c.attempt(|c| {
        if c.peek() != Some('[') {
            return Err(Fail::Miss);
        }
        let begin = c.pos();
        if c.match_str("[]") {
            Ok(Span::new(begin, c.pos()))
        } else {
            c.abort("syntax error in bracket expression")
        }
    })
}

/// `[expr]` index.
fn index(c: &mut Cursor) -> PResult<Exp> {
    c.attempt(|c| {
        if !c.match_char('[') || c.peek() == Some('[') {
            return Err(Fail::Miss);
        }
        space(c)?;
        let value = exp(c)?;
        space(c)?;
        if !c.match_char(']') {
            return Err(Fail::Miss);
        }
        Ok(value)
    })
}

fn meta_index(c: &mut Cursor) -> PResult<MetaIndex> {
    if let Some(name) = c.opt(identifier)? {
        return Ok(MetaIndex::Name(name));
    }
    if let Some(e) = c.opt(index)? {
        return Ok(MetaIndex::Exp(Box::new(e)));
    }
    if let Some(s) = c.opt(string_lit)? {
        return Ok(MetaIndex::Str(s));
    }
    Err(Fail::Miss)
}

fn metamethod(c: &mut Cursor) -> PResult<Metamethod> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('<') {
            return Err(Fail::Miss);
        }
        space(c)?;
        let item = meta_index(c)?;
        space(c)?;
        if !c.match_char('>') {
            return Err(Fail::Miss);
        }
        Ok(Metamethod {
            item,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn dot_chain_item(c: &mut Cursor) -> PResult<DotChainItem> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('.') || c.peek() == Some('.') {
            return Err(Fail::Miss);
        }
        // `.<>` metatable access
        let meta_mark = c.mark();
        if c.match_char('<') {
            space(c)?;
            if c.match_char('>') {
                return Ok(DotChainItem {
                    name: DotName::Metatable(Span::new(begin, c.pos())),
                    span: Span::new(begin, c.pos()),
                });
            }
            c.rewind(meta_mark);
            if let Some(m) = c.opt(metamethod)? {
                return Ok(DotChainItem {
                    name: DotName::Metamethod(m),
                    span: Span::new(begin, c.pos()),
                });
            }
            return Err(Fail::Miss);
        }
        let name = identifier(c)?;
        Ok(DotChainItem {
            name: DotName::Name(name),
            span: Span::new(begin, c.pos()),
        })
    })
}

fn colon_chain_item(c: &mut Cursor) -> PResult<ColonChainItem> {
    c.attempt(|c| {
        let begin = c.pos();
        if !(c.match_char('\\') || c.match_str("::")) {
            return Err(Fail::Miss);
        }
        if let Some(m) = c.opt(metamethod)? {
            return Ok(ColonChainItem {
                name: ColonName::Metamethod(m),
                span: Span::new(begin, c.pos()),
            });
        }
        if let Some(kw) = c.opt(lua_keyword_name)? {
            return Ok(ColonChainItem {
                name: ColonName::LuaKeyword(kw),
                span: Span::new(begin, c.pos()),
            });
        }
        let name = identifier(c)?;
        Ok(ColonChainItem {
            name: ColonName::Name(name),
            span: Span::new(begin, c.pos()),
        })
    })
}

fn slice(c: &mut Cursor) -> PResult<Slice> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('[') || c.peek() == Some('[') {
            return Err(Fail::Miss);
        }
        space(c)?;
        let start = c.opt(exp)?;
        space(c)?;
        if !c.match_char(',') {
            return Err(Fail::Miss);
        }
        space(c)?;
        let stop = c.opt(exp)?;
        space(c)?;
        let step = if c.match_char(',') {
            space(c)?;
            Some(exp(c)?)
        } else {
            None
        };
        space(c)?;
        if !c.match_char(']') {
            return c.abort("syntax error in slice expression");
        }
        Ok(Slice {
            start: start.map(Box::new),
            stop: stop.map(Box::new),
            step: step.map(Box::new),
            span: Span::new(begin, c.pos()),
        })
    })
}

fn fn_args_value_list(c: &mut Cursor) -> PResult<Vec<Exp>> {
    let first = exp(c)?;
    let mut items = vec![first];
    loop {
        let mark = c.mark();
        let step = (|| -> PResult<Exp> {
            space(c)?;
            if !c.match_char(',') {
                return Err(Fail::Miss);
            }
            space(c)?;
            exp(c)
        })();
        match step {
            Ok(v) => items.push(v),
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(items)
}

/// Extra call-argument lines at a deeper indent.
fn fn_args_lit_lines(c: &mut Cursor) -> PResult<Vec<Exp>> {
    c.attempt(|c| {
        space_break(c)?;
        let mut items = fn_args_lit_line(c)?;
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<Vec<Exp>> {
                let comma = c.mark();
                if space(c).is_err() || !c.match_char(',') {
                    c.rewind(comma);
                }
                space_break(c)?;
                fn_args_lit_line(c)
            })();
            match step {
                Ok(more) => items.extend(more),
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(items)
    })
}

fn fn_args_lit_line(c: &mut Cursor) -> PResult<Vec<Exp>> {
    let mark = c.mark();
    push_indent_match(c)?;
    let attempt = (|| -> PResult<Vec<Exp>> {
        space(c)?;
        fn_args_value_list(c)
    })();
    pop_indent(c);
    match attempt {
        Ok(items) => Ok(items),
        Err(Fail::Abort(err)) => Err(Fail::Abort(err)),
        Err(Fail::Miss) => {
            c.rewind(mark);
            space(c)?;
            Ok(Vec::new())
        }
    }
}

/// Parenthesized arguments or the bang call.
fn fn_args(c: &mut Cursor) -> PResult<Invoke> {
    c.attempt(|c| {
        let begin = c.pos();
        if c.match_char('(') {
            let mut args = Vec::new();
            let first = c.opt(|c| {
                c.attempt(|c| {
                    space(c)?;
                    let items = fn_args_value_list(c)?;
                    let comma = c.mark();
                    if space(c).is_err() || !c.match_char(',') {
                        c.rewind(comma);
                    }
                    Ok(items)
                })
            })?;
            if let Some(items) = first {
                args.extend(items);
            }
            if let Some(items) = c.opt(fn_args_lit_lines)? {
                args.extend(items);
            }
            white(c)?;
            if !c.match_char(')') {
                return Err(Fail::Miss);
            }
            return Ok(Invoke {
                args: args.into_iter().map(InvokeArg::Exp).collect(),
                span: Span::new(begin, c.pos()),
            });
        }
        space(c)?;
        if c.match_char('!') && c.peek() != Some('=') {
            return Ok(Invoke {
                args: Vec::new(),
                span: Span::new(begin, c.pos()),
            });
        }
        Err(Fail::Miss)
    })
}

fn invoke(c: &mut Cursor) -> PResult<Invoke> {
    if let Some(inv) = c.opt(fn_args)? {
        return Ok(inv);
    }
    let begin = c.pos();
    if let Some(s) = c.opt(single_string)? {
        return Ok(Invoke {
            args: vec![InvokeArg::Str(Str::Single(s))],
            span: Span::new(begin, c.pos()),
        });
    }
    if let Some(s) = c.opt(double_string)? {
        return Ok(Invoke {
            args: vec![InvokeArg::Str(Str::Double(s))],
            span: Span::new(begin, c.pos()),
        });
    }
    if c.peek() == Some('[') {
        if let Some(s) = c.opt(lua_string)? {
            return Ok(Invoke {
                args: vec![InvokeArg::Str(Str::Lua(s))],
                span: Span::new(begin, c.pos()),
            });
        }
    }
    if c.peek() == Some('{') {
        if let Some(t) = c.opt(table_lit)? {
            return Ok(Invoke {
                args: vec![InvokeArg::TableLit(t)],
                span: Span::new(begin, c.pos()),
            });
        }
    }
    Err(Fail::Miss)
}

/// One chain step past the head.
fn chain_item_one(c: &mut Cursor, items: &mut Vec<ChainItem>) -> PResult<()> {
    if let Some(inv) = c.opt(invoke)? {
        items.push(ChainItem::Invoke(inv));
        if let Some(span) = c.opt(existential_op)? {
            items.push(ChainItem::Existential(span));
        }
        return Ok(());
    }
    if let Some(dot) = c.opt(dot_chain_item)? {
        items.push(ChainItem::Dot(dot));
        if let Some(span) = c.opt(existential_op)? {
            items.push(ChainItem::Existential(span));
        }
        return Ok(());
    }
    if let Some(s) = c.opt(slice)? {
        items.push(ChainItem::Slice(s));
        return Ok(());
    }
    if let Some(e) = c.opt(index)? {
        items.push(ChainItem::Index(Box::new(e)));
        if let Some(span) = c.opt(existential_op)? {
            items.push(ChainItem::Existential(span));
        }
        return Ok(());
    }
    Err(Fail::Miss)
}

fn colon_chain(c: &mut Cursor, items: &mut Vec<ChainItem>) -> PResult<()> {
    let colon = colon_chain_item(c)?;
    items.push(ChainItem::Colon(colon));
    if let Some(span) = c.opt(existential_op)? {
        items.push(ChainItem::Existential(span));
    }
    // invoke_chain: Invoke >> -ExistentialOp >> -chain_items
    let mark = c.mark();
    match c.opt(invoke)? {
        Some(inv) => {
            items.push(ChainItem::Invoke(inv));
            if let Some(span) = c.opt(existential_op)? {
                items.push(ChainItem::Existential(span));
            }
            let _ = c.opt(|c| chain_items(c, items))?;
        }
        None => c.rewind(mark),
    }
    Ok(())
}

fn chain_items(c: &mut Cursor, items: &mut Vec<ChainItem>) -> PResult<()> {
    match c.attempt(|c| colon_chain(c, items)) {
        Ok(()) => return Ok(()),
        Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
        Err(Fail::Miss) => {}
    }
    let mut matched = false;
    loop {
        let mark = c.mark();
        match chain_item_one(c, items) {
            Ok(()) => matched = true,
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    if !matched {
        return Err(Fail::Miss);
    }
    let _ = c.opt(|c| {
        let mut tail = Vec::new();
        colon_chain(c, &mut tail).map(|()| {
            items.extend(tail);
        })
    })?;
    Ok(())
}

/// The head of a chain plus its immediate items.
fn chain(c: &mut Cursor) -> PResult<Vec<ChainItem>> {
    // chain_call: Callable >> -ExistentialOp >> -chain_items
    let call = c.attempt(|c| {
        let mut items = Vec::new();
        let head = callable(c)?;
        items.push(ChainItem::Callable(head));
        if let Some(span) = c.opt(existential_op)? {
            items.push(ChainItem::Existential(span));
        }
        let _ = c.opt(|c| chain_items(c, &mut items))?;
        Ok(items)
    });
    match call {
        Ok(items) => return Ok(items),
        Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
        Err(Fail::Miss) => {}
    }
    // String >> chain_items
    let string_call = c.attempt(|c| {
        let mut items = Vec::new();
        let s = string_lit(c)?;
        items.push(ChainItem::Str(s));
        chain_items(c, &mut items)?;
        Ok(items)
    });
    match string_call {
        Ok(items) => return Ok(items),
        Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
        Err(Fail::Miss) => {}
    }
    // chain_dot_chain: DotChainItem >> -ExistentialOp >> -chain_items
    let dot = c.attempt(|c| {
        let mut items = Vec::new();
        let d = dot_chain_item(c)?;
        items.push(ChainItem::Dot(d));
        if let Some(span) = c.opt(existential_op)? {
            items.push(ChainItem::Existential(span));
        }
        let _ = c.opt(|c| chain_items(c, &mut items))?;
        Ok(items)
    });
    match dot {
        Ok(items) => return Ok(items),
        Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
        Err(Fail::Miss) => {}
    }
    // colon_chain
    let colon = c.attempt(|c| {
        let mut items = Vec::new();
        colon_chain(c, &mut items)?;
        Ok(items)
    });
    match colon {
        Ok(items) => return Ok(items),
        Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
        Err(Fail::Miss) => {}
    }
    // chain_index_chain: index >> -ExistentialOp >> -chain_items
    c.attempt(|c| {
        let mut items = Vec::new();
        let e = index(c)?;
        items.push(ChainItem::Index(Box::new(e)));
        if let Some(span) = c.opt(existential_op)? {
            items.push(ChainItem::Existential(span));
        }
        let _ = c.opt(|c| chain_items(c, &mut items))?;
        Ok(items)
    })
}

/// Indented chain continuation lines.
fn chain_block(c: &mut Cursor, items: &mut Vec<ChainItem>) -> PResult<()> {
    if !top_allows(&c.state.no_chain_block) {
        return Err(Fail::Miss);
    }
    c.attempt(|c| {
        c.many1(space_break)?;
        advance_match(c)?;
        let result = (|| -> PResult<()> {
            chain_line(c, items)?;
            loop {
                let mark = c.mark();
                let step = (|| -> PResult<()> {
                    c.many1(space_break)?;
                    chain_line(c, items)
                })();
                match step {
                    Ok(()) => {}
                    Err(Fail::Miss) => {
                        c.rewind(mark);
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        })();
        pop_indent(c);
        result
    })
}

fn chain_line(c: &mut Cursor, items: &mut Vec<ChainItem>) -> PResult<()> {
    check_indent_match(c)?;
    space(c)?;
    let matched = c.attempt(|c| {
        let d = dot_chain_item(c)?;
        items.push(ChainItem::Dot(d));
        if let Some(span) = c.opt(existential_op)? {
            items.push(ChainItem::Existential(span));
        }
        let _ = c.opt(|c| chain_items(c, items))?;
        Ok(())
    });
    match matched {
        Ok(()) => {}
        Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
        Err(Fail::Miss) => colon_chain(c, items)?,
    }
    if let Some(args) = c.opt(invoke_args)? {
        items.push(ChainItem::InvokeArgs(args));
    }
    Ok(())
}

fn chain_value(c: &mut Cursor) -> PResult<ChainValue> {
    c.attempt(|c| {
        let begin = c.pos();
        let mut items = chain(c)?;
        if let Some(span) = c.opt(existential_op)? {
            items.push(ChainItem::Existential(span));
        }
        let invoked = c.opt(invoke_args)?;
        match invoked {
            Some(args) => items.push(ChainItem::InvokeArgs(args)),
            None => {
                let _ = c.opt(|c| chain_block(c, &mut items))?;
            }
        }
        if let Some(span) = c.opt(table_appending_op)? {
            items.push(ChainItem::TableAppending(span));
        }
        Ok(ChainValue {
            items,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn assignable_chain(c: &mut Cursor) -> PResult<AssignableChain> {
    c.attempt(|c| {
        let begin = c.pos();
        // chain_list: requires at least one item after the head
        let items = {
            let with_head = c.attempt(|c| {
                let mut items = Vec::new();
                let head = callable(c)?;
                items.push(ChainItem::Callable(head));
                if let Some(span) = c.opt(existential_op)? {
                    items.push(ChainItem::Existential(span));
                }
                chain_items(c, &mut items)?;
                Ok(items)
            });
            match with_head {
                Ok(items) => items,
                Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
                Err(Fail::Miss) => {
                    let string_head = c.attempt(|c| {
                        let mut items = Vec::new();
                        let s = string_lit(c)?;
                        items.push(ChainItem::Str(s));
                        chain_items(c, &mut items)?;
                        Ok(items)
                    });
                    match string_head {
                        Ok(items) => items,
                        Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
                        Err(Fail::Miss) => {
                            let mut items = Vec::new();
                            let d = dot_chain_item(c)?;
                            items.push(ChainItem::Dot(d));
                            let _ = c.opt(|c| chain_items(c, &mut items))?;
                            items
                        }
                    }
                }
            }
        };
        Ok(AssignableChain {
            items,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn assignable(c: &mut Cursor) -> PResult<Assignable> {
    if let Some(chain) = c.opt(assignable_chain)? {
        return Ok(Assignable::Chain(chain));
    }
    if let Some(v) = c.opt(variable)? {
        return Ok(Assignable::Variable(v));
    }
    if let Some(item) = c.opt(self_item)? {
        return Ok(Assignable::SelfItem(item));
    }
    Err(Fail::Miss)
}

// ---------------------------------------------------------------------------
// Invoke args without parentheses
// ---------------------------------------------------------------------------

fn arg_table_block(c: &mut Cursor) -> PResult<TableBlock> {
    if !top_allows(&c.state.no_table_block) {
        return Err(Fail::Miss);
    }
    table_block(c)
}

fn invoke_args(c: &mut Cursor) -> PResult<InvokeArgs> {
    c.attempt(|c| {
        let begin = c.pos();
        match c.peek() {
            Some('-') | Some('~') => return Err(Fail::Miss),
            Some('[') if c.peek_at(1) == Some(']') => return Err(Fail::Miss),
            _ => {}
        }
        space(c)?;
        let mut args = Vec::new();
        let listed = c.attempt(|c| {
            let first = exp(c)?;
            let mut items = vec![InvokeArgsItem::Exp(first)];
            loop {
                let mark = c.mark();
                let step = (|| -> PResult<Exp> {
                    space(c)?;
                    if !c.match_char(',') {
                        return Err(Fail::Miss);
                    }
                    space(c)?;
                    exp(c)
                })();
                match step {
                    Ok(v) => items.push(InvokeArgsItem::Exp(v)),
                    Err(Fail::Miss) => {
                        c.rewind(mark);
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            let tail = c.opt(|c| {
                c.attempt(|c| {
                    space(c)?;
                    invoke_args_with_table(c)
                })
            })?;
            if let Some(more) = tail {
                items.extend(more);
            }
            Ok(items)
        });
        match listed {
            Ok(items) => args.extend(items),
            Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
            Err(Fail::Miss) => match c.opt(arg_table_block)? {
                Some(tb) => args.push(InvokeArgsItem::TableBlock(tb)),
                None => {
                    // leading-space parenthesized args are a hard error
                    let spaced = c.check(|c| {
                        if begin.index == c.pos().index {
                            return Err(Fail::Miss);
                        }
                        if !c.match_char('(') {
                            return Err(Fail::Miss);
                        }
                        space(c)?;
                        let _ = exp(c)?;
                        space(c)?;
                        if !c.match_char(',') {
                            return Err(Fail::Miss);
                        }
                        Ok(())
                    });
                    match spaced {
                        Ok(()) => {
                            return c.abort_at(
                                "write invoke arguments in parentheses without leading spaces \
                                 or just leading spaces without parentheses",
                                begin,
                            )
                        }
                        Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
                        Err(Fail::Miss) => return Err(Fail::Miss),
                    }
                }
            },
        }
        Ok(InvokeArgs {
            args,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn invoke_args_with_table(c: &mut Cursor) -> PResult<Vec<InvokeArgsItem>> {
    c.attempt(|c| {
        if c.match_char(',') {
            if let Some(tb) = c.opt(arg_table_block)? {
                return Ok(vec![InvokeArgsItem::TableBlock(tb)]);
            }
            space_break(c)?;
            advance_match(c)?;
            let result = (|| -> PResult<Vec<InvokeArgsItem>> {
                let mut items = arg_block(c)?;
                let tail = c.opt(|c| {
                    c.attempt(|c| {
                        let comma = c.mark();
                        if space(c).is_err() || !c.match_char(',') {
                            c.rewind(comma);
                        }
                        arg_table_block(c)
                    })
                })?;
                if let Some(tb) = tail {
                    items.push(InvokeArgsItem::TableBlock(tb));
                }
                Ok(items)
            })();
            pop_indent(c);
            return result;
        }
        let tb = arg_table_block(c)?;
        Ok(vec![InvokeArgsItem::TableBlock(tb)])
    })
}

fn arg_block(c: &mut Cursor) -> PResult<Vec<InvokeArgsItem>> {
    let mut items = arg_line(c)?;
    loop {
        let mark = c.mark();
        let step = (|| -> PResult<Vec<InvokeArgsItem>> {
            space(c)?;
            if !c.match_char(',') {
                return Err(Fail::Miss);
            }
            space_break(c)?;
            arg_line(c)
        })();
        match step {
            Ok(more) => items.extend(more),
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(items)
}

fn arg_line(c: &mut Cursor) -> PResult<Vec<InvokeArgsItem>> {
    c.attempt(|c| {
        check_indent_match(c)?;
        space(c)?;
        let items = fn_args_value_list(c)?;
        Ok(items.into_iter().map(InvokeArgsItem::Exp).collect())
    })
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

fn variable_pair(c: &mut Cursor) -> PResult<VariablePair> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char(':') {
            return Err(Fail::Miss);
        }
        let name = variable(c)?;
        Ok(VariablePair {
            name,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn pair_key(c: &mut Cursor) -> PResult<PairKey> {
    if let Some(k) = c.opt(key_name)? {
        return Ok(PairKey::KeyName(k));
    }
    if let Some(e) = c.opt(index)? {
        return Ok(PairKey::Exp(Box::new(e)));
    }
    if let Some(s) = c.opt(string_lit)? {
        return Ok(PairKey::Str(s));
    }
    Err(Fail::Miss)
}

fn pair_value(c: &mut Cursor) -> PResult<PairValue> {
    if let Some(e) = c.opt(exp)? {
        return Ok(PairValue::Exp(Box::new(e)));
    }
    if let Some(t) = c.opt(table_block)? {
        return Ok(PairValue::TableBlock(Box::new(t)));
    }
    c.attempt(|c| {
        c.many1(space_break)?;
        space(c)?;
        let e = exp(c)?;
        Ok(PairValue::Exp(Box::new(e)))
    })
}

fn normal_pair(c: &mut Cursor) -> PResult<NormalPair> {
    c.attempt(|c| {
        let begin = c.pos();
        let key = pair_key(c)?;
        if !c.match_char(':') || c.peek() == Some(':') {
            return Err(Fail::Miss);
        }
        space(c)?;
        let value = pair_value(c)?;
        Ok(NormalPair {
            key,
            value,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn meta_variable_pair(c: &mut Cursor) -> PResult<MetaVariablePair> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_str(":<") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let name = variable(c)?;
        space(c)?;
        if !c.match_char('>') {
            return Err(Fail::Miss);
        }
        Ok(MetaVariablePair {
            name,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn meta_normal_pair(c: &mut Cursor) -> PResult<MetaNormalPair> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('<') {
            return Err(Fail::Miss);
        }
        space(c)?;
        let key = c.opt(meta_index)?;
        space(c)?;
        if !c.match_str(">:") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let value = pair_value(c)?;
        Ok(MetaNormalPair {
            key,
            value,
            span: Span::new(begin, c.pos()),
        })
    })
}

/// `key: value` in any of its four shapes.
fn key_value(c: &mut Cursor) -> PResult<TableEntry> {
    if let Some(p) = c.opt(variable_pair)? {
        return Ok(TableEntry::VariablePair(p));
    }
    if let Some(p) = c.opt(normal_pair)? {
        return Ok(TableEntry::NormalPair(p));
    }
    if let Some(p) = c.opt(meta_variable_pair)? {
        return Ok(TableEntry::MetaVariablePair(p));
    }
    if let Some(p) = c.opt(meta_normal_pair)? {
        return Ok(TableEntry::MetaNormalPair(p));
    }
    Err(Fail::Miss)
}

fn key_value_list(c: &mut Cursor) -> PResult<Vec<TableEntry>> {
    let first = key_value(c)?;
    let mut items = vec![first];
    loop {
        let mark = c.mark();
        let step = (|| -> PResult<TableEntry> {
            space(c)?;
            if !c.match_char(',') {
                return Err(Fail::Miss);
            }
            space(c)?;
            key_value(c)
        })();
        match step {
            Ok(v) => items.push(v),
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(items)
}

/// Optional `= default` suffix of a destructuring pair.
fn destruct_def(c: &mut Cursor) -> PResult<Option<Exp>> {
    c.opt(|c| {
        c.attempt(|c| {
            space(c)?;
            if !c.match_char('=') || c.peek() == Some('=') {
                return Err(Fail::Miss);
            }
            space(c)?;
            exp(c)
        })
    })
}

/// One entry of a `{ }` literal.
fn table_value(c: &mut Cursor) -> PResult<TableEntry> {
    if let Some(p) = c.opt(variable_pair)? {
        let def = destruct_def(c)?;
        return Ok(match def {
            Some(d) => TableEntry::VariablePairDef(p, Some(d)),
            None => TableEntry::VariablePair(p),
        });
    }
    if let Some(p) = c.opt(normal_pair)? {
        let def = destruct_def(c)?;
        return Ok(match def {
            Some(d) => TableEntry::NormalPairDef(p, Some(d)),
            None => TableEntry::NormalPair(p),
        });
    }
    if let Some(p) = c.opt(meta_variable_pair)? {
        let def = destruct_def(c)?;
        return Ok(match def {
            Some(d) => TableEntry::MetaVariablePairDef(p, Some(d)),
            None => TableEntry::MetaVariablePair(p),
        });
    }
    if let Some(p) = c.opt(meta_normal_pair)? {
        let def = destruct_def(c)?;
        return Ok(match def {
            Some(d) => TableEntry::MetaNormalPairDef(p, Some(d)),
            None => TableEntry::MetaNormalPair(p),
        });
    }
    if let Some((e, span)) = c.opt(|c| {
        c.attempt(|c| {
            let begin = c.pos();
            if !c.match_str("...") {
                return Err(Fail::Miss);
            }
            space(c)?;
            let e = exp(c)?;
            Ok((e, Span::new(begin, c.pos())))
        })
    })? {
        return Ok(TableEntry::SpreadExp(e, span));
    }
    let e = exp(c)?;
    let def = destruct_def(c)?;
    Ok(TableEntry::NormalDef(e, def))
}

fn table_value_list(c: &mut Cursor) -> PResult<Vec<TableEntry>> {
    let first = table_value(c)?;
    let mut items = vec![first];
    loop {
        let mark = c.mark();
        let step = (|| -> PResult<TableEntry> {
            space(c)?;
            if !c.match_char(',') {
                return Err(Fail::Miss);
            }
            space(c)?;
            table_value(c)
        })();
        match step {
            Ok(v) => items.push(v),
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(items)
}

/// One deeper-indented line of a multi-line `{ }` literal.
fn table_lit_line(c: &mut Cursor) -> PResult<Vec<TableEntry>> {
    let mark = c.mark();
    push_indent_match(c)?;
    let attempt = (|| -> PResult<Vec<TableEntry>> {
        space(c)?;
        table_value_list(c)
    })();
    pop_indent(c);
    match attempt {
        Ok(items) => Ok(items),
        Err(Fail::Abort(err)) => Err(Fail::Abort(err)),
        Err(Fail::Miss) => {
            c.rewind(mark);
            space(c)?;
            Ok(Vec::new())
        }
    }
}

fn table_lit_lines(c: &mut Cursor) -> PResult<Vec<TableEntry>> {
    c.attempt(|c| {
        space_break(c)?;
        let mut items = table_lit_line(c)?;
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<Vec<TableEntry>> {
                let comma = c.mark();
                if space(c).is_err() || !c.match_char(',') {
                    c.rewind(comma);
                }
                space_break(c)?;
                table_lit_line(c)
            })();
            match step {
                Ok(more) => items.extend(more),
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        let comma = c.mark();
        if space(c).is_err() || !c.match_char(',') {
            c.rewind(comma);
        }
        Ok(items)
    })
}

fn table_lit(c: &mut Cursor) -> PResult<TableLit> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('{') {
            return Err(Fail::Miss);
        }
        let mut values = Vec::new();
        if let Some(items) = c.opt(|c| {
            c.attempt(|c| {
                space(c)?;
                let items = table_value_list(c)?;
                let comma = c.mark();
                if space(c).is_err() || !c.match_char(',') {
                    c.rewind(comma);
                }
                Ok(items)
            })
        })? {
            values.extend(items);
        }
        if let Some(items) = c.opt(table_lit_lines)? {
            values.extend(items);
        }
        white(c)?;
        if !c.match_char('}') {
            return Err(Fail::Miss);
        }
        Ok(TableLit {
            values,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn simple_table(c: &mut Cursor) -> PResult<SimpleTable> {
    c.attempt(|c| {
        let begin = c.pos();
        let pairs = key_value_list(c)?;
        Ok(SimpleTable {
            pairs,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn table_block_indent(c: &mut Cursor) -> PResult<TableBlockIndent> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('*') {
            return Err(Fail::Miss);
        }
        disable_arg_table_block(c, |c| {
            space(c)?;
            let mut values = key_value_list(c)?;
            let comma = c.mark();
            if space(c).is_err() || !c.match_char(',') {
                c.rewind(comma);
            }
            let deeper = c.opt(|c| {
                c.attempt(|c| {
                    c.many1(space_break)?;
                    advance_match(c)?;
                    space(c)?;
                    let result = (|| -> PResult<Vec<TableEntry>> {
                        let mut inner = key_value_list(c)?;
                        let comma = c.mark();
                        if space(c).is_err() || !c.match_char(',') {
                            c.rewind(comma);
                        }
                        loop {
                            let mark = c.mark();
                            let step = (|| -> PResult<Vec<TableEntry>> {
                                c.many1(space_break)?;
                                key_value_line(c)
                            })();
                            match step {
                                Ok(more) => inner.extend(more),
                                Err(Fail::Miss) => {
                                    c.rewind(mark);
                                    break;
                                }
                                Err(err) => return Err(err),
                            }
                        }
                        Ok(inner)
                    })();
                    pop_indent(c);
                    result
                })
            })?;
            if let Some(more) = deeper {
                values.extend(more);
            }
            Ok(TableBlockIndent {
                values,
                span: Span::new(begin, c.pos()),
            })
        })
    })
}

/// One line of a table block.
fn key_value_line(c: &mut Cursor) -> PResult<Vec<TableEntry>> {
    c.attempt(|c| {
        check_indent_match(c)?;
        space(c)?;
        if let Some(items) = c.opt(|c| {
            c.attempt(|c| {
                let items = key_value_list(c)?;
                let comma = c.mark();
                if space(c).is_err() || !c.match_char(',') {
                    c.rewind(comma);
                }
                Ok(items)
            })
        })? {
            return Ok(items);
        }
        if let Some(t) = c.opt(table_block_indent)? {
            return Ok(vec![TableEntry::TableBlockIndent(t)]);
        }
        if c.match_char('*') {
            space(c)?;
            if let Some((e, span)) = c.opt(|c| {
                c.attempt(|c| {
                    let begin = c.pos();
                    if !c.match_str("...") {
                        return Err(Fail::Miss);
                    }
                    space(c)?;
                    let e = exp(c)?;
                    Ok((e, Span::new(begin, c.pos())))
                })
            })? {
                return Ok(vec![TableEntry::SpreadExp(e, span)]);
            }
            if let Some(e) = c.opt(exp)? {
                return Ok(vec![TableEntry::NormalDef(e, None)]);
            }
            let t = table_block(c)?;
            return Ok(vec![TableEntry::TableBlock(t)]);
        }
        Err(Fail::Miss)
    })
}

/// A whole indented table block.
fn table_block(c: &mut Cursor) -> PResult<TableBlock> {
    c.attempt(|c| {
        let begin = c.pos();
        c.many1(space_break)?;
        advance_match(c)?;
        let result = (|| -> PResult<Vec<TableEntry>> {
            let mut values = key_value_line(c)?;
            loop {
                let mark = c.mark();
                let step = (|| -> PResult<Vec<TableEntry>> {
                    c.many1(space_break)?;
                    key_value_line(c)
                })();
                match step {
                    Ok(more) => values.extend(more),
                    Err(Fail::Miss) => {
                        c.rewind(mark);
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(values)
        })();
        pop_indent(c);
        let values = result?;
        Ok(TableBlock {
            values,
            span: Span::new(begin, c.pos()),
        })
    })
}

// ---------------------------------------------------------------------------
// Comprehensions
// ---------------------------------------------------------------------------

fn star_exp(c: &mut Cursor) -> PResult<Exp> {
    c.attempt(|c| {
        if !c.match_char('*') {
            return Err(Fail::Miss);
        }
        space(c)?;
        exp(c)
    })
}

fn name_or_destructure(c: &mut Cursor) -> PResult<NameOrDestructure> {
    if let Some(v) = c.opt(variable)? {
        return Ok(NameOrDestructure::Variable(v));
    }
    if let Some(t) = c.opt(table_lit)? {
        return Ok(NameOrDestructure::TableLit(t));
    }
    if let Some(l) = c.opt(comprehension)? {
        return Ok(NameOrDestructure::Comprehension(l));
    }
    Err(Fail::Miss)
}

fn assignable_name_list(c: &mut Cursor) -> PResult<AssignableNameList> {
    c.attempt(|c| {
        let begin = c.pos();
        let first = name_or_destructure(c)?;
        let mut items = vec![first];
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<NameOrDestructure> {
                space(c)?;
                if !c.match_char(',') {
                    return Err(Fail::Miss);
                }
                space(c)?;
                name_or_destructure(c)
            })();
            match step {
                Ok(v) => items.push(v),
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(AssignableNameList {
            items,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn comp_for(c: &mut Cursor) -> PResult<CompFor> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("for") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let var = variable(c)?;
        space(c)?;
        if !c.match_char('=') {
            return Err(Fail::Miss);
        }
        space(c)?;
        let start = exp(c)?;
        space(c)?;
        if !c.match_char(',') {
            return Err(Fail::Miss);
        }
        space(c)?;
        let stop = exp(c)?;
        let step = c.opt(|c| {
            c.attempt(|c| {
                if !c.match_char(',') {
                    return Err(Fail::Miss);
                }
                space(c)?;
                exp(c)
            })
        })?;
        Ok(CompFor {
            var,
            start,
            stop,
            step,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn comp_for_each(c: &mut Cursor) -> PResult<CompForEach> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("for") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let name_list = assignable_name_list(c)?;
        space(c)?;
        if !c.match_keyword("in") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let loop_value = if let Some(e) = c.opt(star_exp)? {
            CompForValue::Star(Box::new(e))
        } else {
            CompForValue::Exp(Box::new(exp(c)?))
        };
        Ok(CompForEach {
            name_list,
            loop_value,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn comp_clause(c: &mut Cursor) -> PResult<CompClause> {
    if let Some(f) = c.opt(comp_for)? {
        return Ok(CompClause::For(f));
    }
    if let Some(f) = c.opt(comp_for_each)? {
        return Ok(CompClause::ForEach(f));
    }
    c.attempt(|c| {
        if !c.match_keyword("when") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let e = exp(c)?;
        Ok(CompClause::When(e))
    })
}

fn comp_inner(c: &mut Cursor) -> PResult<CompInner> {
    c.attempt(|c| {
        let begin = c.pos();
        let first = if let Some(f) = c.opt(comp_for_each)? {
            CompClause::ForEach(f)
        } else {
            CompClause::For(comp_for(c)?)
        };
        let mut clauses = vec![first];
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<CompClause> {
                space(c)?;
                comp_clause(c)
            })();
            match step {
                Ok(clause) => clauses.push(clause),
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(CompInner {
            clauses,
            span: Span::new(begin, c.pos()),
        })
    })
}

/// One produced item of a `[ ]` literal; hash pairs are a hard error.
fn list_value(c: &mut Cursor) -> PResult<CompItem> {
    let begin = c.pos();
    let is_pair = c
        .check(|c| {
            let kv = key_value(c)?;
            Ok(kv)
        })
        .is_ok();
    if is_pair {
        return c.abort_at("can not put hash pair in a list", begin);
    }
    if let Some(e) = c.opt(|c| {
        c.attempt(|c| {
            if !c.match_str("...") {
                return Err(Fail::Miss);
            }
            space(c)?;
            exp(c)
        })
    })? {
        return Ok(CompItem::Spread(e));
    }
    let e = exp(c)?;
    let def = destruct_def(c)?;
    Ok(CompItem::Value(e, def))
}

fn list_value_list(c: &mut Cursor) -> PResult<Vec<CompItem>> {
    let mut items = Vec::new();
    loop {
        let mark = c.mark();
        let step = (|| -> PResult<CompItem> {
            space(c)?;
            if !c.match_char(',') {
                return Err(Fail::Miss);
            }
            space(c)?;
            list_value(c)
        })();
        match step {
            Ok(v) => items.push(v),
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    if items.is_empty() {
        Err(Fail::Miss)
    } else {
        Ok(items)
    }
}

fn list_lit_line(c: &mut Cursor) -> PResult<Vec<CompItem>> {
    let mark = c.mark();
    push_indent_match(c)?;
    let attempt = (|| -> PResult<Vec<CompItem>> {
        space(c)?;
        let first = list_value(c)?;
        let mut items = vec![first];
        if let Some(more) = c.opt(list_value_list)? {
            items.extend(more);
        }
        Ok(items)
    })();
    pop_indent(c);
    match attempt {
        Ok(items) => Ok(items),
        Err(Fail::Abort(err)) => Err(Fail::Abort(err)),
        Err(Fail::Miss) => {
            c.rewind(mark);
            space(c)?;
            Ok(Vec::new())
        }
    }
}

fn list_lit_lines(c: &mut Cursor) -> PResult<Vec<CompItem>> {
    c.attempt(|c| {
        c.many1(space_break)?;
        let mut items = list_lit_line(c)?;
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<Vec<CompItem>> {
                let comma = c.mark();
                if space(c).is_err() || !c.match_char(',') {
                    c.rewind(comma);
                }
                space_break(c)?;
                list_lit_line(c)
            })();
            match step {
                Ok(more) => items.extend(more),
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        let comma = c.mark();
        if space(c).is_err() || !c.match_char(',') {
            c.rewind(comma);
        }
        Ok(items)
    })
}

/// `[ ]` literal or list comprehension.
fn comprehension(c: &mut Cursor) -> PResult<Comprehension> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('[') || c.peek() == Some('[') {
            return Err(Fail::Miss);
        }
        space(c)?;
        // single leading value, then either a comprehension tail or more list
        // values
        let leading = c.attempt(|c| disable_for(c, list_value));
        match leading {
            Ok(first) => {
                space(c)?;
                if let Some(inner) = c.opt(comp_inner)? {
                    space(c)?;
                    if !c.match_char(']') {
                        return Err(Fail::Miss);
                    }
                    return Ok(Comprehension {
                        items: vec![first],
                        for_loop: Some(inner),
                        span: Span::new(begin, c.pos()),
                    });
                }
                let mut items = vec![first];
                if let Some(more) = c.opt(list_value_list)? {
                    items.extend(more);
                }
                let comma = c.mark();
                if space(c).is_err() || !c.match_char(',') {
                    c.rewind(comma);
                }
                if let Some(more) = c.opt(list_lit_lines)? {
                    items.extend(more);
                }
                white(c)?;
                if !c.match_char(']') {
                    return Err(Fail::Miss);
                }
                Ok(Comprehension {
                    items,
                    for_loop: None,
                    span: Span::new(begin, c.pos()),
                })
            }
            Err(Fail::Abort(err)) => Err(Fail::Abort(err)),
            Err(Fail::Miss) => {
                if let Some(items) = c.opt(list_lit_lines)? {
                    white(c)?;
                    if !c.match_char(']') {
                        return Err(Fail::Miss);
                    }
                    return Ok(Comprehension {
                        items,
                        for_loop: None,
                        span: Span::new(begin, c.pos()),
                    });
                }
                white(c)?;
                if !c.match_char(']') {
                    return Err(Fail::Miss);
                }
                // `[] = v` is table appending, not an empty list
                c.not_ahead(|c| {
                    c.attempt(|c| {
                        space(c)?;
                        if c.match_char('=') {
                            Ok(())
                        } else {
                            Err(Fail::Miss)
                        }
                    })
                })?;
                Ok(Comprehension {
                    items: Vec::new(),
                    for_loop: None,
                    span: Span::new(begin, c.pos()),
                })
            }
        }
    })
}

/// `{k, v for ...}` table comprehension; a malformed brace expression that
/// reached this far is a hard error.
fn tbl_comprehension(c: &mut Cursor) -> PResult<TblComprehension> {
    c.attempt(|c| {
        let begin = c.pos();
        if c.peek() != Some('{') {
            return Err(Fail::Miss);
        }
        let inner = c.attempt(|c| {
            c.match_char('{');
            space(c)?;
            let (key, value) = disable_for(c, |c| {
                let key = exp(c)?;
                space(c)?;
                let value = c.opt(|c| {
                    c.attempt(|c| {
                        if !c.match_char(',') {
                            return Err(Fail::Miss);
                        }
                        space(c)?;
                        let v = exp(c)?;
                        space(c)?;
                        Ok(v)
                    })
                })?;
                Ok((key, value))
            })?;
            let for_loop = comp_inner(c)?;
            space(c)?;
            if !c.match_char('}') {
                return Err(Fail::Miss);
            }
            Ok(TblComprehension {
                key,
                value,
                for_loop,
                span: Span::new(begin, c.pos()),
            })
        });
        match inner {
            Ok(t) => Ok(t),
            Err(Fail::Abort(err)) => Err(Fail::Abort(err)),
            Err(Fail::Miss) => c.abort_at("syntax error in brace expression", begin),
        }
    })
}

// ---------------------------------------------------------------------------
// Bodies and suites
// ---------------------------------------------------------------------------

fn body_rule(c: &mut Cursor) -> PResult<Body> {
    if let Some(b) = c.opt(in_block)? {
        return Ok(Body::Block(b));
    }
    let stmt = statement(c)?;
    Ok(Body::Statement(Box::new(stmt)))
}

/// `key(kw) >> body | in_block | hard error`.
fn body_with(c: &mut Cursor, kw: &str) -> PResult<Body> {
    match opt_body_with(c, kw)? {
        Some(body) => Ok(body),
        None => c.abort("must be followed by a statement or an indented block"),
    }
}

fn opt_body_with(c: &mut Cursor, kw: &str) -> PResult<Option<Body>> {
    let keyed = c.opt(|c| {
        c.attempt(|c| {
            if !c.match_keyword(kw) {
                return Err(Fail::Miss);
            }
            space(c)?;
            body_rule(c)
        })
    })?;
    if keyed.is_some() {
        return Ok(keyed);
    }
    Ok(c.opt(in_block)?.map(Body::Block))
}

// ---------------------------------------------------------------------------
// Control flow statements
// ---------------------------------------------------------------------------

fn exp_list(c: &mut Cursor) -> PResult<Vec<Exp>> {
    let first = exp(c)?;
    let mut items = vec![first];
    loop {
        let mark = c.mark();
        let step = (|| -> PResult<Exp> {
            space(c)?;
            if !c.match_char(',') {
                return Err(Fail::Miss);
            }
            space(c)?;
            exp(c)
        })();
        match step {
            Ok(v) => items.push(v),
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(items)
}

fn exp_list_low(c: &mut Cursor) -> PResult<Vec<Exp>> {
    let first = exp(c)?;
    let mut items = vec![first];
    loop {
        let mark = c.mark();
        let step = (|| -> PResult<Exp> {
            space(c)?;
            if c.match_set(",;").is_none() {
                return Err(Fail::Miss);
            }
            space(c)?;
            exp(c)
        })();
        match step {
            Ok(v) => items.push(v),
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(items)
}

fn assign_rule(c: &mut Cursor) -> PResult<Assign> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('=') || c.peek() == Some('=') {
            return Err(Fail::Miss);
        }
        space(c)?;
        if let Some(w) = c.opt(with_rule)? {
            return Ok(Assign {
                values: vec![AssignValue::With(Box::new(w))],
                span: Span::new(begin, c.pos()),
            });
        }
        if let Some(i) = c.opt(if_rule)? {
            return Ok(Assign {
                values: vec![AssignValue::If(Box::new(i))],
                span: Span::new(begin, c.pos()),
            });
        }
        if let Some(s) = c.opt(switch_rule)? {
            return Ok(Assign {
                values: vec![AssignValue::Switch(Box::new(s))],
                span: Span::new(begin, c.pos()),
            });
        }
        if let Some(t) = c.opt(table_block)? {
            return Ok(Assign {
                values: vec![AssignValue::TableBlock(t)],
                span: Span::new(begin, c.pos()),
            });
        }
        let exprs = exp_list_low(c)?;
        Ok(Assign {
            values: exprs.into_iter().map(AssignValue::Exp).collect(),
            span: Span::new(begin, c.pos()),
        })
    })
}

fn assignment_tail(c: &mut Cursor) -> PResult<Assignment> {
    c.attempt(|c| {
        let begin = c.pos();
        let exp_list_part = c.opt(|c| {
            c.attempt(|c| {
                if !c.match_char(',') {
                    return Err(Fail::Miss);
                }
                space(c)?;
                let items = exp_list(c)?;
                space(c)?;
                Ok(items)
            })
        })?;
        if c.match_char(':') {
            let assign = assign_rule(c)?;
            return Ok(Assignment {
                exp_list: exp_list_part,
                assign,
                span: Span::new(begin, c.pos()),
            });
        }
        if c.peek() == Some('=') {
            return c.abort("use := for if-assignment expression");
        }
        Err(Fail::Miss)
    })
}

fn if_cond(c: &mut Cursor) -> PResult<IfCond> {
    disable_chain(c, |c| {
        disable_arg_table_block(c, |c| {
            c.attempt(|c| {
                let begin = c.pos();
                let condition = exp(c)?;
                let assignment = c.opt(|c| {
                    c.attempt(|c| {
                        space(c)?;
                        assignment_tail(c)
                    })
                })?;
                Ok(IfCond {
                    condition,
                    assignment,
                    span: Span::new(begin, c.pos()),
                })
            })
        })
    })
}

fn if_rule(c: &mut Cursor) -> PResult<If> {
    c.attempt(|c| {
        let begin = c.pos();
        let unless = if c.match_keyword("if") {
            false
        } else if c.match_keyword("unless") {
            true
        } else {
            return Err(Fail::Miss);
        };
        space(c)?;
        let cond = if_cond(c)?;
        space(c)?;
        let body = opt_body_with(c, "then")?;
        let mut branches = vec![IfBranch { cond, body }];
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<IfBranch> {
                let nl = c.mark();
                if line_break(c).is_ok() {
                    c.many0(space_break)?;
                    if check_indent_match(c).is_err() {
                        c.rewind(nl);
                        return Err(Fail::Miss);
                    }
                } else {
                    c.rewind(nl);
                }
                space(c)?;
                if !c.match_keyword("elseif") {
                    return Err(Fail::Miss);
                }
                space(c)?;
                let cond = if_cond(c)?;
                space(c)?;
                let body = body_with(c, "then")?;
                Ok(IfBranch {
                    cond,
                    body: Some(body),
                })
            })();
            match step {
                Ok(branch) => branches.push(branch),
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        let else_body = c.opt(|c| {
            c.attempt(|c| {
                let nl = c.mark();
                if line_break(c).is_ok() {
                    c.many0(space_break)?;
                    if check_indent_match(c).is_err() {
                        c.rewind(nl);
                        return Err(Fail::Miss);
                    }
                } else {
                    c.rewind(nl);
                }
                space(c)?;
                if !c.match_keyword("else") {
                    return Err(Fail::Miss);
                }
                space(c)?;
                body_rule(c)
            })
        })?;
        Ok(If {
            unless,
            branches,
            else_body,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn while_rule(c: &mut Cursor) -> PResult<While> {
    c.attempt(|c| {
        let begin = c.pos();
        let until = if c.match_keyword("while") {
            false
        } else if c.match_keyword("until") {
            true
        } else {
            return Err(Fail::Miss);
        };
        space(c)?;
        let condition = disable_do_chain_arg_table_block(c, exp)?;
        space(c)?;
        let body = match opt_body_with(c, "do")? {
            Some(body) => body,
            None => return Err(Fail::Miss),
        };
        Ok(While {
            until,
            condition,
            body,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn repeat_rule(c: &mut Cursor) -> PResult<Repeat> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("repeat") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let body = body_rule(c)?;
        line_break(c)?;
        c.many0(space_break)?;
        check_indent_match(c)?;
        space(c)?;
        if !c.match_keyword("until") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let condition = exp(c)?;
        Ok(Repeat {
            body,
            condition,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn for_keyword(c: &mut Cursor) -> PResult<()> {
    if !top_allows(&c.state.no_for) {
        return Err(Fail::Miss);
    }
    if c.match_keyword("for") {
        Ok(())
    } else {
        Err(Fail::Miss)
    }
}

fn for_rule(c: &mut Cursor) -> PResult<For> {
    c.attempt(|c| {
        let begin = c.pos();
        for_keyword(c)?;
        space(c)?;
        let (var, start, stop, step) = disable_do_chain_arg_table_block(c, |c| {
            let var = variable(c)?;
            space(c)?;
            if !c.match_char('=') {
                return Err(Fail::Miss);
            }
            space(c)?;
            let start = exp(c)?;
            space(c)?;
            if !c.match_char(',') {
                return Err(Fail::Miss);
            }
            space(c)?;
            let stop = exp(c)?;
            space(c)?;
            let step = c.opt(|c| {
                c.attempt(|c| {
                    if !c.match_char(',') {
                        return Err(Fail::Miss);
                    }
                    space(c)?;
                    exp(c)
                })
            })?;
            Ok((var, start, stop, step))
        })?;
        space(c)?;
        let body = match opt_body_with(c, "do")? {
            Some(body) => body,
            None => return Err(Fail::Miss),
        };
        Ok(For {
            var,
            start,
            stop,
            step,
            body,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn for_each_rule(c: &mut Cursor) -> PResult<ForEach> {
    c.attempt(|c| {
        let begin = c.pos();
        for_keyword(c)?;
        space(c)?;
        let name_list = assignable_name_list(c)?;
        space(c)?;
        if !c.match_keyword("in") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let loop_value = disable_do_chain_arg_table_block(c, |c| {
            if let Some(e) = c.opt(star_exp)? {
                return Ok(ForEachValue::Star(Box::new(e)));
            }
            let items = exp_list(c)?;
            Ok(ForEachValue::ExpList(items))
        })?;
        space(c)?;
        let body = match opt_body_with(c, "do")? {
            Some(body) => body,
            None => return Err(Fail::Miss),
        };
        Ok(ForEach {
            name_list,
            loop_value,
            body,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn do_rule(c: &mut Cursor) -> PResult<Do> {
    c.attempt(|c| {
        let begin = c.pos();
        if !top_allows(&c.state.no_do) {
            return Err(Fail::Miss);
        }
        if !c.match_keyword("do") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let body = body_rule(c)?;
        Ok(Do {
            body,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn try_rule(c: &mut Cursor) -> PResult<Try> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("try") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let func = if let Some(b) = c.opt(in_block)? {
            TryFunc::Block(b)
        } else {
            TryFunc::Exp(Box::new(exp(c)?))
        };
        let catch = c.opt(|c| {
            c.attempt(|c| {
                let begin = c.pos();
                line_break(c)?;
                c.many0(space_break)?;
                check_indent_match(c)?;
                space(c)?;
                if !c.match_keyword("catch") {
                    return Err(Fail::Miss);
                }
                space(c)?;
                let err = variable(c)?;
                space(c)?;
                let block = in_block(c)?;
                Ok(CatchBlock {
                    err,
                    block,
                    span: Span::new(begin, c.pos()),
                })
            })
        })?;
        Ok(Try {
            func,
            catch,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn with_rule(c: &mut Cursor) -> PResult<With> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("with") {
            return Err(Fail::Miss);
        }
        let eop = c.opt(existential_op)?.is_some();
        space(c)?;
        let (value_list, assigns) = disable_do_chain_arg_table_block(c, |c| {
            let values = exp_list(c)?;
            let assigns = c.opt(|c| {
                c.attempt(|c| {
                    space(c)?;
                    assign_rule(c)
                })
            })?;
            Ok((values, assigns))
        })?;
        space(c)?;
        let body = body_with(c, "do")?;
        Ok(With {
            eop,
            value_list,
            assigns,
            body,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn switch_case(c: &mut Cursor) -> PResult<SwitchCase> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("when") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let conditions = disable_chain(c, |c| {
            disable_arg_table_block(c, |c| {
                let table_pattern = c.check(|c| {
                    if let Some(t) = c.opt(simple_table)? {
                        return Ok(Value::SimpleTable(t));
                    }
                    let t = table_lit(c)?;
                    Ok(Value::Simple(SimpleValue::TableLit(t)))
                });
                match table_pattern {
                    Ok(_) => Ok(vec![exp(c)?]),
                    Err(Fail::Abort(err)) => Err(Fail::Abort(err)),
                    Err(Fail::Miss) => {
                        let first = exp_not_tab(c)?;
                        let mut items = vec![first];
                        loop {
                            let mark = c.mark();
                            let step = (|| -> PResult<Exp> {
                                space(c)?;
                                if !c.match_char(',') {
                                    return Err(Fail::Miss);
                                }
                                space(c)?;
                                exp_not_tab(c)
                            })();
                            match step {
                                Ok(v) => items.push(v),
                                Err(Fail::Miss) => {
                                    c.rewind(mark);
                                    break;
                                }
                                Err(err) => return Err(err),
                            }
                        }
                        Ok(items)
                    }
                }
            })
        })?;
        space(c)?;
        let body = body_with(c, "then")?;
        Ok(SwitchCase {
            conditions,
            body,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn switch_else(c: &mut Cursor) -> PResult<Body> {
    c.attempt(|c| {
        if !c.match_keyword("else") {
            return Err(Fail::Miss);
        }
        space(c)?;
        body_rule(c)
    })
}

/// Trailing cases/else at the current indent level.
fn switch_block(
    c: &mut Cursor,
    branches: &mut Vec<SwitchCase>,
    else_body: &mut Option<Body>,
) -> PResult<()> {
    loop {
        let mark = c.mark();
        let step = (|| -> PResult<SwitchCase> {
            line_break(c)?;
            c.many0(space_break)?;
            check_indent_match(c)?;
            space(c)?;
            switch_case(c)
        })();
        match step {
            Ok(case) => branches.push(case),
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    if else_body.is_none() {
        let mark = c.mark();
        let step = (|| -> PResult<Body> {
            line_break(c)?;
            c.many0(space_break)?;
            check_indent_match(c)?;
            space(c)?;
            switch_else(c)
        })();
        match step {
            Ok(body) => *else_body = Some(body),
            Err(Fail::Miss) => c.rewind(mark),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn switch_rule(c: &mut Cursor) -> PResult<Switch> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("switch") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let target = exp(c)?;
        space(c)?;
        let mut branches = Vec::new();
        let mut else_body = None;
        let inline = c.attempt(|c| {
            let first = switch_case(c)?;
            space(c)?;
            Ok(first)
        });
        match inline {
            Ok(first) => {
                branches.push(first);
                let more_lines = c.attempt(|c| {
                    line_break(c)?;
                    c.many0(space_break)?;
                    check_indent_match(c)?;
                    space(c)?;
                    switch_case(c)
                });
                match more_lines {
                    Ok(case) => {
                        branches.push(case);
                        switch_block(c, &mut branches, &mut else_body)?;
                    }
                    Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
                    Err(Fail::Miss) => {
                        loop {
                            let mark = c.mark();
                            let step = (|| -> PResult<SwitchCase> {
                                space(c)?;
                                switch_case(c)
                            })();
                            match step {
                                Ok(case) => branches.push(case),
                                Err(Fail::Miss) => {
                                    c.rewind(mark);
                                    break;
                                }
                                Err(err) => return Err(err),
                            }
                        }
                        let mark = c.mark();
                        let tail = (|| -> PResult<Body> {
                            space(c)?;
                            switch_else(c)
                        })();
                        match tail {
                            Ok(body) => else_body = Some(body),
                            Err(Fail::Miss) => c.rewind(mark),
                            Err(err) => return Err(err),
                        }
                    }
                }
            }
            Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
            Err(Fail::Miss) => {
                c.many1(space_break)?;
                advance_match(c)?;
                let result = (|| -> PResult<()> {
                    space(c)?;
                    let first = switch_case(c)?;
                    branches.push(first);
                    switch_block(c, &mut branches, &mut else_body)
                })();
                pop_indent(c);
                result?;
            }
        }
        switch_block(c, &mut branches, &mut else_body)?;
        Ok(Switch {
            target,
            branches,
            else_body,
            span: Span::new(begin, c.pos()),
        })
    })
}

// ---------------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------------

fn class_block(c: &mut Cursor) -> PResult<ClassBlock> {
    c.attempt(|c| {
        let begin = c.pos();
        c.many1(space_break)?;
        advance_match(c)?;
        let result = (|| -> PResult<Vec<ClassContent>> {
            let mut contents = vec![class_line(c)?];
            loop {
                let mark = c.mark();
                let step = (|| -> PResult<ClassContent> {
                    c.many1(space_break)?;
                    class_line(c)
                })();
                match step {
                    Ok(content) => contents.push(content),
                    Err(Fail::Miss) => {
                        c.rewind(mark);
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(contents)
        })();
        pop_indent(c);
        let contents = result?;
        Ok(ClassBlock {
            contents,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn class_line(c: &mut Cursor) -> PResult<ClassContent> {
    c.attempt(|c| {
        check_indent_match(c)?;
        space(c)?;
        let content = if let Some(pairs) = c.opt(key_value_list)? {
            ClassContent::MemberList(pairs)
        } else {
            ClassContent::Statement(statement(c)?)
        };
        let comma = c.mark();
        if space(c).is_err() || !c.match_char(',') {
            c.rewind(comma);
        }
        Ok(content)
    })
}

fn class_decl(c: &mut Cursor) -> PResult<ClassDecl> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("class") || c.peek() == Some(':') {
            return Err(Fail::Miss);
        }
        let (name, extend, mixes) = disable_arg_table_block(c, |c| {
            let name = c.opt(|c| {
                c.attempt(|c| {
                    space(c)?;
                    assignable(c)
                })
            })?;
            let extend = c.opt(|c| {
                c.attempt(|c| {
                    space(c)?;
                    if !c.match_keyword("extends") {
                        return Err(Fail::Miss);
                    }
                    prevent_indent(c);
                    let result = (|| -> PResult<Exp> {
                        space(c)?;
                        exp(c)
                    })();
                    pop_indent(c);
                    result
                })
            })?;
            let mixes = c.opt(|c| {
                c.attempt(|c| {
                    space(c)?;
                    if !c.match_keyword("using") {
                        return Err(Fail::Miss);
                    }
                    prevent_indent(c);
                    let result = (|| -> PResult<Vec<Exp>> {
                        space(c)?;
                        exp_list(c)
                    })();
                    pop_indent(c);
                    result
                })
            })?;
            Ok((name, extend, mixes))
        })?;
        let body = c.opt(class_block)?;
        Ok(ClassDecl {
            name,
            extend,
            mixes,
            body,
            span: Span::new(begin, c.pos()),
        })
    })
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

fn fn_arg_def(c: &mut Cursor) -> PResult<FnArgDef> {
    c.attempt(|c| {
        let begin = c.pos();
        let (name, existential) = if let Some(v) = c.opt(variable)? {
            (FnArgName::Variable(v), false)
        } else {
            let item = self_item(c)?;
            let eop = c.opt(existential_op)?.is_some();
            (FnArgName::SelfItem(item), eop)
        };
        let default = c.opt(|c| {
            c.attempt(|c| {
                space(c)?;
                if !c.match_char('=') {
                    return Err(Fail::Miss);
                }
                space(c)?;
                exp(c)
            })
        })?;
        Ok(FnArgDef {
            name,
            existential,
            default,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn fn_arg_def_list_inner(c: &mut Cursor) -> PResult<Vec<FnArgDef>> {
    let first = fn_arg_def(c)?;
    let mut items = vec![first];
    loop {
        let mark = c.mark();
        let step = (|| -> PResult<FnArgDef> {
            space(c)?;
            if !c.match_char(',') {
                return Err(Fail::Miss);
            }
            space(c)?;
            fn_arg_def(c)
        })();
        match step {
            Ok(v) => items.push(v),
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(items)
}

fn fn_arg_def_line(c: &mut Cursor) -> PResult<Vec<FnArgDef>> {
    let mark = c.mark();
    push_indent_match(c)?;
    let attempt = (|| -> PResult<Vec<FnArgDef>> {
        space(c)?;
        fn_arg_def_list_inner(c)
    })();
    pop_indent(c);
    match attempt {
        Ok(items) => Ok(items),
        Err(Fail::Abort(err)) => Err(Fail::Abort(err)),
        Err(Fail::Miss) => {
            c.rewind(mark);
            space(c)?;
            Ok(Vec::new())
        }
    }
}

fn fn_arg_def_list(c: &mut Cursor) -> PResult<FnArgDefList> {
    c.attempt(|c| {
        let begin = c.pos();
        let lines = c.attempt(|c| {
            let mut items = fn_arg_def_line(c)?;
            loop {
                let mark = c.mark();
                let step = (|| -> PResult<Vec<FnArgDef>> {
                    let comma = c.mark();
                    if space(c).is_err() || !c.match_char(',') {
                        c.rewind(comma);
                    }
                    space_break(c)?;
                    fn_arg_def_line(c)
                })();
                match step {
                    Ok(more) => items.extend(more),
                    Err(Fail::Miss) => {
                        c.rewind(mark);
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            if items.is_empty() {
                Err(Fail::Miss)
            } else {
                Ok(items)
            }
        });
        match lines {
            Ok(definitions) => {
                let var_arg = c.opt(|c| {
                    c.attempt(|c| {
                        let comma = c.mark();
                        if space(c).is_err() || !c.match_char(',') {
                            c.rewind(comma);
                        }
                        white(c)?;
                        let begin = c.pos();
                        if !c.match_str("...") {
                            return Err(Fail::Miss);
                        }
                        Ok(Span::new(begin, c.pos()))
                    })
                })?;
                Ok(FnArgDefList {
                    definitions,
                    var_arg,
                    span: Span::new(begin, c.pos()),
                })
            }
            Err(Fail::Abort(err)) => Err(Fail::Abort(err)),
            Err(Fail::Miss) => {
                white(c)?;
                let va_begin = c.pos();
                if !c.match_str("...") {
                    return Err(Fail::Miss);
                }
                Ok(FnArgDefList {
                    definitions: Vec::new(),
                    var_arg: Some(Span::new(va_begin, c.pos())),
                    span: Span::new(begin, c.pos()),
                })
            }
        }
    })
}

fn outer_var_shadow(c: &mut Cursor) -> PResult<OuterVarShadow> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("using") {
            return Err(Fail::Miss);
        }
        space(c)?;
        if c.match_keyword("nil") {
            return Ok(OuterVarShadow {
                vars: None,
                span: Span::new(begin, c.pos()),
            });
        }
        let first = variable(c)?;
        let mut vars = vec![first];
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<Variable> {
                space(c)?;
                if !c.match_char(',') {
                    return Err(Fail::Miss);
                }
                space(c)?;
                variable(c)
            })();
            match step {
                Ok(v) => vars.push(v),
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(OuterVarShadow {
            vars: Some(vars),
            span: Span::new(begin, c.pos()),
        })
    })
}

fn fn_args_def(c: &mut Cursor) -> PResult<FnArgsDef> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('(') {
            return Err(Fail::Miss);
        }
        c.many0(space_break)?;
        let def_list = c.opt(fn_arg_def_list)?;
        let shadow = c.opt(|c| {
            c.attempt(|c| {
                white(c)?;
                outer_var_shadow(c)
            })
        })?;
        white(c)?;
        if !c.match_char(')') {
            return Err(Fail::Miss);
        }
        Ok(FnArgsDef {
            def_list,
            shadow,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn fun_lit(c: &mut Cursor) -> PResult<FunLit> {
    c.attempt(|c| {
        let begin = c.pos();
        let args_def = c.opt(fn_args_def)?;
        space(c)?;
        let arrow = if c.match_str("->") {
            FnArrow::Slim
        } else if c.match_str("=>") {
            FnArrow::Fat
        } else {
            return Err(Fail::Miss);
        };
        let body = c.opt(|c| {
            c.attempt(|c| {
                space(c)?;
                body_rule(c)
            })
        })?;
        Ok(FunLit {
            args_def,
            arrow,
            body,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn backcall(c: &mut Cursor) -> PResult<Backcall> {
    c.attempt(|c| {
        let begin = c.pos();
        let args_def = c.opt(|c| {
            c.attempt(|c| {
                let defs = fn_args_def(c)?;
                space(c)?;
                Ok(defs)
            })
        })?;
        if !c.match_char('<') {
            return Err(Fail::Miss);
        }
        let fat = match c.match_set("-=") {
            Some('=') => true,
            Some(_) => false,
            None => return Err(Fail::Miss),
        };
        space(c)?;
        let value = chain_value(c)?;
        Ok(Backcall {
            args_def,
            fat,
            value,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn pipe_body_stmt(c: &mut Cursor) -> PResult<PipeBody> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_str("|>") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let first = unary_exp(c)?;
        let mut values = vec![first];
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<UnaryExp> {
                c.many1(space_break)?;
                check_indent_match(c)?;
                space(c)?;
                if !c.match_str("|>") {
                    return Err(Fail::Miss);
                }
                space(c)?;
                unary_exp(c)
            })();
            match step {
                Ok(v) => values.push(v),
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(PipeBody {
            values,
            span: Span::new(begin, c.pos()),
        })
    })
}

// ---------------------------------------------------------------------------
// Macros
// ---------------------------------------------------------------------------

fn macro_lit(c: &mut Cursor) -> PResult<MacroLit> {
    c.attempt(|c| {
        let begin = c.pos();
        let args_def = c.opt(|c| {
            c.attempt(|c| {
                if !c.match_char('(') {
                    return Err(Fail::Miss);
                }
                white(c)?;
                let defs = c.opt(fn_arg_def_list)?;
                white(c)?;
                if !c.match_char(')') {
                    return Err(Fail::Miss);
                }
                space(c)?;
                Ok(defs)
            })
        })?;
        if !c.match_str("->") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let body = body_rule(c)?;
        Ok(MacroLit {
            args_def: args_def.flatten(),
            body,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn macro_def(c: &mut Cursor) -> PResult<MacroDef> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("macro") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let name = identifier(c)?;
        space(c)?;
        if !c.match_char('=') {
            return Err(Fail::Miss);
        }
        space(c)?;
        let lit = macro_lit(c)?;
        Ok(MacroDef {
            name: name.text,
            lit,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn macro_in_place(c: &mut Cursor) -> PResult<MacroInPlace> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_char('$') {
            return Err(Fail::Miss);
        }
        space(c)?;
        if !c.match_str("->") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let body = body_rule(c)?;
        Ok(MacroInPlace {
            body,
            span: Span::new(begin, c.pos()),
        })
    })
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

fn name_list(c: &mut Cursor) -> PResult<Vec<Variable>> {
    let first = variable(c)?;
    let mut names = vec![first];
    loop {
        let mark = c.mark();
        let step = (|| -> PResult<Variable> {
            space(c)?;
            if !c.match_char(',') {
                return Err(Fail::Miss);
            }
            space(c)?;
            variable(c)
        })();
        match step {
            Ok(v) => names.push(v),
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(names)
}

fn decl_values(c: &mut Cursor) -> PResult<Option<DeclValues>> {
    c.opt(|c| {
        c.attempt(|c| {
            space(c)?;
            if !c.match_char('=') {
                return Err(Fail::Miss);
            }
            space(c)?;
            if let Some(t) = c.opt(table_block)? {
                return Ok(DeclValues::TableBlock(t));
            }
            let exprs = exp_list_low(c)?;
            Ok(DeclValues::ExpListLow(exprs))
        })
    })
}

fn local_rule(c: &mut Cursor) -> PResult<Local> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("local") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let item = if c.match_char('*') {
            LocalItem::Star(Span::new(begin, c.pos()))
        } else if c.match_char('^') {
            LocalItem::Caret(Span::new(begin, c.pos()))
        } else {
            let names = name_list(c)?;
            let values = decl_values(c)?;
            LocalItem::Values { names, values }
        };
        Ok(Local {
            item,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn global_rule(c: &mut Cursor) -> PResult<Global> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("global") {
            return Err(Fail::Miss);
        }
        space(c)?;
        if let Some(decl) = c.opt(class_decl)? {
            return Ok(Global {
                item: GlobalItem::ClassDecl(Box::new(decl)),
                span: Span::new(begin, c.pos()),
            });
        }
        let item = if c.match_char('*') {
            GlobalItem::Star(Span::new(begin, c.pos()))
        } else if c.match_char('^') {
            GlobalItem::Caret(Span::new(begin, c.pos()))
        } else {
            let names = name_list(c)?;
            let values = decl_values(c)?;
            GlobalItem::Values { names, values }
        };
        Ok(Global {
            item,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn local_attrib_rule(c: &mut Cursor) -> PResult<LocalAttribDecl> {
    c.attempt(|c| {
        let begin = c.pos();
        let attrib = if c.match_keyword("const") {
            LocalAttrib::Const
        } else if c.match_keyword("close") {
            LocalAttrib::Close
        } else {
            return Err(Fail::Miss);
        };
        space(c)?;
        let target_one = |c: &mut Cursor| -> PResult<AttribTarget> {
            if attrib == LocalAttrib::Close {
                return Ok(AttribTarget::Variable(variable(c)?));
            }
            if let Some(v) = c.opt(variable)? {
                return Ok(AttribTarget::Variable(v));
            }
            if let Some(t) = c.opt(simple_table)? {
                return Ok(AttribTarget::SimpleTable(t));
            }
            if let Some(t) = c.opt(table_lit)? {
                return Ok(AttribTarget::TableLit(t));
            }
            if let Some(l) = c.opt(comprehension)? {
                return Ok(AttribTarget::Comprehension(l));
            }
            Err(Fail::Miss)
        };
        let first = target_one(c)?;
        let mut targets = vec![first];
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<AttribTarget> {
                space(c)?;
                if !c.match_char(',') {
                    return Err(Fail::Miss);
                }
                space(c)?;
                target_one(c)
            })();
            match step {
                Ok(v) => targets.push(v),
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        space(c)?;
        let assign = assign_rule(c)?;
        Ok(LocalAttribDecl {
            attrib,
            targets,
            assign,
            span: Span::new(begin, c.pos()),
        })
    })
}

// ---------------------------------------------------------------------------
// Import / export
// ---------------------------------------------------------------------------

fn import_literal(c: &mut Cursor) -> PResult<ImportLiteral> {
    c.attempt(|c| {
        let begin = c.pos();
        let quote = match c.peek() {
            Some('\'') => '\'',
            Some('"') => '"',
            _ => return Err(Fail::Miss),
        };
        c.bump();
        let inner = |c: &mut Cursor| -> PResult<String> {
            let begin = c.pos().index;
            match c.peek() {
                Some(ch) if ch.is_ascii_alphabetic() || ch == '_' || ch == '-' || (ch as u32) > 255 => {
                    c.bump();
                }
                _ => return Err(Fail::Miss),
            }
            while matches!(c.peek(), Some(ch) if is_name_char(ch) || ch == '-') {
                c.bump();
            }
            Ok(c.text_from(begin))
        };
        let first = inner(c)?;
        let mut parts = vec![first];
        while c.match_char('.') {
            parts.push(inner(c)?);
        }
        if !c.match_char(quote) {
            return Err(Fail::Miss);
        }
        Ok(ImportLiteral {
            parts,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn import_name(c: &mut Cursor) -> PResult<ImportName> {
    if c.match_char('\\') {
        space(c)?;
        let v = variable(c)?;
        return Ok(ImportName::Colon(v));
    }
    Ok(ImportName::Plain(variable(c)?))
}

fn import_name_list(c: &mut Cursor) -> PResult<Vec<ImportName>> {
    c.many0(space_break)?;
    space(c)?;
    let first = import_name(c)?;
    let mut names = vec![first];
    loop {
        let mark = c.mark();
        let step = (|| -> PResult<ImportName> {
            let sep = c.attempt(|c| {
                if c.many1(space_break).is_ok() {
                    return Ok(());
                }
                Err(Fail::Miss)
            });
            if sep.is_err() {
                space(c)?;
                if !c.match_char(',') {
                    return Err(Fail::Miss);
                }
                c.many0(space_break)?;
            }
            space(c)?;
            import_name(c)
        })();
        match step {
            Ok(v) => names.push(v),
            Err(Fail::Miss) => {
                c.rewind(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(names)
}

fn import_source(c: &mut Cursor) -> PResult<ImportSource> {
    if let Some(lit) = c.opt(import_literal)? {
        return Ok(ImportSource::Literal(lit));
    }
    c.not_ahead(string_lit)?;
    Ok(ImportSource::Exp(Box::new(exp(c)?)))
}

fn import_tab_item(c: &mut Cursor) -> PResult<ImportTabItem> {
    if let Some(p) = c.opt(meta_variable_pair)? {
        return Ok(ImportTabItem::MetaVariablePair(p));
    }
    if let Some(p) = c.opt(variable_pair)? {
        return Ok(ImportTabItem::VariablePair(p));
    }
    if let Some(p) = c.opt(normal_pair)? {
        return Ok(ImportTabItem::NormalPair(p));
    }
    if let Some(pair) = c.opt(|c| {
        c.attempt(|c| {
            if !c.match_char(':') {
                return Err(Fail::Miss);
            }
            let name = macro_name(c)?;
            Ok(name)
        })
    })? {
        return Ok(ImportTabItem::MacroName(pair));
    }
    if let Some((key, value)) = c.opt(|c| {
        c.attempt(|c| {
            let key = macro_name(c)?;
            if !c.match_char(':') {
                return Err(Fail::Miss);
            }
            space(c)?;
            let value = macro_name(c)?;
            Ok((key, value))
        })
    })? {
        return Ok(ImportTabItem::MacroNamePair(key, value));
    }
    if let Some(name) = c.opt(macro_name)? {
        return Ok(ImportTabItem::MacroName(name));
    }
    if c.peek() == Some('$') {
        let begin = c.pos();
        c.bump();
        return Ok(ImportTabItem::AllMacro(Span::new(begin, c.pos())));
    }
    if let Some(p) = c.opt(meta_normal_pair)? {
        return Ok(ImportTabItem::MetaNormalPair(p));
    }
    Ok(ImportTabItem::Exp(exp(c)?))
}

fn import_tab_lit(c: &mut Cursor) -> PResult<Vec<ImportTabItem>> {
    c.attempt(|c| {
        if !c.match_char('{') {
            return Err(Fail::Miss);
        }
        let mut items = Vec::new();
        white(c)?;
        if let Some(first) = c.opt(import_tab_item)? {
            items.push(first);
            loop {
                let mark = c.mark();
                let step = (|| -> PResult<ImportTabItem> {
                    white(c)?;
                    if !c.match_char(',') {
                        return Err(Fail::Miss);
                    }
                    white(c)?;
                    import_tab_item(c)
                })();
                match step {
                    Ok(v) => items.push(v),
                    Err(Fail::Miss) => {
                        c.rewind(mark);
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            let comma = c.mark();
            if white(c).is_err() || !c.match_char(',') {
                c.rewind(comma);
            }
        }
        white(c)?;
        if !c.match_char('}') {
            return Err(Fail::Miss);
        }
        Ok(items)
    })
}

fn import_rule(c: &mut Cursor) -> PResult<Import> {
    // `from mod import a, b`
    let from_first = c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("from") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let source = import_source(c)?;
        c.many0(space_break)?;
        space(c)?;
        if !c.match_keyword("import") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let names = import_name_list(c)?;
        Ok(Import {
            content: ImportContent::From { names, source },
            span: Span::new(begin, c.pos()),
        })
    });
    match from_first {
        Ok(import) => return Ok(import),
        Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
        Err(Fail::Miss) => {}
    }
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("import") {
            return Err(Fail::Miss);
        }
        space(c)?;
        // `import "mod" [as target]`
        if let Some(literal) = c.opt(import_literal)? {
            let target = c.opt(|c| {
                c.attempt(|c| {
                    space(c)?;
                    if !c.match_keyword("as") {
                        return Err(Fail::Miss);
                    }
                    space(c)?;
                    if let Some(items) = c.opt(import_tab_lit)? {
                        return Ok(ImportTarget::TabLit(items));
                    }
                    if let Some(v) = c.opt(variable)? {
                        return Ok(ImportTarget::Variable(v));
                    }
                    if c.peek() == Some('$') {
                        let begin = c.pos();
                        c.bump();
                        return Ok(ImportTarget::AllMacro(Span::new(begin, c.pos())));
                    }
                    Err(Fail::Miss)
                })
            })?;
            return Ok(Import {
                content: ImportContent::As { literal, target },
                span: Span::new(begin, c.pos()),
            });
        }
        // `import a, b from source`
        let names = import_name_list(c)?;
        c.many0(space_break)?;
        space(c)?;
        if !c.match_keyword("from") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let source = import_source(c)?;
        Ok(Import {
            content: ImportContent::From { names, source },
            span: Span::new(begin, c.pos()),
        })
    })
}

fn export_rule(c: &mut Cursor) -> PResult<Export> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("export") {
            return Err(Fail::Miss);
        }
        c.state.export_count += 1;
        let result = (|c: &mut Cursor| -> PResult<Export> {
            // `export default exp`
            let default_try = c.attempt(|c| {
                space(c)?;
                if !c.match_keyword("default") {
                    return Err(Fail::Miss);
                }
                space(c)?;
                exp(c)
            });
            match default_try {
                Ok(value) => {
                    if c.state.export_default {
                        return c.abort_at("export default has already been declared", begin);
                    }
                    if c.state.export_count > 1 {
                        return c.abort_at("there are items already being exported", begin);
                    }
                    c.state.export_default = true;
                    return Ok(Export {
                        default: true,
                        target: ExportTarget::ExpList(vec![value]),
                        assign: None,
                        span: Span::new(begin, c.pos()),
                    });
                }
                Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
                Err(Fail::Miss) => {}
            }
            // `export macro ...`
            let macro_try = c.attempt(|c| {
                space(c)?;
                macro_def(c)
            });
            match macro_try {
                Ok(def) => {
                    c.state.export_macro = true;
                    return Ok(Export {
                        default: false,
                        target: ExportTarget::Macro(Box::new(def)),
                        assign: None,
                        span: Span::new(begin, c.pos()),
                    });
                }
                Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
                Err(Fail::Miss) => {}
            }
            if c.state.export_default && c.state.export_count > 1 {
                return c.abort_at(
                    "can not export any more items when 'export default' is declared",
                    begin,
                );
            }
            // `export .name = ...` / `export [k] = ...`
            if matches!(c.peek(), Some('.') | Some('[')) {
                if c.peek_str(".<") {
                    let is_metatable = c
                        .check(|c| {
                            c.match_char('.');
                            if !c.match_char('<') {
                                return Err(Fail::Miss);
                            }
                            space(c)?;
                            if c.match_char('>') {
                                Ok(())
                            } else {
                                Err(Fail::Miss)
                            }
                        })
                        .is_ok();
                    if is_metatable {
                        if c.state.export_metatable {
                            return c.abort_at("module metatable duplicated", begin);
                        }
                        if c.state.export_metamethod {
                            return c.abort_at(
                                "metatable should be exported before metamethod",
                                begin,
                            );
                        }
                        c.state.export_metatable = true;
                    } else {
                        c.state.export_metamethod = true;
                    }
                }
                let slot = if let Some(d) = c.opt(dot_chain_item)? {
                    ChainItem::Dot(d)
                } else if let Some(e) = c.opt(index)? {
                    ChainItem::Index(Box::new(e))
                } else {
                    return c.abort_at("invalid export expression", begin);
                };
                space(c)?;
                let assign = assign_rule(c)?;
                return Ok(Export {
                    default: false,
                    target: ExportTarget::ModuleSlot(Box::new(slot)),
                    assign: Some(assign),
                    span: Span::new(begin, c.pos()),
                });
            }
            // `export a, b [= ...]`
            space(c)?;
            let exprs = exp_list(c)?;
            let assign = c.opt(|c| {
                c.attempt(|c| {
                    space(c)?;
                    assign_rule(c)
                })
            })?;
            Ok(Export {
                default: false,
                target: ExportTarget::ExpList(exprs),
                assign,
                span: Span::new(begin, c.pos()),
            })
        })(c);
        let export = result?;
        // an appendix after `export` is not allowed
        c.not_ahead(|c| {
            c.attempt(|c| {
                space(c)?;
                statement_appendix(c)
            })
        })?;
        Ok(export)
    })
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

fn return_rule(c: &mut Cursor) -> PResult<Return> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_keyword("return") {
            return Err(Fail::Miss);
        }
        let value = c.opt(|c| {
            c.attempt(|c| {
                space(c)?;
                if let Some(t) = c.opt(table_block)? {
                    return Ok(ReturnValue::TableBlock(t));
                }
                let exprs = exp_list_low(c)?;
                Ok(ReturnValue::ExpListLow(exprs))
            })
        })?;
        Ok(Return {
            value,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn if_line(c: &mut Cursor) -> PResult<IfLine> {
    c.attempt(|c| {
        let begin = c.pos();
        let unless = if c.match_keyword("if") {
            false
        } else if c.match_keyword("unless") {
            true
        } else {
            return Err(Fail::Miss);
        };
        space(c)?;
        let cond = if_cond(c)?;
        Ok(IfLine {
            unless,
            cond,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn while_line(c: &mut Cursor) -> PResult<WhileLine> {
    c.attempt(|c| {
        let begin = c.pos();
        let until = if c.match_keyword("while") {
            false
        } else if c.match_keyword("until") {
            true
        } else {
            return Err(Fail::Miss);
        };
        space(c)?;
        let condition = exp(c)?;
        Ok(WhileLine {
            until,
            condition,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn statement_appendix(c: &mut Cursor) -> PResult<StatementAppendix> {
    if let Some(l) = c.opt(if_line)? {
        return Ok(StatementAppendix::IfLine(l));
    }
    if let Some(l) = c.opt(while_line)? {
        return Ok(StatementAppendix::WhileLine(l));
    }
    let inner = comp_inner(c)?;
    Ok(StatementAppendix::CompInner(inner))
}

fn exp_list_assign(c: &mut Cursor) -> PResult<ExpListAssign> {
    c.attempt(|c| {
        let begin = c.pos();
        let exprs = exp_list(c)?;
        let action = c.opt(|c| {
            c.attempt(|c| {
                space(c)?;
                if let Some(u) = c.opt(update_rule)? {
                    return Ok(AssignAction::Update(u));
                }
                let a = assign_rule(c)?;
                Ok(AssignAction::Assign(a))
            })
        })?;
        // a following `=` means this is really a chained assignment
        c.not_ahead(|c| {
            c.attempt(|c| {
                space(c)?;
                if c.match_char('=') {
                    Ok(())
                } else {
                    Err(Fail::Miss)
                }
            })
        })?;
        Ok(ExpListAssign {
            exp_list: exprs,
            action,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn update_rule(c: &mut Cursor) -> PResult<Update> {
    c.attempt(|c| {
        let begin = c.pos();
        let op = {
            let candidates = ["..", "//", "or", "and", ">>", "<<", "??"];
            let mut found = None;
            for candidate in candidates {
                if c.match_str(candidate) {
                    found = Some(candidate.to_string());
                    break;
                }
            }
            match found {
                Some(op) => op,
                None => match c.match_set("+-*/%&|") {
                    Some(ch) => ch.to_string(),
                    None => return Err(Fail::Miss),
                },
            }
        };
        if !c.match_char('=') {
            return Err(Fail::Miss);
        }
        space(c)?;
        let value = exp(c)?;
        Ok(Update {
            op,
            value,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn chain_assign_rule(c: &mut Cursor) -> PResult<ChainAssign> {
    c.attempt(|c| {
        let begin = c.pos();
        let first = exp(c)?;
        let mut exprs = vec![first];
        let mut matched = false;
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<Exp> {
                space(c)?;
                if !c.match_char('=') || c.peek() == Some('=') {
                    return Err(Fail::Miss);
                }
                space(c)?;
                let e = exp(c)?;
                space(c)?;
                c.check(|c| {
                    if c.match_char('=') && c.peek() != Some('=') {
                        Ok(())
                    } else {
                        Err(Fail::Miss)
                    }
                })?;
                Ok(e)
            })();
            match step {
                Ok(e) => {
                    exprs.push(e);
                    matched = true;
                }
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        if !matched {
            return Err(Fail::Miss);
        }
        space(c)?;
        let assign = assign_rule(c)?;
        Ok(ChainAssign {
            exprs,
            assign,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn short_tab_appending(c: &mut Cursor) -> PResult<ShortTabAppending> {
    c.attempt(|c| {
        let begin = c.pos();
        if !c.match_str("[]") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let assign = assign_rule(c)?;
        Ok(ShortTabAppending {
            assign,
            span: Span::new(begin, c.pos()),
        })
    })
}

/// Comment lines directly above a statement at the same indent.
fn stmt_comments(c: &mut Cursor) -> PResult<Vec<Comment>> {
    c.attempt(|c| {
        let mut comments = Vec::new();
        let mut one_line = |c: &mut Cursor, comments: &mut Vec<Comment>| -> PResult<()> {
            c.attempt(|c| {
                check_indent(c)?;
                let mut any = false;
                loop {
                    if c.peek_str("--[[") {
                        let text = multi_line_comment(c)?;
                        comments.push(Comment::Multiline(text));
                        any = true;
                        while matches!(c.peek(), Some(' ') | Some('\t')) {
                            c.bump();
                        }
                        continue;
                    }
                    break;
                }
                if let Some(text) = c.opt(line_comment)? {
                    comments.push(Comment::Line(text));
                    any = true;
                }
                if !any || !at_stop(c) {
                    return Err(Fail::Miss);
                }
                Ok(())
            })
        };
        one_line(c, &mut comments)?;
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<()> {
                line_break(c)?;
                one_line(c, &mut comments)
            })();
            match step {
                Ok(()) => {}
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        line_break(c)?;
        check_indent_match(c)?;
        Ok(comments)
    })
}

fn statement_content(c: &mut Cursor) -> PResult<StmtContent> {
    if let Some(v) = c.opt(import_rule)? {
        return Ok(StmtContent::Import(v));
    }
    if let Some(v) = c.opt(while_rule)? {
        return Ok(StmtContent::While(v));
    }
    if let Some(v) = c.opt(repeat_rule)? {
        return Ok(StmtContent::Repeat(v));
    }
    if let Some(v) = c.opt(for_rule)? {
        return Ok(StmtContent::For(v));
    }
    if let Some(v) = c.opt(for_each_rule)? {
        return Ok(StmtContent::ForEach(v));
    }
    if let Some(v) = c.opt(return_rule)? {
        return Ok(StmtContent::Return(v));
    }
    if let Some(v) = c.opt(local_rule)? {
        return Ok(StmtContent::Local(v));
    }
    if let Some(v) = c.opt(global_rule)? {
        return Ok(StmtContent::Global(v));
    }
    if let Some(v) = c.opt(export_rule)? {
        return Ok(StmtContent::Export(v));
    }
    if let Some(v) = c.opt(macro_def)? {
        return Ok(StmtContent::Macro(v));
    }
    if let Some(v) = c.opt(macro_in_place)? {
        return Ok(StmtContent::MacroInPlace(v));
    }
    let break_loop = c.attempt(|c| {
        let begin = c.pos();
        let is_continue = if c.match_keyword("break") {
            false
        } else if c.match_keyword("continue") {
            true
        } else {
            return Err(Fail::Miss);
        };
        Ok(StmtContent::BreakLoop {
            is_continue,
            span: Span::new(begin, c.pos()),
        })
    });
    if let Ok(v) = break_loop {
        return Ok(v);
    }
    let label = c.attempt(|c| {
        if !c.match_str("::") {
            return Err(Fail::Miss);
        }
        let name = label_name(c)?;
        if !c.match_str("::") {
            return Err(Fail::Miss);
        }
        Ok(StmtContent::Label(name))
    });
    if let Ok(v) = label {
        return Ok(v);
    }
    let goto_stmt = c.attempt(|c| {
        if !c.match_keyword("goto") {
            return Err(Fail::Miss);
        }
        space(c)?;
        let name = label_name(c)?;
        Ok(StmtContent::Goto(name))
    });
    if let Ok(v) = goto_stmt {
        return Ok(v);
    }
    if let Some(v) = c.opt(short_tab_appending)? {
        return Ok(StmtContent::ShortTabAppending(v));
    }
    if let Some(v) = c.opt(local_attrib_rule)? {
        return Ok(StmtContent::LocalAttrib(v));
    }
    if let Some(v) = c.opt(backcall)? {
        return Ok(StmtContent::Backcall(v));
    }
    if let Some(v) = c.opt(pipe_body_stmt)? {
        return Ok(StmtContent::PipeBody(v));
    }
    if let Some(v) = c.opt(exp_list_assign)? {
        return Ok(StmtContent::ExpListAssign(v));
    }
    if let Some(v) = c.opt(chain_assign_rule)? {
        return Ok(StmtContent::ChainAssign(v));
    }
    // a bare appendix with no statement in front of it is a hard error
    let bare_appendix = c.check(statement_appendix);
    match bare_appendix {
        Ok(_) => c.abort("must be followed by a statement or an indented block"),
        Err(Fail::Abort(err)) => Err(Fail::Abort(err)),
        Err(Fail::Miss) => Err(Fail::Miss),
    }
}

fn statement(c: &mut Cursor) -> PResult<Statement> {
    c.attempt(|c| {
        let begin = c.pos();
        let comments = c.opt(stmt_comments)?.unwrap_or_default();
        space(c)?;
        let content = statement_content(c)?;
        space(c)?;
        let appendix = c.opt(|c| {
            c.attempt(|c| {
                let a = statement_appendix(c)?;
                space(c)?;
                Ok(a)
            })
        })?;
        Ok(Statement {
            comments,
            content,
            appendix,
            span: Span::new(begin, c.pos()),
        })
    })
}

// ---------------------------------------------------------------------------
// Blocks and the file
// ---------------------------------------------------------------------------

/// A comment-only or blank line inside a block.
fn empty_line_break(c: &mut Cursor) -> PResult<()> {
    let at_level = c.attempt(|c| {
        check_indent(c)?;
        if c.peek_str("--[[") {
            multi_line_comment(c)?;
            space(c)?;
        } else {
            line_comment(c)?;
        }
        if at_stop(c) {
            Ok(())
        } else {
            Err(Fail::Miss)
        }
    });
    if at_level.is_ok() {
        return Ok(());
    }
    let deeper = c.attempt(|c| {
        advance(c)?;
        let result = (|| -> PResult<()> {
            if c.peek_str("--[[") {
                multi_line_comment(c)?;
                space(c)?;
            } else {
                line_comment(c)?;
            }
            Ok(())
        })();
        pop_indent(c);
        result?;
        if at_stop(c) {
            Ok(())
        } else {
            Err(Fail::Miss)
        }
    });
    if deeper.is_ok() {
        return Ok(());
    }
    c.attempt(|c| {
        while matches!(c.peek(), Some(' ') | Some('\t')) {
            c.bump();
        }
        if c.peek() == Some('\n') || c.peek_str("\r\n") {
            Ok(())
        } else {
            Err(Fail::Miss)
        }
    })
}

fn block_line(c: &mut Cursor, out: &mut Vec<Statement>) -> PResult<()> {
    let stmt_at_level = c.attempt(|c| {
        check_indent_match(c)?;
        statement(c)
    });
    match stmt_at_level {
        Ok(stmt) => {
            out.push(stmt);
            return Ok(());
        }
        Err(Fail::Abort(err)) => return Err(Fail::Abort(err)),
        Err(Fail::Miss) => {}
    }
    if empty_line_break(c).is_ok() {
        return Ok(());
    }
    c.attempt(|c| {
        advance_match(c)?;
        let result = (|| -> PResult<Statement> {
            space(c)?;
            // only pipe continuations may sit deeper than the block level
            if !c.peek_str("|>") && !c.at_end() {
                return c.abort("unexpected indent");
            }
            statement(c)
        })();
        pop_indent(c);
        match result {
            Ok(stmt) => {
                out.push(stmt);
                Ok(())
            }
            Err(err) => Err(err),
        }
    })
}

fn block(c: &mut Cursor) -> PResult<Block> {
    c.attempt(|c| {
        let begin = c.pos();
        let mut statements = Vec::new();
        block_line(c, &mut statements)?;
        loop {
            let mark = c.mark();
            let step = (|| -> PResult<()> {
                c.many1(line_break)?;
                block_line(c, &mut statements)
            })();
            match step {
                Ok(()) => {}
                Err(Fail::Miss) => {
                    c.rewind(mark);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Block {
            statements,
            span: Span::new(begin, c.pos()),
        })
    })
}

fn shebang(c: &mut Cursor) -> PResult<()> {
    if !c.match_str("#!") {
        return Err(Fail::Miss);
    }
    while !at_stop(c) {
        c.bump();
    }
    Ok(())
}

fn file(c: &mut Cursor) -> PResult<File> {
    let begin = c.pos();
    let _ = c.opt(shebang)?;
    let block_node = c.opt(block)?;
    white(c)?;
    if !c.at_end() {
        return Err(Fail::Miss);
    }
    Ok(File {
        block: block_node,
        span: Span::new(begin, c.pos()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> File {
        let input = Input::decode(source).unwrap();
        let info = parse_file(&input);
        assert!(info.error.is_none(), "parse failed: {:?}", info.error);
        info.node.unwrap()
    }

    fn parse_err(source: &str) -> CompileError {
        let input = Input::decode(source).unwrap();
        let info = parse_file(&input);
        info.error.expect("expected a parse error")
    }

    #[test]
    fn test_simple_assignment() {
        let file = parse_ok("x = 1 + 2\n");
        let block = file.block.unwrap();
        assert_eq!(block.statements.len(), 1);
        assert!(matches!(
            block.statements[0].content,
            StmtContent::ExpListAssign(_)
        ));
    }

    #[test]
    fn test_indented_if_block() {
        let file = parse_ok("if x\n  print x\nelse\n  print 1\n");
        let block = file.block.unwrap();
        match &block.statements[0].content {
            StmtContent::ExpListAssign(assign) => {
                let exp = &assign.exp_list[0];
                match exp.single_value() {
                    Some(Value::Simple(SimpleValue::If(if_node))) => {
                        assert_eq!(if_node.branches.len(), 1);
                        assert!(if_node.else_body.is_some());
                    }
                    other => panic!("expected if value, got {:?}", other.is_some()),
                }
            }
            other => panic!("unexpected statement {:?}", std::mem::discriminant(other)),
        }
    }

    #[test]
    fn test_keyword_not_a_variable() {
        let err = parse_err("local class = 1\n");
        assert_eq!(err.message, "syntax error");
    }

    #[test]
    fn test_statement_appendix() {
        let file = parse_ok("print x if x\n");
        let block = file.block.unwrap();
        assert!(matches!(
            block.statements[0].appendix,
            Some(StatementAppendix::IfLine(_))
        ));
    }

    #[test]
    fn test_pipe_exp() {
        let file = parse_ok("x |> f _, 2 |> g\n");
        let block = file.block.unwrap();
        match &block.statements[0].content {
            StmtContent::ExpListAssign(assign) => {
                assert_eq!(assign.exp_list[0].pipe_exprs.len(), 3);
            }
            _ => panic!("expected expression statement"),
        }
    }

    #[test]
    fn test_nil_coalesce_is_exp_tail() {
        let file = parse_ok("a = b ?? c and d\n");
        let block = file.block.unwrap();
        match &block.statements[0].content {
            StmtContent::ExpListAssign(assign) => match &assign.action {
                Some(AssignAction::Assign(assign)) => match &assign.values[0] {
                    AssignValue::Exp(e) => {
                        // `?? c and d` hangs off the whole expression
                        assert!(e.nil_coalesced.is_some());
                        assert!(e.op_values.is_empty());
                    }
                    _ => panic!("expected exp value"),
                },
                _ => panic!("expected assign action"),
            },
            _ => panic!("expected assignment"),
        }
    }

    #[test]
    fn test_hash_pair_in_list_is_error() {
        let err = parse_err("x = [a: 1]\n");
        assert_eq!(err.message, "can not put hash pair in a list");
    }

    #[test]
    fn test_nesting_cap() {
        let mut source = String::from("x = ");
        source.push_str(&"(".repeat(120));
        source.push('1');
        source.push_str(&")".repeat(120));
        source.push('\n');
        let err = parse_err(&source);
        assert_eq!(err.message, "nesting expressions exceeds 100 levels");
    }

    #[test]
    fn test_class_with_extends() {
        let file = parse_ok("class A extends B\n  new: (x) => @x = x\n");
        let block = file.block.unwrap();
        match &block.statements[0].content {
            StmtContent::ExpListAssign(assign) => {
                match assign.exp_list[0].single_value() {
                    Some(Value::Simple(SimpleValue::ClassDecl(decl))) => {
                        assert!(decl.name.is_some());
                        assert!(decl.extend.is_some());
                        assert!(decl.body.is_some());
                    }
                    _ => panic!("expected class declaration"),
                }
            }
            _ => panic!("expected expression statement"),
        }
    }

    #[test]
    fn test_export_default_twice_is_error() {
        let err = parse_err("export default 1\nexport default 2\n");
        assert_eq!(err.message, "export default has already been declared");
    }

    #[test]
    fn test_import_as_forms() {
        parse_ok("import \"lpeg\"\nimport \"utils\" as {:trim}\nimport a, b from c\n");
    }

    #[test]
    fn test_destructure_with_default() {
        let file = parse_ok("{a, b = 10} = t\n");
        let block = file.block.unwrap();
        assert!(matches!(
            block.statements[0].content,
            StmtContent::ExpListAssign(_)
        ));
    }

    #[test]
    fn test_goto_label() {
        let file = parse_ok("::top::\ngoto top\n");
        let block = file.block.unwrap();
        assert!(matches!(block.statements[0].content, StmtContent::Label(_)));
        assert!(matches!(block.statements[1].content, StmtContent::Goto(_)));
    }

    #[test]
    fn test_macro_definition() {
        let file = parse_ok("macro square = (x) -> \"(#{x} * #{x})\"\n");
        let block = file.block.unwrap();
        assert!(matches!(block.statements[0].content, StmtContent::Macro(_)));
    }

    #[test]
    fn test_string_interpolation() {
        let file = parse_ok("s = \"value: #{1 + 2}\"\n");
        let block = file.block.unwrap();
        assert_eq!(block.statements.len(), 1);
    }

    #[test]
    fn test_comprehension() {
        parse_ok("squares = [i * i for i = 1, 10]\n");
        parse_ok("copy = {k, v for k, v in pairs t}\n");
    }

    #[test]
    fn test_switch_with_cases() {
        parse_ok("switch x\n  when 1, 2\n    print \"low\"\n  else\n    print \"high\"\n");
    }

    #[test]
    fn test_backcall_statement() {
        parse_ok("(data) <- readAsync \"file.txt\"\nprint data\n");
    }

    #[test]
    fn test_existential_chain() {
        parse_ok("print a?.b\n");
    }

    #[test]
    fn test_with_block() {
        parse_ok("with obj\n  .name = \"yue\"\n  \\update!\n");
    }
}
