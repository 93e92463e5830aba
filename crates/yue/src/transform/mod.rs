// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! The AST → Lua transformer.
//!
//! A [`Compiler`] owns the scope stack and every piece of per-compile
//! bookkeeping (vararg tracking, continue targets, goto scopes, the module
//! export table name). Transformation is driven by an [`ExpUsage`] mode:
//! statement position discards the value, `Return` prefixes `return`,
//! `Assignment` writes into a rendered left-hand side, and `Closure` wraps
//! anything statement-shaped into an immediately-invoked function.
//!
//! Output is assembled the way the original-style emitters do it: every
//! construct appends chunks of finished Lua text (with indentation and the
//! optional `-- N` line markers already applied) to a string list which the
//! caller joins.

mod class;
mod control;
mod expr;
mod table;

use std::collections::HashMap;

use tracing::debug;

use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::macros::MacroVm;
use crate::parser::{self, LUA_KEYWORDS};
use crate::scope::{GlobalMode, ScopeStack};
use crate::source::Input;
use crate::YueConfig;

/// How an expression-shaped subtree is being consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExpUsage {
    /// Statement position; the value is discarded.
    Common,
    /// The value is assigned to an externally rendered target list.
    Assignment,
    /// The value is returned from the enclosing function.
    Return,
    /// The value is needed inside an expression.
    Closure,
}

/// Lua language level selected by `options["target"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum LuaTarget {
    Lua51 = 501,
    Lua52 = 502,
    Lua53 = 503,
    Lua54 = 504,
}

impl LuaTarget {
    fn from_config(config: &YueConfig) -> Result<Self> {
        match config.options.get("target").map(String::as_str) {
            None => Ok(LuaTarget::Lua54),
            Some("5.1") => Ok(LuaTarget::Lua51),
            Some("5.2") => Ok(LuaTarget::Lua52),
            Some("5.3") => Ok(LuaTarget::Lua53),
            Some("5.4") => Ok(LuaTarget::Lua54),
            Some(other) => Err(CompileError::new(
                format!(
                    "get invalid Lua target \"{}\", should be 5.1, 5.2, 5.3 or 5.4",
                    other
                ),
                1,
                1,
            )),
        }
    }
}

pub(crate) type StrList = Vec<String>;

pub(crate) fn join(items: &[String]) -> String {
    items.concat()
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct VarArgState {
    pub has_var: bool,
    pub used_var: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ContinueVar {
    /// Flag variable (pre-5.2) or label name (5.2+).
    pub var: String,
    /// Rendered `_cond_N = <condition>` line for repeat loops.
    pub cond_assign: Option<String>,
}

#[derive(Debug, Clone)]
struct LabelInfo {
    line: usize,
    level: usize,
}

#[derive(Debug, Clone)]
struct GotoRecord {
    label: String,
    line: usize,
    col: usize,
    scope: usize,
    level: usize,
}

/// One free global reference seen during the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GlobalRef {
    pub name: String,
    pub line: usize,
    pub col: usize,
}

/// The transformer for one compilation.
pub(crate) struct Compiler<'a> {
    pub(crate) config: &'a YueConfig,
    pub(crate) input: &'a Input,
    pub(crate) vm: &'a dyn MacroVm,
    pub(crate) target: LuaTarget,
    pub(crate) scopes: ScopeStack,
    pub(crate) indent_offset: i32,
    pub(crate) var_args: Vec<VarArgState>,
    pub(crate) enable_return: Vec<bool>,
    pub(crate) enable_break_loop: Vec<bool>,
    pub(crate) with_vars: Vec<String>,
    /// `_class_N` of each enclosing class body, for `super` rewriting.
    pub(crate) class_vars: Vec<String>,
    pub(crate) continue_vars: Vec<ContinueVar>,
    globals: HashMap<String, (usize, usize)>,
    goto_scope: usize,
    pub(crate) goto_scopes: Vec<usize>,
    labels: Vec<Option<HashMap<String, LabelInfo>>>,
    gotos: Vec<GotoRecord>,
    pub(crate) module_name: Option<String>,
    pub(crate) export_default: bool,
    pub(crate) export_metatable: bool,
    /// Macro names registered by `macro` definitions in this file, used to
    /// answer `has_macro` without the VM when the feature is off.
    pub(crate) macro_names: Vec<String>,
    /// Extra locals declared by `{ type = "lua", locals = ... }` macro
    /// results.
    pub(crate) macro_locals: Vec<String>,
    return_seen_at_root: bool,
}

impl<'a> Compiler<'a> {
    pub(crate) fn new(
        config: &'a YueConfig,
        input: &'a Input,
        vm: &'a dyn MacroVm,
        module_name: Option<String>,
        export_default: bool,
        export_metatable: bool,
    ) -> Result<Self> {
        Ok(Self {
            config,
            input,
            vm,
            target: LuaTarget::from_config(config)?,
            scopes: ScopeStack::new(),
            indent_offset: 0,
            var_args: Vec::new(),
            enable_return: Vec::new(),
            enable_break_loop: Vec::new(),
            with_vars: Vec::new(),
            class_vars: Vec::new(),
            continue_vars: Vec::new(),
            globals: HashMap::new(),
            goto_scope: 0,
            goto_scopes: Vec::new(),
            labels: Vec::new(),
            gotos: Vec::new(),
            module_name,
            export_default,
            export_metatable,
            macro_names: Vec::new(),
            macro_locals: Vec::new(),
            return_seen_at_root: false,
        })
    }

    /// Transforms a parsed file into Lua text.
    pub(crate) fn compile_file(&mut self, file: &File) -> Result<String> {
        let mut out = StrList::new();
        self.scopes.push();
        self.enable_return.push(self.module_name.is_none());
        self.goto_scopes.push(0);
        self.goto_scope = 1;
        self.var_args.push(VarArgState {
            has_var: true,
            used_var: false,
        });
        if let Some(module) = self.module_name.clone() {
            self.scopes.force_add_to_scope(&module);
            if self.export_default {
                out.push(format!("local {} = nil\n", module));
            } else if self.export_metatable {
                out.push(format!("local {} = setmetatable({{ }}, {{ }})\n", module));
            } else {
                out.push(format!("local {} = {{ }}\n", module));
            }
        }
        let usage = if self.config.implicit_return_root && self.module_name.is_none() {
            ExpUsage::Return
        } else {
            ExpUsage::Common
        };
        if let Some(block) = &file.block {
            self.transform_block(&block.statements, &mut out, usage, None, true)?;
        }
        if let Some(module) = &self.module_name {
            out.push(format!("return {}\n", module));
        }
        self.scopes.pop();
        self.resolve_gotos()?;
        debug!(chunks = out.len(), "transform finished");
        Ok(join(&out))
    }

    fn resolve_gotos(&self) -> Result<()> {
        for record in &self.gotos {
            let found = self
                .labels
                .get(record.scope)
                .and_then(|slot| slot.as_ref())
                .and_then(|labels| labels.get(&record.label))
                .is_some_and(|label| record.level >= label.level);
            if !found {
                return Err(CompileError::new(
                    format!("no visible label '{}' for <goto>", record.label),
                    record.line,
                    record.col,
                ));
            }
        }
        Ok(())
    }

    /// The collected free-global list, sorted by (line, col).
    pub(crate) fn take_globals(&mut self) -> Vec<GlobalRef> {
        let mut list: Vec<GlobalRef> = self
            .globals
            .drain()
            .map(|(name, (line, col))| GlobalRef { name, line, col })
            .collect();
        list.sort_by(|a, b| (a.line, a.col, &a.name).cmp(&(b.line, b.col, &b.name)));
        list
    }

    pub(crate) fn record_global(&mut self, name: &str, span: Span) {
        self.globals
            .entry(name.to_string())
            .or_insert((span.begin.line, span.begin.col));
    }

    // -- emission helpers ---------------------------------------------------

    pub(crate) fn indent(&self) -> String {
        self.indent_with(0)
    }

    pub(crate) fn indent_with(&self, offset: i32) -> String {
        let level = self.scopes.len() as i32 - 1 + self.indent_offset + offset;
        let level = level.max(0) as usize;
        if self.config.use_space_over_tab {
            " ".repeat(level * 2)
        } else {
            "\t".repeat(level)
        }
    }

    /// Line ending annotated with the node's begin line.
    pub(crate) fn nll(&self, span: Span) -> String {
        if self.config.reserve_line_number {
            format!(
                " -- {}\n",
                span.begin.line as i64 + self.config.line_offset as i64
            )
        } else {
            "\n".to_string()
        }
    }

    /// Line ending annotated with the node's end line.
    pub(crate) fn nlr(&self, span: Span) -> String {
        if self.config.reserve_line_number {
            format!(
                " -- {}\n",
                span.end.line as i64 + self.config.line_offset as i64
            )
        } else {
            "\n".to_string()
        }
    }

    pub(crate) fn get_unused_name(&self, prefix: &str) -> String {
        self.scopes.get_unused_name(prefix)
    }

    pub(crate) fn get_unused_label(&self, prefix: &str) -> String {
        let scope = *self.goto_scopes.last().expect("no goto scope");
        let labels = self.labels.get(scope).and_then(|slot| slot.as_ref());
        match labels {
            None => format!("{}0", prefix),
            Some(map) => {
                let mut index = 0usize;
                loop {
                    let candidate = format!("{}{}", prefix, index);
                    if !map.contains_key(&candidate) {
                        return candidate;
                    }
                    index += 1;
                }
            }
        }
    }

    /// Registers a compiler-generated label so later probes pick a fresh
    /// name within the same goto-scope.
    pub(crate) fn register_label(&mut self, name: &str, line: usize) {
        let scope = *self.goto_scopes.last().expect("no goto scope");
        if self.labels.len() <= scope {
            self.labels.resize(scope + 1, None);
        }
        self.labels[scope].get_or_insert_with(HashMap::new).insert(
            name.to_string(),
            LabelInfo {
                line,
                level: self.scopes.len(),
            },
        );
    }

    pub(crate) fn check_const(&self, name: &str, span: Span) -> Result<()> {
        if self.scopes.is_const(name) {
            return Err(CompileError::span(
                format!("attempt to assign to const variable '{}'", name),
                span,
            ));
        }
        Ok(())
    }

    /// Re-parses generated Yue text as a block, anchoring its line numbers
    /// near `anchor` so `-- N` markers stay truthful.
    pub(crate) fn to_ast_block(&self, codes: &str, anchor: Span) -> Result<Block> {
        let padding = "\n".repeat(anchor.begin.line.saturating_sub(1));
        parser::parse_block_text(&format!("{}{}", padding, codes))
    }

    /// Re-parses generated Yue text as one expression.
    pub(crate) fn to_ast_exp(&self, codes: &str, anchor: Span) -> Result<Exp> {
        let _ = anchor;
        parser::parse_exp_text(codes)
    }

    /// Raw source text of a span, for macro argument capture.
    pub(crate) fn source_text(&self, span: Span) -> String {
        self.input.slice(span.begin.index, span.end.index)
    }

    // -- function scope plumbing -------------------------------------------

    pub(crate) fn push_function_scope(&mut self, has_var_arg: bool) {
        self.enable_return.push(true);
        self.var_args.push(VarArgState {
            has_var: has_var_arg,
            used_var: false,
        });
        self.goto_scopes.push(self.goto_scope);
        self.goto_scope += 1;
        self.enable_break_loop.push(false);
    }

    pub(crate) fn pop_function_scope(&mut self) -> VarArgState {
        self.enable_return.pop();
        self.goto_scopes.pop();
        self.enable_break_loop.pop();
        self.var_args.pop().expect("function scope unbalanced")
    }

    /// The IIFE header/footer pair, forwarding `...` when the enclosing
    /// function is variadic and the wrapped body used it.
    pub(crate) fn anon_func_start(&self, used_var: bool) -> &'static str {
        if used_var {
            "(function(...)"
        } else {
            "(function()"
        }
    }

    pub(crate) fn anon_func_end(&self, used_var: bool) -> &'static str {
        if used_var {
            "end)(...)"
        } else {
            "end)()"
        }
    }

    /// Whether the enclosing real function accepts `...`; anonymous wrapper
    /// functions pass it through.
    pub(crate) fn enclosing_has_var_arg(&self) -> bool {
        self.var_args.last().map(|s| s.has_var).unwrap_or(false)
    }

    pub(crate) fn mark_var_arg_used(&mut self) -> Result<()> {
        match self.var_args.last_mut() {
            Some(state) if state.has_var => {
                state.used_var = true;
                Ok(())
            }
            _ => Err(CompileError::new(
                "cannot use '...' outside a vararg function near '...'",
                1,
                1,
            )),
        }
    }

    // -- blocks and statements ---------------------------------------------

    /// Transforms a statement list. `usage` applies to the last statement;
    /// everything before it runs in `Common`.
    pub(crate) fn transform_block(
        &mut self,
        statements: &[Statement],
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
        is_root: bool,
    ) -> Result<()> {
        let statements = self.merge_pipe_bodies(statements)?;
        // `local *` / `local ^` forward declarations
        for stmt in statements.iter() {
            if let StmtContent::Local(local) = &stmt.content {
                match &local.item {
                    LocalItem::Star(_) | LocalItem::Caret(_) => {
                        let capital = matches!(local.item, LocalItem::Caret(_));
                        let names = collect_assigned_names(&statements, capital);
                        let mut fresh = Vec::new();
                        for name in names {
                            if self.scopes.add_to_scope(&name) {
                                fresh.push(name);
                            }
                        }
                        if !fresh.is_empty() {
                            out.push(format!(
                                "{}local {}{}",
                                self.indent(),
                                fresh.join(", "),
                                self.nll(local.span)
                            ));
                        }
                    }
                    LocalItem::Values { .. } => {}
                }
            }
        }
        let mut index = 0usize;
        while index < statements.len() {
            let stmt = &statements[index];
            let is_last = index + 1 == statements.len();
            // a backcall consumes the rest of the block as its lambda body
            if let StmtContent::Backcall(backcall) = &stmt.content {
                let rest = &statements[index + 1..];
                self.transform_backcall(backcall, rest, out, usage, assign_to)?;
                return Ok(());
            }
            if is_last && usage != ExpUsage::Common {
                self.transform_last_statement(stmt, out, usage, assign_to)?;
            } else {
                self.transform_statement(stmt, out)?;
            }
            if is_root {
                if let StmtContent::Return(_) = &stmt.content {
                    self.return_seen_at_root = true;
                }
            }
            index += 1;
        }
        Ok(())
    }

    /// Folds `|>` continuation statements into the statement above them.
    fn merge_pipe_bodies(&self, statements: &[Statement]) -> Result<Vec<Statement>> {
        let mut merged: Vec<Statement> = Vec::with_capacity(statements.len());
        for stmt in statements {
            if let StmtContent::PipeBody(pipe) = &stmt.content {
                let prev = merged.last_mut().ok_or_else(|| {
                    CompileError::span("pipe chain must be following a value", stmt.span)
                })?;
                if prev.appendix.is_some() {
                    return Err(CompileError::span(
                        "statement decorator must be placed at the end of pipe chain",
                        prev.span,
                    ));
                }
                match &mut prev.content {
                    StmtContent::ExpListAssign(list) if list.action.is_none() => {
                        let exp = list
                            .exp_list
                            .last_mut()
                            .expect("expression list cannot be empty");
                        exp.pipe_exprs.extend(pipe.values.iter().cloned());
                        exp.span.end = pipe.span.end;
                        prev.span.end = stmt.span.end;
                        // the appendix of the pipe line belongs to the
                        // merged statement
                        if stmt.appendix.is_some() {
                            prev.appendix = stmt.appendix.clone();
                        }
                    }
                    _ => {
                        return Err(CompileError::span(
                            "pipe chain must be following a value",
                            stmt.span,
                        ))
                    }
                }
            } else {
                merged.push(stmt.clone());
            }
        }
        Ok(merged)
    }

    pub(crate) fn transform_statement(&mut self, stmt: &Statement, out: &mut StrList) -> Result<()> {
        if self.config.reserve_comment {
            for comment in &stmt.comments {
                match comment {
                    Comment::Line(text) => {
                        out.push(format!("{}--{}\n", self.indent(), text));
                    }
                    Comment::Multiline(text) => {
                        out.push(format!("{}--[[{}]]\n", self.indent(), text));
                    }
                }
            }
        }
        if let Some(appendix) = &stmt.appendix {
            return self.transform_statement_with_appendix(stmt, appendix, out);
        }
        self.transform_statement_content(stmt, out, ExpUsage::Common, None)
    }

    fn transform_statement_with_appendix(
        &mut self,
        stmt: &Statement,
        appendix: &StatementAppendix,
        out: &mut StrList,
    ) -> Result<()> {
        let mut bare = stmt.clone();
        bare.appendix = None;
        bare.comments = Vec::new();
        match appendix {
            StatementAppendix::IfLine(line) => {
                let if_node = If {
                    unless: line.unless,
                    branches: vec![IfBranch {
                        cond: line.cond.clone(),
                        body: Some(Body::Statement(Box::new(bare))),
                    }],
                    else_body: None,
                    span: stmt.span,
                };
                self.transform_if(&if_node, out, ExpUsage::Common, None)
            }
            StatementAppendix::WhileLine(line) => {
                match &stmt.content {
                    StmtContent::Return(_) => {
                        return Err(CompileError::span(
                            "loop line decorator can not be used in a return statement",
                            stmt.span,
                        ))
                    }
                    StmtContent::BreakLoop { .. } => {
                        return Err(CompileError::span(
                            "loop line decorator can not be used in a break-loop statement",
                            stmt.span,
                        ))
                    }
                    _ => {}
                }
                let while_node = While {
                    until: line.until,
                    condition: line.condition.clone(),
                    body: Body::Statement(Box::new(bare)),
                    span: stmt.span,
                };
                self.transform_while(&while_node, out, ExpUsage::Common, None)
            }
            StatementAppendix::CompInner(inner) => {
                match &stmt.content {
                    StmtContent::Return(_) => {
                        return Err(CompileError::span(
                            "loop line decorator can not be used in a return statement",
                            stmt.span,
                        ))
                    }
                    StmtContent::BreakLoop { .. } => {
                        return Err(CompileError::span(
                            "loop line decorator can not be used in a break-loop statement",
                            stmt.span,
                        ))
                    }
                    _ => {}
                }
                self.transform_comp_statement(inner, &bare, out)
            }
        }
    }

    pub(crate) fn transform_statement_content(
        &mut self,
        stmt: &Statement,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        match &stmt.content {
            StmtContent::Import(import) => self.transform_import(import, out),
            StmtContent::While(node) => self.transform_while(node, out, usage, assign_to),
            StmtContent::Repeat(node) => self.transform_repeat(node, out),
            StmtContent::For(node) => self.transform_for(node, out, usage, assign_to),
            StmtContent::ForEach(node) => self.transform_for_each(node, out, usage, assign_to),
            StmtContent::Return(node) => self.transform_return(node, out),
            StmtContent::Local(node) => self.transform_local(node, out),
            StmtContent::Global(node) => self.transform_global(node, out),
            StmtContent::Export(node) => self.transform_export(node, out),
            StmtContent::Macro(node) => self.transform_macro_def(node, out),
            StmtContent::MacroInPlace(node) => self.transform_macro_in_place(node, out),
            StmtContent::BreakLoop { is_continue, span } => {
                self.transform_break_loop(*is_continue, *span, out)
            }
            StmtContent::Label(name) => self.transform_label(name, out),
            StmtContent::Goto(name) => self.transform_goto(name, out),
            StmtContent::ShortTabAppending(node) => self.transform_short_tab_appending(node, out),
            StmtContent::Backcall(node) => {
                self.transform_backcall(node, &[], out, ExpUsage::Common, None)
            }
            StmtContent::LocalAttrib(node) => self.transform_local_attrib(node, out),
            StmtContent::PipeBody(_) => Err(CompileError::span(
                "pipe chain must be following a value",
                stmt.span,
            )),
            StmtContent::ExpListAssign(node) => {
                self.transform_exp_list_assign(node, out, usage, assign_to)
            }
            StmtContent::ChainAssign(node) => self.transform_chain_assign(node, out),
        }
    }

    /// The last statement of a `Return`/`Assignment`-mode block.
    fn transform_last_statement(
        &mut self,
        stmt: &Statement,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        if stmt.appendix.is_some() {
            // a decorated statement keeps statement semantics
            return self.transform_statement(stmt, out);
        }
        match &stmt.content {
            StmtContent::ExpListAssign(list) => match &list.action {
                None => self.transform_exp_list_assign(list, out, usage, assign_to),
                Some(AssignAction::Assign(assign)) if usage == ExpUsage::Return => {
                    // implicit return of an assignment: declare, assign, then
                    // return the targets
                    let mut targets = Vec::new();
                    for exp in &list.exp_list {
                        match exp.single_variable() {
                            Some(name) => targets.push(name.to_string()),
                            None => {
                                targets.clear();
                                break;
                            }
                        }
                    }
                    let mut fresh = Vec::new();
                    for name in &targets {
                        if self.scopes.add_to_scope(name) {
                            fresh.push(name.clone());
                        }
                    }
                    if !fresh.is_empty() {
                        out.push(format!("{}local {}\n", self.indent(), fresh.join(", ")));
                    }
                    self.transform_exp_list_assign(list, out, ExpUsage::Common, None)?;
                    if !targets.is_empty() {
                        out.push(format!(
                            "{}return {}{}",
                            self.indent(),
                            targets.join(", "),
                            self.nlr(assign.span)
                        ));
                    }
                    Ok(())
                }
                Some(_) => self.transform_statement(stmt, out),
            },
            _ => self.transform_statement(stmt, out),
        }
    }

    // -- expression statements ---------------------------------------------

    pub(crate) fn transform_exp_list_assign(
        &mut self,
        node: &ExpListAssign,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        match &node.action {
            Some(AssignAction::Assign(assign)) => {
                self.transform_assignment(&node.exp_list, assign, out)
            }
            Some(AssignAction::Update(update)) => {
                self.transform_update(&node.exp_list, update, out)
            }
            None => match usage {
                ExpUsage::Return => {
                    self.transform_exp_list_return(&node.exp_list, out, node.span)
                }
                ExpUsage::Assignment => {
                    let target = assign_to.expect("assignment usage needs a target");
                    if node.exp_list.len() == 1 {
                        self.transform_exp(
                            &node.exp_list[0],
                            out,
                            ExpUsage::Assignment,
                            Some(target),
                        )
                    } else {
                        let mut values = Vec::new();
                        for exp in &node.exp_list {
                            values.push(self.exp_to_string(exp)?);
                        }
                        out.push(format!(
                            "{}{} = {}{}",
                            self.indent(),
                            target,
                            values.join(", "),
                            self.nll(node.span)
                        ));
                        Ok(())
                    }
                }
                _ => {
                    if node.exp_list.len() == 1 {
                        let exp = &node.exp_list[0];
                        // fold `|>` chains into calls before the check
                        let folded;
                        let exp = if exp.pipe_exprs.len() > 1
                            && exp.op_values.is_empty()
                            && exp.nil_coalesced.is_none()
                        {
                            let unary = self.resolve_pipes(&exp.pipe_exprs)?;
                            folded = Exp {
                                pipe_exprs: vec![unary],
                                op_values: Vec::new(),
                                nil_coalesced: None,
                                span: exp.span,
                            };
                            &folded
                        } else {
                            exp
                        };
                        if exp.nil_coalesced.is_some() {
                            return self.transform_exp(exp, out, ExpUsage::Common, None);
                        }
                        if let Some(value) = exp.single_value() {
                            if self.is_statement_value(value) {
                                return self.transform_exp(exp, out, ExpUsage::Common, None);
                            }
                        }
                    }
                    Err(CompileError::span("unexpected expression", node.span))
                }
            },
        }
    }

    /// Whether a bare value is a legal statement (a call or a structured
    /// control form).
    fn is_statement_value(&self, value: &Value) -> bool {
        match value {
            Value::Chain(chain) => {
                chain_is_call(chain)
                    || matches!(
                        chain.items.first(),
                        Some(ChainItem::Callable(Callable::MacroName(_)))
                    )
            }
            Value::Simple(simple) => matches!(
                simple,
                SimpleValue::If(_)
                    | SimpleValue::Switch(_)
                    | SimpleValue::With(_)
                    | SimpleValue::ClassDecl(_)
                    | SimpleValue::For(_)
                    | SimpleValue::ForEach(_)
                    | SimpleValue::While(_)
                    | SimpleValue::Do(_)
                    | SimpleValue::Try(_)
            ),
            _ => false,
        }
    }

    fn transform_exp_list_return(
        &mut self,
        exps: &[Exp],
        out: &mut StrList,
        span: Span,
    ) -> Result<()> {
        if exps.len() == 1 {
            return self.transform_exp(&exps[0], out, ExpUsage::Return, None);
        }
        let mut values = Vec::new();
        for exp in exps {
            values.push(self.exp_to_string(exp)?);
        }
        out.push(format!(
            "{}return {}{}",
            self.indent(),
            values.join(", "),
            self.nlr(span)
        ));
        Ok(())
    }

    pub(crate) fn transform_return(&mut self, node: &Return, out: &mut StrList) -> Result<()> {
        if !self.enable_return.last().copied().unwrap_or(true) {
            return Err(CompileError::span(
                "can not mix use of return and export statements in module scope",
                node.span,
            ));
        }
        match &node.value {
            None => {
                out.push(format!("{}return{}", self.indent(), self.nll(node.span)));
                Ok(())
            }
            Some(ReturnValue::TableBlock(block)) => {
                let rendered = self.table_block_to_string(block)?;
                out.push(format!(
                    "{}return {}{}",
                    self.indent(),
                    rendered,
                    self.nlr(node.span)
                ));
                Ok(())
            }
            Some(ReturnValue::ExpListLow(exps)) => {
                self.transform_exp_list_return(exps, out, node.span)
            }
        }
    }

    // -- assignment --------------------------------------------------------

    /// `lhs1, lhs2, ... = rhs...` in all its shapes.
    pub(crate) fn transform_assignment(
        &mut self,
        targets: &[Exp],
        assign: &Assign,
        out: &mut StrList,
    ) -> Result<()> {
        // structured single value: route through Assignment usage
        if let [AssignValue::With(_) | AssignValue::If(_) | AssignValue::Switch(_)] =
            assign.values.as_slice()
        {
            let rendered = self.predefine_targets(targets, out)?;
            match &assign.values[0] {
                AssignValue::With(w) => {
                    return self.transform_with(w, out, ExpUsage::Assignment, Some(&rendered))
                }
                AssignValue::If(i) => {
                    return self.transform_if(i, out, ExpUsage::Assignment, Some(&rendered))
                }
                AssignValue::Switch(s) => {
                    return self.transform_switch(s, out, ExpUsage::Assignment, Some(&rendered))
                }
                _ => unreachable!(),
            }
        }
        // destructuring patterns on the left?
        if targets.iter().any(|t| self.exp_is_pattern(t)) {
            return self.transform_destructure_assignment(targets, assign, out);
        }
        // special chain tails on the left
        if targets.len() == 1 {
            if let Some(handled) = self.try_transform_special_target(&targets[0], assign, out)? {
                let _ = handled;
                return Ok(());
            }
        }
        let values = self.render_assign_values(assign)?;
        let mut names = Vec::new();
        let mut rendered_targets = Vec::new();
        let mut all_plain_new = true;
        for exp in targets {
            match exp.single_variable() {
                Some(name) => {
                    self.check_const(name, exp.span)?;
                    names.push(name.to_string());
                    rendered_targets.push(name.to_string());
                    if self.scopes.is_defined(name) {
                        all_plain_new = false;
                    }
                }
                None => {
                    all_plain_new = false;
                    rendered_targets.push(self.assignment_target_to_string(exp)?);
                }
            }
        }
        if all_plain_new && !names.is_empty() {
            for name in &names {
                self.scopes.add_to_scope(name);
            }
            out.push(format!(
                "{}local {} = {}{}",
                self.indent(),
                rendered_targets.join(", "),
                values.join(", "),
                self.nll(assign.span)
            ));
            return Ok(());
        }
        // predeclare the fresh names, then assign
        let mut fresh = Vec::new();
        for name in &names {
            if self.scopes.add_to_scope(name) {
                fresh.push(name.clone());
            }
        }
        if !fresh.is_empty() {
            out.push(format!(
                "{}local {}\n",
                self.indent(),
                fresh.join(", ")
            ));
        }
        out.push(format!(
            "{}{} = {}{}",
            self.indent(),
            rendered_targets.join(", "),
            values.join(", "),
            self.nll(assign.span)
        ));
        Ok(())
    }

    /// Renders the values of an `Assign` into expression strings.
    pub(crate) fn render_assign_values(&mut self, assign: &Assign) -> Result<Vec<String>> {
        let mut values = Vec::new();
        for value in &assign.values {
            match value {
                AssignValue::Exp(exp) => values.push(self.exp_to_string(exp)?),
                AssignValue::TableBlock(block) => {
                    values.push(self.table_block_to_string(block)?)
                }
                AssignValue::With(w) => {
                    values.push(self.with_to_closure_string(w)?);
                }
                AssignValue::If(i) => {
                    values.push(self.if_to_closure_string(i)?);
                }
                AssignValue::Switch(s) => {
                    values.push(self.switch_to_closure_string(s)?);
                }
            }
        }
        if values.is_empty() {
            return Err(CompileError::span("right value missing", assign.span));
        }
        Ok(values)
    }

    /// Predeclares plain-variable targets and returns the rendered LHS list.
    pub(crate) fn predefine_targets(
        &mut self,
        targets: &[Exp],
        out: &mut StrList,
    ) -> Result<String> {
        let mut rendered = Vec::new();
        let mut fresh = Vec::new();
        for exp in targets {
            match exp.single_variable() {
                Some(name) => {
                    self.check_const(name, exp.span)?;
                    if self.scopes.add_to_scope(name) {
                        fresh.push(name.to_string());
                    }
                    rendered.push(name.to_string());
                }
                None => rendered.push(self.assignment_target_to_string(exp)?),
            }
        }
        if !fresh.is_empty() {
            out.push(format!("{}local {}\n", self.indent(), fresh.join(", ")));
        }
        Ok(rendered.join(", "))
    }

    /// Metatable, metamethod and table-appending assignment targets.
    ///
    /// Returns `Ok(Some(()))` when the target was one of the special forms.
    fn try_transform_special_target(
        &mut self,
        target: &Exp,
        assign: &Assign,
        out: &mut StrList,
    ) -> Result<Option<()>> {
        let chain = match target.single_value() {
            Some(Value::Chain(chain)) => chain,
            _ => return Ok(None),
        };
        let last = match chain.items.last() {
            Some(item) => item,
            None => return Ok(None),
        };
        match last {
            ChainItem::TableAppending(_) => {
                let prefix = ChainValue {
                    items: chain.items[..chain.items.len() - 1].to_vec(),
                    span: chain.span,
                };
                let values = self.render_assign_values(assign)?;
                let obj = self.hoist_chain_to_local(&prefix, out)?;
                out.push(format!(
                    "{}{}[#{} + 1] = {}{}",
                    self.indent(),
                    obj,
                    obj,
                    values.join(", "),
                    self.nll(assign.span)
                ));
                Ok(Some(()))
            }
            ChainItem::Dot(dot) => match &dot.name {
                DotName::Metatable(_) => {
                    let prefix = ChainValue {
                        items: chain.items[..chain.items.len() - 1].to_vec(),
                        span: chain.span,
                    };
                    let prefix_str = self.chain_to_string(&prefix)?;
                    let values = self.render_assign_values(assign)?;
                    out.push(format!(
                        "{}setmetatable({}, {}){}",
                        self.indent(),
                        prefix_str,
                        values.join(", "),
                        self.nll(assign.span)
                    ));
                    Ok(Some(()))
                }
                DotName::Metamethod(method) => {
                    let prefix = ChainValue {
                        items: chain.items[..chain.items.len() - 1].to_vec(),
                        span: chain.span,
                    };
                    let prefix_str = self.chain_to_string(&prefix)?;
                    let key = self.metamethod_key_to_string(method)?;
                    let values = self.render_assign_values(assign)?;
                    out.push(format!(
                        "{}getmetatable({}){} = {}{}",
                        self.indent(),
                        prefix_str,
                        key,
                        values.join(", "),
                        self.nll(assign.span)
                    ));
                    Ok(Some(()))
                }
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Ensures a chain prefix is addressable as a plain local, hoisting it
    /// into an `_obj_N` temp otherwise.
    pub(crate) fn hoist_chain_to_local(
        &mut self,
        chain: &ChainValue,
        out: &mut StrList,
    ) -> Result<String> {
        if chain.items.len() == 1 {
            if let ChainItem::Callable(Callable::Variable(v)) = &chain.items[0] {
                if self.scopes.is_local(&v.name) {
                    return Ok(v.name.clone());
                }
            }
        }
        let rendered = self.chain_to_string(chain)?;
        let temp = self.get_unused_name("_obj_");
        self.scopes.force_add_to_scope(&temp);
        out.push(format!(
            "{}local {} = {}{}",
            self.indent(),
            temp,
            rendered,
            self.nll(chain.span)
        ));
        Ok(temp)
    }

    /// Renders an assignment target chain (no guards, no calls at the end).
    pub(crate) fn assignment_target_to_string(&mut self, exp: &Exp) -> Result<String> {
        match exp.single_value() {
            Some(Value::Chain(chain)) => {
                if chain
                    .items
                    .iter()
                    .any(|item| matches!(item, ChainItem::Existential(_)))
                {
                    return Err(CompileError::span(
                        "left hand expression is not assignable",
                        exp.span,
                    ));
                }
                if chain_is_call(chain) {
                    return Err(CompileError::span(
                        "left hand expression is not assignable",
                        exp.span,
                    ));
                }
                self.chain_to_string(chain)
            }
            Some(Value::Simple(SimpleValue::Const(_))) | Some(Value::Simple(_)) | None => Err(
                CompileError::span("left hand expression is not assignable", exp.span),
            ),
            Some(Value::SimpleTable(_)) | Some(Value::Str(_)) => Err(CompileError::span(
                "left hand expression is not assignable",
                exp.span,
            )),
        }
    }

    // -- chained assignment `a = b = c` ------------------------------------

    pub(crate) fn transform_chain_assign(
        &mut self,
        node: &ChainAssign,
        out: &mut StrList,
    ) -> Result<()> {
        let values = self.render_assign_values(&node.assign)?;
        if values.len() != 1 {
            return Err(CompileError::span(
                "right value missing",
                node.assign.span,
            ));
        }
        // evaluate once, assign right-to-left
        let mut value = values.into_iter().next().expect("checked length");
        let needs_temp = node.exprs.len() > 1;
        if needs_temp {
            let temp = self.get_unused_name("_tmp_");
            self.scopes.force_add_to_scope(&temp);
            out.push(format!(
                "{}local {} = {}{}",
                self.indent(),
                temp,
                value,
                self.nll(node.span)
            ));
            value = temp;
        }
        for target in node.exprs.iter().rev() {
            let assign = Assign {
                values: vec![AssignValue::Exp(
                    self.to_ast_exp(&value, target.span)?,
                )],
                span: node.assign.span,
            };
            self.transform_assignment(std::slice::from_ref(target), &assign, out)?;
        }
        Ok(())
    }

    // -- compound update ---------------------------------------------------

    pub(crate) fn transform_update(
        &mut self,
        targets: &[Exp],
        update: &Update,
        out: &mut StrList,
    ) -> Result<()> {
        if targets.len() > 1 {
            return Err(CompileError::span(
                "can not apply update to multiple values",
                update.span,
            ));
        }
        let target = &targets[0];
        self.check_bitwise_op(&update.op, update.span)?;
        if let Some(name) = target.single_variable() {
            self.check_const(name, target.span)?;
            if !self.scopes.is_defined(name) {
                self.record_global(name, target.span);
            }
        }
        if update.op == "??" {
            return self.transform_nil_coalesce_update(target, update, out);
        }
        let chain = match target.single_value() {
            Some(Value::Chain(chain)) => chain,
            _ => {
                return Err(CompileError::span(
                    "left hand expression is not assignable",
                    target.span,
                ))
            }
        };
        if let Some(ChainItem::Dot(dot)) = chain.items.last() {
            if matches!(dot.name, DotName::Metatable(_)) {
                return Err(CompileError::span(
                    "can not apply update to a metatable",
                    target.span,
                ));
            }
        }
        let value = self.exp_to_string(&update.value)?;
        let value = if update.value.single_value().is_some() {
            value
        } else {
            format!("({})", value)
        };
        // hoist a long chain's prefix so the target is evaluated once
        let lhs = if chain.items.len() > 2
            || (chain.items.len() == 2 && !self.chain_head_is_local(chain))
        {
            let (prefix, tail) = chain.items.split_at(chain.items.len() - 1);
            let prefix_chain = ChainValue {
                items: prefix.to_vec(),
                span: chain.span,
            };
            let obj = self.hoist_chain_to_local(&prefix_chain, out)?;
            let tail_chain = ChainValue {
                items: tail.to_vec(),
                span: chain.span,
            };
            format!("{}{}", obj, self.chain_items_to_string(&tail_chain.items)?)
        } else {
            self.chain_to_string(chain)?
        };
        out.push(format!(
            "{}{} = {} {} {}{}",
            self.indent(),
            lhs,
            lhs,
            lua_binary_op(&update.op),
            value,
            self.nll(update.span)
        ));
        Ok(())
    }

    fn chain_head_is_local(&self, chain: &ChainValue) -> bool {
        matches!(
            chain.items.first(),
            Some(ChainItem::Callable(Callable::Variable(v))) if self.scopes.is_local(&v.name)
        )
    }

    fn transform_nil_coalesce_update(
        &mut self,
        target: &Exp,
        update: &Update,
        out: &mut StrList,
    ) -> Result<()> {
        let lhs = self.assignment_target_to_string(target)?;
        let value = self.exp_to_string(&update.value)?;
        out.push(format!(
            "{}if {} == nil then{}",
            self.indent(),
            lhs,
            self.nll(update.span)
        ));
        out.push(format!(
            "{}{} = {}{}",
            self.indent_with(1),
            lhs,
            value,
            self.nll(update.span)
        ));
        out.push(format!("{}end{}", self.indent(), self.nlr(update.span)));
        Ok(())
    }

    // -- target gating ------------------------------------------------------

    pub(crate) fn check_bitwise_op(&self, op: &str, span: Span) -> Result<()> {
        let bitwise = matches!(op, "&" | "|" | "~" | ">>" | "<<");
        if bitwise && self.target < LuaTarget::Lua53 {
            return Err(CompileError::span(
                "bitwise operator is not available when not targeting Lua version 5.3 or higher",
                span,
            ));
        }
        if op == "//" && self.target < LuaTarget::Lua53 {
            return Err(CompileError::span(
                "floor division is not available when not targeting Lua version 5.3 or higher",
                span,
            ));
        }
        Ok(())
    }

    // -- declarations -------------------------------------------------------

    pub(crate) fn transform_local(&mut self, node: &Local, out: &mut StrList) -> Result<()> {
        match &node.item {
            // handled during block preprocessing
            LocalItem::Star(_) | LocalItem::Caret(_) => Ok(()),
            LocalItem::Values { names, values } => {
                let mut rendered_names = Vec::new();
                for name in names {
                    self.scopes.force_add_to_scope(&name.name);
                    rendered_names.push(name.name.clone());
                }
                match values {
                    None => {
                        out.push(format!(
                            "{}local {}{}",
                            self.indent(),
                            rendered_names.join(", "),
                            self.nll(node.span)
                        ));
                        Ok(())
                    }
                    Some(DeclValues::TableBlock(block)) => {
                        let rendered = self.table_block_to_string(block)?;
                        out.push(format!(
                            "{}local {} = {}{}",
                            self.indent(),
                            rendered_names.join(", "),
                            rendered,
                            self.nll(node.span)
                        ));
                        Ok(())
                    }
                    Some(DeclValues::ExpListLow(exps)) => {
                        let mut values = Vec::new();
                        for exp in exps {
                            values.push(self.exp_to_string(exp)?);
                        }
                        out.push(format!(
                            "{}local {} = {}{}",
                            self.indent(),
                            rendered_names.join(", "),
                            values.join(", "),
                            self.nll(node.span)
                        ));
                        Ok(())
                    }
                }
            }
        }
    }

    pub(crate) fn transform_local_attrib(
        &mut self,
        node: &LocalAttribDecl,
        out: &mut StrList,
    ) -> Result<()> {
        if node.attrib == LocalAttrib::Close && self.target < LuaTarget::Lua54 {
            return Err(CompileError::span(
                "close attribute is not available when not targeting Lua version 5.4 or higher",
                node.span,
            ));
        }
        // patterns under `const` destructure first, then get marked const
        let mut plain_names = Vec::new();
        let mut patterns = Vec::new();
        for target in &node.targets {
            match target {
                AttribTarget::Variable(v) => plain_names.push(v.clone()),
                AttribTarget::SimpleTable(t) => {
                    patterns.push(Exp::pattern_from_simple_table(t.clone()))
                }
                AttribTarget::TableLit(t) => patterns.push(Exp::pattern_from_table_lit(t.clone())),
                AttribTarget::Comprehension(l) => {
                    patterns.push(Exp::pattern_from_comprehension(l.clone()))
                }
            }
        }
        if !patterns.is_empty() {
            if node.attrib == LocalAttrib::Close {
                return Err(CompileError::span(
                    "can only declare variable as const",
                    node.span,
                ));
            }
            self.transform_destructure_assignment(&patterns, &node.assign, out)?;
            for pattern in &patterns {
                for name in self.pattern_target_names(pattern)? {
                    self.scopes.mark_var_const(&name);
                }
            }
            if plain_names.is_empty() {
                return Ok(());
            }
        }
        let values = self.render_assign_values(&node.assign)?;
        let names: Vec<String> = plain_names.iter().map(|v| v.name.clone()).collect();
        for name in &names {
            self.scopes.force_add_to_scope(name);
        }
        let attrib_suffix = if self.target >= LuaTarget::Lua54 {
            match node.attrib {
                LocalAttrib::Const => " <const>",
                LocalAttrib::Close => " <close>",
            }
        } else {
            ""
        };
        let rendered: Vec<String> = names
            .iter()
            .map(|n| format!("{}{}", n, attrib_suffix))
            .collect();
        out.push(format!(
            "{}local {} = {}{}",
            self.indent(),
            rendered.join(", "),
            values.join(", "),
            self.nll(node.span)
        ));
        for name in &names {
            self.scopes.mark_var_const(name);
        }
        Ok(())
    }

    pub(crate) fn transform_global(&mut self, node: &Global, out: &mut StrList) -> Result<()> {
        match &node.item {
            GlobalItem::Star(_) => {
                self.scopes.mark_vars_global(GlobalMode::Any);
                Ok(())
            }
            GlobalItem::Caret(_) => {
                self.scopes.mark_vars_global(GlobalMode::Capital);
                Ok(())
            }
            GlobalItem::ClassDecl(decl) => {
                if let Some(Assignable::Variable(v)) = &decl.name {
                    if !self.scopes.add_global_var(&v.name) {
                        return Err(CompileError::span(
                            "can not declare a local variable to be global",
                            v.span,
                        ));
                    }
                }
                self.transform_class_decl(decl, out, ExpUsage::Common, None)
            }
            GlobalItem::Values { names, values } => {
                for name in names {
                    if !self.scopes.add_global_var(&name.name) {
                        return Err(CompileError::span(
                            "can not declare a local variable to be global",
                            name.span,
                        ));
                    }
                }
                let rendered_names: Vec<String> =
                    names.iter().map(|v| v.name.clone()).collect();
                match values {
                    None => Ok(()),
                    Some(DeclValues::TableBlock(block)) => {
                        let rendered = self.table_block_to_string(block)?;
                        out.push(format!(
                            "{}{} = {}{}",
                            self.indent(),
                            rendered_names.join(", "),
                            rendered,
                            self.nll(node.span)
                        ));
                        Ok(())
                    }
                    Some(DeclValues::ExpListLow(exps)) => {
                        let mut rendered = Vec::new();
                        for exp in exps {
                            rendered.push(self.exp_to_string(exp)?);
                        }
                        out.push(format!(
                            "{}{} = {}{}",
                            self.indent(),
                            rendered_names.join(", "),
                            rendered.join(", "),
                            self.nll(node.span)
                        ));
                        Ok(())
                    }
                }
            }
        }
    }

    pub(crate) fn transform_export(&mut self, node: &Export, out: &mut StrList) -> Result<()> {
        let module = self
            .module_name
            .clone()
            .expect("export statement without a module name");
        if self.return_seen_at_root {
            return Err(CompileError::span(
                "can not mix use of return and export statements in module scope",
                node.span,
            ));
        }
        match &node.target {
            ExportTarget::Macro(def) => {
                self.transform_macro_def(def, out)?;
                if self.config.exporting {
                    self.vm
                        .export_macro(&def.name)
                        .map_err(|err| CompileError::span(err.0, def.span))?;
                }
                Ok(())
            }
            ExportTarget::ModuleSlot(item) => {
                let assign = node.assign.as_ref().expect("module slot needs a value");
                let values = self.render_assign_values(assign)?;
                match item.as_ref() {
                    ChainItem::Dot(dot) => match &dot.name {
                        DotName::Name(name) => {
                            out.push(format!(
                                "{}{}.{} = {}{}",
                                self.indent(),
                                module,
                                name.text,
                                values.join(", "),
                                self.nll(node.span)
                            ));
                            Ok(())
                        }
                        DotName::Metatable(_) => {
                            out.push(format!(
                                "{}{} = setmetatable({}, {}){}",
                                self.indent(),
                                module,
                                module,
                                values.join(", "),
                                self.nll(node.span)
                            ));
                            Ok(())
                        }
                        DotName::Metamethod(method) => {
                            let key = self.metamethod_key_to_string(method)?;
                            out.push(format!(
                                "{}getmetatable({}){} = {}{}",
                                self.indent(),
                                module,
                                key,
                                values.join(", "),
                                self.nll(node.span)
                            ));
                            Ok(())
                        }
                    },
                    ChainItem::Index(exp) => {
                        let key = self.exp_to_string(exp)?;
                        out.push(format!(
                            "{}{}[{}] = {}{}",
                            self.indent(),
                            module,
                            key,
                            values.join(", "),
                            self.nll(node.span)
                        ));
                        Ok(())
                    }
                    _ => Err(CompileError::span("invalid export expression", node.span)),
                }
            }
            ExportTarget::ExpList(exps) => {
                if node.default {
                    let value = self.exp_to_string(&exps[0])?;
                    out.push(format!(
                        "{}{} = {}{}",
                        self.indent(),
                        module,
                        value,
                        self.nll(node.span)
                    ));
                    return Ok(());
                }
                match &node.assign {
                    Some(assign) => {
                        self.transform_assignment(exps, assign, out)?;
                        for exp in exps {
                            if let Some(name) = exp.single_variable() {
                                out.push(format!(
                                    "{}{}[\"{}\"] = {}{}",
                                    self.indent(),
                                    module,
                                    name,
                                    name,
                                    self.nll(node.span)
                                ));
                            }
                        }
                        Ok(())
                    }
                    None => {
                        for exp in exps {
                            let name = exp.single_variable().ok_or_else(|| {
                                CompileError::span("invalid export expression", exp.span)
                            })?;
                            out.push(format!(
                                "{}{}[\"{}\"] = {}{}",
                                self.indent(),
                                module,
                                name,
                                name,
                                self.nll(node.span)
                            ));
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    // -- labels, goto, break ------------------------------------------------

    pub(crate) fn transform_label(&mut self, name: &LabelName, out: &mut StrList) -> Result<()> {
        if self.target < LuaTarget::Lua52 {
            return Err(CompileError::span(
                "label statement is not available when not targeting Lua version 5.2 or higher",
                name.span,
            ));
        }
        let scope = *self.goto_scopes.last().expect("no goto scope");
        if self.labels.len() <= scope {
            self.labels.resize(scope + 1, None);
        }
        let map = self.labels[scope].get_or_insert_with(HashMap::new);
        if let Some(existing) = map.get(&name.name) {
            return Err(CompileError::span(
                format!(
                    "label '{}' already defined at line {}",
                    name.name, existing.line
                ),
                name.span,
            ));
        }
        map.insert(
            name.name.clone(),
            LabelInfo {
                line: name.span.begin.line,
                level: self.scopes.len(),
            },
        );
        out.push(format!(
            "{}::{}::{}",
            self.indent(),
            name.name,
            self.nll(name.span)
        ));
        Ok(())
    }

    pub(crate) fn transform_goto(&mut self, name: &LabelName, out: &mut StrList) -> Result<()> {
        if self.target < LuaTarget::Lua52 {
            return Err(CompileError::span(
                "goto statement is not available when not targeting Lua version 5.2 or higher",
                name.span,
            ));
        }
        self.gotos.push(GotoRecord {
            label: name.name.clone(),
            line: name.span.begin.line,
            col: name.span.begin.col,
            scope: *self.goto_scopes.last().expect("no goto scope"),
            level: self.scopes.len(),
        });
        out.push(format!(
            "{}goto {}{}",
            self.indent(),
            name.name,
            self.nll(name.span)
        ));
        Ok(())
    }

    // -- short table appending ----------------------------------------------

    pub(crate) fn transform_short_tab_appending(
        &mut self,
        node: &ShortTabAppending,
        out: &mut StrList,
    ) -> Result<()> {
        let with_var = self.with_vars.last().cloned().ok_or_else(|| {
            CompileError::span(
                "short table appending must be called within a with block",
                node.span,
            )
        })?;
        let values = self.render_assign_values(&node.assign)?;
        out.push(format!(
            "{}{}[#{} + 1] = {}{}",
            self.indent(),
            with_var,
            with_var,
            values.join(", "),
            self.nll(node.span)
        ));
        Ok(())
    }
}

/// Whether a chain's final step is an invocation.
pub(crate) fn chain_is_call(chain: &ChainValue) -> bool {
    matches!(
        chain.items.last(),
        Some(ChainItem::Invoke(_)) | Some(ChainItem::InvokeArgs(_))
    )
}

/// Lua spelling of a binary/update operator.
pub(crate) fn lua_binary_op(op: &str) -> &str {
    match op {
        "!=" => "~=",
        other => other,
    }
}

/// Collects plain variable names assigned anywhere in a statement list, for
/// `local *` / `local ^` forward declarations.
fn collect_assigned_names(statements: &[Statement], capital_only: bool) -> Vec<String> {
    let mut names = Vec::new();
    let mut push = |name: &str| {
        let starts_upper = name.chars().next().is_some_and(|c| c.is_uppercase());
        if (!capital_only || starts_upper) && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    };
    for stmt in statements {
        match &stmt.content {
            StmtContent::ExpListAssign(list) => {
                if matches!(list.action, Some(AssignAction::Assign(_))) {
                    for exp in &list.exp_list {
                        if let Some(name) = exp.single_variable() {
                            push(name);
                        }
                    }
                }
            }
            StmtContent::ChainAssign(chain) => {
                for exp in &chain.exprs {
                    if let Some(name) = exp.single_variable() {
                        push(name);
                    }
                }
            }
            _ => {}
        }
    }
    names
}

impl Exp {
    /// Wraps a destructuring pattern node back into an expression so the
    /// shared assignment path can dispatch on it.
    pub(crate) fn pattern_from_table_lit(t: TableLit) -> Exp {
        let span = t.span;
        Exp::from_value(Value::Simple(SimpleValue::TableLit(t)), span)
    }

    pub(crate) fn pattern_from_simple_table(t: SimpleTable) -> Exp {
        let span = t.span;
        Exp::from_value(Value::SimpleTable(t), span)
    }

    pub(crate) fn pattern_from_comprehension(t: Comprehension) -> Exp {
        let span = t.span;
        Exp::from_value(
            Value::Simple(SimpleValue::Comprehension(Box::new(t))),
            span,
        )
    }

    pub(crate) fn from_value(value: Value, span: Span) -> Exp {
        Exp {
            pipe_exprs: vec![UnaryExp {
                ops: Vec::new(),
                expos: vec![value],
                in_exp: None,
                span,
            }],
            op_values: Vec::new(),
            nil_coalesced: None,
            span,
        }
    }
}

/// True for the keyword spellings that cannot follow a `.` in Lua.
pub(crate) fn is_lua_keyword(name: &str) -> bool {
    LUA_KEYWORDS.contains(name)
}
