// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Control-flow lowering: branches, loops (with `continue` rewriting per
//! Lua target), `with` blocks, `switch` arms and protected calls.

use super::expr::local_var_item;
use super::{chain_is_call, Compiler, ContinueVar, ExpUsage, LuaTarget, StrList};
use crate::ast::*;
use crate::error::{CompileError, Result};

impl<'a> Compiler<'a> {
    // -- conditions ----------------------------------------------------------

    /// Renders a branch condition, negating it for `unless`/`until`.
    pub(crate) fn cond_exp_to_string(&mut self, cond: &Exp, negate: bool) -> Result<String> {
        let text = self.exp_to_string(cond)?;
        if !negate {
            return Ok(text);
        }
        if cond.single_value().is_some() {
            Ok(format!("not {}", text))
        } else {
            Ok(format!("not ({})", text))
        }
    }

    // -- if / unless ---------------------------------------------------------

    pub(crate) fn transform_if(
        &mut self,
        node: &If,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        if usage == ExpUsage::Closure {
            let clone = node.clone();
            let mut tmp = StrList::new();
            self.closure_wrap(node.span, move |compiler, inner| {
                compiler.transform_if(&clone, inner, ExpUsage::Return, None)
            }, &mut tmp)?;
            out.push(tmp.pop().unwrap_or_default());
            return Ok(());
        }
        self.transform_if_branches(
            node.unless,
            &node.branches,
            node.else_body.as_ref(),
            node.span,
            out,
            usage,
            assign_to,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn transform_if_branches(
        &mut self,
        unless: bool,
        branches: &[IfBranch],
        else_body: Option<&Body>,
        span: Span,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        let (first, rest) = match branches.split_first() {
            Some(split) => split,
            None => return Ok(()),
        };
        // `if x := exp` scopes the binding around the whole branch chain
        if let Some(assignment) = &first.cond.assignment {
            out.push(format!("{}do{}", self.indent(), self.nll(span)));
            self.scopes.push();
            let targets: Vec<Exp> = match &assignment.exp_list {
                Some(extra) => {
                    let mut targets = vec![first.cond.condition.clone()];
                    targets.extend(extra.iter().cloned());
                    targets
                }
                None => vec![first.cond.condition.clone()],
            };
            self.transform_assignment(&targets, &assignment.assign, out)?;
            let mut plain = first.clone();
            plain.cond.assignment = None;
            let mut inner_branches = vec![plain];
            inner_branches.extend(rest.iter().cloned());
            self.transform_if_branches(
                unless,
                &inner_branches,
                else_body,
                span,
                out,
                usage,
                assign_to,
            )?;
            self.scopes.pop();
            out.push(format!("{}end{}", self.indent(), self.nlr(span)));
            return Ok(());
        }
        let cond = self.cond_exp_to_string(&first.cond.condition, unless)?;
        out.push(format!(
            "{}if {} then{}",
            self.indent(),
            cond,
            self.nll(first.cond.span)
        ));
        self.scopes.push();
        if let Some(body) = &first.body {
            self.transform_block(body.statements(), out, usage, assign_to, false)?;
        }
        self.scopes.pop();
        for branch in rest {
            if branch.cond.assignment.is_some() {
                return Err(CompileError::span(
                    "use := for if-assignment expression",
                    branch.cond.span,
                ));
            }
            let cond = self.cond_exp_to_string(&branch.cond.condition, false)?;
            out.push(format!(
                "{}elseif {} then{}",
                self.indent(),
                cond,
                self.nll(branch.cond.span)
            ));
            self.scopes.push();
            if let Some(body) = &branch.body {
                self.transform_block(body.statements(), out, usage, assign_to, false)?;
            }
            self.scopes.pop();
        }
        let needs_else = else_body.is_some() || usage == ExpUsage::Return;
        if needs_else {
            out.push(format!("{}else{}", self.indent(), self.nll(span)));
            self.scopes.push();
            match else_body {
                Some(body) => {
                    self.transform_block(body.statements(), out, usage, assign_to, false)?;
                }
                None => {
                    if usage == ExpUsage::Return {
                        out.push(format!(
                            "{}return nil{}",
                            self.indent(),
                            self.nll(span)
                        ));
                    }
                }
            }
            self.scopes.pop();
        }
        out.push(format!("{}end{}", self.indent(), self.nlr(span)));
        Ok(())
    }

    pub(crate) fn if_to_closure_string(&mut self, node: &If) -> Result<String> {
        let mut tmp = StrList::new();
        self.transform_if(node, &mut tmp, ExpUsage::Closure, None)?;
        Ok(tmp.pop().unwrap_or_default())
    }

    // -- while / until -------------------------------------------------------

    pub(crate) fn transform_while(
        &mut self,
        node: &While,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        match usage {
            ExpUsage::Common => {
                let cond = self.cond_exp_to_string(&node.condition, node.until)?;
                out.push(format!(
                    "{}while {} do{}",
                    self.indent(),
                    cond,
                    self.nll(node.span)
                ));
                self.scopes.push();
                self.transform_loop_body(&node.body, out, "", ExpUsage::Common, None)?;
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(node.span)));
                Ok(())
            }
            _ => {
                let clone = node.clone();
                self.transform_loop_as_accumulator(node.span, out, usage, assign_to, move |c, o| {
                    let accum = c.accumulator_name();
                    let len = c.get_unused_name("_len_");
                    c.scopes.force_add_to_scope(&len);
                    o.push(format!(
                        "{}local {} = 1{}",
                        c.indent(),
                        len,
                        c.nll(clone.span)
                    ));
                    let cond = c.cond_exp_to_string(&clone.condition, clone.until)?;
                    o.push(format!(
                        "{}while {} do{}",
                        c.indent(),
                        cond,
                        c.nll(clone.span)
                    ));
                    c.scopes.push();
                    let target = format!("{}[{}]", accum, len);
                    let bump = format!("{} = {} + 1\n", len, len);
                    c.transform_loop_body(
                        &clone.body,
                        o,
                        &bump,
                        ExpUsage::Assignment,
                        Some(&target),
                    )?;
                    c.scopes.pop();
                    o.push(format!("{}end{}", c.indent(), c.nlr(clone.span)));
                    Ok(())
                })
            }
        }
    }

    /// Rewrites a loop used as an expression into accumulator collection.
    fn transform_loop_as_accumulator(
        &mut self,
        span: Span,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
        emit_loop: impl FnOnce(&mut Self, &mut StrList) -> Result<()>,
    ) -> Result<()> {
        match usage {
            ExpUsage::Closure => {
                let mut tmp = StrList::new();
                self.closure_wrap(span, move |compiler, inner| {
                    let accum = compiler.get_unused_name("_accum_");
                    compiler.scopes.force_add_to_scope(&accum);
                    inner.push(format!(
                        "{}local {} = {{ }}{}",
                        compiler.indent(),
                        accum,
                        compiler.nll(span)
                    ));
                    emit_loop(compiler, inner)?;
                    inner.push(format!(
                        "{}return {}{}",
                        compiler.indent(),
                        accum,
                        compiler.nlr(span)
                    ));
                    Ok(())
                }, &mut tmp)?;
                out.push(tmp.pop().unwrap_or_default());
                Ok(())
            }
            ExpUsage::Return => {
                let mut tmp = StrList::new();
                self.transform_loop_as_accumulator(
                    span,
                    &mut tmp,
                    ExpUsage::Closure,
                    None,
                    emit_loop,
                )?;
                out.push(format!(
                    "{}return {}{}",
                    self.indent(),
                    tmp.pop().unwrap_or_default(),
                    self.nlr(span)
                ));
                Ok(())
            }
            ExpUsage::Assignment => {
                let mut tmp = StrList::new();
                self.transform_loop_as_accumulator(
                    span,
                    &mut tmp,
                    ExpUsage::Closure,
                    None,
                    emit_loop,
                )?;
                out.push(format!(
                    "{}{} = {}{}",
                    self.indent(),
                    assign_to.expect("assignment target"),
                    tmp.pop().unwrap_or_default(),
                    self.nll(span)
                ));
                Ok(())
            }
            ExpUsage::Common => emit_loop(self, out),
        }
    }

    // -- loop bodies and continue --------------------------------------------

    /// Emits a loop body with `continue` rewriting: a `_continue_N` flag and
    /// a `repeat ... until true` wrapper before Lua 5.2, a bottom label and
    /// `goto` from 5.2 on.
    pub(crate) fn transform_loop_body(
        &mut self,
        body: &Body,
        out: &mut StrList,
        append_content: &str,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        let span = body.span();
        let with_continue = has_continue_statement(body.statements());
        let mut extra_label = String::new();
        if with_continue {
            if self.target < LuaTarget::Lua52 {
                let continue_var = self.get_unused_name("_continue_");
                self.scopes.force_add_to_scope(&continue_var);
                self.continue_vars.push(ContinueVar {
                    var: continue_var.clone(),
                    cond_assign: None,
                });
                out.push(format!(
                    "{}local {} = false{}",
                    self.indent(),
                    continue_var,
                    self.nll(span)
                ));
                out.push(format!("{}repeat{}", self.indent(), self.nll(span)));
                self.scopes.push();
            } else {
                let label = self.get_unused_label("_continue_");
                self.register_label(&label, span.begin.line);
                self.continue_vars.push(ContinueVar {
                    var: label.clone(),
                    cond_assign: None,
                });
                extra_label = format!("{}::{}::{}", self.indent(), label, self.nll(span));
            }
        }
        self.enable_break_loop.push(true);
        self.transform_block(body.statements(), out, usage, assign_to, false)?;
        self.enable_break_loop.pop();
        if with_continue {
            if self.target < LuaTarget::Lua52 {
                let continue_var = self.continue_vars.last().expect("continue var").var.clone();
                if !append_content.is_empty() {
                    out.push(format!("{}{}", self.indent(), append_content));
                }
                out.push(format!(
                    "{}{} = true{}",
                    self.indent(),
                    continue_var,
                    self.nll(span)
                ));
                self.scopes.pop();
                out.push(format!("{}until true{}", self.indent(), self.nlr(span)));
                out.push(format!(
                    "{}if not {} then{}",
                    self.indent(),
                    continue_var,
                    self.nlr(span)
                ));
                out.push(format!("{}break{}", self.indent_with(1), self.nlr(span)));
                out.push(format!("{}end{}", self.indent(), self.nlr(span)));
                self.continue_vars.pop();
            } else {
                if !append_content.is_empty() {
                    out.push(format!("{}{}", self.indent(), append_content));
                }
                out.push(extra_label);
                self.continue_vars.pop();
            }
        } else if !append_content.is_empty() {
            out.push(format!("{}{}", self.indent(), append_content));
        }
        Ok(())
    }

    pub(crate) fn transform_break_loop(
        &mut self,
        is_continue: bool,
        span: Span,
        out: &mut StrList,
    ) -> Result<()> {
        if !is_continue {
            if !self.enable_break_loop.last().copied().unwrap_or(false) {
                return Err(CompileError::span("break is not inside a loop", span));
            }
            out.push(format!("{}break{}", self.indent(), self.nll(span)));
            return Ok(());
        }
        let item = self
            .continue_vars
            .last()
            .cloned()
            .ok_or_else(|| CompileError::span("continue is not inside a loop", span))?;
        if let Some(cond_line) = &item.cond_assign {
            out.push(cond_line.clone());
        }
        if self.target < LuaTarget::Lua52 {
            out.push(format!(
                "{}{} = true{}",
                self.indent(),
                item.var,
                self.nll(span)
            ));
            out.push(format!("{}break{}", self.indent(), self.nll(span)));
        } else {
            out.push(format!(
                "{}goto {}{}",
                self.indent(),
                item.var,
                self.nll(span)
            ));
        }
        Ok(())
    }

    // -- repeat --------------------------------------------------------------

    pub(crate) fn transform_repeat(&mut self, node: &Repeat, out: &mut StrList) -> Result<()> {
        let span = node.span;
        let with_continue = has_continue_statement(node.body.statements());
        if with_continue && self.target < LuaTarget::Lua52 {
            out.push(format!("{}repeat{}", self.indent(), self.nll(span)));
            self.scopes.push();
            let cond_var = self.get_unused_name("_cond_");
            self.scopes.force_add_to_scope(&cond_var);
            let continue_var = self.get_unused_name("_continue_");
            self.scopes.force_add_to_scope(&continue_var);
            out.push(format!(
                "{}local {} = false{}",
                self.indent(),
                cond_var,
                self.nll(span)
            ));
            out.push(format!(
                "{}local {} = false{}",
                self.indent(),
                continue_var,
                self.nll(span)
            ));
            out.push(format!("{}repeat{}", self.indent(), self.nll(span)));
            self.scopes.push();
            let cond_text = self.exp_to_string(&node.condition)?;
            let cond_line = format!(
                "{}{} = {}{}",
                self.indent(),
                cond_var,
                cond_text,
                self.nll(node.condition.span)
            );
            self.continue_vars.push(ContinueVar {
                var: continue_var.clone(),
                cond_assign: Some(cond_line.clone()),
            });
            self.enable_break_loop.push(true);
            self.transform_block(
                node.body.statements(),
                out,
                ExpUsage::Common,
                None,
                false,
            )?;
            self.enable_break_loop.pop();
            out.push(cond_line);
            out.push(format!(
                "{}{} = true{}",
                self.indent(),
                continue_var,
                self.nll(span)
            ));
            self.continue_vars.pop();
            self.scopes.pop();
            out.push(format!("{}until true{}", self.indent(), self.nlr(span)));
            out.push(format!(
                "{}if not {} then{}",
                self.indent(),
                continue_var,
                self.nlr(span)
            ));
            out.push(format!("{}break{}", self.indent_with(1), self.nlr(span)));
            out.push(format!("{}end{}", self.indent(), self.nlr(span)));
            self.scopes.pop();
            out.push(format!(
                "{}until {}{}",
                self.indent(),
                cond_var,
                self.nlr(span)
            ));
            return Ok(());
        }
        out.push(format!("{}repeat{}", self.indent(), self.nll(span)));
        self.scopes.push();
        if with_continue {
            let label = self.get_unused_label("_continue_");
            self.register_label(&label, span.begin.line);
            self.continue_vars.push(ContinueVar {
                var: label.clone(),
                cond_assign: None,
            });
            self.enable_break_loop.push(true);
            self.transform_block(
                node.body.statements(),
                out,
                ExpUsage::Common,
                None,
                false,
            )?;
            self.enable_break_loop.pop();
            out.push(format!("{}::{}::{}", self.indent(), label, self.nll(span)));
            self.continue_vars.pop();
        } else {
            self.enable_break_loop.push(true);
            self.transform_block(
                node.body.statements(),
                out,
                ExpUsage::Common,
                None,
                false,
            )?;
            self.enable_break_loop.pop();
        }
        let cond = self.exp_to_string(&node.condition)?;
        self.scopes.pop();
        out.push(format!(
            "{}until {}{}",
            self.indent(),
            cond,
            self.nlr(span)
        ));
        Ok(())
    }

    // -- numeric for ---------------------------------------------------------

    pub(crate) fn transform_for(
        &mut self,
        node: &For,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        match usage {
            ExpUsage::Common => {
                let start = self.exp_to_string(&node.start)?;
                let stop = self.exp_to_string(&node.stop)?;
                let step = match &node.step {
                    Some(step) => format!(", {}", self.exp_to_string(step)?),
                    None => String::new(),
                };
                out.push(format!(
                    "{}for {} = {}, {}{} do{}",
                    self.indent(),
                    node.var.name,
                    start,
                    stop,
                    step,
                    self.nll(node.span)
                ));
                self.scopes.push();
                self.scopes.force_add_to_scope(&node.var.name);
                self.transform_loop_body(&node.body, out, "", ExpUsage::Common, None)?;
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(node.span)));
                Ok(())
            }
            _ => {
                let clone = node.clone();
                self.transform_loop_as_accumulator(node.span, out, usage, assign_to, move |c, o| {
                    c.transform_for_accumulated(&clone, o)
                })
            }
        }
    }

    /// `for` as an expression: collect each body value into the accumulator
    /// declared by the wrapper.
    fn transform_for_accumulated(&mut self, node: &For, out: &mut StrList) -> Result<()> {
        let accum = self.accumulator_name();
        let len = self.get_unused_name("_len_");
        self.scopes.force_add_to_scope(&len);
        out.push(format!(
            "{}local {} = 1{}",
            self.indent(),
            len,
            self.nll(node.span)
        ));
        let start = self.exp_to_string(&node.start)?;
        let stop = self.exp_to_string(&node.stop)?;
        let step = match &node.step {
            Some(step) => format!(", {}", self.exp_to_string(step)?),
            None => String::new(),
        };
        out.push(format!(
            "{}for {} = {}, {}{} do{}",
            self.indent(),
            node.var.name,
            start,
            stop,
            step,
            self.nll(node.span)
        ));
        self.scopes.push();
        self.scopes.force_add_to_scope(&node.var.name);
        let target = format!("{}[{}]", accum, len);
        let bump = format!("{} = {} + 1\n", len, len);
        self.transform_loop_body(&node.body, out, &bump, ExpUsage::Assignment, Some(&target))?;
        self.scopes.pop();
        out.push(format!("{}end{}", self.indent(), self.nlr(node.span)));
        Ok(())
    }

    /// The accumulator introduced by the closest expression-loop wrapper.
    fn accumulator_name(&self) -> String {
        // the wrapper declared `_accum_N` just before calling back in; probe
        // downward for the newest one
        let mut index = 0usize;
        let mut found = "_accum_0".to_string();
        loop {
            let candidate = format!("_accum_{}", index);
            if !self.scopes.is_solid_defined(&candidate) {
                break;
            }
            found = candidate;
            index += 1;
        }
        found
    }

    // -- for-each ------------------------------------------------------------

    pub(crate) fn transform_for_each(
        &mut self,
        node: &ForEach,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        match usage {
            ExpUsage::Common => self.transform_for_each_common(node, out, ExpUsage::Common, None),
            _ => {
                let clone = node.clone();
                self.transform_loop_as_accumulator(node.span, out, usage, assign_to, move |c, o| {
                    let accum = c.accumulator_name();
                    let len = c.get_unused_name("_len_");
                    c.scopes.force_add_to_scope(&len);
                    o.push(format!(
                        "{}local {} = 1{}",
                        c.indent(),
                        len,
                        c.nll(clone.span)
                    ));
                    let target = format!("{}[{}]", accum, len);
                    let bump = format!("{} = {} + 1\n", len, len);
                    c.transform_for_each_body(&clone, o, &bump, ExpUsage::Assignment, Some(&target))
                })
            }
        }
    }

    fn transform_for_each_common(
        &mut self,
        node: &ForEach,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        self.transform_for_each_body(node, out, "", usage, assign_to)
    }

    fn transform_for_each_body(
        &mut self,
        node: &ForEach,
        out: &mut StrList,
        append_content: &str,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        let span = node.span;
        // bind pattern names through temporaries destructured at body top
        let mut loop_names = Vec::new();
        let mut patterns: Vec<(String, &NameOrDestructure)> = Vec::new();
        for item in &node.name_list.items {
            match item {
                NameOrDestructure::Variable(v) => loop_names.push(v.name.clone()),
                pattern => {
                    let temp = self.get_unused_name("_des_");
                    loop_names.push(temp.clone());
                    patterns.push((temp, pattern));
                }
            }
        }
        match &node.loop_value {
            ForEachValue::ExpList(exps) => {
                let mut values = Vec::new();
                for exp in exps {
                    values.push(self.exp_to_string(exp)?);
                }
                out.push(format!(
                    "{}for {} in {} do{}",
                    self.indent(),
                    loop_names.join(", "),
                    values.join(", "),
                    self.nll(span)
                ));
                self.scopes.push();
                for name in &loop_names {
                    self.scopes.force_add_to_scope(name);
                }
                self.emit_for_each_patterns(&patterns, out)?;
                self.transform_loop_body(&node.body, out, append_content, usage, assign_to)?;
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(span)));
                Ok(())
            }
            ForEachValue::Star(exp) => {
                let name = loop_names
                    .first()
                    .cloned()
                    .expect("for-each needs at least one name");
                let (list_var, range, prelude) = self.star_loop_parts(exp)?;
                for line in prelude {
                    out.push(line);
                }
                let index_var = self.get_unused_name("_index_");
                out.push(format!(
                    "{}for {} = {} do{}",
                    self.indent(),
                    index_var,
                    range,
                    self.nll(span)
                ));
                self.scopes.push();
                self.scopes.force_add_to_scope(&index_var);
                self.scopes.force_add_to_scope(&name);
                out.push(format!(
                    "{}local {} = {}[{}]{}",
                    self.indent(),
                    name,
                    list_var,
                    index_var,
                    self.nll(span)
                ));
                self.emit_for_each_patterns(&patterns, out)?;
                self.transform_loop_body(&node.body, out, append_content, usage, assign_to)?;
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(span)));
                Ok(())
            }
        }
    }

    /// Hoists the `*seq` operand and computes the numeric range, honoring a
    /// trailing slice.
    fn star_loop_parts(&mut self, exp: &Exp) -> Result<(String, String, Vec<String>)> {
        let mut prelude = Vec::new();
        let span = exp.span;
        if let Some(Value::Chain(chain)) = exp.single_value() {
            if let Some(ChainItem::Slice(slice)) = chain.items.last() {
                let slice = slice.clone();
                let prefix = ChainValue {
                    items: chain.items[..chain.items.len() - 1].to_vec(),
                    span: chain.span,
                };
                let list_var = {
                    let mut tmp = StrList::new();
                    let var = self.hoist_chain_to_local(&prefix, &mut tmp)?;
                    prelude.extend(tmp);
                    var
                };
                let lo = match &slice.start {
                    Some(e) => self.exp_to_string(e)?,
                    None => "1".to_string(),
                };
                let hi = match &slice.stop {
                    Some(e) => self.exp_to_string(e)?,
                    None => format!("#{}", list_var),
                };
                let step = match &slice.step {
                    Some(e) => format!(", {}", self.exp_to_string(e)?),
                    None => String::new(),
                };
                return Ok((list_var, format!("{}, {}{}", lo, hi, step), prelude));
            }
        }
        let rendered = self.exp_to_string(exp)?;
        let simple = rendered
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        let list_var = if simple && self.scopes.is_local(&rendered) {
            rendered
        } else {
            let temp = self.get_unused_name("_list_");
            self.scopes.force_add_to_scope(&temp);
            prelude.push(format!(
                "{}local {} = {}{}",
                self.indent(),
                temp,
                rendered,
                self.nll(span)
            ));
            temp
        };
        Ok((list_var.clone(), format!("1, #{}", list_var), prelude))
    }

    fn emit_for_each_patterns(
        &mut self,
        patterns: &[(String, &NameOrDestructure)],
        out: &mut StrList,
    ) -> Result<()> {
        for (temp, pattern) in patterns {
            let target = match pattern {
                NameOrDestructure::TableLit(t) => Exp::pattern_from_table_lit(t.clone()),
                NameOrDestructure::Comprehension(l) => {
                    Exp::pattern_from_comprehension(l.clone())
                }
                NameOrDestructure::Variable(_) => continue,
            };
            let value = Exp::from_value(
                Value::Chain(ChainValue {
                    items: vec![local_var_item(temp, target.span)],
                    span: target.span,
                }),
                target.span,
            );
            let assign = Assign {
                values: vec![AssignValue::Exp(value)],
                span: target.span,
            };
            self.transform_destructure_assignment(
                std::slice::from_ref(&target),
                &assign,
                out,
            )?;
        }
        Ok(())
    }

    // -- do ------------------------------------------------------------------

    pub(crate) fn transform_do(
        &mut self,
        node: &Do,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        if usage == ExpUsage::Closure {
            let clone = node.clone();
            let mut tmp = StrList::new();
            self.closure_wrap(node.span, move |compiler, inner| {
                compiler.transform_block(
                    clone.body.statements(),
                    inner,
                    ExpUsage::Return,
                    None,
                    false,
                )
            }, &mut tmp)?;
            out.push(tmp.pop().unwrap_or_default());
            return Ok(());
        }
        out.push(format!("{}do{}", self.indent(), self.nll(node.span)));
        self.scopes.push();
        self.transform_block(node.body.statements(), out, usage, assign_to, false)?;
        self.scopes.pop();
        out.push(format!("{}end{}", self.indent(), self.nlr(node.span)));
        Ok(())
    }

    // -- with ----------------------------------------------------------------

    pub(crate) fn transform_with(
        &mut self,
        node: &With,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        if usage == ExpUsage::Closure {
            let clone = node.clone();
            let mut tmp = StrList::new();
            self.closure_wrap(node.span, move |compiler, inner| {
                compiler.transform_with(&clone, inner, ExpUsage::Return, None)
            }, &mut tmp)?;
            out.push(tmp.pop().unwrap_or_default());
            return Ok(());
        }
        let span = node.span;
        out.push(format!("{}do{}", self.indent(), self.nll(span)));
        self.scopes.push();
        let value = node
            .value_list
            .first()
            .ok_or_else(|| CompileError::span("right value missing", span))?;
        let with_var = match &node.assigns {
            Some(assign) => {
                // `with obj = exp` binds the target name itself
                match value.single_variable() {
                    Some(name) => {
                        let name = name.to_string();
                        self.transform_assignment(
                            std::slice::from_ref(value),
                            assign,
                            out,
                        )?;
                        name
                    }
                    None => {
                        let temp = self.get_unused_name("_with_");
                        self.scopes.force_add_to_scope(&temp);
                        let values = self.render_assign_values(assign)?;
                        out.push(format!(
                            "{}local {} = {}{}",
                            self.indent(),
                            temp,
                            values.join(", "),
                            self.nll(span)
                        ));
                        temp
                    }
                }
            }
            None => {
                let temp = self.get_unused_name("_with_");
                self.scopes.force_add_to_scope(&temp);
                let rendered = self.exp_to_string(value)?;
                out.push(format!(
                    "{}local {} = {}{}",
                    self.indent(),
                    temp,
                    rendered,
                    self.nll(span)
                ));
                temp
            }
        };
        self.with_vars.push(with_var.clone());
        if node.eop {
            out.push(format!(
                "{}if {} ~= nil then{}",
                self.indent(),
                with_var,
                self.nll(span)
            ));
            self.scopes.push();
        }
        self.transform_block(node.body.statements(), out, ExpUsage::Common, None, false)?;
        if node.eop {
            self.scopes.pop();
            out.push(format!("{}end{}", self.indent(), self.nlr(span)));
        }
        self.with_vars.pop();
        match usage {
            ExpUsage::Return => out.push(format!(
                "{}return {}{}",
                self.indent(),
                with_var,
                self.nlr(span)
            )),
            ExpUsage::Assignment => out.push(format!(
                "{}{} = {}{}",
                self.indent(),
                assign_to.expect("assignment target"),
                with_var,
                self.nll(span)
            )),
            _ => {}
        }
        self.scopes.pop();
        out.push(format!("{}end{}", self.indent(), self.nlr(span)));
        Ok(())
    }

    pub(crate) fn with_to_closure_string(&mut self, node: &With) -> Result<String> {
        let mut tmp = StrList::new();
        self.transform_with(node, &mut tmp, ExpUsage::Closure, None)?;
        Ok(tmp.pop().unwrap_or_default())
    }

    // -- switch --------------------------------------------------------------

    pub(crate) fn transform_switch(
        &mut self,
        node: &Switch,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        if usage == ExpUsage::Closure {
            let clone = node.clone();
            let mut tmp = StrList::new();
            self.closure_wrap(node.span, move |compiler, inner| {
                compiler.transform_switch(&clone, inner, ExpUsage::Return, None)
            }, &mut tmp)?;
            out.push(tmp.pop().unwrap_or_default());
            return Ok(());
        }
        let span = node.span;
        out.push(format!("{}do{}", self.indent(), self.nll(span)));
        self.scopes.push();
        let target_var = match node.target.single_variable() {
            Some(name) if self.scopes.is_local(name) => name.to_string(),
            _ => {
                let temp = self.get_unused_name("_exp_");
                self.scopes.force_add_to_scope(&temp);
                let rendered = self.exp_to_string(&node.target)?;
                out.push(format!(
                    "{}local {} = {}{}",
                    self.indent(),
                    temp,
                    rendered,
                    self.nll(span)
                ));
                temp
            }
        };
        self.transform_switch_branches(
            &target_var,
            &node.branches,
            node.else_body.as_ref(),
            span,
            out,
            usage,
            assign_to,
        )?;
        self.scopes.pop();
        out.push(format!("{}end{}", self.indent(), self.nlr(span)));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn transform_switch_branches(
        &mut self,
        target_var: &str,
        branches: &[SwitchCase],
        else_body: Option<&Body>,
        span: Span,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        let (first, rest) = match branches.split_first() {
            Some(split) => split,
            None => {
                if let Some(body) = else_body {
                    self.transform_block(body.statements(), out, usage, assign_to, false)?;
                } else if usage == ExpUsage::Return {
                    out.push(format!("{}return nil{}", self.indent(), self.nll(span)));
                }
                return Ok(());
            }
        };
        if let Some(pattern) = switch_case_pattern(first) {
            // destructure-and-match arm, cascaded through a `_match_N` flag
            let match_var = self.get_unused_name("_match_");
            self.scopes.force_add_to_scope(&match_var);
            out.push(format!(
                "{}local {} = false{}",
                self.indent(),
                match_var,
                self.nll(first.span)
            ));
            out.push(format!(
                "{}if \"table\" == type({}) then{}",
                self.indent(),
                target_var,
                self.nll(first.span)
            ));
            self.scopes.push();
            let items = self.destructure_pattern_items(&pattern, target_var)?;
            let mut required = Vec::new();
            let mut names = Vec::new();
            let mut accessors = Vec::new();
            for item in &items {
                names.push(item.name.clone());
                accessors.push(item.accessor.clone());
                if item.default.is_none() {
                    required.push(item.name.clone());
                }
                self.scopes.force_add_to_scope(&item.name);
            }
            if !names.is_empty() {
                out.push(format!(
                    "{}local {} = {}{}",
                    self.indent(),
                    names.join(", "),
                    accessors.join(", "),
                    self.nll(first.span)
                ));
            }
            let guard = if required.is_empty() {
                None
            } else {
                let checks: Vec<String> =
                    required.iter().map(|n| format!("{} ~= nil", n)).collect();
                Some(checks.join(" and "))
            };
            if let Some(guard) = &guard {
                out.push(format!(
                    "{}if {} then{}",
                    self.indent(),
                    guard,
                    self.nll(first.span)
                ));
                self.scopes.push();
            }
            for item in &items {
                if let Some(default) = &item.default {
                    out.push(format!(
                        "{}if {} == nil then{}",
                        self.indent(),
                        item.name,
                        self.nll(first.span)
                    ));
                    out.push(format!(
                        "{}{} = {}{}",
                        self.indent_with(1),
                        item.name,
                        default,
                        self.nll(first.span)
                    ));
                    out.push(format!("{}end{}", self.indent(), self.nlr(first.span)));
                }
            }
            out.push(format!(
                "{}{} = true{}",
                self.indent(),
                match_var,
                self.nll(first.span)
            ));
            self.transform_block(first.body.statements(), out, usage, assign_to, false)?;
            if guard.is_some() {
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(first.span)));
            }
            self.scopes.pop();
            out.push(format!("{}end{}", self.indent(), self.nlr(first.span)));
            out.push(format!(
                "{}if not {} then{}",
                self.indent(),
                match_var,
                self.nll(first.span)
            ));
            self.scopes.push();
            self.transform_switch_branches(
                target_var, rest, else_body, span, out, usage, assign_to,
            )?;
            self.scopes.pop();
            out.push(format!("{}end{}", self.indent(), self.nlr(first.span)));
            return Ok(());
        }
        // plain equality arms chain into if/elseif/else
        let mut keyword = "if";
        let mut open = true;
        let mut emit_plain = |compiler: &mut Self,
                              case: &SwitchCase,
                              keyword: &str,
                              out: &mut StrList|
         -> Result<()> {
            let mut checks = Vec::new();
            for cond in &case.conditions {
                let rendered = compiler.exp_to_string(cond)?;
                checks.push(format!("{} == {}", target_var, rendered));
            }
            out.push(format!(
                "{}{} {} then{}",
                compiler.indent(),
                keyword,
                checks.join(" or "),
                compiler.nll(case.span)
            ));
            compiler.scopes.push();
            compiler.transform_block(case.body.statements(), out, usage, assign_to, false)?;
            compiler.scopes.pop();
            Ok(())
        };
        emit_plain(self, first, keyword, out)?;
        keyword = "elseif";
        for case in rest {
            if let Some(pattern) = switch_case_pattern(case) {
                // a pattern arm mid-chain restarts the cascade inside `else`
                let _ = pattern;
                out.push(format!("{}else{}", self.indent(), self.nll(case.span)));
                self.scopes.push();
                let mut remaining = vec![case.clone()];
                remaining.extend(rest.iter().skip_while(|c| !std::ptr::eq(*c, case)).skip(1).cloned());
                self.transform_switch_branches(
                    target_var, &remaining, else_body, span, out, usage, assign_to,
                )?;
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(span)));
                open = false;
                break;
            }
            emit_plain(self, case, keyword, out)?;
        }
        if open {
            match else_body {
                Some(body) => {
                    out.push(format!("{}else{}", self.indent(), self.nll(span)));
                    self.scopes.push();
                    self.transform_block(body.statements(), out, usage, assign_to, false)?;
                    self.scopes.pop();
                }
                None => {
                    if usage == ExpUsage::Return {
                        out.push(format!("{}else{}", self.indent(), self.nll(span)));
                        out.push(format!(
                            "{}return nil{}",
                            self.indent_with(1),
                            self.nll(span)
                        ));
                    }
                }
            }
            out.push(format!("{}end{}", self.indent(), self.nlr(span)));
        }
        Ok(())
    }

    pub(crate) fn switch_to_closure_string(&mut self, node: &Switch) -> Result<String> {
        let mut tmp = StrList::new();
        self.transform_switch(node, &mut tmp, ExpUsage::Closure, None)?;
        Ok(tmp.pop().unwrap_or_default())
    }

    // -- try / catch ---------------------------------------------------------

    pub(crate) fn transform_try(
        &mut self,
        node: &Try,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        let span = node.span;
        let handler = match &node.catch {
            Some(catch) => {
                self.scopes.push();
                self.scopes.force_add_to_scope(&catch.err.name);
                let mut body = StrList::new();
                self.transform_block(
                    &catch.block.statements,
                    &mut body,
                    ExpUsage::Return,
                    None,
                    false,
                )?;
                self.scopes.pop();
                Some(format!(
                    "function({})\n{}{}end",
                    catch.err.name,
                    super::join(&body),
                    self.indent()
                ))
            }
            None => None,
        };
        let call = match &node.func {
            TryFunc::Exp(exp) => {
                let callee_split = match exp.single_value() {
                    Some(Value::Chain(chain)) if chain_is_call(chain) => {
                        let (last, prefix) = chain
                            .items
                            .split_last()
                            .expect("call chain cannot be empty");
                        let callee = self.chain_items_to_string(prefix)?;
                        let args = match last {
                            ChainItem::Invoke(invoke) => {
                                self.invoke_args_to_strings(invoke)?
                            }
                            ChainItem::InvokeArgs(invoke_args) => {
                                let invoke =
                                    super::expr::invoke_from_invoke_args(invoke_args);
                                self.invoke_args_to_strings(&invoke)?
                            }
                            _ => unreachable!("checked by chain_is_call"),
                        };
                        Some((callee, args))
                    }
                    _ => None,
                };
                match callee_split {
                    Some((callee, args)) => {
                        let mut pieces = vec![callee];
                        if let Some(handler) = &handler {
                            pieces.push(handler.clone());
                        }
                        pieces.extend(args);
                        format!(
                            "{}({})",
                            if handler.is_some() { "xpcall" } else { "pcall" },
                            pieces.join(", ")
                        )
                    }
                    None => {
                        let mut body = StrList::new();
                        let exp = (**exp).clone();
                        self.scopes.push();
                        self.push_function_scope(false);
                        self.transform_exp(&exp, &mut body, ExpUsage::Return, None)?;
                        self.pop_function_scope();
                        self.scopes.pop();
                        let wrapped =
                            format!("function()\n{}{}end", super::join(&body), self.indent());
                        match &handler {
                            Some(handler) => format!("xpcall({}, {})", wrapped, handler),
                            None => format!("pcall({})", wrapped),
                        }
                    }
                }
            }
            TryFunc::Block(block) => {
                self.scopes.push();
                self.push_function_scope(false);
                let mut body = StrList::new();
                self.transform_block(
                    &block.statements,
                    &mut body,
                    ExpUsage::Return,
                    None,
                    false,
                )?;
                self.pop_function_scope();
                self.scopes.pop();
                let wrapped = format!("function()\n{}{}end", super::join(&body), self.indent());
                match &handler {
                    Some(handler) => format!("xpcall({}, {})", wrapped, handler),
                    None => format!("pcall({})", wrapped),
                }
            }
        };
        match usage {
            ExpUsage::Closure => out.push(call),
            ExpUsage::Common => {
                out.push(format!("{}{}{}", self.indent(), call, self.nll(span)))
            }
            ExpUsage::Return => out.push(format!(
                "{}return {}{}",
                self.indent(),
                call,
                self.nlr(span)
            )),
            ExpUsage::Assignment => out.push(format!(
                "{}{} = {}{}",
                self.indent(),
                assign_to.expect("assignment target"),
                call,
                self.nll(span)
            )),
        }
        Ok(())
    }

    // -- comprehension-shaped statement appendix -----------------------------

    /// `stmt for ...` — the statement runs inside the loop nest.
    pub(crate) fn transform_comp_statement(
        &mut self,
        inner: &CompInner,
        stmt: &Statement,
        out: &mut StrList,
    ) -> Result<()> {
        let clauses = inner.clauses.clone();
        let stmt = stmt.clone();
        self.transform_comp_clauses(&clauses, out, &mut |compiler, out| {
            compiler.transform_statement(&stmt, out)
        })
    }

    /// Emits nested `for`/`if` headers for comprehension clauses, calling
    /// `body` at the innermost level.
    pub(crate) fn transform_comp_clauses(
        &mut self,
        clauses: &[CompClause],
        out: &mut StrList,
        body: &mut dyn FnMut(&mut Self, &mut StrList) -> Result<()>,
    ) -> Result<()> {
        let (first, rest) = match clauses.split_first() {
            Some(split) => split,
            None => return body(self, out),
        };
        match first {
            CompClause::For(comp_for) => {
                let start = self.exp_to_string(&comp_for.start)?;
                let stop = self.exp_to_string(&comp_for.stop)?;
                let step = match &comp_for.step {
                    Some(step) => format!(", {}", self.exp_to_string(step)?),
                    None => String::new(),
                };
                out.push(format!(
                    "{}for {} = {}, {}{} do{}",
                    self.indent(),
                    comp_for.var.name,
                    start,
                    stop,
                    step,
                    self.nll(comp_for.span)
                ));
                self.scopes.push();
                self.scopes.force_add_to_scope(&comp_for.var.name);
                self.transform_comp_clauses(rest, out, body)?;
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(comp_for.span)));
                Ok(())
            }
            CompClause::ForEach(for_each) => {
                let node = ForEach {
                    name_list: for_each.name_list.clone(),
                    loop_value: match &for_each.loop_value {
                        CompForValue::Star(e) => ForEachValue::Star(e.clone()),
                        CompForValue::Exp(e) => ForEachValue::ExpList(vec![(**e).clone()]),
                    },
                    body: Body::Block(Block {
                        statements: Vec::new(),
                        span: for_each.span,
                    }),
                    span: for_each.span,
                };
                // emit the loop header by hand so the inner clauses nest
                let mut loop_names = Vec::new();
                let mut patterns: Vec<(String, NameOrDestructure)> = Vec::new();
                for item in &node.name_list.items {
                    match item {
                        NameOrDestructure::Variable(v) => loop_names.push(v.name.clone()),
                        pattern => {
                            let temp = self.get_unused_name("_des_");
                            loop_names.push(temp.clone());
                            patterns.push((temp, pattern.clone()));
                        }
                    }
                }
                match &node.loop_value {
                    ForEachValue::ExpList(exps) => {
                        let mut values = Vec::new();
                        for exp in exps {
                            values.push(self.exp_to_string(exp)?);
                        }
                        out.push(format!(
                            "{}for {} in {} do{}",
                            self.indent(),
                            loop_names.join(", "),
                            values.join(", "),
                            self.nll(for_each.span)
                        ));
                        self.scopes.push();
                        for name in &loop_names {
                            self.scopes.force_add_to_scope(name);
                        }
                    }
                    ForEachValue::Star(exp) => {
                        let (list_var, range, prelude) = self.star_loop_parts(exp)?;
                        for line in prelude {
                            out.push(line);
                        }
                        let index_var = self.get_unused_name("_index_");
                        out.push(format!(
                            "{}for {} = {} do{}",
                            self.indent(),
                            index_var,
                            range,
                            self.nll(for_each.span)
                        ));
                        self.scopes.push();
                        self.scopes.force_add_to_scope(&index_var);
                        let name = loop_names.first().cloned().expect("loop name");
                        self.scopes.force_add_to_scope(&name);
                        out.push(format!(
                            "{}local {} = {}[{}]{}",
                            self.indent(),
                            name,
                            list_var,
                            index_var,
                            self.nll(for_each.span)
                        ));
                    }
                }
                let pattern_refs: Vec<(String, &NameOrDestructure)> = patterns
                    .iter()
                    .map(|(temp, pattern)| (temp.clone(), pattern))
                    .collect();
                self.emit_for_each_patterns(&pattern_refs, out)?;
                self.transform_comp_clauses(rest, out, body)?;
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(for_each.span)));
                Ok(())
            }
            CompClause::When(cond) => {
                let rendered = self.exp_to_string(cond)?;
                out.push(format!(
                    "{}if {} then{}",
                    self.indent(),
                    rendered,
                    self.nll(cond.span)
                ));
                self.scopes.push();
                self.transform_comp_clauses(rest, out, body)?;
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(cond.span)));
                Ok(())
            }
        }
    }
}

/// The destructuring pattern of a `when` arm, when it has one.
fn switch_case_pattern(case: &SwitchCase) -> Option<Value> {
    if case.conditions.len() != 1 {
        return None;
    }
    match case.conditions[0].single_value() {
        Some(value @ Value::SimpleTable(_)) => Some(value.clone()),
        Some(value @ Value::Simple(SimpleValue::TableLit(_))) => Some(value.clone()),
        _ => None,
    }
}

/// Whether a statement list contains `continue` outside any nested loop or
/// function literal.
pub(crate) fn has_continue_statement(statements: &[Statement]) -> bool {
    statements.iter().any(statement_has_continue)
}

fn statement_has_continue(stmt: &Statement) -> bool {
    match &stmt.content {
        StmtContent::BreakLoop { is_continue, .. } => *is_continue,
        StmtContent::ExpListAssign(list) if list.action.is_none() => {
            list.exp_list.iter().any(exp_has_continue)
        }
        _ => false,
    }
}

fn exp_has_continue(exp: &Exp) -> bool {
    match exp.single_value() {
        Some(Value::Simple(SimpleValue::If(node))) => {
            node.branches.iter().any(|branch| {
                branch
                    .body
                    .as_ref()
                    .is_some_and(|body| has_continue_statement(body.statements()))
            }) || node
                .else_body
                .as_ref()
                .is_some_and(|body| has_continue_statement(body.statements()))
        }
        Some(Value::Simple(SimpleValue::Do(node))) => {
            has_continue_statement(node.body.statements())
        }
        Some(Value::Simple(SimpleValue::With(node))) => {
            has_continue_statement(node.body.statements())
        }
        Some(Value::Simple(SimpleValue::Switch(node))) => {
            node.branches
                .iter()
                .any(|case| has_continue_statement(case.body.statements()))
                || node
                    .else_body
                    .as_ref()
                    .is_some_and(|body| has_continue_statement(body.statements()))
        }
        _ => false,
    }
}
