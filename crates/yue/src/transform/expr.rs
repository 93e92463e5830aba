// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Expression emission: operator spines, chains with existential guards,
//! pipes, function literals, strings and macro expansion.

use lazy_static::lazy_static;
use std::collections::HashSet;

use super::{chain_is_call, is_lua_keyword, Compiler, ExpUsage, LuaTarget, StrList};
use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::macros::{MacroCodeType, MacroExpansion};

lazy_static! {
    static ref METAMETHODS: HashSet<&'static str> = [
        "add", "sub", "mul", "div", "mod", "pow", "unm", "concat", "len", "eq", "lt", "le",
        "index", "newindex", "call", "gc", "mode", "metatable", "name", "tostring", "close",
        "pairs", "ipairs", "idiv", "band", "bor", "bxor", "bnot", "shl", "shr",
    ]
    .into_iter()
    .collect();
}

impl<'a> Compiler<'a> {
    // -- expressions ---------------------------------------------------------

    pub(crate) fn transform_exp(
        &mut self,
        exp: &Exp,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        if exp.nil_coalesced.is_some() {
            return self.transform_nil_coalesce(exp, out, usage, assign_to);
        }
        if let Some(value) = exp.single_value() {
            if let Some(()) = self.try_transform_structured_value(value, out, usage, assign_to)? {
                return Ok(());
            }
            if let Value::Chain(chain) = value {
                if usage != ExpUsage::Closure {
                    return self.transform_chain_value(chain, out, usage, assign_to);
                }
            }
        }
        let text = self.exp_to_string(exp)?;
        match usage {
            ExpUsage::Closure => {
                out.push(text);
                Ok(())
            }
            ExpUsage::Return => {
                out.push(format!(
                    "{}return {}{}",
                    self.indent(),
                    text,
                    self.nlr(exp.span)
                ));
                Ok(())
            }
            ExpUsage::Assignment => {
                let target = assign_to.expect("assignment usage needs a target");
                out.push(format!(
                    "{}{} = {}{}",
                    self.indent(),
                    target,
                    text,
                    self.nll(exp.span)
                ));
                Ok(())
            }
            ExpUsage::Common => Err(CompileError::span("unexpected expression", exp.span)),
        }
    }

    /// Dispatches control forms used as values to their usage-aware
    /// transforms. Returns `Some(())` when the value was structured.
    fn try_transform_structured_value(
        &mut self,
        value: &Value,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<Option<()>> {
        let simple = match value {
            Value::Simple(simple) => simple,
            _ => return Ok(None),
        };
        match simple {
            SimpleValue::If(node) => {
                self.transform_if(node, out, usage, assign_to)?;
                Ok(Some(()))
            }
            SimpleValue::Switch(node) => {
                self.transform_switch(node, out, usage, assign_to)?;
                Ok(Some(()))
            }
            SimpleValue::With(node) => {
                self.transform_with(node, out, usage, assign_to)?;
                Ok(Some(()))
            }
            SimpleValue::Try(node) => {
                self.transform_try(node, out, usage, assign_to)?;
                Ok(Some(()))
            }
            SimpleValue::Do(node) => {
                self.transform_do(node, out, usage, assign_to)?;
                Ok(Some(()))
            }
            SimpleValue::ClassDecl(node) => {
                self.transform_class_decl(node, out, usage, assign_to)?;
                Ok(Some(()))
            }
            SimpleValue::While(node) => {
                self.transform_while(node, out, usage, assign_to)?;
                Ok(Some(()))
            }
            SimpleValue::For(node) => {
                self.transform_for(node, out, usage, assign_to)?;
                Ok(Some(()))
            }
            SimpleValue::ForEach(node) => {
                self.transform_for_each(node, out, usage, assign_to)?;
                Ok(Some(()))
            }
            SimpleValue::Comprehension(node) => {
                self.transform_comprehension(node, out, usage, assign_to)?;
                Ok(Some(()))
            }
            SimpleValue::TblComprehension(node) => {
                self.transform_tbl_comprehension(node, out, usage, assign_to)?;
                Ok(Some(()))
            }
            _ => Ok(None),
        }
    }

    /// Renders an expression for use inside another expression.
    pub(crate) fn exp_to_string(&mut self, exp: &Exp) -> Result<String> {
        if exp.nil_coalesced.is_some() {
            let mut tmp = StrList::new();
            self.transform_nil_coalesce(exp, &mut tmp, ExpUsage::Closure, None)?;
            return Ok(tmp.pop().unwrap_or_default());
        }
        let mut text = self.pipe_exprs_to_string(&exp.pipe_exprs)?;
        for op_value in &exp.op_values {
            self.check_bitwise_op(&op_value.op.op, op_value.op.span)?;
            let rhs = self.pipe_exprs_to_string(&op_value.pipe_exprs)?;
            text.push(' ');
            text.push_str(super::lua_binary_op(&op_value.op.op));
            text.push(' ');
            text.push_str(&rhs);
        }
        Ok(text)
    }

    // -- pipes ---------------------------------------------------------------

    fn pipe_exprs_to_string(&mut self, pipes: &[UnaryExp]) -> Result<String> {
        if pipes.len() == 1 {
            return self.unary_exp_to_string(&pipes[0]);
        }
        let folded = self.resolve_pipes(pipes)?;
        self.unary_exp_to_string(&folded)
    }

    /// Folds `a |> f(_, b) |> g` into nested call AST.
    pub(crate) fn resolve_pipes(&mut self, pipes: &[UnaryExp]) -> Result<UnaryExp> {
        let mut acc = pipes[0].clone();
        for stage in &pipes[1..] {
            let span = stage.span;
            let value = single_chain_from_unary(stage).ok_or_else(|| {
                CompileError::span("pipe operator must be followed by chain value", span)
            })?;
            let mut chain = value.clone();
            let arg = Exp {
                pipe_exprs: vec![acc],
                op_values: Vec::new(),
                nil_coalesced: None,
                span,
            };
            substitute_pipe_arg(&mut chain, arg, span)?;
            acc = UnaryExp {
                ops: stage.ops.clone(),
                expos: vec![Value::Chain(chain)],
                in_exp: stage.in_exp.clone(),
                span,
            };
        }
        Ok(acc)
    }

    fn unary_exp_to_string(&mut self, unary: &UnaryExp) -> Result<String> {
        let mut prefix = String::new();
        for op in &unary.ops {
            if op.op == "~" && self.target < LuaTarget::Lua53 {
                return Err(CompileError::span(
                    "bitwise operator is not available when not targeting Lua version 5.3 \
                     or higher",
                    op.span,
                ));
            }
            if op.op == "not" {
                prefix.push_str("not ");
            } else {
                prefix.push_str(&op.op);
            }
        }
        let mut parts = Vec::new();
        for value in &unary.expos {
            parts.push(self.value_to_string(value)?);
        }
        let base = format!("{}{}", prefix, parts.join(" ^ "));
        match &unary.in_exp {
            None => Ok(base),
            Some(in_exp) => self.in_exp_to_string(&base, in_exp),
        }
    }

    /// `x in [a, b]` membership tests.
    fn in_exp_to_string(&mut self, base: &str, in_exp: &In) -> Result<String> {
        let items: Vec<String> = match &in_exp.target {
            InTarget::Discrete(exps) => {
                let mut items = Vec::new();
                for exp in exps {
                    items.push(self.exp_to_string(exp)?);
                }
                items
            }
            InTarget::Exp(exp) => vec![self.exp_to_string(exp)?],
        };
        let simple = base
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.');
        let text = if simple {
            let checks: Vec<String> =
                items.iter().map(|item| format!("{} == {}", base, item)).collect();
            format!("({})", checks.join(" or "))
        } else {
            let temp = self.get_unused_name("_val_");
            let checks: Vec<String> =
                items.iter().map(|item| format!("{} == {}", temp, item)).collect();
            format!(
                "(function()\n{}local {} = {}\n{}return {}\n{}end)()",
                self.indent_with(1),
                temp,
                base,
                self.indent_with(1),
                checks.join(" or "),
                self.indent()
            )
        };
        if in_exp.negated {
            Ok(format!("not {}", text))
        } else {
            Ok(text)
        }
    }

    // -- values --------------------------------------------------------------

    pub(crate) fn value_to_string(&mut self, value: &Value) -> Result<String> {
        match value {
            Value::Str(s) => self.string_to_string(s),
            Value::SimpleTable(t) => self.simple_table_to_string(t),
            Value::Chain(chain) => self.chain_to_string(chain),
            Value::Simple(simple) => self.simple_value_to_string(simple, value.span()),
        }
    }

    fn simple_value_to_string(&mut self, simple: &SimpleValue, span: Span) -> Result<String> {
        match simple {
            SimpleValue::Num(num) => Ok(num.text.replace('_', "")),
            SimpleValue::Const(value) => Ok(value.text.clone()),
            SimpleValue::VarArg(span) => {
                self.mark_var_arg_used()
                    .map_err(|err| CompileError::span(err.message, *span))?;
                Ok("...".to_string())
            }
            SimpleValue::FunLit(fun) => self.fun_lit_to_string(fun),
            SimpleValue::TableLit(table) => self.table_lit_to_string(&table.values, table.span),
            SimpleValue::UnaryValue(unary) => {
                let mut prefix = String::new();
                for op in &unary.ops {
                    if op.op == "~" && self.target < LuaTarget::Lua53 {
                        return Err(CompileError::span(
                            "bitwise operator is not available when not targeting Lua version \
                             5.3 or higher",
                            op.span,
                        ));
                    }
                    if op.op == "not" {
                        prefix.push_str("not ");
                    } else {
                        prefix.push_str(&op.op);
                    }
                }
                Ok(format!("{}{}", prefix, self.value_to_string(&unary.value)?))
            }
            _ => {
                // control forms evaluate through an IIFE
                let mut tmp = StrList::new();
                let value = Value::Simple(simple.clone());
                self.closure_wrap(span, |compiler, inner| {
                    let exp = Exp::from_value(value.clone(), span);
                    compiler.transform_exp(&exp, inner, ExpUsage::Return, None)
                }, &mut tmp)?;
                Ok(tmp.pop().unwrap_or_default())
            }
        }
    }

    /// Runs `body` inside a fresh anonymous-function scope and renders the
    /// `(function() ... end)()` wrapper, forwarding `...` when used.
    pub(crate) fn closure_wrap(
        &mut self,
        span: Span,
        body: impl FnOnce(&mut Self, &mut StrList) -> Result<()>,
        out: &mut StrList,
    ) -> Result<()> {
        let pass_var_arg = self.enclosing_has_var_arg();
        self.push_function_scope(pass_var_arg);
        self.scopes.push();
        let mut inner = StrList::new();
        let result = body(self, &mut inner);
        self.scopes.pop();
        let state = self.pop_function_scope();
        result?;
        let used = pass_var_arg && state.used_var;
        let _ = span;
        out.push(format!(
            "{}\n{}{}{}",
            self.anon_func_start(used),
            super::join(&inner),
            self.indent(),
            self.anon_func_end(used)
        ));
        Ok(())
    }

    // -- nil coalescing ------------------------------------------------------

    pub(crate) fn transform_nil_coalesce(
        &mut self,
        exp: &Exp,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        let left = Exp {
            pipe_exprs: exp.pipe_exprs.clone(),
            op_values: exp.op_values.clone(),
            nil_coalesced: None,
            span: exp.span,
        };
        let right = exp.nil_coalesced.as_deref().expect("nil coalesce tail");
        match usage {
            ExpUsage::Closure => {
                let mut tmp = StrList::new();
                self.closure_wrap(exp.span, |compiler, inner| {
                    compiler.transform_nil_coalesce_block(
                        &left,
                        right,
                        inner,
                        ExpUsage::Return,
                        None,
                    )
                }, &mut tmp)?;
                out.push(tmp.pop().unwrap_or_default());
                Ok(())
            }
            ExpUsage::Return => {
                out.push(format!("{}do{}", self.indent(), self.nll(exp.span)));
                self.scopes.push();
                self.transform_nil_coalesce_block(&left, right, out, ExpUsage::Return, None)?;
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(exp.span)));
                Ok(())
            }
            ExpUsage::Assignment => {
                let target = assign_to.expect("assignment usage needs a target");
                let target = target.to_string();
                out.push(format!("{}do{}", self.indent(), self.nll(exp.span)));
                self.scopes.push();
                self.transform_nil_coalesce_block(
                    &left,
                    right,
                    out,
                    ExpUsage::Assignment,
                    Some(&target),
                )?;
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(exp.span)));
                Ok(())
            }
            ExpUsage::Common => {
                out.push(format!("{}do{}", self.indent(), self.nll(exp.span)));
                self.scopes.push();
                let temp = self.get_unused_name("_exp_");
                self.scopes.force_add_to_scope(&temp);
                let left_text = self.exp_to_string(&left)?;
                out.push(format!(
                    "{}local {} = {}{}",
                    self.indent(),
                    temp,
                    left_text,
                    self.nll(exp.span)
                ));
                out.push(format!(
                    "{}if {} == nil then{}",
                    self.indent(),
                    temp,
                    self.nll(exp.span)
                ));
                self.scopes.push();
                let right_text = self.exp_to_string(right)?;
                out.push(format!(
                    "{}{} = {}{}",
                    self.indent(),
                    temp,
                    right_text,
                    self.nll(right.span)
                ));
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(exp.span)));
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(exp.span)));
                Ok(())
            }
        }
    }

    /// The shared `local _exp_0 = a; if _exp_0 ~= nil then ... else ... end`
    /// body of every nil-coalesce lowering.
    fn transform_nil_coalesce_block(
        &mut self,
        left: &Exp,
        right: &Exp,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        let temp = self.get_unused_name("_exp_");
        self.scopes.force_add_to_scope(&temp);
        let left_text = self.exp_to_string(left)?;
        out.push(format!(
            "{}local {} = {}{}",
            self.indent(),
            temp,
            left_text,
            self.nll(left.span)
        ));
        out.push(format!(
            "{}if {} ~= nil then{}",
            self.indent(),
            temp,
            self.nll(left.span)
        ));
        self.scopes.push();
        match usage {
            ExpUsage::Return => out.push(format!(
                "{}return {}{}",
                self.indent(),
                temp,
                self.nll(left.span)
            )),
            ExpUsage::Assignment => out.push(format!(
                "{}{} = {}{}",
                self.indent(),
                assign_to.expect("assignment target"),
                temp,
                self.nll(left.span)
            )),
            _ => {}
        }
        self.scopes.pop();
        out.push(format!("{}else{}", self.indent(), self.nll(right.span)));
        self.scopes.push();
        match usage {
            ExpUsage::Return => self.transform_exp(right, out, ExpUsage::Return, None)?,
            ExpUsage::Assignment => {
                self.transform_exp(right, out, ExpUsage::Assignment, assign_to)?
            }
            _ => {}
        }
        self.scopes.pop();
        out.push(format!("{}end{}", self.indent(), self.nlr(right.span)));
        Ok(())
    }

    // -- strings -------------------------------------------------------------

    pub(crate) fn string_to_string(&mut self, s: &Str) -> Result<String> {
        match s {
            Str::Single(single) => Ok(format!("'{}'", single.text)),
            Str::Lua(lua) => {
                let eqs = "=".repeat(lua.open_eqs);
                Ok(format!("[{}[{}]{}]", eqs, lua.content, eqs))
            }
            Str::Double(double) => {
                if double.segments.is_empty() {
                    return Ok("\"\"".to_string());
                }
                let mut parts = Vec::new();
                for segment in &double.segments {
                    match segment {
                        DoubleStringContent::Inner(text, _) => {
                            parts.push(format!("\"{}\"", text));
                        }
                        DoubleStringContent::Exp(exp) => {
                            let text = self.exp_to_string(exp)?;
                            parts.push(format!("tostring({})", text));
                        }
                    }
                }
                Ok(parts.join(" .. "))
            }
        }
    }

    // -- chains --------------------------------------------------------------

    /// Renders a chain for expression use.
    pub(crate) fn chain_to_string(&mut self, chain: &ChainValue) -> Result<String> {
        let mut tmp = StrList::new();
        self.transform_chain_value(chain, &mut tmp, ExpUsage::Closure, None)?;
        Ok(tmp.pop().unwrap_or_default())
    }

    pub(crate) fn transform_chain_value(
        &mut self,
        chain: &ChainValue,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        if let Some(ChainItem::Callable(Callable::MacroName(name))) = chain.items.first() {
            let name = name.clone();
            return self.transform_macro_chain(&name, chain, out, usage, assign_to);
        }
        if let Some(guard_at) = chain
            .items
            .iter()
            .position(|item| matches!(item, ChainItem::Existential(_)))
        {
            return self.transform_existential_chain(chain, guard_at, out, usage, assign_to);
        }
        if ends_with_bare_colon(&chain.items) {
            return self.transform_colon_closure(chain, out, usage, assign_to);
        }
        let text = self.chain_items_to_string(&chain.items)?;
        match usage {
            ExpUsage::Closure => {
                out.push(text);
                Ok(())
            }
            ExpUsage::Common => {
                out.push(format!("{}{}{}", self.indent(), text, self.nll(chain.span)));
                Ok(())
            }
            ExpUsage::Return => {
                out.push(format!(
                    "{}return {}{}",
                    self.indent(),
                    text,
                    self.nlr(chain.span)
                ));
                Ok(())
            }
            ExpUsage::Assignment => {
                let target = assign_to.expect("assignment usage needs a target");
                out.push(format!(
                    "{}{} = {}{}",
                    self.indent(),
                    target,
                    text,
                    self.nll(chain.span)
                ));
                Ok(())
            }
        }
    }

    /// Splits at the first `?` and guards the tail behind a nil check.
    fn transform_existential_chain(
        &mut self,
        chain: &ChainValue,
        guard_at: usize,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        let prefix_items = &chain.items[..guard_at];
        let rest_items = &chain.items[guard_at + 1..];
        let prefix = ChainValue {
            items: prefix_items.to_vec(),
            span: chain.span,
        };
        if rest_items.is_empty() {
            // `a?` alone is a nil test
            let text = format!("{} ~= nil", self.chain_items_to_string(&prefix.items)?);
            match usage {
                ExpUsage::Closure => out.push(text),
                ExpUsage::Return => out.push(format!(
                    "{}return {}{}",
                    self.indent(),
                    text,
                    self.nlr(chain.span)
                )),
                ExpUsage::Assignment => out.push(format!(
                    "{}{} = {}{}",
                    self.indent(),
                    assign_to.expect("assignment target"),
                    text,
                    self.nll(chain.span)
                )),
                ExpUsage::Common => {
                    return Err(CompileError::span("unexpected expression", chain.span))
                }
            }
            return Ok(());
        }
        match usage {
            ExpUsage::Closure | ExpUsage::Return => {
                let mut tmp = StrList::new();
                let rest = rest_items.to_vec();
                let prefix_clone = prefix.clone();
                let span = chain.span;
                self.closure_wrap(span, move |compiler, inner| {
                    let simple = prefix_clone.items.len() == 1
                        && matches!(
                            prefix_clone.items.first(),
                            Some(ChainItem::Callable(Callable::Variable(v)))
                                if compiler.scopes.is_local(&v.name)
                        );
                    let obj = if simple {
                        compiler.chain_items_to_string(&prefix_clone.items)?
                    } else {
                        compiler.hoist_chain_to_local(&prefix_clone, inner)?
                    };
                    inner.push(format!(
                        "{}if {} ~= nil then{}",
                        compiler.indent(),
                        obj,
                        compiler.nll(span)
                    ));
                    compiler.scopes.push();
                    let mut items = vec![local_var_item(&obj, span)];
                    items.extend(rest.iter().cloned());
                    let rest_chain = ChainValue { items, span };
                    compiler.transform_chain_value(&rest_chain, inner, ExpUsage::Return, None)?;
                    compiler.scopes.pop();
                    inner.push(format!("{}end{}", compiler.indent(), compiler.nlr(span)));
                    Ok(())
                }, &mut tmp)?;
                let text = tmp.pop().unwrap_or_default();
                if usage == ExpUsage::Closure {
                    out.push(text);
                } else {
                    out.push(format!(
                        "{}return {}{}",
                        self.indent(),
                        text,
                        self.nlr(chain.span)
                    ));
                }
                Ok(())
            }
            ExpUsage::Common | ExpUsage::Assignment => {
                let span = chain.span;
                out.push(format!("{}do{}", self.indent(), self.nll(span)));
                self.scopes.push();
                let obj = self.hoist_chain_to_local(&prefix, out)?;
                out.push(format!(
                    "{}if {} ~= nil then{}",
                    self.indent(),
                    obj,
                    self.nll(span)
                ));
                self.scopes.push();
                let mut items = vec![local_var_item(&obj, span)];
                items.extend(rest_items.iter().cloned());
                let rest_chain = ChainValue { items, span };
                self.transform_chain_value(&rest_chain, out, usage, assign_to)?;
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(span)));
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(span)));
                Ok(())
            }
        }
    }

    /// `obj\method` with no invocation forwards its receiver through a
    /// generated closure.
    fn transform_colon_closure(
        &mut self,
        chain: &ChainValue,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        if usage == ExpUsage::Common {
            return Err(CompileError::span(
                "colon chain item must be followed by invoke arguments",
                chain.span,
            ));
        }
        let (prefix_items, colon) = match chain.items.split_last() {
            Some((ChainItem::Colon(colon), prefix)) => (prefix, colon),
            _ => unreachable!("checked by caller"),
        };
        let method = match &colon.name {
            ColonName::Name(name) | ColonName::LuaKeyword(name) => name.text.clone(),
            ColonName::Metamethod(method) => {
                let key = self.metamethod_key_to_string(method)?;
                format!("<{}>", key)
            }
        };
        let span = chain.span;
        let prefix = ChainValue {
            items: prefix_items.to_vec(),
            span,
        };
        let mut tmp = StrList::new();
        self.closure_wrap(span, |compiler, inner| {
            let base = compiler.get_unused_name("_base_");
            compiler.scopes.force_add_to_scope(&base);
            let prefix_text = compiler.chain_items_to_string(&prefix.items)?;
            inner.push(format!(
                "{}local {} = {}{}",
                compiler.indent(),
                base,
                prefix_text,
                compiler.nll(span)
            ));
            let fn_var = compiler.get_unused_name("_fn_");
            compiler.scopes.force_add_to_scope(&fn_var);
            let accessor = if is_lua_keyword(&method) {
                format!("{}[\"{}\"]", base, method)
            } else if let Some(meta) = method.strip_prefix('<') {
                let key = meta.trim_end_matches('>');
                format!("getmetatable({}){}", base, key)
            } else {
                format!("{}.{}", base, method)
            };
            inner.push(format!(
                "{}local {} = {}{}",
                compiler.indent(),
                fn_var,
                accessor,
                compiler.nll(span)
            ));
            inner.push(format!(
                "{}return {} and function(...){}",
                compiler.indent(),
                fn_var,
                compiler.nll(span)
            ));
            inner.push(format!(
                "{}return {}({}, ...){}",
                compiler.indent_with(1),
                fn_var,
                base,
                compiler.nll(span)
            ));
            inner.push(format!("{}end{}", compiler.indent(), compiler.nlr(span)));
            Ok(())
        }, &mut tmp)?;
        let text = tmp.pop().unwrap_or_default();
        match usage {
            ExpUsage::Closure => out.push(text),
            ExpUsage::Return => out.push(format!(
                "{}return {}{}",
                self.indent(),
                text,
                self.nlr(span)
            )),
            ExpUsage::Assignment => out.push(format!(
                "{}{} = {}{}",
                self.indent(),
                assign_to.expect("assignment target"),
                text,
                self.nll(span)
            )),
            ExpUsage::Common => unreachable!(),
        }
        Ok(())
    }

    /// Straight left-to-right chain emission.
    pub(crate) fn chain_items_to_string(&mut self, items: &[ChainItem]) -> Result<String> {
        let mut acc = String::new();
        let mut index = 0usize;
        while index < items.len() {
            let item = &items[index];
            match item {
                ChainItem::Callable(Callable::Variable(v))
                    if index == 0 && v.name == "super" && !self.class_vars.is_empty() =>
                {
                    let class_var = self.class_vars.last().cloned().expect("class var");
                    acc = format!("{}.__parent", class_var);
                    // `super(...)` forwards to the parent constructor,
                    // `super\m args` flattens to a dot call with `self`
                    match items.get(index + 1) {
                        Some(ChainItem::Invoke(invoke)) => {
                            let mut args = vec!["self".to_string()];
                            args.extend(self.invoke_args_to_strings(invoke)?);
                            acc = format!("{}.__init({})", acc, args.join(", "));
                            index += 1;
                        }
                        Some(ChainItem::InvokeArgs(invoke_args)) => {
                            let invoke = invoke_from_invoke_args(invoke_args);
                            let mut args = vec!["self".to_string()];
                            args.extend(self.invoke_args_to_strings(&invoke)?);
                            acc = format!("{}.__init({})", acc, args.join(", "));
                            index += 1;
                        }
                        Some(ChainItem::Colon(colon)) => {
                            let method = match &colon.name {
                                ColonName::Name(name) | ColonName::LuaKeyword(name) => {
                                    name.text.clone()
                                }
                                ColonName::Metamethod(_) => {
                                    return Err(CompileError::span(
                                        "invalid metamethod name",
                                        colon.span,
                                    ))
                                }
                            };
                            let invoke = match items.get(index + 2) {
                                Some(ChainItem::Invoke(invoke)) => invoke.clone(),
                                Some(ChainItem::InvokeArgs(invoke_args)) => {
                                    invoke_from_invoke_args(invoke_args)
                                }
                                _ => {
                                    return Err(CompileError::span(
                                        "colon chain item must be followed by invoke arguments",
                                        colon.span,
                                    ))
                                }
                            };
                            let mut args = vec!["self".to_string()];
                            args.extend(self.invoke_args_to_strings(&invoke)?);
                            let accessor = if is_lua_keyword(&method) {
                                format!("{}[\"{}\"]", acc, method)
                            } else {
                                format!("{}.{}", acc, method)
                            };
                            acc = format!("{}({})", accessor, args.join(", "));
                            index += 2;
                        }
                        _ => {}
                    }
                }
                ChainItem::Callable(callable) => {
                    acc.push_str(&self.callable_to_string(callable)?);
                }
                ChainItem::Str(s) => {
                    if index == 0 {
                        acc = format!("({})", self.string_to_string(s)?);
                    } else {
                        acc = format!("{}({})", acc, self.string_to_string(s)?);
                    }
                }
                ChainItem::Dot(dot) => {
                    if index == 0 {
                        let with_var = self.with_vars.last().cloned().ok_or_else(|| {
                            CompileError::span(
                                "short dot/colon syntax must be called within a with block",
                                dot.span,
                            )
                        })?;
                        acc = with_var;
                    }
                    match &dot.name {
                        DotName::Name(name) => {
                            if is_lua_keyword(&name.text) {
                                acc = format!("{}[\"{}\"]", acc, name.text);
                            } else {
                                acc = format!("{}.{}", acc, name.text);
                            }
                        }
                        DotName::Metatable(_) => {
                            acc = format!("getmetatable({})", acc);
                        }
                        DotName::Metamethod(method) => {
                            let key = self.metamethod_key_to_string(method)?;
                            acc = format!("getmetatable({}){}", acc, key);
                        }
                    }
                }
                ChainItem::Colon(colon) => {
                    if index == 0 && self.with_vars.is_empty() {
                        return Err(CompileError::span(
                            "short dot/colon syntax must be called within a with block",
                            colon.span,
                        ));
                    }
                    if index == 0 {
                        acc = self.with_vars.last().cloned().expect("with var checked");
                    }
                    let invoke = match items.get(index + 1) {
                        Some(ChainItem::Invoke(invoke)) => invoke.clone(),
                        Some(ChainItem::InvokeArgs(args)) => {
                            invoke_from_invoke_args(args)
                        }
                        _ => {
                            return Err(CompileError::span(
                                "colon chain item must be followed by invoke arguments",
                                colon.span,
                            ))
                        }
                    };
                    let args = self.invoke_args_to_strings(&invoke)?;
                    match &colon.name {
                        ColonName::Name(name) if !is_lua_keyword(&name.text) => {
                            acc = format!("{}:{}({})", acc, name.text, args.join(", "));
                        }
                        ColonName::Name(name) | ColonName::LuaKeyword(name) => {
                            // keyword method goes through a hoisted receiver
                            acc = self.keyword_colon_call(&acc, &name.text, &args, colon.span)?;
                        }
                        ColonName::Metamethod(method) => {
                            let key = self.metamethod_key_to_string(method)?;
                            acc = self.metamethod_colon_call(&acc, &key, &args, colon.span)?;
                        }
                    }
                    index += 1;
                }
                ChainItem::Invoke(invoke) => {
                    let args = self.invoke_args_to_strings(invoke)?;
                    acc = format!("{}({})", acc, args.join(", "));
                }
                ChainItem::InvokeArgs(invoke_args) => {
                    let invoke = invoke_from_invoke_args(invoke_args);
                    let args = self.invoke_args_to_strings(&invoke)?;
                    acc = format!("{}({})", acc, args.join(", "));
                }
                ChainItem::Index(exp) => {
                    let key = self.exp_to_string(exp)?;
                    acc = format!("{}[{}]", acc, key);
                }
                ChainItem::Slice(slice) => {
                    return Err(CompileError::span(
                        "slice syntax not supported here",
                        slice.span,
                    ))
                }
                ChainItem::Existential(span) => {
                    return Err(CompileError::span(
                        "existential operator is not supported here",
                        *span,
                    ))
                }
                ChainItem::TableAppending(span) => {
                    return Err(CompileError::span(
                        "left hand expression is not assignable",
                        *span,
                    ))
                }
            }
            index += 1;
        }
        Ok(acc)
    }

    fn keyword_colon_call(
        &mut self,
        receiver: &str,
        method: &str,
        args: &[String],
        span: Span,
    ) -> Result<String> {
        let simple = receiver
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if simple {
            let mut call_args = vec![receiver.to_string()];
            call_args.extend(args.iter().cloned());
            return Ok(format!(
                "{}[\"{}\"]({})",
                receiver,
                method,
                call_args.join(", ")
            ));
        }
        let temp = self.get_unused_name("_obj_");
        let mut call_args = vec![temp.clone()];
        call_args.extend(args.iter().cloned());
        let _ = span;
        Ok(format!(
            "(function()\n{}local {} = {}\n{}return {}[\"{}\"]({})\n{}end)()",
            self.indent_with(1),
            temp,
            receiver,
            self.indent_with(1),
            temp,
            method,
            call_args.join(", "),
            self.indent()
        ))
    }

    fn metamethod_colon_call(
        &mut self,
        receiver: &str,
        key: &str,
        args: &[String],
        span: Span,
    ) -> Result<String> {
        let temp = self.get_unused_name("_obj_");
        let mut call_args = vec![temp.clone()];
        call_args.extend(args.iter().cloned());
        let _ = span;
        Ok(format!(
            "(function()\n{}local {} = {}\n{}return getmetatable({}){}({})\n{}end)()",
            self.indent_with(1),
            temp,
            receiver,
            self.indent_with(1),
            temp,
            key,
            call_args.join(", "),
            self.indent()
        ))
    }

    pub(crate) fn callable_to_string(&mut self, callable: &Callable) -> Result<String> {
        match callable {
            Callable::Variable(v) => {
                if !self.scopes.is_defined(&v.name) && !self.macro_locals.contains(&v.name) {
                    self.record_global(&v.name, v.span);
                }
                Ok(v.name.clone())
            }
            Callable::SelfItem(item) => Ok(match item {
                SelfItem::SelfValue(_) => "self".to_string(),
                SelfItem::SelfName(name) => format!("self.{}", name.text),
                SelfItem::SelfClass(_) => "self.__class".to_string(),
                SelfItem::SelfClassName(name) => format!("self.__class.{}", name.text),
            }),
            Callable::Parens(parens) => {
                let inner = self.exp_to_string(&parens.expr)?;
                Ok(format!("({})", inner))
            }
            Callable::MacroName(name) => Err(CompileError::span(
                "can not resolve macro",
                name.span,
            )),
        }
    }

    pub(crate) fn invoke_args_to_strings(&mut self, invoke: &Invoke) -> Result<Vec<String>> {
        let mut args = Vec::new();
        for arg in &invoke.args {
            match arg {
                InvokeArg::Exp(exp) => args.push(self.exp_to_string(exp)?),
                InvokeArg::Str(s) => args.push(self.string_to_string(s)?),
                InvokeArg::TableLit(t) => {
                    args.push(self.table_lit_to_string(&t.values, t.span)?)
                }
            }
        }
        Ok(args)
    }

    /// `.name` key of a metamethod accessor, validated against the target.
    pub(crate) fn metamethod_key_to_string(&mut self, method: &Metamethod) -> Result<String> {
        match &method.item {
            MetaIndex::Name(name) => {
                self.check_metamethod(&name.text, method.span)?;
                Ok(format!(".__{}", name.text))
            }
            MetaIndex::Exp(exp) => {
                let key = self.exp_to_string(exp)?;
                Ok(format!("[{}]", key))
            }
            MetaIndex::Str(s) => {
                let key = self.string_to_string(s)?;
                Ok(format!("[{}]", key))
            }
        }
    }

    pub(crate) fn check_metamethod(&self, name: &str, span: Span) -> Result<()> {
        if !METAMETHODS.contains(name) {
            return Err(CompileError::span("invalid metamethod name", span));
        }
        match name {
            "close" if self.target < LuaTarget::Lua54 => Err(CompileError::span(
                "metamethod is not supported until Lua 5.4",
                span,
            )),
            "pairs" if self.target < LuaTarget::Lua52 => Err(CompileError::span(
                "metamethod is not supported until Lua 5.2",
                span,
            )),
            "ipairs" if self.target >= LuaTarget::Lua53 => Err(CompileError::span(
                "metamethod is deprecated since Lua 5.3",
                span,
            )),
            "idiv" | "band" | "bor" | "bxor" | "bnot" | "shl" | "shr"
                if self.target < LuaTarget::Lua53 =>
            {
                Err(CompileError::span(
                    "metamethod is not supported until Lua 5.3",
                    span,
                ))
            }
            _ => Ok(()),
        }
    }

    // -- function literals ---------------------------------------------------

    pub(crate) fn fun_lit_to_string(&mut self, fun: &FunLit) -> Result<String> {
        let def_list = fun.args_def.as_ref().and_then(|d| d.def_list.as_ref());
        let has_var_arg = def_list.is_some_and(|d| d.var_arg.is_some());
        self.push_function_scope(has_var_arg);
        self.scopes.push();
        let result = self.fun_lit_body(fun, def_list, has_var_arg);
        self.scopes.pop();
        self.pop_function_scope();
        result
    }

    fn fun_lit_body(
        &mut self,
        fun: &FunLit,
        def_list: Option<&FnArgDefList>,
        has_var_arg: bool,
    ) -> Result<String> {
        let mut arg_names = Vec::new();
        let mut prelude = StrList::new();
        if fun.arrow == FnArrow::Fat {
            arg_names.push("self".to_string());
            self.scopes.force_add_to_scope("self");
        }
        if let Some(defs) = def_list {
            for def in &defs.definitions {
                match &def.name {
                    FnArgName::Variable(v) => {
                        self.scopes.force_add_to_scope(&v.name);
                        arg_names.push(v.name.clone());
                        if def.existential {
                            return Err(CompileError::span(
                                "can only check existence for assigning self field",
                                def.span,
                            ));
                        }
                        if let Some(default) = &def.default {
                            let value = self.exp_to_string(default)?;
                            prelude.push(format!(
                                "{}if {} == nil then{}",
                                self.indent(),
                                v.name,
                                self.nll(def.span)
                            ));
                            prelude.push(format!(
                                "{}{} = {}{}",
                                self.indent_with(1),
                                v.name,
                                value,
                                self.nll(def.span)
                            ));
                            prelude.push(format!(
                                "{}end{}",
                                self.indent(),
                                self.nlr(def.span)
                            ));
                        }
                    }
                    FnArgName::SelfItem(item) => {
                        let field = match item {
                            SelfItem::SelfName(name) => name.text.clone(),
                            _ => {
                                return Err(CompileError::span(
                                    "invald self expression here",
                                    def.span,
                                ))
                            }
                        };
                        if def.default.is_some() && def.existential {
                            return Err(CompileError::span(
                                "argument with default value should not check for existence",
                                def.span,
                            ));
                        }
                        self.scopes.force_add_to_scope(&field);
                        arg_names.push(field.clone());
                        if def.existential {
                            prelude.push(format!(
                                "{}if {} ~= nil then{}",
                                self.indent(),
                                field,
                                self.nll(def.span)
                            ));
                            prelude.push(format!(
                                "{}self.{} = {}{}",
                                self.indent_with(1),
                                field,
                                field,
                                self.nll(def.span)
                            ));
                            prelude.push(format!(
                                "{}end{}",
                                self.indent(),
                                self.nlr(def.span)
                            ));
                        } else {
                            if let Some(default) = &def.default {
                                let value = self.exp_to_string(default)?;
                                prelude.push(format!(
                                    "{}if {} == nil then{}",
                                    self.indent(),
                                    field,
                                    self.nll(def.span)
                                ));
                                prelude.push(format!(
                                    "{}{} = {}{}",
                                    self.indent_with(1),
                                    field,
                                    value,
                                    self.nll(def.span)
                                ));
                                prelude.push(format!(
                                    "{}end{}",
                                    self.indent(),
                                    self.nlr(def.span)
                                ));
                            }
                            prelude.push(format!(
                                "{}self.{} = {}{}",
                                self.indent(),
                                field,
                                field,
                                self.nll(def.span)
                            ));
                        }
                    }
                }
            }
        }
        if has_var_arg {
            arg_names.push("...".to_string());
        }
        // `using` restricts which outer locals stay visible
        if let Some(shadow) = fun.args_def.as_ref().and_then(|d| d.shadow.as_ref()) {
            self.scopes.mark_vars_shadowed();
            if let Some(vars) = &shadow.vars {
                for v in vars {
                    self.scopes.add_to_allow_list(&v.name);
                }
            }
        }
        let mut body_out = StrList::new();
        body_out.extend(prelude);
        if let Some(body) = &fun.body {
            self.transform_block(body.statements(), &mut body_out, ExpUsage::Return, None, false)?;
        }
        self.scopes.pop();
        let text = format!(
            "function({})\n{}{}end",
            arg_names.join(", "),
            super::join(&body_out),
            self.indent()
        );
        // transform_fun_lit pops again in the caller; push a placeholder
        self.scopes.push();
        Ok(text)
    }

    // -- backcalls -----------------------------------------------------------

    /// `(args) <- f x` plus the remaining statements of the enclosing block.
    pub(crate) fn transform_backcall(
        &mut self,
        node: &Backcall,
        rest: &[Statement],
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        let span = node.span;
        let lambda = FunLit {
            args_def: node.args_def.clone(),
            arrow: if node.fat { FnArrow::Fat } else { FnArrow::Slim },
            body: Some(Body::Block(Block {
                statements: rest.to_vec(),
                span,
            })),
            span,
        };
        let lambda_exp = Exp::from_value(
            Value::Simple(SimpleValue::FunLit(Box::new(lambda))),
            span,
        );
        let mut chain = node.value.clone();
        match chain.items.last_mut() {
            Some(ChainItem::Invoke(invoke)) => {
                invoke.args.push(InvokeArg::Exp(lambda_exp));
            }
            Some(ChainItem::InvokeArgs(invoke_args)) => {
                invoke_args.args.push(InvokeArgsItem::Exp(lambda_exp));
            }
            _ => {
                chain.items.push(ChainItem::Invoke(Invoke {
                    args: vec![InvokeArg::Exp(lambda_exp)],
                    span,
                }));
            }
        }
        let usage = if usage == ExpUsage::Closure {
            ExpUsage::Common
        } else {
            usage
        };
        self.transform_chain_value(&chain, out, usage, assign_to)
    }

    // -- macros --------------------------------------------------------------

    pub(crate) fn transform_macro_def(&mut self, def: &MacroDef, out: &mut StrList) -> Result<()> {
        let _ = &out;
        if self.scopes.len() > 1 {
            return Err(CompileError::span(
                "can not define macro outside the root block",
                def.span,
            ));
        }
        let lua_code = self.macro_lit_to_lua(&def.lit)?;
        self.vm
            .register_macro(&def.name, &lua_code, &format!("macro {}", def.name))
            .map_err(|err| {
                if err.0 == "macro feature not supported" {
                    CompileError::span(err.0, def.span)
                } else {
                    CompileError::span(format!("failed to load macro codes\n{}", err.0), def.span)
                }
            })?;
        self.macro_names.push(def.name.clone());
        Ok(())
    }

    pub(crate) fn transform_macro_in_place(
        &mut self,
        node: &MacroInPlace,
        out: &mut StrList,
    ) -> Result<()> {
        let lit = MacroLit {
            args_def: None,
            body: node.body.clone(),
            span: node.span,
        };
        let lua_code = self.macro_lit_to_lua(&lit)?;
        let name = format!("_inplace_{}", self.macro_names.len());
        self.vm
            .register_macro(&name, &lua_code, "macro in-place")
            .map_err(|err| {
                CompileError::span(
                    format!("failed to load macro codes\n{}", err.0),
                    node.span,
                )
            })?;
        let expansion = self
            .vm
            .expand_macro(&name, &[])
            .map_err(|err| CompileError::span(err.0, node.span))?;
        self.splice_macro_expansion(expansion, None, out, ExpUsage::Common, None, node.span)
    }

    /// Compiles a macro body into the Lua text of an anonymous function.
    fn macro_lit_to_lua(&mut self, lit: &MacroLit) -> Result<String> {
        for def in lit.args_def.iter().flat_map(|d| d.definitions.iter()) {
            if matches!(def.name, FnArgName::SelfItem(_)) {
                return Err(CompileError::span(
                    "self name is not supported for macro function argument",
                    def.span,
                ));
            }
        }
        let fun = FunLit {
            args_def: Some(FnArgsDef {
                def_list: lit.args_def.clone(),
                shadow: None,
                span: lit.span,
            }),
            arrow: FnArrow::Slim,
            body: Some(lit.body.clone()),
            span: lit.span,
        };
        // macro bodies compile as standalone functions at the top level
        let saved_offset = self.indent_offset;
        self.indent_offset = -(self.scopes.len() as i32 - 1);
        let result = self.fun_lit_to_string(&fun);
        self.indent_offset = saved_offset;
        result
    }

    fn transform_macro_chain(
        &mut self,
        name: &MacroName,
        chain: &ChainValue,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        let span = chain.span;
        // built-in macros take no arguments and expand to literals
        match name.name.as_str() {
            "LINE" => {
                let text = format!(
                    "{}",
                    span.begin.line as i64 + self.config.line_offset as i64
                );
                return self.splice_macro_text(text, &chain.items[1..], out, usage, assign_to, span);
            }
            "FILE" => {
                let module = self.config.module.clone();
                let text = if module.is_empty() {
                    "\"yuescript\"".to_string()
                } else {
                    format!("\"{}\"", module)
                };
                return self.splice_macro_text(text, &chain.items[1..], out, usage, assign_to, span);
            }
            _ => {}
        }
        let (invoke_args, rest_items) = match chain.items.get(1) {
            Some(ChainItem::Invoke(invoke)) => {
                (self.macro_args_from_invoke(invoke)?, &chain.items[2..])
            }
            Some(ChainItem::InvokeArgs(args)) => {
                (self.macro_args_from_invoke_args(args)?, &chain.items[2..])
            }
            _ => (Vec::new(), &chain.items[1..]),
        };
        if !self.vm.has_macro(&name.name) && !self.macro_names.contains(&name.name) {
            return Err(CompileError::span("can not resolve macro", name.span));
        }
        let expansion = self
            .vm
            .expand_macro(&name.name, &invoke_args)
            .map_err(|err| CompileError::span(err.0, span))?;
        self.splice_macro_expansion(expansion, Some(rest_items), out, usage, assign_to, span)
    }

    /// Raw argument text, preserving long-string content verbatim.
    fn macro_args_from_invoke(&mut self, invoke: &Invoke) -> Result<Vec<String>> {
        let mut args = Vec::new();
        for arg in &invoke.args {
            let span = match arg {
                InvokeArg::Exp(exp) => exp.span,
                InvokeArg::Str(s) => s.span(),
                InvokeArg::TableLit(t) => t.span,
            };
            args.push(self.source_text(span).trim().to_string());
        }
        Ok(args)
    }

    fn macro_args_from_invoke_args(&mut self, invoke: &InvokeArgs) -> Result<Vec<String>> {
        let mut args = Vec::new();
        for arg in &invoke.args {
            let span = match arg {
                InvokeArgsItem::Exp(exp) => exp.span,
                InvokeArgsItem::TableBlock(t) => t.span,
            };
            args.push(self.source_text(span).trim().to_string());
        }
        Ok(args)
    }

    fn splice_macro_expansion(
        &mut self,
        expansion: MacroExpansion,
        rest_items: Option<&[ChainItem]>,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
        span: Span,
    ) -> Result<()> {
        match expansion {
            MacroExpansion::Yue(code) => {
                let rest = rest_items.unwrap_or(&[]);
                if usage == ExpUsage::Common && rest.is_empty() {
                    match self.to_ast_block(&code, span) {
                        Ok(block) => {
                            return self.transform_block(
                                &block.statements,
                                out,
                                ExpUsage::Common,
                                None,
                                false,
                            )
                        }
                        Err(_) => {
                            let exp = self.to_ast_exp(&code, span).map_err(|err| {
                                CompileError::span(
                                    format!("failed to expand macro: {}", err.message),
                                    span,
                                )
                            })?;
                            return self.transform_exp(&exp, out, ExpUsage::Common, None);
                        }
                    }
                }
                let exp = self.to_ast_exp(&code, span).map_err(|err| {
                    CompileError::span(
                        format!("failed to expand macro: {}", err.message),
                        span,
                    )
                })?;
                let text = self.exp_to_string(&exp)?;
                // parenthesize only when a chain continues past the macro
                let text = if rest.is_empty() {
                    text
                } else {
                    format!("({})", text)
                };
                self.splice_macro_text(text, rest, out, usage, assign_to, span)
            }
            MacroExpansion::Raw { code, kind, locals } => {
                for name in &locals {
                    self.scopes.add_to_scope(name);
                    self.macro_locals.push(name.clone());
                }
                match kind {
                    MacroCodeType::Lua => {
                        if usage != ExpUsage::Common {
                            return Err(CompileError::span(
                                "macro returning Lua code can only be placed in statement \
                                 position",
                                span,
                            ));
                        }
                        for line in code.lines() {
                            out.push(format!("{}{}\n", self.indent(), line));
                        }
                        Ok(())
                    }
                    MacroCodeType::Text => {
                        match usage {
                            ExpUsage::Common => {
                                out.push(format!("{}{}\n", self.indent(), code))
                            }
                            ExpUsage::Closure => out.push(code),
                            ExpUsage::Return => out.push(format!(
                                "{}return {}{}",
                                self.indent(),
                                code,
                                self.nlr(span)
                            )),
                            ExpUsage::Assignment => out.push(format!(
                                "{}{} = {}{}",
                                self.indent(),
                                assign_to.expect("assignment target"),
                                code,
                                self.nll(span)
                            )),
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    /// Emits an already-rendered macro value with any trailing chain items.
    fn splice_macro_text(
        &mut self,
        text: String,
        rest_items: &[ChainItem],
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
        span: Span,
    ) -> Result<()> {
        let full = if rest_items.is_empty() {
            text
        } else {
            let mut items = vec![local_var_item(&text, span)];
            items.extend(rest_items.iter().cloned());
            self.chain_items_to_string(&items)?
        };
        match usage {
            ExpUsage::Closure => out.push(full),
            ExpUsage::Common => out.push(format!("{}{}{}", self.indent(), full, self.nll(span))),
            ExpUsage::Return => out.push(format!(
                "{}return {}{}",
                self.indent(),
                full,
                self.nlr(span)
            )),
            ExpUsage::Assignment => out.push(format!(
                "{}{} = {}{}",
                self.indent(),
                assign_to.expect("assignment target"),
                full,
                self.nll(span)
            )),
        }
        Ok(())
    }
}

/// A chain item standing for an already-rendered receiver.
pub(crate) fn local_var_item(name: &str, span: Span) -> ChainItem {
    ChainItem::Callable(Callable::Variable(Variable {
        name: name.to_string(),
        span,
    }))
}

fn ends_with_bare_colon(items: &[ChainItem]) -> bool {
    matches!(items.last(), Some(ChainItem::Colon(_)))
}

fn single_chain_from_unary(unary: &UnaryExp) -> Option<&ChainValue> {
    if unary.expos.len() != 1 {
        return None;
    }
    match &unary.expos[0] {
        Value::Chain(chain) => Some(chain),
        _ => None,
    }
}

/// Replaces the `_` placeholder in the stage's call (or prepends/wraps the
/// piped value) for one `|>` step.
fn substitute_pipe_arg(chain: &mut ChainValue, arg: Exp, span: Span) -> Result<()> {
    let is_placeholder = |exp: &Exp| exp.single_variable() == Some("_");
    match chain.items.last_mut() {
        Some(ChainItem::Invoke(invoke)) => {
            let mut slot = None;
            let mut count = 0usize;
            for (index, item) in invoke.args.iter().enumerate() {
                if let InvokeArg::Exp(exp) = item {
                    if is_placeholder(exp) {
                        count += 1;
                        slot = Some(index);
                    }
                }
            }
            if count > 1 {
                return Err(CompileError::span(
                    "pipe placeholder can be used only in one place",
                    span,
                ));
            }
            match slot {
                Some(index) => invoke.args[index] = InvokeArg::Exp(arg),
                None => invoke.args.insert(0, InvokeArg::Exp(arg)),
            }
        }
        Some(ChainItem::InvokeArgs(invoke)) => {
            let mut slot = None;
            let mut count = 0usize;
            for (index, item) in invoke.args.iter().enumerate() {
                if let InvokeArgsItem::Exp(exp) = item {
                    if is_placeholder(exp) {
                        count += 1;
                        slot = Some(index);
                    }
                }
            }
            if count > 1 {
                return Err(CompileError::span(
                    "pipe placeholder can be used only in one place",
                    span,
                ));
            }
            match slot {
                Some(index) => invoke.args[index] = InvokeArgsItem::Exp(arg),
                None => invoke.args.insert(0, InvokeArgsItem::Exp(arg)),
            }
        }
        _ => {
            chain.items.push(ChainItem::Invoke(Invoke {
                args: vec![InvokeArg::Exp(arg)],
                span,
            }));
        }
    }
    Ok(())
}

/// Reshapes paren-free invoke arguments into a parenthesized call.
pub(crate) fn invoke_from_invoke_args(args: &InvokeArgs) -> Invoke {
    let mut list = Vec::new();
    for item in &args.args {
        match item {
            InvokeArgsItem::Exp(exp) => list.push(InvokeArg::Exp(exp.clone())),
            InvokeArgsItem::TableBlock(block) => {
                list.push(InvokeArg::TableLit(TableLit {
                    values: block.values.clone(),
                    span: block.span,
                }));
            }
        }
    }
    Invoke {
        args: list,
        span: args.span,
    }
}
