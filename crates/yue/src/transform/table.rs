// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Table lowering: literals with metamethod aggregation, the spread path,
//! list/table comprehensions, destructuring assignment, and the `import`
//! forms (which are destructures over `require`).

use super::{is_lua_keyword, Compiler, ExpUsage, StrList};
use crate::ast::*;
use crate::error::{CompileError, Result};

/// One flattened destructuring binding.
pub(crate) struct DestructItem {
    /// Target variable (or rendered chain target).
    pub name: String,
    /// Rendered right-hand accessor, e.g. `_obj_0[1]` or `_obj_0.key`.
    pub accessor: String,
    /// Rendered default value.
    pub default: Option<String>,
    /// Whether `name` is a plain variable that may need declaring.
    pub plain: bool,
}

impl<'a> Compiler<'a> {
    // -- literals ------------------------------------------------------------

    pub(crate) fn simple_table_to_string(&mut self, table: &SimpleTable) -> Result<String> {
        self.table_lit_to_string(&table.pairs, table.span)
    }

    pub(crate) fn table_block_to_string(&mut self, block: &TableBlock) -> Result<String> {
        self.table_lit_to_string(&block.values, block.span)
    }

    /// Renders a table literal. Metamethod pairs aggregate into a wrapping
    /// `setmetatable`, spread entries switch to the accumulation path.
    pub(crate) fn table_lit_to_string(
        &mut self,
        values: &[TableEntry],
        span: Span,
    ) -> Result<String> {
        if values
            .iter()
            .any(|value| matches!(value, TableEntry::SpreadExp(..) | TableEntry::SpreadListExp(..)))
        {
            let mut tmp = StrList::new();
            self.transform_spread_table(values, &mut tmp, ExpUsage::Closure, None, span)?;
            return Ok(tmp.pop().unwrap_or_default());
        }
        let mut plain_entries = Vec::new();
        let mut meta_entries = Vec::new();
        let mut metatable_value = None;
        for value in values {
            match value {
                TableEntry::MetaVariablePair(pair) => {
                    if !self.scopes.is_defined(&pair.name.name) {
                        self.record_global(&pair.name.name, pair.span);
                    }
                    meta_entries.push(format!("__{} = {}", pair.name.name, pair.name.name));
                }
                TableEntry::MetaNormalPair(pair) => {
                    let rendered = self.pair_value_to_string(&pair.value)?;
                    match &pair.key {
                        None => metatable_value = Some(rendered),
                        Some(MetaIndex::Name(name)) => {
                            self.check_metamethod(&name.text, pair.span)?;
                            meta_entries.push(format!("__{} = {}", name.text, rendered));
                        }
                        Some(MetaIndex::Exp(exp)) => {
                            let key = self.exp_to_string(exp)?;
                            meta_entries.push(format!("[{}] = {}", key, rendered));
                        }
                        Some(MetaIndex::Str(s)) => {
                            let key = self.string_to_string(s)?;
                            meta_entries.push(format!("[{}] = {}", key, rendered));
                        }
                    }
                }
                other => plain_entries.push(self.table_entry_to_string(other)?),
            }
        }
        let base = if plain_entries.is_empty() {
            "{ }".to_string()
        } else {
            let inner: Vec<String> = plain_entries
                .iter()
                .map(|entry| format!("{}{}", self.indent_with(1), entry))
                .collect();
            format!("{{\n{}\n{}}}", inner.join(",\n"), self.indent())
        };
        let _ = span;
        if let Some(metatable) = metatable_value {
            if !meta_entries.is_empty() {
                return Err(CompileError::span(
                    "metatable should be defined before metamethod",
                    span,
                ));
            }
            return Ok(format!("setmetatable({}, {})", base, metatable));
        }
        if meta_entries.is_empty() {
            Ok(base)
        } else {
            let inner: Vec<String> = meta_entries
                .iter()
                .map(|entry| format!("{}{}", self.indent_with(1), entry))
                .collect();
            Ok(format!(
                "setmetatable({}, {{\n{}\n{}}})",
                base,
                inner.join(",\n"),
                self.indent()
            ))
        }
    }

    fn pair_value_to_string(&mut self, value: &PairValue) -> Result<String> {
        match value {
            PairValue::Exp(exp) => self.exp_to_string(exp),
            PairValue::TableBlock(block) => self.table_block_to_string(block),
        }
    }

    fn table_entry_to_string(&mut self, entry: &TableEntry) -> Result<String> {
        match entry {
            TableEntry::VariablePair(pair) => {
                if !self.scopes.is_defined(&pair.name.name) {
                    self.record_global(&pair.name.name, pair.span);
                }
                Ok(format!("{} = {}", pair.name.name, pair.name.name))
            }
            TableEntry::NormalPair(pair) => {
                let value = self.pair_value_to_string(&pair.value)?;
                let key = match &pair.key {
                    PairKey::KeyName(KeyName::Name(name)) => {
                        if is_lua_keyword(&name.text) {
                            format!("[\"{}\"]", name.text)
                        } else {
                            name.text.clone()
                        }
                    }
                    PairKey::KeyName(KeyName::SelfItem(item)) => {
                        return Err(CompileError::span(
                            "unsupported key for table literal",
                            item.span(),
                        ))
                    }
                    PairKey::Exp(exp) => format!("[{}]", self.exp_to_string(exp)?),
                    PairKey::Str(s) => format!("[{}]", self.string_to_string(s)?),
                };
                Ok(format!("{} = {}", key, value))
            }
            TableEntry::NormalDef(exp, None) => self.exp_to_string(exp),
            TableEntry::NormalDef(_, Some(default)) => Err(CompileError::span(
                "default value is not supported here",
                default.span,
            )),
            TableEntry::VariablePairDef(_, Some(default))
            | TableEntry::NormalPairDef(_, Some(default))
            | TableEntry::MetaVariablePairDef(_, Some(default))
            | TableEntry::MetaNormalPairDef(_, Some(default)) => Err(CompileError::span(
                "default value is not supported here",
                default.span,
            )),
            TableEntry::VariablePairDef(pair, None) => {
                self.table_entry_to_string(&TableEntry::VariablePair(pair.clone()))
            }
            TableEntry::NormalPairDef(pair, None) => {
                self.table_entry_to_string(&TableEntry::NormalPair(pair.clone()))
            }
            TableEntry::MetaVariablePairDef(pair, None) => {
                self.table_entry_to_string(&TableEntry::MetaVariablePair(pair.clone()))
            }
            TableEntry::MetaNormalPairDef(pair, None) => {
                self.table_entry_to_string(&TableEntry::MetaNormalPair(pair.clone()))
            }
            TableEntry::TableBlockIndent(block) => {
                self.table_lit_to_string(&block.values, block.span)
            }
            TableEntry::TableBlock(block) => self.table_block_to_string(block),
            TableEntry::MetaVariablePair(_) | TableEntry::MetaNormalPair(_) => {
                unreachable!("meta pairs are aggregated by the caller")
            }
            TableEntry::SpreadExp(..) | TableEntry::SpreadListExp(..) => {
                unreachable!("spread entries take the accumulation path")
            }
        }
    }

    // -- spread --------------------------------------------------------------

    /// `{a, ...t, k: v}` accumulation into a `_tab_N` temp.
    pub(crate) fn transform_spread_table(
        &mut self,
        values: &[TableEntry],
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
        span: Span,
    ) -> Result<()> {
        match usage {
            ExpUsage::Closure => {
                let values = values.to_vec();
                let mut tmp = StrList::new();
                self.closure_wrap(span, move |compiler, inner| {
                    compiler.transform_spread_table(
                        &values,
                        inner,
                        ExpUsage::Return,
                        None,
                        span,
                    )
                }, &mut tmp)?;
                out.push(tmp.pop().unwrap_or_default());
                return Ok(());
            }
            ExpUsage::Assignment | ExpUsage::Common => {
                out.push(format!("{}do{}", self.indent(), self.nll(span)));
                self.scopes.push();
            }
            ExpUsage::Return => {}
        }
        let tab_var = self.get_unused_name("_tab_");
        self.scopes.force_add_to_scope(&tab_var);
        // leading non-spread entries seed the table literal
        let first_spread = values
            .iter()
            .position(|v| matches!(v, TableEntry::SpreadExp(..) | TableEntry::SpreadListExp(..)))
            .expect("spread path requires a spread entry");
        let seed = self.table_lit_to_string(&values[..first_spread], span)?;
        out.push(format!(
            "{}local {} = {}{}",
            self.indent(),
            tab_var,
            seed,
            self.nll(span)
        ));
        for entry in &values[first_spread..] {
            match entry {
                TableEntry::SpreadExp(exp, span) | TableEntry::SpreadListExp(exp, span) => {
                    let span = *span;
                    let obj = match exp.single_variable() {
                        Some(name) if self.scopes.is_local(name) => name.to_string(),
                        _ => {
                            let rendered = self.exp_to_string(exp)?;
                            let temp = self.get_unused_name("_obj_");
                            self.scopes.force_add_to_scope(&temp);
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
                    let idx = self.get_unused_name("_idx_");
                    self.scopes.force_add_to_scope(&idx);
                    let key = self.get_unused_name("_key_");
                    let value = self.get_unused_name("_value_");
                    out.push(format!(
                        "{}local {} = 1{}",
                        self.indent(),
                        idx,
                        self.nll(span)
                    ));
                    out.push(format!(
                        "{}for {}, {} in pairs({}) do{}",
                        self.indent(),
                        key,
                        value,
                        obj,
                        self.nll(span)
                    ));
                    self.scopes.push();
                    self.scopes.force_add_to_scope(&key);
                    self.scopes.force_add_to_scope(&value);
                    out.push(format!(
                        "{}if {} == {} then{}",
                        self.indent(),
                        idx,
                        key,
                        self.nll(span)
                    ));
                    out.push(format!(
                        "{}{}[#{} + 1] = {}{}",
                        self.indent_with(1),
                        tab_var,
                        tab_var,
                        value,
                        self.nll(span)
                    ));
                    out.push(format!(
                        "{}{} = {} + 1{}",
                        self.indent_with(1),
                        idx,
                        idx,
                        self.nll(span)
                    ));
                    out.push(format!("{}else{}", self.indent(), self.nll(span)));
                    out.push(format!(
                        "{}{}[{}] = {}{}",
                        self.indent_with(1),
                        tab_var,
                        key,
                        value,
                        self.nll(span)
                    ));
                    out.push(format!("{}end{}", self.indent(), self.nlr(span)));
                    self.scopes.pop();
                    out.push(format!("{}end{}", self.indent(), self.nlr(span)));
                }
                TableEntry::NormalDef(exp, None) => {
                    // a trailing `...` spreads the varargs
                    if matches!(
                        exp.single_value(),
                        Some(Value::Simple(SimpleValue::VarArg(_)))
                    ) {
                        self.mark_var_arg_used().map_err(|err| {
                            CompileError::span(err.message, exp.span)
                        })?;
                        let i = self.get_unused_name("_i_");
                        out.push(format!(
                            "{}for {} = 1, select('#', ...) do{}",
                            self.indent(),
                            i,
                            self.nll(exp.span)
                        ));
                        out.push(format!(
                            "{}{}[#{} + 1] = select({}, ...){}",
                            self.indent_with(1),
                            tab_var,
                            tab_var,
                            i,
                            self.nll(exp.span)
                        ));
                        out.push(format!("{}end{}", self.indent(), self.nlr(exp.span)));
                    } else {
                        let rendered = self.exp_to_string(exp)?;
                        out.push(format!(
                            "{}{}[#{} + 1] = {}{}",
                            self.indent(),
                            tab_var,
                            tab_var,
                            rendered,
                            self.nll(exp.span)
                        ));
                    }
                }
                TableEntry::VariablePair(pair) => {
                    if !self.scopes.is_defined(&pair.name.name) {
                        self.record_global(&pair.name.name, pair.span);
                    }
                    out.push(format!(
                        "{}{}.{} = {}{}",
                        self.indent(),
                        tab_var,
                        pair.name.name,
                        pair.name.name,
                        self.nll(pair.span)
                    ));
                }
                TableEntry::NormalPair(pair) => {
                    let value = self.pair_value_to_string(&pair.value)?;
                    let key = match &pair.key {
                        PairKey::KeyName(KeyName::Name(name)) => {
                            if is_lua_keyword(&name.text) {
                                format!("[\"{}\"]", name.text)
                            } else {
                                format!(".{}", name.text)
                            }
                        }
                        PairKey::Exp(exp) => format!("[{}]", self.exp_to_string(exp)?),
                        PairKey::Str(s) => format!("[{}]", self.string_to_string(s)?),
                        PairKey::KeyName(KeyName::SelfItem(item)) => {
                            return Err(CompileError::span(
                                "unsupported key for table literal",
                                item.span(),
                            ))
                        }
                    };
                    out.push(format!(
                        "{}{}{} = {}{}",
                        self.indent(),
                        tab_var,
                        key,
                        value,
                        self.nll(pair.span)
                    ));
                }
                TableEntry::MetaVariablePair(pair) | TableEntry::MetaVariablePairDef(pair, _) => {
                    return Err(CompileError::span(
                        "metamethod pair is not supported after a spread entry",
                        pair.span,
                    ));
                }
                TableEntry::MetaNormalPair(pair) | TableEntry::MetaNormalPairDef(pair, _) => {
                    return Err(CompileError::span(
                        "metamethod pair is not supported after a spread entry",
                        pair.span,
                    ));
                }
                other => {
                    return Err(CompileError::span(
                        "default value is not supported here",
                        other.span(),
                    ))
                }
            }
        }
        match usage {
            ExpUsage::Return => {
                out.push(format!(
                    "{}return {}{}",
                    self.indent(),
                    tab_var,
                    self.nlr(span)
                ));
            }
            ExpUsage::Assignment => {
                out.push(format!(
                    "{}{} = {}{}",
                    self.indent(),
                    assign_to.expect("assignment target"),
                    tab_var,
                    self.nll(span)
                ));
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(span)));
            }
            ExpUsage::Common => {
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(span)));
            }
            ExpUsage::Closure => unreachable!("handled above"),
        }
        Ok(())
    }

    // -- comprehensions ------------------------------------------------------

    pub(crate) fn transform_comprehension(
        &mut self,
        node: &Comprehension,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        let span = node.span;
        let inner = match &node.for_loop {
            Some(inner) => inner.clone(),
            None => {
                // plain `[ ]` list literal
                let entries: Vec<TableEntry> = node
                    .items
                    .iter()
                    .map(|item| match item {
                        CompItem::Value(exp, def) => {
                            TableEntry::NormalDef(exp.clone(), def.clone())
                        }
                        CompItem::Spread(exp) => TableEntry::SpreadListExp(exp.clone(), exp.span),
                    })
                    .collect();
                let text = self.table_lit_to_string(&entries, span)?;
                return self.emit_value_with_usage(text, out, usage, assign_to, span);
            }
        };
        let item = match node.items.first() {
            Some(CompItem::Value(exp, None)) => exp.clone(),
            Some(CompItem::Spread(exp)) => exp.clone(),
            _ => {
                return Err(CompileError::span(
                    "expect a value in list comprehension",
                    span,
                ))
            }
        };
        let is_spread = matches!(node.items.first(), Some(CompItem::Spread(_)));
        match usage {
            ExpUsage::Closure => {
                let mut tmp = StrList::new();
                let node = node.clone();
                self.closure_wrap(span, move |compiler, inner| {
                    compiler.transform_comprehension(&node, inner, ExpUsage::Return, None)
                }, &mut tmp)?;
                out.push(tmp.pop().unwrap_or_default());
                Ok(())
            }
            ExpUsage::Common => {
                // evaluated for side effects only
                let clauses = inner.clauses.clone();
                self.transform_comp_clauses(&clauses, out, &mut |compiler, out| {
                    let exp = item.clone();
                    compiler.transform_exp(&exp, out, ExpUsage::Common, None)
                })
            }
            ExpUsage::Return | ExpUsage::Assignment => {
                let wrap_do = usage == ExpUsage::Assignment;
                if wrap_do {
                    out.push(format!("{}do{}", self.indent(), self.nll(span)));
                    self.scopes.push();
                }
                let accum = self.get_unused_name("_accum_");
                self.scopes.force_add_to_scope(&accum);
                let len = self.get_unused_name("_len_");
                self.scopes.force_add_to_scope(&len);
                out.push(format!(
                    "{}local {} = {{ }}{}",
                    self.indent(),
                    accum,
                    self.nll(span)
                ));
                out.push(format!(
                    "{}local {} = 1{}",
                    self.indent(),
                    len,
                    self.nll(span)
                ));
                let clauses = inner.clauses.clone();
                let accum_name = accum.clone();
                let len_name = len.clone();
                self.transform_comp_clauses(&clauses, out, &mut |compiler, out| {
                    if is_spread {
                        // flatten the produced list
                        let rendered = compiler.exp_to_string(&item)?;
                        let each = compiler.get_unused_name("_each_");
                        let idx = compiler.get_unused_name("_sidx_");
                        out.push(format!(
                            "{}local {} = {}{}",
                            compiler.indent(),
                            each,
                            rendered,
                            compiler.nll(span)
                        ));
                        out.push(format!(
                            "{}for {} = 1, #{} do{}",
                            compiler.indent(),
                            idx,
                            each,
                            compiler.nll(span)
                        ));
                        out.push(format!(
                            "{}{}[{}] = {}[{}]{}",
                            compiler.indent_with(1),
                            accum_name,
                            len_name,
                            each,
                            idx,
                            compiler.nll(span)
                        ));
                        out.push(format!(
                            "{}{} = {} + 1{}",
                            compiler.indent_with(1),
                            len_name,
                            len_name,
                            compiler.nll(span)
                        ));
                        out.push(format!(
                            "{}end{}",
                            compiler.indent(),
                            compiler.nlr(span)
                        ));
                        Ok(())
                    } else {
                        let rendered = compiler.exp_to_string(&item)?;
                        out.push(format!(
                            "{}{}[{}] = {}{}",
                            compiler.indent(),
                            accum_name,
                            len_name,
                            rendered,
                            compiler.nll(span)
                        ));
                        out.push(format!(
                            "{}{} = {} + 1{}",
                            compiler.indent(),
                            len_name,
                            len_name,
                            compiler.nll(span)
                        ));
                        Ok(())
                    }
                })?;
                match usage {
                    ExpUsage::Return => {
                        out.push(format!(
                            "{}return {}{}",
                            self.indent(),
                            accum,
                            self.nlr(span)
                        ));
                    }
                    ExpUsage::Assignment => {
                        out.push(format!(
                            "{}{} = {}{}",
                            self.indent(),
                            assign_to.expect("assignment target"),
                            accum,
                            self.nll(span)
                        ));
                    }
                    _ => unreachable!(),
                }
                if wrap_do {
                    self.scopes.pop();
                    out.push(format!("{}end{}", self.indent(), self.nlr(span)));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn transform_tbl_comprehension(
        &mut self,
        node: &TblComprehension,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        let span = node.span;
        match usage {
            ExpUsage::Closure => {
                let mut tmp = StrList::new();
                let node = node.clone();
                self.closure_wrap(span, move |compiler, inner| {
                    compiler.transform_tbl_comprehension(&node, inner, ExpUsage::Return, None)
                }, &mut tmp)?;
                out.push(tmp.pop().unwrap_or_default());
                Ok(())
            }
            ExpUsage::Common => {
                let clauses = node.for_loop.clauses.clone();
                let key = node.key.clone();
                self.transform_comp_clauses(&clauses, out, &mut |compiler, out| {
                    compiler.transform_exp(&key, out, ExpUsage::Common, None)
                })
            }
            ExpUsage::Return | ExpUsage::Assignment => {
                let wrap_do = usage == ExpUsage::Assignment;
                if wrap_do {
                    out.push(format!("{}do{}", self.indent(), self.nll(span)));
                    self.scopes.push();
                }
                let tbl = self.get_unused_name("_tbl_");
                self.scopes.force_add_to_scope(&tbl);
                out.push(format!(
                    "{}local {} = {{ }}{}",
                    self.indent(),
                    tbl,
                    self.nll(span)
                ));
                let clauses = node.for_loop.clauses.clone();
                let key = node.key.clone();
                let value = node.value.clone();
                let tbl_name = tbl.clone();
                self.transform_comp_clauses(&clauses, out, &mut |compiler, out| {
                    let key_text = compiler.exp_to_string(&key)?;
                    match &value {
                        Some(value) => {
                            let value_text = compiler.exp_to_string(value)?;
                            out.push(format!(
                                "{}{}[{}] = {}{}",
                                compiler.indent(),
                                tbl_name,
                                key_text,
                                value_text,
                                compiler.nll(span)
                            ));
                        }
                        None => {
                            // single-exp form indexes pairs of the produced
                            // tuple-like value
                            out.push(format!(
                                "{}{}[#{} + 1] = {}{}",
                                compiler.indent(),
                                tbl_name,
                                tbl_name,
                                key_text,
                                compiler.nll(span)
                            ));
                        }
                    }
                    Ok(())
                })?;
                match usage {
                    ExpUsage::Return => out.push(format!(
                        "{}return {}{}",
                        self.indent(),
                        tbl,
                        self.nlr(span)
                    )),
                    ExpUsage::Assignment => out.push(format!(
                        "{}{} = {}{}",
                        self.indent(),
                        assign_to.expect("assignment target"),
                        tbl,
                        self.nll(span)
                    )),
                    _ => unreachable!(),
                }
                if wrap_do {
                    self.scopes.pop();
                    out.push(format!("{}end{}", self.indent(), self.nlr(span)));
                }
                Ok(())
            }
        }
    }

    fn emit_value_with_usage(
        &mut self,
        text: String,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
        span: Span,
    ) -> Result<()> {
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
                    self.nlr(span)
                ));
                Ok(())
            }
            ExpUsage::Assignment => {
                out.push(format!(
                    "{}{} = {}{}",
                    self.indent(),
                    assign_to.expect("assignment target"),
                    text,
                    self.nll(span)
                ));
                Ok(())
            }
            ExpUsage::Common => Err(CompileError::span("unexpected expression", span)),
        }
    }

    // -- destructuring -------------------------------------------------------

    pub(crate) fn exp_is_pattern(&self, exp: &Exp) -> bool {
        matches!(
            exp.single_value(),
            Some(Value::SimpleTable(_))
                | Some(Value::Simple(SimpleValue::TableLit(_)))
                | Some(Value::Simple(SimpleValue::Comprehension(_)))
        )
    }

    /// The plain variable names a pattern binds.
    pub(crate) fn pattern_target_names(&mut self, pattern: &Exp) -> Result<Vec<String>> {
        let items = self.destructure_pattern_items(
            pattern.single_value().expect("pattern is a value"),
            "_",
        )?;
        Ok(items
            .into_iter()
            .filter(|item| item.plain)
            .map(|item| item.name)
            .collect())
    }

    /// Flattens a pattern into `(target, accessor, default)` triples rooted
    /// at `obj`.
    pub(crate) fn destructure_pattern_items(
        &mut self,
        pattern: &Value,
        obj: &str,
    ) -> Result<Vec<DestructItem>> {
        let entries: Vec<TableEntry> = match pattern {
            Value::SimpleTable(table) => table.pairs.clone(),
            Value::Simple(SimpleValue::TableLit(table)) => table.values.clone(),
            Value::Simple(SimpleValue::Comprehension(list)) => {
                if list.for_loop.is_some() {
                    return Err(CompileError::span("invalid destructure", list.span));
                }
                list.items
                    .iter()
                    .map(|item| match item {
                        CompItem::Value(exp, def) => {
                            Ok(TableEntry::NormalDef(exp.clone(), def.clone()))
                        }
                        CompItem::Spread(exp) => Err(CompileError::span(
                            "can't destructure value",
                            exp.span,
                        )),
                    })
                    .collect::<Result<_>>()?
            }
            other => {
                return Err(CompileError::span(
                    "invalid destructure value",
                    other.span(),
                ))
            }
        };
        let mut items = Vec::new();
        let mut position = 0usize;
        for entry in &entries {
            match entry {
                TableEntry::NormalDef(target, default) => {
                    position += 1;
                    let accessor = format!("{}[{}]", obj, position);
                    self.push_destructure_target(target, accessor, default.as_ref(), &mut items)?;
                }
                TableEntry::VariablePair(pair) | TableEntry::VariablePairDef(pair, None) => {
                    let accessor = self.key_accessor(obj, &pair.name.name);
                    items.push(DestructItem {
                        name: pair.name.name.clone(),
                        accessor,
                        default: None,
                        plain: true,
                    });
                }
                TableEntry::VariablePairDef(pair, Some(default)) => {
                    let accessor = self.key_accessor(obj, &pair.name.name);
                    let default = self.exp_to_string(default)?;
                    items.push(DestructItem {
                        name: pair.name.name.clone(),
                        accessor,
                        default: Some(default),
                        plain: true,
                    });
                }
                TableEntry::NormalPair(pair) | TableEntry::NormalPairDef(pair, None) => {
                    self.push_normal_pair(pair, None, obj, &mut items)?;
                }
                TableEntry::NormalPairDef(pair, Some(default)) => {
                    self.push_normal_pair(pair, Some(default), obj, &mut items)?;
                }
                TableEntry::MetaVariablePair(pair)
                | TableEntry::MetaVariablePairDef(pair, None) => {
                    let accessor = format!("getmetatable({}).__{}", obj, pair.name.name);
                    items.push(DestructItem {
                        name: pair.name.name.clone(),
                        accessor,
                        default: None,
                        plain: true,
                    });
                }
                TableEntry::MetaVariablePairDef(pair, Some(default)) => {
                    let accessor = format!("getmetatable({}).__{}", obj, pair.name.name);
                    let default = self.exp_to_string(default)?;
                    items.push(DestructItem {
                        name: pair.name.name.clone(),
                        accessor,
                        default: Some(default),
                        plain: true,
                    });
                }
                TableEntry::MetaNormalPair(pair) | TableEntry::MetaNormalPairDef(pair, None) => {
                    self.push_meta_normal_pair(pair, None, obj, &mut items)?;
                }
                TableEntry::MetaNormalPairDef(pair, Some(default)) => {
                    self.push_meta_normal_pair(pair, Some(default), obj, &mut items)?;
                }
                other => {
                    return Err(CompileError::span("can't destructure value", other.span()))
                }
            }
        }
        Ok(items)
    }

    fn key_accessor(&self, obj: &str, key: &str) -> String {
        if is_lua_keyword(key) {
            format!("{}[\"{}\"]", obj, key)
        } else {
            format!("{}.{}", obj, key)
        }
    }

    fn push_normal_pair(
        &mut self,
        pair: &NormalPair,
        default: Option<&Exp>,
        obj: &str,
        items: &mut Vec<DestructItem>,
    ) -> Result<()> {
        let accessor = match &pair.key {
            PairKey::KeyName(KeyName::Name(name)) => self.key_accessor(obj, &name.text),
            PairKey::KeyName(KeyName::SelfItem(item)) => {
                return Err(CompileError::span(
                    "unsupported key for destructuring",
                    item.span(),
                ))
            }
            PairKey::Exp(exp) => format!("{}[{}]", obj, self.exp_to_string(exp)?),
            PairKey::Str(s) => format!("{}[{}]", obj, self.string_to_string(s)?),
        };
        match &pair.value {
            PairValue::Exp(target) => {
                self.push_destructure_target(target, accessor, default, items)
            }
            PairValue::TableBlock(block) => {
                if default.is_some() {
                    return Err(CompileError::span(
                        "default value is not supported here",
                        pair.span,
                    ));
                }
                self.push_nested_pattern_entries(&block.values, &accessor, block.span, items)
            }
        }
    }

    fn push_meta_normal_pair(
        &mut self,
        pair: &MetaNormalPair,
        default: Option<&Exp>,
        obj: &str,
        items: &mut Vec<DestructItem>,
    ) -> Result<()> {
        let accessor = match &pair.key {
            None => format!("getmetatable({})", obj),
            Some(MetaIndex::Name(name)) => format!("getmetatable({}).__{}", obj, name.text),
            Some(MetaIndex::Exp(exp)) => {
                format!("getmetatable({})[{}]", obj, self.exp_to_string(exp)?)
            }
            Some(MetaIndex::Str(s)) => {
                format!("getmetatable({})[{}]", obj, self.string_to_string(s)?)
            }
        };
        match &pair.value {
            PairValue::Exp(target) => {
                self.push_destructure_target(target, accessor, default, items)
            }
            PairValue::TableBlock(block) => {
                if default.is_some() {
                    return Err(CompileError::span(
                        "default value is not supported here",
                        pair.span,
                    ));
                }
                self.push_nested_pattern_entries(&block.values, &accessor, block.span, items)
            }
        }
    }

    /// A destructuring target: a variable, an assignable chain, or a nested
    /// pattern.
    fn push_destructure_target(
        &mut self,
        target: &Exp,
        accessor: String,
        default: Option<&Exp>,
        items: &mut Vec<DestructItem>,
    ) -> Result<()> {
        if self.exp_is_pattern(target) {
            if default.is_some() {
                return Err(CompileError::span(
                    "default value is not supported here",
                    target.span,
                ));
            }
            let nested = self.destructure_pattern_items(
                target.single_value().expect("pattern is a value"),
                &accessor,
            )?;
            items.extend(nested);
            return Ok(());
        }
        if let Some(name) = target.single_variable() {
            self.check_const(name, target.span)?;
            let default = match default {
                Some(exp) => Some(self.exp_to_string(exp)?),
                None => None,
            };
            items.push(DestructItem {
                name: name.to_string(),
                accessor,
                default,
                plain: true,
            });
            return Ok(());
        }
        // a chain target like `obj.field`
        let rendered = self.assignment_target_to_string(target)?;
        let default = match default {
            Some(exp) => Some(self.exp_to_string(exp)?),
            None => None,
        };
        items.push(DestructItem {
            name: rendered,
            accessor,
            default,
            plain: false,
        });
        Ok(())
    }

    fn push_nested_pattern_entries(
        &mut self,
        entries: &[TableEntry],
        accessor: &str,
        span: Span,
        items: &mut Vec<DestructItem>,
    ) -> Result<()> {
        let pattern = Value::Simple(SimpleValue::TableLit(TableLit {
            values: entries.to_vec(),
            span,
        }));
        let nested = self.destructure_pattern_items(&pattern, accessor)?;
        items.extend(nested);
        Ok(())
    }

    /// Assignment with at least one pattern target.
    pub(crate) fn transform_destructure_assignment(
        &mut self,
        targets: &[Exp],
        assign: &Assign,
        out: &mut StrList,
    ) -> Result<()> {
        // a `?`-guarded source (`{p} = exp?`) wraps its destructure in a
        // type test; strip the guard before rendering
        let mut values = Vec::new();
        let mut guards = Vec::new();
        for value in &assign.values {
            match value {
                AssignValue::Exp(exp) => {
                    if let Some(Value::Chain(chain)) = exp.single_value() {
                        if matches!(chain.items.last(), Some(ChainItem::Existential(_))) {
                            let prefix = ChainValue {
                                items: chain.items[..chain.items.len() - 1].to_vec(),
                                span: chain.span,
                            };
                            values.push(self.chain_to_string(&prefix)?);
                            guards.push(true);
                            continue;
                        }
                    }
                    values.push(self.exp_to_string(exp)?);
                    guards.push(false);
                }
                other => {
                    let rendered = self.render_assign_values(&Assign {
                        values: vec![other.clone()],
                        span: assign.span,
                    })?;
                    values.extend(rendered);
                    guards.push(false);
                }
            }
        }
        for (index, target) in targets.iter().enumerate() {
            let value = values
                .get(index)
                .cloned()
                .unwrap_or_else(|| "nil".to_string());
            let guarded = guards.get(index).copied().unwrap_or(false);
            if !self.exp_is_pattern(target) {
                // plain target paired with an already-rendered value
                let rendered_target = match target.single_variable() {
                    Some(name) => {
                        self.check_const(name, target.span)?;
                        if self.scopes.add_to_scope(name) {
                            out.push(format!(
                                "{}local {} = {}{}",
                                self.indent(),
                                name,
                                value,
                                self.nll(target.span)
                            ));
                            continue;
                        }
                        name.to_string()
                    }
                    None => self.assignment_target_to_string(target)?,
                };
                out.push(format!(
                    "{}{} = {}{}",
                    self.indent(),
                    rendered_target,
                    value,
                    self.nll(target.span)
                ));
                continue;
            }
            let span = target.span;
            // names get declared outside the scope block
            let names = self.pattern_target_names(target)?;
            let mut fresh = Vec::new();
            for name in &names {
                if self.scopes.add_to_scope(name) {
                    fresh.push(name.clone());
                }
            }
            if !fresh.is_empty() {
                out.push(format!("{}local {}\n", self.indent(), fresh.join(", ")));
            }
            out.push(format!("{}do{}", self.indent(), self.nll(span)));
            self.scopes.push();
            let obj = if values.len() == 1
                && names.iter().all(|n| n != &value)
                && value
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
                && self.scopes.is_local(&value)
            {
                value.clone()
            } else {
                let temp = self.get_unused_name("_obj_");
                self.scopes.force_add_to_scope(&temp);
                out.push(format!(
                    "{}local {} = {}{}",
                    self.indent(),
                    temp,
                    value,
                    self.nll(span)
                ));
                temp
            };
            if guarded {
                out.push(format!(
                    "{}if \"table\" == type({}) or \"userdata\" == type({}) then{}",
                    self.indent(),
                    obj,
                    obj,
                    self.nll(span)
                ));
                self.scopes.push();
            }
            let items = self.destructure_pattern_items(
                target.single_value().expect("pattern is a value"),
                &obj,
            )?;
            if !items.is_empty() {
                let lhs: Vec<String> = items.iter().map(|i| i.name.clone()).collect();
                let rhs: Vec<String> = items.iter().map(|i| i.accessor.clone()).collect();
                out.push(format!(
                    "{}{} = {}{}",
                    self.indent(),
                    lhs.join(", "),
                    rhs.join(", "),
                    self.nll(span)
                ));
                for item in &items {
                    if let Some(default) = &item.default {
                        out.push(format!(
                            "{}if {} == nil then{}",
                            self.indent(),
                            item.name,
                            self.nll(span)
                        ));
                        out.push(format!(
                            "{}{} = {}{}",
                            self.indent_with(1),
                            item.name,
                            default,
                            self.nll(span)
                        ));
                        out.push(format!("{}end{}", self.indent(), self.nlr(span)));
                    }
                }
            } else {
                return Err(CompileError::span("expect items to be destructured", span));
            }
            if guarded {
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(span)));
            }
            self.scopes.pop();
            out.push(format!("{}end{}", self.indent(), self.nlr(span)));
        }
        Ok(())
    }

    // -- import --------------------------------------------------------------

    pub(crate) fn transform_import(&mut self, node: &Import, out: &mut StrList) -> Result<()> {
        match &node.content {
            ImportContent::As { literal, target } => {
                let module_path = literal.parts.join(".");
                let require_text = format!("require(\"{}\")", module_path);
                if !self.scopes.is_defined("require") {
                    self.record_global("require", node.span);
                }
                match target {
                    None => {
                        let name = literal
                            .parts
                            .last()
                            .expect("import literal cannot be empty")
                            .replace('-', "_");
                        self.scopes.force_add_to_scope(&name);
                        out.push(format!(
                            "{}local {} = {}{}",
                            self.indent(),
                            name,
                            require_text,
                            self.nll(node.span)
                        ));
                        Ok(())
                    }
                    Some(ImportTarget::Variable(v)) => {
                        self.scopes.force_add_to_scope(&v.name);
                        out.push(format!(
                            "{}local {} = {}{}",
                            self.indent(),
                            v.name,
                            require_text,
                            self.nll(node.span)
                        ));
                        Ok(())
                    }
                    Some(ImportTarget::AllMacro(span)) => self
                        .vm
                        .import_macros(&module_path, &[], true)
                        .map_err(|err| CompileError::span(err.0, *span)),
                    Some(ImportTarget::TabLit(items)) => {
                        self.transform_import_tab(&module_path, &require_text, items, node.span, out)
                    }
                }
            }
            ImportContent::From { names, source } => {
                let source_text = match source {
                    ImportSource::Literal(literal) => {
                        if !self.scopes.is_defined("require") {
                            self.record_global("require", node.span);
                        }
                        format!("require(\"{}\")", literal.parts.join("."))
                    }
                    ImportSource::Exp(exp) => self.exp_to_string(exp)?,
                };
                let bound: Vec<String> = names
                    .iter()
                    .map(|name| match name {
                        ImportName::Plain(v) | ImportName::Colon(v) => v.name.clone(),
                    })
                    .collect();
                let mut fresh = Vec::new();
                for name in &bound {
                    if self.scopes.add_to_scope(name) {
                        fresh.push(name.clone());
                    }
                }
                if !fresh.is_empty() {
                    out.push(format!("{}local {}\n", self.indent(), fresh.join(", ")));
                }
                out.push(format!("{}do{}", self.indent(), self.nll(node.span)));
                self.scopes.push();
                let obj = self.get_unused_name("_obj_");
                self.scopes.force_add_to_scope(&obj);
                out.push(format!(
                    "{}local {} = {}{}",
                    self.indent(),
                    obj,
                    source_text,
                    self.nll(node.span)
                ));
                for name in names {
                    match name {
                        ImportName::Plain(v) => {
                            out.push(format!(
                                "{}{} = {}.{}{}",
                                self.indent(),
                                v.name,
                                obj,
                                v.name,
                                self.nll(v.span)
                            ));
                        }
                        ImportName::Colon(v) => {
                            out.push(format!(
                                "{}{} = function(...){}",
                                self.indent(),
                                v.name,
                                self.nll(v.span)
                            ));
                            out.push(format!(
                                "{}return {}:{}(...){}",
                                self.indent_with(1),
                                obj,
                                v.name,
                                self.nll(v.span)
                            ));
                            out.push(format!("{}end{}", self.indent(), self.nlr(v.span)));
                        }
                    }
                }
                self.scopes.pop();
                out.push(format!("{}end{}", self.indent(), self.nlr(node.span)));
                Ok(())
            }
        }
    }

    fn transform_import_tab(
        &mut self,
        module_path: &str,
        require_text: &str,
        items: &[ImportTabItem],
        span: Span,
        out: &mut StrList,
    ) -> Result<()> {
        let mut macro_pairs = Vec::new();
        let mut all_macros = false;
        let mut entries: Vec<TableEntry> = Vec::new();
        for item in items {
            match item {
                ImportTabItem::MacroName(name) => {
                    macro_pairs.push((name.name.clone(), name.name.clone()));
                }
                ImportTabItem::MacroNamePair(from, to) => {
                    macro_pairs.push((from.name.clone(), to.name.clone()));
                }
                ImportTabItem::AllMacro(_) => all_macros = true,
                ImportTabItem::VariablePair(pair) => {
                    entries.push(TableEntry::VariablePair(pair.clone()));
                }
                ImportTabItem::NormalPair(pair) => {
                    entries.push(TableEntry::NormalPair(pair.clone()));
                }
                ImportTabItem::MetaVariablePair(pair) => {
                    entries.push(TableEntry::MetaVariablePair(pair.clone()));
                }
                ImportTabItem::MetaNormalPair(pair) => {
                    entries.push(TableEntry::MetaNormalPair(pair.clone()));
                }
                ImportTabItem::Exp(exp) => entries.push(TableEntry::NormalDef(exp.clone(), None)),
            }
        }
        if all_macros || !macro_pairs.is_empty() {
            self.vm
                .import_macros(module_path, &macro_pairs, all_macros)
                .map_err(|err| CompileError::span(err.0, span))?;
        }
        if entries.is_empty() {
            return Ok(());
        }
        let pattern = Exp::pattern_from_table_lit(TableLit {
            values: entries,
            span,
        });
        let assign = Assign {
            values: vec![AssignValue::Exp(self.to_ast_exp(require_text, span)?)],
            span,
        };
        self.transform_destructure_assignment(std::slice::from_ref(&pattern), &assign, out)
    }
}
