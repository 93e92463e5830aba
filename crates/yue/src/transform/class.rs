// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! `class` declaration lowering: the `_class_N`/`_base_N` pair, constructor
//! plumbing through `__init`/`__call`, parent lookup through the class
//! metatable, mixin copying, and the `__inherited` hook.

use super::{is_lua_keyword, Compiler, ExpUsage, StrList};
use crate::ast::*;
use crate::error::{CompileError, Result};

/// Where one class member lands in the lowering.
enum MemberSlot {
    /// `new:` — becomes `__init` in the class table.
    Builtin(String),
    /// Ordinary method or field — lands in `_base_N`.
    Common(String),
    /// `@name:` — a statement run with `self` bound to the class.
    Property(String),
}

impl<'a> Compiler<'a> {
    pub(crate) fn transform_class_decl(
        &mut self,
        node: &ClassDecl,
        out: &mut StrList,
        usage: ExpUsage,
        assign_to: Option<&str>,
    ) -> Result<()> {
        if usage == ExpUsage::Closure {
            let clone = node.clone();
            let mut tmp = StrList::new();
            self.closure_wrap(node.span, move |compiler, inner| {
                compiler.transform_class_decl(&clone, inner, ExpUsage::Return, None)
            }, &mut tmp)?;
            out.push(tmp.pop().unwrap_or_default());
            return Ok(());
        }
        let span = node.span;
        // resolve the class name and its assignment target
        let mut class_name = String::new();
        let mut assign_item = String::new();
        if let Some(assignable) = &node.name {
            match assignable {
                Assignable::Variable(v) => {
                    self.check_const(&v.name, v.span)?;
                    if self.scopes.add_to_scope(&v.name) {
                        out.push(format!(
                            "{}local {}{}",
                            self.indent(),
                            v.name,
                            self.nll(span)
                        ));
                    }
                    class_name = format!("\"{}\"", v.name);
                    assign_item = v.name.clone();
                }
                Assignable::SelfItem(item) => {
                    assign_item = self.callable_to_string(&Callable::SelfItem(item.clone()))?;
                }
                Assignable::Chain(chain) => {
                    if let Some(ChainItem::Dot(dot)) = chain.items.last() {
                        if let DotName::Name(name) = &dot.name {
                            class_name = format!("\"{}\"", name.text);
                        }
                    }
                    assign_item = self.chain_items_to_string(&chain.items)?;
                }
            }
        } else if let Some(target) = assign_to {
            let plain = target
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
            if plain {
                class_name = format!("\"{}\"", target);
            }
        }
        out.push(format!("{}do{}", self.indent(), self.nll(span)));
        self.scopes.push();
        let class_var = self.get_unused_name("_class_");
        self.scopes.force_add_to_scope(&class_var);
        out.push(format!(
            "{}local {}{}",
            self.indent(),
            class_var,
            self.nll(span)
        ));
        let parent_var = match &node.extend {
            Some(extend) => {
                let parent_var = self.get_unused_name("_parent_");
                self.scopes.force_add_to_scope(&parent_var);
                let rendered = self.exp_to_string(extend)?;
                out.push(format!(
                    "{}local {} = {}{}",
                    self.indent(),
                    parent_var,
                    rendered,
                    self.nll(span)
                ));
                Some(parent_var)
            }
            None => None,
        };
        let base_var = self.get_unused_name("_base_");
        self.scopes.force_add_to_scope(&base_var);
        // collect members
        let mut builtins: Vec<String> = Vec::new();
        let mut commons: Vec<String> = Vec::new();
        let mut statements = StrList::new();
        if let Some(body) = &node.body {
            self.class_vars.push(class_var.clone());
            for content in &body.contents {
                match content {
                    ClassContent::MemberList(pairs) => {
                        for entry in pairs {
                            match self.class_member_slot(entry)? {
                                MemberSlot::Builtin(text) => builtins.push(text),
                                MemberSlot::Common(text) => commons.push(text),
                                MemberSlot::Property(text) => statements.push(format!(
                                    "{}{}{}",
                                    self.indent(),
                                    text,
                                    self.nll(entry.span())
                                )),
                            }
                        }
                    }
                    ClassContent::Statement(stmt) => {
                        self.transform_statement(stmt, &mut statements)?;
                    }
                }
            }
            self.class_vars.pop();
        }
        if commons.is_empty() {
            out.push(format!(
                "{}local {} = {{ }}{}",
                self.indent(),
                base_var,
                self.nll(span)
            ));
        } else {
            out.push(format!(
                "{}local {} = {{{}",
                self.indent(),
                base_var,
                self.nll(span)
            ));
            let last = commons.len() - 1;
            for (index, member) in commons.iter().enumerate() {
                let comma = if index == last { "" } else { "," };
                out.push(format!(
                    "{}{}{}{}",
                    self.indent_with(1),
                    member,
                    comma,
                    self.nll(span)
                ));
            }
            out.push(format!("{}}}{}", self.indent(), self.nlr(span)));
        }
        // mixins copy members that the class itself does not define
        if let Some(mixes) = &node.mixes {
            let mut rendered = Vec::new();
            for mix in mixes {
                rendered.push(self.exp_to_string(mix)?);
            }
            let mixin = self.get_unused_name("_mixin_");
            let key = self.get_unused_name("_key_");
            let val = self.get_unused_name("_val_");
            out.push(format!(
                "{}for _, {} in ipairs({{ {} }}) do{}",
                self.indent(),
                mixin,
                rendered.join(", "),
                self.nll(span)
            ));
            out.push(format!(
                "{}for {}, {} in pairs({}.__base or {}) do{}",
                self.indent_with(1),
                key,
                val,
                mixin,
                mixin,
                self.nll(span)
            ));
            out.push(format!(
                "{}if {}[{}] == nil then{}",
                self.indent_with(2),
                base_var,
                key,
                self.nll(span)
            ));
            out.push(format!(
                "{}{}[{}] = {}{}",
                self.indent_with(3),
                base_var,
                key,
                val,
                self.nll(span)
            ));
            out.push(format!("{}end{}", self.indent_with(2), self.nlr(span)));
            out.push(format!("{}end{}", self.indent_with(1), self.nlr(span)));
            out.push(format!("{}end{}", self.indent(), self.nlr(span)));
        }
        // inherit double-underscore methods from the parent base
        if let Some(parent_var) = &parent_var {
            let key = self.get_unused_name("_key_");
            let val = self.get_unused_name("_val_");
            out.push(format!(
                "{}for {}, {} in pairs({}.__base) do{}",
                self.indent(),
                key,
                val,
                parent_var,
                self.nll(span)
            ));
            out.push(format!(
                "{}if {}[{}] == nil and {}:match(\"^__\") and not ({} == \"__index\" and {} == {}.__base) then{}",
                self.indent_with(1),
                base_var,
                key,
                key,
                key,
                val,
                parent_var,
                self.nll(span)
            ));
            out.push(format!(
                "{}{}[{}] = {}{}",
                self.indent_with(2),
                base_var,
                key,
                val,
                self.nll(span)
            ));
            out.push(format!("{}end{}", self.indent_with(1), self.nlr(span)));
            out.push(format!("{}end{}", self.indent(), self.nlr(span)));
        }
        out.push(format!(
            "{}if {}.__index == nil then{}",
            self.indent(),
            base_var,
            self.nll(span)
        ));
        out.push(format!(
            "{}{}.__index = {}{}",
            self.indent_with(1),
            base_var,
            base_var,
            self.nll(span)
        ));
        out.push(format!("{}end{}", self.indent(), self.nlr(span)));
        if let Some(parent_var) = &parent_var {
            out.push(format!(
                "{}setmetatable({}, {}.__base){}",
                self.indent(),
                base_var,
                parent_var,
                self.nll(span)
            ));
        }
        // the class table and its metatable
        out.push(format!(
            "{}{} = setmetatable({{{}",
            self.indent(),
            class_var,
            self.nll(span)
        ));
        if builtins.is_empty() {
            match &parent_var {
                Some(_) => {
                    out.push(format!(
                        "{}__init = function(self, ...){}",
                        self.indent_with(1),
                        self.nll(span)
                    ));
                    out.push(format!(
                        "{}return {}.__parent.__init(self, ...){}",
                        self.indent_with(2),
                        class_var,
                        self.nll(span)
                    ));
                    out.push(format!("{}end,{}", self.indent_with(1), self.nll(span)));
                }
                None => {
                    out.push(format!(
                        "{}__init = function() end,{}",
                        self.indent_with(1),
                        self.nll(span)
                    ));
                }
            }
        } else {
            for builtin in &builtins {
                out.push(format!(
                    "{}{},{}",
                    self.indent_with(1),
                    builtin,
                    self.nll(span)
                ));
            }
        }
        let mut class_fields = format!("{}__base = {}", self.indent_with(1), base_var);
        if !class_name.is_empty() {
            class_fields.push_str(&format!(
                ",{}{}__name = {}",
                self.nll(span),
                self.indent_with(1),
                class_name
            ));
        }
        if let Some(parent_var) = &parent_var {
            class_fields.push_str(&format!(
                ",{}{}__parent = {}",
                self.nll(span),
                self.indent_with(1),
                parent_var
            ));
        }
        out.push(format!("{}{}", class_fields, self.nll(span)));
        out.push(format!("{}}}, {{{}", self.indent(), self.nll(span)));
        match &parent_var {
            Some(_) => {
                out.push(format!(
                    "{}__index = function(cls, name){}",
                    self.indent_with(1),
                    self.nll(span)
                ));
                out.push(format!(
                    "{}local val = rawget({}, name){}",
                    self.indent_with(2),
                    base_var,
                    self.nll(span)
                ));
                out.push(format!(
                    "{}if val == nil then{}",
                    self.indent_with(2),
                    self.nll(span)
                ));
                out.push(format!(
                    "{}local parent = rawget(cls, \"__parent\"){}",
                    self.indent_with(3),
                    self.nll(span)
                ));
                out.push(format!(
                    "{}if parent then{}",
                    self.indent_with(3),
                    self.nll(span)
                ));
                out.push(format!(
                    "{}return parent[name]{}",
                    self.indent_with(4),
                    self.nll(span)
                ));
                out.push(format!("{}end{}", self.indent_with(3), self.nll(span)));
                out.push(format!("{}else{}", self.indent_with(2), self.nll(span)));
                out.push(format!(
                    "{}return val{}",
                    self.indent_with(3),
                    self.nll(span)
                ));
                out.push(format!("{}end{}", self.indent_with(2), self.nll(span)));
                out.push(format!("{}end,{}", self.indent_with(1), self.nll(span)));
            }
            None => {
                out.push(format!(
                    "{}__index = {},{}",
                    self.indent_with(1),
                    base_var,
                    self.nll(span)
                ));
            }
        }
        let self_var = self.get_unused_name("_self_");
        out.push(format!(
            "{}__call = function(cls, ...){}",
            self.indent_with(1),
            self.nll(span)
        ));
        out.push(format!(
            "{}local {} = setmetatable({{ }}, {}){}",
            self.indent_with(2),
            self_var,
            base_var,
            self.nll(span)
        ));
        out.push(format!(
            "{}cls.__init({}, ...){}",
            self.indent_with(2),
            self_var,
            self.nll(span)
        ));
        out.push(format!(
            "{}return {}{}",
            self.indent_with(2),
            self_var,
            self.nll(span)
        ));
        out.push(format!("{}end{}", self.indent_with(1), self.nll(span)));
        out.push(format!("{}}}){}", self.indent(), self.nlr(span)));
        out.push(format!(
            "{}{}.__class = {}{}",
            self.indent(),
            base_var,
            class_var,
            self.nll(span)
        ));
        if !statements.is_empty() {
            out.push(format!(
                "{}local self = {};{}",
                self.indent(),
                class_var,
                self.nll(span)
            ));
            out.extend(statements);
        }
        if let Some(parent_var) = &parent_var {
            out.push(format!(
                "{}if {}.__inherited then{}",
                self.indent(),
                parent_var,
                self.nll(span)
            ));
            out.push(format!(
                "{}{}.__inherited({}, {}){}",
                self.indent_with(1),
                parent_var,
                parent_var,
                class_var,
                self.nll(span)
            ));
            out.push(format!("{}end{}", self.indent(), self.nlr(span)));
        }
        if !assign_item.is_empty() {
            out.push(format!(
                "{}{} = {}{}",
                self.indent(),
                assign_item,
                class_var,
                self.nll(span)
            ));
        }
        match usage {
            ExpUsage::Return => {
                out.push(format!(
                    "{}return {}{}",
                    self.indent(),
                    class_var,
                    self.nlr(span)
                ));
            }
            ExpUsage::Assignment => {
                out.push(format!(
                    "{}{} = {}{}",
                    self.indent(),
                    assign_to.expect("assignment usage needs a target"),
                    class_var,
                    self.nll(span)
                ));
            }
            _ => {}
        }
        self.scopes.pop();
        out.push(format!("{}end{}", self.indent(), self.nlr(span)));
        Ok(())
    }

    /// Renders one class member pair and classifies its destination.
    fn class_member_slot(&mut self, entry: &TableEntry) -> Result<MemberSlot> {
        match entry {
            TableEntry::NormalPair(pair) => {
                let value = match &pair.value {
                    PairValue::Exp(exp) => self.exp_to_string(exp)?,
                    PairValue::TableBlock(block) => self.table_block_to_string(block)?,
                };
                match &pair.key {
                    PairKey::KeyName(KeyName::Name(name)) => {
                        if name.text == "new" {
                            Ok(MemberSlot::Builtin(format!("__init = {}", value)))
                        } else if is_lua_keyword(&name.text) {
                            Ok(MemberSlot::Common(format!(
                                "[\"{}\"] = {}",
                                name.text, value
                            )))
                        } else {
                            Ok(MemberSlot::Common(format!("{} = {}", name.text, value)))
                        }
                    }
                    PairKey::KeyName(KeyName::SelfItem(item)) => match item {
                        SelfItem::SelfName(name) => Ok(MemberSlot::Property(format!(
                            "self.{} = {}",
                            name.text, value
                        ))),
                        other => Err(CompileError::span(
                            "invald self expression here",
                            other.span(),
                        )),
                    },
                    PairKey::Exp(exp) => {
                        let key = self.exp_to_string(exp)?;
                        Ok(MemberSlot::Common(format!("[{}] = {}", key, value)))
                    }
                    PairKey::Str(s) => {
                        let key = self.string_to_string(s)?;
                        Ok(MemberSlot::Common(format!("[{}] = {}", key, value)))
                    }
                }
            }
            TableEntry::VariablePair(pair) => {
                if !self.scopes.is_defined(&pair.name.name) {
                    self.record_global(&pair.name.name, pair.span);
                }
                Ok(MemberSlot::Common(format!(
                    "{} = {}",
                    pair.name.name, pair.name.name
                )))
            }
            TableEntry::MetaVariablePair(pair) => {
                if !self.scopes.is_defined(&pair.name.name) {
                    self.record_global(&pair.name.name, pair.span);
                }
                Ok(MemberSlot::Common(format!(
                    "__{} = {}",
                    pair.name.name, pair.name.name
                )))
            }
            TableEntry::MetaNormalPair(pair) => {
                let value = match &pair.value {
                    PairValue::Exp(exp) => self.exp_to_string(exp)?,
                    PairValue::TableBlock(block) => self.table_block_to_string(block)?,
                };
                match &pair.key {
                    Some(MetaIndex::Name(name)) => {
                        self.check_metamethod(&name.text, pair.span)?;
                        Ok(MemberSlot::Common(format!("__{} = {}", name.text, value)))
                    }
                    Some(MetaIndex::Exp(exp)) => {
                        let key = self.exp_to_string(exp)?;
                        Ok(MemberSlot::Common(format!("[{}] = {}", key, value)))
                    }
                    Some(MetaIndex::Str(s)) => {
                        let key = self.string_to_string(s)?;
                        Ok(MemberSlot::Common(format!("[{}] = {}", key, value)))
                    }
                    None => Err(CompileError::span("invalid metamethod name", pair.span)),
                }
            }
            other => Err(CompileError::span(
                "can not put this into a class body",
                other.span(),
            )),
        }
    }
}
