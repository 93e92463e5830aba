// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Lexical scope tracking and fresh-name generation.
//!
//! The transformer pushes a [`Scope`] for every function, class, loop and
//! branch body it enters, and pops it on exit. Each scope records the
//! variables bound in it, whether newly-seen names should be treated as
//! globals, an optional allow-set restricting which outer names remain
//! visible (the `using` clause of function literals), and the names
//! explicitly declared global in this scope.
//!
//! Name lookups walk the stack from the innermost scope outward. When any
//! scope on the stack carries an allow-set, names missing from it are only
//! resolved against scopes at or inside that frame, which is how a function
//! literal opts out of capturing outer locals.

use std::collections::{HashMap, HashSet};

/// How a name is bound in a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    /// A plain local binding.
    Local,
    /// A local binding that rejects reassignment.
    Const,
    /// A name resolved to a global.
    Global,
}

/// Controls which newly-seen names a scope treats as globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GlobalMode {
    /// No automatic globals.
    None,
    /// Names starting with an uppercase letter are globals (`global ^`).
    Capital,
    /// Every newly-seen name is a global (`global *`).
    Any,
}

/// One lexical scope frame.
#[derive(Debug, Default)]
pub struct Scope {
    mode: Option<GlobalMode>,
    vars: HashMap<String, VarType>,
    allows: Option<HashSet<String>>,
    globals: Option<HashSet<String>>,
}

/// The scope stack owned by one compile.
#[derive(Debug, Default)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
}

impl ScopeStack {
    /// Creates an empty stack. The transformer pushes the file-level scope
    /// itself so that `len` mirrors the emitted indentation depth.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scopes currently on the stack.
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// True when no scope has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Enters a new innermost scope.
    pub fn push(&mut self) {
        self.scopes.push(Scope::default());
    }

    /// Leaves the innermost scope, dropping its bindings.
    pub fn pop(&mut self) {
        self.scopes.pop();
    }

    fn current_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("scope stack is empty")
    }

    /// Whether any scope up the stack carries an allow-set that excludes
    /// `name`, in which case lookups must stop at the outermost allow frame.
    fn shadow_scope_only(&self, name: &str) -> bool {
        let mut allows = None;
        for scope in self.scopes.iter() {
            if let Some(set) = &scope.allows {
                allows = Some(set);
            }
        }
        match allows {
            Some(set) => !set.contains(name),
            None => false,
        }
    }

    /// Looks `name` up, honoring allow-sets, and lazily creates a global
    /// binding in the current scope when its [`GlobalMode`] admits the name.
    ///
    /// This is the lookup used for plain identifier references; the lazy
    /// insert is what makes `global *` / `global ^` regions treat unseen
    /// names as globals instead of compile errors.
    pub fn is_defined(&mut self, name: &str) -> bool {
        let mut defined = false;
        let needs = if name.chars().next().is_some_and(|c| c.is_uppercase()) {
            GlobalMode::Capital
        } else {
            GlobalMode::Any
        };
        if let Some(current) = self.scopes.last_mut() {
            if current.mode.is_some_and(|mode| mode >= needs) && current.globals.is_none() {
                defined = true;
                current.vars.insert(name.to_string(), VarType::Global);
            }
        }
        let shadow_only = self.shadow_scope_only(name);
        for scope in self.scopes.iter().rev() {
            if scope.vars.contains_key(name) {
                defined = true;
                break;
            }
            if shadow_only && scope.allows.is_some() {
                break;
            }
        }
        defined
    }

    /// Whether `name` is bound anywhere on the stack, ignoring allow-sets
    /// and without side effects. Used by fresh-name probing.
    pub fn is_solid_defined(&self, name: &str) -> bool {
        self.scopes.iter().any(|s| s.vars.contains_key(name))
    }

    /// Whether `name` resolves to a local (or const) binding.
    pub fn is_local(&self, name: &str) -> bool {
        for scope in self.scopes.iter().rev() {
            if let Some(kind) = scope.vars.get(name) {
                return *kind != VarType::Global;
            }
        }
        false
    }

    /// Whether `name` resolves to a global binding.
    pub fn is_global(&self, name: &str) -> bool {
        for scope in self.scopes.iter().rev() {
            if let Some(kind) = scope.vars.get(name) {
                return *kind == VarType::Global;
            }
        }
        false
    }

    /// Whether `name` resolves to a const binding, honoring allow-sets.
    pub fn is_const(&self, name: &str) -> bool {
        let shadow_only = self.shadow_scope_only(name);
        for scope in self.scopes.iter().rev() {
            if let Some(kind) = scope.vars.get(name) {
                return *kind == VarType::Const;
            }
            if shadow_only && scope.allows.is_some() {
                break;
            }
        }
        false
    }

    /// Binds `name` as a local in the current scope unless it is already
    /// defined somewhere visible. Returns whether a new binding was made.
    pub fn add_to_scope(&mut self, name: &str) -> bool {
        let defined = self.is_defined(name);
        if !defined {
            self.current_mut()
                .vars
                .insert(name.to_string(), VarType::Local);
        }
        !defined
    }

    /// Binds `name` as a local in the current scope, shadowing any outer
    /// binding. Used for function parameters and destructuring targets.
    pub fn force_add_to_scope(&mut self, name: &str) {
        self.current_mut()
            .vars
            .insert(name.to_string(), VarType::Local);
    }

    /// Promotes `name` to a const binding in the current scope.
    pub fn mark_var_const(&mut self, name: &str) {
        self.current_mut()
            .vars
            .insert(name.to_string(), VarType::Const);
    }

    /// Starts an empty allow-set in the current scope. Until names are added
    /// with [`Self::add_to_allow_list`], no outer local is visible from here.
    pub fn mark_vars_shadowed(&mut self) {
        self.current_mut().allows = Some(HashSet::new());
    }

    /// Allows one outer name through the current scope's allow-set.
    pub fn add_to_allow_list(&mut self, name: &str) {
        self.current_mut()
            .allows
            .get_or_insert_with(HashSet::new)
            .insert(name.to_string());
    }

    /// Sets the global-inference mode of the current scope.
    pub fn mark_vars_global(&mut self, mode: GlobalMode) {
        self.current_mut().mode = Some(mode);
    }

    /// Declares `name` global in the current scope. Returns `false` when the
    /// name is already bound as a local somewhere visible, which is a compile
    /// error at the call site.
    pub fn add_global_var(&mut self, name: &str) -> bool {
        if self.is_local(name) {
            return false;
        }
        let scope = self.current_mut();
        scope
            .globals
            .get_or_insert_with(HashSet::new)
            .insert(name.to_string());
        scope.vars.insert(name.to_string(), VarType::Global);
        true
    }

    /// Returns `prefix` + the smallest integer N ≥ 0 such that the result is
    /// not bound anywhere on the stack.
    pub fn get_unused_name(&self, prefix: &str) -> String {
        let mut index = 0usize;
        loop {
            let candidate = format!("{}{}", prefix, index);
            if !self.is_solid_defined(&candidate) {
                return candidate;
            }
            index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        assert!(scopes.add_to_scope("x"));
        assert!(!scopes.add_to_scope("x"));
        assert!(scopes.is_local("x"));
        scopes.push();
        assert!(scopes.is_defined("x"));
        scopes.pop();
        scopes.pop();
    }

    #[test]
    fn test_shadow_allow_list() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.add_to_scope("captured");
        scopes.add_to_scope("hidden");
        scopes.push();
        scopes.mark_vars_shadowed();
        scopes.add_to_allow_list("captured");
        assert!(scopes.is_defined("captured"));
        assert!(!scopes.is_defined("hidden"));
    }

    #[test]
    fn test_global_capital_mode() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.mark_vars_global(GlobalMode::Capital);
        assert!(scopes.is_defined("Config"));
        assert!(scopes.is_global("Config"));
        assert!(!scopes.is_defined("config"));
    }

    #[test]
    fn test_const_enforcement_scoping() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.add_to_scope("k");
        scopes.mark_var_const("k");
        assert!(scopes.is_const("k"));
        scopes.push();
        scopes.force_add_to_scope("k");
        assert!(!scopes.is_const("k"));
        scopes.pop();
        assert!(scopes.is_const("k"));
    }

    #[test]
    fn test_unused_name_probes_upward() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.add_to_scope("_obj_0");
        scopes.add_to_scope("_obj_1");
        assert_eq!(scopes.get_unused_name("_obj_"), "_obj_2");
    }

    #[test]
    fn test_global_declaration_conflicts_with_local() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.add_to_scope("x");
        scopes.push();
        assert!(!scopes.add_global_var("x"));
        assert!(scopes.add_global_var("y"));
        assert!(scopes.is_global("y"));
    }
}
