// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Macro host: the embedded Lua VM behind `macro` definitions and `$name`
//! expansions.
//!
//! The transformer talks to the VM only through the [`MacroVm`] trait, so
//! the compiler core builds and runs without a Lua dependency. With the
//! `macros` feature (default) the [`LuaMacroVm`] implementation compiles
//! macro bodies with [`mlua`] and keeps per-module macro tables in the Lua
//! registry under `__yue_modules__`; with the feature disabled every macro
//! site reports "macro feature not supported".
//!
//! A macro returns either a string (Yue source that is re-parsed and spliced
//! at the call site) or a table `{ code, type = "lua"|"text", locals }`
//! whose code is emitted verbatim.

use thiserror::Error;

/// A failure inside the macro VM, positioned by the caller at the macro
/// definition or invocation site.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct MacroError(pub String);

/// How macro-returned code should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroCodeType {
    /// Emit as Lua, statement position only.
    Lua,
    /// Emit verbatim.
    Text,
}

/// The value produced by one macro invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum MacroExpansion {
    /// Yue source text to re-parse and splice into the surrounding tree.
    Yue(String),
    /// Raw code emitted as-is, plus the local names it introduces.
    Raw {
        code: String,
        kind: MacroCodeType,
        locals: Vec<String>,
    },
}

/// The embedded VM the transformer calls into.
///
/// One VM is owned by (or lent to) a compiler instance; access is
/// single-threaded within each compile.
pub trait MacroVm {
    /// Compiles `lua_code` (the text of `function(...) ... end`) under
    /// `chunk_name` and registers it as macro `name` for the current module.
    fn register_macro(
        &self,
        name: &str,
        lua_code: &str,
        chunk_name: &str,
    ) -> Result<(), MacroError>;

    /// Whether `name` is registered for the current module scope.
    fn has_macro(&self, name: &str) -> bool;

    /// Calls macro `name` with raw argument strings.
    fn expand_macro(&self, name: &str, args: &[String]) -> Result<MacroExpansion, MacroError>;

    /// Enters a per-compile module scope; exported macros live in it.
    fn push_module(&self, module: &str, exporting: bool) -> Result<(), MacroError>;

    /// Leaves the current module scope.
    fn pop_module(&self) -> Result<(), MacroError>;

    /// Passes the compile options through to macro code (`$get_option`-style
    /// helpers read them from the VM side).
    fn set_options(&self, options: &[(String, String)]) -> Result<(), MacroError>;

    /// Publishes an already-registered macro under the current module's
    /// export table, for other compiles to import.
    fn export_macro(&self, _name: &str) -> Result<(), MacroError> {
        Ok(())
    }

    /// Imports macros exported by `module` into the current scope. `pairs`
    /// maps exported name → imported name; with `all` set every exported
    /// macro comes in under its own name.
    fn import_macros(
        &self,
        _module: &str,
        _pairs: &[(String, String)],
        _all: bool,
    ) -> Result<(), MacroError> {
        Err(MacroError("macro feature not supported".to_string()))
    }
}

/// Stub VM used when the `macros` feature is off (or no VM is supplied).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMacroVm;

impl MacroVm for NoopMacroVm {
    fn register_macro(&self, _: &str, _: &str, _: &str) -> Result<(), MacroError> {
        Err(MacroError("macro feature not supported".to_string()))
    }

    fn has_macro(&self, _: &str) -> bool {
        false
    }

    fn expand_macro(&self, _: &str, _: &[String]) -> Result<MacroExpansion, MacroError> {
        Err(MacroError("macro feature not supported".to_string()))
    }

    fn push_module(&self, _: &str, _: bool) -> Result<(), MacroError> {
        Ok(())
    }

    fn pop_module(&self) -> Result<(), MacroError> {
        Ok(())
    }

    fn set_options(&self, _: &[(String, String)]) -> Result<(), MacroError> {
        Ok(())
    }
}

#[cfg(feature = "macros")]
pub use lua_vm::{clear_macro_registry, LuaMacroVm};

#[cfg(feature = "macros")]
mod lua_vm {
    use super::{MacroCodeType, MacroError, MacroExpansion, MacroVm};
    use mlua::{Lua, Table, Value};

    const YUE_MODULES: &str = "__yue_modules__";
    const YUE_MODULE_EXPORTS: &str = "__yue_module_exports__";
    const YUE_OPTIONS: &str = "__yue_options__";

    /// mlua-backed macro host.
    ///
    /// Owns (or shares) one `Lua` state. Compiled macro closures live in a
    /// stack of per-module tables stored in the named registry slot
    /// `__yue_modules__`, so nested compiles of different modules never see
    /// each other's macros unless they are exported.
    pub struct LuaMacroVm {
        lua: Lua,
    }

    impl Default for LuaMacroVm {
        fn default() -> Self {
            Self::new()
        }
    }

    impl LuaMacroVm {
        /// Creates a host with a fresh Lua state.
        pub fn new() -> Self {
            Self { lua: Lua::new() }
        }

        /// Wraps an externally owned Lua state.
        pub fn with_lua(lua: Lua) -> Self {
            Self { lua }
        }

        /// Access to the underlying state, e.g. to preload helper modules
        /// for macro code.
        pub fn lua(&self) -> &Lua {
            &self.lua
        }

        fn modules(&self) -> Result<Table, MacroError> {
            let existing: Option<Table> = self
                .lua
                .named_registry_value(YUE_MODULES)
                .map_err(from_lua_error)?;
            match existing {
                Some(table) => Ok(table),
                None => {
                    let table = self.lua.create_table().map_err(from_lua_error)?;
                    self.lua
                        .set_named_registry_value(YUE_MODULES, table.clone())
                        .map_err(from_lua_error)?;
                    Ok(table)
                }
            }
        }

        fn current_module(&self) -> Result<Option<Table>, MacroError> {
            let modules = self.modules()?;
            let len = modules.raw_len();
            if len == 0 {
                return Ok(None);
            }
            let top: Table = modules.raw_get(len).map_err(from_lua_error)?;
            Ok(Some(top))
        }

        fn exports(&self) -> Result<Table, MacroError> {
            let existing: Option<Table> = self
                .lua
                .named_registry_value(YUE_MODULE_EXPORTS)
                .map_err(from_lua_error)?;
            match existing {
                Some(table) => Ok(table),
                None => {
                    let table = self.lua.create_table().map_err(from_lua_error)?;
                    self.lua
                        .set_named_registry_value(YUE_MODULE_EXPORTS, table.clone())
                        .map_err(from_lua_error)?;
                    Ok(table)
                }
            }
        }
    }

    fn from_lua_error(err: mlua::Error) -> MacroError {
        MacroError(err.to_string())
    }

    impl MacroVm for LuaMacroVm {
        fn register_macro(
            &self,
            name: &str,
            lua_code: &str,
            chunk_name: &str,
        ) -> Result<(), MacroError> {
            let module = self
                .current_module()?
                .ok_or_else(|| MacroError("no module scope for macro definition".to_string()))?;
            let func: mlua::Function = self
                .lua
                .load(format!("return {}", lua_code))
                .set_name(chunk_name)
                .eval()
                .map_err(from_lua_error)?;
            module.raw_set(name, func).map_err(from_lua_error)?;
            Ok(())
        }

        fn has_macro(&self, name: &str) -> bool {
            match self.current_module() {
                Ok(Some(module)) => matches!(
                    module.raw_get::<Value>(name),
                    Ok(Value::Function(_))
                ),
                _ => false,
            }
        }

        fn expand_macro(
            &self,
            name: &str,
            args: &[String],
        ) -> Result<MacroExpansion, MacroError> {
            let module = self
                .current_module()?
                .ok_or_else(|| MacroError(format!("macro '{}' not defined", name)))?;
            let func: Value = module.raw_get(name).map_err(from_lua_error)?;
            let func = match func {
                Value::Function(f) => f,
                _ => return Err(MacroError(format!("macro '{}' not defined", name))),
            };
            let args: Vec<Value> = args
                .iter()
                .map(|a| {
                    self.lua
                        .create_string(a)
                        .map(Value::String)
                        .map_err(from_lua_error)
                })
                .collect::<Result<_, _>>()?;
            let result: Value = func
                .call(mlua::MultiValue::from_iter(args))
                .map_err(|err| MacroError(format!("failed to expand macro: {}", err)))?;
            match result {
                Value::String(s) => Ok(MacroExpansion::Yue(
                    s.to_str().map_err(from_lua_error)?.to_string(),
                )),
                Value::Table(t) => {
                    let code: String = t.raw_get("code").map_err(|_| {
                        MacroError("macro table result must contain a 'code' field".to_string())
                    })?;
                    let kind: Option<String> = t.raw_get("type").map_err(from_lua_error)?;
                    let kind = match kind.as_deref() {
                        Some("lua") => MacroCodeType::Lua,
                        Some("text") | None => MacroCodeType::Text,
                        Some(other) => {
                            return Err(MacroError(format!(
                                "invalid macro result type '{}'",
                                other
                            )))
                        }
                    };
                    let locals = match t.raw_get::<Option<Table>>("locals") {
                        Ok(Some(list)) => list
                            .sequence_values::<String>()
                            .collect::<Result<Vec<_>, _>>()
                            .map_err(from_lua_error)?,
                        _ => Vec::new(),
                    };
                    Ok(MacroExpansion::Raw { code, kind, locals })
                }
                Value::Nil => Err(MacroError(
                    "macro expansion returned no value".to_string(),
                )),
                other => Err(MacroError(format!(
                    "macro expansion must return a string or a table, got {}",
                    other.type_name()
                ))),
            }
        }

        fn push_module(&self, module: &str, exporting: bool) -> Result<(), MacroError> {
            let modules = self.modules()?;
            let scope = self.lua.create_table().map_err(from_lua_error)?;
            scope.raw_set("name", module).map_err(from_lua_error)?;
            scope
                .raw_set("exporting", exporting)
                .map_err(from_lua_error)?;
            modules
                .raw_set(modules.raw_len() + 1, scope)
                .map_err(from_lua_error)?;
            Ok(())
        }

        fn pop_module(&self) -> Result<(), MacroError> {
            let modules = self.modules()?;
            let len = modules.raw_len();
            if len > 0 {
                modules.raw_set(len, Value::Nil).map_err(from_lua_error)?;
            }
            Ok(())
        }

        fn set_options(&self, options: &[(String, String)]) -> Result<(), MacroError> {
            let table = self.lua.create_table().map_err(from_lua_error)?;
            for (key, value) in options {
                table
                    .raw_set(key.as_str(), value.as_str())
                    .map_err(from_lua_error)?;
            }
            self.lua
                .set_named_registry_value(YUE_OPTIONS, table)
                .map_err(from_lua_error)?;
            Ok(())
        }

        fn export_macro(&self, name: &str) -> Result<(), MacroError> {
            let module = self
                .current_module()?
                .ok_or_else(|| MacroError("no module scope for macro export".to_string()))?;
            let module_name: String = module.raw_get("name").map_err(from_lua_error)?;
            let func: Value = module.raw_get(name).map_err(from_lua_error)?;
            let exports = self.exports()?;
            let slot: Table = match exports
                .raw_get::<Option<Table>>(module_name.as_str())
                .map_err(from_lua_error)?
            {
                Some(table) => table,
                None => {
                    let table = self.lua.create_table().map_err(from_lua_error)?;
                    exports
                        .raw_set(module_name.as_str(), table.clone())
                        .map_err(from_lua_error)?;
                    table
                }
            };
            slot.raw_set(name, func).map_err(from_lua_error)?;
            Ok(())
        }

        fn import_macros(
            &self,
            module: &str,
            pairs: &[(String, String)],
            all: bool,
        ) -> Result<(), MacroError> {
            let exports = self.exports()?;
            let slot: Option<Table> = exports.raw_get(module).map_err(from_lua_error)?;
            let slot = slot.ok_or_else(|| {
                MacroError(format!("no macros exported by module '{}'", module))
            })?;
            let current = self
                .current_module()?
                .ok_or_else(|| MacroError("no module scope for macro import".to_string()))?;
            if all {
                for pair in slot.pairs::<String, Value>() {
                    let (name, func) = pair.map_err(from_lua_error)?;
                    if matches!(func, Value::Function(_)) {
                        current.raw_set(name, func).map_err(from_lua_error)?;
                    }
                }
                return Ok(());
            }
            for (from, to) in pairs {
                let func: Value = slot.raw_get(from.as_str()).map_err(from_lua_error)?;
                match func {
                    Value::Function(_) => {
                        current.raw_set(to.as_str(), func).map_err(from_lua_error)?;
                    }
                    _ => {
                        return Err(MacroError(format!(
                            "macro '{}' is not exported by module '{}'",
                            from, module
                        )))
                    }
                }
            }
            Ok(())
        }
    }

    /// Drops the cross-compile macro table from a VM. Idempotent.
    pub fn clear_macro_registry(vm: &LuaMacroVm) -> Result<(), MacroError> {
        vm.lua
            .set_named_registry_value(YUE_MODULES, mlua::Value::Nil)
            .map_err(from_lua_error)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_register_and_expand() {
            let vm = LuaMacroVm::new();
            vm.push_module("test", false).unwrap();
            vm.register_macro(
                "square",
                "function(x) return \"(\" .. x .. \" * \" .. x .. \")\" end",
                "square",
            )
            .unwrap();
            assert!(vm.has_macro("square"));
            let result = vm.expand_macro("square", &["n".to_string()]).unwrap();
            assert_eq!(result, MacroExpansion::Yue("(n * n)".to_string()));
            vm.pop_module().unwrap();
            assert!(!vm.has_macro("square"));
        }

        #[test]
        fn test_table_result_with_locals() {
            let vm = LuaMacroVm::new();
            vm.push_module("test", false).unwrap();
            vm.register_macro(
                "declare",
                "function() return { code = \"local created = 1\", type = \"lua\", \
                 locals = { \"created\" } } end",
                "declare",
            )
            .unwrap();
            let result = vm.expand_macro("declare", &[]).unwrap();
            match result {
                MacroExpansion::Raw { code, kind, locals } => {
                    assert_eq!(code, "local created = 1");
                    assert_eq!(kind, MacroCodeType::Lua);
                    assert_eq!(locals, vec!["created".to_string()]);
                }
                other => panic!("unexpected expansion {:?}", other),
            }
        }

        #[test]
        fn test_macro_runtime_error_is_reported() {
            let vm = LuaMacroVm::new();
            vm.push_module("test", false).unwrap();
            vm.register_macro("boom", "function() error(\"broken\") end", "boom")
                .unwrap();
            let err = vm.expand_macro("boom", &[]).unwrap_err();
            assert!(err.0.contains("failed to expand macro"));
        }

        #[test]
        fn test_clear_registry_is_idempotent() {
            let vm = LuaMacroVm::new();
            vm.push_module("m", false).unwrap();
            clear_macro_registry(&vm).unwrap();
            clear_macro_registry(&vm).unwrap();
            assert!(!vm.has_macro("anything"));
        }
    }
}
