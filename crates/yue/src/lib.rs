// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

// Warn on missing documentation for public items
#![warn(missing_docs)]
// The compile error type carries rich context (message + framed source
// position); boxing it would only obscure the API.
#![allow(clippy::result_large_err)]

//! # Yue
//!
//! Source-to-source compiler for Yue, a whitespace-significant
//! MoonScript-family dialect, targeting Lua 5.1 through 5.4.
//!
//! The compiler is a pipeline of an indent-sensitive PEG parser producing a
//! position-annotated AST, and a scope-driven transformer that emits Lua
//! text — desugaring classes, destructuring, comprehensions, pipes and
//! backcalls, existential chains, `switch` pattern arms, and (optionally)
//! expanding user macros through an embedded Lua VM.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use yue::{compile, YueConfig};
//!
//! let config = YueConfig::default();
//! let info = compile("print \"hello\"", &config);
//! assert!(info.error.is_none());
//! println!("{}", info.codes);
//! ```
//!
//! ## Architecture
//!
//! - **source**: decoded code-point buffer and positions
//! - **peg**: backtracking cursor with stateful semantic predicates
//! - **parser**: the Yue grammar
//! - **ast**: the node family
//! - **scope**: lexical scope stack and fresh-name generation
//! - **transform**: AST → Lua emission
//! - **macros**: the embedded macro VM behind the `MacroVm` trait
//!
//! ## Determinism
//!
//! Parsing and transformation are pure functions of the input plus the
//! configuration; the macro VM is the single source of non-determinism.
//! Repeated compiles with identical inputs and macro definitions produce
//! byte-identical output.

/// Abstract Syntax Tree types for Yue source.
pub mod ast;
/// Error types and framed error display.
pub mod error;
/// Macro host: the embedded Lua VM interface.
pub mod macros;
/// The stateful PEG engine.
pub mod peg;
/// The indent-sensitive Yue grammar.
pub mod parser;
/// Lexical scope tracking.
pub mod scope;
/// Decoded source buffer and positions.
pub mod source;
/// The AST-to-Lua transformer.
mod transform;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use error::CompileError;
pub use macros::{MacroError, MacroExpansion, MacroVm, NoopMacroVm};
#[cfg(feature = "macros")]
pub use macros::{clear_macro_registry, LuaMacroVm};
pub use parser::ParseInfo;
pub use source::{Input, Pos};

/// Compiler configuration for one compilation unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YueConfig {
    /// Collect free names used without a prior binding into
    /// [`CompileInfo::globals`].
    pub lint_global_variable: bool,
    /// Treat the root block's last statement as an implicit return.
    pub implicit_return_root: bool,
    /// Emit `-- N` source-line markers on statement boundaries.
    pub reserve_line_number: bool,
    /// Preserve statement-leading comments as Lua comments.
    pub reserve_comment: bool,
    /// Indent the output with two-space stops instead of tabs.
    pub use_space_over_tab: bool,
    /// Store exported macros for other modules to import.
    pub exporting: bool,
    /// Added to every reported and emitted line number.
    pub line_offset: i32,
    /// The current module name.
    pub module: String,
    /// Arbitrary key/value options passed to the macro VM; the `target` key
    /// selects the Lua version ("5.1" through "5.4", default "5.4").
    pub options: HashMap<String, String>,
}

impl Default for YueConfig {
    fn default() -> Self {
        Self {
            lint_global_variable: false,
            implicit_return_root: true,
            reserve_line_number: true,
            reserve_comment: false,
            use_space_over_tab: false,
            exporting: false,
            line_offset: 0,
            module: String::new(),
            options: HashMap::new(),
        }
    }
}

/// A free global reference found during compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalVar {
    /// The referenced name.
    pub name: String,
    /// 1-based line of the first reference.
    pub line: usize,
    /// 1-based column of the first reference.
    pub col: usize,
}

/// The error payload of a failed compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileErrorInfo {
    /// Description of the failure.
    pub message: String,
    /// 1-based source line.
    pub line: usize,
    /// 1-based source column.
    pub col: usize,
    /// Multi-line framed message quoting the offending source line with a
    /// caret under the error column.
    pub display_message: String,
}

/// The result of one [`compile`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompileInfo {
    /// The emitted Lua source; empty when an error occurred.
    pub codes: String,
    /// The first error, if the compile failed.
    pub error: Option<CompileErrorInfo>,
    /// Free globals, present when
    /// [`YueConfig::lint_global_variable`] is set.
    pub globals: Option<Vec<GlobalVar>>,
    /// The options the compile ran with.
    pub options: Option<HashMap<String, String>>,
}

/// A compiler instance owning (or borrowing) one macro VM.
///
/// Independent instances may compile on separate threads; a single instance
/// is single-threaded within each [`YueCompiler::compile`] call.
pub struct YueCompiler {
    vm: Box<dyn MacroVm>,
    same_module: bool,
}

impl Default for YueCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl YueCompiler {
    /// Creates a compiler with the default macro VM (an embedded Lua state
    /// with the `macros` feature, the no-op stub otherwise).
    pub fn new() -> Self {
        #[cfg(feature = "macros")]
        {
            Self {
                vm: Box::new(LuaMacroVm::new()),
                same_module: false,
            }
        }
        #[cfg(not(feature = "macros"))]
        {
            Self {
                vm: Box::new(NoopMacroVm),
                same_module: false,
            }
        }
    }

    /// Creates a compiler around an externally owned VM. With `same_module`
    /// set, per-module macro state persists across compiles instead of
    /// being re-initialized per call.
    pub fn with_vm(vm: Box<dyn MacroVm>, same_module: bool) -> Self {
        Self { vm, same_module }
    }

    /// Compiles Yue source text to Lua.
    pub fn compile(&self, source: &str, config: &YueConfig) -> CompileInfo {
        let input = match source::Input::decode(source) {
            Ok(input) => input,
            Err(err) => return error_info(err, None, config),
        };
        self.compile_input(&input, config)
    }

    /// Compiles raw bytes, reporting "invalid text encoding" at 1:1 for
    /// non-UTF-8 input.
    pub fn compile_bytes(&self, source: &[u8], config: &YueConfig) -> CompileInfo {
        let input = match source::Input::from_bytes(source) {
            Ok(input) => input,
            Err(err) => return error_info(err, None, config),
        };
        self.compile_input(&input, config)
    }

    fn compile_input(&self, input: &Input, config: &YueConfig) -> CompileInfo {
        let parse_start = Instant::now();
        let info = parser::parse_file(input);
        debug!(elapsed = ?parse_start.elapsed(), "parse finished");
        if let Some(err) = info.error {
            return error_info(err, Some(input), config);
        }
        let file = info.node.expect("parse succeeded without a node");
        let mut options_list: Vec<(String, String)> = config
            .options
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        options_list.sort();
        let _ = self.vm.set_options(&options_list);
        let module_key = if config.module.is_empty() {
            info.module_name.clone().unwrap_or_default()
        } else {
            config.module.clone()
        };
        let entered_module = if self.same_module {
            false
        } else {
            self.vm.push_module(&module_key, config.exporting).is_ok()
        };
        let transform_start = Instant::now();
        let result = transform::Compiler::new(
            config,
            input,
            self.vm.as_ref(),
            info.module_name.clone(),
            info.export_default,
            info.export_metatable,
        )
        .and_then(|mut compiler| {
            let codes = compiler.compile_file(&file)?;
            let globals = if config.lint_global_variable {
                Some(
                    compiler
                        .take_globals()
                        .into_iter()
                        .map(|g| GlobalVar {
                            name: g.name,
                            line: g.line,
                            col: g.col,
                        })
                        .collect::<Vec<_>>(),
                )
            } else {
                None
            };
            Ok((codes, globals))
        });
        if entered_module {
            let _ = self.vm.pop_module();
        }
        debug!(elapsed = ?transform_start.elapsed(), "transform finished");
        match result {
            Ok((codes, globals)) => CompileInfo {
                codes,
                error: None,
                globals,
                options: if config.options.is_empty() {
                    None
                } else {
                    Some(config.options.clone())
                },
            },
            Err(err) => error_info(err, Some(input), config),
        }
    }
}

fn error_info(err: CompileError, input: Option<&Input>, config: &YueConfig) -> CompileInfo {
    let display_message = err.display_message(input, config.line_offset);
    CompileInfo {
        codes: String::new(),
        error: Some(CompileErrorInfo {
            message: err.message,
            line: err.line,
            col: err.col,
            display_message,
        }),
        globals: None,
        options: if config.options.is_empty() {
            None
        } else {
            Some(config.options.clone())
        },
    }
}

/// Compiles Yue source with a fresh compiler instance.
pub fn compile(source: &str, config: &YueConfig) -> CompileInfo {
    YueCompiler::new().compile(source, config)
}
