// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! End-to-end compile tests: Yue source in, Lua text out.

use crate::{compile, YueConfig};

fn plain_config() -> YueConfig {
    YueConfig {
        implicit_return_root: false,
        reserve_line_number: false,
        ..YueConfig::default()
    }
}

fn config_with_target(target: &str) -> YueConfig {
    let mut config = plain_config();
    config
        .options
        .insert("target".to_string(), target.to_string());
    config
}

fn compile_ok(source: &str, config: &YueConfig) -> String {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let info = compile(source, config);
    assert!(
        info.error.is_none(),
        "compile failed: {:?}",
        info.error.map(|e| e.display_message)
    );
    info.codes
}

fn compile_err(source: &str, config: &YueConfig) -> String {
    let info = compile(source, config);
    info.error.expect("expected a compile error").message
}

#[test]
fn test_simple_assignment_without_implicit_return() {
    let codes = compile_ok("x = 1 + 2\n", &plain_config());
    assert_eq!(codes, "local x = 1 + 2\n");
}

#[test]
fn test_simple_assignment_with_implicit_return() {
    let mut config = plain_config();
    config.implicit_return_root = true;
    let codes = compile_ok("x = 1 + 2\n", &config);
    assert_eq!(codes, "local x\nx = 1 + 2\nreturn x\n");
}

#[test]
fn test_destructuring_with_default() {
    let codes = compile_ok("{a, b = 10} = t\n", &plain_config());
    assert_eq!(
        codes,
        "local a, b\n\
         do\n\
         \tlocal _obj_0 = t\n\
         \ta, b = _obj_0[1], _obj_0[2]\n\
         \tif b == nil then\n\
         \t\tb = 10\n\
         \tend\n\
         end\n"
    );
}

#[test]
fn test_nil_coalescing_return() {
    let codes = compile_ok("return a ?? b\n", &plain_config());
    assert_eq!(
        codes,
        "do\n\
         \tlocal _exp_0 = a\n\
         \tif _exp_0 ~= nil then\n\
         \t\treturn _exp_0\n\
         \telse\n\
         \t\treturn b\n\
         \tend\n\
         end\n"
    );
}

#[test]
fn test_pipe_with_placeholder() {
    let codes = compile_ok("x |> f _, 2 |> g\n", &plain_config());
    assert_eq!(codes, "g(f(x, 2))\n");
}

#[test]
fn test_pipe_placeholder_used_twice_is_error() {
    let message = compile_err("x |> f _, _\n", &plain_config());
    assert_eq!(message, "pipe placeholder can be used only in one place");
}

#[test]
fn test_class_with_extends() {
    let codes = compile_ok(
        "class A extends B\n  new: (x) => @x = x\n  greet: => print @x\n",
        &plain_config(),
    );
    assert!(codes.contains("local _class_0"), "{}", codes);
    assert!(codes.contains("local _parent_0 = B"), "{}", codes);
    assert!(codes.contains("__init = function(self, x)"), "{}", codes);
    assert!(codes.contains("self.x = x"), "{}", codes);
    assert!(codes.contains("greet = function(self)"), "{}", codes);
    assert!(codes.contains("return print(self.x)"), "{}", codes);
    assert!(codes.contains("__base = _base_0"), "{}", codes);
    assert!(codes.contains("__name = \"A\""), "{}", codes);
    assert!(codes.contains("__parent = _parent_0"), "{}", codes);
    assert!(codes.contains("__call = function(cls, ...)"), "{}", codes);
    assert!(codes.contains("cls.__init(_self_0, ...)"), "{}", codes);
    assert!(codes.contains("if _parent_0.__inherited then"), "{}", codes);
    assert!(
        codes.contains("_parent_0.__inherited(_parent_0, _class_0)"),
        "{}",
        codes
    );
    assert!(codes.contains("A = _class_0"), "{}", codes);
}

#[test]
fn test_continue_on_lua51_target() {
    let codes = compile_ok(
        "for i = 1, 3\n  continue if i == 2\n  print i\n",
        &config_with_target("5.1"),
    );
    assert!(codes.contains("local _continue_0 = false"), "{}", codes);
    assert!(codes.contains("repeat"), "{}", codes);
    assert!(codes.contains("until true"), "{}", codes);
    assert!(codes.contains("if not _continue_0 then"), "{}", codes);
    assert!(!codes.contains("goto"), "{}", codes);
}

#[test]
fn test_continue_on_lua54_target_uses_goto() {
    let codes = compile_ok(
        "for i = 1, 3\n  continue if i == 2\n  print i\n",
        &plain_config(),
    );
    assert!(codes.contains("goto _continue_0"), "{}", codes);
    assert!(codes.contains("::_continue_0::"), "{}", codes);
}

#[test]
fn test_existential_chain_closure() {
    let codes = compile_ok("v = a?.b\n", &plain_config());
    assert!(codes.contains("(function()"), "{}", codes);
    assert!(codes.contains("local _obj_0 = a"), "{}", codes);
    assert!(codes.contains("if _obj_0 ~= nil then"), "{}", codes);
    assert!(codes.contains("return _obj_0.b"), "{}", codes);
}

#[test]
fn test_existential_alone_is_nil_test() {
    let codes = compile_ok("v = a?\n", &plain_config());
    assert_eq!(codes, "local v = a ~= nil\n");
}

#[test]
fn test_bitwise_gating_on_52() {
    let message = compile_err("x = 1 << 2\n", &config_with_target("5.2"));
    assert_eq!(
        message,
        "bitwise operator is not available when not targeting Lua version 5.3 or higher"
    );
}

#[test]
fn test_close_attribute_needs_54() {
    let message = compile_err("close f = io.open 'x'\n", &config_with_target("5.3"));
    assert_eq!(
        message,
        "close attribute is not available when not targeting Lua version 5.4 or higher"
    );
    let codes = compile_ok("close f = io.open 'x'\n", &config_with_target("5.4"));
    assert!(codes.contains("local f <close> = io.open('x')"), "{}", codes);
}

#[test]
fn test_const_reassignment_is_rejected() {
    let message = compile_err("const k = 1\nk = 2\n", &plain_config());
    assert_eq!(message, "attempt to assign to const variable 'k'");
}

#[test]
fn test_const_emits_attrib_only_on_54() {
    let codes = compile_ok("const k = 1\n", &plain_config());
    assert_eq!(codes, "local k <const> = 1\n");
    let codes = compile_ok("const k = 1\n", &config_with_target("5.1"));
    assert_eq!(codes, "local k = 1\n");
}

#[test]
fn test_goto_and_label() {
    let codes = compile_ok("::top::\ngoto top\n", &plain_config());
    assert_eq!(codes, "::top::\ngoto top\n");
}

#[test]
fn test_goto_without_label_is_rejected() {
    let message = compile_err("goto nowhere\n", &plain_config());
    assert_eq!(message, "no visible label 'nowhere' for <goto>");
}

#[test]
fn test_goto_needs_52() {
    let message = compile_err("::top::\ngoto top\n", &config_with_target("5.1"));
    assert_eq!(
        message,
        "label statement is not available when not targeting Lua version 5.2 or higher"
    );
}

#[test]
fn test_update_operators() {
    let codes = compile_ok("local x = 1\nx += 2\nx ..= 'a'\n", &plain_config());
    assert!(codes.contains("x = x + 2"), "{}", codes);
    assert!(codes.contains("x = x .. 'a'"), "{}", codes);
}

#[test]
fn test_nil_coalescing_update() {
    let codes = compile_ok("local x\nx ??= 1\n", &plain_config());
    assert!(codes.contains("if x == nil then"), "{}", codes);
    assert!(codes.contains("x = 1"), "{}", codes);
}

#[test]
fn test_table_appending_target() {
    let codes = compile_ok("local tab = {}\ntab[] = 1\n", &plain_config());
    assert!(codes.contains("tab[#tab + 1] = 1"), "{}", codes);
}

#[test]
fn test_list_comprehension() {
    let codes = compile_ok("squares = [i * i for i = 1, 10]\n", &plain_config());
    assert!(codes.contains("local _accum_0 = { }"), "{}", codes);
    assert!(codes.contains("local _len_0 = 1"), "{}", codes);
    assert!(codes.contains("for i = 1, 10 do"), "{}", codes);
    assert!(codes.contains("_accum_0[_len_0] = i * i"), "{}", codes);
    assert!(codes.contains("_len_0 = _len_0 + 1"), "{}", codes);
}

#[test]
fn test_table_comprehension() {
    let codes = compile_ok("copy = {k, v for k, v in pairs t}\n", &plain_config());
    assert!(codes.contains("local _tbl_0 = { }"), "{}", codes);
    assert!(codes.contains("for k, v in pairs(t) do"), "{}", codes);
    assert!(codes.contains("_tbl_0[k] = v"), "{}", codes);
}

#[test]
fn test_star_loop_over_sequence() {
    let codes = compile_ok("for x in *items\n  print x\n", &plain_config());
    assert!(codes.contains("local _list_0 = items"), "{}", codes);
    assert!(codes.contains("for _index_0 = 1, #_list_0 do"), "{}", codes);
    assert!(codes.contains("local x = _list_0[_index_0]"), "{}", codes);
}

#[test]
fn test_switch_plain_and_else() {
    let codes = compile_ok(
        "switch x\n  when 1, 2\n    print \"low\"\n  else\n    print \"high\"\n",
        &plain_config(),
    );
    assert!(codes.contains("local _exp_0 = x"), "{}", codes);
    assert!(
        codes.contains("if _exp_0 == 1 or _exp_0 == 2 then"),
        "{}",
        codes
    );
    assert!(codes.contains("else"), "{}", codes);
}

#[test]
fn test_switch_table_pattern_arm() {
    let codes = compile_ok(
        "switch x\n  when {a, b}\n    print a, b\n  else\n    print \"no\"\n",
        &plain_config(),
    );
    assert!(codes.contains("local _match_0 = false"), "{}", codes);
    assert!(
        codes.contains("if \"table\" == type(_exp_0) then"),
        "{}",
        codes
    );
    assert!(codes.contains("if not _match_0 then"), "{}", codes);
}

#[test]
fn test_with_block() {
    let codes = compile_ok(
        "with obj\n  .name = \"yue\"\n  \\update!\n",
        &plain_config(),
    );
    assert!(codes.contains("local _with_0 = obj"), "{}", codes);
    assert!(codes.contains("_with_0.name = \"yue\""), "{}", codes);
    assert!(codes.contains("_with_0:update()"), "{}", codes);
}

#[test]
fn test_with_existential_guard() {
    let codes = compile_ok("with? obj\n  .run!\n", &plain_config());
    assert!(codes.contains("if _with_0 ~= nil then"), "{}", codes);
}

#[test]
fn test_try_catch() {
    let codes = compile_ok(
        "try\n  work!\ncatch err\n  print err\n",
        &plain_config(),
    );
    assert!(codes.contains("xpcall(function()"), "{}", codes);
    assert!(codes.contains("function(err)"), "{}", codes);
    assert!(codes.contains("return print(err)"), "{}", codes);
}

#[test]
fn test_try_call_is_unwrapped() {
    let codes = compile_ok("try func 1\n", &plain_config());
    assert!(codes.contains("pcall(func, 1)"), "{}", codes);
}

#[test]
fn test_backcall_statement() {
    let codes = compile_ok(
        "(data) <- readAsync \"file.txt\"\nprint data\n",
        &plain_config(),
    );
    assert!(codes.contains("readAsync(\"file.txt\", function(data)"), "{}", codes);
    assert!(codes.contains("return print(data)"), "{}", codes);
}

#[test]
fn test_import_forms() {
    let codes = compile_ok("import \"yue.utils\"\n", &plain_config());
    assert_eq!(codes, "local utils = require(\"yue.utils\")\n");
    let codes = compile_ok("import \"mod\" as other\n", &plain_config());
    assert_eq!(codes, "local other = require(\"mod\")\n");
    let codes = compile_ok("import trim, split from str_util\n", &plain_config());
    assert!(codes.contains("local trim, split"), "{}", codes);
    assert!(codes.contains("trim = _obj_0.trim"), "{}", codes);
    assert!(codes.contains("split = _obj_0.split"), "{}", codes);
}

#[test]
fn test_export_frames_module() {
    let mut config = plain_config();
    config.module = "mymod".to_string();
    let codes = compile_ok("export fn = -> 1\n", &config);
    assert!(codes.starts_with("local _module_0 = { }\n"), "{}", codes);
    assert!(codes.contains("_module_0[\"fn\"] = fn"), "{}", codes);
    assert!(codes.ends_with("return _module_0\n"), "{}", codes);
}

#[test]
fn test_export_default() {
    let codes = compile_ok("export default -> 1\n", &plain_config());
    assert!(codes.starts_with("local _module_0 = nil\n"), "{}", codes);
    assert!(codes.ends_with("return _module_0\n"), "{}", codes);
}

#[test]
fn test_return_and_export_do_not_mix() {
    let message = compile_err("export x = 1\nreturn 2\n", &plain_config());
    assert_eq!(
        message,
        "can not mix use of return and export statements in module scope"
    );
}

#[test]
fn test_global_declaration() {
    let codes = compile_ok("global count = 0\ncount = 1\n", &plain_config());
    assert!(codes.contains("count = 0"), "{}", codes);
    assert!(!codes.contains("local count"), "{}", codes);
}

#[test]
fn test_global_lint_collects_free_names() {
    let mut config = plain_config();
    config.lint_global_variable = true;
    let info = compile("print x\n", &config);
    assert!(info.error.is_none());
    let globals = info.globals.expect("lint should produce a global list");
    let names: Vec<&str> = globals.iter().map(|g| g.name.as_str()).collect();
    assert!(names.contains(&"print"));
    assert!(names.contains(&"x"));
    // sorted by source position
    assert!(globals.windows(2).all(|w| (w[0].line, w[0].col) <= (w[1].line, w[1].col)));
}

#[test]
fn test_statement_if_appendix() {
    let codes = compile_ok("print x if ok\n", &plain_config());
    assert!(codes.contains("if ok then"), "{}", codes);
    assert!(codes.contains("print(x)"), "{}", codes);
}

#[test]
fn test_statement_comp_appendix() {
    let codes = compile_ok("print x for x in *items\n", &plain_config());
    assert!(codes.contains("for _index_0 = 1, #_list_0 do"), "{}", codes);
    assert!(codes.contains("print(x)"), "{}", codes);
}

#[test]
fn test_unless_negates() {
    let codes = compile_ok("print x unless done\n", &plain_config());
    assert!(codes.contains("if not done then"), "{}", codes);
}

#[test]
fn test_string_interpolation() {
    let codes = compile_ok("s = \"value: #{1 + 2}!\"\n", &plain_config());
    assert_eq!(codes, "local s = \"value: \" .. tostring(1 + 2) .. \"!\"\n");
}

#[test]
fn test_reserve_line_numbers() {
    let mut config = plain_config();
    config.reserve_line_number = true;
    let codes = compile_ok("x = 1\ny = 2\n", &config);
    assert!(codes.contains("local x = 1 -- 1"), "{}", codes);
    assert!(codes.contains("local y = 2 -- 2"), "{}", codes);
}

#[test]
fn test_line_offset_shifts_markers() {
    let mut config = plain_config();
    config.reserve_line_number = true;
    config.line_offset = 10;
    let codes = compile_ok("x = 1\n", &config);
    assert!(codes.contains("-- 11"), "{}", codes);
}

#[test]
fn test_reserve_comment() {
    let mut config = plain_config();
    config.reserve_comment = true;
    let codes = compile_ok("-- keep me\nx = 1\n", &config);
    assert!(codes.contains("-- keep me"), "{}", codes);
}

#[test]
fn test_use_space_over_tab() {
    let mut config = plain_config();
    config.use_space_over_tab = true;
    let codes = compile_ok("if x\n  print x\n", &config);
    assert!(codes.contains("\n  print(x)"), "{}", codes);
    assert!(!codes.contains('\t'), "{}", codes);
}

#[test]
fn test_determinism() {
    let config = plain_config();
    let source = "class A\n  new: => @x = 1\nb = [i for i = 1, 3]\nprint b\n";
    let first = compile(source, &config);
    let second = compile(source, &config);
    assert_eq!(first, second);
}

#[test]
fn test_keyword_colon_call() {
    let codes = compile_ok("local obj\nobj\\end!\n", &plain_config());
    assert!(codes.contains("obj[\"end\"](obj)"), "{}", codes);
}

#[test]
fn test_metatable_access() {
    let codes = compile_ok("local t\nm = t.<>\n", &plain_config());
    assert!(codes.contains("getmetatable(t)"), "{}", codes);
    let codes = compile_ok("local t\nidx = t.<index>\n", &plain_config());
    assert!(codes.contains("getmetatable(t).__index"), "{}", codes);
}

#[test]
fn test_metatable_assignment_target() {
    let codes = compile_ok("local t\nt.<> = {}\n", &plain_config());
    assert!(codes.contains("setmetatable(t, { })"), "{}", codes);
}

#[test]
fn test_spread_in_table_literal() {
    let codes = compile_ok("merged = {1, ...others, flag: true}\n", &plain_config());
    assert!(codes.contains("local _tab_0 = {"), "{}", codes);
    assert!(codes.contains("for _key_0, _value_0 in pairs(_obj_0) do"), "{}", codes);
    assert!(codes.contains("_tab_0[#_tab_0 + 1] = _value_0"), "{}", codes);
    assert!(codes.contains("_tab_0.flag = true"), "{}", codes);
}

#[test]
fn test_spread_then_metamethod_is_rejected() {
    let message = compile_err("t = {...a, <call>: f}\n", &plain_config());
    assert_eq!(
        message,
        "metamethod pair is not supported after a spread entry"
    );
}

#[test]
fn test_in_expression_discrete() {
    let codes = compile_ok("local x\nok = x in [1, 2, 3]\n", &plain_config());
    assert!(codes.contains("x == 1 or x == 2 or x == 3"), "{}", codes);
    let codes = compile_ok("local x\nok = x not in [1, 2]\n", &plain_config());
    assert!(codes.contains("not (x == 1 or x == 2)"), "{}", codes);
}

#[test]
fn test_repeat_until() {
    let codes = compile_ok("repeat\n  step!\nuntil done\n", &plain_config());
    assert!(codes.contains("repeat"), "{}", codes);
    assert!(codes.contains("until done"), "{}", codes);
}

#[test]
fn test_repeat_with_continue_on_51_captures_condition() {
    let codes = compile_ok(
        "repeat\n  continue if skip\n  step!\nuntil done\n",
        &config_with_target("5.1"),
    );
    assert!(codes.contains("local _cond_0 = false"), "{}", codes);
    assert!(codes.contains("_cond_0 = done"), "{}", codes);
    assert!(codes.contains("until _cond_0"), "{}", codes);
}

#[test]
fn test_unexpected_expression_is_rejected() {
    let message = compile_err("1 + 2\n", &plain_config());
    assert_eq!(message, "unexpected expression");
}

#[test]
fn test_vararg_outside_function_is_ok_at_root() {
    // the root chunk is variadic
    let codes = compile_ok("args = {...}\n", &plain_config());
    assert!(codes.contains("local args = {"), "{}", codes);
}

#[test]
fn test_function_default_arguments() {
    let codes = compile_ok("f = (a = 1) -> a\n", &plain_config());
    assert!(codes.contains("function(a)"), "{}", codes);
    assert!(codes.contains("if a == nil then"), "{}", codes);
    assert!(codes.contains("a = 1"), "{}", codes);
    assert!(codes.contains("return a"), "{}", codes);
}

#[test]
fn test_fat_arrow_binds_self() {
    let codes = compile_ok("f = => @value\n", &plain_config());
    assert!(codes.contains("function(self)"), "{}", codes);
    assert!(codes.contains("return self.value"), "{}", codes);
}

#[test]
fn test_compile_info_round_trips_through_json() {
    let info = compile("x = 1\n", &plain_config());
    let json = serde_json::to_string(&info).unwrap();
    let back: crate::CompileInfo = serde_json::from_str(&json).unwrap();
    assert_eq!(info, back);
}

#[test]
fn test_chain_assign() {
    let codes = compile_ok("a = b = 1\n", &plain_config());
    assert!(codes.contains("local _tmp_0 = 1"), "{}", codes);
    assert!(codes.contains("local b = _tmp_0"), "{}", codes);
    assert!(codes.contains("local a = _tmp_0"), "{}", codes);
}

#[cfg(feature = "macros")]
mod macro_tests {
    use super::{compile_err, compile_ok, plain_config};
    use crate::compile;

    #[test]
    fn test_macro_definition_and_expansion() {
        let codes = compile_ok(
            "macro square = (x) -> \"(#{x} * #{x})\"\nv = $square 5\n",
            &plain_config(),
        );
        assert!(codes.contains("local v = (5 * 5)"), "{}", codes);
    }

    #[test]
    fn test_macro_line_builtin() {
        let codes = compile_ok("a = $LINE\n", &plain_config());
        assert!(codes.contains("local a = 1"), "{}", codes);
    }

    #[test]
    fn test_macro_file_builtin() {
        let mut config = plain_config();
        config.module = "my_mod".to_string();
        let codes = compile_ok("a = $FILE\n", &config);
        assert!(codes.contains("local a = \"my_mod\""), "{}", codes);
        let codes = compile_ok("a = $FILE\n", &plain_config());
        assert!(codes.contains("local a = \"yuescript\""), "{}", codes);
    }

    #[test]
    fn test_macro_not_defined() {
        let message = compile_err("v = $missing 1\n", &plain_config());
        assert_eq!(message, "can not resolve macro");
    }

    #[test]
    fn test_macro_must_be_root_level() {
        let message = compile_err(
            "do\n  macro inner = -> \"1\"\n",
            &plain_config(),
        );
        assert_eq!(message, "can not define macro outside the root block");
    }

    #[test]
    fn test_macro_statement_expansion() {
        let codes = compile_ok(
            "macro log = (msg) -> \"print #{msg}\"\n$log 'hello'\n",
            &plain_config(),
        );
        assert!(codes.contains("print('hello')"), "{}", codes);
    }

    #[test]
    fn test_macro_determinism_with_same_definitions() {
        let config = plain_config();
        let source = "macro twice = (x) -> \"#{x} + #{x}\"\nv = $twice 3\n";
        let first = compile(source, &config);
        let second = compile(source, &config);
        assert_eq!(first, second);
    }
}
