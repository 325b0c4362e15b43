// Postern - Script Sandbox
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Security sandbox for plugin scripts
//!
//! Scripts get a Lua 5.4 state with only the pure libraries loaded
//! (table, string, utf8, math, coroutine). There is no `io`, `os`,
//! `package` or `debug`, and code loading from strings or files is removed.

use crate::config::SCRIPT_MEMORY_LIMIT;
use mlua::{Lua, LuaOptions, StdLib, Value, Variadic};

/// Globals removed on top of the libraries that are never loaded
const REMOVED_GLOBALS: &[&str] = &["load", "loadfile", "dofile", "collectgarbage"];

/// Create a restricted Lua state for the plugin `name`
pub fn create_sandbox(name: &str) -> mlua::Result<Lua> {
    let libs = StdLib::TABLE | StdLib::STRING | StdLib::UTF8 | StdLib::MATH | StdLib::COROUTINE;
    let lua = Lua::new_with(libs, LuaOptions::default())?;

    let globals = lua.globals();
    for global in REMOVED_GLOBALS {
        globals.set(*global, Value::Nil)?;
    }

    // print goes to the server log, tagged with the plugin
    let plugin = name.to_string();
    let print = lua.create_function(move |_, args: Variadic<Value>| {
        let parts = args
            .iter()
            .map(|value| value.to_string())
            .collect::<mlua::Result<Vec<_>>>()?;
        crate::log_info!("[plugin {}] {}", plugin, parts.join("\t"));
        Ok(())
    })?;
    globals.set("print", print)?;

    lua.set_memory_limit(SCRIPT_MEMORY_LIMIT)?;

    Ok(lua)
}
