// Postern - Plugin Discovery
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Plugin loading logic
//!
//! This module handles discovering and loading Lua plugins from the plugin directory.

use super::plugin::Plugin;
use super::registry::close_plugins;
use super::scripted::ScriptedPlugin;
use crate::config::PLUGIN_ENTRY_FILE;
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Find every `<dir>/<name>/main.lua`, in lexical path order
///
/// A missing plugin directory simply means no scripted plugins.
pub fn discover_plugins(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.exists() {
        crate::log_debug!("Plugin directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read plugin directory {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        if path.is_dir() && path.join(PLUGIN_ENTRY_FILE).is_file() {
            found.push(path);
        }
    }

    found.sort();
    Ok(found)
}

/// Load every scripted plugin under `dir`
///
/// The first failure closes the plugins loaded before it.
pub fn load_scripted_plugins(dir: &Path) -> anyhow::Result<Vec<Arc<dyn Plugin>>> {
    let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();

    for path in discover_plugins(dir)? {
        match ScriptedPlugin::load(&path) {
            Ok(plugin) => plugins.push(Arc::new(plugin)),
            Err(e) => {
                close_plugins(&plugins);
                return Err(e).with_context(|| format!("Failed to load plugin {}", path.display()));
            }
        }
    }

    if !plugins.is_empty() {
        crate::log_info!("Loaded {} Lua plugin(s) from {}", plugins.len(), dir.display());
    }
    Ok(plugins)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_plugin(root: &Path, name: &str, script: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PLUGIN_ENTRY_FILE), script).unwrap();
    }

    #[test]
    fn test_discovery_is_sorted_and_requires_entry_file() {
        let temp = tempfile::TempDir::new().unwrap();
        write_plugin(temp.path(), "zeta", "");
        write_plugin(temp.path(), "alpha", "");
        fs::create_dir_all(temp.path().join("no-entry")).unwrap();
        fs::write(temp.path().join("stray.lua"), "").unwrap();

        let found = discover_plugins(temp.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(discover_plugins(&temp.path().join("absent")).unwrap().is_empty());
        assert!(load_scripted_plugins(&temp.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn test_load_failure_names_the_plugin() {
        let temp = tempfile::TempDir::new().unwrap();
        write_plugin(temp.path(), "good", r#"postern.set_filter("shout", function(s) return s:upper() end)"#);
        write_plugin(temp.path(), "bad", "this is not lua");

        let error = load_scripted_plugins(temp.path()).err().unwrap();
        assert!(format!("{:#}", error).contains("bad"));

        std::fs::remove_dir_all(temp.path().join("bad")).unwrap();
        let plugins = load_scripted_plugins(temp.path()).unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name(), "good");
    }
}
