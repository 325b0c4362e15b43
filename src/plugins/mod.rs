// Postern - Plugin System
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Plugin system for routes, render hooks and template functions
//!
//! Plugins come in two flavours behind the same [`Plugin`] trait:
//! - native plugins compiled into the binary ([`NativePlugin`])
//! - Lua plugins discovered in the plugin directory ([`ScriptedPlugin`])
//!
//! # Lua Plugin Structure
//!
//! Each plugin is a directory containing:
//! - `main.lua` - entry script, executed once at load time
//! - `public/*.html` - optional template fragments
//! - `public/assets/` - optional static files served under `/plugins/<name>/assets`
//!
//! # Security
//!
//! Scripts run in a sandbox with:
//! - No file I/O, process or network access
//! - No dynamic code loading
//! - A memory limit
//! - Only the `postern` host table for registration

pub mod api;
pub mod loader;
pub mod native;
pub mod plugin;
pub mod registry;
pub mod sandbox;
pub mod scripted;

pub use loader::{discover_plugins, load_scripted_plugins};
pub use native::NativePlugin;
pub use plugin::{Plugin, WILDCARD_VIEW};
pub use registry::{LoaderRegistry, close_plugins};
pub use scripted::ScriptedPlugin;
