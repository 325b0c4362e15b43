// Postern - Configuration
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Listener defaults
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:1323";

// Theme configuration
pub const DEFAULT_THEMES_PATH: &str = "./themes";
pub const DEFAULT_THEME: &str = "default";

// Scripted plugin layout: <plugin dir>/<name>/main.lua
pub const DEFAULT_PLUGIN_DIR: &str = "./plugins";
pub const PLUGIN_ENTRY_FILE: &str = "main.lua";
pub const PLUGIN_PUBLIC_DIR: &str = "public";
pub const PLUGIN_ASSETS_DIR: &str = "assets";

/// Memory limit for a single script interpreter (16 MiB)
pub const SCRIPT_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

// Remote image proxy
pub const PROXY_MAX_SIZE: u64 = 5 * 1024 * 1024; // 5 MiB
pub const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_COOKIE_NAME: &str = "postern_session";

/// Remote image proxy switch, overridable from the environment
pub fn proxy_enabled_override() -> Option<bool> {
    std::env::var("POSTERN_PROXY_ENABLED")
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1"))
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Webmail plugin core")]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Enable trace output (extremely verbose)
    #[arg(short, long)]
    pub trace: bool,

    /// Emit journald-formatted log records
    #[arg(long)]
    pub journald: bool,

    /// Directory scanned for scripted plugins
    #[arg(long)]
    pub plugin_dir: Option<PathBuf>,

    /// Directory holding the themes
    #[arg(long)]
    pub themes_path: Option<PathBuf>,

    /// Active theme name
    #[arg(long)]
    pub theme: Option<String>,

    /// Disable the remote image proxy
    #[arg(long)]
    pub disable_proxy: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub ui: UiSection,
    pub plugins: PluginSection,
    pub proxy: ProxySection,
    pub security: SecuritySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UiSection {
    pub themes_path: PathBuf,
    pub theme: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginSection {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub enabled: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub cookie_name: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDRESS.to_string(),
        }
    }
}

impl Default for UiSection {
    fn default() -> Self {
        Self {
            themes_path: PathBuf::from(DEFAULT_THEMES_PATH),
            theme: DEFAULT_THEME.to_string(),
        }
    }
}

impl Default for PluginSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
        }
    }
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: DEFAULT_PROXY_TIMEOUT_SECS,
        }
    }
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
        }
    }
}

impl Config {
    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;

        if config.security.cookie_name.is_empty() {
            return Err(anyhow::anyhow!("security.cookie_name cannot be empty"));
        }

        Ok(config)
    }

    /// Build the effective configuration: file (if any), then CLI flags, then environment
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_cli(cli);

        if let Some(enabled) = proxy_enabled_override() {
            config.proxy.enabled = enabled;
        }

        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(dir) = &cli.plugin_dir {
            self.plugins.dir = dir.clone();
        }
        if let Some(path) = &cli.themes_path {
            self.ui.themes_path = path.clone();
        }
        if let Some(theme) = &cli.theme {
            self.ui.theme = theme.clone();
        }
        if cli.disable_proxy {
            self.proxy.enabled = false;
        }
    }

    /// Directory of the active theme
    pub fn theme_dir(&self) -> PathBuf {
        self.ui.themes_path.join(&self.ui.theme)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, DEFAULT_LISTEN_ADDRESS);
        assert_eq!(config.theme_dir(), PathBuf::from("./themes").join("default"));
        assert!(config.proxy.enabled);
        assert_eq!(config.proxy_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"[ui]
theme = "midnight"

[proxy]
enabled = false
"#,
        )
        .unwrap();

        assert_eq!(config.ui.theme, "midnight");
        assert_eq!(config.ui.themes_path, PathBuf::from(DEFAULT_THEMES_PATH));
        assert!(!config.proxy.enabled);
        assert_eq!(config.proxy.timeout_secs, DEFAULT_PROXY_TIMEOUT_SECS);
        assert_eq!(config.security.cookie_name, DEFAULT_COOKIE_NAME);
    }

    #[test]
    fn test_empty_cookie_name_rejected() {
        let result = Config::from_toml("[security]\ncookie_name = \"\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("postern.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[server]\nlisten = \"127.0.0.1:9000\"\n[plugins]\ndir = \"/srv/plugins\"").unwrap();

        let cli = Cli {
            config: Some(path),
            theme: Some("dark".to_string()),
            disable_proxy: true,
            ..Default::default()
        };
        let mut config = Config::from_file(cli.config.as_deref().unwrap()).unwrap();
        config.apply_cli(&cli);

        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.plugins.dir, PathBuf::from("/srv/plugins"));
        assert_eq!(config.ui.theme, "dark");
        assert!(!config.proxy.enabled);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(Config::from_file(&temp_dir.path().join("absent.toml")).is_err());
    }
}
