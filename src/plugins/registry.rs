// Postern - Plugin Loader Registry
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ordered collection of loader functions producing plugin instances
//!
//! Loaders are registered once at process start. Every reload runs them all
//! again, in registration order, to produce a fresh set of plugins.

use super::plugin::Plugin;
use crate::web::AppState;
use anyhow::Context;
use std::sync::Arc;

pub type LoadFn = dyn Fn(&AppState) -> anyhow::Result<Vec<Arc<dyn Plugin>>> + Send + Sync;

pub struct PluginLoader {
    name: String,
    load: Arc<LoadFn>,
}

impl PluginLoader {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
pub struct LoaderRegistry {
    loaders: Vec<PluginLoader>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, load: F)
    where
        F: Fn(&AppState) -> anyhow::Result<Vec<Arc<dyn Plugin>>> + Send + Sync + 'static,
    {
        crate::log_debug!("Registered plugin loader '{}'", name);
        self.loaders.push(PluginLoader {
            name: name.to_string(),
            load: Arc::new(load),
        });
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.loaders.iter().map(PluginLoader::name).collect()
    }

    /// Run every loader in order
    ///
    /// If any loader fails, the plugins produced by the loaders before it are
    /// closed and the error is returned.
    pub fn load_all(&self, ctx: &AppState) -> anyhow::Result<Vec<Arc<dyn Plugin>>> {
        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();

        for loader in &self.loaders {
            match (loader.load)(ctx) {
                Ok(loaded) => {
                    crate::log_debug!("Loader '{}' produced {} plugin(s)", loader.name, loaded.len());
                    plugins.extend(loaded);
                }
                Err(e) => {
                    close_plugins(&plugins);
                    return Err(e).with_context(|| format!("Plugin loader '{}' failed", loader.name));
                }
            }
        }

        Ok(plugins)
    }
}

/// Close every plugin, logging failures instead of stopping
pub fn close_plugins(plugins: &[Arc<dyn Plugin>]) {
    for plugin in plugins {
        if let Err(e) = plugin.close() {
            crate::log_warn!("Failed to close plugin '{}': {:#}", plugin.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::native::NativePlugin;
    use crate::web::testing;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_plugin(name: &str, closes: &Arc<AtomicUsize>) -> Arc<dyn Plugin> {
        let closes = Arc::clone(closes);
        NativePlugin::new(name)
            .on_close(move || {
                closes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .into_plugin()
    }

    #[test]
    fn test_loaders_run_in_registration_order() {
        let temp = tempfile::TempDir::new().unwrap();
        let ctx = testing::context(temp.path());
        let closes = Arc::new(AtomicUsize::new(0));

        let mut registry = LoaderRegistry::new();
        let c = Arc::clone(&closes);
        registry.register("first", move |_| Ok(vec![counting_plugin("a", &c), counting_plugin("b", &c)]));
        registry.register("empty", |_| Ok(Vec::new()));
        let c = Arc::clone(&closes);
        registry.register("last", move |_| Ok(vec![counting_plugin("c", &c)]));

        assert_eq!(registry.names(), vec!["first", "empty", "last"]);

        let plugins = registry.load_all(&ctx).unwrap();
        let names: Vec<&str> = plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_loader_closes_earlier_plugins() {
        let temp = tempfile::TempDir::new().unwrap();
        let ctx = testing::context(temp.path());
        let closes = Arc::new(AtomicUsize::new(0));

        let mut registry = LoaderRegistry::new();
        let c = Arc::clone(&closes);
        registry.register("first", move |_| Ok(vec![counting_plugin("a", &c), counting_plugin("b", &c)]));
        registry.register("broken", |_| Err(anyhow::anyhow!("disk on fire")));

        let error = registry.load_all(&ctx).err().unwrap();
        let message = format!("{:#}", error);
        assert!(message.contains("Plugin loader 'broken' failed"));
        assert!(message.contains("disk on fire"));
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }
}
