// Postern - Generation Composer
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! A generation is one self-consistent set of plugins together with the
//! router and renderer composed from them.
//!
//! Generations are built wholesale and never modified afterwards; a reload
//! builds a new one and swaps it in (see [`super::coordinator`]).

use super::error::AppError;
use super::render::{RenderData, Renderer};
use super::{AppState, RequestContext};
use crate::plugins::{LoaderRegistry, Plugin, WILDCARD_VIEW, close_plugins};
use anyhow::Context;
use axum::Router;
use axum::http::Uri;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Conflicts between plugins detected while composing a generation
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("template function '{name}' is registered by both '{first}' and '{second}'")]
    DuplicateTemplateFunction {
        name: String,
        first: String,
        second: String,
    },
    #[error("more than one plugin is named '{0}'")]
    DuplicatePluginName(String),
    #[error("plugin '{plugin}' registered conflicting routes: {reason}")]
    RouteConflict { plugin: String, reason: String },
}

pub struct Generation {
    id: u64,
    plugins: Vec<Arc<dyn Plugin>>,
    router: Router,
    renderer: Renderer,
    closed: AtomicBool,
}

impl Generation {
    /// Run every loader and compose their plugins
    ///
    /// On failure every staged plugin is closed and nothing else is touched.
    pub fn build(id: u64, ctx: &AppState, loaders: &LoaderRegistry) -> anyhow::Result<Self> {
        let plugins = loaders.load_all(ctx)?;

        match compose(ctx, &plugins) {
            Ok((router, renderer)) => {
                crate::log_debug!("Composed generation {} from {} plugin(s)", id, plugins.len());
                Ok(Self {
                    id,
                    plugins,
                    router,
                    renderer,
                    closed: AtomicBool::new(false),
                })
            }
            Err(e) => {
                close_plugins(&plugins);
                Err(e)
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Run the wildcard hooks of every plugin, then the hooks of `view`
    pub fn inject_all(&self, ctx: &RequestContext, view: &str, data: &mut RenderData) -> anyhow::Result<()> {
        for plugin in &self.plugins {
            plugin
                .inject(ctx, WILDCARD_VIEW, data)
                .with_context(|| format!("Plugin '{}' failed preparing {}", plugin.name(), view))?;
        }

        if view == WILDCARD_VIEW {
            return Ok(());
        }

        for plugin in &self.plugins {
            plugin
                .inject(ctx, view, data)
                .with_context(|| format!("Plugin '{}' failed preparing {}", plugin.name(), view))?;
        }

        Ok(())
    }

    /// Render `view` after every applicable hook has run
    pub fn render(&self, ctx: &RequestContext, view: &str, mut data: RenderData) -> anyhow::Result<String> {
        self.inject_all(ctx, view, &mut data)?;
        self.renderer.render(view, &data)
    }

    /// [`Self::render`] on the blocking pool
    ///
    /// Hooks and template functions may wait on a script interpreter lock,
    /// so async handlers render through here.
    pub async fn render_blocking(
        self: &Arc<Self>,
        ctx: &RequestContext,
        view: &str,
        data: RenderData,
    ) -> anyhow::Result<String> {
        let generation = Arc::clone(self);
        let ctx = ctx.clone();
        let view = view.to_string();

        tokio::task::spawn_blocking(move || generation.render(&ctx, &view, data))
            .await
            .context("Render task failed")?
    }

    /// Close every plugin of this generation; later calls do nothing
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        close_plugins(&self.plugins);
        crate::log_debug!("Closed generation {}", self.id);
    }
}

fn compose(ctx: &AppState, plugins: &[Arc<dyn Plugin>]) -> anyhow::Result<(Router, Renderer)> {
    let theme = ctx.config.theme_dir();
    let mut renderer = Renderer::from_theme(&theme)
        .with_context(|| format!("Failed to load theme {}", theme.display()))?;

    let mut names = HashSet::new();
    let mut owners: HashMap<String, String> = HashMap::new();

    for plugin in plugins {
        if !names.insert(plugin.name().to_string()) {
            return Err(ComposeError::DuplicatePluginName(plugin.name().to_string()).into());
        }

        for (name, function) in plugin.template_functions() {
            if let Some(first) = owners.get(&name) {
                return Err(ComposeError::DuplicateTemplateFunction {
                    name,
                    first: first.clone(),
                    second: plugin.name().to_string(),
                }
                .into());
            }
            renderer.add_function(&name, function);
            owners.insert(name, plugin.name().to_string());
        }

        plugin
            .load_templates(&mut renderer)
            .with_context(|| format!("Plugin '{}' failed to load templates", plugin.name()))?;
    }

    let mut router = Router::new();
    for plugin in plugins {
        // axum reports overlapping routes by panicking
        router = panic::catch_unwind(AssertUnwindSafe(|| plugin.set_routes(router))).map_err(|payload| {
            ComposeError::RouteConflict {
                plugin: plugin.name().to_string(),
                reason: panic_message(payload.as_ref()),
            }
        })?;
    }

    Ok((router.fallback(not_found).with_state(ctx.clone()), renderer))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown routing error".to_string()
    }
}

async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("Nothing here at {}", uri.path()))
}
