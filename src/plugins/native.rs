// Postern - Native Plugins
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process implementation of the plugin contract for compiled-in extensions

use super::plugin::Plugin;
use crate::web::{AppState, RenderData, RequestContext, TemplateFunction};
use axum::Router;
use axum::routing::MethodRouter;
use minijinja::value::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub type HookFn = Arc<dyn Fn(&RequestContext, &mut RenderData) -> anyhow::Result<()> + Send + Sync>;
type CloseFn = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// A route owned by one plugin
pub struct RouteRegistration {
    pub path: String,
    pub handler: MethodRouter<AppState>,
}

/// Plugin assembled from Rust closures and handlers
///
/// ```ignore
/// let plugin = NativePlugin::new("greeter")
///     .route("/hello", get(hello))
///     .on_render("*", |_ctx, data| {
///         data.extra.insert("greeting".into(), "hello".into());
///         Ok(())
///     })
///     .into_plugin();
/// ```
pub struct NativePlugin {
    name: String,
    routes: Vec<RouteRegistration>,
    hooks: Vec<(String, HookFn)>,
    functions: Vec<(String, TemplateFunction)>,
    on_close: Option<CloseFn>,
    closed: AtomicBool,
}

impl NativePlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            routes: Vec::new(),
            hooks: Vec::new(),
            functions: Vec::new(),
            on_close: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn route(mut self, path: &str, handler: MethodRouter<AppState>) -> Self {
        self.routes.push(RouteRegistration {
            path: path.to_string(),
            handler,
        });
        self
    }

    /// Register a render hook for `view`, or for every view with `"*"`
    pub fn on_render<F>(mut self, view: &str, hook: F) -> Self
    where
        F: Fn(&RequestContext, &mut RenderData) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.push((view.to_string(), Arc::new(hook)));
        self
    }

    pub fn template_function<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.functions.push((name.to_string(), Arc::new(function)));
        self
    }

    pub fn on_close<F>(mut self, close: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_close = Some(Box::new(close));
        self
    }

    pub fn into_plugin(self) -> Arc<dyn Plugin> {
        Arc::new(self)
    }
}

impl Plugin for NativePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_routes(&self, router: Router<AppState>) -> Router<AppState> {
        self.routes.iter().fold(router, |router, route| {
            router.route(&route.path, route.handler.clone())
        })
    }

    fn inject(&self, ctx: &RequestContext, view: &str, data: &mut RenderData) -> anyhow::Result<()> {
        for (_, hook) in self.hooks.iter().filter(|(name, _)| name == view) {
            hook(ctx, data)?;
        }
        Ok(())
    }

    fn template_functions(&self) -> Vec<(String, TemplateFunction)> {
        self.functions.clone()
    }

    fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Plugin '{}' is already closed", self.name));
        }

        match &self.on_close {
            Some(close) => close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::plugin::WILDCARD_VIEW;
    use axum::http::{HeaderMap, Method};
    use std::sync::atomic::AtomicUsize;

    fn ctx() -> RequestContext {
        RequestContext::new(Method::GET, &"/".parse().unwrap(), HeaderMap::new())
    }

    #[test]
    fn test_inject_runs_only_matching_hooks_in_order() {
        let plugin = NativePlugin::new("order")
            .on_render("inbox.html", |_, data| {
                data.title.push('a');
                Ok(())
            })
            .on_render(WILDCARD_VIEW, |_, data| {
                data.title.push('*');
                Ok(())
            })
            .on_render("inbox.html", |_, data| {
                data.title.push('b');
                Ok(())
            });

        let mut data = RenderData::default();
        plugin.inject(&ctx(), "inbox.html", &mut data).unwrap();
        assert_eq!(data.title, "ab");

        plugin.inject(&ctx(), WILDCARD_VIEW, &mut data).unwrap();
        assert_eq!(data.title, "ab*");
    }

    #[test]
    fn test_hook_error_stops_later_hooks() {
        let plugin = NativePlugin::new("failing")
            .on_render("v", |_, _| Err(anyhow::anyhow!("no mailbox")))
            .on_render("v", |_, data| {
                data.title = "unreachable".to_string();
                Ok(())
            });

        let mut data = RenderData::default();
        assert!(plugin.inject(&ctx(), "v", &mut data).is_err());
        assert!(data.title.is_empty());
    }

    #[test]
    fn test_close_runs_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let plugin = NativePlugin::new("closing").on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(plugin.close().is_ok());
        assert!(plugin.close().is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
