// Postern - Scripted Plugins
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Plugins backed by one sandboxed Lua state each
//!
//! A plugin directory holds a `main.lua` entry script, optional template
//! fragments in `public/*.html` and optional static files in `public/assets`.
//! The script runs once at load time and registers its hooks, filters and
//! routes through the `postern` host table.
//!
//! Calls into one plugin are serialized by its interpreter lock. Every call
//! maps script errors into ordinary host errors carrying the script message.

use super::api::{
    ContextHandle, RenderDataHandle, ScriptExchange, ScriptResponse, ScriptTables, lock,
    register_host_api,
};
use super::plugin::Plugin;
use super::sandbox::create_sandbox;
use crate::config::{PLUGIN_ASSETS_DIR, PLUGIN_ENTRY_FILE, PLUGIN_PUBLIC_DIR};
use crate::web::{AppError, AppState, RenderData, Renderer, RequestContext, TemplateFunction};
use anyhow::Context;
use axum::Router;
use axum::body::Bytes;
use axum::extract::Path as RoutePath;
use axum::response::IntoResponse;
use axum::routing::on;
use minijinja::value::Value as TemplateValue;
use mlua::{Function, Lua, LuaSerdeExt};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tower_http::services::ServeDir;

/// Interpreter and registrations of one script, shared with its handlers
struct ScriptState {
    name: String,
    closed: AtomicBool,
    lua: Mutex<Option<Lua>>,
    tables: Arc<Mutex<ScriptTables>>,
}

impl ScriptState {
    /// Run `f` against the interpreter while holding its lock
    fn with_lua<R>(&self, f: impl FnOnce(&Lua) -> mlua::Result<R>) -> anyhow::Result<R> {
        let guard = lock(&self.lua);
        let lua = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Lua plugin '{}' is closed", self.name))?;

        f(lua).map_err(|e| anyhow::anyhow!("Lua plugin '{}' error: {}", self.name, e))
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Lua plugin '{}' is closed", self.name));
        }
        Ok(())
    }

    fn render_hook(&self, view: &str) -> anyhow::Result<Option<Function>> {
        self.ensure_open()?;
        Ok(lock(&self.tables).render_hooks.get(view).cloned())
    }

    fn call_filter(&self, name: &str, args: &[TemplateValue]) -> anyhow::Result<TemplateValue> {
        self.ensure_open()?;
        let function = lock(&self.tables)
            .filters
            .iter()
            .find(|(filter, _)| filter == name)
            .map(|(_, function)| function.clone())
            .ok_or_else(|| anyhow::anyhow!("Lua plugin '{}' has no filter '{}'", self.name, name))?;

        let result: serde_json::Value = self.with_lua(|lua| {
            let args = args
                .iter()
                .map(|arg| super::api::to_lua(lua, arg))
                .collect::<mlua::Result<mlua::MultiValue>>()?;
            let value: mlua::Value = function.call(args)?;
            lua.from_value(value)
        })?;

        Ok(TemplateValue::from_serialize(&result))
    }

    fn call_route(&self, index: usize, exchange: ScriptExchange) -> anyhow::Result<ScriptResponse> {
        self.ensure_open()?;
        let function = lock(&self.tables)
            .routes
            .get(index)
            .map(|route| route.function.clone())
            .ok_or_else(|| anyhow::anyhow!("Lua plugin '{}' has no route #{}", self.name, index))?;

        let shared = Arc::new(Mutex::new(exchange));
        self.with_lua(|lua| {
            let ctx = lua.create_userdata(ContextHandle(Arc::clone(&shared)))?;
            function.call::<()>(ctx)
        })?;

        let response = std::mem::take(&mut lock(&shared).response);
        Ok(response)
    }
}

pub struct ScriptedPlugin {
    dir: PathBuf,
    state: Arc<ScriptState>,
}

impl ScriptedPlugin {
    /// Load the plugin in `dir`; the plugin is named after the directory
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid plugin directory {}", dir.display()))?
            .to_string();

        let entry = dir.join(PLUGIN_ENTRY_FILE);
        let code = fs::read_to_string(&entry)
            .with_context(|| format!("Failed to read {}", entry.display()))?;

        let tables = Arc::new(Mutex::new(ScriptTables::default()));
        let lua = create_sandbox(&name)
            .map_err(|e| anyhow::anyhow!("Failed to create Lua state for '{}': {}", name, e))?;
        register_host_api(&lua, Arc::clone(&tables))
            .map_err(|e| anyhow::anyhow!("Failed to register host API for '{}': {}", name, e))?;

        lua.load(code.as_str())
            .set_name(format!("@{}", entry.display()))
            .exec()
            .map_err(|e| anyhow::anyhow!("Failed to execute plugin '{}': {}", name, e))?;

        let summary = {
            let mut registered = lock(&tables);
            registered.sealed = true;
            format!(
                "{} hook(s), {} filter(s), {} route(s)",
                registered.render_hooks.len(),
                registered.filters.len(),
                registered.routes.len()
            )
        };
        crate::log_info!("Loaded Lua plugin '{}' ({})", name, summary);

        Ok(Self {
            dir: dir.to_path_buf(),
            state: Arc::new(ScriptState {
                name,
                closed: AtomicBool::new(false),
                lua: Mutex::new(Some(lua)),
                tables,
            }),
        })
    }

    fn public_dir(&self) -> PathBuf {
        self.dir.join(PLUGIN_PUBLIC_DIR)
    }
}

impl Plugin for ScriptedPlugin {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn set_routes(&self, mut router: Router<AppState>) -> Router<AppState> {
        let routes: Vec<_> = lock(&self.state.tables)
            .routes
            .iter()
            .enumerate()
            .map(|(index, route)| (index, route.method.clone(), route.filter, route.path.clone()))
            .collect();

        for (index, method, filter, path) in routes {
            let state = Arc::clone(&self.state);
            let handler = move |params: Option<RoutePath<HashMap<String, String>>>,
                                ctx: RequestContext,
                                body: Bytes| {
                let state = Arc::clone(&state);
                async move {
                    let params = params.map(|RoutePath(params)| params).unwrap_or_default();
                    let exchange = ScriptExchange::for_route(ctx, params, body);

                    match tokio::task::spawn_blocking(move || state.call_route(index, exchange)).await {
                        Ok(Ok(response)) => response.into_response(),
                        Ok(Err(e)) => AppError::Internal(e).into_response(),
                        Err(e) => AppError::Internal(anyhow::anyhow!("Lua route task failed: {}", e))
                            .into_response(),
                    }
                }
            };

            crate::log_debug!("Plugin '{}' serves {} {}", self.state.name, method, path);
            router = router.route(&path, on(filter, handler));
        }

        let assets = self.public_dir().join(PLUGIN_ASSETS_DIR);
        if assets.is_dir() {
            router = router.nest_service(
                &format!("/plugins/{}/assets", self.state.name),
                ServeDir::new(assets),
            );
        }

        router
    }

    fn inject(&self, ctx: &RequestContext, view: &str, data: &mut RenderData) -> anyhow::Result<()> {
        let Some(hook) = self.state.render_hook(view)? else {
            return Ok(());
        };

        let bag = Arc::new(Mutex::new(std::mem::take(data)));
        let exchange = Arc::new(Mutex::new(ScriptExchange::for_hook(ctx.clone())));
        let result = self.state.with_lua(|lua| {
            let data = lua.create_userdata(RenderDataHandle(Arc::clone(&bag)))?;
            let ctx = lua.create_userdata(ContextHandle(exchange))?;
            hook.call::<()>((data, ctx))
        });

        // The bag goes back to the caller even when the hook failed
        *data = std::mem::take(&mut *lock(&bag));
        result
    }

    fn template_functions(&self) -> Vec<(String, TemplateFunction)> {
        let names: Vec<String> = lock(&self.state.tables)
            .filters
            .iter()
            .map(|(name, _)| name.clone())
            .collect();

        names
            .into_iter()
            .map(|name| {
                let state = Arc::clone(&self.state);
                let filter = name.clone();
                let function: TemplateFunction =
                    Arc::new(move |args: &[TemplateValue]| state.call_filter(&filter, args));
                (name, function)
            })
            .collect()
    }

    fn load_templates(&self, renderer: &mut Renderer) -> anyhow::Result<()> {
        let public = self.public_dir();
        if !public.is_dir() {
            return Ok(());
        }

        let count = renderer
            .add_template_dir(&public)
            .with_context(|| format!("Failed to load templates of plugin '{}'", self.state.name))?;
        crate::log_debug!("Plugin '{}' added {} template(s)", self.state.name, count);
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Lua plugin '{}' is already closed", self.state.name));
        }

        let lua = lock(&self.state.lua).take();
        *lock(&self.state.tables) = ScriptTables::default();
        drop(lua);

        crate::log_debug!("Closed Lua plugin '{}'", self.state.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::plugin::WILDCARD_VIEW;
    use crate::web::testing;
    use axum::body::Body;
    use axum::http::{HeaderMap, Method, Request, StatusCode};
    use tower::ServiceExt;

    fn write_plugin(root: &Path, name: &str, script: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PLUGIN_ENTRY_FILE), script).unwrap();
        dir
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Method::GET, &"/inbox".parse().unwrap(), HeaderMap::new())
    }

    #[test]
    fn test_hooks_mutate_render_data() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = write_plugin(
            temp.path(),
            "greeter",
            r#"
            postern.on_render("*", function(data, ctx)
                data.extra.path = ctx:path()
            end)
            postern.on_render("inbox.html", function(data)
                data.title = data.title .. " (" .. data.extra.path .. ")"
            end)
            "#,
        );
        let plugin = ScriptedPlugin::load(&dir).unwrap();
        assert_eq!(plugin.name(), "greeter");

        let mut data = RenderData::default().with_title("Inbox");
        plugin.inject(&ctx(), WILDCARD_VIEW, &mut data).unwrap();
        plugin.inject(&ctx(), "inbox.html", &mut data).unwrap();
        plugin.inject(&ctx(), "compose.html", &mut data).unwrap();

        assert_eq!(data.title, "Inbox (/inbox)");
        assert_eq!(data.extra["path"], "/inbox");
    }

    #[test]
    fn test_hook_error_keeps_data_and_names_plugin() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = write_plugin(
            temp.path(),
            "broken",
            r#"postern.on_render("v", function(data) data.title = "changed"; error("no quota") end)"#,
        );
        let plugin = ScriptedPlugin::load(&dir).unwrap();

        let mut data = RenderData::default().with_title("original");
        let error = plugin.inject(&ctx(), "v", &mut data).unwrap_err();
        let message = format!("{:#}", error);

        assert!(message.contains("Lua plugin 'broken' error"));
        assert!(message.contains("no quota"));
        assert_eq!(data.title, "changed");
    }

    #[test]
    fn test_filters_become_template_functions() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = write_plugin(
            temp.path(),
            "filters",
            r#"
            postern.set_filter("initials", function(name)
                return (name:gsub("(%a)%a*%s*", "%1"))
            end)
            postern.set_filter("fails", function() error("kaput") end)
            "#,
        );
        let plugin = ScriptedPlugin::load(&dir).unwrap();

        let functions: HashMap<String, TemplateFunction> = plugin.template_functions().into_iter().collect();
        let initials = &functions["initials"];
        let result = initials(&[TemplateValue::from("Ada Lovelace")]).unwrap();
        assert_eq!(result.as_str(), Some("AL"));

        let error = functions["fails"](&[]).unwrap_err();
        assert!(format!("{:#}", error).contains("kaput"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_are_serialized() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = write_plugin(
            temp.path(),
            "counter",
            r#"
            local calls = 0
            local function bump()
                local seen = calls
                for _ = 1, 200 do end
                calls = seen + 1
                return calls
            end
            postern.on_render("v", function(data) data.title = tostring(bump()) end)
            postern.set_filter("bump", function() return bump() end)
            postern.set_filter("calls", function() return calls end)
            "#,
        );
        let plugin = Arc::new(ScriptedPlugin::load(&dir).unwrap());
        let functions: HashMap<String, TemplateFunction> = plugin.template_functions().into_iter().collect();

        let mut tasks = Vec::new();
        for i in 0..64 {
            let plugin = Arc::clone(&plugin);
            let bump = Arc::clone(&functions["bump"]);
            tasks.push(tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                if i % 2 == 0 {
                    let mut data = RenderData::default();
                    plugin.inject(&ctx(), "v", &mut data)?;
                    assert!(data.title.parse::<u32>().is_ok());
                } else {
                    bump(&[])?;
                }
                Ok(())
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(functions["calls"](&[]).unwrap().to_string(), "64");
    }

    #[test]
    fn test_syntax_error_fails_load() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = write_plugin(temp.path(), "typo", "postern.on_render(\"v\", function() end");
        let error = ScriptedPlugin::load(&dir).err().unwrap();
        assert!(format!("{:#}", error).contains("Failed to execute plugin 'typo'"));
    }

    #[test]
    fn test_script_cannot_reach_host() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = write_plugin(temp.path(), "escape", r#"os.execute("true")"#);
        assert!(ScriptedPlugin::load(&dir).is_err());
    }

    #[test]
    fn test_close_disables_every_entry_point() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = write_plugin(
            temp.path(),
            "closing",
            r#"
            postern.on_render("v", function() end)
            postern.set_filter("f", function() return 1 end)
            "#,
        );
        let plugin = ScriptedPlugin::load(&dir).unwrap();
        let functions = plugin.template_functions();

        plugin.close().unwrap();
        assert!(plugin.close().is_err());

        let mut data = RenderData::default();
        assert!(plugin.inject(&ctx(), "v", &mut data).is_err());
        assert!((functions[0].1)(&[]).is_err());
    }

    #[tokio::test]
    async fn test_routes_and_assets_are_served() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = write_plugin(
            temp.path(),
            "hello",
            r#"
            postern.set_route("GET", "/hello/:name", function(ctx)
                ctx:string(200, "hello " .. ctx:param("name"))
            end)
            postern.set_route("POST", "/echo", function(ctx)
                ctx:set_header("X-Echo", "yes")
                ctx:html(202, ctx:body())
            end)
            postern.set_route("GET", "/fail", function(ctx) error("boom") end)
            "#,
        );
        fs::create_dir_all(dir.join("public/assets")).unwrap();
        fs::write(dir.join("public/assets/hello.css"), "h1 { color: pink; }").unwrap();

        let plugin = ScriptedPlugin::load(&dir).unwrap();
        let state = testing::context(temp.path());
        let router = plugin.set_routes(Router::new()).with_state(state);

        let response = router
            .clone()
            .oneshot(Request::get("/hello/world").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(testing::body_string(response).await, "hello world");

        let response = router
            .clone()
            .oneshot(Request::post("/echo").body(Body::from("<p>hi</p>")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()["x-echo"], "yes");
        assert_eq!(testing::body_string(response).await, "<p>hi</p>");

        let response = router
            .clone()
            .oneshot(Request::get("/fail").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = router
            .oneshot(Request::get("/plugins/hello/assets/hello.css").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(testing::body_string(response).await, "h1 { color: pink; }");
    }

    #[test]
    fn test_public_templates_are_loaded() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = write_plugin(temp.path(), "widgets", "");
        fs::create_dir_all(dir.join("public")).unwrap();
        fs::write(dir.join("public/widget.html"), "<aside>{{ title }}</aside>").unwrap();

        let plugin = ScriptedPlugin::load(&dir).unwrap();
        let mut renderer = Renderer::new();
        plugin.load_templates(&mut renderer).unwrap();

        let html = renderer
            .render("widget.html", &RenderData::default().with_title("Quota"))
            .unwrap();
        assert_eq!(html, "<aside>Quota</aside>");
    }
}
