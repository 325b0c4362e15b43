// Postern - Script Host API
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Host API exposed to plugin scripts
//!
//! The `postern` global carries the three registration calls:
//! - `postern.on_render(view, function(data, ctx) ... end)`
//! - `postern.set_filter(name, function(...) return value end)`
//! - `postern.set_route(method, path, function(ctx) ... end)`
//!
//! Host objects reach scripts as userdata handles sharing state with the
//! host, so changes made by a script are visible once the call returns.

use crate::web::{RenderData, RequestContext};
use axum::body::{Body, Bytes};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::MethodFilter;
use mlua::{
    Function, Lua, LuaSerdeExt, MetaMethod, SerializeOptions, UserData, UserDataFields,
    UserDataMethods, Value,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Name of the host table in the script's globals
pub const HOST_TABLE: &str = "postern";

/// Lock a host mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ScriptRoute {
    /// Upper-case method name as registered
    pub method: String,
    pub filter: MethodFilter,
    pub path: String,
    pub function: Function,
}

/// Registrations made by one script
#[derive(Default)]
pub struct ScriptTables {
    pub render_hooks: HashMap<String, Function>,
    pub filters: Vec<(String, Function)>,
    pub routes: Vec<ScriptRoute>,
    /// Set once the script finished loading; later registrations are refused
    pub sealed: bool,
}

impl ScriptTables {
    fn check_open(&self) -> mlua::Result<()> {
        if self.sealed {
            return Err(mlua::Error::runtime(
                "registrations are only accepted while the plugin script loads",
            ));
        }
        Ok(())
    }
}

pub fn parse_method(method: &str) -> Option<MethodFilter> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "PATCH" => Some(MethodFilter::PATCH),
        "DELETE" => Some(MethodFilter::DELETE),
        "HEAD" => Some(MethodFilter::HEAD),
        "OPTIONS" => Some(MethodFilter::OPTIONS),
        _ => None,
    }
}

/// Install the `postern` table into a script's globals
pub fn register_host_api(lua: &Lua, tables: Arc<Mutex<ScriptTables>>) -> mlua::Result<()> {
    let host = lua.create_table()?;

    let hook_tables = Arc::clone(&tables);
    let on_render = lua.create_function(move |_, (view, function): (String, Function)| {
        let mut tables = lock(&hook_tables);
        tables.check_open()?;
        if view.is_empty() {
            return Err(mlua::Error::runtime("view name cannot be empty"));
        }
        tables.render_hooks.insert(view, function);
        Ok(())
    })?;
    host.set("on_render", on_render)?;

    let filter_tables = Arc::clone(&tables);
    let set_filter = lua.create_function(move |_, (name, function): (String, Function)| {
        let mut tables = lock(&filter_tables);
        tables.check_open()?;
        if !is_identifier(&name) {
            return Err(mlua::Error::runtime(format!("invalid filter name '{}'", name)));
        }
        match tables.filters.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = function,
            None => tables.filters.push((name, function)),
        }
        Ok(())
    })?;
    host.set("set_filter", set_filter)?;

    let set_route = lua.create_function(move |_, (method, path, function): (String, String, Function)| {
        let mut tables = lock(&tables);
        tables.check_open()?;
        let filter = parse_method(&method)
            .ok_or_else(|| mlua::Error::runtime(format!("unsupported HTTP method '{}'", method)))?;
        if !path.starts_with('/') {
            return Err(mlua::Error::runtime(format!("route path '{}' must start with '/'", path)));
        }
        tables.routes.push(ScriptRoute {
            method: method.to_ascii_uppercase(),
            filter,
            path,
            function,
        });
        Ok(())
    })?;
    host.set("set_route", set_route)?;

    lua.globals().set(HOST_TABLE, host)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Convert a host value into a Lua value; `None` and JSON null become `nil`
pub fn to_lua<T: Serialize + ?Sized>(lua: &Lua, value: &T) -> mlua::Result<Value> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    lua.to_value_with(value, options)
}

/// Handle on the render data bag
#[derive(Clone)]
pub struct RenderDataHandle(pub Arc<Mutex<RenderData>>);

impl UserData for RenderDataHandle {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("title", |_, this| Ok(lock(&this.0).title.clone()));
        fields.add_field_method_set("title", |_, this, title: String| {
            lock(&this.0).title = title;
            Ok(())
        });
        fields.add_field_method_get("user", |_, this| Ok(lock(&this.0).user.clone()));
        fields.add_field_method_get("notice", |_, this| Ok(lock(&this.0).notice.clone()));
        fields.add_field_method_set("notice", |_, this, notice: Option<String>| {
            lock(&this.0).notice = notice;
            Ok(())
        });
        fields.add_field_method_get("view", |lua, this| to_lua(lua, &lock(&this.0).view));
        fields.add_field_method_get("extra", |_, this| Ok(ExtraHandle(Arc::clone(&this.0))));
    }
}

/// Handle on `data.extra`, readable and writable key by key
#[derive(Clone)]
pub struct ExtraHandle(pub Arc<Mutex<RenderData>>);

impl UserData for ExtraHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            to_lua(lua, &lock(&this.0).extra.get(&key))
        });
        methods.add_meta_method(MetaMethod::NewIndex, |lua, this, (key, value): (String, Value)| {
            let mut data = lock(&this.0);
            if value.is_nil() {
                data.extra.remove(&key);
            } else {
                let value: serde_json::Value = lua.from_value(value)?;
                data.extra.insert(key, value);
            }
            Ok(())
        });
    }
}

/// What a script route handler answers
#[derive(Debug)]
pub struct ScriptResponse {
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: String,
}

impl Default for ScriptResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: String::new(),
        }
    }
}

impl ScriptResponse {
    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.retain(|(existing, _)| *existing != name);
        self.headers.push((name, value));
    }
}

impl IntoResponse for ScriptResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, Body::from(self.body)).into_response();
        for (name, value) in self.headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}

/// State shared between the host and a script during one call
pub struct ScriptExchange {
    pub ctx: RequestContext,
    pub params: HashMap<String, String>,
    pub body: Bytes,
    /// Response methods are only usable from route handlers
    pub writable: bool,
    pub response: ScriptResponse,
}

impl ScriptExchange {
    pub fn for_hook(ctx: RequestContext) -> Self {
        Self {
            ctx,
            params: HashMap::new(),
            body: Bytes::new(),
            writable: false,
            response: ScriptResponse::default(),
        }
    }

    pub fn for_route(ctx: RequestContext, params: HashMap<String, String>, body: Bytes) -> Self {
        Self {
            ctx,
            params,
            body,
            writable: true,
            response: ScriptResponse::default(),
        }
    }

    fn respond(&mut self, status: u16, content_type: &'static str, body: String) -> mlua::Result<()> {
        self.check_writable()?;
        self.response.status = parse_status(status)?;
        self.response
            .set_header(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.response.body = body;
        Ok(())
    }

    fn check_writable(&self) -> mlua::Result<()> {
        if !self.writable {
            return Err(mlua::Error::runtime(
                "response methods are only available in route handlers",
            ));
        }
        Ok(())
    }
}

fn parse_status(status: u16) -> mlua::Result<StatusCode> {
    StatusCode::from_u16(status)
        .map_err(|_| mlua::Error::runtime(format!("invalid HTTP status {}", status)))
}

/// Handle on the request context passed to hooks and route handlers
#[derive(Clone)]
pub struct ContextHandle(pub Arc<Mutex<ScriptExchange>>);

impl UserData for ContextHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("method", |_, this, ()| Ok(lock(&this.0).ctx.method.to_string()));
        methods.add_method("path", |_, this, ()| Ok(lock(&this.0).ctx.path.clone()));
        methods.add_method("param", |_, this, name: String| {
            Ok(lock(&this.0).params.get(&name).cloned())
        });
        methods.add_method("query", |_, this, name: String| {
            Ok(lock(&this.0).ctx.query(&name).map(str::to_string))
        });
        methods.add_method("header", |_, this, name: String| {
            Ok(lock(&this.0).ctx.header(&name).map(str::to_string))
        });
        methods.add_method("user", |_, this, ()| Ok(lock(&this.0).ctx.user.clone()));
        methods.add_method("get", |lua, this, key: String| {
            to_lua(lua, &lock(&this.0).ctx.value(&key))
        });
        methods.add_method("body", |lua, this, ()| lua.create_string(&lock(&this.0).body));

        methods.add_method("string", |_, this, (status, text): (u16, String)| {
            lock(&this.0).respond(status, "text/plain; charset=utf-8", text)
        });
        methods.add_method("html", |_, this, (status, text): (u16, String)| {
            lock(&this.0).respond(status, "text/html; charset=utf-8", text)
        });
        methods.add_method("redirect", |_, this, (status, target): (u16, String)| {
            let mut exchange = lock(&this.0);
            exchange.check_writable()?;
            let status = parse_status(status)?;
            if !status.is_redirection() {
                return Err(mlua::Error::runtime(format!("{} is not a redirect status", status)));
            }
            let location = HeaderValue::from_str(&target)
                .map_err(|_| mlua::Error::runtime(format!("invalid redirect target '{}'", target)))?;
            exchange.response.status = status;
            exchange.response.set_header(header::LOCATION, location);
            Ok(())
        });
        methods.add_method("set_header", |_, this, (name, value): (String, String)| {
            let mut exchange = lock(&this.0);
            exchange.check_writable()?;
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| mlua::Error::runtime(format!("invalid header name '{}'", name)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| mlua::Error::runtime(format!("invalid value for header '{}'", name)))?;
            exchange.response.set_header(name, value);
            Ok(())
        });
    }
}
