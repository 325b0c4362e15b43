// Postern - Request Context
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-request view of the caller handed to handlers and render hooks

use super::AppState;
use crate::mail::{NOTICE_KEY, SessionStore};
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Uri, header};
use std::collections::HashMap;
use std::convert::Infallible;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    /// Logged-in user resolved from the session cookie
    pub user: Option<String>,
    /// Token of the session `user` was resolved from
    pub session: Option<String>,
    /// Facts handlers pass on to render hooks, e.g. `viewhtml.has_remote_resources`
    pub values: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    /// Context without a session
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap) -> Self {
        let query = uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        Self {
            method,
            path: uri.path().to_string(),
            query,
            headers,
            user: None,
            session: None,
            values: HashMap::new(),
        }
    }

    /// Context with the session resolved through the session store
    pub fn resolve(method: Method, uri: &Uri, headers: HeaderMap, state: &AppState) -> Self {
        let mut ctx = Self::new(method, uri, headers);

        if let Some(token) = ctx.cookie(&state.config.security.cookie_name) {
            let token = token.to_string();
            ctx.user = state.sessions.username(&token);
            if ctx.user.is_some() {
                ctx.session = Some(token);
            }
        }

        ctx
    }

    /// Take the one-shot flash notice out of the session
    ///
    /// Only views that render a page call this, so asset and image requests
    /// leave the notice for the next page.
    pub fn take_notice(&self, sessions: &dyn SessionStore) -> Option<String> {
        let token = self.session.as_deref()?;
        sessions.remove(token, NOTICE_KEY)
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn set_value(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Boolean value set by a handler, `false` when absent
    pub fn flag(&self, key: &str) -> bool {
        self.value(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Ok(Self::resolve(
            parts.method.clone(),
            &parts.uri,
            parts.headers.clone(),
            state,
        ))
    }
}
