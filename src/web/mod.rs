// Postern - Web Layer
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP side of the server: request context, rendering, the generation
//! composer and the reload coordinator

pub mod context;
pub mod coordinator;
pub mod error;
pub mod generation;
pub mod render;
pub mod server;

pub use context::RequestContext;
pub use coordinator::Coordinator;
pub use error::{AppError, ErrorPage};
pub use generation::{ComposeError, Generation};
pub use render::{RenderData, Renderer, TemplateFunction};

use crate::config::Config;
use crate::mail::{MailboxService, SessionStore};
use std::sync::Arc;

/// Long-lived services shared by every generation
pub struct ServerContext {
    pub config: Arc<Config>,
    pub mailbox: Arc<dyn MailboxService>,
    pub sessions: Arc<dyn SessionStore>,
    /// Client used for outbound fetches (remote image proxy)
    pub http: reqwest::Client,
}

impl ServerContext {
    pub fn new(
        config: Arc<Config>,
        mailbox: Arc<dyn MailboxService>,
        sessions: Arc<dyn SessionStore>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.proxy_timeout())
            .user_agent(concat!("postern/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            config,
            mailbox,
            sessions,
            http,
        })
    }
}

pub type AppState = Arc<ServerContext>;

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::mail::{MemoryMailbox, MemorySessions};
    use axum::body::Body;
    use axum::response::Response;
    use std::fs;
    use std::path::Path;

    /// Templates of the theme used by tests
    pub const THEME: &[(&str, &str)] = &[
        (
            "base.html",
            "<title>{{ title }}</title>{% if notice %}<p>notice={{ notice }}</p>{% endif %}{% block body %}{% endblock %}",
        ),
        (
            "message.html",
            "{% extends \"base.html\" %}{% block body %}\
             <h1>{{ message.subject }}</h1>\
             <p>remote={{ extra.HasRemoteResources|lower }} allowed={{ extra.RemoteResourcesAllowed|lower }}</p>\
             {% if html %}<div>{{ html|safe }}</div>{% else %}<pre>{{ text }}</pre>{% endif %}\
             {% endblock %}",
        ),
        ("error.html", "error {{ code }} {{ status }}: {{ message }}"),
        ("v.html", "{{ title }}|{{ extra.seen }}"),
    ];

    pub fn write_theme(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        for (name, source) in THEME {
            fs::write(dir.join(name), source).unwrap();
        }
    }

    /// Server context rooted in a temporary directory
    ///
    /// Themes live in `<root>/themes/default`, scripted plugins in `<root>/plugins`.
    pub fn context(root: &Path) -> AppState {
        context_with_mailbox(root, Arc::new(MemoryMailbox::new()))
    }

    pub fn context_with_mailbox(root: &Path, mailbox: Arc<MemoryMailbox>) -> AppState {
        let mut config = Config::default();
        config.ui.themes_path = root.join("themes");
        config.plugins.dir = root.join("plugins");
        config.proxy.enabled = true;
        write_theme(&config.theme_dir());

        Arc::new(
            ServerContext::new(Arc::new(config), mailbox, Arc::new(MemorySessions::new())).unwrap(),
        )
    }

    /// Cookie header value for a fresh session of `user`
    pub fn login(state: &AppState, user: &str) -> String {
        let token = state.sessions.create(user);
        format!("{}={}", state.config.security.cookie_name, token)
    }

    pub async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    pub fn get(uri: &str, cookie: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::get(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(axum::http::header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }
}
