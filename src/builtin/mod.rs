// Postern - Built-in Plugins
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Plugins compiled into the server and the loader table run on every reload

pub mod base;
pub mod viewhtml;

use crate::plugins::{LoaderRegistry, load_scripted_plugins};

/// Loaders in the order their plugins appear in each generation:
/// the native plugins first, then the Lua plugins from the plugin directory
pub fn loaders() -> LoaderRegistry {
    let mut registry = LoaderRegistry::new();
    registry.register("base", |_| Ok(vec![base::plugin()]));
    registry.register("viewhtml", |_| Ok(vec![viewhtml::plugin()]));
    registry.register("lua", |ctx| load_scripted_plugins(&ctx.config.plugins.dir));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mail::{MemoryMailbox, MemorySessions, Message, MessagePart};
    use crate::web::{Coordinator, ServerContext, testing};
    use axum::http::{StatusCode, header};
    use std::path::Path;
    use std::sync::Arc;
    use tower::ServiceExt;

    #[test]
    fn test_loader_order() {
        assert_eq!(loaders().names(), vec!["base", "viewhtml", "lua"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bundled_theme_and_demo_plugin() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR"));
        let mut config = Config::default();
        config.ui.themes_path = root.join("themes");
        config.plugins.dir = root.join("demos").join("plugins");

        let mailbox = Arc::new(MemoryMailbox::new());
        mailbox.insert(
            "alice",
            Message::new("INBOX", 1, "Lunch", "bob@example.com")
                .with_part(MessagePart::new("1", "text/html", "<p>Noon?</p>"))
                .with_part(MessagePart::new("2", "application/pdf", "%PDF").with_filename("menu.pdf")),
        );
        let state = Arc::new(
            ServerContext::new(Arc::new(config), mailbox, Arc::new(MemorySessions::new())).unwrap(),
        );
        let coordinator = Coordinator::start(state.clone(), loaders()).await.unwrap();
        let cookie = testing::login(&state, "alice");
        let router = coordinator.router();

        let response = router
            .clone()
            .oneshot(testing::get("/message/INBOX/1", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = testing::body_string(response).await;
        assert!(body.contains("<p>Noon?</p>"));
        assert!(body.contains("menu.pdf</a> (4 B)"));

        let response = router.clone().oneshot(testing::get("/hello/bob", None)).await.unwrap();
        assert_eq!(testing::body_string(response).await, "Hello, bob");

        let response = router
            .clone()
            .oneshot(testing::get("/plugins/hello/assets/hello.css", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router.oneshot(testing::get("/hello", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/hello/world");

        coordinator.shutdown().await;
    }
}
