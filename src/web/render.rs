// Postern - Template Rendering
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Render data bag and the template environment of one generation

use super::context::RequestContext;
use anyhow::Context;
use minijinja::value::{Rest, Value};
use minijinja::{Environment, ErrorKind};
use serde::Serialize;
use serde_json::Map;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Helper callable from templates, contributed by a plugin
pub type TemplateFunction = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Data a view is rendered with
///
/// The typed base fields are filled by the core before any hook runs.
/// View-specific fields are flattened to the top level of the template
/// context; plugin data lives under `extra`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderData {
    pub title: String,
    pub user: Option<String>,
    pub notice: Option<String>,
    #[serde(flatten)]
    pub view: Map<String, serde_json::Value>,
    pub extra: Map<String, serde_json::Value>,
}

impl RenderData {
    pub fn new(ctx: &RequestContext) -> Self {
        Self {
            user: ctx.user.clone(),
            ..Default::default()
        }
    }

    pub fn with_notice(mut self, notice: Option<String>) -> Self {
        self.notice = notice;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Merge the fields of a JSON object into the view fields
    pub fn with_view(mut self, view: serde_json::Value) -> Self {
        if let serde_json::Value::Object(fields) = view {
            self.view.extend(fields);
        }
        self
    }
}

pub struct Renderer {
    env: Environment<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            env: Environment::new(),
        }
    }

    /// Renderer seeded with every `*.html` template of a theme directory
    pub fn from_theme(dir: &Path) -> anyhow::Result<Self> {
        if !dir.is_dir() {
            return Err(anyhow::anyhow!("Theme directory {} does not exist", dir.display()));
        }

        let mut renderer = Self::new();
        let count = renderer.add_template_dir(dir)?;
        crate::log_debug!("Loaded {} template(s) from {}", count, dir.display());
        Ok(renderer)
    }

    pub fn add_template(&mut self, name: &str, source: &str) -> anyhow::Result<()> {
        self.env
            .add_template_owned(name.to_string(), source.to_string())
            .with_context(|| format!("Failed to parse template {}", name))
    }

    /// Add every `*.html` file of `dir`, named by file name; returns how many
    pub fn add_template_dir(&mut self, dir: &Path) -> anyhow::Result<usize> {
        let mut paths: Vec<_> = fs::read_dir(dir)
            .with_context(|| format!("Failed to read template directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "html"))
            .collect();
        paths.sort();

        for path in &paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let source = fs::read_to_string(path)
                .with_context(|| format!("Failed to read template {}", path.display()))?;
            self.add_template(name, &source)?;
        }

        Ok(paths.len())
    }

    /// Expose a plugin helper both as `name(...)` and as the `|name` filter
    pub fn add_function(&mut self, name: &str, function: TemplateFunction) {
        let as_filter = Arc::clone(&function);

        self.env.add_function(name.to_string(), move |args: Rest<Value>| {
            call_template_function(&function, &args)
        });
        self.env.add_filter(name.to_string(), move |args: Rest<Value>| {
            call_template_function(&as_filter, &args)
        });
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }

    pub fn render(&self, view: &str, data: &RenderData) -> anyhow::Result<String> {
        let template = self
            .env
            .get_template(view)
            .with_context(|| format!("Unknown template {}", view))?;

        template
            .render(data)
            .with_context(|| format!("Failed to render {}", view))
    }
}

fn call_template_function(function: &TemplateFunction, args: &[Value]) -> Result<Value, minijinja::Error> {
    function(args).map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, format!("{:#}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, Method};

    #[test]
    fn test_render_data_layout() {
        let mut ctx = RequestContext::new(Method::GET, &"/".parse().unwrap(), HeaderMap::new());
        ctx.user = Some("alice".to_string());

        let mut data = RenderData::new(&ctx)
            .with_title("Inbox")
            .with_view(serde_json::json!({ "count": 3 }));
        data.extra.insert("HasRemoteResources".to_string(), true.into());

        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["title"], "Inbox");
        assert_eq!(value["user"], "alice");
        assert_eq!(value["count"], 3);
        assert_eq!(value["extra"]["HasRemoteResources"], true);
    }

    #[test]
    fn test_functions_and_filters() {
        let mut renderer = Renderer::new();
        renderer
            .add_template("shout.html", "{{ shout(title) }} {{ title|shout }}")
            .unwrap();
        renderer.add_function(
            "shout",
            Arc::new(|args: &[Value]| {
                let text = args.first().and_then(|v| v.as_str()).unwrap_or_default();
                Ok(Value::from(text.to_uppercase()))
            }),
        );

        let data = RenderData::default().with_title("hi");
        assert_eq!(renderer.render("shout.html", &data).unwrap(), "HI HI");
    }

    #[test]
    fn test_function_errors_fail_the_render() {
        let mut renderer = Renderer::new();
        renderer.add_template("boom.html", "{{ boom() }}").unwrap();
        renderer.add_function("boom", Arc::new(|_: &[Value]| Err(anyhow::anyhow!("kaput"))));

        let error = renderer.render("boom.html", &RenderData::default()).unwrap_err();
        assert!(format!("{:#}", error).contains("kaput"));
    }

    #[test]
    fn test_theme_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        fs::write(temp.path().join("index.html"), "<h1>{{ title }}</h1>").unwrap();
        fs::write(temp.path().join("style.css"), "body {}").unwrap();

        let renderer = Renderer::from_theme(temp.path()).unwrap();
        assert!(renderer.has_template("index.html"));
        assert!(!renderer.has_template("style.css"));
        assert_eq!(
            renderer.render("index.html", &RenderData::default().with_title("<Inbox>")).unwrap(),
            "<h1>&lt;Inbox&gt;</h1>"
        );

        assert!(Renderer::from_theme(&temp.path().join("missing")).is_err());
    }

    #[test]
    fn test_template_syntax_error() {
        let mut renderer = Renderer::new();
        assert!(renderer.add_template("bad.html", "{% if %}").is_err());
    }
}
