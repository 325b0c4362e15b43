// Postern - Plugin Contract
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The capability interface every plugin implements, native or scripted

use crate::web::{AppState, RenderData, Renderer, RequestContext, TemplateFunction};
use axum::Router;

/// View name whose hooks run before the hooks of every view
pub const WILDCARD_VIEW: &str = "*";

pub trait Plugin: Send + Sync {
    /// Stable identifier, used in logs and in `/plugins/<name>/assets`
    fn name(&self) -> &str;

    /// Wire the plugin's handlers into the generation's router
    fn set_routes(&self, router: Router<AppState>) -> Router<AppState>;

    /// Run the hooks registered under exactly `view` (`"*"` for wildcard hooks)
    ///
    /// Hooks may mutate `data`; an error aborts rendering of that view only.
    fn inject(&self, ctx: &RequestContext, view: &str, data: &mut RenderData) -> anyhow::Result<()>;

    /// Helpers made callable from templates
    fn template_functions(&self) -> Vec<(String, TemplateFunction)> {
        Vec::new()
    }

    /// Add bundled template fragments to the renderer
    fn load_templates(&self, _renderer: &mut Renderer) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release owned resources; a second call reports an error
    fn close(&self) -> anyhow::Result<()>;
}
