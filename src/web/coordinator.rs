// Postern - Reload Coordinator
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Owns the authoritative generation and swaps in new ones on reload
//!
//! Requests hold the read side of the lock for as long as they are handled.
//! A reload builds its generation without any lock held and only takes the
//! write side to close the old plugins and publish the new generation, so a
//! request never sees a half-built generation and is never interrupted.

use super::context::RequestContext;
use super::error::ErrorPage;
use super::generation::Generation;
use super::render::RenderData;
use super::AppState;
use crate::plugins::LoaderRegistry;
use anyhow::Context;
use axum::Router;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, header};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tower::ServiceExt;
use tower_http::services::ServeDir;

/// Template used for error responses
pub const ERROR_VIEW: &str = "error.html";

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; style-src 'self' 'unsafe-inline'";

pub struct Coordinator {
    context: AppState,
    loaders: Arc<LoaderRegistry>,
    current: RwLock<Arc<Generation>>,
    reload_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl Coordinator {
    /// Build the first generation; failing here is fatal for the caller
    pub async fn start(context: AppState, loaders: LoaderRegistry) -> anyhow::Result<Arc<Self>> {
        let loaders = Arc::new(loaders);
        let first = Self::build(1, context.clone(), Arc::clone(&loaders)).await?;
        crate::log_info!("Generation 1 active with {} plugin(s)", first.plugins().len());

        Ok(Arc::new(Self {
            context,
            loaders,
            current: RwLock::new(Arc::new(first)),
            reload_lock: Mutex::new(()),
            next_id: AtomicU64::new(2),
        }))
    }

    async fn build(id: u64, context: AppState, loaders: Arc<LoaderRegistry>) -> anyhow::Result<Generation> {
        let task = tokio::task::spawn_blocking(move || Generation::build(id, &context, &loaders));
        task.await.context("Generation build task failed")?
    }

    /// Build and publish a new generation, returning its id
    ///
    /// On failure the current generation stays authoritative and untouched.
    pub async fn reload(&self) -> anyhow::Result<u64> {
        let _serial = self.reload_lock.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        crate::log_info!("Reloading plugins as generation {}", id);

        let staged = Self::build(id, self.context.clone(), Arc::clone(&self.loaders))
            .await
            .with_context(|| format!("Failed to build generation {}", id))?;
        let plugins = staged.plugins().len();

        {
            let mut current = self.current.write().await;
            current.close();
            *current = Arc::new(staged);
        }

        crate::log_info!("Generation {} active with {} plugin(s)", id, plugins);
        Ok(id)
    }

    pub async fn current(&self) -> Arc<Generation> {
        Arc::clone(&*self.current.read().await)
    }

    /// Close the plugins of the final generation
    pub async fn shutdown(&self) {
        let _serial = self.reload_lock.lock().await;
        self.current.read().await.close();
    }

    /// Outer router: theme assets, security headers, then the current generation
    pub fn router(self: &Arc<Self>) -> Router {
        let themes = ServeDir::new(&self.context.config.ui.themes_path);

        Router::new()
            .nest_service("/themes", themes)
            .fallback(dispatch)
            .layer(middleware::from_fn(security_headers))
            .with_state(Arc::clone(self))
    }
}

async fn dispatch(State(coordinator): State<Arc<Coordinator>>, mut request: Request) -> Response {
    let current = coordinator.current.read().await;
    let generation = Arc::clone(&*current);

    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    request.extensions_mut().insert(Arc::clone(&generation));

    let response = match generation.router().clone().oneshot(request).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    };

    let Some(page) = response.extensions().get::<ErrorPage>().cloned() else {
        return response;
    };

    let ctx = RequestContext::resolve(method, &uri, headers, &coordinator.context);
    let reason = page.status.canonical_reason().unwrap_or("Error");
    let data = RenderData::new(&ctx).with_title(reason).with_view(serde_json::json!({
        "code": page.status.as_u16(),
        "status": reason,
        "message": page.message,
    }));

    match generation.render_blocking(&ctx, ERROR_VIEW, data).await {
        Ok(html) => (page.status, Html(html)).into_response(),
        Err(e) => {
            crate::log_error!("Failed to render error page: {:#}", e);
            response
        }
    }
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    headers.insert(header::X_DNS_PREFETCH_CONTROL, HeaderValue::from_static("off"));
    response
}
