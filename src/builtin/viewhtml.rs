// Postern - HTML View Plugin
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Remote resource handling for HTML messages
//!
//! Exposes the sanitizer's remote resource findings to the message template
//! and serves the image proxy the sanitizer points remote images at.

use crate::config::PROXY_MAX_SIZE;
use crate::plugins::{NativePlugin, Plugin};
use crate::sanitize::PROXY_PATH;
use crate::web::{AppError, AppState, RequestContext};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderValue, header};
use axum::response::Response;
use axum::routing::get;
use futures::{Stream, StreamExt};
use std::io;
use std::sync::Arc;
use url::Url;

/// Query parameter with which the reader opts in to remote resources
pub const ALLOW_REMOTE_PARAM: &str = "allow-remote-resources";

// Request values set by the message view for this plugin's hook
pub const HAS_REMOTE_RESOURCES_KEY: &str = "viewhtml.has_remote_resources";
pub const REMOTE_RESOURCES_ALLOWED_KEY: &str = "viewhtml.allow_remote_resources";

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("missing src parameter")]
    MissingSource,
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),
    #[error("remote resource exceeds {max} bytes")]
    TooLarge { max: u64 },
}

impl From<ProxyError> for AppError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::MissingSource | ProxyError::InvalidUrl(_) | ProxyError::UnsupportedScheme(_) => {
                AppError::BadRequest(e.to_string())
            }
            ProxyError::UnsupportedContentType(_) | ProxyError::TooLarge { .. } => {
                AppError::BadGateway(e.to_string())
            }
        }
    }
}

pub fn plugin() -> Arc<dyn Plugin> {
    NativePlugin::new("viewhtml")
        .on_render(super::base::MESSAGE_VIEW, |ctx, data| {
            data.extra.insert(
                "RemoteResourcesAllowed".into(),
                ctx.flag(REMOTE_RESOURCES_ALLOWED_KEY).into(),
            );
            data.extra.insert(
                "HasRemoteResources".into(),
                ctx.flag(HAS_REMOTE_RESOURCES_KEY).into(),
            );
            Ok(())
        })
        .route(PROXY_PATH, get(proxy))
        .into_plugin()
}

/// Validate the `src` parameter: an absolute HTTPS URL
pub fn parse_target(src: Option<&str>) -> Result<Url, ProxyError> {
    let src = src.filter(|s| !s.is_empty()).ok_or(ProxyError::MissingSource)?;
    let url = Url::parse(src).map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;

    if url.scheme() != "https" {
        return Err(ProxyError::UnsupportedScheme(url.scheme().to_string()));
    }

    Ok(url)
}

/// Accept raster images only; returns the media type to forward
pub fn check_content_type(content_type: Option<&str>) -> Result<String, ProxyError> {
    let media_type = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();

    if media_type.starts_with("image/") && media_type != "image/svg+xml" {
        Ok(media_type)
    } else {
        Err(ProxyError::UnsupportedContentType(media_type))
    }
}

pub fn check_declared_length(length: Option<u64>) -> Result<(), ProxyError> {
    match length {
        Some(length) if length > PROXY_MAX_SIZE => Err(ProxyError::TooLarge { max: PROXY_MAX_SIZE }),
        _ => Ok(()),
    }
}

/// Pass `source` through, failing once more than `max` bytes have been seen
pub fn capped_body<S, E>(source: S, max: u64) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    futures::stream::try_unfold((Box::pin(source), 0u64), move |(mut source, received)| async move {
        let chunk = match source.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return Err(io::Error::other(e)),
            None => return Ok(None),
        };

        let received = received + chunk.len() as u64;
        if received > max {
            crate::log_warn!("Remote image exceeded {} bytes, aborting", max);
            return Err(io::Error::other(ProxyError::TooLarge { max }));
        }

        Ok(Some((chunk, (source, received))))
    })
}

async fn proxy(State(state): State<AppState>, ctx: RequestContext) -> Result<Response, AppError> {
    if !state.config.proxy.enabled {
        return Err(AppError::Forbidden("The remote image proxy is disabled".to_string()));
    }
    if ctx.user.is_none() {
        return Err(AppError::Unauthorized);
    }

    let target = parse_target(ctx.query("src"))?;
    crate::log_debug!("Proxying remote image {}", target);

    let upstream = state
        .http
        .get(target.as_str())
        .send()
        .await
        .map_err(|e| AppError::BadGateway(format!("Failed to fetch remote image: {}", e)))?;

    if !upstream.status().is_success() {
        return Err(AppError::BadGateway(format!(
            "Remote server returned {}",
            upstream.status()
        )));
    }

    let media_type = check_content_type(
        upstream
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
    )?;
    check_declared_length(upstream.content_length())?;

    // Dropping the body (client gone) drops the upstream response
    let chunks = futures::stream::try_unfold(upstream, |mut upstream| async move {
        match upstream.chunk().await {
            Ok(Some(chunk)) => Ok(Some((chunk, upstream))),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        }
    });
    let stream = capped_body(chunks, PROXY_MAX_SIZE);

    let content_type = HeaderValue::from_str(&media_type)
        .map_err(|_| AppError::BadGateway(format!("Invalid content type {}", media_type)))?;

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private, max-age=3600"));
    Ok(response)
}
