// Postern - Base Plugin
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message view, raw part download and the base template helpers

use super::viewhtml::{ALLOW_REMOTE_PARAM, HAS_REMOTE_RESOURCES_KEY, REMOTE_RESOURCES_ALLOWED_KEY};
use crate::mail::{Message, MessagePart};
use crate::plugins::{NativePlugin, Plugin};
use crate::sanitize::Sanitizer;
use crate::web::{AppError, AppState, Generation, RenderData, RequestContext};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Extension;
use minijinja::value::Value;
use serde_json::json;
use std::sync::Arc;

pub const MESSAGE_VIEW: &str = "message.html";

pub fn plugin() -> Arc<dyn Plugin> {
    NativePlugin::new("base")
        .route("/message/:mailbox/:uid", get(view_message))
        .route("/message/:mailbox/:uid/raw", get(raw_part))
        .template_function("humanize_bytes", |args| {
            let bytes = args
                .first()
                .and_then(|value| u64::try_from(value.clone()).ok())
                .ok_or_else(|| anyhow::anyhow!("humanize_bytes expects a byte count"))?;
            Ok(Value::from(humanize_bytes(bytes)))
        })
        .into_plugin()
}

/// Format a byte count with binary units: "512 B", "1.5 KiB"
pub fn humanize_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.1} {}", value, UNITS[unit])
}

async fn fetch(state: &AppState, ctx: &RequestContext, mailbox: &str, uid: u32) -> Result<Message, AppError> {
    let user = ctx.user.as_deref().ok_or(AppError::Unauthorized)?;

    state
        .mailbox
        .fetch_message(user, mailbox, uid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Message {} not found in {}", uid, mailbox)))
}

fn select_part<'a>(message: &'a Message, ctx: &RequestContext) -> Result<&'a MessagePart, AppError> {
    match ctx.query("part") {
        Some(path) => message
            .part_by_path(path)
            .ok_or_else(|| AppError::NotFound(format!("Message has no part {}", path))),
        None => message
            .body_part()
            .ok_or_else(|| AppError::NotFound("Message has no text part".to_string())),
    }
}

async fn view_message(
    State(state): State<AppState>,
    Extension(generation): Extension<Arc<Generation>>,
    Path((mailbox, uid)): Path<(String, u32)>,
    mut ctx: RequestContext,
) -> Result<Html<String>, AppError> {
    let message = fetch(&state, &ctx, &mailbox, uid).await?;
    let part = select_part(&message, &ctx)?;
    let allow_remote = ctx.query(ALLOW_REMOTE_PARAM) == Some("1");

    let attachments: Vec<_> = message
        .parts
        .iter()
        .filter(|p| p.filename.is_some())
        .map(|p| {
            json!({
                "filename": &p.filename,
                "mime_type": &p.mime_type,
                "size": p.size(),
                "url": message.part_url(p),
            })
        })
        .collect();

    let mut view = json!({
        "message": &message,
        "mailbox": &mailbox,
        "uid": uid,
        "part": &part.path,
        "attachments": attachments,
    });

    if part.is_html() {
        let mut sanitizer = Sanitizer::new(Some(&message), allow_remote, state.config.proxy.enabled);
        let html = sanitizer.sanitize_html(&part.body);

        ctx.set_value(HAS_REMOTE_RESOURCES_KEY, sanitizer.has_remote_resources());
        ctx.set_value(REMOTE_RESOURCES_ALLOWED_KEY, allow_remote);
        view["html"] = String::from_utf8_lossy(&html).into_owned().into();
    } else if part.is_plain_text() {
        view["text"] = String::from_utf8_lossy(&part.body).into_owned().into();
    } else {
        return Err(AppError::BadRequest(format!(
            "Part {} ({}) cannot be displayed",
            part.path, part.mime_type
        )));
    }

    let data = RenderData::new(&ctx)
        .with_title(&message.subject)
        .with_notice(ctx.take_notice(state.sessions.as_ref()))
        .with_view(view);
    let html = generation.render_blocking(&ctx, MESSAGE_VIEW, data).await?;
    Ok(Html(html))
}

async fn raw_part(
    State(state): State<AppState>,
    Path((mailbox, uid)): Path<(String, u32)>,
    ctx: RequestContext,
) -> Result<Response, AppError> {
    let path = ctx
        .query("part")
        .ok_or_else(|| AppError::BadRequest("Missing part parameter".to_string()))?;
    let message = fetch(&state, &ctx, &mailbox, uid).await?;
    let part = message
        .part_by_path(path)
        .ok_or_else(|| AppError::NotFound(format!("Message has no part {}", path)))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&part.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));

    let inline_text = part.is_plain_text() && part.disposition.as_deref() != Some("attachment");
    if !inline_text {
        headers.insert(header::CONTENT_DISPOSITION, attachment_disposition(part));
    }

    Ok((headers, part.body.clone()).into_response())
}

fn attachment_disposition(part: &MessagePart) -> HeaderValue {
    let filename = part
        .filename
        .clone()
        .unwrap_or_else(|| format!("part-{}", part.path))
        .replace(['"', '\\', '\r', '\n'], "_");

    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
