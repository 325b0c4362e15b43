// Postern - Email Content Sanitizer
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Email content sanitizer
//!
//! Turns an attacker-controlled HTML mail body into HTML that can be embedded
//! in a page. Two stages run in order:
//!
//! 1. A DOM rewrite: image sources are resolved (`cid:`), proxied (`https:`)
//!    or blanked, and every style sheet and `style` attribute is filtered
//!    through the CSS allow-list.
//! 2. A generic allow-list pass (ammonia) that removes scripts, frames and
//!    event handler attributes and hardens links.
//!
//! Malformed fragments degrade to empty content; sanitizing never fails.

pub mod css;
mod html;

use crate::mail::Message;
use url::Url;

/// Placeholder for any resource that must not load
pub const BLANK: &str = "about:blank";

/// Path of the remote image proxy endpoint
pub const PROXY_PATH: &str = "/proxy";

/// Same-origin URL fetching `target` through the image proxy
pub fn proxy_url(target: &Url) -> String {
    format!("{}?src={}", PROXY_PATH, urlencoding::encode(target.as_str()))
}

/// One sanitizing pass over one message body
pub struct Sanitizer<'a> {
    message: Option<&'a Message>,
    allow_remote_resources: bool,
    proxy_enabled: bool,
    has_remote_resources: bool,
}

impl<'a> Sanitizer<'a> {
    /// `message` resolves `cid:` references; `allow_remote_resources` is the
    /// reader's opt-in and only takes effect when the proxy is enabled
    pub fn new(message: Option<&'a Message>, allow_remote_resources: bool, proxy_enabled: bool) -> Self {
        Self {
            message,
            allow_remote_resources,
            proxy_enabled,
            has_remote_resources: false,
        }
    }

    /// Whether the document referenced a remote resource, permitted or not
    pub fn has_remote_resources(&self) -> bool {
        self.has_remote_resources
    }

    pub fn sanitize_html(&mut self, input: &[u8]) -> Vec<u8> {
        let rewritten = self.rewrite_document(input);
        let cleaned = html::clean(&String::from_utf8_lossy(&rewritten));
        // Leading whitespace would be dropped by the next parse
        cleaned.trim().as_bytes().to_vec()
    }

    pub fn sanitize_image_url(&mut self, src: &str) -> String {
        let src = src.trim();

        if src.starts_with('/') && !src.starts_with("//") {
            return self.sanitize_same_origin_url(src);
        }

        let url = match Url::parse(src) {
            Ok(url) => url,
            Err(_) => return BLANK.to_string(),
        };

        match url.scheme() {
            "cid" => self.resolve_content_id(&url),
            "https" => self.remote_image(&url),
            _ => BLANK.to_string(),
        }
    }

    fn resolve_content_id(&self, url: &Url) -> String {
        let Some(message) = self.message else {
            return BLANK.to_string();
        };

        let Ok(id) = urlencoding::decode(url.path()) else {
            return BLANK.to_string();
        };

        match message.part_by_id(&id) {
            Some(part) if part.is_image() => message.part_url(part),
            _ => BLANK.to_string(),
        }
    }

    fn remote_image(&mut self, url: &Url) -> String {
        self.has_remote_resources = true;

        if self.proxy_enabled && self.allow_remote_resources {
            proxy_url(url)
        } else {
            BLANK.to_string()
        }
    }

    /// Accept only the same-origin URLs this sanitizer produces itself, so
    /// sanitized output sanitizes to itself
    fn sanitize_same_origin_url(&mut self, src: &str) -> String {
        let Ok(url) = Url::parse("http://localhost/").and_then(|base| base.join(src)) else {
            return BLANK.to_string();
        };

        if url.path() == PROXY_PATH {
            let target = url
                .query_pairs()
                .find(|(key, _)| key == "src")
                .and_then(|(_, value)| Url::parse(&value).ok());

            return match target {
                Some(target) if target.scheme() == "https" => self.remote_image(&target),
                _ => BLANK.to_string(),
            };
        }

        if let Some(message) = self.message {
            let is_own_part = message
                .parts
                .iter()
                .any(|part| part.is_image() && message.part_url(part) == src);
            if is_own_part {
                return src.to_string();
            }
        }

        BLANK.to_string()
    }
}
