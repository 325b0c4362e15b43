// Postern - HTML Sanitizer Stages
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stage 1 rewrites the parsed DOM (image sources, style sheets, inline
//! styles). Stage 2 is the generic allow-list pass and must always run last.

use super::Sanitizer;
use super::css;
use kuchikiki::NodeRef;
use kuchikiki::iter::NodeIterator;
use kuchikiki::traits::TendrilSink;
use once_cell::sync::Lazy;

static POLICY: Lazy<ammonia::Builder<'static>> = Lazy::new(|| {
    let mut builder = ammonia::Builder::default();
    builder
        .add_tags(&["style"])
        .rm_clean_content_tags(&["style"])
        .add_clean_content_tags(&[
            "title", "noscript", "noembed", "noframes", "object", "frameset", "iframe",
        ])
        .add_generic_attributes(&["style"])
        .add_url_schemes(&["about"])
        .url_relative(ammonia::UrlRelative::PassThrough)
        .link_rel(Some("noopener noreferrer nofollow"))
        .set_tag_attribute_value("a", "target", "_blank");
    builder
});

impl Sanitizer<'_> {
    /// Stage 1: contextual rewrite over the DOM
    pub(super) fn rewrite_document(&mut self, input: &[u8]) -> Vec<u8> {
        let document = kuchikiki::parse_html().one(String::from_utf8_lossy(input).into_owned());

        let elements: Vec<_> = document.descendants().elements().collect();
        for element in elements {
            match &*element.name.local {
                "img" => {
                    let src = element.attributes.borrow().get("src").map(str::to_string);
                    if let Some(src) = src {
                        let rewritten = self.sanitize_image_url(&src);
                        element.attributes.borrow_mut().insert("src", rewritten);
                    }
                }
                "style" => rewrite_style_element(element.as_node()),
                _ => {}
            }

            let style = element.attributes.borrow().get("style").map(str::to_string);
            if let Some(style) = style {
                let cleaned = css::sanitize_inline_style(&style).unwrap_or_else(|e| {
                    crate::log_debug!("Dropping unparsable style attribute: {}", e);
                    String::new()
                });
                element.attributes.borrow_mut().insert("style", cleaned);
            }
        }

        let mut output = Vec::new();
        if let Err(e) = document.serialize(&mut output) {
            crate::log_warn!("Failed to serialize sanitized HTML: {}", e);
            return Vec::new();
        }
        output
    }
}

fn rewrite_style_element(node: &NodeRef) {
    let sheet = node.text_contents();

    let sanitized = match css::sanitize_stylesheet(&sheet) {
        Ok(sanitized) if sanitized.to_ascii_lowercase().contains("</style") => {
            crate::log_debug!("Dropping style sheet that would close its element");
            String::new()
        }
        Ok(sanitized) => sanitized,
        Err(e) => {
            crate::log_debug!("Dropping unparsable style sheet: {}", e);
            String::new()
        }
    };

    for child in node.children().collect::<Vec<_>>() {
        child.detach();
    }
    node.append(NodeRef::new_text(sanitized));
}

/// Stage 2: generic element and attribute allow-list
pub(super) fn clean(html: &str) -> String {
    POLICY.clean(html).to_string()
}
