// Postern - CSS Sanitizer
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Minimal CSS parser and filter for mail bodies
//!
//! Only the structure needed for filtering is recognized: qualified rules,
//! at-rules (blockless, with nested rules, or with declarations) and
//! `property: value` declarations. Anything the parser cannot make sense of
//! is reported as a [`CssError`] so the caller can drop the whole fragment.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Properties kept in sanitized style sheets and `style` attributes
pub const ALLOWED_PROPERTIES: &[&str] = &[
    "direction",
    "font",
    "font-family",
    "font-style",
    "font-variant",
    "font-size",
    "font-weight",
    "letter-spacing",
    "line-height",
    "text-align",
    "text-decoration",
    "text-indent",
    "text-overflow",
    "text-shadow",
    "text-transform",
    "white-space",
    "word-spacing",
    "word-wrap",
    "vertical-align",
    "color",
    "background",
    "background-color",
    "background-image",
    "background-repeat",
    "border",
    "border-color",
    "border-radius",
    "height",
    "margin",
    "padding",
    "width",
    "max-width",
    "min-width",
    "clear",
    "float",
    "border-collapse",
    "border-spacing",
    "caption-side",
    "empty-cells",
    "table-layout",
    "list-style-type",
    "list-style-position",
];

/// At-rules whose block holds further rules rather than declarations
const NESTING_AT_RULES: &[&str] = &[
    "media",
    "supports",
    "document",
    "-moz-document",
    "layer",
    "container",
    "keyframes",
    "-webkit-keyframes",
];

pub const BLANK_URL: &str = "url(about:blank)";

/// Deepest at-rule nesting accepted in a style sheet
pub const MAX_NESTING: usize = 32;

static DANGEROUS_VALUE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(expression|image-set)\s*\(").ok());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CssError {
    #[error("unterminated string")]
    UnterminatedString,
    #[error("unterminated comment")]
    UnterminatedComment,
    #[error("unbalanced braces")]
    Unbalanced,
    #[error("malformed declaration: {0}")]
    MalformedDeclaration(String),
    #[error("at-rules nested deeper than {MAX_NESTING} levels")]
    TooDeep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    /// Lowercased property name
    pub property: String,
    pub value: String,
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.property, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtBody {
    Rules(Vec<Rule>),
    Declarations(Vec<Declaration>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Qualified {
        prelude: String,
        declarations: Vec<Declaration>,
    },
    At {
        /// Lowercased name without the leading `@`
        name: String,
        prelude: String,
        body: Option<AtBody>,
    },
}

/// Parse a complete style sheet (the body of a `<style>` element)
pub fn parse_stylesheet(input: &str) -> Result<Vec<Rule>, CssError> {
    let input = strip_comments(input)?;
    parse_rules(&input, 0)
}

/// Parse the value of a `style` attribute
pub fn parse_declarations(input: &str) -> Result<Vec<Declaration>, CssError> {
    let input = strip_comments(input)?;
    parse_declaration_list(&input)
}

/// Sanitize a `<style>` body; `Err` means the whole sheet must be dropped
pub fn sanitize_stylesheet(input: &str) -> Result<String, CssError> {
    let mut rules = parse_stylesheet(input)?;
    for rule in &mut rules {
        sanitize_rule(rule);
    }
    Ok(serialize_rules(&rules))
}

/// Sanitize a `style` attribute value; `Err` means the attribute must be emptied
pub fn sanitize_inline_style(input: &str) -> Result<String, CssError> {
    let declarations = sanitize_declarations(parse_declarations(input)?);
    Ok(declarations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; "))
}

pub fn sanitize_rule(rule: &mut Rule) {
    match rule {
        Rule::Qualified { declarations, .. } => {
            *declarations = sanitize_declarations(std::mem::take(declarations));
        }
        Rule::At { name, prelude, body } => {
            if name == "import" {
                *prelude = BLANK_URL.to_string();
            } else {
                *prelude = neutralize_urls(prelude);
            }

            match body {
                Some(AtBody::Rules(rules)) => {
                    for child in rules.iter_mut() {
                        sanitize_rule(child);
                    }
                }
                Some(AtBody::Declarations(declarations)) => {
                    *declarations = sanitize_declarations(std::mem::take(declarations));
                }
                None => {}
            }
        }
    }
}

pub fn sanitize_declarations(declarations: Vec<Declaration>) -> Vec<Declaration> {
    declarations
        .into_iter()
        .filter(|decl| ALLOWED_PROPERTIES.contains(&decl.property.as_str()))
        .filter(|decl| !is_dangerous_value(&decl.value))
        .map(|decl| Declaration {
            value: neutralize_urls(&decl.value),
            property: decl.property,
        })
        .collect()
}

fn is_dangerous_value(value: &str) -> bool {
    // Fail closed if the pattern did not compile
    let Some(pattern) = DANGEROUS_VALUE.as_ref() else {
        return true;
    };
    pattern.is_match(value) || value.contains('\\')
}

/// Replace every `url(...)` argument with `about:blank`
///
/// Matching is case-insensitive and skips over quoted arguments, so a `)`
/// inside quotes does not end the function early.
pub fn neutralize_urls(value: &str) -> String {
    let lower = value.to_ascii_lowercase();
    let bytes = value.as_bytes();
    let mut out = String::with_capacity(value.len());
    let mut i = 0;

    while i < value.len() {
        if lower[i..].starts_with("url(") {
            let mut j = i + 4;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j < bytes.len() && (bytes[j] == b'"' || bytes[j] == b'\'') {
                let quote = bytes[j];
                j += 1;
                while j < bytes.len() && bytes[j] != quote {
                    if bytes[j] == b'\\' {
                        j += 1;
                    }
                    j += 1;
                }
                j += 1;
            }
            while j < bytes.len() && bytes[j] != b')' {
                j += 1;
            }

            out.push_str(BLANK_URL);
            i = (j + 1).min(value.len());
            continue;
        }

        // `i` only ever lands on char boundaries: the skip above stops on ASCII bytes
        match value[i..].chars().next() {
            Some(c) => {
                out.push(c);
                i += c.len_utf8();
            }
            None => break,
        }
    }

    out
}

pub fn serialize_rules(rules: &[Rule]) -> String {
    rules
        .iter()
        .map(serialize_rule)
        .collect::<Vec<_>>()
        .join("\n")
}

fn serialize_rule(rule: &Rule) -> String {
    match rule {
        Rule::Qualified {
            prelude,
            declarations,
        } => format!("{} {}", prelude, serialize_block(declarations)),
        Rule::At { name, prelude, body } => {
            let head = if prelude.is_empty() {
                format!("@{}", name)
            } else {
                format!("@{} {}", name, prelude)
            };

            match body {
                None => format!("{};", head),
                Some(AtBody::Rules(rules)) => {
                    format!("{} {{\n{}\n}}", head, serialize_rules(rules))
                }
                Some(AtBody::Declarations(declarations)) => {
                    format!("{} {}", head, serialize_block(declarations))
                }
            }
        }
    }
}

fn serialize_block(declarations: &[Declaration]) -> String {
    if declarations.is_empty() {
        return "{}".to_string();
    }

    let body: Vec<String> = declarations.iter().map(|d| format!("{};", d)).collect();
    format!("{{ {} }}", body.join(" "))
}

fn strip_comments(input: &str) -> Result<String, CssError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                out.push(c);
                let mut closed = false;
                while let Some(inner) = chars.next() {
                    out.push(inner);
                    if inner == '\\' {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    } else if inner == c {
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return Err(CssError::UnterminatedString);
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                let mut closed = false;
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        closed = true;
                        break;
                    }
                    prev = inner;
                }
                if !closed {
                    return Err(CssError::UnterminatedComment);
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

/// Byte offset of the first of `targets` outside strings and parentheses
///
/// A `}` met before any target means the braces do not balance.
fn find_top_level(input: &str, targets: &[u8]) -> Result<Option<usize>, CssError> {
    let bytes = input.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'"' | b'\'' => i = skip_string(bytes, i)?,
            b'\\' => i += 1,
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            _ if depth == 0 && targets.contains(&b) => return Ok(Some(i)),
            b'}' => return Err(CssError::Unbalanced),
            _ => {}
        }
        i += 1;
    }

    Ok(None)
}

/// Offset of the `}` closing the `{` at `open`
fn matching_brace(input: &str, open: usize) -> Result<usize, CssError> {
    let bytes = input.as_bytes();
    let mut depth = 0usize;
    let mut i = open;

    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => i = skip_string(bytes, i)?,
            b'\\' => i += 1,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
        i += 1;
    }

    Err(CssError::Unbalanced)
}

/// Offset of the closing quote of the string starting at `start`
fn skip_string(bytes: &[u8], start: usize) -> Result<usize, CssError> {
    let quote = bytes[start];
    let mut i = start + 1;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b if b == quote => return Ok(i),
            _ => {}
        }
        i += 1;
    }

    Err(CssError::UnterminatedString)
}

fn parse_rules(input: &str, depth: usize) -> Result<Vec<Rule>, CssError> {
    if depth > MAX_NESTING {
        return Err(CssError::TooDeep);
    }

    let mut rules = Vec::new();
    let mut rest = input.trim_start();

    while !rest.is_empty() {
        if let Some(after_at) = rest.strip_prefix('@') {
            let name_len = after_at
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
                .unwrap_or(after_at.len());
            let name = after_at[..name_len].to_ascii_lowercase();
            let tail = &after_at[name_len..];

            match find_top_level(tail, b";{")? {
                Some(pos) if tail.as_bytes()[pos] == b'{' => {
                    let close = matching_brace(tail, pos)?;
                    let inner = &tail[pos + 1..close];
                    let body = if NESTING_AT_RULES.contains(&name.as_str()) {
                        AtBody::Rules(parse_rules(inner, depth + 1)?)
                    } else {
                        AtBody::Declarations(parse_declaration_list(inner)?)
                    };
                    rules.push(Rule::At {
                        name,
                        prelude: tail[..pos].trim().to_string(),
                        body: Some(body),
                    });
                    rest = &tail[close + 1..];
                }
                Some(pos) => {
                    rules.push(Rule::At {
                        name,
                        prelude: tail[..pos].trim().to_string(),
                        body: None,
                    });
                    rest = &tail[pos + 1..];
                }
                None => {
                    rules.push(Rule::At {
                        name,
                        prelude: tail.trim().to_string(),
                        body: None,
                    });
                    rest = "";
                }
            }
        } else {
            let open = find_top_level(rest, b"{")?.ok_or(CssError::Unbalanced)?;
            let close = matching_brace(rest, open)?;
            rules.push(Rule::Qualified {
                prelude: rest[..open].trim().to_string(),
                declarations: parse_declaration_list(&rest[open + 1..close])?,
            });
            rest = &rest[close + 1..];
        }

        rest = rest.trim_start();
    }

    Ok(rules)
}

fn parse_declaration_list(input: &str) -> Result<Vec<Declaration>, CssError> {
    let mut declarations = Vec::new();
    let mut rest = input;

    loop {
        let (chunk, next) = match find_top_level(rest, b";{")? {
            Some(pos) if rest.as_bytes()[pos] == b'{' => {
                return Err(CssError::MalformedDeclaration(rest.trim().to_string()));
            }
            Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
            None => (rest, None),
        };

        let chunk = chunk.trim();
        if !chunk.is_empty() {
            declarations.push(parse_declaration(chunk)?);
        }

        match next {
            Some(next) => rest = next,
            None => break,
        }
    }

    Ok(declarations)
}

fn parse_declaration(chunk: &str) -> Result<Declaration, CssError> {
    let (property, value) = chunk
        .split_once(':')
        .ok_or_else(|| CssError::MalformedDeclaration(chunk.to_string()))?;

    let property = property.trim();
    if property.is_empty()
        || !property
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CssError::MalformedDeclaration(chunk.to_string()));
    }

    Ok(Declaration {
        property: property.to_ascii_lowercase(),
        value: value.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_style_drops_unlisted_property() {
        assert_eq!(
            sanitize_inline_style("color: red; behavior: url(evil)").unwrap(),
            "color: red"
        );
    }

    #[test]
    fn test_inline_style_blanks_urls() {
        assert_eq!(
            sanitize_inline_style("background: url(http://evil/x.png)").unwrap(),
            "background: url(about:blank)"
        );
        assert_eq!(
            sanitize_inline_style("BACKGROUND-IMAGE: URL( \"http://evil/a).png\" ) no-repeat").unwrap(),
            "background-image: url(about:blank) no-repeat"
        );
    }

    #[test]
    fn test_inline_style_drops_expressions_and_escapes() {
        assert_eq!(
            sanitize_inline_style("width: expression(alert(1)); color: blue").unwrap(),
            "color: blue"
        );
        assert_eq!(
            sanitize_inline_style("background-image: image-set('a.png' 1x); color: \\72 ed").unwrap(),
            ""
        );
    }

    #[test]
    fn test_malformed_declarations_are_errors() {
        assert!(sanitize_inline_style("color red").is_err());
        assert!(sanitize_inline_style("color: 'red").is_err());
        assert!(sanitize_inline_style("color: red /* open").is_err());
        assert!(sanitize_inline_style("color: red }").is_err());
    }

    #[test]
    fn test_stylesheet_filters_rules() {
        let css = r#"
            /* comment */
            p.note { color: red; position: fixed; }
            @import url("https://evil.example/x.css");
            @media screen and (max-width: 600px) {
                td { width: 100%; background: url(https://evil.example/bg.png) }
            }
            @font-face { font-family: Evil; src: url(https://evil.example/f.woff) }
        "#;

        assert_eq!(
            sanitize_stylesheet(css).unwrap(),
            "p.note { color: red; }\n\
             @import url(about:blank);\n\
             @media screen and (max-width: 600px) {\n\
             td { width: 100%; background: url(about:blank); }\n\
             }\n\
             @font-face { font-family: Evil; }"
        );
    }

    #[test]
    fn test_stylesheet_output_is_stable() {
        let once = sanitize_stylesheet(
            "@charset \"utf-8\"; a:hover { color: #fff; text-decoration: none } div {}",
        )
        .unwrap();
        let twice = sanitize_stylesheet(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_stylesheet_unbalanced_is_error() {
        assert!(sanitize_stylesheet("p { color: red;").is_err());
        assert!(sanitize_stylesheet("} p { color: red; }").is_err());
        assert!(sanitize_stylesheet("p { color: red; } garbage").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let nested = |levels: usize| {
            format!(
                "{}p {{ color: red }}{}",
                "@media print {".repeat(levels),
                "}".repeat(levels)
            )
        };

        assert!(sanitize_stylesheet(&nested(MAX_NESTING)).is_ok());
        assert_eq!(sanitize_stylesheet(&nested(MAX_NESTING + 1)), Err(CssError::TooDeep));
        assert_eq!(sanitize_stylesheet(&nested(50_000)), Err(CssError::TooDeep));
    }

    #[test]
    fn test_neutralize_urls_keeps_other_text() {
        assert_eq!(neutralize_urls("ünï url(x) ok"), "ünï url(about:blank) ok");
        assert_eq!(neutralize_urls("url(about:blank)"), "url(about:blank)");
        assert_eq!(neutralize_urls("url('unterminated"), "url(about:blank)");
    }
}
