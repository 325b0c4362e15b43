// Postern - Mailbox and Session Seams
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Narrow interfaces to the collaborators this core depends on
//!
//! Mail protocol access and session persistence live outside the plugin core.
//! Handlers only see a [`MailboxService`] to fetch messages and a [`SessionStore`]
//! holding per-user key/value state. In-memory implementations are provided for
//! tests and for running the server without an upstream.

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// Session key holding the one-shot flash notice
pub const NOTICE_KEY: &str = "notice";

/// One MIME part of a fetched message
#[derive(Debug, Clone, Serialize)]
pub struct MessagePart {
    /// Dotted part path, e.g. "1.2"
    pub path: String,
    /// Lowercase media type without parameters, e.g. "image/png"
    pub mime_type: String,
    /// Content-ID header value, with or without angle brackets
    pub content_id: Option<String>,
    pub filename: Option<String>,
    /// Content-Disposition type ("inline", "attachment")
    pub disposition: Option<String>,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl MessagePart {
    pub fn new(path: &str, mime_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.to_string(),
            mime_type: mime_type.to_ascii_lowercase(),
            content_id: None,
            filename: None,
            disposition: None,
            body: body.into(),
        }
    }

    pub fn with_content_id(mut self, content_id: &str) -> Self {
        self.content_id = Some(content_id.to_string());
        self
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }

    pub fn with_disposition(mut self, disposition: &str) -> Self {
        self.disposition = Some(disposition.to_ascii_lowercase());
        self
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn is_html(&self) -> bool {
        self.mime_type == "text/html"
    }

    pub fn is_plain_text(&self) -> bool {
        self.mime_type == "text/plain"
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// A fetched message with its leaf parts
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub mailbox: String,
    pub uid: u32,
    pub subject: String,
    pub from: String,
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn new(mailbox: &str, uid: u32, subject: &str, from: &str) -> Self {
        Self {
            mailbox: mailbox.to_string(),
            uid,
            subject: subject.to_string(),
            from: from.to_string(),
            parts: Vec::new(),
        }
    }

    pub fn with_part(mut self, part: MessagePart) -> Self {
        self.parts.push(part);
        self
    }

    /// Find a part by Content-ID; angle brackets on either side are ignored
    pub fn part_by_id(&self, id: &str) -> Option<&MessagePart> {
        let wanted = trim_angle_brackets(id);
        if wanted.is_empty() {
            return None;
        }

        self.parts.iter().find(|part| {
            part.content_id
                .as_deref()
                .is_some_and(|cid| trim_angle_brackets(cid) == wanted)
        })
    }

    pub fn part_by_path(&self, path: &str) -> Option<&MessagePart> {
        self.parts.iter().find(|part| part.path == path)
    }

    /// The part shown by default: first HTML part, otherwise first plain text part
    pub fn body_part(&self) -> Option<&MessagePart> {
        self.parts
            .iter()
            .find(|part| part.is_html())
            .or_else(|| self.parts.iter().find(|part| part.is_plain_text()))
    }

    /// Same-origin URL serving the raw content of a part
    pub fn part_url(&self, part: &MessagePart) -> String {
        format!(
            "/message/{}/{}/raw?part={}",
            urlencoding::encode(&self.mailbox),
            self.uid,
            urlencoding::encode(&part.path)
        )
    }
}

fn trim_angle_brackets(id: &str) -> &str {
    let id = id.trim();
    id.strip_prefix('<')
        .and_then(|rest| rest.strip_suffix('>'))
        .unwrap_or(id)
}

/// Access to the user's mail store
#[async_trait]
pub trait MailboxService: Send + Sync {
    /// Fetch one message; `Ok(None)` when the mailbox or UID does not exist
    async fn fetch_message(
        &self,
        user: &str,
        mailbox: &str,
        uid: u32,
    ) -> anyhow::Result<Option<Message>>;
}

/// Per-session key/value persistence
pub trait SessionStore: Send + Sync {
    /// Start a session for a user and return its token
    fn create(&self, username: &str) -> String;

    /// Resolve a session token to its user
    fn username(&self, token: &str) -> Option<String>;

    fn get(&self, token: &str, key: &str) -> Option<String>;

    fn set(&self, token: &str, key: &str, value: &str);

    fn remove(&self, token: &str, key: &str) -> Option<String>;
}

/// Mailbox service backed by a map, keyed by (user, mailbox, uid)
#[derive(Default)]
pub struct MemoryMailbox {
    messages: RwLock<HashMap<(String, String, u32), Message>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: &str, message: Message) {
        let key = (user.to_string(), message.mailbox.clone(), message.uid);
        if let Ok(mut messages) = self.messages.write() {
            messages.insert(key, message);
        }
    }
}

#[async_trait]
impl MailboxService for MemoryMailbox {
    async fn fetch_message(
        &self,
        user: &str,
        mailbox: &str,
        uid: u32,
    ) -> anyhow::Result<Option<Message>> {
        let messages = self
            .messages
            .read()
            .map_err(|_| anyhow::anyhow!("mailbox store is poisoned"))?;

        Ok(messages
            .get(&(user.to_string(), mailbox.to_string(), uid))
            .cloned())
    }
}

#[derive(Debug, Default)]
struct SessionEntry {
    username: String,
    values: HashMap<String, String>,
}

/// Session store kept in process memory
#[derive(Default)]
pub struct MemorySessions {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessions {
    fn create(&self, username: &str) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(
                token.clone(),
                SessionEntry {
                    username: username.to_string(),
                    values: HashMap::new(),
                },
            );
        }

        token
    }

    fn username(&self, token: &str) -> Option<String> {
        let sessions = self.sessions.read().ok()?;
        sessions.get(token).map(|entry| entry.username.clone())
    }

    fn get(&self, token: &str, key: &str) -> Option<String> {
        let sessions = self.sessions.read().ok()?;
        sessions.get(token)?.values.get(key).cloned()
    }

    fn set(&self, token: &str, key: &str, value: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            if let Some(entry) = sessions.get_mut(token) {
                entry.values.insert(key.to_string(), value.to_string());
            }
        }
    }

    fn remove(&self, token: &str, key: &str) -> Option<String> {
        let mut sessions = self.sessions.write().ok()?;
        sessions.get_mut(token)?.values.remove(key)
    }
}
