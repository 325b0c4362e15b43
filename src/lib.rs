// Postern - Webmail Plugin Core
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! # Postern
//!
//! Plugin core of a server-rendered webmail front end:
//! - Native and sandboxed Lua plugins contributing routes, render hooks
//!   and template functions
//! - Hot reload of the complete plugin set without dropping requests
//! - Sanitizing of untrusted HTML mail bodies, with an image proxy for
//!   remote resources the reader opted in to
//!
//! Mail protocol access and sessions are reached through the narrow
//! [`mail::MailboxService`] and [`mail::SessionStore`] seams.
//!
//! ## Quick Start
//!
//! ```no_run
//! use postern::config::Config;
//! use postern::mail::{MemoryMailbox, MemorySessions};
//! use postern::web::{Coordinator, ServerContext};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::default());
//!     let context = ServerContext::new(
//!         config.clone(),
//!         Arc::new(MemoryMailbox::new()),
//!         Arc::new(MemorySessions::new()),
//!     )?;
//!     let coordinator = Coordinator::start(Arc::new(context), postern::builtin::loaders()).await?;
//!     postern::web::server::serve(&config.server.listen, coordinator).await
//! }
//! ```

pub mod builtin;
pub mod config;
pub mod core;
pub mod mail;
pub mod plugins;
pub mod sanitize;
pub mod web;

pub use plugins::{NativePlugin, Plugin};
pub use sanitize::Sanitizer;
pub use web::{Coordinator, ServerContext};
