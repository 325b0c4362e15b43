// Postern - Webmail Plugin Core
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use postern::config::{Cli, Config};
use postern::core::logger::init_from_args;
use postern::mail::{MemoryMailbox, MemorySessions};
use postern::web::{Coordinator, ServerContext, server};
use postern::{log_init_failed, log_init_ok_with_details, log_init_start, log_init_warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    if let Err(e) = init_from_args(args.debug, args.trace, args.journald) {
        eprintln!("Failed to initialize logger: {}", e);
    }

    log_init_start!("Configuration");
    let config = match Config::load(&args) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            log_init_failed!("Configuration", &format!("{:#}", e));
            return Err(e);
        }
    };
    log_init_ok_with_details!(
        "Configuration",
        &format!(
            "theme {}, plugins in {}, image proxy {}",
            config.theme_dir().display(),
            config.plugins.dir.display(),
            if config.proxy.enabled { "enabled" } else { "disabled" }
        )
    );

    log_init_warn!("Mailbox", "no upstream configured, using the in-memory mailbox");
    let context = Arc::new(ServerContext::new(
        Arc::clone(&config),
        Arc::new(MemoryMailbox::new()),
        Arc::new(MemorySessions::new()),
    )?);

    log_init_start!("Plugins");
    let coordinator = match Coordinator::start(context, postern::builtin::loaders()).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            log_init_failed!("Plugins", &format!("{:#}", e));
            return Err(e);
        }
    };
    let plugins = coordinator.current().await.plugins().len();
    log_init_ok_with_details!("Plugins", &format!("{} plugin(s) loaded", plugins));

    server::serve(&config.server.listen, coordinator).await
}
