// Postern - HTTP Server
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

use super::coordinator::Coordinator;
use crate::{log_error, log_info, log_warn};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Serve until Ctrl-C, then close the plugins of the final generation
pub async fn serve(listen: &str, coordinator: Arc<Coordinator>) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .context(format!("Failed to bind to {}", listen))?;
    log_info!("Listening on http://{}", listen);

    spawn_reload_listener(Arc::clone(&coordinator));

    axum::serve(listener, coordinator.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    log_info!("Shutting down, closing plugins");
    coordinator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log_error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Reload plugins on SIGHUP
#[cfg(unix)]
fn spawn_reload_listener(coordinator: Arc<Coordinator>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            log_warn!("SIGHUP reloads unavailable: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match coordinator.reload().await {
                Ok(id) => log_info!("Reload complete, generation {} is serving", id),
                Err(e) => log_error!("Reload failed, keeping the current generation: {:#}", e),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(_coordinator: Arc<Coordinator>) {
    log_warn!("Plugin reloads on signal are only supported on Unix");
}
