// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Certificate Refresh
//!
//! Background task that re-issues every cached certificate before it expires.
//!
//! ## Strategy
//!
//! Every `refresh_interval` (default 48 h) the refresher:
//! 1. Snapshots the cached [`CertId`]s.
//! 2. Issues a new certificate for each, outside the cache lock.
//! 3. Installs every success, so handshakes pick it up immediately.
//!
//! If any issuance fails, the next sweep runs after `retry_interval` (1 h)
//! and the previous certificates stay in place. A sweep can also be forced
//! with [`InternalPki::trigger_refresh`].
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken`, the same pattern as the other
//! background loops.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cert::CertId;
use super::internal::{InternalPki, PkiMode};
use crate::error::{Error, Result};

impl InternalPki {
    /// Wake the refresh loop now instead of at the next interval.
    pub fn trigger_refresh(&self) {
        self.refresh_trigger().notify_one();
    }

    /// Re-issue every cached certificate once.
    pub async fn refresh_now(&self) -> Result<()> {
        if self.mode() != PkiMode::VaultCerts {
            return Ok(());
        }
        let ids = self.cached_cert_ids();
        let mut failed: Vec<(CertId, Error)> = Vec::new();
        for id in &ids {
            match self.issue_cert(id).await {
                Ok(cert) => {
                    debug!(cert_id = %id, "refreshed cert");
                    self.install_cert(id.clone(), cert);
                }
                Err(e) => failed.push((id.clone(), e)),
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        let detail = failed
            .iter()
            .map(|(id, e)| format!("{id}: {e}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::issuance(format!(
            "failed to refresh {} of {} certs: {detail}",
            failed.len(),
            ids.len()
        )))
    }

    /// Spawn the refresh loop. Only runs when certificates come from the
    /// secret store; returns `None` otherwise.
    pub fn start_refresh(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.mode() != PkiMode::VaultCerts {
            return None;
        }
        let refresher = CertRefresher { pki: self.clone() };
        Some(tokio::spawn(refresher.run(shutdown)))
    }
}

struct CertRefresher {
    pki: InternalPki,
}

impl CertRefresher {
    async fn run(self, shutdown: CancellationToken) {
        info!(
            refresh_secs = self.pki.refresh_interval().as_secs(),
            retry_secs = self.pki.retry_interval().as_secs(),
            "Internal PKI refresh starting"
        );

        let mut wait = self.pki.refresh_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {},
                _ = self.pki.refresh_trigger().notified() => {
                    debug!("Internal PKI refresh triggered");
                },
                _ = shutdown.cancelled() => {
                    info!("Internal PKI refresh shutting down");
                    return;
                }
            }
            wait = self.refresh_step().await;
        }
    }

    async fn refresh_step(&self) -> Duration {
        match self.pki.refresh_now().await {
            Ok(()) => self.pki.refresh_interval(),
            Err(e) => {
                warn!(
                    error = %e,
                    retry_secs = self.pki.retry_interval().as_secs(),
                    "Internal PKI refresh failed"
                );
                self.pki.retry_interval()
            }
        }
    }
}
