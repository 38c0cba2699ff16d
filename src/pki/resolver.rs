// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-handshake certificate lookup.
//!
//! TLS configs hold a resolver bound to one [`CertId`] rather than the
//! certificate itself, so a refreshed certificate is picked up by the next
//! handshake without rebuilding the config.

use std::fmt;
use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use tracing::warn;

use super::cert::CertId;
use crate::error::Result;

/// Something that can hand out the current certificate for an id.
///
/// Lookups happen on the handshake path and must not block on the network.
pub trait CertificateSource: Send + Sync {
    fn lookup(&self, id: &CertId) -> Result<Arc<CertifiedKey>>;
}

/// rustls resolver deferring to a [`CertificateSource`].
#[derive(Clone)]
pub struct CachedCertResolver {
    source: Arc<dyn CertificateSource>,
    id: CertId,
}

impl CachedCertResolver {
    pub fn new(source: Arc<dyn CertificateSource>, id: CertId) -> Self {
        Self { source, id }
    }

    fn current(&self) -> Option<Arc<CertifiedKey>> {
        match self.source.lookup(&self.id) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(cert_id = %self.id, error = %e, "no certificate for handshake");
                None
            }
        }
    }
}

impl fmt::Debug for CachedCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedCertResolver")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CachedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current()
    }
}

impl ResolvesClientCert for CachedCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.current()
    }

    fn has_certs(&self) -> bool {
        true
    }
}
