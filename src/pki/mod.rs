// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Internal PKI
//!
//! Mutual TLS between services, backed either by certificate files or by the
//! secret store's PKI engines.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `issuer` | trust domains and the CA matching policy |
//! | `cert` | certificate identifiers, PEM parsing, X.509 inspection |
//! | `vault` | secret store interface and its Vault HTTP client |
//! | `verifier` | region policy and rustls peer verifiers |
//! | `resolver` | per-handshake certificate selection |
//! | `internal` | [`internal::InternalPki`]: cache, issuance, CA pools, TLS configs |
//! | `refresh` | periodic re-issuance of cached certificates |

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

pub mod cert;
pub mod internal;
pub mod issuer;
pub mod refresh;
pub mod resolver;
pub mod vault;
pub mod verifier;

#[cfg(test)]
pub(crate) mod testing;

/// URI SAN scheme carrying the region a certificate was issued for.
pub const REGION_URI_PREFIX: &str = "region://";

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
