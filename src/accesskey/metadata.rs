// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Request metadata carried with every access-key authenticated call.
//!
//! | Key | Value |
//! |-----|-------|
//! | `access-key-data` | canonical `CloudletKey` JSON |
//! | `access-key-sig` | base64 Ed25519 signature over `access-key-data` |
//! | `vault-key-sig` | legacy shared secret (role id followed by secret id) |
//! | `access-key-verify-only` | present when a non-owning service only verifies |

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64ct::{Base64, Encoding};
use ed25519_dalek::{Signer, SigningKey};
use tracing::debug;

use super::identity::CloudletKey;
use crate::config::VaultCredentials;
use crate::error::{Error, Result};

pub const ACCESS_KEY_DATA: &str = "access-key-data";
pub const ACCESS_KEY_SIG: &str = "access-key-sig";
pub const VAULT_KEY_SIG: &str = "vault-key-sig";
pub const ACCESS_KEY_VERIFY_ONLY: &str = "access-key-verify-only";

/// Outcome of a successful signature check.
///
/// Attached to the request extensions for the lifetime of one call and never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyVerified {
    pub key: CloudletKey,
    pub upgrade_required: bool,
}

/// Signs the node identity with the loaded access key.
///
/// Signing is pure computation; cloning shares the key.
#[derive(Clone)]
pub struct AccessKeySigner {
    signing_key: Arc<SigningKey>,
    identity: Arc<str>,
}

impl std::fmt::Debug for AccessKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessKeySigner")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl AccessKeySigner {
    pub fn new(signing_key: SigningKey, key: &CloudletKey) -> Result<Self> {
        let identity = key.canonical()?;
        Ok(Self {
            signing_key: Arc::new(signing_key),
            identity: identity.into(),
        })
    }

    /// The canonical identity string that gets signed.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Base64 signature over the identity.
    pub fn signature(&self) -> String {
        let sig = self.signing_key.sign(self.identity.as_bytes());
        Base64::encode_string(&sig.to_bytes())
    }

    /// Attach identity and signature to outgoing request metadata.
    pub fn add_access_key_sig(&self, headers: &mut HeaderMap) -> Result<()> {
        let sig = self.signature();
        debug!(sig = %sig, "adding access key signature");
        insert(headers, ACCESS_KEY_DATA, &self.identity)?;
        insert(headers, ACCESS_KEY_SIG, &sig)
    }

    /// Fresh metadata map carrying only the access key signature.
    pub fn signed_metadata(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        self.add_access_key_sig(&mut headers)?;
        Ok(headers)
    }
}

/// Attach the legacy secret-store credential instead of a signature.
pub fn add_vault_key_sig(
    headers: &mut HeaderMap,
    identity: &str,
    creds: &VaultCredentials,
) -> Result<()> {
    insert(headers, ACCESS_KEY_DATA, identity)?;
    insert(headers, VAULT_KEY_SIG, &creds.shared_secret())
}

pub fn set_verify_only(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static(ACCESS_KEY_VERIFY_ONLY),
        HeaderValue::from_static("true"),
    );
}

pub fn is_verify_only(headers: &HeaderMap) -> bool {
    metadata_str(headers, ACCESS_KEY_VERIFY_ONLY).is_some_and(|v| v == "true")
}

/// First non-empty value for `name`, if it is valid text.
pub fn metadata_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::transport(format!("invalid {name} metadata value: {e}")))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}
