// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Access key authentication errors.
//!
//! Variants are detailed so they can be logged and asserted on in tests, but
//! every one of them renders to the caller as the same generic 401.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Message returned to the caller for every authentication failure.
pub const GENERIC_AUTH_MESSAGE: &str = "access key authentication failed";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Required request metadata key absent
    #[error("missing {0} in request metadata")]
    MissingMetadata(&'static str),

    #[error("failed to parse access key data: {0}")]
    MalformedIdentity(String),

    /// No node record for the claimed identity
    #[error("cloudlet {0} not found")]
    NodeNotFound(String),

    #[error("no access public key registered for cloudlet {0}")]
    NoPublicKey(String),

    /// Only the upgrade method is allowed until the key is rotated
    #[error("access key upgrade required, method {method} not allowed")]
    UpgradeRequired { method: String },

    #[error("failed to decode access key signature")]
    BadSignatureEncoding,

    #[error("failed to verify access key signature")]
    InvalidSignature,

    #[error("vault signature auth not configured")]
    VaultSigNotConfigured,

    #[error("vault signature only allowed for access key upgrade, not {0}")]
    VaultSigWrongMethod(String),

    #[error("vault signature does not match")]
    VaultSigMismatch,

    #[error("stored access public key for cloudlet {0} is invalid")]
    BadStoredKey(String),

    /// What callers of the access API see for any of the above
    #[error("access key authentication failed")]
    Unauthenticated,
}

#[derive(Serialize)]
struct AuthErrorBody {
    error: String,
    error_code: String,
}

impl AuthError {
    /// Internal classification used in logs only.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::MissingMetadata(_) => "missing_metadata",
            AuthError::MalformedIdentity(_) => "malformed_identity",
            AuthError::NodeNotFound(_) => "node_not_found",
            AuthError::NoPublicKey(_) => "no_public_key",
            AuthError::UpgradeRequired { .. } => "upgrade_required",
            AuthError::BadSignatureEncoding => "bad_signature_encoding",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::VaultSigNotConfigured => "vault_sig_not_configured",
            AuthError::VaultSigWrongMethod(_) => "vault_sig_wrong_method",
            AuthError::VaultSigMismatch => "vault_sig_mismatch",
            AuthError::BadStoredKey(_) => "bad_stored_key",
            AuthError::Unauthenticated => "unauthenticated",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = Json(AuthErrorBody {
            error: GENERIC_AUTH_MESSAGE.to_string(),
            error_code: "unauthenticated".to_string(),
        });
        (self.status_code(), body).into_response()
    }
}
