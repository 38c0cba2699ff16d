// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Crate-level error type.
//!
//! Each concern keeps its own error enum ([`KeyError`], [`AuthError`],
//! [`VerifyError`](crate::pki::verifier::VerifyError)); this type wraps them
//! for the public entry points.

use thiserror::Error;

use crate::accesskey::codec::KeyError;
use crate::accesskey::error::AuthError;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or inconsistent configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Access key exchange with the central service failed.
    #[error("access key upgrade failed: {0}")]
    Upgrade(String),

    /// Secret store or mediating channel could not issue a certificate or CA.
    #[error("certificate issuance failed: {0}")]
    Issuance(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn issuance(message: impl Into<String>) -> Self {
        Self::Issuance(message.into())
    }

    pub fn upgrade(message: impl Into<String>) -> Self {
        Self::Upgrade(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// True for a "file not found" I/O error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
