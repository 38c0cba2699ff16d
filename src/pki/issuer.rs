// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Trust domains and the CA matching rules built from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A named certificate authority in the secret store.
///
/// The name doubles as the secret store mount path and as the first DNS name
/// of the CA certificate, which is how peers recognise the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CertIssuer {
    #[serde(rename = "pki-global")]
    Global,
    #[serde(rename = "pki-regional")]
    Regional,
    #[serde(rename = "pki-regional-cloudlet")]
    RegionalCloudlet,
}

impl CertIssuer {
    pub const ALL: [CertIssuer; 3] = [
        CertIssuer::Global,
        CertIssuer::Regional,
        CertIssuer::RegionalCloudlet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CertIssuer::Global => "pki-global",
            CertIssuer::Regional => "pki-regional",
            CertIssuer::RegionalCloudlet => "pki-regional-cloudlet",
        }
    }

    /// Certificates from regional domains must carry a region tag.
    pub fn is_regional(&self) -> bool {
        matches!(self, CertIssuer::Regional | CertIssuer::RegionalCloudlet)
    }

    /// Look up an issuer by its CA DNS name.
    pub fn from_dns_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.as_str() == name)
    }
}

impl fmt::Display for CertIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertIssuer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_dns_name(s).ok_or_else(|| Error::config(format!("unknown cert issuer {s:?}")))
    }
}

/// Which trust domain a TLS config accepts, and whether the peer must be in
/// this node's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchCa {
    pub issuer: CertIssuer,
    pub require_region_match: bool,
}

impl MatchCa {
    pub fn global() -> Self {
        Self {
            issuer: CertIssuer::Global,
            require_region_match: false,
        }
    }

    pub fn any_regional() -> Self {
        Self {
            issuer: CertIssuer::Regional,
            require_region_match: false,
        }
    }

    pub fn same_regional() -> Self {
        Self {
            issuer: CertIssuer::Regional,
            require_region_match: true,
        }
    }

    pub fn same_regional_cloudlet() -> Self {
        Self {
            issuer: CertIssuer::RegionalCloudlet,
            require_region_match: true,
        }
    }
}
