// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Environment variable names, defaults and the typed config structs handed
//! to each component's constructor. No credential lives in process globals,
//! so several independent instances can coexist (tests do this).
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `ACCESS_KEY_FILE` | Access private key path (empty disables) | `/root/accesskey/priv.key` |
//! | `ACCESS_API_ADDR` | Central access API address, `notls://` for plaintext | `127.0.0.1:41001` |
//! | `REQUIRE_ACCESS_KEY` | Fail instead of falling back to vault credentials | `false` |
//! | `VAULT_ROLE_ID` / `VAULT_SECRET_ID` | Legacy secret-store credentials | unset |
//! | `CRM_VAULT_ROLE_ID` / `CRM_VAULT_SECRET_ID` | Legacy credentials accepted for upgrade | unset |
//! | `VAULT_ADDR` | Secret store address | unset |
//! | `INTERNAL_TLS_CERT_FILE` / `INTERNAL_TLS_KEY_FILE` / `INTERNAL_TLS_CA_FILE` | File based PKI | unset |
//! | `USE_VAULT_CAS` / `USE_VAULT_CERTS` | Vault backed PKI modes | `false` |
//! | `REGION` | Local region | empty |
//! | `E2ETEST_TLS` | Shortened timers for end-to-end tests | unset |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

pub const ACCESS_KEY_FILE_ENV: &str = "ACCESS_KEY_FILE";
pub const ACCESS_API_ADDR_ENV: &str = "ACCESS_API_ADDR";
pub const REQUIRE_ACCESS_KEY_ENV: &str = "REQUIRE_ACCESS_KEY";
pub const VAULT_ROLE_ID_ENV: &str = "VAULT_ROLE_ID";
pub const VAULT_SECRET_ID_ENV: &str = "VAULT_SECRET_ID";
pub const CRM_VAULT_ROLE_ID_ENV: &str = "CRM_VAULT_ROLE_ID";
pub const CRM_VAULT_SECRET_ID_ENV: &str = "CRM_VAULT_SECRET_ID";
pub const VAULT_ADDR_ENV: &str = "VAULT_ADDR";
pub const INTERNAL_TLS_CERT_FILE_ENV: &str = "INTERNAL_TLS_CERT_FILE";
pub const INTERNAL_TLS_KEY_FILE_ENV: &str = "INTERNAL_TLS_KEY_FILE";
pub const INTERNAL_TLS_CA_FILE_ENV: &str = "INTERNAL_TLS_CA_FILE";
pub const USE_VAULT_CAS_ENV: &str = "USE_VAULT_CAS";
pub const USE_VAULT_CERTS_ENV: &str = "USE_VAULT_CERTS";
pub const REGION_ENV: &str = "REGION";
pub const E2ETEST_TLS_ENV: &str = "E2ETEST_TLS";

pub const DEFAULT_ACCESS_KEY_FILE: &str = "/root/accesskey/priv.key";
pub const DEFAULT_ACCESS_API_ADDR: &str = "127.0.0.1:41001";

/// Address prefix selecting a plaintext access API connection.
pub const NOTLS_PREFIX: &str = "notls://";

pub const DEFAULT_BAD_AUTH_DELAY: Duration = Duration::from_secs(3);
pub const E2E_BAD_AUTH_DELAY: Duration = Duration::from_millis(1);

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(48 * 60 * 60);
pub const E2E_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Attempts made by verify-only services while the owning agent may be
/// mid-upgrade.
pub const DEFAULT_VERIFY_RETRY: u32 = 30;
pub const DEFAULT_VERIFY_DELAY: Duration = Duration::from_secs(1);

/// Parse a boolean flag the way the deployment scripts set them.
pub fn parse_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn is_e2e(lookup: &impl Fn(&str) -> Option<String>) -> bool {
    non_empty(lookup(E2ETEST_TLS_ENV)).is_some()
}

/// AppRole credentials for the secret store.
///
/// Also used as the legacy shared secret (role id followed by secret id).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct VaultCredentials {
    pub role_id: String,
    pub secret_id: String,
}

impl std::fmt::Debug for VaultCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultCredentials")
            .field("role_id", &self.role_id)
            .field("secret_id", &"<redacted>")
            .finish()
    }
}

impl VaultCredentials {
    pub fn new(role_id: impl Into<String>, secret_id: impl Into<String>) -> Self {
        Self {
            role_id: role_id.into(),
            secret_id: secret_id.into(),
        }
    }

    fn from_vars(
        lookup: &impl Fn(&str) -> Option<String>,
        role_var: &str,
        secret_var: &str,
    ) -> Self {
        Self {
            role_id: lookup(role_var).unwrap_or_default(),
            secret_id: lookup(secret_var).unwrap_or_default(),
        }
    }

    /// Both halves present.
    pub fn is_set(&self) -> bool {
        !self.role_id.is_empty() && !self.secret_id.is_empty()
    }

    pub fn shared_secret(&self) -> String {
        format!("{}{}", self.role_id, self.secret_id)
    }
}

/// Edge-side access key client settings.
#[derive(Debug, Clone)]
pub struct AccessKeyClientConfig {
    /// `None` means no key file is configured.
    pub key_file: Option<PathBuf>,
    pub access_api_addr: String,
    pub require_access_key: bool,
    pub vault_creds: VaultCredentials,
    pub verify_retry: u32,
    pub verify_delay: Duration,
    pub test_mode: bool,
}

impl Default for AccessKeyClientConfig {
    fn default() -> Self {
        Self {
            key_file: Some(PathBuf::from(DEFAULT_ACCESS_KEY_FILE)),
            access_api_addr: DEFAULT_ACCESS_API_ADDR.to_string(),
            require_access_key: false,
            vault_creds: VaultCredentials::default(),
            verify_retry: DEFAULT_VERIFY_RETRY,
            verify_delay: DEFAULT_VERIFY_DELAY,
            test_mode: false,
        }
    }
}

impl AccessKeyClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let key_file = match lookup(ACCESS_KEY_FILE_ENV) {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => defaults.key_file,
        };
        Self {
            key_file,
            access_api_addr: non_empty(lookup(ACCESS_API_ADDR_ENV))
                .unwrap_or(defaults.access_api_addr),
            require_access_key: parse_flag(lookup(REQUIRE_ACCESS_KEY_ENV).as_deref()),
            vault_creds: VaultCredentials::from_vars(&lookup, VAULT_ROLE_ID_ENV, VAULT_SECRET_ID_ENV),
            test_mode: is_e2e(&lookup),
            ..defaults
        }
    }

    /// Plaintext connection to the access API: a `notls://` address or
    /// end-to-end test mode.
    pub fn plaintext(&self) -> bool {
        self.test_mode || self.access_api_addr.starts_with(NOTLS_PREFIX)
    }

    /// Address with any scheme prefix removed.
    pub fn access_api_host(&self) -> &str {
        self.access_api_addr
            .strip_prefix(NOTLS_PREFIX)
            .unwrap_or(&self.access_api_addr)
    }
}

/// Central-service access key verification settings.
#[derive(Debug, Clone)]
pub struct AccessKeyServerConfig {
    /// Legacy credentials accepted on the upgrade method only.
    pub crm_vault_creds: VaultCredentials,
    /// Applied to every failed verification before replying.
    pub bad_auth_delay: Duration,
    /// TLS-conditional interceptors enforce access keys for edge-issued peers.
    pub require_tls_access_key: bool,
}

impl Default for AccessKeyServerConfig {
    fn default() -> Self {
        Self {
            crm_vault_creds: VaultCredentials::default(),
            bad_auth_delay: DEFAULT_BAD_AUTH_DELAY,
            require_tls_access_key: true,
        }
    }
}

impl AccessKeyServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bad_auth_delay = if is_e2e(&lookup) {
            E2E_BAD_AUTH_DELAY
        } else {
            DEFAULT_BAD_AUTH_DELAY
        };
        Self {
            crm_vault_creds: VaultCredentials::from_vars(
                &lookup,
                CRM_VAULT_ROLE_ID_ENV,
                CRM_VAULT_SECRET_ID_ENV,
            ),
            bad_auth_delay,
            ..Self::default()
        }
    }
}

/// Direct secret store connection settings.
#[derive(Debug, Clone, Default)]
pub struct VaultConfig {
    pub addr: Option<Url>,
    pub creds: VaultCredentials,
}

impl VaultConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let addr = non_empty(lookup(VAULT_ADDR_ENV))
            .map(|a| {
                Url::parse(&a)
                    .map(with_trailing_slash)
                    .map_err(|e| Error::config(format!("invalid {VAULT_ADDR_ENV} {a:?}: {e}")))
            })
            .transpose()?;
        Ok(Self {
            addr,
            creds: VaultCredentials::from_vars(&lookup, VAULT_ROLE_ID_ENV, VAULT_SECRET_ID_ENV),
        })
    }
}

/// `url` with its path ending in `/`, so relative joins append to the last
/// segment instead of replacing it.
pub fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Internal PKI settings.
#[derive(Debug, Clone)]
pub struct PkiConfig {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub use_vault_cas: bool,
    pub use_vault_certs: bool,
    pub region: String,
    pub refresh_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            cert_file: None,
            key_file: None,
            ca_file: None,
            use_vault_cas: false,
            use_vault_certs: false,
            region: String::new(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl PkiConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |name: &str| non_empty(lookup(name)).map(PathBuf::from);
        let refresh_interval = if is_e2e(&lookup) {
            E2E_REFRESH_INTERVAL
        } else {
            DEFAULT_REFRESH_INTERVAL
        };
        Self {
            cert_file: path(INTERNAL_TLS_CERT_FILE_ENV),
            key_file: path(INTERNAL_TLS_KEY_FILE_ENV),
            ca_file: path(INTERNAL_TLS_CA_FILE_ENV),
            use_vault_cas: parse_flag(lookup(USE_VAULT_CAS_ENV).as_deref()),
            use_vault_certs: parse_flag(lookup(USE_VAULT_CERTS_ENV).as_deref()),
            region: lookup(REGION_ENV).unwrap_or_default(),
            refresh_interval,
            ..Self::default()
        }
    }
}
