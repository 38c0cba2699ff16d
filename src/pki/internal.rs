// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Internal PKI
//!
//! Owns this node's TLS identities and the CA pools used to validate peers.
//!
//! ## Sources
//!
//! | Mode | Leaf certificate | CA pool |
//! |------|------------------|---------|
//! | `FileOnly` | cert/key files | CA file |
//! | `VaultCasOnly` | cert/key files | CA file + secret store CAs |
//! | `VaultCerts` | issued per `CertId`, cached, refreshed | CA file + secret store CAs |
//!
//! When an access key client is enabled, issuance and CA reads go through the
//! central service instead of the secret store.
//!
//! ## Locking
//!
//! The cache mutex is never held across an await. Issuance happens outside
//! the lock and the result is installed afterwards, so a slow issuance does
//! not block handshakes for other ids.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::cert::{certified_key, certs_from_pem, CertId, IssuedCert, PeerCertChain};
use super::issuer::{CertIssuer, MatchCa};
use super::resolver::{CachedCertResolver, CertificateSource};
use super::vault::{role_for_region, IssueCertParams, SecretStore};
use super::verifier::{
    build_chain, PolicyClientCertVerifier, PolicyServerCertVerifier, RegionPolicy,
    SkipServerVerification,
};
use crate::accesskey::client::AccessKeyClient;
use crate::config::PkiConfig;
use crate::error::{Error, Result};

/// How this node obtains certificates, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkiMode {
    Disabled,
    FileOnly,
    VaultCasOnly,
    VaultCerts,
}

/// Per-config TLS switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// Client side: accept any server certificate.
    pub skip_verify: bool,
    /// Server side: do not request client certificates.
    pub no_mutual_auth: bool,
}

impl TlsOptions {
    pub fn with_skip_verify(mut self, skip_verify: bool) -> Self {
        self.skip_verify = skip_verify;
        self
    }

    pub fn with_no_mutual_auth(mut self, no_mutual_auth: bool) -> Self {
        self.no_mutual_auth = no_mutual_auth;
        self
    }
}

#[derive(Default)]
struct PkiCache {
    certs: HashMap<CertId, Arc<CertifiedKey>>,
    cas: HashMap<CertIssuer, Vec<CertificateDer<'static>>>,
}

struct Inner {
    use_vault_cas: bool,
    use_vault_certs: bool,
    file_cert: Option<Arc<CertifiedKey>>,
    file_cas: Vec<CertificateDer<'static>>,
    local_region: String,
    secret_store: Option<Arc<dyn SecretStore>>,
    access_key_client: Option<AccessKeyClient>,
    description: String,
    cache: Mutex<PkiCache>,
    refresh_trigger: Notify,
    refresh_interval: Duration,
    retry_interval: Duration,
}

/// Shared handle to the node's PKI state. Clones share the cache.
#[derive(Clone)]
pub struct InternalPki {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InternalPki {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalPki")
            .field("mode", &self.mode())
            .field("description", &self.inner.description)
            .field("local_region", &self.inner.local_region)
            .finish_non_exhaustive()
    }
}

impl InternalPki {
    /// Build the PKI from configuration.
    ///
    /// An enabled `access_key_client` takes precedence over `secret_store`;
    /// a node that has one never talks to the secret store directly.
    pub fn new(
        config: &PkiConfig,
        secret_store: Option<Arc<dyn SecretStore>>,
        access_key_client: Option<AccessKeyClient>,
    ) -> Result<Self> {
        let mut desc = Vec::new();

        let mut file_cert = None;
        let mut file_cas = Vec::new();
        match (&config.cert_file, &config.key_file, &config.ca_file) {
            (None, None, None) => {}
            (Some(cert), Some(key), Some(ca)) => {
                info!(cert_file = %cert.display(), key_file = %key.display(), ca_file = %ca.display(), "enable TLS from files");
                let (cert, cas) = load_files(cert, key, ca)?;
                file_cert = Some(cert);
                file_cas = cas;
                desc.push("from-file");
            }
            _ => {
                return Err(Error::config(
                    "for internal mTLS authentication between services, all three of key, cert, and CA files must be specified",
                ))
            }
        }

        let access_key_client = access_key_client.filter(AccessKeyClient::is_enabled);
        let secret_store = if access_key_client.is_some() {
            desc.push("useAccessKey");
            None
        } else {
            secret_store
        };

        let use_vault_certs = config.use_vault_certs;
        let use_vault_cas = config.use_vault_cas || use_vault_certs;
        if use_vault_cas {
            if access_key_client.is_none() && secret_store.is_none() {
                return Err(Error::config(
                    "access key file or vault address required for vault CAs or vault certs",
                ));
            }
            info!("enable internal vault PKI CAs");
            desc.push("useVaultCAs");
        }
        if use_vault_certs {
            desc.push("useVaultCerts");
        }

        let description = if desc.is_empty() {
            "none".to_string()
        } else {
            desc.join(",")
        };

        Ok(Self {
            inner: Arc::new(Inner {
                use_vault_cas,
                use_vault_certs,
                file_cert,
                file_cas,
                local_region: config.region.clone(),
                secret_store,
                access_key_client,
                description,
                cache: Mutex::new(PkiCache::default()),
                refresh_trigger: Notify::new(),
                refresh_interval: config.refresh_interval,
                retry_interval: config.retry_interval,
            }),
        })
    }

    /// A PKI that hands out no TLS configs.
    pub fn disabled() -> Self {
        let config = PkiConfig::default();
        Self {
            inner: Arc::new(Inner {
                use_vault_cas: false,
                use_vault_certs: false,
                file_cert: None,
                file_cas: Vec::new(),
                local_region: config.region,
                secret_store: None,
                access_key_client: None,
                description: "none".to_string(),
                cache: Mutex::new(PkiCache::default()),
                refresh_trigger: Notify::new(),
                refresh_interval: config.refresh_interval,
                retry_interval: config.retry_interval,
            }),
        }
    }

    pub fn mode(&self) -> PkiMode {
        if self.inner.use_vault_certs {
            PkiMode::VaultCerts
        } else if self.inner.use_vault_cas {
            PkiMode::VaultCasOnly
        } else if self.inner.file_cert.is_some() {
            PkiMode::FileOnly
        } else {
            PkiMode::Disabled
        }
    }

    /// TLS configs are only produced when a leaf certificate source exists.
    pub fn is_enabled(&self) -> bool {
        self.inner.file_cert.is_some() || self.inner.use_vault_certs
    }

    /// Comma separated summary, e.g. `from-file,useVaultCAs`, or `none`.
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn local_region(&self) -> &str {
        &self.inner.local_region
    }

    pub(super) fn refresh_trigger(&self) -> &Notify {
        &self.inner.refresh_trigger
    }

    pub(super) fn refresh_interval(&self) -> Duration {
        self.inner.refresh_interval
    }

    pub(super) fn retry_interval(&self) -> Duration {
        self.inner.retry_interval
    }

    fn cache(&self) -> MutexGuard<'_, PkiCache> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Client TLS config presenting `{common_name, client_issuer}` and trusting
    /// `server_issuers`. `None` when the PKI is disabled.
    pub async fn get_client_tls_config(
        &self,
        common_name: &str,
        client_issuer: CertIssuer,
        server_issuers: &[MatchCa],
        opts: TlsOptions,
    ) -> Result<Option<ClientConfig>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let id = CertId::new(common_name, client_issuer);
        self.ensure_cert_in_cache(&id).await?;

        let builder = ClientConfig::builder_with_provider(super::crypto_provider())
            .with_safe_default_protocol_versions()?;
        let builder = if opts.skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new()))
        } else {
            let roots = self.get_cas(server_issuers).await?;
            let policy = RegionPolicy::new(server_issuers, self.local_region());
            let verifier = PolicyServerCertVerifier::new(roots, policy)?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
        };
        Ok(Some(builder.with_client_cert_resolver(self.resolver(id))))
    }

    /// Server TLS config presenting `{common_name, server_issuer}` and
    /// requiring client certs from `client_issuers`. `None` when disabled.
    pub async fn get_server_tls_config(
        &self,
        common_name: &str,
        server_issuer: CertIssuer,
        client_issuers: &[MatchCa],
        opts: TlsOptions,
    ) -> Result<Option<ServerConfig>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let id = CertId::new(common_name, server_issuer);
        self.ensure_cert_in_cache(&id).await?;
        let roots = self.get_cas(client_issuers).await?;

        let builder = ServerConfig::builder_with_provider(super::crypto_provider())
            .with_safe_default_protocol_versions()?;
        let builder = if opts.no_mutual_auth {
            builder.with_no_client_auth()
        } else {
            let policy = RegionPolicy::new(client_issuers, self.local_region());
            let verifier = PolicyClientCertVerifier::new(roots, policy)?;
            builder.with_client_cert_verifier(Arc::new(verifier))
        };
        Ok(Some(builder.with_cert_resolver(self.resolver(id))))
    }

    fn resolver(&self, id: CertId) -> Arc<CachedCertResolver> {
        Arc::new(CachedCertResolver::new(Arc::new(self.clone()), id))
    }

    async fn ensure_cert_in_cache(&self, id: &CertId) -> Result<()> {
        if !self.inner.use_vault_certs {
            return Ok(());
        }
        if self.cache().certs.contains_key(id) {
            return Ok(());
        }
        let cert = self.issue_cert(id).await?;
        self.cache().certs.insert(id.clone(), cert);
        Ok(())
    }

    pub(super) async fn issue_cert(&self, id: &CertId) -> Result<Arc<CertifiedKey>> {
        let issued = if self.inner.access_key_client.is_some() {
            self.issue_vault_cert_controller(id).await?
        } else {
            self.issue_vault_cert_direct(id).await?
        };
        issued.to_certified_key()
    }

    /// Issue a leaf straight from the secret store.
    pub async fn issue_vault_cert_direct(&self, id: &CertId) -> Result<IssuedCert> {
        let store = self
            .inner
            .secret_store
            .as_ref()
            .ok_or_else(|| Error::issuance("no secret store configured"))?;
        let role = role_for_region(self.local_region());
        let params = IssueCertParams::new(&id.common_name, self.local_region());
        store.issue_cert(id.issuer, role, &params).await
    }

    async fn issue_vault_cert_controller(&self, id: &CertId) -> Result<IssuedCert> {
        if id.issuer != CertIssuer::RegionalCloudlet {
            return Err(Error::issuance(format!(
                "central service will only issue {} certs, not {}",
                CertIssuer::RegionalCloudlet,
                id.issuer
            )));
        }
        let client = self.inner.access_key_client.as_ref().ok_or_else(|| {
            Error::issuance("access key client not enabled for issuing regional cloudlet cert")
        })?;
        info!(cert_id = %id, "issue cert via central service");
        client.issue_cert(&id.common_name).await
    }

    /// Read an issuer's CA chain straight from the secret store.
    pub async fn get_vault_cas_direct(&self, issuer: CertIssuer) -> Result<String> {
        let store = self
            .inner
            .secret_store
            .as_ref()
            .ok_or_else(|| Error::issuance("no secret store configured"))?;
        store.read_ca_chain(issuer).await
    }

    /// File CAs plus the cached (or freshly fetched) CAs of each issuer.
    async fn get_cas(&self, issuers: &[MatchCa]) -> Result<Vec<CertificateDer<'static>>> {
        let mut pool = self.inner.file_cas.clone();
        if !self.inner.use_vault_cas {
            return Ok(pool);
        }
        for m in issuers {
            let cached = self.cache().cas.get(&m.issuer).cloned();
            let cas = match cached {
                Some(cas) => cas,
                None => {
                    let pem = match &self.inner.access_key_client {
                        Some(client) => client.get_cas(m.issuer).await?,
                        None => self.get_vault_cas_direct(m.issuer).await?,
                    };
                    let cas = certs_from_pem(pem.as_bytes())?;
                    debug!(issuer = %m.issuer, count = cas.len(), "cached CA chain");
                    self.cache().cas.insert(m.issuer, cas.clone());
                    cas
                }
            };
            for ca in cas {
                if !pool.contains(&ca) {
                    pool.push(ca);
                }
            }
        }
        Ok(pool)
    }

    /// Ids with a cached certificate.
    pub fn cached_cert_ids(&self) -> Vec<CertId> {
        let mut ids: Vec<_> = self.cache().certs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(super) fn install_cert(&self, id: CertId, cert: Arc<CertifiedKey>) {
        self.cache().certs.insert(id, cert);
    }

    /// Reconstruct the verified chain of a peer from what it presented and
    /// the CAs known to this node, for the TLS-conditional interceptors.
    pub fn verified_peer_chain(&self, presented: &[CertificateDer<'static>]) -> PeerCertChain {
        let Some((leaf, intermediates)) = presented.split_first() else {
            return PeerCertChain::default();
        };
        let mut roots = self.inner.file_cas.clone();
        roots.extend(self.cache().cas.values().flatten().cloned());
        match build_chain(leaf, intermediates, &roots) {
            Ok(chain) => PeerCertChain(chain),
            Err(_) => PeerCertChain(presented.to_vec()),
        }
    }
}

impl CertificateSource for InternalPki {
    fn lookup(&self, id: &CertId) -> Result<Arc<CertifiedKey>> {
        if self.inner.use_vault_certs {
            return self.cache().certs.get(id).cloned().ok_or_else(|| {
                Error::Tls(format!("cert for {id} not found in internal vault pki cache"))
            });
        }
        self.inner
            .file_cert
            .clone()
            .ok_or_else(|| Error::Tls(format!("internal PKI disabled and no supplied certs for {id}")))
    }
}

fn load_files(
    cert_file: &Path,
    key_file: &Path,
    ca_file: &Path,
) -> Result<(Arc<CertifiedKey>, Vec<CertificateDer<'static>>)> {
    let read = |path: &Path| {
        fs::read(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))
    };
    let cas = certs_from_pem(&read(ca_file)?)
        .map_err(|e| Error::config(format!("failed to parse CA cert {}: {e}", ca_file.display())))?;
    let cert = certified_key(&read(cert_file)?, &read(key_file)?).map_err(|e| {
        Error::config(format!("failed to load key pair {}: {e}", cert_file.display()))
    })?;
    Ok((cert, cas))
}
