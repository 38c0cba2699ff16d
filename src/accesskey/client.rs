// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Access Key Client
//!
//! Edge-node side of access key authentication.
//!
//! ## States
//!
//! ```text
//! Disabled      node is not issued by the edge trust domain
//! LegacyVault   no key file configured, secret store creds only
//! Active        key loaded, upgraded or verified against the server
//! ```
//!
//! Loading and upgrading happen inside [`AccessKeyClient::init`]; a client is
//! only handed out once it reaches one of the states above.
//!
//! ## Upgrade exchange
//!
//! The key owner (CRM) upgrades on every start. On a new key it:
//! 1. renames the current key file to `<path>.backup`
//! 2. writes the new key to the primary path (temp file + rename)
//! 3. acknowledges on the stream
//! 4. waits for the server's `commit-complete`
//!
//! A failed write restores the backup. If the ack is lost the next start
//! fails with the new key, retries with the backup key (which still matches
//! the server's record) and receives another new key.
//!
//! Other node types share the key file and only verify it, retrying while
//! the owner may be mid-upgrade.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::{HeaderMap, Request};
use tower::{Layer, Service};
use tracing::{debug, info, warn};

use super::codec::load_priv_pem;
use super::identity::CloudletKey;
use super::keyfile::KeyFile;
use super::metadata::{add_vault_key_sig, set_verify_only, AccessKeySigner};
use super::stream::UpgradeClientMsg;
use crate::access_api::{AccessApi, GetCasRequest, IssueCertRequest};
use crate::config::AccessKeyClientConfig;
use crate::error::{Error, Result};
use crate::node::NodeType;
use crate::pki::cert::IssuedCert;
use crate::pki::issuer::CertIssuer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKeyState {
    Disabled,
    LegacyVault,
    Active,
}

/// Result of one upgrade exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    NotNeeded,
    Upgraded,
    Verified,
}

#[derive(Clone)]
pub struct AccessKeyClient {
    config: Arc<AccessKeyClientConfig>,
    state: AccessKeyState,
    signer: Option<AccessKeySigner>,
    api: Option<Arc<dyn AccessApi>>,
}

impl std::fmt::Debug for AccessKeyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessKeyClient")
            .field("state", &self.state)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl AccessKeyClient {
    /// A client that never signs anything.
    pub fn disabled(config: AccessKeyClientConfig) -> Self {
        Self::with_state(config, AccessKeyState::Disabled)
    }

    fn with_state(config: AccessKeyClientConfig, state: AccessKeyState) -> Self {
        Self {
            config: Arc::new(config),
            state,
            signer: None,
            api: None,
        }
    }

    /// Bring up the client for a node.
    ///
    /// Only nodes whose client certificates come from the edge trust domain
    /// use access keys. The identity is validated before any network call.
    pub async fn init(
        config: AccessKeyClientConfig,
        tls_client_issuer: Option<CertIssuer>,
        node_type: NodeType,
        key: &CloudletKey,
        api: Arc<dyn AccessApi>,
    ) -> Result<Self> {
        Self::connect_and_init(config, tls_client_issuer, node_type, key, |_| Ok(api)).await
    }

    /// [`init`](Self::init) with the access API built by `connect`.
    ///
    /// `connect` only runs once a key file and address are configured, so
    /// disabled and legacy vault nodes never need an access API.
    pub async fn connect_and_init<F>(
        config: AccessKeyClientConfig,
        tls_client_issuer: Option<CertIssuer>,
        node_type: NodeType,
        key: &CloudletKey,
        connect: F,
    ) -> Result<Self>
    where
        F: FnOnce(&AccessKeyClientConfig) -> Result<Arc<dyn AccessApi>> + Send,
    {
        if tls_client_issuer != Some(CertIssuer::RegionalCloudlet) {
            info!(?tls_client_issuer, "not cloudlet service, no access key required");
            return Ok(Self::disabled(config));
        }
        key.validate()?;
        let identity = key.canonical()?;

        let Some(path) = config.key_file.clone() else {
            if config.require_access_key {
                return Err(Error::config("access key not specified for cloudlet service"));
            }
            info!(cloudlet = %key, "no access key file, using legacy vault credentials");
            return Ok(Self::with_state(config, AccessKeyState::LegacyVault));
        };
        if config.access_api_addr.is_empty() {
            return Err(Error::config("access API address not specified"));
        }
        let api = connect(&config)?;

        let exchange = Exchange {
            config: &config,
            key_file: KeyFile::new(path),
            key,
            identity,
            api: api.as_ref(),
        };
        debug!(cloudlet = %key, %node_type, "loading access key");
        if node_type.owns_access_key() {
            exchange.upgrade_with_backup().await?;
        } else {
            exchange.verify_with_retry().await?;
        }

        let signing_key = exchange.key_file.load()?;
        let signer = AccessKeySigner::new(signing_key, key)?;
        info!(cloudlet = %key, "access key client enabled");

        Ok(Self {
            config: Arc::new(config),
            state: AccessKeyState::Active,
            signer: Some(signer),
            api: Some(api),
        })
    }

    pub fn state(&self) -> AccessKeyState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == AccessKeyState::Active
    }

    pub fn config(&self) -> &AccessKeyClientConfig {
        &self.config
    }

    /// Sign outgoing request metadata. No-op unless enabled.
    pub fn add_access_key_sig(&self, headers: &mut HeaderMap) -> Result<()> {
        match &self.signer {
            Some(signer) => signer.add_access_key_sig(headers),
            None => Ok(()),
        }
    }

    /// Tower layer signing every request passing through it.
    pub fn layer(&self) -> AddAccessKeyLayer {
        AddAccessKeyLayer {
            signer: self.signer.clone(),
        }
    }

    fn active(&self) -> Result<(&dyn AccessApi, &AccessKeySigner)> {
        match (&self.api, &self.signer) {
            (Some(api), Some(signer)) => Ok((api.as_ref(), signer)),
            _ => Err(Error::config("access key client not enabled")),
        }
    }

    /// Have the central service issue a regional-cloudlet certificate.
    pub async fn issue_cert(&self, common_name: &str) -> Result<IssuedCert> {
        let (api, signer) = self.active()?;
        let reply = api
            .issue_cert(
                signer.signed_metadata()?,
                IssueCertRequest {
                    common_name: common_name.to_string(),
                },
            )
            .await?;
        Ok(IssuedCert {
            public_cert_pem: reply.public_cert_pem,
            private_key_pem: reply.private_key_pem,
        })
    }

    /// Fetch an issuer's CA chain from the central service.
    pub async fn get_cas(&self, issuer: CertIssuer) -> Result<String> {
        let (api, signer) = self.active()?;
        let reply = api
            .get_cas(signer.signed_metadata()?, GetCasRequest { issuer })
            .await?;
        Ok(reply.ca_chain_pem)
    }
}

/// One node's upgrade or verify attempts during init.
struct Exchange<'a> {
    config: &'a AccessKeyClientConfig,
    key_file: KeyFile,
    key: &'a CloudletKey,
    identity: String,
    api: &'a dyn AccessApi,
}

impl Exchange<'_> {
    fn signer(&self, backup: bool) -> Result<AccessKeySigner> {
        let key = if backup {
            self.key_file.load_backup()?
        } else {
            self.key_file.load()?
        };
        AccessKeySigner::new(key, self.key)
    }

    /// Upgrade with the primary key, falling back to the backup key.
    async fn upgrade_with_backup(&self) -> Result<UpgradeOutcome> {
        // A missing primary is expected on first run.
        let primary = match self.signer(false) {
            Ok(signer) => Some(signer),
            Err(e) => {
                info!(error = %e, "access key upgrade load");
                None
            }
        };
        let err = match self.exchange(primary.as_ref(), false, false).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };

        info!(error = %err, "upgrade failed, try backup key");
        let backup = match self.signer(true) {
            Ok(signer) => signer,
            Err(bkerr) => {
                info!(error = %bkerr, "backup key load");
                return Err(err);
            }
        };
        self.exchange(Some(&backup), false, true).await
    }

    async fn verify_with_retry(&self) -> Result<UpgradeOutcome> {
        let mut last = Error::upgrade("access key not verified");
        for attempt in 0..self.config.verify_retry {
            if attempt != 0 {
                tokio::time::sleep(self.config.verify_delay).await;
            }
            let signer = match self.signer(false) {
                Ok(signer) => signer,
                Err(e) => {
                    debug!(attempt, error = %e, "verify access key load");
                    last = e;
                    continue;
                }
            };
            match self.exchange(Some(&signer), true, false).await {
                Ok(outcome) => {
                    info!(attempt, "access key verified");
                    return Ok(outcome);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "verify access key failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// One exchange over a fresh upgrade stream.
    ///
    /// With `from_backup` the caller authenticated with the backup key, so
    /// the primary file holds an uncommitted key: it is overwritten rather
    /// than backed up, and on "not needed" the backup is restored.
    async fn exchange(
        &self,
        signer: Option<&AccessKeySigner>,
        verify_only: bool,
        from_backup: bool,
    ) -> Result<UpgradeOutcome> {
        let mut metadata = HeaderMap::new();
        if let Some(signer) = signer {
            debug!("use access key creds");
            signer.add_access_key_sig(&mut metadata)?;
        } else if self.config.vault_creds.is_set() {
            debug!("use vault creds");
            add_vault_key_sig(&mut metadata, &self.identity, &self.config.vault_creds)?;
        } else {
            return Err(Error::upgrade("no credentials found"));
        }
        if verify_only {
            set_verify_only(&mut metadata);
        }

        let mut stream = self.api.upgrade_access_key(metadata).await?;
        let reply = stream.recv().await?;

        if verify_only {
            if reply.crm_private_access_key.is_empty() {
                return Ok(UpgradeOutcome::Verified);
            }
            return Err(Error::upgrade("verify-only unexpected response"));
        }

        if reply.crm_private_access_key.is_empty() {
            if from_backup {
                info!("restore backup key");
                self.key_file.restore_backup()?;
            }
            debug!("no upgrade required");
            return Ok(UpgradeOutcome::NotNeeded);
        }

        debug!(cloudlet = %self.key, "upgrading access key");
        load_priv_pem(reply.crm_private_access_key.as_bytes())?;
        let backed_up = if from_backup {
            false
        } else {
            self.key_file.backup_current()?
        };
        if let Err(e) = self.key_file.write(&reply.crm_private_access_key) {
            if backed_up {
                if let Err(undo) = self.key_file.restore_backup() {
                    warn!(error = %undo, "restore from backup failed");
                }
            }
            return Err(e);
        }

        // New key on disk, old key in the backup: either one authenticates
        // whether or not the server sees this ack.
        debug!("sending ack");
        stream.send(UpgradeClientMsg::ack()).await?;
        stream.committed().await?;
        info!(cloudlet = %self.key, path = %self.key_file.path().display(), "access key upgraded");
        Ok(UpgradeOutcome::Upgraded)
    }
}

/// Layer adding the access key signature to outgoing requests.
#[derive(Debug, Clone)]
pub struct AddAccessKeyLayer {
    signer: Option<AccessKeySigner>,
}

impl<S> Layer<S> for AddAccessKeyLayer {
    type Service = AddAccessKey<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AddAccessKey {
            inner,
            signer: self.signer.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AddAccessKey<S> {
    inner: S,
    signer: Option<AccessKeySigner>,
}

impl<S, B> Service<Request<B>> for AddAccessKey<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        if let Some(signer) = &self.signer {
            if let Err(e) = signer.add_access_key_sig(req.headers_mut()) {
                warn!(error = %e, "failed to sign request");
            }
        }
        self.inner.call(req)
    }
}
