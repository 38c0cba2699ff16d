// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Node Startup
//!
//! [`NodeMgr`] brings up the identity layer of one service process:
//!
//! 1. the access key client (edge nodes only), which may upgrade the key;
//! 2. a direct secret store connection when no access key is in use;
//! 3. the internal PKI;
//! 4. the certificate refresh task.
//!
//! Shutdown goes through [`NodeMgr::finish`], which cancels the refresh task
//! and waits for it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rustls::{ClientConfig, ServerConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::access_api::{AccessApi, HttpAccessApi};
use crate::accesskey::client::AccessKeyClient;
use crate::accesskey::identity::CloudletKey;
use crate::config::{AccessKeyClientConfig, PkiConfig, VaultConfig};
use crate::error::{Error, Result};
use crate::pki::internal::{InternalPki, TlsOptions};
use crate::pki::issuer::{CertIssuer, MatchCa};
use crate::pki::vault::{SecretStore, VaultClient};

/// Kind of service process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Crm,
    Shepherd,
    Dme,
    Controller,
    ClusterSvc,
    NotifyRoot,
    EdgeTurn,
    Mc,
    AutoProv,
    Frm,
}

impl NodeType {
    pub const ALL: [NodeType; 10] = [
        NodeType::Crm,
        NodeType::Shepherd,
        NodeType::Dme,
        NodeType::Controller,
        NodeType::ClusterSvc,
        NodeType::NotifyRoot,
        NodeType::EdgeTurn,
        NodeType::Mc,
        NodeType::AutoProv,
        NodeType::Frm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Crm => "crm",
            NodeType::Shepherd => "shepherd",
            NodeType::Dme => "dme",
            NodeType::Controller => "controller",
            NodeType::ClusterSvc => "cluster-svc",
            NodeType::NotifyRoot => "notifyroot",
            NodeType::EdgeTurn => "edgeturn",
            NodeType::Mc => "mc",
            NodeType::AutoProv => "autoprov",
            NodeType::Frm => "frm",
        }
    }

    /// The agent that owns an edge node's access key and may upgrade it.
    /// Other services on the node only share it.
    pub fn owns_access_key(&self) -> bool {
        matches!(self, NodeType::Crm)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NodeType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::config(format!("unknown node type {s:?}")))
    }
}

/// Everything [`NodeMgr::init`] reads from the environment.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub access_key: AccessKeyClientConfig,
    pub pki: PkiConfig,
    pub vault: VaultConfig,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            access_key: AccessKeyClientConfig::from_env(),
            pki: PkiConfig::from_env(),
            vault: VaultConfig::from_env()?,
        })
    }
}

/// Per-process inputs that do not come from the environment.
#[derive(Default)]
pub struct NodeOptions {
    /// Defaults to the node type name.
    pub name: Option<String>,
    pub internal_domain: String,
    /// Identity of the edge node this process runs on.
    pub cloudlet_key: Option<CloudletKey>,
    /// Connection to the central access API. Edge nodes default to
    /// [`HttpAccessApi`] on the configured address.
    pub access_api: Option<Arc<dyn AccessApi>>,
    /// TLS settings for the default access API connection.
    pub access_api_tls: Option<ClientConfig>,
    /// Overrides the secret store built from [`VaultConfig`].
    pub secret_store: Option<Arc<dyn SecretStore>>,
}

impl NodeOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_internal_domain(mut self, domain: impl Into<String>) -> Self {
        self.internal_domain = domain.into();
        self
    }

    pub fn with_cloudlet_key(mut self, key: CloudletKey) -> Self {
        self.cloudlet_key = Some(key);
        self
    }

    pub fn with_access_api(mut self, api: Arc<dyn AccessApi>) -> Self {
        self.access_api = Some(api);
        self
    }

    pub fn with_access_api_tls(mut self, tls: ClientConfig) -> Self {
        self.access_api_tls = Some(tls);
        self
    }

    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(store);
        self
    }
}

/// Identity layer of a running service.
pub struct NodeMgr {
    node_type: NodeType,
    name: String,
    common_name: String,
    tls_client_issuer: Option<CertIssuer>,
    access_key_client: AccessKeyClient,
    pki: InternalPki,
    shutdown: CancellationToken,
    refresh: Option<JoinHandle<()>>,
}

impl fmt::Debug for NodeMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeMgr")
            .field("node_type", &self.node_type)
            .field("name", &self.name)
            .field("common_name", &self.common_name)
            .field("tls_client_issuer", &self.tls_client_issuer)
            .field("access_key_state", &self.access_key_client.state())
            .field("pki", &self.pki.description())
            .finish()
    }
}

impl NodeMgr {
    /// Bring up the access key client, PKI and refresh task.
    ///
    /// `tls_client_issuer` is the trust domain this node's client
    /// certificates come from; edge nodes use `RegionalCloudlet`.
    pub async fn init(
        node_type: NodeType,
        tls_client_issuer: Option<CertIssuer>,
        config: NodeConfig,
        opts: NodeOptions,
    ) -> Result<Self> {
        debug!(%node_type, ?tls_client_issuer, "start node init");
        let name = opts.name.unwrap_or_else(|| node_type.to_string());
        let common_name = common_name(node_type, &opts.internal_domain);

        let access_key_client = if tls_client_issuer == Some(CertIssuer::RegionalCloudlet) {
            let key = opts
                .cloudlet_key
                .ok_or_else(|| Error::config("cloudlet key required for cloudlet service"))?;
            let (access_api, access_api_tls) = (opts.access_api, opts.access_api_tls);
            let connect = move |config: &AccessKeyClientConfig| -> Result<Arc<dyn AccessApi>> {
                match access_api {
                    Some(api) => Ok(api),
                    None => Ok(Arc::new(HttpAccessApi::new(config, access_api_tls)?)),
                }
            };
            AccessKeyClient::connect_and_init(
                config.access_key,
                tls_client_issuer,
                node_type,
                &key,
                connect,
            )
            .await
            .inspect_err(|e| warn!(error = %e, "access key client init failed"))?
        } else {
            AccessKeyClient::disabled(config.access_key)
        };

        let secret_store = if access_key_client.is_enabled() {
            None
        } else {
            match opts.secret_store {
                Some(store) => Some(store),
                None => VaultClient::from_config(&config.vault)?
                    .map(|client| Arc::new(client) as Arc<dyn SecretStore>),
            }
        };

        debug!("init internal pki");
        let pki = InternalPki::new(&config.pki, secret_store, Some(access_key_client.clone()))?;

        let shutdown = CancellationToken::new();
        let refresh = pki.start_refresh(shutdown.child_token());

        info!(
            %node_type,
            name = %name,
            pki = pki.description(),
            access_key = ?access_key_client.state(),
            "node initialized"
        );

        Ok(Self {
            node_type,
            name,
            common_name,
            tls_client_issuer,
            access_key_client,
            pki,
            shutdown,
            refresh,
        })
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Certificate common name of this service.
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn access_key_client(&self) -> &AccessKeyClient {
        &self.access_key_client
    }

    pub fn pki(&self) -> &InternalPki {
        &self.pki
    }

    /// Client config presenting this node's certificate.
    ///
    /// Nodes without a client issuer present certificates from the global
    /// trust domain.
    pub async fn client_tls_config(
        &self,
        server_issuers: &[MatchCa],
        opts: TlsOptions,
    ) -> Result<Option<ClientConfig>> {
        let issuer = self.tls_client_issuer.unwrap_or(CertIssuer::Global);
        self.pki
            .get_client_tls_config(&self.common_name, issuer, server_issuers, opts)
            .await
    }

    /// Server config presenting a certificate from `issuer`.
    pub async fn server_tls_config(
        &self,
        issuer: CertIssuer,
        client_issuers: &[MatchCa],
        opts: TlsOptions,
    ) -> Result<Option<ServerConfig>> {
        self.pki
            .get_server_tls_config(&self.common_name, issuer, client_issuers, opts)
            .await
    }

    /// Stop the refresh task.
    pub async fn finish(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.refresh.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "refresh task ended abnormally");
            }
        }
        info!(name = %self.name, "node finished");
    }
}

fn common_name(node_type: NodeType, internal_domain: &str) -> String {
    let cn = match node_type {
        NodeType::Controller => "ctrl",
        other => other.as_str(),
    };
    if internal_domain.is_empty() {
        cn.to_string()
    } else {
        format!("{cn}.{internal_domain}")
    }
}
