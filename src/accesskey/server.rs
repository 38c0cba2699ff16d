// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Access Key Server
//!
//! Central-service side of access key authentication.
//!
//! ## Verification order
//!
//! 1. `access-key-data` must parse as a `CloudletKey` with a node record.
//! 2. With `access-key-sig`: the signature must decode, a public key must be
//!    registered, an upgrade-required node may only call the upgrade method,
//!    and the Ed25519 signature must verify over the exact identity bytes.
//! 3. Otherwise, with `vault-key-sig`: only the upgrade method, only when
//!    legacy credentials are configured, and only on an exact match.
//!
//! Callers only ever see a generic 401; the detailed [`AuthError`] is logged.
//! Every failure costs `bad_auth_delay` before the reply. The delay is per
//! request and does not cap concurrent failing requests.

use std::sync::Arc;

use axum::http::HeaderMap;
use base64ct::{Base64, Encoding};
use ed25519_dalek::{Signature, Verifier};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::codec::{generate_access_key, load_pub_pem};
use super::error::AuthError;
use super::identity::CloudletKey;
use super::metadata::{metadata_str, AccessKeyVerified, ACCESS_KEY_DATA, ACCESS_KEY_SIG, VAULT_KEY_SIG};
use super::stream::{UpgradeServerMsg, UpgradeServerStream, MSG_ACK_NEW_KEY, UPGRADE_ACCESS_KEY_METHOD};
use crate::config::AccessKeyServerConfig;
use crate::error::{Error, Result};
use crate::pki::cert::{CertInfo, PeerCertChain};
use crate::pki::issuer::CertIssuer;
use crate::store::CloudletStore;

#[derive(Clone)]
pub struct AccessKeyServer {
    store: Arc<dyn CloudletStore>,
    config: AccessKeyServerConfig,
}

impl std::fmt::Debug for AccessKeyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessKeyServer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AccessKeyServer {
    pub fn new(store: Arc<dyn CloudletStore>, config: AccessKeyServerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AccessKeyServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CloudletStore> {
        &self.store
    }

    /// Verify the access key signature carried in `headers` for a call to
    /// `method`.
    pub fn verify_access_key_sig(
        &self,
        headers: &HeaderMap,
        method: &str,
    ) -> std::result::Result<AccessKeyVerified, AuthError> {
        let data = metadata_str(headers, ACCESS_KEY_DATA)
            .ok_or(AuthError::MissingMetadata(ACCESS_KEY_DATA))?;
        let key: CloudletKey =
            serde_json::from_str(data).map_err(|e| AuthError::MalformedIdentity(e.to_string()))?;
        let record = self
            .store
            .get(&key)
            .ok_or_else(|| AuthError::NodeNotFound(key.to_string()))?;
        let upgrade_required = record.crm_access_key_upgrade_required;

        if let Some(sig_b64) = metadata_str(headers, ACCESS_KEY_SIG) {
            let sig = Base64::decode_vec(sig_b64).map_err(|_| AuthError::BadSignatureEncoding)?;
            if record.crm_access_public_key.is_empty() {
                return Err(AuthError::NoPublicKey(key.to_string()));
            }
            if upgrade_required && method != UPGRADE_ACCESS_KEY_METHOD {
                return Err(AuthError::UpgradeRequired {
                    method: method.to_string(),
                });
            }
            let public_key = load_pub_pem(record.crm_access_public_key.as_bytes())
                .map_err(|_| AuthError::BadStoredKey(key.to_string()))?;
            let sig = Signature::from_slice(&sig).map_err(|_| AuthError::BadSignatureEncoding)?;
            public_key
                .verify(data.as_bytes(), &sig)
                .map_err(|_| AuthError::InvalidSignature)?;

            debug!(cloudlet = %key, method, "verified access key");
            return Ok(AccessKeyVerified {
                key,
                upgrade_required,
            });
        }

        if let Some(vault_sig) = metadata_str(headers, VAULT_KEY_SIG) {
            if method != UPGRADE_ACCESS_KEY_METHOD {
                return Err(AuthError::VaultSigWrongMethod(method.to_string()));
            }
            let creds = &self.config.crm_vault_creds;
            if !creds.is_set() {
                return Err(AuthError::VaultSigNotConfigured);
            }
            if Sha256::digest(vault_sig.as_bytes()) != Sha256::digest(creds.shared_secret().as_bytes()) {
                return Err(AuthError::VaultSigMismatch);
            }

            debug!(cloudlet = %key, "verified vault credentials");
            return Ok(AccessKeyVerified {
                key,
                upgrade_required: true,
            });
        }

        Err(AuthError::MissingMetadata(ACCESS_KEY_SIG))
    }

    /// [`verify_access_key_sig`](Self::verify_access_key_sig) with the failure
    /// delay applied. Used by every interceptor.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        method: &str,
    ) -> std::result::Result<AccessKeyVerified, AuthError> {
        match self.verify_access_key_sig(headers, method) {
            Ok(verified) => Ok(verified),
            Err(e) => {
                warn!(
                    method,
                    error = %e,
                    error_code = e.error_code(),
                    "access key auth failed"
                );
                tokio::time::sleep(self.config.bad_auth_delay).await;
                Err(e)
            }
        }
    }

    /// True when the peer's verified chain was issued by the edge-node trust
    /// domain, so the call must also carry an access key.
    pub fn is_tls_access_key_required(&self, peer: Option<&PeerCertChain>) -> bool {
        if !self.config.require_tls_access_key {
            return false;
        }
        let Some(chain) = peer else {
            return false;
        };
        chain.0.iter().any(|der| {
            CertInfo::parse(der)
                .ok()
                .and_then(|info| info.ca_issuer())
                .is_some_and(|issuer| issuer == CertIssuer::RegionalCloudlet)
        })
    }

    /// Run the server side of one upgrade exchange.
    ///
    /// Returns the new public key PEM once the client has acknowledged the
    /// private half, or `None` if nothing needs committing. The caller must
    /// commit and then send `commit-complete`; the client waits for it.
    pub async fn upgrade_access_key(
        &self,
        verified: Option<&AccessKeyVerified>,
        verify_only: bool,
        stream: &mut dyn UpgradeServerStream,
    ) -> Result<Option<String>> {
        let verified = verified.ok_or_else(|| Error::upgrade("access key not verified"))?;

        if verify_only {
            debug!(cloudlet = %verified.key, "access key verify only");
            if verified.upgrade_required {
                return Err(Error::upgrade("access key upgrade required"));
            }
            stream.send(UpgradeServerMsg::verified()).await?;
            return Ok(None);
        }

        if !verified.upgrade_required {
            debug!(cloudlet = %verified.key, "access key upgrade not required");
            stream.send(UpgradeServerMsg::not_needed()).await?;
            return Ok(None);
        }

        debug!(cloudlet = %verified.key, "generating new access key");
        let pair = generate_access_key()?;
        stream.send(UpgradeServerMsg::new_key(pair.private_pem.as_str())).await?;

        debug!(cloudlet = %verified.key, "waiting for ack");
        let ack = stream.recv().await?;
        if ack.msg != MSG_ACK_NEW_KEY {
            return Err(Error::upgrade(format!("unexpected upgrade message {:?}", ack.msg)));
        }
        Ok(Some(pair.public_pem))
    }

    /// [`upgrade_access_key`](Self::upgrade_access_key) followed by the commit
    /// to the node record.
    ///
    /// `commit-complete` is only sent once the commit succeeded. A failed
    /// commit ends the stream without it, so the client keeps its backup.
    pub async fn upgrade_and_commit(
        &self,
        verified: Option<&AccessKeyVerified>,
        verify_only: bool,
        stream: &mut dyn UpgradeServerStream,
    ) -> Result<()> {
        let Some(public_pem) = self.upgrade_access_key(verified, verify_only, stream).await? else {
            return Ok(());
        };
        let verified = verified.ok_or_else(|| Error::upgrade("access key not verified"))?;
        self.store
            .commit_access_key(&verified.key, &public_pem)
            .inspect_err(|e| warn!(cloudlet = %verified.key, error = %e, "access key commit failed"))?;
        info!(cloudlet = %verified.key, "access key upgraded");
        stream.send(UpgradeServerMsg::commit_complete()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accesskey::codec::{load_priv_pem, KeyPair};
    use crate::accesskey::metadata::{add_vault_key_sig, AccessKeySigner};
    use crate::accesskey::stream::{upgrade_channel, UpgradeClientMsg, UpgradeClientStream, MSG_NEW_KEY};
    use crate::config::VaultCredentials;
    use crate::pki::testing::TestCa;
    use crate::store::{CloudletRecord, InMemoryCloudletStore};
    use std::time::Duration;

    const METHOD: &str = "/edgeproto.CloudletAccessApi/GetCas";

    fn node() -> CloudletKey {
        CloudletKey::new("acme", "edge-1")
    }

    fn server(store: &Arc<InMemoryCloudletStore>) -> AccessKeyServer {
        let config = AccessKeyServerConfig {
            bad_auth_delay: Duration::from_millis(1),
            ..Default::default()
        };
        AccessKeyServer::new(store.clone(), config)
    }

    fn registered(upgrade_required: bool) -> (Arc<InMemoryCloudletStore>, KeyPair) {
        let store = Arc::new(InMemoryCloudletStore::new());
        let pair = store.bootstrap_cloudlet(&node()).unwrap();
        store.set_upgrade_required(&node(), upgrade_required).unwrap();
        (store, pair)
    }

    fn signed(pair: &KeyPair) -> HeaderMap {
        let key = load_priv_pem(pair.private_pem.as_bytes()).unwrap();
        AccessKeySigner::new(key, &node())
            .unwrap()
            .signed_metadata()
            .unwrap()
    }

    #[test]
    fn valid_signature_is_verified() {
        let (store, pair) = registered(false);
        let verified = server(&store)
            .verify_access_key_sig(&signed(&pair), METHOD)
            .unwrap();
        assert_eq!(
            verified,
            AccessKeyVerified {
                key: node(),
                upgrade_required: false
            }
        );
    }

    #[test]
    fn missing_and_malformed_metadata() {
        let (store, pair) = registered(false);
        let server = server(&store);

        let err = server.verify_access_key_sig(&HeaderMap::new(), METHOD).unwrap_err();
        assert_eq!(err, AuthError::MissingMetadata(ACCESS_KEY_DATA));

        let mut headers = signed(&pair);
        headers.remove(ACCESS_KEY_SIG);
        let err = server.verify_access_key_sig(&headers, METHOD).unwrap_err();
        assert_eq!(err, AuthError::MissingMetadata(ACCESS_KEY_SIG));

        let mut headers = signed(&pair);
        headers.insert(ACCESS_KEY_DATA, "not json".parse().unwrap());
        let err = server.verify_access_key_sig(&headers, METHOD).unwrap_err();
        assert!(matches!(err, AuthError::MalformedIdentity(_)));

        let mut headers = signed(&pair);
        headers.insert(ACCESS_KEY_SIG, "***".parse().unwrap());
        let err = server.verify_access_key_sig(&headers, METHOD).unwrap_err();
        assert_eq!(err, AuthError::BadSignatureEncoding);
    }

    #[test]
    fn unknown_node_and_missing_public_key() {
        let (store, pair) = registered(false);
        let server = server(&store);

        store.remove(&node());
        let err = server.verify_access_key_sig(&signed(&pair), METHOD).unwrap_err();
        assert!(matches!(err, AuthError::NodeNotFound(_)));

        store.insert(CloudletRecord::new(node())).unwrap();
        let err = server.verify_access_key_sig(&signed(&pair), METHOD).unwrap_err();
        assert!(matches!(err, AuthError::NoPublicKey(_)));
    }

    #[test]
    fn upgrade_required_only_allows_upgrade_method() {
        let (store, pair) = registered(true);
        let server = server(&store);

        let err = server.verify_access_key_sig(&signed(&pair), METHOD).unwrap_err();
        assert!(matches!(err, AuthError::UpgradeRequired { .. }));

        let verified = server
            .verify_access_key_sig(&signed(&pair), UPGRADE_ACCESS_KEY_METHOD)
            .unwrap();
        assert!(verified.upgrade_required);
    }

    #[test]
    fn rotated_key_rejects_old_signature() {
        let (store, old) = registered(false);
        let new = generate_access_key().unwrap();
        store.set_public_key(&node(), &new.public_pem).unwrap();

        let err = server(&store)
            .verify_access_key_sig(&signed(&old), METHOD)
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidSignature);
        assert!(server(&store).verify_access_key_sig(&signed(&new), METHOD).is_ok());
    }

    #[test]
    fn tampered_identity_fails() {
        let (store, pair) = registered(false);
        store.insert(CloudletRecord {
            key: Some(CloudletKey::new("acme", "edge-2")),
            crm_access_public_key: pair.public_pem.clone(),
            crm_access_key_upgrade_required: false,
        })
        .unwrap();

        let mut headers = signed(&pair);
        let other = CloudletKey::new("acme", "edge-2").canonical().unwrap();
        headers.insert(ACCESS_KEY_DATA, other.parse().unwrap());
        let err = server(&store).verify_access_key_sig(&headers, METHOD).unwrap_err();
        assert_eq!(err, AuthError::InvalidSignature);
    }

    #[test]
    fn vault_signature_path() {
        let (store, _) = registered(false);
        let identity = node().canonical().unwrap();
        let creds = VaultCredentials::new("role", "secret");

        let mut headers = HeaderMap::new();
        add_vault_key_sig(&mut headers, &identity, &creds).unwrap();

        // Not configured on the server: empty never matches.
        let err = server(&store)
            .verify_access_key_sig(&headers, UPGRADE_ACCESS_KEY_METHOD)
            .unwrap_err();
        assert_eq!(err, AuthError::VaultSigNotConfigured);

        let configured = AccessKeyServer::new(
            store.clone(),
            AccessKeyServerConfig {
                crm_vault_creds: creds.clone(),
                ..Default::default()
            },
        );
        let verified = configured
            .verify_access_key_sig(&headers, UPGRADE_ACCESS_KEY_METHOD)
            .unwrap();
        assert!(verified.upgrade_required);

        let err = configured.verify_access_key_sig(&headers, METHOD).unwrap_err();
        assert!(matches!(err, AuthError::VaultSigWrongMethod(_)));

        let mut wrong = HeaderMap::new();
        add_vault_key_sig(&mut wrong, &identity, &VaultCredentials::new("role", "other")).unwrap();
        let err = configured
            .verify_access_key_sig(&wrong, UPGRADE_ACCESS_KEY_METHOD)
            .unwrap_err();
        assert_eq!(err, AuthError::VaultSigMismatch);
    }

    #[tokio::test]
    async fn authorize_delays_failures() {
        let (store, _) = registered(false);
        let server = AccessKeyServer::new(
            store,
            AccessKeyServerConfig {
                bad_auth_delay: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let start = tokio::time::Instant::now();
        assert!(server.authorize(&HeaderMap::new(), METHOD).await.is_err());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn tls_access_key_required_for_edge_issued_peers() {
        let (store, _) = registered(false);
        let server = server(&store);

        let edge_ca = TestCa::new(CertIssuer::RegionalCloudlet);
        let edge_peer = PeerCertChain(vec![edge_ca.cert_der()]);
        let regional_ca = TestCa::new(CertIssuer::Regional);
        let internal_peer = PeerCertChain(vec![regional_ca.cert_der()]);

        assert!(server.is_tls_access_key_required(Some(&edge_peer)));
        assert!(!server.is_tls_access_key_required(Some(&internal_peer)));
        assert!(!server.is_tls_access_key_required(None));

        let relaxed = AccessKeyServer::new(
            store,
            AccessKeyServerConfig {
                require_tls_access_key: false,
                ..Default::default()
            },
        );
        assert!(!relaxed.is_tls_access_key_required(Some(&edge_peer)));
    }

    #[tokio::test]
    async fn upgrade_not_needed_commits_nothing() {
        let (store, pair) = registered(false);
        let server = server(&store);
        let verified = server.verify_access_key_sig(&signed(&pair), UPGRADE_ACCESS_KEY_METHOD).unwrap();

        let (mut server_stream, mut client_stream) = upgrade_channel();
        let res = server.upgrade_access_key(Some(&verified), false, &mut server_stream).await;
        assert_eq!(res.unwrap(), None);
        assert_eq!(client_stream.recv().await.unwrap(), UpgradeServerMsg::not_needed());
        assert_eq!(store.get(&node()).unwrap().crm_access_public_key, pair.public_pem);
    }

    #[tokio::test]
    async fn upgrade_commits_after_ack() {
        let (store, pair) = registered(true);
        let server = server(&store);
        let verified = server.verify_access_key_sig(&signed(&pair), UPGRADE_ACCESS_KEY_METHOD).unwrap();

        let (mut server_stream, mut client_stream) = upgrade_channel();
        let client = tokio::spawn(async move {
            let msg = client_stream.recv().await.unwrap();
            assert_eq!(msg.msg, MSG_NEW_KEY);
            client_stream.send(UpgradeClientMsg::ack()).await.unwrap();
            client_stream.committed().await.unwrap();
            msg.crm_private_access_key
        });
        server
            .upgrade_and_commit(Some(&verified), false, &mut server_stream)
            .await
            .unwrap();
        drop(server_stream);
        let new_private = client.await.unwrap();

        let record = store.get(&node()).unwrap();
        assert!(!record.crm_access_key_upgrade_required);
        assert_ne!(record.crm_access_public_key, pair.public_pem);

        let new_pair = KeyPair {
            private_pem: new_private,
            public_pem: record.crm_access_public_key.clone(),
        };
        assert!(server.verify_access_key_sig(&signed(&new_pair), METHOD).is_ok());
        assert_eq!(
            server.verify_access_key_sig(&signed(&pair), METHOD).unwrap_err(),
            AuthError::InvalidSignature
        );
    }

    #[tokio::test]
    async fn lost_ack_commits_nothing() {
        let (store, pair) = registered(true);
        let server = server(&store);
        let verified = server.verify_access_key_sig(&signed(&pair), UPGRADE_ACCESS_KEY_METHOD).unwrap();

        let (mut server_stream, mut client_stream) = upgrade_channel();
        let client = tokio::spawn(async move {
            client_stream.recv().await.unwrap();
            drop(client_stream);
        });
        let err = server
            .upgrade_and_commit(Some(&verified), false, &mut server_stream)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        client.await.unwrap();

        let record = store.get(&node()).unwrap();
        assert!(record.crm_access_key_upgrade_required);
        assert_eq!(record.crm_access_public_key, pair.public_pem);
    }

    #[tokio::test]
    async fn failed_commit_is_not_confirmed() {
        use crate::store::tests::CommitFailingStore;

        let (store, pair) = registered(true);
        let server = AccessKeyServer::new(
            Arc::new(CommitFailingStore(store.clone())),
            AccessKeyServerConfig {
                bad_auth_delay: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let verified = server.verify_access_key_sig(&signed(&pair), UPGRADE_ACCESS_KEY_METHOD).unwrap();

        let (mut server_stream, mut client_stream) = upgrade_channel();
        let client = tokio::spawn(async move {
            client_stream.recv().await.unwrap();
            client_stream.send(UpgradeClientMsg::ack()).await.unwrap();
            client_stream.committed().await
        });
        assert!(server
            .upgrade_and_commit(Some(&verified), false, &mut server_stream)
            .await
            .is_err());
        drop(server_stream);

        let err = client.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("closed before commit"));
        let record = store.get(&node()).unwrap();
        assert!(record.crm_access_key_upgrade_required);
        assert_eq!(record.crm_access_public_key, pair.public_pem);
    }

    #[tokio::test]
    async fn verify_only() {
        let (store, pair) = registered(false);
        let server = server(&store);
        let verified = server.verify_access_key_sig(&signed(&pair), UPGRADE_ACCESS_KEY_METHOD).unwrap();

        let (mut server_stream, mut client_stream) = upgrade_channel();
        server.upgrade_access_key(Some(&verified), true, &mut server_stream).await.unwrap();
        assert_eq!(client_stream.recv().await.unwrap(), UpgradeServerMsg::verified());

        let pending = AccessKeyVerified {
            upgrade_required: true,
            ..verified
        };
        let (mut server_stream, _client_stream) = upgrade_channel();
        let err = server
            .upgrade_access_key(Some(&pending), true, &mut server_stream)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upgrade(_)));

        let err = server.upgrade_access_key(None, false, &mut server_stream).await.unwrap_err();
        assert!(matches!(err, Error::Upgrade(_)));
    }
}
