// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Secret store access for certificate issuance.
//!
//! ## Paths
//!
//! | Operation | Path |
//! |-----------|------|
//! | AppRole login | `POST /v1/auth/approle/login` |
//! | Issue leaf | `POST /v1/{issuer}/issue/{role}` |
//! | Read CA chain | `GET /v1/{issuer}/cert/ca` |
//!
//! The role is the local region, or `default` for nodes outside a region.
//! A fresh token is obtained per call; issuance is rare enough that token
//! caching is not worth the renewal bookkeeping.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use url::Url;

use super::cert::IssuedCert;
use super::issuer::CertIssuer;
use super::REGION_URI_PREFIX;
use crate::config::{with_trailing_slash, VaultConfig, VaultCredentials};
use crate::error::{Error, Result};

/// Validity requested for every internal leaf certificate.
pub const CERT_TTL: &str = "72h";

const DEFAULT_ROLE: &str = "default";
const NO_REGION: &str = "none";

/// Body of an issue request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueCertParams {
    pub common_name: String,
    pub ttl: String,
    pub alt_names: String,
    pub ip_sans: String,
    pub uri_sans: String,
}

impl IssueCertParams {
    /// Request for `common_name` issued to a node in `region` (empty for none).
    pub fn new(common_name: &str, region: &str) -> Self {
        let region_tag = if region.is_empty() { NO_REGION } else { region };
        Self {
            common_name: common_name.to_string(),
            ttl: CERT_TTL.to_string(),
            alt_names: format!("*.{common_name},localhost"),
            ip_sans: "127.0.0.1,0.0.0.0".to_string(),
            uri_sans: format!("{REGION_URI_PREFIX}{region_tag}"),
        }
    }
}

/// Issuing role for a region.
pub fn role_for_region(region: &str) -> &str {
    if region.is_empty() {
        DEFAULT_ROLE
    } else {
        region
    }
}

/// The secret store operations the PKI engine consumes.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn issue_cert(
        &self,
        issuer: CertIssuer,
        role: &str,
        params: &IssueCertParams,
    ) -> Result<IssuedCert>;

    /// PEM chain of the issuer's CA.
    async fn read_ca_chain(&self, issuer: CertIssuer) -> Result<String>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    role_id: &'a str,
    secret_id: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
}

#[derive(Deserialize)]
struct SecretResponse {
    #[serde(default)]
    data: Map<String, Value>,
}

/// Vault HTTP client using AppRole login.
#[derive(Debug, Clone)]
pub struct VaultClient {
    http: reqwest::Client,
    addr: Url,
    creds: VaultCredentials,
}

impl VaultClient {
    pub fn new(addr: Url, creds: VaultCredentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::issuance(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            addr: with_trailing_slash(addr),
            creds,
        })
    }

    /// Client for a configured address, `None` if no address is set.
    pub fn from_config(config: &VaultConfig) -> Result<Option<Self>> {
        config
            .addr
            .clone()
            .map(|addr| Self::new(addr, config.creds.clone()))
            .transpose()
    }

    pub fn addr(&self) -> &Url {
        &self.addr
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.addr
            .join(&format!("v1/{path}"))
            .map_err(|e| Error::issuance(format!("invalid vault path {path}: {e}")))
    }

    async fn login(&self) -> Result<String> {
        if !self.creds.is_set() {
            return Err(Error::issuance("vault login failure: no approle credentials"));
        }
        let response = self
            .http
            .post(self.url("auth/approle/login")?)
            .json(&LoginRequest {
                role_id: &self.creds.role_id,
                secret_id: &self.creds.secret_id,
            })
            .send()
            .await
            .map_err(|e| Error::issuance(format!("vault login failure: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::issuance(format!(
                "vault login returned {status}: {body}"
            )));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| Error::issuance(format!("invalid vault login response: {e}")))?;
        Ok(login.auth.client_token)
    }

    async fn secret_data(&self, request: reqwest::RequestBuilder, path: &str) -> Result<Map<String, Value>> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::issuance(format!("vault request {path} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::issuance(format!(
                "vault request {path} returned {status}: {body}"
            )));
        }

        let secret: SecretResponse = response
            .json()
            .await
            .map_err(|e| Error::issuance(format!("invalid vault response for {path}: {e}")))?;
        Ok(secret.data)
    }
}

#[async_trait]
impl SecretStore for VaultClient {
    async fn issue_cert(
        &self,
        issuer: CertIssuer,
        role: &str,
        params: &IssueCertParams,
    ) -> Result<IssuedCert> {
        let path = format!("{issuer}/issue/{role}");
        info!(path = %path, common_name = %params.common_name, uri_sans = %params.uri_sans, "issue internal cert");

        let token = self.login().await?;
        let request = self
            .http
            .post(self.url(&path)?)
            .header("X-Vault-Token", token)
            .json(params);
        let data = self.secret_data(request, &path).await?;

        let public_cert_pem = vault_cert_data(&data, "certificate")
            .map_err(|e| Error::issuance(format!("issueCert certificate data failure: {e}")))?;
        let private_key_pem = vault_cert_data(&data, "private_key")
            .map_err(|e| Error::issuance(format!("issueCert private_key data failure: {e}")))?;
        Ok(IssuedCert {
            public_cert_pem,
            private_key_pem,
        })
    }

    async fn read_ca_chain(&self, issuer: CertIssuer) -> Result<String> {
        let path = format!("{issuer}/cert/ca");
        debug!(path = %path, "read CA chain");

        let token = self.login().await?;
        let request = self.http.get(self.url(&path)?).header("X-Vault-Token", token);
        let data = self.secret_data(request, &path).await?;
        vault_cert_data(&data, "certificate")
    }
}

/// Certificate data may be a single PEM string or a list of them.
pub fn vault_cert_data(data: &Map<String, Value>, key: &str) -> Result<String> {
    let value = data
        .get(key)
        .ok_or_else(|| Error::issuance(format!("key {key} not found in vault data")))?;
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Array(items) => items.iter().try_fold(String::new(), |mut acc, item| match item {
            Value::String(s) => {
                acc.push_str(s);
                Ok(acc)
            }
            other => Err(Error::issuance(format!(
                "list key {key} unexpected data format {other}"
            ))),
        }),
        other => Err(Error::issuance(format!(
            "key {key} unexpected data format {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;

    #[test]
    fn params_for_regional_node() {
        let params = IssueCertParams::new("ctrl.eu", "EU");
        assert_eq!(params.ttl, "72h");
        assert_eq!(params.alt_names, "*.ctrl.eu,localhost");
        assert_eq!(params.ip_sans, "127.0.0.1,0.0.0.0");
        assert_eq!(params.uri_sans, "region://EU");
        assert_eq!(role_for_region("EU"), "EU");
    }

    #[test]
    fn params_for_global_node() {
        let params = IssueCertParams::new("mc", "");
        assert_eq!(params.uri_sans, "region://none");
        assert_eq!(role_for_region(""), "default");
    }

    #[test]
    fn cert_data_string_or_list() {
        let data = json!({
            "certificate": "A",
            "ca_chain": ["B", "C"],
            "serial": 7,
            "mixed": ["D", 1],
        });
        let data = data.as_object().unwrap();
        assert_eq!(vault_cert_data(data, "certificate").unwrap(), "A");
        assert_eq!(vault_cert_data(data, "ca_chain").unwrap(), "BC");
        assert!(vault_cert_data(data, "serial").is_err());
        assert!(vault_cert_data(data, "mixed").is_err());
        assert!(vault_cert_data(data, "missing").is_err());
    }

    #[derive(Clone, Default)]
    struct MockVault {
        issued: Arc<Mutex<Vec<(String, Value)>>>,
    }

    async fn login(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        if body["role_id"] == "role" && body["secret_id"] == "secret" {
            (StatusCode::OK, Json(json!({"auth": {"client_token": "tok"}})))
        } else {
            (StatusCode::FORBIDDEN, Json(json!({"errors": ["permission denied"]})))
        }
    }

    async fn issue(
        State(mock): State<MockVault>,
        Path((mount, role)): Path<(String, String)>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        if headers.get("X-Vault-Token").and_then(|v| v.to_str().ok()) != Some("tok") {
            return (StatusCode::FORBIDDEN, Json(json!({})));
        }
        mock.issued
            .lock()
            .unwrap()
            .push((format!("{mount}/issue/{role}"), body));
        (
            StatusCode::OK,
            Json(json!({"data": {"certificate": "CERT", "private_key": "KEY"}})),
        )
    }

    async fn read_ca(Path(mount): Path<String>) -> Json<Value> {
        Json(json!({"data": {"certificate": [format!("{mount}-1\n"), format!("{mount}-2\n")]}}))
    }

    async fn mock_vault() -> (Url, MockVault) {
        let mock = MockVault::default();
        let app = Router::new()
            .route("/v1/auth/approle/login", post(login))
            .route("/v1/{mount}/issue/{role}", post(issue))
            .route("/v1/{mount}/cert/ca", get(read_ca))
            .with_state(mock.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (Url::parse(&format!("http://{addr}")).unwrap(), mock)
    }

    #[tokio::test]
    async fn issue_cert_against_mock() {
        let (addr, mock) = mock_vault().await;
        let client = VaultClient::new(addr, VaultCredentials::new("role", "secret")).unwrap();

        let params = IssueCertParams::new("ctrl", "EU");
        let issued = client
            .issue_cert(CertIssuer::Regional, "EU", &params)
            .await
            .unwrap();
        assert_eq!(issued.public_cert_pem, "CERT");
        assert_eq!(issued.private_key_pem, "KEY");

        let calls = mock.issued.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "pki-regional/issue/EU");
        assert_eq!(calls[0].1["uri_sans"], "region://EU");
        assert_eq!(calls[0].1["ttl"], "72h");
    }

    #[test]
    fn paths_keep_addr_prefix() {
        let addr = Url::parse("https://vault.example/prefix").unwrap();
        let client = VaultClient::new(addr, VaultCredentials::default()).unwrap();
        assert_eq!(
            client.url("pki-global/cert/ca").unwrap().as_str(),
            "https://vault.example/prefix/v1/pki-global/cert/ca"
        );
    }

    #[tokio::test]
    async fn read_ca_concatenates_list() {
        let (addr, _) = mock_vault().await;
        let client = VaultClient::new(addr, VaultCredentials::new("role", "secret")).unwrap();
        let chain = client.read_ca_chain(CertIssuer::Global).await.unwrap();
        assert_eq!(chain, "pki-global-1\npki-global-2\n");
    }

    #[tokio::test]
    async fn bad_credentials_fail_issuance() {
        let (addr, _) = mock_vault().await;
        let client = VaultClient::new(addr.clone(), VaultCredentials::new("role", "wrong")).unwrap();
        let err = client.read_ca_chain(CertIssuer::Global).await.unwrap_err();
        assert!(matches!(err, Error::Issuance(_)));
        assert!(err.to_string().contains("403"));

        let client = VaultClient::new(addr, VaultCredentials::default()).unwrap();
        assert!(client.read_ca_chain(CertIssuer::Global).await.is_err());
    }
}
