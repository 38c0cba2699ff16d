// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Access API
//!
//! The central service's API for edge nodes that cannot reach the secret
//! store themselves. Every call is access-key authenticated.
//!
//! | Method | Request | Reply |
//! |--------|---------|-------|
//! | `/edgeproto.CloudletAccessKeyApi/UpgradeAccessKey` | stream | stream |
//! | `/edgeproto.CloudletAccessApi/IssueCert` | [`IssueCertRequest`] | [`IssueCertReply`] |
//! | `/edgeproto.CloudletAccessApi/GetCas` | [`GetCasRequest`] | [`GetCasReply`] |
//!
//! Edge nodes talk to it through the [`AccessApi`] trait. [`LocalAccessApi`]
//! serves it in-process; [`router`] serves it over HTTP with the method
//! names as paths, and [`HttpAccessApi`] is the matching client.
//!
//! ## Upgrade over HTTP
//!
//! The upgrade stream becomes two calls:
//!
//! | Path | Auth | Body | Reply |
//! |------|------|------|-------|
//! | `UpgradeAccessKey` | access key or vault signature | none | [`UpgradeHttpReply`] |
//! | `UpgradeAccessKey/Ack` | session from the reply | [`UpgradeAckRequest`] | [`UpgradeAckReply`], after the commit |
//!
//! A session that is not acknowledged within [`UPGRADE_ACK_TIMEOUT`] is
//! dropped and nothing is committed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use url::Url;

use crate::accesskey::error::{AuthError, GENERIC_AUTH_MESSAGE};
use crate::accesskey::metadata::{is_verify_only, AccessKeyVerified};
use crate::accesskey::middleware::require_access_key;
use crate::accesskey::server::AccessKeyServer;
use crate::accesskey::stream::{
    expect_commit_complete, upgrade_channel, ChannelClientStream, UpgradeClientMsg,
    UpgradeClientStream, UpgradeServerMsg, UPGRADE_ACCESS_KEY_METHOD,
};
use crate::config::{AccessKeyClientConfig, ACCESS_API_ADDR_ENV};
use crate::error::{Error, Result};
use crate::pki::cert::CertId;
use crate::pki::internal::InternalPki;
use crate::pki::issuer::CertIssuer;
use crate::state::AccessApiState;

pub const ISSUE_CERT_METHOD: &str = "/edgeproto.CloudletAccessApi/IssueCert";
pub const GET_CAS_METHOD: &str = "/edgeproto.CloudletAccessApi/GetCas";
pub const UPGRADE_ACK_PATH: &str = "/edgeproto.CloudletAccessKeyApi/UpgradeAccessKey/Ack";

/// How long an HTTP upgrade waits for the node's ack.
pub const UPGRADE_ACK_TIMEOUT: Duration = Duration::from_secs(30);

const ACCESS_API_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCertRequest {
    pub common_name: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCertReply {
    pub public_cert_pem: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for IssueCertReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueCertReply")
            .field("public_cert_pem", &self.public_cert_pem)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCasRequest {
    pub issuer: CertIssuer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCasReply {
    pub ca_chain_pem: String,
}

/// First half of an upgrade over HTTP. `session` is set only when a new
/// key was issued and must be acknowledged.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct UpgradeHttpReply {
    pub message: UpgradeServerMsg,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeAckRequest {
    pub session: String,
    pub ack: UpgradeClientMsg,
}

/// Carries `commit-complete`; a failed commit is an error reply instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpgradeAckReply {
    pub message: UpgradeServerMsg,
}

/// Connection to the central service's access API.
///
/// `metadata` carries the access key signature for the call.
#[async_trait]
pub trait AccessApi: Send + Sync {
    async fn upgrade_access_key(&self, metadata: HeaderMap) -> Result<Box<dyn UpgradeClientStream>>;

    async fn issue_cert(&self, metadata: HeaderMap, req: IssueCertRequest) -> Result<IssueCertReply>;

    async fn get_cas(&self, metadata: HeaderMap, req: GetCasRequest) -> Result<GetCasReply>;
}

impl AccessApiState {
    /// Issue a regional-cloudlet certificate for a verified edge node.
    pub async fn issue_cert(
        &self,
        verified: &AccessKeyVerified,
        req: IssueCertRequest,
    ) -> Result<IssueCertReply> {
        if req.common_name.is_empty() {
            return Err(Error::issuance("common name not specified"));
        }
        info!(cloudlet = %verified.key, common_name = %req.common_name, "issue cert for cloudlet");
        let id = CertId::new(req.common_name, CertIssuer::RegionalCloudlet);
        let issued = self.pki.issue_vault_cert_direct(&id).await?;
        Ok(IssueCertReply {
            public_cert_pem: issued.public_cert_pem,
            private_key_pem: issued.private_key_pem,
        })
    }

    /// One issuer's CA chain. CAs are public; any verified caller may read them.
    pub async fn get_cas(&self, req: GetCasRequest) -> Result<GetCasReply> {
        let ca_chain_pem = self.pki.get_vault_cas_direct(req.issuer).await?;
        Ok(GetCasReply { ca_chain_pem })
    }

    /// Run the server side of an upgrade in the background and hand back
    /// the client end of its stream.
    pub fn start_upgrade(&self, verified: AccessKeyVerified, verify_only: bool) -> ChannelClientStream {
        let server = self.server.clone();
        let (mut server_stream, client_stream) = upgrade_channel();
        tokio::spawn(async move {
            if let Err(e) = server
                .upgrade_and_commit(Some(&verified), verify_only, &mut server_stream)
                .await
            {
                warn!(cloudlet = %verified.key, error = %e, "access key upgrade failed");
            }
        });
        client_stream
    }

    /// Verify a call, hiding the reason from the caller.
    async fn authorize(&self, metadata: &HeaderMap, method: &str) -> Result<AccessKeyVerified> {
        self.server
            .authorize(metadata, method)
            .await
            .map_err(|_| Error::Auth(AuthError::Unauthenticated))
    }
}

/// Upgrade streams handed out over HTTP, keyed by session.
#[derive(Clone)]
pub struct PendingUpgrades {
    streams: Arc<Mutex<HashMap<String, ChannelClientStream>>>,
    ack_timeout: Duration,
}

impl Default for PendingUpgrades {
    fn default() -> Self {
        Self::with_timeout(UPGRADE_ACK_TIMEOUT)
    }
}

impl std::fmt::Debug for PendingUpgrades {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingUpgrades")
            .field("pending", &self.streams().len())
            .field("ack_timeout", &self.ack_timeout)
            .finish()
    }
}

impl PendingUpgrades {
    pub fn with_timeout(ack_timeout: Duration) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            ack_timeout,
        }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, ChannelClientStream>> {
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Park `stream` until acked or timed out. Returns the session id.
    fn hold(&self, stream: ChannelClientStream) -> String {
        let session = session_id();
        self.streams().insert(session.clone(), stream);

        let pending = self.clone();
        let id = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(pending.ack_timeout).await;
            // Dropping the stream ends the server side without a commit.
            if pending.take(&id).is_some() {
                warn!(session = %id, "access key upgrade ack timed out");
            }
        });
        session
    }

    fn take(&self, session: &str) -> Option<ChannelClientStream> {
        self.streams().remove(session)
    }
}

fn session_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The access API served inside the current process.
#[derive(Debug, Clone)]
pub struct LocalAccessApi {
    state: AccessApiState,
}

impl LocalAccessApi {
    pub fn new(server: AccessKeyServer, pki: InternalPki) -> Self {
        Self {
            state: AccessApiState::from_parts(server, pki),
        }
    }

    pub fn from_state(state: AccessApiState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl AccessApi for LocalAccessApi {
    async fn upgrade_access_key(&self, metadata: HeaderMap) -> Result<Box<dyn UpgradeClientStream>> {
        let verified = self.state.authorize(&metadata, UPGRADE_ACCESS_KEY_METHOD).await?;
        let stream = self.state.start_upgrade(verified, is_verify_only(&metadata));
        Ok(Box::new(stream))
    }

    async fn issue_cert(&self, metadata: HeaderMap, req: IssueCertRequest) -> Result<IssueCertReply> {
        let verified = self.state.authorize(&metadata, ISSUE_CERT_METHOD).await?;
        self.state.issue_cert(&verified, req).await
    }

    async fn get_cas(&self, metadata: HeaderMap, req: GetCasRequest) -> Result<GetCasReply> {
        self.state.authorize(&metadata, GET_CAS_METHOD).await?;
        self.state.get_cas(req).await
    }
}

/// Error reply of the HTTP access API.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::Issuance(_) => StatusCode::BAD_GATEWAY,
            Error::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Upgrade(_) => StatusCode::BAD_REQUEST,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!(error = %e, status = %status, "access API call failed");
        let message = match &e {
            Error::Auth(_) => GENERIC_AUTH_MESSAGE.to_string(),
            other => other.to_string(),
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

async fn upgrade_access_key(
    State(state): State<AccessApiState>,
    Extension(verified): Extension<AccessKeyVerified>,
    headers: HeaderMap,
) -> std::result::Result<Json<UpgradeHttpReply>, ApiError> {
    let mut stream = state.start_upgrade(verified, is_verify_only(&headers));
    let message = stream.recv().await?;
    let session = if message.crm_private_access_key.is_empty() {
        String::new()
    } else {
        state.upgrades.hold(stream)
    };
    Ok(Json(UpgradeHttpReply { message, session }))
}

async fn ack_upgrade(
    State(state): State<AccessApiState>,
    Json(req): Json<UpgradeAckRequest>,
) -> std::result::Result<Json<UpgradeAckReply>, ApiError> {
    let mut stream = state
        .upgrades
        .take(&req.session)
        .ok_or_else(|| Error::upgrade("unknown or expired upgrade session"))?;
    stream.send(req.ack).await?;
    stream.committed().await?;
    Ok(Json(UpgradeAckReply {
        message: UpgradeServerMsg::commit_complete(),
    }))
}

async fn issue_cert(
    State(state): State<AccessApiState>,
    Extension(verified): Extension<AccessKeyVerified>,
    Json(req): Json<IssueCertRequest>,
) -> std::result::Result<Json<IssueCertReply>, ApiError> {
    Ok(Json(state.issue_cert(&verified, req).await?))
}

async fn get_cas(
    State(state): State<AccessApiState>,
    Json(req): Json<GetCasRequest>,
) -> std::result::Result<Json<GetCasReply>, ApiError> {
    Ok(Json(state.get_cas(req).await?))
}

/// HTTP router for the access API.
pub fn router(state: AccessApiState) -> Router {
    let signed = Router::new()
        .route(UPGRADE_ACCESS_KEY_METHOD, post(upgrade_access_key))
        .route(ISSUE_CERT_METHOD, post(issue_cert))
        .route(GET_CAS_METHOD, post(get_cas))
        .route_layer(from_fn_with_state(state.clone(), require_access_key));
    Router::new()
        .merge(signed)
        // The session authenticates the ack: the node is still flagged for
        // upgrade, so its signature is only good for the upgrade method.
        .route(UPGRADE_ACK_PATH, post(ack_upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// [`AccessApi`] client for [`router`].
///
/// Dials `http://` for a `notls://` address or in end-to-end test mode,
/// `https://` otherwise.
#[derive(Debug, Clone)]
pub struct HttpAccessApi {
    http: reqwest::Client,
    base: Url,
}

impl HttpAccessApi {
    /// `tls` replaces the default root store for `https://` connections.
    pub fn new(config: &AccessKeyClientConfig, tls: Option<rustls::ClientConfig>) -> Result<Self> {
        let host = config.access_api_host();
        if host.is_empty() {
            return Err(Error::config("access API address not specified"));
        }
        let plaintext = config.plaintext();
        let scheme = if plaintext { "http" } else { "https" };
        let base = Url::parse(&format!("{scheme}://{host}")).map_err(|e| {
            Error::config(format!(
                "invalid {ACCESS_API_ADDR_ENV} {:?}: {e}",
                config.access_api_addr
            ))
        })?;

        let mut builder = reqwest::Client::builder().timeout(ACCESS_API_TIMEOUT);
        if let Some(tls) = tls.filter(|_| !plaintext) {
            builder = builder.use_preconfigured_tls(tls);
        }
        let http = builder
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;
        debug!(addr = %base, "access API client");
        Ok(Self { http, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    async fn call<Req, Rep>(&self, method: &str, metadata: HeaderMap, req: &Req) -> Result<Rep>
    where
        Req: Serialize + ?Sized,
        Rep: DeserializeOwned,
    {
        let url = self
            .base
            .join(method)
            .map_err(|e| Error::transport(format!("invalid access API method {method}: {e}")))?;
        let response = self
            .http
            .post(url)
            .headers(metadata)
            .json(req)
            .send()
            .await
            .map_err(|e| Error::transport(format!("access API {method} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(reply_error(method, status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| Error::transport(format!("invalid access API reply for {method}: {e}")))
    }
}

/// Map an error reply back onto the error the in-process API returns.
fn reply_error(method: &str, status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.to_string());
    match status {
        StatusCode::UNAUTHORIZED => Error::Auth(AuthError::Unauthenticated),
        StatusCode::BAD_GATEWAY => Error::issuance(message),
        StatusCode::BAD_REQUEST => Error::upgrade(message),
        _ => Error::transport(format!("access API {method} returned {status}: {message}")),
    }
}

/// Client end of an upgrade carried over two HTTP calls.
struct HttpUpgradeStream {
    api: HttpAccessApi,
    reply: Option<UpgradeServerMsg>,
    session: String,
}

#[async_trait]
impl UpgradeClientStream for HttpUpgradeStream {
    async fn send(&mut self, msg: UpgradeClientMsg) -> Result<()> {
        if self.session.is_empty() {
            return Err(Error::upgrade("no upgrade session to acknowledge"));
        }
        let req = UpgradeAckRequest {
            session: std::mem::take(&mut self.session),
            ack: msg,
        };
        let reply: UpgradeAckReply = self.api.call(UPGRADE_ACK_PATH, HeaderMap::new(), &req).await?;
        self.reply = Some(reply.message);
        Ok(())
    }

    async fn recv(&mut self) -> Result<UpgradeServerMsg> {
        self.reply
            .take()
            .ok_or_else(|| Error::transport("upgrade stream closed"))
    }

    async fn committed(&mut self) -> Result<()> {
        expect_commit_complete(self.reply.take())
    }
}

#[async_trait]
impl AccessApi for HttpAccessApi {
    async fn upgrade_access_key(&self, metadata: HeaderMap) -> Result<Box<dyn UpgradeClientStream>> {
        let reply: UpgradeHttpReply = self
            .call(UPGRADE_ACCESS_KEY_METHOD, metadata, &serde_json::json!({}))
            .await?;
        Ok(Box::new(HttpUpgradeStream {
            api: self.clone(),
            reply: Some(reply.message),
            session: reply.session,
        }))
    }

    async fn issue_cert(&self, metadata: HeaderMap, req: IssueCertRequest) -> Result<IssueCertReply> {
        self.call(ISSUE_CERT_METHOD, metadata, &req).await
    }

    async fn get_cas(&self, metadata: HeaderMap, req: GetCasRequest) -> Result<GetCasReply> {
        self.call(GET_CAS_METHOD, metadata, &req).await
    }
}
