// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Access key interceptors for axum.
//!
//! | Middleware | Verifies |
//! |------------|----------|
//! | [`require_access_key`] | every request |
//! | [`tls_access_key`] | only requests whose client certificate chain was issued by the edge trust domain |
//!
//! On success the [`AccessKeyVerified`](super::metadata::AccessKeyVerified) is inserted into the request
//! extensions, where handlers read it with `Extension<AccessKeyVerified>`.
//! The verified peer chain is expected as a [`PeerCertChain`] extension,
//! put there by the TLS acceptor.
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/edgeproto.CloudletAccessApi/GetCas", post(get_cas))
//!     .route_layer(axum::middleware::from_fn_with_state(server, require_access_key));
//! ```

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::server::AccessKeyServer;
use crate::pki::cert::PeerCertChain;

/// Verify the access key of every request. The request path is the method.
pub async fn require_access_key(
    State(server): State<AccessKeyServer>,
    mut req: Request,
    next: Next,
) -> Response {
    let method = req.uri().path().to_string();
    match server.authorize(req.headers(), &method).await {
        Ok(verified) => {
            req.extensions_mut().insert(verified);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

/// Verify the access key only for edge-issued peers.
pub async fn tls_access_key(
    State(server): State<AccessKeyServer>,
    req: Request,
    next: Next,
) -> Response {
    let required = server.is_tls_access_key_required(req.extensions().get::<PeerCertChain>());
    if required {
        return require_access_key(State(server), req, next).await;
    }
    next.run(req).await
}
