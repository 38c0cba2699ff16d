// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Peer certificate verification.
//!
//! Chain validation is delegated to the rustls WebPKI verifiers built over the
//! CA pool. On top of that [`RegionPolicy`] enforces the region rules for
//! certificates issued by a regional trust domain:
//!
//! - the chain is scanned for a CA whose first DNS name is a regional issuer
//! - if found, the leaf must carry a `region://<name>` URI SAN
//! - if the config requires a region match for that issuer, `<name>` must be
//!   the local region
//!
//! All checks run on the handshake thread against already-decoded data.

use std::collections::HashSet;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use thiserror::Error;

use super::cert::CertInfo;
use super::issuer::{CertIssuer, MatchCa};
use crate::error::{Error, Result};

/// Chains longer than this are not followed further.
const MAX_CHAIN_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("CA {issuer} issued cert to {dns_names:?} without region URI_SANS tag (tags are {uris:?})")]
    MissingRegionTag {
        issuer: CertIssuer,
        dns_names: Vec<String>,
        uris: Vec<String>,
    },

    #[error("region mismatch, expected local uri sans for {local_region} but remote cert for {dns_names:?} has URI SANS {uris:?}")]
    RegionMismatch {
        local_region: String,
        dns_names: Vec<String>,
        uris: Vec<String>,
    },

    #[error("failed to parse peer certificate: {0}")]
    BadCertificate(String),
}

impl From<VerifyError> for rustls::Error {
    fn from(e: VerifyError) -> Self {
        rustls::Error::General(e.to_string())
    }
}

/// Region rules derived from the accepted [`MatchCa`] set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionPolicy {
    match_region: HashSet<CertIssuer>,
    local_region: String,
}

impl RegionPolicy {
    pub fn new(issuers: &[MatchCa], local_region: impl Into<String>) -> Self {
        Self {
            match_region: issuers
                .iter()
                .filter(|m| m.require_region_match)
                .map(|m| m.issuer)
                .collect(),
            local_region: local_region.into(),
        }
    }

    /// Check one chain, leaf first.
    pub fn check_chain(&self, chain: &[CertificateDer<'_>]) -> std::result::Result<(), VerifyError> {
        if chain.is_empty() {
            return Ok(());
        }
        let infos = chain
            .iter()
            .map(|der| CertInfo::parse(der).map_err(|e| VerifyError::BadCertificate(e.to_string())))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let Some(regional_ca) = infos
            .iter()
            .filter_map(CertInfo::ca_issuer)
            .find(CertIssuer::is_regional)
        else {
            return Ok(());
        };

        let leaf_info = &infos[0];
        let Some(region) = leaf_info.region_tag() else {
            return Err(VerifyError::MissingRegionTag {
                issuer: regional_ca,
                dns_names: leaf_info.dns_names.clone(),
                uris: leaf_info.uris.clone(),
            });
        };

        if self.match_region.contains(&regional_ca) && region != self.local_region {
            return Err(VerifyError::RegionMismatch {
                local_region: self.local_region.clone(),
                dns_names: leaf_info.dns_names.clone(),
                uris: leaf_info.uris.clone(),
            });
        }
        Ok(())
    }
}

/// Reconstruct the issuing chain of `end_entity` from the presented
/// intermediates and the trusted roots, leaf first.
pub fn build_chain(
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    roots: &[CertificateDer<'static>],
) -> std::result::Result<Vec<CertificateDer<'static>>, VerifyError> {
    let parse =
        |der: &CertificateDer<'_>| CertInfo::parse(der).map_err(|e| VerifyError::BadCertificate(e.to_string()));

    let candidates = intermediates
        .iter()
        .map(|c| c.clone().into_owned())
        .chain(roots.iter().cloned())
        .map(|der| parse(&der).map(|info| (der, info)))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut chain = vec![end_entity.clone().into_owned()];
    let mut current = parse(end_entity)?;
    while chain.len() < MAX_CHAIN_DEPTH && current.subject_raw != current.issuer_raw {
        let Some((der, info)) = candidates
            .iter()
            .find(|(der, info)| info.subject_raw == current.issuer_raw && !chain.contains(der))
        else {
            break;
        };
        chain.push(der.clone());
        current = info.clone();
    }
    Ok(chain)
}

fn root_store(roots: &[CertificateDer<'static>]) -> Result<Arc<RootCertStore>> {
    let mut store = RootCertStore::empty();
    for root in roots {
        store
            .add(root.clone())
            .map_err(|e| Error::Tls(format!("failed to add CA to pool: {e}")))?;
    }
    Ok(Arc::new(store))
}

/// Client-side verifier: WebPKI chain validation plus region policy.
#[derive(Debug)]
pub struct PolicyServerCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    roots: Arc<[CertificateDer<'static>]>,
    policy: RegionPolicy,
}

impl PolicyServerCertVerifier {
    pub fn new(roots: Vec<CertificateDer<'static>>, policy: RegionPolicy) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(root_store(&roots)?, super::crypto_provider())
            .build()
            .map_err(|e| Error::Tls(format!("failed to build server cert verifier: {e}")))?;
        Ok(Self {
            inner,
            roots: roots.into(),
            policy,
        })
    }
}

impl ServerCertVerifier for PolicyServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let verified =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        let chain = build_chain(end_entity, intermediates, &self.roots)?;
        self.policy.check_chain(&chain)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Server-side verifier: mandatory client certs, WebPKI chain validation plus
/// region policy.
#[derive(Debug)]
pub struct PolicyClientCertVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    roots: Arc<[CertificateDer<'static>]>,
    policy: RegionPolicy,
}

impl PolicyClientCertVerifier {
    pub fn new(roots: Vec<CertificateDer<'static>>, policy: RegionPolicy) -> Result<Self> {
        let inner = WebPkiClientVerifier::builder_with_provider(root_store(&roots)?, super::crypto_provider())
            .build()
            .map_err(|e| Error::Tls(format!("failed to build client cert verifier: {e}")))?;
        Ok(Self {
            inner,
            roots: roots.into(),
            policy,
        })
    }
}

impl ClientCertVerifier for PolicyClientCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let verified = self.inner.verify_client_cert(end_entity, intermediates, now)?;
        let chain = build_chain(end_entity, intermediates, &self.roots)?;
        self.policy.check_chain(&chain)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any server certificate. Handshake signatures are still checked.
#[derive(Debug)]
pub struct SkipServerVerification {
    algorithms: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl SkipServerVerification {
    pub fn new() -> Self {
        Self {
            algorithms: super::crypto_provider().signature_verification_algorithms,
        }
    }
}

impl Default for SkipServerVerification {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
