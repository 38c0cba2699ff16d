// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Certificate identifiers, PEM decoding and X.509 inspection.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::sign::CertifiedKey;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use super::issuer::CertIssuer;
use crate::error::{Error, Result};

/// Cache key for one issued leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CertId {
    pub common_name: String,
    pub issuer: CertIssuer,
}

impl CertId {
    pub fn new(common_name: impl Into<String>, issuer: CertIssuer) -> Self {
        Self {
            common_name: common_name.into(),
            issuer,
        }
    }
}

impl fmt::Display for CertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.common_name, self.issuer)
    }
}

/// Certificate chain and private key as returned by the secret store.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct IssuedCert {
    pub public_cert_pem: String,
    pub private_key_pem: String,
}

impl fmt::Debug for IssuedCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCert")
            .field("public_cert_pem", &self.public_cert_pem)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

impl IssuedCert {
    /// Decode into a key usable by rustls.
    pub fn to_certified_key(&self) -> Result<Arc<CertifiedKey>> {
        certified_key(
            self.public_cert_pem.as_bytes(),
            self.private_key_pem.as_bytes(),
        )
    }
}

/// The peer's verified chain, leaf first, ending at the trust anchor.
///
/// Inserted into request extensions by the transport after the handshake.
#[derive(Debug, Clone, Default)]
pub struct PeerCertChain(pub Vec<CertificateDer<'static>>);

/// Decode every `CERTIFICATE` block, skipping other block types.
pub fn certs_from_pem(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let blocks =
        pem::parse_many(bytes).map_err(|e| Error::Tls(format!("failed to parse PEM: {e}")))?;
    let mut certs = Vec::new();
    for block in blocks {
        if block.tag() != "CERTIFICATE" {
            continue;
        }
        let der = CertificateDer::from(block.into_contents());
        X509Certificate::from_der(&der)
            .map_err(|e| Error::Tls(format!("failed to parse certificate: {e}")))?;
        certs.push(der);
    }
    Ok(certs)
}

/// Decode the first private key block (PKCS#8, PKCS#1 or SEC1).
pub fn private_key_from_pem(bytes: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let blocks =
        pem::parse_many(bytes).map_err(|e| Error::Tls(format!("failed to parse PEM: {e}")))?;
    for block in blocks {
        let key = match block.tag() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(block.into_contents())),
            "RSA PRIVATE KEY" => {
                PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(block.into_contents()))
            }
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(block.into_contents())),
            _ => continue,
        };
        return Ok(key);
    }
    Err(Error::Tls("no private key found in PEM".to_string()))
}

/// Build a rustls signing identity from PEM chain and key.
pub fn certified_key(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<CertifiedKey>> {
    let chain = certs_from_pem(cert_pem)?;
    if chain.is_empty() {
        return Err(Error::Tls("no certificate found in PEM".to_string()));
    }
    let key = private_key_from_pem(key_pem)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| Error::Tls(format!("failed to load x509 key pair: {e}")))?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// The X.509 fields the region policy and interceptors look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub is_ca: bool,
    pub dns_names: Vec<String>,
    pub uris: Vec<String>,
    pub subject_raw: Vec<u8>,
    pub issuer_raw: Vec<u8>,
    pub not_after: DateTime<Utc>,
}

impl CertInfo {
    pub fn parse(der: &CertificateDer<'_>) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Tls(format!("failed to parse certificate: {e}")))?;

        let is_ca = cert
            .basic_constraints()
            .ok()
            .flatten()
            .is_some_and(|bc| bc.value.ca);

        let mut dns_names = Vec::new();
        let mut uris = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::URI(uri) => uris.push(uri.to_string()),
                    _ => {}
                }
            }
        }

        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Ok(Self {
            is_ca,
            dns_names,
            uris,
            subject_raw: cert.subject().as_raw().to_vec(),
            issuer_raw: cert.issuer().as_raw().to_vec(),
            not_after,
        })
    }

    /// Trust domain named by a CA certificate's first DNS name.
    pub fn ca_issuer(&self) -> Option<CertIssuer> {
        if !self.is_ca {
            return None;
        }
        self.dns_names
            .first()
            .and_then(|name| CertIssuer::from_dns_name(name))
    }

    /// Value of the last `region://` URI SAN, if any.
    pub fn region_tag(&self) -> Option<&str> {
        self.uris
            .iter()
            .filter_map(|uri| uri.strip_prefix(super::REGION_URI_PREFIX))
            .filter(|region| !region.is_empty())
            .last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::testing::TestCa;

    #[test]
    fn issued_cert_loads_into_rustls() {
        let ca = TestCa::new(CertIssuer::Regional);
        let issued = ca.issue("svc.local", Some("region://EU"));
        let key = issued.to_certified_key().unwrap();
        assert_eq!(key.cert.len(), 1);
    }

    #[test]
    fn cert_info_reads_sans() {
        let ca = TestCa::new(CertIssuer::Regional);
        let issued = ca.issue("svc.local", Some("region://EU"));
        let certs = certs_from_pem(issued.public_cert_pem.as_bytes()).unwrap();
        let info = CertInfo::parse(&certs[0]).unwrap();

        assert!(!info.is_ca);
        assert_eq!(info.dns_names[0], "svc.local");
        assert_eq!(info.region_tag(), Some("EU"));
        assert!(info.not_after > Utc::now());
        assert_eq!(info.ca_issuer(), None);

        let ca_info = CertInfo::parse(&ca.cert_der()).unwrap();
        assert!(ca_info.is_ca);
        assert_eq!(ca_info.ca_issuer(), Some(CertIssuer::Regional));
        assert_eq!(info.issuer_raw, ca_info.subject_raw);
    }

    #[test]
    fn missing_region_tag() {
        let ca = TestCa::new(CertIssuer::Regional);
        let issued = ca.issue("svc.local", None);
        let certs = certs_from_pem(issued.public_cert_pem.as_bytes()).unwrap();
        assert_eq!(CertInfo::parse(&certs[0]).unwrap().region_tag(), None);
    }

    #[test]
    fn pem_helpers_skip_foreign_blocks() {
        let ca = TestCa::new(CertIssuer::Global);
        let mixed = format!("{}{}", ca.key_pem(), ca.cert_pem());
        assert_eq!(certs_from_pem(mixed.as_bytes()).unwrap().len(), 1);
        assert!(matches!(
            private_key_from_pem(mixed.as_bytes()).unwrap(),
            PrivateKeyDer::Pkcs8(_)
        ));
        assert!(private_key_from_pem(ca.cert_pem().as_bytes()).is_err());
        assert!(certified_key(b"", ca.key_pem().as_bytes()).is_err());
    }

    #[test]
    fn cert_id_display() {
        let id = CertId::new("crm.edge", CertIssuer::RegionalCloudlet);
        assert_eq!(id.to_string(), "crm.edge@pki-regional-cloudlet");
    }
}
