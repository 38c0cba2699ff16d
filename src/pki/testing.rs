// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Test certificate authorities standing in for the secret store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DnType, DnValue, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::CertificateDer;

use super::cert::IssuedCert;
use super::issuer::CertIssuer;
use super::vault::{IssueCertParams, SecretStore};
use crate::error::{Error, Result};

/// A self-signed CA whose first DNS name is the trust domain name.
pub(crate) struct TestCa {
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

impl TestCa {
    pub(crate) fn new(domain: CertIssuer) -> Self {
        Self::named(domain.as_str())
    }

    pub(crate) fn named(dns_name: &str) -> Self {
        let mut params = CertificateParams::new(vec![dns_name.to_string()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, DnValue::Utf8String(dns_name.to_string()));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self {
            cert_pem: cert.pem(),
            cert_der: cert.der().clone(),
            key_pem: key.serialize_pem(),
            issuer: Issuer::new(params, key),
        }
    }

    pub(crate) fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub(crate) fn cert_der(&self) -> CertificateDer<'static> {
        self.cert_der.clone()
    }

    pub(crate) fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Leaf for `common_name` with an optional URI SAN.
    pub(crate) fn issue(&self, common_name: &str, uri_san: Option<&str>) -> IssuedCert {
        let mut params =
            CertificateParams::new(vec![common_name.to_string(), "localhost".to_string()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
        params
            .subject_alt_names
            .push(SanType::IpAddress("127.0.0.1".parse().unwrap()));
        if let Some(uri) = uri_san {
            params
                .subject_alt_names
                .push(SanType::URI(Ia5String::try_from(uri.to_string()).unwrap()));
        }
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        IssuedCert {
            public_cert_pem: cert.pem(),
            private_key_pem: key.serialize_pem(),
        }
    }
}

/// In-memory secret store with one CA per trust domain.
pub(crate) struct TestSecretStore {
    cas: HashMap<CertIssuer, TestCa>,
    pub(crate) issued: AtomicUsize,
    pub(crate) ca_reads: AtomicUsize,
    pub(crate) fail: AtomicBool,
    pub(crate) requests: Mutex<Vec<(CertIssuer, String, IssueCertParams)>>,
}

impl TestSecretStore {
    pub(crate) fn new() -> Self {
        Self {
            cas: CertIssuer::ALL
                .into_iter()
                .map(|issuer| (issuer, TestCa::new(issuer)))
                .collect(),
            issued: AtomicUsize::new(0),
            ca_reads: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn ca(&self, issuer: CertIssuer) -> &TestCa {
        &self.cas[&issuer]
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::issuance("secret store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretStore for TestSecretStore {
    async fn issue_cert(
        &self,
        issuer: CertIssuer,
        role: &str,
        params: &IssueCertParams,
    ) -> Result<IssuedCert> {
        self.check()?;
        self.issued.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .push((issuer, role.to_string(), params.clone()));
        Ok(self
            .ca(issuer)
            .issue(&params.common_name, Some(&params.uri_sans)))
    }

    async fn read_ca_chain(&self, issuer: CertIssuer) -> Result<String> {
        self.check()?;
        self.ca_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.ca(issuer).cert_pem().to_string())
    }
}
