// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Node record cache.
//!
//! The central service reads node records from a replicated cache owned by
//! the synchronization layer. [`CloudletStore`] is the narrow read/commit
//! interface the access key server needs from it; [`InMemoryCloudletStore`]
//! backs the in-process access API and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::info;

use crate::accesskey::codec::{generate_access_key, KeyPair};
use crate::accesskey::identity::CloudletKey;
use crate::error::{Error, Result};

/// The parts of a node record relevant to access keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudletRecord {
    pub key: Option<CloudletKey>,
    /// Registered public key PEM, empty if none.
    pub crm_access_public_key: String,
    pub crm_access_key_upgrade_required: bool,
}

impl CloudletRecord {
    pub fn new(key: CloudletKey) -> Self {
        Self {
            key: Some(key),
            ..Default::default()
        }
    }
}

/// Concurrency-safe view of the replicated node records.
pub trait CloudletStore: Send + Sync {
    fn get(&self, key: &CloudletKey) -> Option<CloudletRecord>;

    /// Persist `public_pem` as the node's key and clear the upgrade flag.
    fn commit_access_key(&self, key: &CloudletKey, public_pem: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryCloudletStore {
    records: RwLock<HashMap<CloudletKey, CloudletRecord>>,
}

impl InMemoryCloudletStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: CloudletRecord) -> Result<()> {
        let key = record
            .key
            .clone()
            .ok_or_else(|| Error::config("cloudlet record has no key"))?;
        self.write()?.insert(key, record);
        Ok(())
    }

    pub fn remove(&self, key: &CloudletKey) -> Option<CloudletRecord> {
        self.write().ok()?.remove(key)
    }

    pub fn set_upgrade_required(&self, key: &CloudletKey, required: bool) -> Result<()> {
        self.update(key, |record| record.crm_access_key_upgrade_required = required)
    }

    pub fn set_public_key(&self, key: &CloudletKey, public_pem: &str) -> Result<()> {
        self.update(key, |record| record.crm_access_public_key = public_pem.to_string())
    }

    /// Register a node with a fresh one-time key.
    ///
    /// The public half is stored with the upgrade flag set, so the returned
    /// private half is only good for the first upgrade exchange.
    pub fn bootstrap_cloudlet(&self, key: &CloudletKey) -> Result<KeyPair> {
        key.validate()?;
        let pair = generate_access_key()?;
        self.insert(CloudletRecord {
            key: Some(key.clone()),
            crm_access_public_key: pair.public_pem.clone(),
            crm_access_key_upgrade_required: true,
        })?;
        info!(cloudlet = %key, "bootstrapped cloudlet access key");
        Ok(pair)
    }

    fn update(&self, key: &CloudletKey, f: impl FnOnce(&mut CloudletRecord)) -> Result<()> {
        let mut records = self.write()?;
        let record = records
            .get_mut(key)
            .ok_or_else(|| Error::config(format!("cloudlet {key} not found")))?;
        f(record);
        Ok(())
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<CloudletKey, CloudletRecord>>> {
        self.records
            .write()
            .map_err(|_| Error::config("cloudlet store lock poisoned"))
    }
}

impl CloudletStore for InMemoryCloudletStore {
    fn get(&self, key: &CloudletKey) -> Option<CloudletRecord> {
        self.records.read().ok()?.get(key).cloned()
    }

    fn commit_access_key(&self, key: &CloudletKey, public_pem: &str) -> Result<()> {
        self.update(key, |record| {
            record.crm_access_public_key = public_pem.to_string();
            record.crm_access_key_upgrade_required = false;
        })?;
        info!(cloudlet = %key, "committed upgraded access key");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    /// Reads through to the wrapped store; every commit fails.
    pub(crate) struct CommitFailingStore(pub(crate) Arc<InMemoryCloudletStore>);

    impl CloudletStore for CommitFailingStore {
        fn get(&self, key: &CloudletKey) -> Option<CloudletRecord> {
            self.0.get(key)
        }

        fn commit_access_key(&self, _key: &CloudletKey, _public_pem: &str) -> Result<()> {
            Err(Error::transport("node store unavailable"))
        }
    }

    #[test]
    fn bootstrap_sets_upgrade_required() {
        let store = InMemoryCloudletStore::new();
        let key = CloudletKey::new("acme", "edge-1");
        let pair = store.bootstrap_cloudlet(&key).unwrap();

        let record = store.get(&key).unwrap();
        assert_eq!(record.crm_access_public_key, pair.public_pem);
        assert!(record.crm_access_key_upgrade_required);
    }

    #[test]
    fn commit_clears_flag() {
        let store = InMemoryCloudletStore::new();
        let key = CloudletKey::new("acme", "edge-1");
        store.bootstrap_cloudlet(&key).unwrap();

        store.commit_access_key(&key, "NEW").unwrap();
        let record = store.get(&key).unwrap();
        assert_eq!(record.crm_access_public_key, "NEW");
        assert!(!record.crm_access_key_upgrade_required);
    }

    #[test]
    fn unknown_cloudlet() {
        let store = InMemoryCloudletStore::new();
        let key = CloudletKey::new("acme", "missing");
        assert!(store.get(&key).is_none());
        assert!(store.commit_access_key(&key, "X").is_err());
        assert!(store.set_upgrade_required(&key, true).is_err());
        assert!(store.insert(CloudletRecord::default()).is_err());
    }

    #[test]
    fn failing_commit_leaves_record() {
        let inner = Arc::new(InMemoryCloudletStore::new());
        let key = CloudletKey::new("acme", "edge-1");
        let pair = inner.bootstrap_cloudlet(&key).unwrap();

        let store = CommitFailingStore(inner.clone());
        assert!(store.commit_access_key(&key, "NEW").is_err());
        assert_eq!(store.get(&key).unwrap().crm_access_public_key, pair.public_pem);
    }

    #[test]
    fn invalid_identity_cannot_bootstrap() {
        let store = InMemoryCloudletStore::new();
        assert!(store.bootstrap_cloudlet(&CloudletKey::new("", "x")).is_err());
    }
}
