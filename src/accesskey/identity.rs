// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Edge node identity (`CloudletKey`).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stable identity of an edge node: operator organization plus cloudlet name.
///
/// The canonical serialization (compact JSON, field order as declared) is the
/// exact byte string signed by the access key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloudletKey {
    pub organization: String,
    pub name: String,
}

impl CloudletKey {
    pub fn new(organization: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            name: name.into(),
        }
    }

    /// Check the key is usable as request metadata.
    pub fn validate(&self) -> Result<()> {
        validate_field("organization", &self.organization)?;
        validate_field("name", &self.name)
    }

    /// Canonical serialized form.
    pub fn canonical(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::config(format!("failed to marshal CloudletKey: {e}")))
    }
}

impl std::fmt::Display for CloudletKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.organization, self.name)
    }
}

fn validate_field(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::config(format!("invalid CloudletKey: {field} is empty")));
    }
    if value.trim() != value {
        return Err(Error::config(format!(
            "invalid CloudletKey: {field} has leading or trailing whitespace"
        )));
    }
    // Carried in request metadata, so restricted to visible ASCII.
    if !value.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Err(Error::config(format!(
            "invalid CloudletKey: {field} contains invalid characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_is_stable() {
        let key = CloudletKey::new("acme", "edge-1");
        assert_eq!(
            key.canonical().unwrap(),
            r#"{"organization":"acme","name":"edge-1"}"#
        );
        let parsed: CloudletKey = serde_json::from_str(&key.canonical().unwrap()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn validation() {
        assert!(CloudletKey::new("acme", "edge 1").validate().is_ok());
        assert!(CloudletKey::new("", "edge-1").validate().is_err());
        assert!(CloudletKey::new("acme", "").validate().is_err());
        assert!(CloudletKey::new("acme", " edge").validate().is_err());
        assert!(CloudletKey::new("acme", "edge\n1").validate().is_err());
        assert!(CloudletKey::new("acmé", "edge").validate().is_err());
    }

    #[test]
    fn display() {
        assert_eq!(CloudletKey::new("acme", "edge-1").to_string(), "acme/edge-1");
    }
}
