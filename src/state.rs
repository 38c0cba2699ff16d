// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use axum::extract::FromRef;

use crate::access_api::PendingUpgrades;
use crate::accesskey::server::AccessKeyServer;
use crate::config::AccessKeyServerConfig;
use crate::pki::internal::InternalPki;
use crate::store::CloudletStore;

/// Shared state of the central service's access API.
#[derive(Clone, Debug)]
pub struct AccessApiState {
    pub server: AccessKeyServer,
    /// Issues on behalf of edge nodes; must reach the secret store directly.
    pub pki: InternalPki,
    /// Upgrades served over HTTP that still wait for the node's ack.
    pub upgrades: PendingUpgrades,
}

impl AccessApiState {
    pub fn new(
        store: Arc<dyn CloudletStore>,
        config: AccessKeyServerConfig,
        pki: InternalPki,
    ) -> Self {
        Self::from_parts(AccessKeyServer::new(store, config), pki)
    }

    pub fn from_parts(server: AccessKeyServer, pki: InternalPki) -> Self {
        Self {
            server,
            pki,
            upgrades: PendingUpgrades::default(),
        }
    }
}

/// Lets the access key middleware run on the access API state.
impl FromRef<AccessApiState> for AccessKeyServer {
    fn from_ref(state: &AccessApiState) -> Self {
        state.server.clone()
    }
}
