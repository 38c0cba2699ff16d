// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Edge Node Identity - Access Keys and Internal PKI
//!
//! Identity layer shared by the services of the edge control plane: the
//! Ed25519 access keys edge agents use to authenticate to the central
//! service, and the internal mutual-TLS engine that issues, caches,
//! refreshes and verifies service certificates.
//!
//! ## Modules
//!
//! - `accesskey` - Access key codec, client, server and axum interceptors
//! - `access_api` - The central service's access API (cert issuance, CA chains)
//! - `pki` - Internal PKI: issuer policy, secret store, verifiers, refresh
//! - `node` - Startup wiring of one service process
//! - `store` - Replicated node-record cache interface
//! - `state` - Shared state of the access API handlers
//! - `config` / `error` / `logging` - Ambient plumbing

pub mod access_api;
pub mod accesskey;
pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod pki;
pub mod state;
pub mod store;
