// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Access Keys
//!
//! Ed25519 keys that authenticate edge agents to the central service.
//!
//! The edge side ([`client::AccessKeyClient`]) signs every request with its
//! private key and, on first start, swaps the one-time bootstrap key for a
//! fresh one. The central side ([`server::AccessKeyServer`]) verifies
//! signatures against the public key kept in the replicated node records and
//! drives the upgrade exchange.

pub mod client;
pub mod codec;
pub mod error;
pub mod identity;
pub mod keyfile;
pub mod metadata;
pub mod middleware;
pub mod server;
pub mod stream;
