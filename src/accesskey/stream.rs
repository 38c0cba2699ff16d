// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Upgrade stream protocol.
//!
//! ## Messages
//!
//! | Direction | Message |
//! |-----------|---------|
//! | server → client | `{msg: "upgrade-not-needed"}` |
//! | server → client | `{msg: "new-key", crm_private_access_key: <PEM>}` |
//! | server → client | `{msg: "verified"}` (verify-only callers) |
//! | client → server | `{msg: "ack-new-key"}` |
//! | server → client | `{msg: "commit-complete"}` (after the commit) |
//!
//! One key message and one ack flow per attempt. A client that acked a new
//! key only uses it once `commit-complete` arrives; a stream that closes
//! without it means the server did not commit. The transport is
//! abstracted behind [`UpgradeServerStream`] / [`UpgradeClientStream`]; the
//! in-process [`upgrade_channel`] backs the local access API and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

pub const MSG_UPGRADE_NOT_NEEDED: &str = "upgrade-not-needed";
pub const MSG_NEW_KEY: &str = "new-key";
pub const MSG_ACK_NEW_KEY: &str = "ack-new-key";
pub const MSG_VERIFIED: &str = "verified";
pub const MSG_COMMIT_COMPLETE: &str = "commit-complete";

/// Fully qualified name of the upgrade method.
pub const UPGRADE_ACCESS_KEY_METHOD: &str = "/edgeproto.CloudletAccessKeyApi/UpgradeAccessKey";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeServerMsg {
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub crm_private_access_key: String,
}

impl UpgradeServerMsg {
    pub fn not_needed() -> Self {
        Self {
            msg: MSG_UPGRADE_NOT_NEEDED.to_string(),
            ..Default::default()
        }
    }

    pub fn verified() -> Self {
        Self {
            msg: MSG_VERIFIED.to_string(),
            ..Default::default()
        }
    }

    pub fn commit_complete() -> Self {
        Self {
            msg: MSG_COMMIT_COMPLETE.to_string(),
            ..Default::default()
        }
    }

    pub fn new_key(private_pem: impl Into<String>) -> Self {
        Self {
            msg: MSG_NEW_KEY.to_string(),
            crm_private_access_key: private_pem.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeClientMsg {
    pub msg: String,
}

impl UpgradeClientMsg {
    pub fn ack() -> Self {
        Self {
            msg: MSG_ACK_NEW_KEY.to_string(),
        }
    }
}

/// Server half of an upgrade stream.
#[async_trait]
pub trait UpgradeServerStream: Send {
    async fn send(&mut self, msg: UpgradeServerMsg) -> Result<()>;
    async fn recv(&mut self) -> Result<UpgradeClientMsg>;
}

/// Client half of an upgrade stream.
#[async_trait]
pub trait UpgradeClientStream: Send {
    async fn send(&mut self, msg: UpgradeClientMsg) -> Result<()>;
    async fn recv(&mut self) -> Result<UpgradeServerMsg>;

    /// Wait for the server to confirm the commit of an acked key.
    async fn committed(&mut self) -> Result<()>;
}

/// Check the message that must follow an ack. `None` means the stream
/// ended first.
pub fn expect_commit_complete(msg: Option<UpgradeServerMsg>) -> Result<()> {
    match msg {
        Some(msg) if msg.msg == MSG_COMMIT_COMPLETE => Ok(()),
        Some(msg) => Err(Error::upgrade(format!(
            "unexpected message after ack: {}",
            msg.msg
        ))),
        None => Err(Error::upgrade("upgrade stream closed before commit")),
    }
}

/// In-process server endpoint.
pub struct ChannelServerStream {
    tx: mpsc::Sender<UpgradeServerMsg>,
    rx: mpsc::Receiver<UpgradeClientMsg>,
}

/// In-process client endpoint.
pub struct ChannelClientStream {
    tx: mpsc::Sender<UpgradeClientMsg>,
    rx: mpsc::Receiver<UpgradeServerMsg>,
}

/// Connected pair of in-process upgrade stream endpoints.
pub fn upgrade_channel() -> (ChannelServerStream, ChannelClientStream) {
    let (server_tx, client_rx) = mpsc::channel(1);
    let (client_tx, server_rx) = mpsc::channel(1);
    (
        ChannelServerStream {
            tx: server_tx,
            rx: server_rx,
        },
        ChannelClientStream {
            tx: client_tx,
            rx: client_rx,
        },
    )
}

fn closed_err() -> Error {
    Error::transport("upgrade stream closed")
}

#[async_trait]
impl UpgradeServerStream for ChannelServerStream {
    async fn send(&mut self, msg: UpgradeServerMsg) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| closed_err())
    }

    async fn recv(&mut self) -> Result<UpgradeClientMsg> {
        self.rx.recv().await.ok_or_else(closed_err)
    }
}

#[async_trait]
impl UpgradeClientStream for ChannelClientStream {
    async fn send(&mut self, msg: UpgradeClientMsg) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| closed_err())
    }

    async fn recv(&mut self) -> Result<UpgradeServerMsg> {
        self.rx.recv().await.ok_or_else(closed_err)
    }

    async fn committed(&mut self) -> Result<()> {
        expect_commit_complete(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_key_json_shape() {
        let json = serde_json::to_value(UpgradeServerMsg::new_key("PEM")).unwrap();
        assert_eq!(json["msg"], MSG_NEW_KEY);
        assert_eq!(json["crm_private_access_key"], "PEM");

        let json = serde_json::to_value(UpgradeServerMsg::not_needed()).unwrap();
        assert!(json.get("crm_private_access_key").is_none());
    }

    #[tokio::test]
    async fn duplex_exchange() {
        let (mut server, mut client) = upgrade_channel();

        let server_task = tokio::spawn(async move {
            server.send(UpgradeServerMsg::new_key("PEM")).await.unwrap();
            let ack = server.recv().await.unwrap();
            server.send(UpgradeServerMsg::commit_complete()).await.unwrap();
            ack
        });

        let msg = client.recv().await.unwrap();
        assert_eq!(msg.crm_private_access_key, "PEM");
        client.send(UpgradeClientMsg::ack()).await.unwrap();
        client.committed().await.unwrap();

        assert_eq!(server_task.await.unwrap(), UpgradeClientMsg::ack());
    }

    #[tokio::test]
    async fn close_without_commit_is_an_error() {
        let (mut server, mut client) = upgrade_channel();
        let server_task = tokio::spawn(async move {
            server.send(UpgradeServerMsg::new_key("PEM")).await.unwrap();
            server.recv().await.unwrap();
            drop(server);
        });

        client.recv().await.unwrap();
        client.send(UpgradeClientMsg::ack()).await.unwrap();
        let err = client.committed().await.unwrap_err();
        assert!(err.to_string().contains("closed before commit"));
        server_task.await.unwrap();

        let err = expect_commit_complete(Some(UpgradeServerMsg::not_needed())).unwrap_err();
        assert!(err.to_string().contains(MSG_UPGRADE_NOT_NEEDED));
    }

    #[tokio::test]
    async fn recv_after_peer_drop_fails() {
        let (server, mut client) = upgrade_channel();
        drop(server);
        let err = client.recv().await.unwrap_err();
        assert!(err.to_string().contains("stream closed"));
    }
}
