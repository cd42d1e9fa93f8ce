//! Typed argument and reply payloads for the calls the server speaks.
//!
//! Field names on the wire are PascalCase. The remote SQL executor's wider
//! surface (`db.Query`, `db.Fetch`, transactions, prepared statements)
//! belongs to the client side and is not modelled here; the server only
//! drives `db.Exec`.

use serde::{Deserialize, Serialize};

/// `client.Connect` — a client announcing itself on the control channel.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientConnectArgs {
    #[serde(rename = "ClientID", default)]
    pub client_id: String,
    #[serde(rename = "ClientVersion", default)]
    pub client_version: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientConnectReply {
    #[serde(rename = "ServerVersion")]
    pub server_version: i32,
    #[serde(rename = "Message", default)]
    pub message: String,
}

/// `client.Message` — free-form text, logged by the receiving side.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientMessageArgs {
    #[serde(rename = "ClientID", default)]
    pub client_id: String,
    #[serde(rename = "Message")]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientRestartArgs {
    #[serde(rename = "Magic", default)]
    pub magic: i64,
    #[serde(rename = "Message", default)]
    pub message: String,
}

/// `db.Exec` — one statement executed on the peer's local store.
#[derive(Debug, Serialize, Deserialize)]
pub struct DbExecArgs {
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "Params", default)]
    pub params: Vec<serde_json::Value>,
    #[serde(rename = "Stmt", default)]
    pub stmt: i64,
    #[serde(rename = "Tx", default)]
    pub tx: i64,
}

impl DbExecArgs {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: Vec::new(),
            stmt: 0,
            tx: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DbExecReply {
    #[serde(rename = "LastInsertID", default)]
    pub last_insert_id: i64,
    #[serde(rename = "RowsAffected", default)]
    pub rows_affected: i64,
}
