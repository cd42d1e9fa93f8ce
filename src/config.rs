use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Server configuration, stored as a JSON file next to the binary.
///
/// All SQL templates may use the `$_TABLE`, `$_COLUMNS` and `$_ALL_VALUES`
/// macros; `SyncClientInsert` additionally must carry a `$_VALUES` marker
/// where batched row tuples are spliced in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub log: String,

    /// Control listener (client-initiated RPC), mTLS.
    pub listen: String,
    /// Push listener (server-driven reverse RPC), mTLS.
    pub notify_listen: String,
    /// Notify/stat HTTP listener, plaintext.
    pub http_listen: String,
    /// Push address advertised to clients via `GetValue("notify_server_addr")`.
    pub notify_server_addr: String,
    /// TLS server name appended as `<name>` to the advertised address.
    pub notify_server_name: String,
    /// Url-encoded timeouts for the server-side listeners.
    pub timeout: String,
    /// Url-encoded timeouts advertised to clients via `GetValue("timeout_config")`.
    pub push_timeout: String,

    #[serde(rename = "ClientCA")]
    pub client_ca: String,
    pub cert: String,
    pub cert_key: String,

    #[serde(rename = "DSNFile")]
    pub dsn_file: String,
    pub query_log: String,

    pub sync_table_name: String,
    pub sync_columns: String,
    pub sync_client_before_full_update: String,
    pub sync_client_insert: String,
    pub sync_full_update: String,
    pub sync_single_update: String,
    pub use_lock_table: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: "server.log".to_string(),

            listen: "0.0.0.0:9443".to_string(),
            notify_listen: "0.0.0.0:9444".to_string(),
            http_listen: "0.0.0.0:9445".to_string(),
            notify_server_addr: String::new(),
            notify_server_name: "server".to_string(),
            timeout: "read=60s&write=5s&heartbeat=25s".to_string(),
            push_timeout: "read=60s&write=5s&heartbeat=25s".to_string(),

            client_ca: "cert/clientca.pem".to_string(),
            cert: "cert/server.pem".to_string(),
            cert_key: "cert/server.key".to_string(),

            dsn_file: "db.dsn".to_string(),
            query_log: "query.log".to_string(),

            sync_table_name: String::new(),
            sync_columns: String::new(),
            sync_client_before_full_update: String::new(),
            sync_client_insert: "INSERT INTO $_TABLE ($_COLUMNS) VALUES $_VALUES \
                                 ON DUPLICATE KEY UPDATE $_ALL_VALUES"
                .to_string(),
            sync_full_update: "SELECT $_COLUMNS FROM $_TABLE".to_string(),
            sync_single_update: "SELECT $_COLUMNS FROM $_TABLE WHERE id=? LIMIT 1".to_string(),
            use_lock_table: false,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Checks the fields a running server cannot do without.
    pub fn validate(&self) -> Result<()> {
        if self.notify_server_addr.is_empty() {
            return Err(Error::bad_config("NotifyServerAddr not set"));
        }
        if self.notify_server_name.is_empty() {
            return Err(Error::bad_config("NotifyServerName not set"));
        }
        if self.push_timeout.is_empty() {
            return Err(Error::bad_config("PushTimeout not set"));
        }
        Ok(())
    }
}

/// Reads the DSN of the authoritative database from its own file, so the
/// credentials can be permissioned separately from the config.
pub fn read_dsn(path: impl AsRef<Path>) -> Result<String> {
    let dsn = std::fs::read_to_string(path)?;
    Ok(dsn.trim().to_string())
}
