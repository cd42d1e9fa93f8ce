use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad config error: {0}")]
    BadConfig(String),

    #[error("SQL error: {0}")]
    Sql(#[from] mysql_async::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Error reported by the remote peer of an RPC call, or by the local
    /// dispatch when the peer asked for something unknown.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// The byte stream did not carry a well-formed request/reply exchange.
    #[error("RPC protocol error: {0}")]
    RpcProtocol(String),

    #[error("Corrupt snapshot dump: {0}")]
    CorruptDump(&'static str),

    #[error("Column count mismatch: row has {got} values, schema has {want} columns")]
    ColumnMismatch { got: usize, want: usize },

    #[error("NULL value in column {0}")]
    NullValue(String),

    #[error("Query returned no rows")]
    NoRows,

    #[error("Queue closed")]
    QueueClosed,
}

impl Error {
    pub fn bad_config(msg: impl Into<String>) -> Self {
        Self::BadConfig(msg.into())
    }

    pub fn rpc(msg: impl Into<String>) -> Self {
        Self::Rpc(msg.into())
    }
}
