pub mod config;
pub mod control;
pub mod db;
pub mod dump;
pub mod error;
pub mod http;
pub mod queue;
pub mod rpc;
pub mod schema;
pub mod server;
pub mod session;
pub mod sql;
pub mod stats;
pub mod timeout;
pub mod tls;

pub use config::Config;
pub use error::{Error, Result};
pub use queue::{Queue, QueueMap};
pub use schema::SyncColumns;
pub use server::ServerContext;
pub use sql::SqlTemplater;
