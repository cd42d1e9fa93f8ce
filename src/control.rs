use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::rpc::{self, ClientConnectArgs, ClientConnectReply, ClientMessageArgs};
use crate::timeout::TimeoutStream;

pub const SERVER_VERSION: i32 = 10_000;

/// The client-initiated side of the protocol, served on the control
/// listener. Clients use it to announce themselves, fetch connection
/// parameters and keep the channel alive.
pub struct ControlService {
    notify_server_addr: String,
    notify_server_name: String,
    push_timeout: String,
}

impl ControlService {
    pub fn new(config: &Config) -> Self {
        Self {
            notify_server_addr: config.notify_server_addr.clone(),
            notify_server_name: config.notify_server_name.clone(),
            push_timeout: config.push_timeout.clone(),
        }
    }

    pub async fn serve<S>(&self, stream: &mut TimeoutStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        rpc::serve(stream, |method, params| self.dispatch(method, params)).await
    }

    fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "client.Connect" => {
                let args: ClientConnectArgs = serde_json::from_value(params)?;
                info!(
                    client = %args.client_id,
                    version = args.client_version,
                    "client connected"
                );
                Ok(serde_json::to_value(ClientConnectReply {
                    server_version: SERVER_VERSION,
                    message: format!("sync server ready, version {SERVER_VERSION}"),
                })?)
            }
            "client.GetValue" => {
                let key: String = serde_json::from_value(params)?;
                let value = self.get_value(&key)?;
                Ok(Value::String(value))
            }
            "client.Ping" => {
                let nonce: i64 = serde_json::from_value(params)?;
                Ok(Value::from(nonce))
            }
            "client.Message" => {
                let args: ClientMessageArgs = serde_json::from_value(params)?;
                info!(client = %args.client_id, "client message: {}", args.message);
                Ok(Value::from(0i32))
            }
            // Replication control is one-way; nobody restarts the server
            // over the wire.
            "client.Restart" => Err(Error::rpc("no way")),
            _ => Err(Error::rpc(format!("unknown method '{method}'"))),
        }
    }

    fn get_value(&self, key: &str) -> Result<String> {
        match key {
            "notify_server_addr" => {
                if self.notify_server_name.is_empty() {
                    Ok(self.notify_server_addr.clone())
                } else {
                    Ok(format!(
                        "{}<{}>",
                        self.notify_server_addr, self.notify_server_name
                    ))
                }
            }
            "timeout_config" => Ok(self.push_timeout.clone()),
            _ => Err(Error::rpc("unknown key")),
        }
    }
}
