//! Length-framed request/reply RPC.
//!
//! Every message is a 4-byte little-endian payload length followed by a
//! JSON object. A connection carries one in-flight call at a time
//! (half-duplex): the control channel has the remote client as caller,
//! while a push session turns the server into the caller on its own
//! socket. Either endpoint of the framing can therefore host the caller
//! or the callee half without protocol changes.

mod proto;

pub use proto::{
    ClientConnectArgs, ClientConnectReply, ClientMessageArgs, ClientRestartArgs, DbExecArgs,
    DbExecReply,
};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::timeout::TimeoutStream;

/// Frames larger than this are a protocol violation, not data.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

pub async fn write_message<S, T>(stream: &mut TimeoutStream<S>, message: &T) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::RpcProtocol("outgoing frame too large".to_string()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one message; `None` on a clean end-of-stream at a frame boundary.
pub async fn read_message<S, T>(stream: &mut TimeoutStream<S>) -> Result<Option<T>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = stream.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::RpcProtocol("truncated frame header".to_string()));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::RpcProtocol("incoming frame too large".to_string()));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Caller half: issues calls and matches replies by id.
pub struct RpcClient<S> {
    stream: TimeoutStream<S>,
    next_id: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> RpcClient<S> {
    pub fn new(stream: TimeoutStream<S>) -> Self {
        Self { stream, next_id: 0 }
    }

    pub async fn call<P, R>(&mut self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.next_id += 1;
        let id = self.next_id;
        let request = Request {
            id,
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        };
        write_message(&mut self.stream, &request).await?;

        let response: Response = read_message(&mut self.stream)
            .await?
            .ok_or_else(|| Error::RpcProtocol("connection closed mid-call".to_string()))?;
        if response.id != id {
            return Err(Error::RpcProtocol(format!(
                "reply id {} does not match call id {id}",
                response.id
            )));
        }
        if let Some(error) = response.error {
            return Err(Error::Rpc(error));
        }
        Ok(serde_json::from_value(
            response.result.unwrap_or(serde_json::Value::Null),
        )?)
    }
}

/// Callee half: reads requests and answers them with `dispatch` until the
/// peer hangs up. A dispatch error becomes the call's error reply; the
/// connection keeps serving.
pub async fn serve<S, F>(stream: &mut TimeoutStream<S>, mut dispatch: F) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(&str, serde_json::Value) -> Result<serde_json::Value>,
{
    while let Some(request) = read_message::<S, Request>(stream).await? {
        let (result, error) = match dispatch(&request.method, request.params) {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err.to_string())),
        };
        let response = Response {
            id: request.id,
            result,
            error,
        };
        write_message(stream, &response).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn wrap<S: AsyncRead + AsyncWrite + Unpin>(s: S) -> TimeoutStream<S> {
        TimeoutStream::new(s, Duration::from_secs(1), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn call_reply_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = RpcClient::new(wrap(client_io));
        let mut server_stream = wrap(server_io);

        let server = tokio::spawn(async move {
            serve(&mut server_stream, |method, params| {
                assert_eq!(method, "client.Ping");
                Ok(params)
            })
            .await
        });

        let echoed: i64 = client.call("client.Ping", &7i64).await.unwrap();
        assert_eq!(echoed, 7);

        drop(client);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dispatch_error_becomes_call_error() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = RpcClient::new(wrap(client_io));
        let mut server_stream = wrap(server_io);

        let server = tokio::spawn(async move {
            serve(&mut server_stream, |_, _| Err(Error::rpc("unknown key"))).await
        });

        let err = client
            .call::<_, String>("client.GetValue", &"nope")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rpc(msg) if msg.contains("unknown key")));

        drop(client);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn structured_args_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = RpcClient::new(wrap(client_io));
        let mut server_stream = wrap(server_io);

        let server = tokio::spawn(async move {
            serve(&mut server_stream, |method, params| {
                assert_eq!(method, "db.Exec");
                let args: DbExecArgs = serde_json::from_value(params)?;
                assert!(args.command.starts_with("INSERT"));
                Ok(serde_json::to_value(DbExecReply {
                    last_insert_id: 0,
                    rows_affected: 3,
                })?)
            })
            .await
        });

        let reply: DbExecReply = client
            .call("db.Exec", &DbExecArgs::command("INSERT INTO t VALUES (1)"))
            .await
            .unwrap();
        assert_eq!(reply.rows_affected, 3);

        drop(client);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wire_field_names_are_pascal_case() {
        let args = DbExecArgs::command("SELECT 1");
        let value = serde_json::to_value(&args).unwrap();
        assert_eq!(value["Command"], json!("SELECT 1"));

        let reply: DbExecReply =
            serde_json::from_value(json!({"LastInsertID": 5, "RowsAffected": 2})).unwrap();
        assert_eq!(reply.last_insert_id, 5);
        assert_eq!(reply.rows_affected, 2);
    }

    #[tokio::test]
    async fn clean_eof_ends_serving() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut server_stream = wrap(server_io);

        let server =
            tokio::spawn(
                async move { serve(&mut server_stream, |_, params| Ok(params)).await },
            );

        drop(client_io);
        server.await.unwrap().unwrap();
    }
}
