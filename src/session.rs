use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dump::SnapshotDump;
use crate::error::{Error, Result};
use crate::queue::{Queue, QueueDrain};
use crate::rpc::{ClientMessageArgs, DbExecArgs, DbExecReply, RpcClient};
use crate::server::ServerContext;
use crate::sql::SqlTemplater;
use crate::timeout::TimeoutStream;

pub const DEFAULT_MAX_PACKET_SIZE: usize = 4 * 1024;

/// How long the incremental loop waits for queued records per cycle.
const RETRIEVE_INTERVAL: Duration = Duration::from_millis(100);

/// Runs one push session on an accepted push connection.
///
/// The RPC direction is inverted here: the server becomes the caller on
/// the client's socket and drives `client.*` and `db.Exec` on the peer.
/// The session walks handshake → full sync → incremental and tears down
/// on the first error; the client reconnects and re-handshakes.
pub async fn run_push_session<S>(ctx: Arc<ServerContext>, stream: TimeoutStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut rpc = RpcClient::new(stream);
    match drive(&ctx, &mut rpc).await {
        Ok(()) => {}
        Err(Error::QueueClosed) => info!("push session ended: queue closed"),
        Err(err) => warn!(error = %err, "push session ended"),
    }
}

async fn drive<S>(ctx: &ServerContext, rpc: &mut RpcClient<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (client_id, max_packet_size) = match handshake(rpc).await {
        Ok(negotiated) => negotiated,
        Err(err) => {
            send_message(rpc, "", &format!("error get client uuid: {err}")).await;
            send_message(rpc, "", "server will close connection").await;
            return Err(err);
        }
    };

    if let Err(err) = pre_sync(rpc, &client_id).await {
        send_message(rpc, &client_id, &format!("error preSync: {err}")).await;
        send_message(rpc, &client_id, "server will close connection").await;
        return Err(err);
    }

    ctx.stats.add_push_session();
    info!(client = %client_id, "start full sync");

    let dump = match ctx.db.snapshot(&ctx.sql, ctx.config.use_lock_table).await {
        Ok(dump) => dump,
        Err(err) => {
            send_message(rpc, &client_id, &format!("error full sync: {err}")).await;
            return Err(err);
        }
    };

    // Register the queue before the snapshot is streamed: fan-outs running
    // during the stream are buffered and delivered strictly after it, and
    // any previous session under this identity is superseded.
    let (queue, mut drain) = Queue::new(client_id.clone());
    ctx.queues.add(Arc::clone(&queue)).await;

    let result = sync_client(&ctx.sql, rpc, &client_id, dump, &mut drain, max_packet_size).await;
    queue.close();

    if let Err(err) = &result
        && !matches!(err, Error::QueueClosed)
    {
        send_message(rpc, &client_id, &format!("error sync: {err}")).await;
        send_message(rpc, &client_id, "server will close connection").await;
    }
    result
}

/// Establishes the client identity and the packet-size bound.
///
/// A client with no stored identity gets a fresh v4 UUID and is told to
/// persist it; an absent or unparseable `max_allowed_packet` falls back to
/// [`DEFAULT_MAX_PACKET_SIZE`].
async fn handshake<S>(rpc: &mut RpcClient<S>) -> Result<(String, usize)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_id: String = rpc.call("client.GetValue", &"client_uuid").await?;
    if client_id.is_empty() {
        client_id = Uuid::new_v4().to_string();
        info!(client = %client_id, "new client uuid generated");
        send_message(rpc, &client_id, &format!("set client UUID '{client_id}'")).await;
    }

    let max_packet_size = negotiate_max_packet(rpc, &client_id).await;
    Ok((client_id, max_packet_size))
}

async fn negotiate_max_packet<S>(rpc: &mut RpcClient<S>, client_id: &str) -> usize
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text: String = match rpc.call("client.GetValue", &"sql_max_allowed_packet").await {
        Ok(text) => text,
        Err(err) => {
            info!(client = %client_id, error = %err, "client.GetValue sql_max_allowed_packet");
            send_message(
                rpc,
                client_id,
                &format!("error client.GetValue sql_max_allowed_packet: {err}"),
            )
            .await;
            return DEFAULT_MAX_PACKET_SIZE;
        }
    };
    if text.is_empty() {
        return DEFAULT_MAX_PACKET_SIZE;
    }
    match text.parse::<usize>() {
        Ok(size) if size > 0 => size,
        _ => {
            info!(client = %client_id, got = %text, "bad sql_max_allowed_packet");
            send_message(
                rpc,
                client_id,
                &format!("error client.GetValue sql_max_allowed_packet (got '{text}')"),
            )
            .await;
            DEFAULT_MAX_PACKET_SIZE
        }
    }
}

/// Application hook between handshake and full sync. Intentionally empty.
async fn pre_sync<S>(_rpc: &mut RpcClient<S>, _client_id: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Ok(())
}

/// Streams the snapshot, then serves the incremental loop until the queue
/// closes or an RPC call fails.
async fn sync_client<S>(
    sql: &SqlTemplater,
    rpc: &mut RpcClient<S>,
    client_id: &str,
    mut dump: SnapshotDump,
    drain: &mut QueueDrain,
    max_packet_size: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(before) = &sql.sync_client_before_full_update {
        exec_remote(rpc, client_id, before.clone()).await?;
    }

    push_snapshot(sql, rpc, client_id, &mut dump, max_packet_size).await?;
    dump.close().await?;
    info!(client = %client_id, "full sync complete");

    incremental(sql, rpc, client_id, drain, max_packet_size).await
}

async fn push_snapshot<S>(
    sql: &SqlTemplater,
    rpc: &mut RpcClient<S>,
    client_id: &str,
    dump: &mut SnapshotDump,
    max_packet_size: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (stmt, end) = sql.client_insert_dump(dump, max_packet_size).await?;
        if let Some(stmt) = stmt {
            exec_remote(rpc, client_id, stmt).await?;
        }
        if end {
            return Ok(());
        }
    }
}

async fn incremental<S>(
    sql: &SqlTemplater,
    rpc: &mut RpcClient<S>,
    client_id: &str,
    drain: &mut QueueDrain,
    max_packet_size: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let batch = drain.retrieve_timeout(RETRIEVE_INTERVAL).await?;
        let mut rest = batch.as_slice();
        while !rest.is_empty() {
            let (stmt, remaining) = sql.client_insert_slice(rest, max_packet_size)?;
            rest = remaining;
            if let Some(stmt) = stmt {
                exec_remote(rpc, client_id, stmt).await?;
            }
        }
    }
}

async fn exec_remote<S>(
    rpc: &mut RpcClient<S>,
    client_id: &str,
    command: String,
) -> Result<DbExecReply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply: DbExecReply = rpc.call("db.Exec", &DbExecArgs::command(command)).await?;
    debug!(
        client = %client_id,
        rows_affected = reply.rows_affected,
        "client db.Exec"
    );
    Ok(reply)
}

/// Best-effort operator diagnostics pushed to the client log; failures are
/// ignored because the session is usually already on its way down.
async fn send_message<S>(rpc: &mut RpcClient<S>, client_id: &str, message: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let args = ClientMessageArgs {
        client_id: client_id.to_string(),
        message: message.to_string(),
    };
    let _ = rpc.call::<_, i32>("client.Message", &args).await;
}
