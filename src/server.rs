use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::Config;
use crate::control::ControlService;
use crate::db::Db;
use crate::error::Result;
use crate::queue::QueueMap;
use crate::session;
use crate::sql::SqlTemplater;
use crate::stats::{ConnectionGuard, Stats};
use crate::timeout::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT, TimeoutConfig,
    TimeoutStream,
};
use crate::{http, tls};

/// Everything a connection handler needs, threaded explicitly instead of
/// living in globals. Built once at startup.
pub struct ServerContext {
    pub config: Config,
    pub sql: SqlTemplater,
    pub db: Db,
    pub queues: QueueMap,
    pub stats: Arc<Stats>,
}

impl ServerContext {
    pub fn new(config: Config, sql: SqlTemplater, db: Db) -> Self {
        Self {
            config,
            sql,
            db,
            queues: QueueMap::new(),
            stats: Stats::new(),
        }
    }
}

#[derive(Clone, Copy)]
enum Role {
    Control,
    Push,
}

#[derive(Clone, Copy)]
struct ConnTimeouts {
    connect: Duration,
    read: Duration,
    write: Duration,
}

/// Binds the three listeners and serves until the HTTP listener fails.
///
/// Control and push both speak mTLS through the same acceptor; the notify
/// endpoint is plaintext HTTP for the owning application.
pub async fn run(ctx: Arc<ServerContext>) -> Result<()> {
    let timeout_config = TimeoutConfig::parse(&ctx.config.timeout)?;
    let timeouts = ConnTimeouts {
        connect: timeout_config.get("connect", DEFAULT_CONNECT_TIMEOUT)?,
        read: timeout_config.get("read", DEFAULT_READ_TIMEOUT)?,
        write: timeout_config.get("write", DEFAULT_WRITE_TIMEOUT)?,
    };
    // The push timeout is only advertised to clients, but a bad value
    // should fail at startup, not on the first GetValue.
    TimeoutConfig::parse(&ctx.config.push_timeout)?;

    let acceptor = tls::make_acceptor(&ctx.config)?;

    let control = TcpListener::bind(&ctx.config.listen).await?;
    let push = TcpListener::bind(&ctx.config.notify_listen).await?;
    let http_listener = std::net::TcpListener::bind(&ctx.config.http_listen)?;
    http_listener.set_nonblocking(true)?;
    info!(
        control = %ctx.config.listen,
        push = %ctx.config.notify_listen,
        http = %ctx.config.http_listen,
        "listening"
    );

    tokio::spawn(accept_loop(
        Arc::clone(&ctx),
        control,
        acceptor.clone(),
        Role::Control,
        timeouts,
    ));
    tokio::spawn(accept_loop(
        Arc::clone(&ctx),
        push,
        acceptor,
        Role::Push,
        timeouts,
    ));

    http::serve(ctx, http_listener).await
}

async fn accept_loop(
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    role: Role,
    timeouts: ConnTimeouts,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "accept failed");
                return;
            }
        };
        let ctx = Arc::clone(&ctx);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let _guard = ConnectionGuard::new(Arc::clone(&ctx.stats));

            let stream = match tokio::time::timeout(timeouts.connect, acceptor.accept(socket)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    warn!(%peer, error = %err, "tls handshake failed");
                    return;
                }
                Err(_) => {
                    warn!(%peer, "tls handshake timed out");
                    return;
                }
            };
            let mut stream = TimeoutStream::new(stream, timeouts.read, timeouts.write);

            match role {
                Role::Control => {
                    let service = ControlService::new(&ctx.config);
                    if let Err(err) = service.serve(&mut stream).await {
                        warn!(%peer, error = %err, "control connection ended");
                    }
                }
                Role::Push => session::run_push_session(ctx, stream).await,
            }
        });
    }
}
