use std::convert::Infallible;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tracing::warn;

use crate::error::Result;
use crate::server::ServerContext;

/// Serves the plaintext notify/stat endpoint on an already-bound listener.
pub async fn serve(ctx: Arc<ServerContext>, listener: std::net::TcpListener) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let ctx = Arc::clone(&ctx);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let ctx = Arc::clone(&ctx);
                async move { Ok::<_, Infallible>(handle(ctx, req).await) }
            }))
        }
    });
    Server::from_tcp(listener)?.serve(make_svc).await?;
    Ok(())
}

async fn handle(ctx: Arc<ServerContext>, req: Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/notify") => notify(ctx, req).await,
        (_, "/notify") => text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
        (&Method::GET, "/stat") => stat(&ctx),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// `POST /notify` with repeatable form field `id`: fetches each row's
/// current state and fans it out to every connected client's queue.
async fn notify(ctx: Arc<ServerContext>, req: Request<Body>) -> Response<Body> {
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(_) => return text(StatusCode::BAD_REQUEST, "Bad Request"),
    };

    let ids = parse_notify_ids(&body);
    if ids.is_empty() {
        return text(StatusCode::OK, "no item");
    }

    for id in &ids {
        let record = match ctx
            .db
            .single_row(&ctx.sql.sync_single_update, id, ctx.sql.columns())
            .await
        {
            Ok(record) => record,
            Err(err) => {
                warn!(id = %id, error = %err, "notify row fetch failed");
                return text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error Query Database: {err}"),
                );
            }
        };
        ctx.queues.fan_out(&record).await;
    }

    ctx.stats.add_rows_notified(ids.len() as i64);
    text(StatusCode::OK, format!("OK, {} item processed", ids.len()))
}

fn stat(ctx: &ServerContext) -> Response<Body> {
    match serde_json::to_string(&ctx.stats.snapshot()) {
        Ok(json) => {
            let mut res = Response::new(Body::from(json));
            res.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            res
        }
        Err(err) => text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn parse_notify_ids(body: &[u8]) -> Vec<String> {
    url::form_urlencoded::parse(body)
        .filter(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned())
        .collect()
}

fn text(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut res = Response::new(body.into());
    *res.status_mut() = status;
    res
}
