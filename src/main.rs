use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use rowsync::config::{self, Config};
use rowsync::db::Db;
use rowsync::error::Result;
use rowsync::server::{self, ServerContext};
use rowsync::sql::SqlTemplater;

const CONFIG_FILE: &str = "config.json";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("FAILED: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config_path = Path::new(CONFIG_FILE);
    if !config_path.exists() {
        Config::default().save(config_path)?;
        eprintln!("config file created, please check config and restart server");
        return Ok(());
    }
    let config = Config::load(config_path)?;
    config.validate()?;

    init_logging(&config)?;
    info!("app started");

    let sql = SqlTemplater::new(&config)?;
    let dsn = config::read_dsn(&config.dsn_file)?;
    let db = Db::open(&dsn)?;
    db.check().await?;

    let ctx = Arc::new(ServerContext::new(config, sql, db));
    server::run(ctx).await
}

/// Main log goes to stderr and the `Log` file; events on the `query`
/// target are split off into the `QueryLog` file.
fn init_logging(config: &Config) -> Result<()> {
    let log_file = Arc::new(
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log)?,
    );
    let query_file = Arc::new(
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.query_log)?,
    );

    let main_layer = fmt::layer()
        .with_writer(std::io::stderr.and(log_file))
        .with_filter(filter_fn(|meta| {
            meta.target() != "query" && *meta.level() <= tracing::Level::INFO
        }));
    let query_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(query_file)
        .with_filter(filter_fn(|meta| meta.target() == "query"));

    tracing_subscriber::registry()
        .with(main_layer)
        .with(query_layer)
        .init();
    Ok(())
}
