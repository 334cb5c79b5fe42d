use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::Result;
use log::{error, info, LevelFilter};

use snapshot_mirror::query::QueryEngine;
use snapshot_mirror::{api, cli, config, db};

#[tokio::main]
async fn main() -> ExitCode {
    let args: cli::ApiArgs = argh::from_env();
    let level = if args.debug {
        LevelFilter::Debug
    } else if args.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Error
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: cli::ApiArgs) -> Result<()> {
    let connspec = args
        .db_pgconn
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| config::Config::default().db_pgconn);
    let addr: SocketAddr = args.bind.parse()?;
    info!("Connecting to database...");
    let pool = db::connect_database(&connspec).await?;
    let engine = QueryEngine::new(pool);
    info!("Serving the index API on {}", addr);
    api::serve(engine, addr).await
}
