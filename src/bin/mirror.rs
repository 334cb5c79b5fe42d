use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::{error, info, LevelFilter};

use snapshot_mirror::store::ObjectStore;
use snapshot_mirror::{cli, config, db, mirror};

#[tokio::main]
async fn main() -> ExitCode {
    let mut args: cli::MirrorArgs = argh::from_env();
    args.normalize();
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

async fn run(args: cli::MirrorArgs) -> Result<()> {
    let root = Path::new(&args.local_directory);
    let config = config::load_config(root)?;
    let store = ObjectStore::open(root)?;
    let pool = if args.provision_db || args.provision_db_only {
        info!("Connecting to database...");
        let pool = db::connect_database(&config.db_pgconn).await?;
        info!("Running any pending migrations...");
        db::run_migrate(&pool).await?;
        Some(pool)
    } else {
        None
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, letting in-flight transfers finish");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let job = mirror::MirrorJob::from(&args);
    mirror::run(&config, &store, &job, pool.as_ref(), cancel).await?;

    Ok(())
}
