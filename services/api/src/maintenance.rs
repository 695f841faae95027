//! One-shot commands run against the store files while the service is stopped.

use crate::cli::{BackupArgs, BootstrapArgs, RestoreArgs};
use crate::infra::TracingNotifier;
use catechesis::access::{Gatekeeper, ProfileDirectory};
use catechesis::config::AppConfig;
use catechesis::error::AppError;
use catechesis::objects::FsObjectStore;
use catechesis::stores::{self, StoreSet};
use catechesis::sweeps::Sweeper;
use catechesis::telemetry;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

async fn open() -> Result<(AppConfig, StoreSet), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;
    let stores = StoreSet::open(&config.storage).await?;
    Ok((config, stores))
}

fn print<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value).map_err(std::io::Error::from)?;
    println!("{rendered}");
    Ok(())
}

pub(crate) async fn backup(args: BackupArgs) -> Result<(), AppError> {
    let (_, stores) = open().await?;
    let manifests = match args.store {
        Some(kind) => vec![stores.backup(kind, &args.dir).await?],
        None => stores.backup_all(&args.dir).await?,
    };
    stores.close().await;
    print(&manifests)
}

pub(crate) async fn restore(args: RestoreArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;
    let target = stores::restore(&config.storage, args.store, &args.from).await?;
    info!(store = %args.store, path = %target.display(), "restored store file in place");

    // Reopening applies any migration the backup predates.
    let stores = StoreSet::open(&config.storage).await?;
    let status = stores.schema_status().await?;
    stores.close().await;
    print(&status)
}

pub(crate) async fn sweep() -> Result<(), AppError> {
    let (config, stores) = open().await?;
    let objects = Arc::new(FsObjectStore::new(&config.objects));
    let sweeper = Sweeper::new(
        stores.clone(),
        objects,
        Arc::new(TracingNotifier),
        config.maintenance.clone(),
    );
    let report = sweeper.run_once().await;
    stores.close().await;
    print(&report)
}

pub(crate) async fn schema() -> Result<(), AppError> {
    let (_, stores) = open().await?;
    let status = stores.schema_status().await?;
    stores.close().await;
    print(&status)
}

pub(crate) async fn bootstrap_admin(args: BootstrapArgs) -> Result<(), AppError> {
    let (_, stores) = open().await?;
    let gatekeeper = Gatekeeper::new(stores.enrollment().clone());
    let directory = ProfileDirectory::new(stores.clone(), gatekeeper);
    let profile = directory.bootstrap_administrator(&args.name).await?;
    stores.close().await;
    print(&profile)
}
