use crate::cli::ServeArgs;
use crate::infra::{AppState, TracingNotifier};
use crate::routes::with_operational_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use catechesis::config::AppConfig;
use catechesis::error::AppError;
use catechesis::extraction::ExtractionService;
use catechesis::objects::FsObjectStore;
use catechesis::stores::StoreSet;
use catechesis::sweeps::Sweeper;
use catechesis::telemetry;
use catechesis::workflows::Pipeline;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let stores = StoreSet::open(&config.storage).await?;
    let objects = Arc::new(FsObjectStore::new(&config.objects));
    let extraction = ExtractionService::from_config(&config.extraction);
    let notifier = Arc::new(TracingNotifier);
    let pipeline = Pipeline::new(
        stores.clone(),
        &config,
        objects.clone(),
        extraction,
        notifier.clone(),
    );

    let sweeper = Arc::new(Sweeper::new(
        stores.clone(),
        objects,
        notifier,
        config.maintenance.clone(),
    ));
    let sweeps = sweeper.spawn(config.maintenance.sweep_interval);

    let app = with_operational_routes(pipeline.router())
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "catechism enrollment service ready");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    readiness_flag.store(false, Ordering::Release);
    sweeps.abort();
    stores.close().await;
    served?;
    info!("service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
