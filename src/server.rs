/// Server setup and initialization
///
/// Wires together all components: database, resource stores, status persister,
/// execution engine, controller, cron scheduler and HTTP routes.

use crate::{
    api::{auth_middleware, create_archive_routes, create_cron_routes, create_workflow_routes, AppState},
    config::Config,
    persist::{ArchiveRepository, Database, OffloadRepository, StatusPersister},
    runtime::{
        controller::{ControllerSettings, WorkflowController},
        engine::{EngineSettings, ExecutionEngine},
        executor::{LocalProcessBackend, TaskBackend},
        scheduler::{CronSchedulerService, CronTrigger},
    },
    workflow::{
        packer::StatusPacker,
        storage::{CronWorkflowStore, SqliteResourceStore, WorkflowStore},
        submit::WorkflowSubmitter,
        types::{CronWorkflow, LabelSelector, Workflow},
    },
};
use anyhow::Result;
use axum::{middleware, routing::get, Router};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Everything a running engine is made of
pub struct Services {
    pub state: AppState,
    pub controller: Arc<WorkflowController>,
    pub cron: Arc<CronSchedulerService>,
    pub database: Database,
}

/// Build every component over an open database
pub async fn build_services(
    config: &Config,
    database: Database,
    backend: Arc<dyn TaskBackend>,
) -> Result<Services> {
    let pool = database.pool().clone();

    tracing::info!("📋 Initializing resource stores");
    let workflows: WorkflowStore = Arc::new(SqliteResourceStore::<Workflow>::new(pool.clone()));
    let crons: CronWorkflowStore = Arc::new(SqliteResourceStore::<CronWorkflow>::new(pool.clone()));

    let offload = config.packer.offload.then(|| OffloadRepository::new(pool.clone()));
    let persister = StatusPersister::new(StatusPacker::new(config.packer.max_status_size), offload);
    let archive = ArchiveRepository::new(pool);
    let submitter = WorkflowSubmitter::new(workflows.clone(), config.server.default_namespace.clone());

    tracing::info!("🚀 Initializing execution engine");
    let engine = ExecutionEngine::new(
        backend,
        EngineSettings {
            dispatch_retries: config.controller.dispatch_retries,
            cancel_grace: Duration::from_secs(config.controller.cancel_grace_seconds),
        },
    );

    let archive_selector = LabelSelector::parse(&config.archive.label_selector)
        .map_err(|e| anyhow::anyhow!("Invalid archive label selector: {}", e))?;
    let controller = Arc::new(WorkflowController::new(
        workflows,
        engine,
        persister.clone(),
        archive.clone(),
        ControllerSettings {
            workers: config.controller.workers,
            resync: Duration::from_secs(config.controller.resync_seconds.max(1)),
            archive: config.archive.enabled,
            archive_selector,
        },
    ));

    tracing::info!("⏰ Initializing cron scheduler service");
    let trigger = Arc::new(CronTrigger::new(crons.clone(), submitter.clone()).with_controller(controller.clone()));
    let cron = Arc::new(
        CronSchedulerService::new(trigger)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize cron scheduler: {}", e))?,
    );

    let state = AppState {
        submitter,
        crons,
        controller: controller.clone(),
        persister,
        archive,
        token: config.auth.token.clone(),
    };

    Ok(Services {
        state,
        controller,
        cron,
        database,
    })
}

/// Create the HTTP router over the application state
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .merge(create_workflow_routes())
        .merge(create_cron_routes())
        .merge(create_archive_routes())
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state);

    Router::new().route("/healthz", get(health_check)).merge(api)
}

/// Start the controller and, when enabled, the cron scheduler
pub async fn start_background(services: &Services, config: &Config, shutdown: CancellationToken) -> Result<()> {
    tracing::info!("🎛️ Starting workflow controller");
    let controller = services.controller.clone();
    tokio::spawn(controller.run(shutdown));

    if config.cron.enabled {
        services.cron.start().await?;
    } else {
        tracing::info!("⏸️ Cron scheduler disabled");
    }
    Ok(())
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing::info!("Starting argosy server...");

    let database = Database::connect(&config.database.url).await?;
    let backend: Arc<dyn TaskBackend> = Arc::new(LocalProcessBackend::new());
    let services = build_services(&config, database, backend).await?;

    let shutdown = CancellationToken::new();
    start_background(&services, &config, shutdown.clone()).await?;

    let app = create_router(services.state.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    let stop = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("🛑 Shutdown signal received");
            stop.cancel();
        })
        .await?;

    if config.cron.enabled {
        services.cron.stop().await?;
    }
    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
