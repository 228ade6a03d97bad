use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use tiercache::{
    application::{customers::CustomerService, error::AppError, repos::CustomersRepo},
    cache::{HybridCache, MemoryRemoteStore, RemoteStore, ResponseCache, spawn_sweeper},
    config,
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, HttpState},
        memory::InMemoryCustomers,
        telemetry,
    },
};
use tokio::sync::oneshot;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let database_url = settings
        .database
        .url
        .as_deref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let repositories = connect_repositories(database_url, &settings.database).await?;
    info!(target = "tiercache::migrate", "Migrations applied");
    repositories.pool().close().await;
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let backends = init_backends(&settings).await?;

    let hybrid = HybridCache::from_config(&settings.cache, Some(backends.remote));
    let responses = Arc::new(ResponseCache::from_config(&settings.cache));
    let customers = Arc::new(CustomerService::new(backends.customers, hybrid.clone()));

    let sweeper = spawn_sweeper(
        settings.cache.sweep_interval,
        hybrid,
        Arc::clone(&responses),
    );

    let state = HttpState {
        customers,
        responses,
        db: backends.db,
        environment: Arc::from(settings.app.environment.as_str()),
    };

    let result = serve_http(&settings, state).await;

    sweeper.abort();
    let _ = sweeper.await;

    result
}

struct Backends {
    customers: Arc<dyn CustomersRepo>,
    remote: Arc<dyn RemoteStore>,
    db: Option<Arc<PostgresRepositories>>,
}

async fn init_backends(settings: &config::Settings) -> Result<Backends, AppError> {
    match settings.database.url.as_deref() {
        Some(database_url) => {
            let repositories =
                Arc::new(connect_repositories(database_url, &settings.database).await?);
            info!(
                target = "tiercache::startup",
                max_connections = settings.database.max_connections.get(),
                "Using Postgres for customers and the remote cache tier"
            );
            Ok(Backends {
                customers: repositories.clone(),
                remote: repositories.clone(),
                db: Some(repositories),
            })
        }
        None => {
            warn!(
                target = "tiercache::startup",
                "No database configured; using in-memory customers and remote cache tier"
            );
            Ok(Backends {
                customers: Arc::new(InMemoryCustomers::sample()),
                remote: Arc::new(MemoryRemoteStore::new()),
                db: None,
            })
        }
    }
}

async fn connect_repositories(
    database_url: &str,
    database: &config::DatabaseSettings,
) -> Result<PostgresRepositories, AppError> {
    let pool = PostgresRepositories::connect(database_url, database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err)))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    Ok(PostgresRepositories::new(pool))
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "tiercache::startup",
        addr = %settings.server.addr,
        environment = %settings.app.environment,
        "Listening"
    );

    let (signalled_tx, signalled_rx) = oneshot::channel();
    let shutdown = async move {
        shutdown_signal().await;
        let _ = signalled_tx.send(());
    };

    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown)
        .into_future();
    tokio::pin!(server);

    let result = tokio::select! {
        result = &mut server => result,
        Ok(()) = signalled_rx => drain(&mut server, settings.server.graceful_shutdown).await,
    };

    result.map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn drain<F>(server: &mut std::pin::Pin<&mut F>, grace: Duration) -> std::io::Result<()>
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    info!(target = "tiercache::shutdown", grace = ?grace, "Draining connections");
    match tokio::time::timeout(grace, server.as_mut()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                target = "tiercache::shutdown",
                "Graceful shutdown timed out; dropping open connections"
            );
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
