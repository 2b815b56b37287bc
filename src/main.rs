use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use gazette::{
    application::{content::ContentStore, error::AppError},
    cache::{CacheConfig, CacheService, ConnectionManager, DistributedStoreAdapter},
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        redis::RedisConnector,
        telemetry,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

/// Extra time granted to the first remote connect beyond its own timeout.
const STARTUP_SETTLE_GRACE: Duration = Duration::from_millis(250);

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
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache = build_cache(&settings).await;
    let sweeper = cache.spawn_sweeper();

    let state = HttpState {
        content: Arc::new(ContentStore::default()),
        cache: Arc::clone(&cache),
    };

    let result = serve_http(&settings, state).await;

    if let Some(handle) = sweeper {
        handle.abort();
        let _ = handle.await;
    }

    result
}

/// Memory-only unless a Redis URL is configured. An unusable URL or an
/// unreachable server degrades to memory instead of failing startup.
async fn build_cache(settings: &config::Settings) -> Arc<CacheService> {
    let cache_config = CacheConfig::from(&settings.cache);

    let remote = match settings.redis.url.as_deref() {
        None => {
            info!(
                target = "gazette::cache",
                "no distributed cache configured; serving from memory"
            );
            None
        }
        Some(url) => match RedisConnector::new(url) {
            Ok(connector) => {
                let manager =
                    ConnectionManager::new(Arc::new(connector), settings.redis.connection);
                manager.spawn();

                let settle = settings.redis.connection.connect_timeout + STARTUP_SETTLE_GRACE;
                let state = manager.wait_until_settled(settle).await;
                info!(
                    target = "gazette::cache",
                    state = state.as_str(),
                    environment = ?settings.redis.environment,
                    "distributed cache initialised"
                );

                Some(Arc::new(DistributedStoreAdapter::new(
                    manager,
                    &cache_config.namespace,
                )))
            }
            Err(err) => {
                warn!(
                    target = "gazette::cache",
                    error = %err,
                    "distributed cache disabled; serving from memory"
                );
                None
            }
        },
    };

    Arc::new(CacheService::new(cache_config, remote))
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "gazette::http",
        addr = %settings.server.addr,
        "listening"
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .into_future();
    let mut server = tokio::spawn(server);

    tokio::select! {
        joined = &mut server => return flatten_server_result(joined),
        _ = tokio::signal::ctrl_c() => {
            info!(target = "gazette::http", "shutdown signal received; draining");
        }
    }

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => flatten_server_result(joined),
        Err(_) => {
            warn!(
                target = "gazette::http",
                timeout_secs = settings.server.graceful_shutdown.as_secs(),
                "graceful shutdown timed out; aborting open connections"
            );
            server.abort();
            Ok(())
        }
    }
}

fn flatten_server_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AppError::from(InfraError::from(err))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}
