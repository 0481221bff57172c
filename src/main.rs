use {
    axum::extract::DefaultBodyLimit,
    pay_sync::{
        AppState,
        adapters::{
            alerts::LogAlertSink,
            redis_backend::{self, RedisEventPublisher, RedisIdempotencyCache},
            signature::VerifierRegistry,
            webhook,
        },
        config::Config,
        domain::{
            alert::AlertSink,
            cache::IdempotencyCache,
            clock::{Clock, SystemClock},
            publisher::DomainEventPublisher,
            store::PaymentStore,
        },
        infra::postgres::PgStore,
        services::{
            outbox::OutboxRelay,
            pipeline::{Pipeline, PipelineDeps},
            supervisor::Supervisor,
            telemetry::Telemetry,
        },
    },
    sqlx::postgres::PgPoolOptions,
    std::{error::Error, sync::Arc, time::Duration},
    tokio::{
        signal,
        sync::{Notify, watch},
    },
    tower_http::{timeout::TimeoutLayer, trace::TraceLayer},
    tracing_subscriber::EnvFilter,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    let enabled = config.secrets.enabled();
    if enabled.is_empty() {
        tracing::warn!("no provider secrets configured, every webhook will be rejected");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .acquire_timeout(Duration::from_secs(3))
        .connect(&config.database_url)
        .await?;
    if config.run_migrations {
        sqlx::migrate!("./migrations").run(&pool).await?;
    }

    let store: Arc<dyn PaymentStore> = Arc::new(PgStore::new(pool));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let alerts: Arc<dyn AlertSink> = Arc::new(LogAlertSink);

    let cache: Option<Arc<dyn IdempotencyCache>>;
    let publisher: Option<Arc<dyn DomainEventPublisher>>;
    match &config.redis_url {
        Some(url) => {
            let conn = redis_backend::connect(url).await?;
            cache = Some(Arc::new(RedisIdempotencyCache::new(conn.clone())));
            publisher = Some(Arc::new(RedisEventPublisher::new(conn)));
        }
        None => {
            tracing::warn!("REDIS_URL unset: no idempotency cache, outbox relay disabled");
            cache = None;
            publisher = None;
        }
    }

    let outbox_ready = Arc::new(Notify::new());
    let pipeline = Arc::new(Pipeline::new(
        PipelineDeps {
            store: store.clone(),
            cache,
            alerts: alerts.clone(),
            clock: clock.clone(),
            telemetry: Arc::new(Telemetry::new()),
            outbox_ready: outbox_ready.clone(),
        },
        config.guard.clone(),
        config.dispatch.clone(),
    ));
    let registry = Arc::new(VerifierRegistry::from_secrets(
        &config.secrets,
        config.replay_window,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::new(
        pipeline.clone(),
        registry.clone(),
        store.clone(),
        alerts,
        clock.clone(),
        config.supervisor.clone(),
    );
    let supervisor_handle = tokio::spawn(supervisor.run(shutdown_rx.clone()));
    // Without a bus, committed events stay pending in the outbox table.
    let relay_handle = publisher.map(|publisher| {
        let relay = OutboxRelay::new(
            store,
            publisher,
            clock.clone(),
            outbox_ready,
            config.outbox_poll_interval,
        );
        tokio::spawn(relay.run(shutdown_rx))
    });

    let state = AppState {
        pipeline,
        registry,
        clock,
        request_timeout: config.request_timeout,
    };
    let app = webhook::router(state)
        .layer(DefaultBodyLimit::max(64 * 1024))
        // Outer bound; the handler's own budget is tighter.
        .layer(TimeoutLayer::new(config.request_timeout * 2))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, providers = ?enabled, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = supervisor_handle.await;
    if let Some(relay_handle) = relay_handle {
        let _ = relay_handle.await;
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl+c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
