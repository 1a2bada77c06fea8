use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tessera_server::cli::{Cli, Command};
use tessera_server::config::{AppConfig, LogFormat};
use tessera_server::development::Development;
use tessera_server::metrics::Metrics;
use tessera_server::middleware::auth::AuthState;
use tessera_server::rest;
use tessera_server::service::AuthzService;
use tessera_server::telemetry;
use tessera_storage::InMemoryStoreFactory;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_logging(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    // OTel layer is typed to bare Registry, so it must be added first.
    // Layer order (bottom to top): Registry → OTel → EnvFilter → fmt
    let registry = tracing_subscriber::registry();

    #[cfg(feature = "telemetry")]
    let otel_provider = telemetry::init_telemetry(&config.tracing)?;

    #[cfg(not(feature = "telemetry"))]
    telemetry::init_telemetry(&config.tracing)?;

    #[cfg(feature = "telemetry")]
    let otel_layer = otel_provider.as_ref().map(telemetry::make_otel_layer);

    #[cfg(feature = "telemetry")]
    let registry = registry.with(otel_layer);

    let registry = registry.with(filter);

    match config.log.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr);
            registry.with(fmt_layer).try_init()?;
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr);
            registry.with(fmt_layer).try_init()?;
        }
    }

    #[cfg(feature = "telemetry")]
    if otel_provider.is_some() {
        tracing::info!("OpenTelemetry tracing enabled");
    }

    // The provider lives for the whole process.
    #[cfg(feature = "telemetry")]
    if let Some(provider) = otel_provider {
        std::mem::forget(provider);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config)?;

    match cli.command {
        Some(Command::Validate { bundle }) => run_validate(&config, &bundle).await,
        Some(Command::CheckConfig) => run_check_config(&config),
        Some(Command::Serve) | None => run_serve(config).await,
    }
}

fn make_development(config: &AppConfig) -> Development {
    Development::new(
        config.to_engine_config(),
        config.to_schema_limits(),
        config.check_timeout(),
    )
}

async fn run_validate(config: &AppConfig, bundle: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let raw = tokio::fs::read_to_string(bundle).await?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;

    let errors = make_development(config).run(value).await;
    if errors.is_empty() {
        println!("{}: ok", bundle.display());
        return Ok(());
    }

    println!("{}", serde_json::to_string_pretty(&errors)?);
    eprintln!("{}: {} error(s)", bundle.display(), errors.len());
    std::process::exit(1);
}

fn run_check_config(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", toml::to_string(config)?);
    Ok(())
}

async fn run_serve(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        rest_addr = %config.rest_addr(),
        authn = config.authn.enabled,
        "starting tessera server"
    );

    let factory = Arc::new(InMemoryStoreFactory::new());
    let metrics = Arc::new(Metrics::new());
    let service = Arc::new(
        AuthzService::new(
            Arc::clone(&factory),
            config.to_engine_config(),
            config.to_schema_limits(),
        )
        .with_check_timeout(config.check_timeout())
        .with_metrics(Arc::clone(&metrics)),
    );

    let tenant_id = config.default_tenant();
    let auth = if config.authn.enabled {
        AuthState::with_keys(config.authn.keys.iter().cloned(), tenant_id)
    } else {
        AuthState::disabled(tenant_id)
    };

    let state = rest::AppState {
        service: Arc::clone(&service),
        metrics,
        development: Arc::new(make_development(&config)),
    };
    let router = rest::create_router(state, auth, config.rest.max_body_bytes);

    let rest_addr: std::net::SocketAddr = config.rest_addr().parse()?;
    let (shutdown_tx, _) = tokio::sync::watch::channel(());

    let gc_task = config.gc.enabled.then(|| {
        let service = Arc::clone(&service);
        let interval = Duration::from_secs(config.gc.interval_secs);
        let retain = config.gc.retain_snapshots;
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.collect_garbage(retain).await {
                            tracing::error!(error = %e, "gc cycle failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    });

    let listener = tokio::net::TcpListener::bind(rest_addr).await?;
    tracing::info!(%rest_addr, "REST server listening");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(());
        })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "REST server error");
    }

    // The sender is gone by now, which also stops the gc loop.
    if let Some(task) = gc_task {
        let _ = task.await;
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => { tracing::info!("received SIGINT"); }
                _ = sigterm.recv() => { tracing::info!("received SIGTERM"); }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler, using SIGINT only");
            let _ = ctrl_c.await;
            tracing::info!("received SIGINT");
        }
    }
}
