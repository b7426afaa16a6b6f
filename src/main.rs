use std::net::SocketAddr;
use std::sync::Arc;

use portcullis::config::LoggingConfig;
use portcullis::{
    Config, GatewayState, ReverseProxy, RetryPolicy, Router, UpstreamTarget, build_client, limit,
    serve, shutdown_signal,
};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("failed to load configuration: {e}");
        std::process::exit(1);
    });

    init_logging(&config.logging);
    info!(
        port = config.server.port,
        log_level = %config.logging.level,
        log_format = %config.logging.format,
        "gateway_starting"
    );

    let auth_target = UpstreamTarget::parse(&config.upstream.auth_url).unwrap_or_else(|e| {
        error!(%e, "invalid AUTH_SERVICE_URL");
        std::process::exit(1);
    });
    let onboarding_target =
        UpstreamTarget::parse(&config.upstream.onboarding_url).unwrap_or_else(|e| {
            error!(%e, "invalid ONBOARDING_SERVICE_URL");
            std::process::exit(1);
        });

    let client = build_client();
    let retry = RetryPolicy::from_config(&config.retry);

    let router = Router::new(vec![
        (
            "/api/auth".to_owned(),
            ReverseProxy::new(auth_target, client.clone(), retry),
        ),
        (
            "/api/onboarding".to_owned(),
            ReverseProxy::new(onboarding_target, client, retry),
        ),
    ]);

    let state = Arc::new(GatewayState::new(&config, router));
    let sweeper = limit::spawn_sweeper(state.per_ip_limiter.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr).await.unwrap_or_else(|e| {
        error!(%e, %addr, "failed to bind");
        std::process::exit(1);
    });

    info!(
        port = config.server.port,
        auth_service = %config.upstream.auth_url,
        onboarding_service = %config.upstream.onboarding_url,
        "gateway_listening"
    );

    serve(listener, state, shutdown_signal()).await;

    sweeper.abort();
    info!("shutdown complete");
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
