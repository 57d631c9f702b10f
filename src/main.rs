use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{routing::get, Router};
use http::HeaderValue;
use tokio::{signal, sync::mpsc};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{error, info, warn};

use storefront_api as api;
use api::services::{
    in_memory_gateway::InMemoryGateway, payment_gateway::PaymentGateway,
    reconciliation::ReconciliationPoller, stripe_gateway::StripeGateway,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    let gateway: Arc<dyn PaymentGateway> = match cfg.payments.provider.as_str() {
        "stripe" => Arc::new(
            StripeGateway::new(&cfg.payments).context("failed to build stripe gateway")?,
        ),
        _ => {
            warn!("Using in-memory payment gateway; no money will move");
            Arc::new(InMemoryGateway::new(cfg.payments.clone()))
        }
    };
    info!(provider = gateway.name(), "Payment gateway configured");

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(api::events::EventSender::new(event_tx));
    tokio::spawn(api::events::process_events(event_rx));

    let app_state = api::AppState::new(db_arc.clone(), cfg.clone(), event_sender, gateway);

    if cfg.payments.reconcile_interval_secs > 0 {
        ReconciliationPoller::new(
            app_state.services.payments.clone(),
            app_state.services.refunds.clone(),
            &cfg.payments,
        )
        .spawn();
        info!(
            interval_secs = cfg.payments.reconcile_interval_secs,
            "Payment reconciliation poller started"
        );
    } else {
        info!("Payment reconciliation poller disabled");
    }

    // Build CORS layer from config
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    let cors_layer = if let Some(origins) = configured_origins {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.should_allow_permissive_cors() {
        info!(
            "Using permissive CORS because explicit origins were not configured ({})",
            if cfg.is_development() {
                "development environment"
            } else {
                "explicit override enabled"
            }
        );
        CorsLayer::permissive()
    } else {
        error!("Missing CORS configuration detected; set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true");
        anyhow::bail!(
            "Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true"
        );
    };

    let app = Router::<api::AppState>::new()
        .route("/", get(|| async { "storefront-api up" }))
        .nest("/api/v1", api::api_v1_routes())
        .merge(api::openapi::swagger_ui())
        .layer(api::tracing::configure_http_tracing())
        .layer(TimeoutLayer::new(Duration::from_secs(cfg.request_timeout_secs)))
        .layer(CompressionLayer::new())
        .layer(cors_layer)
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            api::middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(app_state);

    let ip: std::net::IpAddr = cfg
        .host
        .parse()
        .with_context(|| format!("invalid listen host {}", cfg.host))?;
    let addr = SocketAddr::new(ip, cfg.port);
    info!("storefront-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("storefront-api stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
