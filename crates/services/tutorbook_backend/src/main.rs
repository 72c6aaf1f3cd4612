// --- File: crates/services/tutorbook_backend/src/main.rs ---
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tutorbook_backend::build_app;
use tutorbook_backend::service_factory::TutorbookServiceFactory;
use tutorbook_booking::{BookingDeps, BookingEngine, BookingSettings, SystemClock};
use tutorbook_common::logging;
use tutorbook_config::load_config;
use tutorbook_db::StoreFactory;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init();

    let store = match StoreFactory::new().from_app_config(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open booking store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let services = TutorbookServiceFactory::new(&config);
    let deps = BookingDeps::from_factory(
        store,
        Arc::new(SystemClock),
        &services,
        BookingSettings::from_config(&config.booking),
    );
    let engine = Arc::new(BookingEngine::new(deps));
    let app = build_app(engine.clone());

    let sweeper = engine
        .sweeper
        .clone()
        .spawn(engine.deps.settings.sweep_interval);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            sweeper.shutdown().await;
            return ExitCode::FAILURE;
        }
    };
    info!("Starting server at http://{}", addr);
    info!("API endpoints available at http://{}/api", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.shutdown().await;
    match served {
        Ok(()) => {
            info!("Server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
