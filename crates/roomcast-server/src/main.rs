use anyhow::Result;
use roomcast_server::media::MediaEngine;
use roomcast_server::state::Config;
use std::future::IntoFuture;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Roomcast server...");

    // Load configuration
    let config = Config::load()?;

    // Start the media worker and its router
    let engine = match start_engine(&config).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Failed to start media worker: {:#}", e);
            std::process::exit(1);
        }
    };
    let (app, _state) = match roomcast_server::create_app(config.clone(), &engine).await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!("Failed to start media router: {:#}", e);
            std::process::exit(1);
        }
    };

    // Start the server
    let bind_address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    tokio::select! {
        result = axum::serve(listener, app).into_future() => result?,
        reason = engine.died() => {
            tracing::error!("Media worker died, exiting: {}", reason);
            std::process::exit(1);
        }
    }

    Ok(())
}

#[cfg(feature = "mediasoup")]
async fn start_engine(config: &Config) -> Result<roomcast_server::media::MediasoupEngine> {
    let engine = roomcast_server::media::MediasoupEngine::new(&config.worker_settings()).await?;
    Ok(engine)
}

#[cfg(not(feature = "mediasoup"))]
async fn start_engine(config: &Config) -> Result<roomcast_server::media::LocalMediaEngine> {
    tracing::warn!("Built without the mediasoup feature, no media will be forwarded");
    Ok(roomcast_server::media::LocalMediaEngine::new(
        config.worker_settings(),
    ))
}
