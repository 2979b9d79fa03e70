//! Roomcast Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod error;
pub mod media;
pub mod sfu;
pub mod state;
pub mod ws;

use anyhow::{Context, Result};
use media::MediaEngine;

/// Create the shared media router on `engine` and build the HTTP application.
pub async fn create_app(
    config: state::Config,
    engine: &dyn MediaEngine,
) -> Result<(axum::Router, state::AppState)> {
    let app_state = state::AppState::new(config);
    app_state
        .sfu
        .initialize(engine, media::default_media_codecs())
        .await
        .context("failed to create media router")?;
    let router = api::create_router(app_state.clone());
    Ok((router, app_state))
}
