//! SFU Session Manager
//!
//! Entry point for every signaling operation. The per-operation logic lives in
//! the sibling modules as further `impl` blocks on [`SfuSessionManager`].

use super::registry::{PeerSession, SessionRegistry};
use crate::error::{AppError, Result};
use crate::media::{EngineError, MediaEngine, Router, WebRtcTransportOptions};
use roomcast_protocol::{PeerId, ProducerInfo, RtpCapabilities, RtpCodecCapability};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

pub struct SfuSessionManager {
    pub(super) registry: SessionRegistry,
    /// The single process-wide router, set once at start-up
    router: OnceLock<Arc<dyn Router>>,
    pub(super) transport_options: WebRtcTransportOptions,
}

impl SfuSessionManager {
    pub fn new(transport_options: WebRtcTransportOptions) -> Self {
        Self {
            registry: SessionRegistry::new(),
            router: OnceLock::new(),
            transport_options,
        }
    }

    /// Create the shared router on the given engine.
    pub async fn initialize(
        &self,
        engine: &dyn MediaEngine,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> std::result::Result<(), EngineError> {
        let router = engine.create_router(media_codecs).await?;
        if !self.install_router(router) {
            tracing::warn!("Router already initialized, keeping the existing one");
        }
        Ok(())
    }

    /// Install an already created router. Returns false if one is installed.
    pub fn install_router(&self, router: Arc<dyn Router>) -> bool {
        self.router.set(router).is_ok()
    }

    pub fn is_ready(&self) -> bool {
        self.router.get().is_some()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(super) fn router(&self) -> Result<Arc<dyn Router>> {
        self.router.get().cloned().ok_or(AppError::ServiceUnavailable)
    }

    pub(super) async fn session(&self, peer_id: PeerId) -> Result<Arc<PeerSession>> {
        self.registry
            .lookup(peer_id)
            .await
            .ok_or(AppError::PeerNotFound(peer_id))
    }

    /// Register a newly connected peer with its outbound message channel.
    pub async fn connect_peer(
        &self,
        peer_id: PeerId,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Result<Arc<PeerSession>> {
        let session = self.registry.register(peer_id, outbound).await?;
        tracing::info!("Peer {} connected", peer_id);
        Ok(session)
    }

    /// Codec capabilities clients load their device with.
    pub fn router_rtp_capabilities(&self) -> Result<RtpCapabilities> {
        Ok(self.router()?.rtp_capabilities())
    }

    /// Every live producer of every other peer.
    pub async fn get_producers(&self, peer_id: PeerId) -> Vec<ProducerInfo> {
        let mut producers = Vec::new();

        for session in self.registry.others(peer_id).await {
            let state = session.state().await;
            if state.is_closed() {
                continue;
            }
            producers.extend(state.producers.values().map(|record| ProducerInfo {
                producer_id: record.id(),
                producer_socket_id: record.owner,
                kind: record.kind,
            }));
        }

        tracing::debug!(
            "Peer {} catalog: {} remote producers",
            peer_id,
            producers.len()
        );
        producers
    }
}
