//! Transport Lifecycle Manager

use super::registry::{PeerSession, TransportHandle, TransportState};
use super::session::SfuSessionManager;
use crate::error::{AppError, Result};
use crate::media::{DtlsState, Transport, TransportEvent};
use roomcast_protocol::{
    DtlsParameters, IceCandidate, IceParameters, PeerId, TransportDirection, TransportId,
};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};

/// What a client needs to build its side of a transport
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl TransportInfo {
    fn from_transport(transport: &dyn Transport) -> Self {
        Self {
            id: transport.id(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        }
    }
}

impl SfuSessionManager {
    /// Create a send or recv transport for a peer.
    ///
    /// A previous transport of the same direction is replaced but left open.
    pub async fn create_transport(
        &self,
        peer_id: PeerId,
        direction: TransportDirection,
    ) -> Result<TransportInfo> {
        let session = self.session(peer_id).await?;
        let router = self.router()?;

        let transport = router
            .create_webrtc_transport(self.transport_options.clone())
            .await?;
        let events = transport.subscribe();
        let info = TransportInfo::from_transport(transport.as_ref());

        {
            let mut state = session.state().await;
            if state.is_closed() {
                drop(state);
                transport.close();
                return Err(AppError::PeerNotFound(peer_id));
            }
            if let Some(previous) =
                state.set_transport(TransportHandle::new(transport.clone(), direction))
            {
                tracing::warn!(
                    "Peer {} replaced {} transport {} without closing it",
                    peer_id,
                    direction,
                    previous.id()
                );
            }
        }

        watch_transport(&session, transport, events);

        tracing::info!("Peer {} created {} transport {}", peer_id, direction, info.id);
        Ok(info)
    }

    /// Complete the DTLS handshake of one of the peer's own transports.
    pub async fn connect_transport(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let session = self.session(peer_id).await?;

        let transport = {
            let state = session.state().await;
            let handle = state
                .find_transport(transport_id)
                .ok_or(AppError::TransportNotFound(transport_id))?;
            match handle.state() {
                TransportState::Created => {}
                TransportState::Connected => {
                    tracing::debug!(
                        "Peer {} reconnecting transport {} that is already connected",
                        peer_id,
                        transport_id
                    );
                }
                // Closed but not yet detached by its watcher.
                TransportState::Closed => {
                    tracing::debug!("Peer {} connecting closed transport {}", peer_id, transport_id);
                    return Err(AppError::TransportNotFound(transport_id));
                }
            }
            handle.transport.clone()
        };

        transport.connect(dtls_parameters).await?;

        tracing::info!("Peer {} connected transport {}", peer_id, transport_id);
        Ok(())
    }
}

/// Close and detach the transport once its DTLS association closes.
fn watch_transport(
    session: &Arc<PeerSession>,
    transport: Arc<dyn Transport>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    let session = Arc::downgrade(session);

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransportEvent::DtlsStateChange(DtlsState::Closed)) => {
                    on_dtls_closed(&session, transport.as_ref()).await;
                    break;
                }
                Ok(TransportEvent::DtlsStateChange(_)) => {}
                Ok(TransportEvent::Closed) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Transport {} watcher lagged by {} events",
                        transport.id(),
                        skipped
                    );
                    if transport.dtls_state() == DtlsState::Closed {
                        on_dtls_closed(&session, transport.as_ref()).await;
                        break;
                    }
                }
            }
        }
    });
}

async fn on_dtls_closed(session: &Weak<PeerSession>, transport: &dyn Transport) {
    tracing::info!("Transport {} DTLS closed", transport.id());
    transport.close();

    if let Some(session) = session.upgrade() {
        session.state().await.detach_transport(transport.id());
    }
}
