//! Production Manager

use super::registry::{PeerSession, ProducerRecord};
use super::session::SfuSessionManager;
use crate::error::{AppError, Result};
use crate::media::{Producer, ProducerEvent, ProducerOptions};
use roomcast_protocol::{MediaKind, PeerId, ProducerId, RtpParameters, ServerMessage};
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};

impl SfuSessionManager {
    /// Start a producer on the peer's send transport and announce it to everyone else.
    pub async fn produce(
        &self,
        peer_id: PeerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Option<Value>,
    ) -> Result<ProducerId> {
        let session = self.session(peer_id).await?;

        let transport = session
            .state()
            .await
            .send_transport()
            .map(|handle| handle.transport.clone())
            .ok_or(AppError::NoSendTransport)?;

        let app_data = match app_data {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(AppError::BadRequest(
                    "appData must be an object".to_string(),
                ));
            }
        };

        let producer = transport
            .produce(ProducerOptions {
                kind,
                rtp_parameters,
                app_data,
            })
            .await?;
        let events = producer.subscribe();
        let producer_id = producer.id();

        {
            let mut state = session.state().await;
            if state.is_closed() {
                drop(state);
                producer.close();
                return Err(AppError::PeerNotFound(peer_id));
            }
            state
                .producers
                .insert(producer_id, ProducerRecord::new(producer.clone(), peer_id));
        }

        let closed = producer.is_closed();
        watch_producer(&session, producer, events);

        // Closed by a disconnect or transport teardown racing this request.
        if closed {
            tracing::debug!(
                "Producer {} of peer {} closed before it was announced",
                producer_id,
                peer_id
            );
            return Ok(producer_id);
        }

        let notified = self
            .registry
            .broadcast(
                peer_id,
                &ServerMessage::NewProducer {
                    producer_id,
                    producer_socket_id: peer_id,
                    kind,
                },
            )
            .await;

        tracing::info!(
            "Peer {} produced {} {} (announced to {} peers)",
            peer_id,
            kind,
            producer_id,
            notified
        );
        Ok(producer_id)
    }
}

/// Drop the producer record once the producer closes for any reason.
fn watch_producer(
    session: &Arc<PeerSession>,
    producer: Arc<dyn Producer>,
    mut events: broadcast::Receiver<ProducerEvent>,
) {
    let session = Arc::downgrade(session);

    tokio::spawn(async move {
        while !producer.is_closed() {
            match events.recv().await {
                Ok(ProducerEvent::TransportClosed) => {
                    tracing::debug!("Producer {} transport closed", producer.id());
                    producer.close();
                    break;
                }
                Ok(ProducerEvent::Closed) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(_)) => {}
            }
        }
        forget_producer(&session, producer.id()).await;
    });
}

async fn forget_producer(session: &Weak<PeerSession>, producer_id: ProducerId) {
    let Some(session) = session.upgrade() else {
        return;
    };
    if session.state().await.producers.remove(&producer_id).is_some() {
        tracing::debug!("Peer {} lost producer {}", session.id(), producer_id);
    }
}
