//! Consumption Manager

use super::registry::{ConsumerRecord, PeerSession};
use super::session::SfuSessionManager;
use crate::error::{AppError, Result};
use crate::media::{Consumer, ConsumerEvent, ConsumerOptions};
use roomcast_protocol::{
    ConsumerId, MediaKind, PeerId, ProducerId, RtpCapabilities, RtpParameters, ServerMessage,
};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};

/// What a client needs to start receiving a remote track
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

impl SfuSessionManager {
    /// Subscribe a peer to a remote producer over its recv transport.
    ///
    /// Capabilities are checked before anything else, so an incompatible
    /// request changes nothing.
    pub async fn consume(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo> {
        let session = self.session(peer_id).await?;
        let router = self.router()?;

        if !router.can_consume(producer_id, &rtp_capabilities) {
            tracing::warn!("Peer {} cannot consume producer {}", peer_id, producer_id);
            return Err(AppError::CannotConsume);
        }

        let transport = session
            .state()
            .await
            .recv_transport()
            .map(|handle| handle.transport.clone())
            .ok_or(AppError::NoRecvTransport)?;

        let consumer = transport
            .consume(ConsumerOptions {
                producer_id,
                rtp_capabilities,
                paused: false,
            })
            .await?;
        let events = consumer.subscribe();

        {
            let mut state = session.state().await;
            if state.is_closed() {
                drop(state);
                consumer.close();
                return Err(AppError::PeerNotFound(peer_id));
            }
            if let Some(previous) = state
                .consumers
                .insert(producer_id, ConsumerRecord::new(consumer.clone(), peer_id))
            {
                tracing::warn!(
                    "Peer {} replaced consumer {} of producer {}",
                    peer_id,
                    previous.id(),
                    producer_id
                );
            }
        }

        let info = ConsumerInfo {
            id: consumer.id(),
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        };

        watch_consumer(&session, consumer, events);

        tracing::info!(
            "Peer {} consuming producer {} with {}",
            peer_id,
            producer_id,
            info.id
        );
        Ok(info)
    }
}

/// Tell the owner when the consumed producer goes away, and drop the record.
fn watch_consumer(
    session: &Arc<PeerSession>,
    consumer: Arc<dyn Consumer>,
    mut events: broadcast::Receiver<ConsumerEvent>,
) {
    let session = Arc::downgrade(session);

    tokio::spawn(async move {
        // A consumer closed before the watcher ran with nothing queued lost its producer.
        let reason = if consumer.is_closed() {
            events.try_recv().unwrap_or(ConsumerEvent::ProducerClosed)
        } else {
            loop {
                match events.recv().await {
                    Ok(event) => break event,
                    Err(RecvError::Closed) => break ConsumerEvent::Closed,
                    Err(RecvError::Lagged(_)) => {}
                }
            }
        };

        on_consumer_closed(&session, consumer.as_ref(), reason).await;
    });
}

async fn on_consumer_closed(
    session: &Weak<PeerSession>,
    consumer: &dyn Consumer,
    reason: ConsumerEvent,
) {
    let Some(session) = session.upgrade() else {
        return;
    };

    let current = {
        let mut state = session.state().await;
        if state.is_closed() {
            return;
        }
        state.remove_consumer(consumer.producer_id(), consumer.id())
    };

    match reason {
        // A consumer replaced by a later consume of the same producer is not announced.
        ConsumerEvent::ProducerClosed if !current => {
            consumer.close();
            tracing::debug!(
                "Replaced consumer {} of peer {} closed with its producer {}",
                consumer.id(),
                session.id(),
                consumer.producer_id()
            );
        }
        ConsumerEvent::ProducerClosed => {
            consumer.close();
            session.push(&ServerMessage::ConsumerClosed {
                consumer_id: consumer.id(),
                producer_id: consumer.producer_id(),
            });
            tracing::info!(
                "Consumer {} of peer {} closed with its producer {}",
                consumer.id(),
                session.id(),
                consumer.producer_id()
            );
        }
        ConsumerEvent::TransportClosed | ConsumerEvent::Closed => {
            tracing::debug!("Consumer {} of peer {} closed", consumer.id(), session.id());
        }
    }
}
