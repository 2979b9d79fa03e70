//! Disconnect Reaper

use super::session::SfuSessionManager;
use roomcast_protocol::{PeerId, ServerMessage};

impl SfuSessionManager {
    /// Tear down everything a departed peer owned and tell the others.
    ///
    /// Safe to call any number of times; only the first call for a live peer
    /// does anything.
    pub async fn disconnect(&self, peer_id: PeerId) {
        let Some(session) = self.registry.remove(peer_id).await else {
            tracing::debug!("Disconnect for unknown peer {}", peer_id);
            return;
        };

        let owned = session.state().await.close();

        for record in &owned.consumers {
            record.consumer.close();
        }
        for record in &owned.producers {
            record.producer.close();
        }
        for handle in &owned.transports {
            handle.transport.close();
        }

        let notified = self
            .registry
            .broadcast(peer_id, &ServerMessage::PeerLeft { peer_id })
            .await;

        tracing::info!(
            "Peer {} disconnected: closed {} consumers, {} producers, {} transports; notified {} peers ({} still connected)",
            peer_id,
            owned.consumers.len(),
            owned.producers.len(),
            owned.transports.len(),
            notified,
            self.registry.len().await
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::error::AppError;
    use crate::media::Producer;
    use crate::sfu::testing::{GatePoint, Room, client_dtls, parameters_for};
    use roomcast_protocol::{MediaKind, PeerId, ServerMessage, TransportDirection, TransportId};
    use std::time::Duration;

    #[tokio::test]
    async fn disconnect_closes_everything_and_notifies_others() {
        let room = Room::new();
        let publisher = room.publisher(MediaKind::Video).await;
        let mut other = room.join().await;

        room.manager.disconnect(publisher.peer_id).await;

        assert_eq!(
            other.next().await,
            ServerMessage::PeerLeft {
                peer_id: publisher.peer_id
            }
        );
        assert!(room.manager.registry().lookup(publisher.peer_id).await.is_none());
        assert!(room.router.producer(publisher.producer_id).is_none());
        assert_eq!(room.router.open_transport_count(), 0);
        assert!(room.manager.get_producers(other.peer_id).await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let room = Room::new();
        let leaver = room.join().await;
        let mut other = room.join().await;

        room.manager.disconnect(leaver.peer_id).await;
        room.manager.disconnect(leaver.peer_id).await;
        room.manager.disconnect(PeerId::new()).await;

        assert_eq!(
            other.drain(),
            vec![ServerMessage::PeerLeft {
                peer_id: leaver.peer_id
            }]
        );
    }

    #[tokio::test]
    async fn publisher_leaving_closes_remote_consumers_once() {
        let room = Room::new();
        let publisher = room.publisher(MediaKind::Video).await;
        let mut viewers = Vec::new();
        for _ in 0..3 {
            let mut viewer = room.join_with_transports().await;
            let info = room
                .manager
                .consume(
                    viewer.peer_id,
                    publisher.producer_id,
                    room.client_capabilities(),
                )
                .await
                .unwrap();
            viewer.drain();
            viewers.push((viewer, info.id));
        }

        room.manager.disconnect(publisher.peer_id).await;

        for (viewer, consumer_id) in &mut viewers {
            let mut messages = vec![viewer.next().await, viewer.next().await];
            tokio::time::sleep(Duration::from_millis(50)).await;
            messages.extend(viewer.drain());

            let session = room.manager.session(viewer.peer_id).await.unwrap();
            assert!(session.state().await.consumers.is_empty());
            let closed: Vec<_> = messages
                .iter()
                .filter(|m| matches!(m, ServerMessage::ConsumerClosed { .. }))
                .collect();
            assert_eq!(
                closed,
                vec![&ServerMessage::ConsumerClosed {
                    consumer_id: *consumer_id,
                    producer_id: publisher.producer_id,
                }]
            );
            assert!(messages.contains(&ServerMessage::PeerLeft {
                peer_id: publisher.peer_id
            }));
        }
    }

    #[tokio::test]
    async fn viewer_leaving_does_not_disturb_publisher() {
        let room = Room::new();
        let mut publisher = room.publisher(MediaKind::Audio).await;
        let viewer = room.join_with_transports().await;
        room.manager
            .consume(
                viewer.peer_id,
                publisher.producer_id,
                room.client_capabilities(),
            )
            .await
            .unwrap();

        room.manager.disconnect(viewer.peer_id).await;

        let left = publisher.rx.recv().await.unwrap();
        assert!(left.contains("peerLeft"));
        assert_eq!(
            room.router
                .producer(publisher.producer_id)
                .unwrap()
                .consumer_count(),
            0
        );
        assert!(publisher.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_during_create_closes_the_new_transport() {
        let (room, gate) = Room::gated(GatePoint::CreateTransport);
        let peer = room.join().await;

        let pending = {
            let manager = room.manager.clone();
            let peer_id = peer.peer_id;
            tokio::spawn(async move {
                manager
                    .create_transport(peer_id, TransportDirection::Send)
                    .await
            })
        };
        gate.entered.notified().await;

        room.manager.disconnect(peer.peer_id).await;
        gate.release.notify_one();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::PeerNotFound(_)));
        assert_eq!(room.router.open_transport_count(), 0);
    }

    #[tokio::test]
    async fn connect_during_create_is_not_found() {
        let (room, gate) = Room::gated(GatePoint::CreateTransport);
        let peer = room.join().await;

        let pending = {
            let manager = room.manager.clone();
            let peer_id = peer.peer_id;
            tokio::spawn(async move {
                manager
                    .create_transport(peer_id, TransportDirection::Recv)
                    .await
            })
        };
        gate.entered.notified().await;

        // No id has been assigned yet, so nothing this peer names can match.
        let err = room
            .manager
            .connect_transport(peer.peer_id, TransportId::new(), client_dtls())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TransportNotFound(_)));

        gate.release.notify_one();
        let info = pending.await.unwrap().unwrap();
        room.manager
            .connect_transport(peer.peer_id, info.id, client_dtls())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disconnect_during_produce_closes_the_new_producer() {
        let (room, gate) = Room::gated(GatePoint::Produce);
        let peer = room.join_with_transports().await;
        let mut other = room.join().await;

        let pending = {
            let manager = room.manager.clone();
            let peer_id = peer.peer_id;
            tokio::spawn(async move {
                manager
                    .produce(peer_id, MediaKind::Video, parameters_for(MediaKind::Video), None)
                    .await
            })
        };
        gate.entered.notified().await;

        room.manager.disconnect(peer.peer_id).await;
        gate.release.notify_one();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::PeerNotFound(_)));

        let producer = gate.producer();
        assert!(producer.is_closed());
        assert!(room.router.producer(producer.id()).is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            other.drain(),
            vec![ServerMessage::PeerLeft {
                peer_id: peer.peer_id
            }]
        );
    }

    #[tokio::test]
    async fn disconnect_during_consume_closes_the_new_consumer() {
        let (room, gate) = Room::gated(GatePoint::Consume);
        let publisher = room.publisher(MediaKind::Audio).await;
        let viewer = room.join_with_transports().await;

        let pending = {
            let manager = room.manager.clone();
            let peer_id = viewer.peer_id;
            let producer_id = publisher.producer_id;
            let caps = room.client_capabilities();
            tokio::spawn(async move { manager.consume(peer_id, producer_id, caps).await })
        };
        gate.entered.notified().await;

        room.manager.disconnect(viewer.peer_id).await;
        gate.release.notify_one();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::PeerNotFound(_)));

        assert!(gate.consumer().is_closed());
        let producer = room.router.producer(publisher.producer_id).unwrap();
        assert!(!producer.is_closed());
        assert_eq!(producer.consumer_count(), 0);

        let session = room.manager.session(publisher.peer_id).await.unwrap();
        assert_eq!(session.state().await.producers.len(), 1);
    }
}
