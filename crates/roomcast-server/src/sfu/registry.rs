//! Session Registry
//!
//! The registry is the only source of truth for topology: which peers are
//! connected and which transports, producers and consumers each one owns.
//! Records reference each other by id, never by pointer.

use crate::error::{AppError, Result};
use crate::media::{Consumer, DtlsState, Producer, Transport};
use roomcast_protocol::{
    ConsumerId, MediaKind, PeerId, ProducerId, ServerMessage, TransportDirection, TransportId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock, mpsc};

/// Lifecycle of a transport as seen by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connected,
    Closed,
}

/// A transport owned by exactly one peer
#[derive(Clone)]
pub struct TransportHandle {
    pub transport: Arc<dyn Transport>,
    pub direction: TransportDirection,
}

impl TransportHandle {
    pub fn new(transport: Arc<dyn Transport>, direction: TransportDirection) -> Self {
        Self {
            transport,
            direction,
        }
    }

    pub fn id(&self) -> TransportId {
        self.transport.id()
    }

    pub fn state(&self) -> TransportState {
        if self.transport.is_closed() {
            return TransportState::Closed;
        }
        match self.transport.dtls_state() {
            DtlsState::Connected => TransportState::Connected,
            DtlsState::Closed => TransportState::Closed,
            DtlsState::New | DtlsState::Connecting | DtlsState::Failed => TransportState::Created,
        }
    }
}

#[derive(Clone)]
pub struct ProducerRecord {
    pub producer: Arc<dyn Producer>,
    pub kind: MediaKind,
    pub owner: PeerId,
}

impl ProducerRecord {
    pub fn new(producer: Arc<dyn Producer>, owner: PeerId) -> Self {
        Self {
            kind: producer.kind(),
            producer,
            owner,
        }
    }

    pub fn id(&self) -> ProducerId {
        self.producer.id()
    }
}

#[derive(Clone)]
pub struct ConsumerRecord {
    pub consumer: Arc<dyn Consumer>,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub owner: PeerId,
}

impl ConsumerRecord {
    pub fn new(consumer: Arc<dyn Consumer>, owner: PeerId) -> Self {
        Self {
            producer_id: consumer.producer_id(),
            kind: consumer.kind(),
            consumer,
            owner,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.consumer.id()
    }
}

/// Everything taken out of a session when it closes
#[derive(Default)]
pub struct OwnedResources {
    pub transports: Vec<TransportHandle>,
    pub producers: Vec<ProducerRecord>,
    pub consumers: Vec<ConsumerRecord>,
}

/// Mutable state of one peer, guarded by the session's lock
#[derive(Default)]
pub struct PeerState {
    closed: bool,
    send_transport: Option<TransportHandle>,
    recv_transport: Option<TransportHandle>,
    /// Producers this peer originates, by producer id
    pub producers: HashMap<ProducerId, ProducerRecord>,
    /// Consumers this peer holds, keyed by the remote producer id
    pub consumers: HashMap<ProducerId, ConsumerRecord>,
}

impl PeerState {
    /// Whether the owning peer has disconnected. A closed state accepts no new records.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn transport(&self, direction: TransportDirection) -> Option<&TransportHandle> {
        match direction {
            TransportDirection::Send => self.send_transport.as_ref(),
            TransportDirection::Recv => self.recv_transport.as_ref(),
        }
    }

    pub fn send_transport(&self) -> Option<&TransportHandle> {
        self.transport(TransportDirection::Send)
    }

    pub fn recv_transport(&self) -> Option<&TransportHandle> {
        self.transport(TransportDirection::Recv)
    }

    /// Store a transport in its direction slot, returning whatever was there.
    ///
    /// The previous handle is not closed.
    pub fn set_transport(&mut self, handle: TransportHandle) -> Option<TransportHandle> {
        match handle.direction {
            TransportDirection::Send => self.send_transport.replace(handle),
            TransportDirection::Recv => self.recv_transport.replace(handle),
        }
    }

    /// Find one of this peer's own transports by id.
    pub fn find_transport(&self, id: TransportId) -> Option<&TransportHandle> {
        [&self.send_transport, &self.recv_transport]
            .into_iter()
            .flatten()
            .find(|handle| handle.id() == id)
    }

    /// Remove the transport with the given id from whichever slot holds it.
    pub fn detach_transport(&mut self, id: TransportId) -> Option<TransportHandle> {
        for slot in [&mut self.send_transport, &mut self.recv_transport] {
            if slot.as_ref().is_some_and(|handle| handle.id() == id) {
                return slot.take();
            }
        }
        None
    }

    /// Remove a consumer record only if it still refers to the given consumer.
    pub fn remove_consumer(&mut self, producer_id: ProducerId, consumer_id: ConsumerId) -> bool {
        if self
            .consumers
            .get(&producer_id)
            .is_some_and(|record| record.id() == consumer_id)
        {
            self.consumers.remove(&producer_id);
            return true;
        }
        false
    }

    /// Mark the state closed and hand back every owned resource.
    pub fn close(&mut self) -> OwnedResources {
        self.closed = true;
        OwnedResources {
            transports: self
                .send_transport
                .take()
                .into_iter()
                .chain(self.recv_transport.take())
                .collect(),
            producers: self.producers.drain().map(|(_, record)| record).collect(),
            consumers: self.consumers.drain().map(|(_, record)| record).collect(),
        }
    }
}

/// A connected peer: its push channel and its guarded state
pub struct PeerSession {
    id: PeerId,
    outbound: mpsc::UnboundedSender<String>,
    state: Mutex<PeerState>,
}

impl PeerSession {
    pub fn new(id: PeerId, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id,
            outbound,
            state: Mutex::new(PeerState::default()),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Lock this peer's state. Never hold the guard across a media engine call.
    pub async fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().await
    }

    /// Push a message to this peer's channel. Returns false if it could not be delivered.
    pub fn push(&self, message: &ServerMessage) -> bool {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return false;
            }
        };
        self.push_raw(json)
    }

    fn push_raw(&self, json: String) -> bool {
        if let Err(e) = self.outbound.send(json) {
            tracing::debug!("Failed to send message to peer {}: {}", self.id, e);
            return false;
        }
        true
    }
}

pub struct SessionRegistry {
    /// Map from peer ID to its session
    peers: RwLock<HashMap<PeerId, Arc<PeerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session for a newly connected peer.
    pub async fn register(
        &self,
        peer_id: PeerId,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Result<Arc<PeerSession>> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&peer_id) {
            return Err(AppError::DuplicatePeer(peer_id));
        }

        let session = Arc::new(PeerSession::new(peer_id, outbound));
        peers.insert(peer_id, session.clone());

        tracing::debug!("Registered peer {} ({} connected)", peer_id, peers.len());
        Ok(session)
    }

    pub async fn lookup(&self, peer_id: PeerId) -> Option<Arc<PeerSession>> {
        self.peers.read().await.get(&peer_id).cloned()
    }

    /// Remove a peer's session. Removing an absent peer is a no-op.
    pub async fn remove(&self, peer_id: PeerId) -> Option<Arc<PeerSession>> {
        let removed = self.peers.write().await.remove(&peer_id);
        if removed.is_some() {
            tracing::debug!("Removed peer {}", peer_id);
        }
        removed
    }

    /// Snapshot of every session except `excluding`.
    ///
    /// The snapshot is taken under the read lock and iterated after it is
    /// released, so concurrent joins and leaves never block on or corrupt it.
    pub async fn others(&self, excluding: PeerId) -> Vec<Arc<PeerSession>> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != excluding)
            .map(|(_, session)| session.clone())
            .collect()
    }

    /// Push a message to every peer except `excluding`. Returns how many received it.
    pub async fn broadcast(&self, excluding: PeerId, message: &ServerMessage) -> usize {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return 0;
            }
        };

        let recipients = self.others(excluding).await;
        let delivered = recipients
            .iter()
            .filter(|session| session.push_raw(json.clone()))
            .count();

        tracing::debug!(
            "Broadcast from {} delivered to {}/{} peers",
            excluding,
            delivered,
            recipients.len()
        );
        delivered
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
