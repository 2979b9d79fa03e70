//! Helpers shared by the session manager tests

use super::SfuSessionManager;
use crate::media::local::tests::{opus_parameters, transport_options, vp8_parameters};
use crate::media::{
    Consumer, ConsumerOptions, DtlsState, EngineError, LocalMediaEngine, LocalRouter, Producer,
    ProducerOptions, Router, Transport, TransportEvent, WebRtcTransportOptions, WorkerSettings,
    default_media_codecs,
};
use async_trait::async_trait;
use roomcast_protocol::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind, PeerId,
    ProducerId, RtpCapabilities, RtpParameters, ServerMessage, TransportDirection, TransportId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, broadcast, mpsc};

/// Poll an async condition until it holds, failing the test after two seconds.
macro_rules! eventually {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition never held: {}",
                stringify!($cond)
            );
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }};
}
pub(crate) use eventually;

pub(crate) struct Room {
    pub engine: LocalMediaEngine,
    pub router: Arc<LocalRouter>,
    pub manager: Arc<SfuSessionManager>,
}

pub(crate) struct TestPeer {
    pub peer_id: PeerId,
    pub rx: mpsc::UnboundedReceiver<String>,
}

impl TestPeer {
    /// Wait for the next pushed message.
    pub async fn next(&mut self) -> ServerMessage {
        let json = tokio::time::timeout(std::time::Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a push")
            .expect("push channel closed");
        serde_json::from_str(&json).unwrap()
    }

    /// Every message pushed to this peer so far.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(json) = self.rx.try_recv() {
            messages.push(serde_json::from_str(&json).unwrap());
        }
        messages
    }
}

pub(crate) struct Publisher {
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub rx: mpsc::UnboundedReceiver<String>,
}

impl Room {
    pub fn new() -> Self {
        let room = Self::without_router();
        assert!(room.manager.install_router(room.router.clone()));
        room
    }

    /// A room whose router pauses once at `point`, after the engine call finished.
    pub fn gated(point: GatePoint) -> (Self, Arc<Gate>) {
        let room = Self::without_router();
        let gate = Arc::new(Gate {
            point,
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
            producer: Mutex::new(None),
            consumer: Mutex::new(None),
        });
        let router = GatedRouter {
            inner: room.router.clone(),
            gate: gate.clone(),
        };
        assert!(room.manager.install_router(Arc::new(router)));
        (room, gate)
    }

    /// A room whose manager has not been given the router yet.
    pub fn without_router() -> Self {
        let engine = LocalMediaEngine::new(WorkerSettings::default());
        let router = engine.create_local_router(default_media_codecs()).unwrap();
        let manager = Arc::new(SfuSessionManager::new(transport_options()));
        Self {
            engine,
            router,
            manager,
        }
    }

    pub async fn join(&self) -> TestPeer {
        let peer_id = PeerId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.manager.connect_peer(peer_id, tx).await.unwrap();
        TestPeer { peer_id, rx }
    }

    /// Join and create both transports, connected.
    pub async fn join_with_transports(&self) -> TestPeer {
        let peer = self.join().await;
        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            let info = self
                .manager
                .create_transport(peer.peer_id, direction)
                .await
                .unwrap();
            self.manager
                .connect_transport(peer.peer_id, info.id, client_dtls())
                .await
                .unwrap();
        }
        peer
    }

    /// Join, create transports and produce one track of `kind`.
    pub async fn publisher(&self, kind: MediaKind) -> Publisher {
        let mut peer = self.join_with_transports().await;
        let producer_id = self
            .manager
            .produce(peer.peer_id, kind, parameters_for(kind), None)
            .await
            .unwrap();
        peer.drain();
        Publisher {
            peer_id: peer.peer_id,
            producer_id,
            rx: peer.rx,
        }
    }

    /// Capabilities of a client that decodes everything the router offers.
    pub fn client_capabilities(&self) -> roomcast_protocol::RtpCapabilities {
        self.router.rtp_capabilities()
    }
}

pub(crate) fn parameters_for(kind: MediaKind) -> RtpParameters {
    match kind {
        MediaKind::Audio => opus_parameters(),
        MediaKind::Video => vp8_parameters(),
    }
}

pub(crate) fn client_dtls() -> DtlsParameters {
    DtlsParameters {
        role: Some(DtlsRole::Client),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89".to_string(),
        }],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GatePoint {
    CreateTransport,
    Produce,
    Consume,
}

/// One-shot pause inside an engine call, used to interleave a request with a disconnect.
pub(crate) struct Gate {
    point: GatePoint,
    armed: AtomicBool,
    /// Notified once the gated call has reached the pause
    pub entered: Notify,
    pub release: Notify,
    producer: Mutex<Option<Arc<dyn Producer>>>,
    consumer: Mutex<Option<Arc<dyn Consumer>>>,
}

impl Gate {
    async fn pass(&self, point: GatePoint) {
        if point == self.point && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    /// The producer created by the gated produce call.
    pub fn producer(&self) -> Arc<dyn Producer> {
        self.producer.lock().unwrap().clone().expect("nothing produced")
    }

    /// The consumer created by the gated consume call.
    pub fn consumer(&self) -> Arc<dyn Consumer> {
        self.consumer.lock().unwrap().clone().expect("nothing consumed")
    }
}

struct GatedRouter {
    inner: Arc<LocalRouter>,
    gate: Arc<Gate>,
}

#[async_trait]
impl Router for GatedRouter {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.rtp_capabilities()
    }

    fn can_consume(&self, producer_id: ProducerId, caps: &RtpCapabilities) -> bool {
        self.inner.can_consume(producer_id, caps)
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        let inner = self.inner.create_webrtc_transport(options).await?;
        self.gate.pass(GatePoint::CreateTransport).await;
        Ok(Arc::new(GatedTransport {
            inner,
            gate: self.gate.clone(),
        }))
    }
}

struct GatedTransport {
    inner: Arc<dyn Transport>,
    gate: Arc<Gate>,
}

#[async_trait]
impl Transport for GatedTransport {
    fn id(&self) -> TransportId {
        self.inner.id()
    }

    fn ice_parameters(&self) -> IceParameters {
        self.inner.ice_parameters()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.inner.ice_candidates()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.inner.dtls_parameters()
    }

    fn dtls_state(&self) -> DtlsState {
        self.inner.dtls_state()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        self.inner.connect(dtls_parameters).await
    }

    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>, EngineError> {
        let producer = self.inner.produce(options).await?;
        *self.gate.producer.lock().unwrap() = Some(producer.clone());
        self.gate.pass(GatePoint::Produce).await;
        Ok(producer)
    }

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>, EngineError> {
        let consumer = self.inner.consume(options).await?;
        *self.gate.consumer.lock().unwrap() = Some(consumer.clone());
        self.gate.pass(GatePoint::Consume).await;
        Ok(consumer)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.subscribe()
    }

    fn close(&self) {
        self.inner.close();
    }
}
