//! mediasoup engine
//!
//! Runs one mediasoup worker and adapts its router, transports, producers and
//! consumers to the engine traits. Negotiation types cross the boundary through
//! their JSON form, which both sides share with mediasoup-client.
//!
//! mediasoup closes a resource once its last handle is dropped, and producers
//! and consumers keep their transport alive. Closing a transport therefore
//! closes everything created on it first.

use super::{
    Consumer, ConsumerEvent, ConsumerOptions, DtlsState, EVENT_CHANNEL_CAPACITY, EngineError,
    MediaEngine, Producer, ProducerEvent, ProducerOptions, Router, Transport, TransportEvent,
    WebRtcTransportOptions, WorkerSettings, lock,
};
use ::mediasoup::transport::Transport as _;
use ::mediasoup::{
    consumer, data_structures, producer, router, rtp_parameters, webrtc_transport, worker,
    worker_manager,
};
use async_trait::async_trait;
use roomcast_protocol::{
    ConsumerId, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpCodecCapability, RtpParameters, TransportId,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, watch};

fn translate<T: Serialize + ?Sized, U: DeserializeOwned>(value: &T) -> serde_json::Result<U> {
    serde_json::to_value(value).and_then(serde_json::from_value)
}

fn unexpected(error: serde_json::Error) -> EngineError {
    EngineError::Request(format!("unexpected engine payload: {error}"))
}

fn request_failed(error: impl std::fmt::Display) -> EngineError {
    EngineError::Request(error.to_string())
}

fn engine_kind(kind: MediaKind) -> rtp_parameters::MediaKind {
    match kind {
        MediaKind::Audio => rtp_parameters::MediaKind::Audio,
        MediaKind::Video => rtp_parameters::MediaKind::Video,
    }
}

fn wire_kind(kind: rtp_parameters::MediaKind) -> MediaKind {
    match kind {
        rtp_parameters::MediaKind::Audio => MediaKind::Audio,
        rtp_parameters::MediaKind::Video => MediaKind::Video,
    }
}

fn wire_dtls_state(state: data_structures::DtlsState) -> DtlsState {
    match state {
        data_structures::DtlsState::New => DtlsState::New,
        data_structures::DtlsState::Connecting => DtlsState::Connecting,
        data_structures::DtlsState::Connected => DtlsState::Connected,
        data_structures::DtlsState::Failed => DtlsState::Failed,
        data_structures::DtlsState::Closed => DtlsState::Closed,
    }
}

fn listen_info(
    protocol: &str,
    options: &WebRtcTransportOptions,
) -> Result<data_structures::ListenInfo, EngineError> {
    let mut info = json!({
        "protocol": protocol,
        "ip": options.listen_ip,
    });
    if let Some(announced) = &options.announced_ip {
        info["announcedAddress"] = json!(announced);
    }
    serde_json::from_value(info).map_err(|e| EngineError::InvalidTransportOptions(e.to_string()))
}

/// One listen info per enabled protocol, UDP first.
fn transport_options(
    options: &WebRtcTransportOptions,
) -> Result<webrtc_transport::WebRtcTransportOptions, EngineError> {
    let mut infos = Vec::new();
    if options.enable_udp {
        infos.push(listen_info("udp", options)?);
    }
    if options.enable_tcp {
        infos.push(listen_info("tcp", options)?);
    }

    let mut infos = infos.into_iter();
    let first = infos.next().ok_or_else(|| {
        EngineError::InvalidTransportOptions(
            "at least one of UDP and TCP must be enabled".to_string(),
        )
    })?;
    let listen_infos = infos.fold(
        webrtc_transport::WebRtcTransportListenInfos::new(first),
        |listen_infos, info| listen_infos.insert(info),
    );

    let mut transport_options = webrtc_transport::WebRtcTransportOptions::new(listen_infos);
    transport_options.enable_udp = options.enable_udp;
    transport_options.enable_tcp = options.enable_tcp;
    transport_options.prefer_udp = options.prefer_udp;
    Ok(transport_options)
}

/// Engine backed by a single mediasoup worker process
pub struct MediasoupEngine {
    worker: worker::Worker,
    death: watch::Receiver<Option<String>>,
    _manager: worker_manager::WorkerManager,
}

impl MediasoupEngine {
    /// Spawn the worker with RTC ports drawn from the configured range.
    pub async fn new(settings: &WorkerSettings) -> Result<Self, EngineError> {
        let manager = worker_manager::WorkerManager::new();

        let mut worker_settings = worker::WorkerSettings::default();
        worker_settings.rtc_port_range = settings.rtc_min_port..=settings.rtc_max_port;

        let worker = manager
            .create_worker(worker_settings)
            .await
            .map_err(|e| EngineError::WorkerSpawn(e.to_string()))?;

        let (death_tx, death) = watch::channel(None);
        worker
            .on_dead(move |result| {
                let reason = match result {
                    Ok(()) => "worker exited".to_string(),
                    Err(error) => error.to_string(),
                };
                death_tx.send_replace(Some(reason));
            })
            .detach();

        tracing::info!(
            "Started mediasoup worker (RTC ports {}-{})",
            settings.rtc_min_port,
            settings.rtc_max_port
        );

        Ok(Self {
            worker,
            death,
            _manager: manager,
        })
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn Router>, EngineError> {
        let media_codecs = media_codecs
            .iter()
            .map(|codec| {
                translate(codec).map_err(|e| {
                    EngineError::UnsupportedCodec(format!("{}: {}", codec.mime_type, e))
                })
            })
            .collect::<Result<Vec<rtp_parameters::RtpCodecCapability>, _>>()?;

        let router = self
            .worker
            .create_router(router::RouterOptions::new(media_codecs))
            .await
            .map_err(request_failed)?;
        let capabilities = translate(router.rtp_capabilities()).map_err(unexpected)?;

        tracing::debug!("Created mediasoup router");
        Ok(Arc::new(MediasoupRouter {
            router,
            capabilities,
        }))
    }

    async fn died(&self) -> String {
        let mut death = self.death.clone();
        match death.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "worker channel closed".to_string(),
        }
    }
}

pub struct MediasoupRouter {
    router: router::Router,
    capabilities: RtpCapabilities,
}

#[async_trait]
impl Router for MediasoupRouter {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let engine_id: producer::ProducerId = match translate(&producer_id) {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!("can_consume: bad producer id {}: {}", producer_id, e);
                return false;
            }
        };
        let capabilities: rtp_parameters::RtpCapabilities = match translate(rtp_capabilities) {
            Ok(capabilities) => capabilities,
            Err(e) => {
                tracing::debug!("can_consume: unreadable rtpCapabilities: {}", e);
                return false;
            }
        };

        self.router.can_consume(&engine_id, &capabilities)
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        let transport = self
            .router
            .create_webrtc_transport(transport_options(&options)?)
            .await
            .map_err(request_failed)?;

        let transport = MediasoupTransport::new(transport)?;
        tracing::debug!(
            "Created mediasoup transport {} ({} candidates)",
            transport.id,
            transport.ice_candidates.len()
        );
        Ok(transport)
    }
}

struct TransportState {
    /// `None` once closed
    inner: Option<webrtc_transport::WebRtcTransport>,
    producers: Vec<Weak<MediasoupProducer>>,
    consumers: Vec<Weak<MediasoupConsumer>>,
}

pub struct MediasoupTransport {
    id: TransportId,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    dtls_state: Mutex<DtlsState>,
    state: Mutex<TransportState>,
    events: broadcast::Sender<TransportEvent>,
}

impl MediasoupTransport {
    fn new(transport: webrtc_transport::WebRtcTransport) -> Result<Arc<Self>, EngineError> {
        let wrapper = Arc::new(Self {
            id: translate(&transport.id()).map_err(unexpected)?,
            ice_parameters: translate(transport.ice_parameters()).map_err(unexpected)?,
            ice_candidates: translate(transport.ice_candidates()).map_err(unexpected)?,
            dtls_parameters: translate(&transport.dtls_parameters()).map_err(unexpected)?,
            dtls_state: Mutex::new(wire_dtls_state(transport.dtls_state())),
            state: Mutex::new(TransportState {
                inner: Some(transport.clone()),
                producers: Vec::new(),
                consumers: Vec::new(),
            }),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        });

        let weak = Arc::downgrade(&wrapper);
        transport
            .on_dtls_state_change(move |state| {
                if let Some(transport) = weak.upgrade() {
                    transport.set_dtls_state(wire_dtls_state(state));
                }
            })
            .detach();

        let weak = Arc::downgrade(&wrapper);
        transport
            .on_close(Box::new(move || {
                if let Some(transport) = weak.upgrade() {
                    transport.close();
                }
            }))
            .detach();

        Ok(wrapper)
    }

    fn set_dtls_state(&self, state: DtlsState) {
        *lock(&self.dtls_state) = state;
        let _ = self.events.send(TransportEvent::DtlsStateChange(state));
    }

    fn inner(&self) -> Result<webrtc_transport::WebRtcTransport, EngineError> {
        lock(&self.state)
            .inner
            .clone()
            .ok_or(EngineError::TransportClosed)
    }
}

#[async_trait]
impl Transport for MediasoupTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn dtls_state(&self) -> DtlsState {
        *lock(&self.dtls_state)
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).inner.is_none()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        let transport = self.inner()?;
        let dtls_parameters = DtlsParameters {
            role: dtls_parameters.role.or(Some(DtlsRole::Auto)),
            ..dtls_parameters
        };
        let dtls_parameters = translate(&dtls_parameters)
            .map_err(|e| EngineError::InvalidDtlsParameters(e.to_string()))?;

        transport
            .connect(webrtc_transport::WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(request_failed)
    }

    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>, EngineError> {
        let transport = self.inner()?;
        let rtp_parameters = translate(&options.rtp_parameters)
            .map_err(|e| EngineError::InvalidRtpParameters(e.to_string()))?;

        let mut producer_options =
            producer::ProducerOptions::new(engine_kind(options.kind), rtp_parameters);
        producer_options.app_data = data_structures::AppData::new(options.app_data);

        let producer = transport
            .produce(producer_options)
            .await
            .map_err(request_failed)?;
        let producer = MediasoupProducer::new(producer)?;

        {
            let mut state = lock(&self.state);
            if state.inner.is_some() {
                state.producers.push(Arc::downgrade(&producer));
                return Ok(producer);
            }
        }
        producer.close_with(ProducerEvent::TransportClosed);
        Err(EngineError::TransportClosed)
    }

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>, EngineError> {
        let transport = self.inner()?;
        let producer_id = translate(&options.producer_id).map_err(unexpected)?;
        let rtp_capabilities = translate(&options.rtp_capabilities)
            .map_err(|e| EngineError::Request(format!("invalid rtpCapabilities: {e}")))?;

        let mut consumer_options = consumer::ConsumerOptions::new(producer_id, rtp_capabilities);
        consumer_options.paused = options.paused;

        let consumer = transport
            .consume(consumer_options)
            .await
            .map_err(request_failed)?;
        let consumer = MediasoupConsumer::new(consumer)?;

        {
            let mut state = lock(&self.state);
            if state.inner.is_some() {
                state.consumers.push(Arc::downgrade(&consumer));
                return Ok(consumer);
            }
        }
        consumer.close_with(ConsumerEvent::TransportClosed);
        Err(EngineError::TransportClosed)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        let (inner, producers, consumers) = {
            let mut state = lock(&self.state);
            let Some(inner) = state.inner.take() else {
                return;
            };
            (
                inner,
                std::mem::take(&mut state.producers),
                std::mem::take(&mut state.consumers),
            )
        };

        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.close_with(ConsumerEvent::TransportClosed);
        }
        for producer in producers.iter().filter_map(Weak::upgrade) {
            producer.close_with(ProducerEvent::TransportClosed);
        }
        *lock(&self.dtls_state) = DtlsState::Closed;
        drop(inner);

        let _ = self.events.send(TransportEvent::Closed);
        tracing::debug!("Transport {} closed", self.id);
    }
}

pub struct MediasoupProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    inner: Mutex<Option<producer::Producer>>,
    events: broadcast::Sender<ProducerEvent>,
}

impl MediasoupProducer {
    fn new(producer: producer::Producer) -> Result<Arc<Self>, EngineError> {
        let wrapper = Arc::new(Self {
            id: translate(&producer.id()).map_err(unexpected)?,
            kind: wire_kind(producer.kind()),
            rtp_parameters: translate(producer.rtp_parameters()).map_err(unexpected)?,
            inner: Mutex::new(Some(producer.clone())),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        });

        let weak = Arc::downgrade(&wrapper);
        producer
            .on_transport_close(move || {
                if let Some(producer) = weak.upgrade() {
                    producer.close_with(ProducerEvent::TransportClosed);
                }
            })
            .detach();

        Ok(wrapper)
    }

    /// Drop the last handle, which closes the producer and every consumer of it.
    fn close_with(&self, event: ProducerEvent) {
        let Some(producer) = lock(&self.inner).take() else {
            return;
        };
        drop(producer);

        let _ = self.events.send(event);
        tracing::debug!("Producer {} closed", self.id);
    }
}

impl Producer for MediasoupProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_closed(&self) -> bool {
        lock(&self.inner).is_none()
    }

    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.close_with(ProducerEvent::Closed);
    }
}

pub struct MediasoupConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: bool,
    inner: Mutex<Option<consumer::Consumer>>,
    events: broadcast::Sender<ConsumerEvent>,
}

impl MediasoupConsumer {
    fn new(consumer: consumer::Consumer) -> Result<Arc<Self>, EngineError> {
        let wrapper = Arc::new(Self {
            id: translate(&consumer.id()).map_err(unexpected)?,
            producer_id: translate(&consumer.producer_id()).map_err(unexpected)?,
            kind: wire_kind(consumer.kind()),
            rtp_parameters: translate(consumer.rtp_parameters()).map_err(unexpected)?,
            paused: consumer.paused(),
            inner: Mutex::new(Some(consumer.clone())),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        });

        let weak = Arc::downgrade(&wrapper);
        consumer
            .on_producer_close(move || {
                if let Some(consumer) = weak.upgrade() {
                    consumer.close_with(ConsumerEvent::ProducerClosed);
                }
            })
            .detach();

        let weak = Arc::downgrade(&wrapper);
        consumer
            .on_transport_close(move || {
                if let Some(consumer) = weak.upgrade() {
                    consumer.close_with(ConsumerEvent::TransportClosed);
                }
            })
            .detach();

        Ok(wrapper)
    }

    fn close_with(&self, event: ConsumerEvent) {
        let Some(consumer) = lock(&self.inner).take() else {
            return;
        };
        drop(consumer);

        let _ = self.events.send(event);
    }
}

impl Consumer for MediasoupConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused
    }

    fn is_closed(&self) -> bool {
        lock(&self.inner).is_none()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.close_with(ConsumerEvent::Closed);
    }
}
