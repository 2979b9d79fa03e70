//! In-process media engine
//!
//! Keeps the negotiation state of routers, transports, producers and consumers
//! the way a real SFU worker would, but binds no sockets and forwards no media.
//! Backs the tests, and the binary when built without the `mediasoup` feature.

use super::{
    Consumer, ConsumerEvent, ConsumerOptions, DtlsState, EVENT_CHANNEL_CAPACITY, EngineError,
    MediaEngine, Producer, ProducerEvent, ProducerOptions, Router, Transport, TransportEvent,
    WebRtcTransportOptions, WorkerSettings, lock,
};
use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use roomcast_protocol::{
    ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters,
    MediaKind, ProducerId, Protocol, RtcpFeedback, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters, TransportId,
};
use serde_json::{Map, Value, json};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, watch};

/// First payload type handed out to router codecs without a preferred one.
const DYNAMIC_PAYLOAD_TYPE_START: u8 = 100;

/// Candidate priority of the preferred protocol; the other one gets less.
const PREFERRED_CANDIDATE_PRIORITY: u32 = 1_076_302_079;
const FALLBACK_CANDIDATE_PRIORITY: u32 = 1_076_276_479;

/// Pool of RTC ports shared by every transport of a worker
#[derive(Debug)]
struct PortPool {
    min: u16,
    max: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    fn acquire(&self) -> Option<u16> {
        let mut in_use = lock(&self.in_use);
        let port = (self.min..=self.max).find(|port| !in_use.contains(port))?;
        in_use.insert(port);
        Some(port)
    }

    fn release(&self, port: u16) {
        lock(&self.in_use).remove(&port);
    }
}

/// Whether a negotiated codec can be received by a capability codec
fn codec_matches(codec: &RtpCodecParameters, capability: &RtpCodecCapability) -> bool {
    if !codec.mime_type.eq_ignore_ascii_case(&capability.mime_type)
        || codec.clock_rate != capability.clock_rate
    {
        return false;
    }

    match capability.kind {
        MediaKind::Audio => codec.channels.unwrap_or(1) == capability.channels.unwrap_or(1),
        MediaKind::Video => true,
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> DtlsFingerprint {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes[..]);
    let value = bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");

    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

/// The in-process engine: a single simulated worker
pub struct LocalMediaEngine {
    ports: Arc<PortPool>,
    death: watch::Sender<Option<String>>,
}

impl LocalMediaEngine {
    pub fn new(settings: WorkerSettings) -> Self {
        let (death, _) = watch::channel(None);
        Self {
            ports: Arc::new(PortPool::new(settings.rtc_min_port, settings.rtc_max_port)),
            death,
        }
    }

    /// Create a router and keep its concrete type.
    pub fn create_local_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<LocalRouter>, EngineError> {
        if self.death.borrow().is_some() {
            return Err(EngineError::WorkerClosed);
        }

        let mut next_payload_type = DYNAMIC_PAYLOAD_TYPE_START;
        let mut codecs = Vec::with_capacity(media_codecs.len());

        for mut codec in media_codecs {
            let (prefix, _) = codec.mime_type.split_once('/').ok_or_else(|| {
                EngineError::UnsupportedCodec(codec.mime_type.clone())
            })?;
            if !prefix.eq_ignore_ascii_case(codec.kind.mime_prefix()) {
                return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
            }

            if codec.preferred_payload_type.is_none() {
                codec.preferred_payload_type = Some(next_payload_type);
                next_payload_type += 1;
            }

            if codec.kind == MediaKind::Video && codec.rtcp_feedback.is_empty() {
                codec.rtcp_feedback = [("nack", ""), ("nack", "pli"), ("ccm", "fir")]
                    .into_iter()
                    .map(|(feedback_type, parameter)| RtcpFeedback {
                        feedback_type: feedback_type.to_string(),
                        parameter: parameter.to_string(),
                    })
                    .collect();
            }

            codecs.push(codec);
        }

        let capabilities = RtpCapabilities {
            codecs,
            header_extensions: vec![],
        };

        tracing::debug!(
            "Created router with {} codecs",
            capabilities.codecs.len()
        );

        Ok(Arc::new_cyclic(|me| LocalRouter {
            me: me.clone(),
            capabilities,
            ports: self.ports.clone(),
            transports: Mutex::new(HashMap::new()),
            producers: Mutex::new(HashMap::new()),
        }))
    }

    /// Kill the worker. Everyone waiting on [`MediaEngine::died`] is woken.
    pub fn terminate(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!("Media worker terminated: {}", reason);
        self.death.send_replace(Some(reason));
    }
}

#[async_trait]
impl MediaEngine for LocalMediaEngine {
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn Router>, EngineError> {
        let router: Arc<dyn Router> = self.create_local_router(media_codecs)?;
        Ok(router)
    }

    async fn died(&self) -> String {
        let mut rx = self.death.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "worker channel closed".to_string(),
        }
    }
}

pub struct LocalRouter {
    me: Weak<LocalRouter>,
    capabilities: RtpCapabilities,
    ports: Arc<PortPool>,
    transports: Mutex<HashMap<TransportId, Weak<LocalTransport>>>,
    producers: Mutex<HashMap<ProducerId, Arc<LocalProducer>>>,
}

impl LocalRouter {
    /// Look up a live transport created by this router.
    pub fn transport(&self, id: TransportId) -> Option<Arc<LocalTransport>> {
        lock(&self.transports).get(&id).and_then(Weak::upgrade)
    }

    /// Look up a live producer.
    pub fn producer(&self, id: ProducerId) -> Option<Arc<LocalProducer>> {
        lock(&self.producers).get(&id).cloned()
    }

    /// Number of transports that have not been closed yet.
    pub fn open_transport_count(&self) -> usize {
        lock(&self.transports)
            .values()
            .filter(|t| t.strong_count() > 0)
            .count()
    }

    fn forget_transport(&self, id: TransportId) {
        lock(&self.transports).remove(&id);
    }

    fn forget_producer(&self, id: ProducerId) {
        lock(&self.producers).remove(&id);
    }

    fn supports(&self, codec: &RtpCodecParameters) -> bool {
        self.capabilities
            .codecs
            .iter()
            .any(|capability| codec_matches(codec, capability))
    }

    fn build_candidates(
        &self,
        options: &WebRtcTransportOptions,
        udp_port: Option<u16>,
        tcp_port: Option<u16>,
    ) -> Vec<IceCandidate> {
        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());

        let (udp_priority, tcp_priority) = if options.prefer_udp || !options.enable_tcp {
            (PREFERRED_CANDIDATE_PRIORITY, FALLBACK_CANDIDATE_PRIORITY)
        } else {
            (FALLBACK_CANDIDATE_PRIORITY, PREFERRED_CANDIDATE_PRIORITY)
        };

        let mut candidates = Vec::new();
        if let Some(port) = udp_port {
            candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: udp_priority,
                ip: ip.clone(),
                protocol: Protocol::Udp,
                port,
                candidate_type: "host".to_string(),
                tcp_type: None,
            });
        }
        if let Some(port) = tcp_port {
            candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: tcp_priority,
                ip,
                protocol: Protocol::Tcp,
                port,
                candidate_type: "host".to_string(),
                tcp_type: Some("passive".to_string()),
            });
        }

        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        candidates
    }
}

#[async_trait]
impl Router for LocalRouter {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.producer(producer_id) else {
            tracing::debug!("can_consume: producer {} not found", producer_id);
            return false;
        };

        producer
            .rtp_parameters
            .codecs
            .iter()
            .filter(|codec| !codec.is_rtx())
            .any(|codec| {
                rtp_capabilities
                    .codecs
                    .iter()
                    .any(|capability| codec_matches(codec, capability))
            })
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::InvalidTransportOptions(
                "at least one of UDP and TCP must be enabled".to_string(),
            ));
        }

        let udp_port = if options.enable_udp {
            Some(self.ports.acquire().ok_or(EngineError::PortsExhausted)?)
        } else {
            None
        };
        let tcp_port = if options.enable_tcp {
            match self.ports.acquire() {
                Some(port) => Some(port),
                None => {
                    if let Some(port) = udp_port {
                        self.ports.release(port);
                    }
                    return Err(EngineError::PortsExhausted);
                }
            }
        } else {
            None
        };
        let ports: Vec<u16> = udp_port.into_iter().chain(tcp_port).collect();

        let transport = Arc::new(LocalTransport {
            id: TransportId::new(),
            router: self.me.clone(),
            ice_parameters: IceParameters {
                username_fragment: random_string(16),
                password: random_string(32),
                ice_lite: true,
            },
            ice_candidates: self.build_candidates(&options, udp_port, tcp_port),
            local_fingerprint: random_fingerprint(),
            ports,
            state: Mutex::new(TransportState {
                dtls_state: DtlsState::New,
                dtls_role: DtlsRole::Auto,
                closed: false,
                next_mid: 0,
                producers: Vec::new(),
                consumers: Vec::new(),
            }),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        });

        lock(&self.transports).insert(transport.id, Arc::downgrade(&transport));

        tracing::debug!(
            "Created transport {} ({} candidates)",
            transport.id,
            transport.ice_candidates.len()
        );

        Ok(transport)
    }
}

struct TransportState {
    dtls_state: DtlsState,
    dtls_role: DtlsRole,
    closed: bool,
    next_mid: u32,
    producers: Vec<Arc<LocalProducer>>,
    consumers: Vec<Arc<LocalConsumer>>,
}

pub struct LocalTransport {
    id: TransportId,
    router: Weak<LocalRouter>,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    local_fingerprint: DtlsFingerprint,
    ports: Vec<u16>,
    state: Mutex<TransportState>,
    events: broadcast::Sender<TransportEvent>,
}

impl LocalTransport {
    /// Report that the remote side tore the DTLS association down.
    ///
    /// The transport itself stays open; subscribers decide what to do.
    pub fn close_dtls(&self) {
        {
            let mut state = lock(&self.state);
            if state.closed || state.dtls_state == DtlsState::Closed {
                return;
            }
            state.dtls_state = DtlsState::Closed;
        }
        let _ = self
            .events
            .send(TransportEvent::DtlsStateChange(DtlsState::Closed));
    }

    fn router(&self) -> Result<Arc<LocalRouter>, EngineError> {
        self.router.upgrade().ok_or(EngineError::WorkerClosed)
    }
}

#[async_trait]
impl Transport for LocalTransport {
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
        DtlsParameters {
            role: Some(lock(&self.state).dtls_role),
            fingerprints: vec![self.local_fingerprint.clone()],
        }
    }

    fn dtls_state(&self) -> DtlsState {
        lock(&self.state).dtls_state
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(EngineError::TransportClosed);
            }
            if state.dtls_state != DtlsState::New {
                return Err(EngineError::AlreadyConnected);
            }
            if dtls_parameters.fingerprints.is_empty() {
                return Err(EngineError::InvalidDtlsParameters(
                    "missing fingerprints".to_string(),
                ));
            }

            state.dtls_role = match dtls_parameters.role {
                Some(DtlsRole::Client) | Some(DtlsRole::Auto) | None => DtlsRole::Server,
                Some(DtlsRole::Server) => DtlsRole::Client,
            };
            state.dtls_state = DtlsState::Connected;
        }

        let _ = self
            .events
            .send(TransportEvent::DtlsStateChange(DtlsState::Connecting));
        let _ = self
            .events
            .send(TransportEvent::DtlsStateChange(DtlsState::Connected));

        Ok(())
    }

    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>, EngineError> {
        let router = self.router()?;
        let mut state = lock(&self.state);
        if state.closed {
            return Err(EngineError::TransportClosed);
        }

        let mut media_codecs = options
            .rtp_parameters
            .codecs
            .iter()
            .filter(|codec| !codec.is_rtx())
            .peekable();
        if media_codecs.peek().is_none() {
            return Err(EngineError::InvalidRtpParameters(
                "no media codecs".to_string(),
            ));
        }

        for codec in media_codecs {
            let prefix = codec.mime_type.split('/').next().unwrap_or_default();
            if !prefix.eq_ignore_ascii_case(options.kind.mime_prefix()) {
                return Err(EngineError::InvalidRtpParameters(format!(
                    "codec {} does not match kind {}",
                    codec.mime_type, options.kind
                )));
            }
            if !router.supports(codec) {
                return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
            }
        }

        let producer = Arc::new(LocalProducer {
            id: ProducerId::new(),
            kind: options.kind,
            rtp_parameters: options.rtp_parameters,
            app_data: options.app_data,
            router: self.router.clone(),
            state: Mutex::new(ProducerState {
                closed: false,
                consumers: Vec::new(),
            }),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        });

        lock(&router.producers).insert(producer.id, producer.clone());
        state.producers.push(producer.clone());

        Ok(producer)
    }

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>, EngineError> {
        let router = self.router()?;
        let mut state = lock(&self.state);
        if state.closed {
            return Err(EngineError::TransportClosed);
        }

        let producer = router
            .producer(options.producer_id)
            .ok_or(EngineError::ProducerNotFound(options.producer_id))?;

        let codecs: Vec<RtpCodecParameters> = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter(|codec| !codec.is_rtx())
            .filter_map(|codec| {
                options
                    .rtp_capabilities
                    .codecs
                    .iter()
                    .find(|capability| codec_matches(codec, capability))
                    .map(|capability| RtpCodecParameters {
                        payload_type: capability
                            .preferred_payload_type
                            .unwrap_or(codec.payload_type),
                        rtcp_feedback: capability.rtcp_feedback.clone(),
                        ..codec.clone()
                    })
            })
            .collect();

        if codecs.is_empty() {
            return Err(EngineError::IncompatibleCapabilities(options.producer_id));
        }

        let mid = state.next_mid.to_string();
        state.next_mid += 1;

        let ssrc: u32 = rand::thread_rng().gen_range(1..u32::MAX);
        let mut rtcp = Map::new();
        rtcp.insert("cname".to_string(), Value::String(random_string(16)));
        rtcp.insert("reducedSize".to_string(), Value::Bool(true));

        let rtp_parameters = RtpParameters {
            mid: Some(mid),
            codecs,
            header_extensions: vec![],
            encodings: vec![json!({ "ssrc": ssrc })],
            rtcp,
        };

        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::new(),
            producer_id: producer.id,
            kind: producer.kind,
            rtp_parameters,
            producer: Arc::downgrade(&producer),
            state: Mutex::new(ConsumerState {
                closed: false,
                paused: options.paused,
            }),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        });

        if !producer.attach_consumer(&consumer) {
            return Err(EngineError::ProducerNotFound(producer.id));
        }
        state.consumers.push(consumer.clone());

        Ok(consumer)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        let (producers, consumers) = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.dtls_state = DtlsState::Closed;
            (
                std::mem::take(&mut state.producers),
                std::mem::take(&mut state.consumers),
            )
        };

        if let Some(router) = self.router.upgrade() {
            for port in &self.ports {
                router.ports.release(*port);
            }
            router.forget_transport(self.id);
        }

        for consumer in consumers {
            consumer.close_with(ConsumerEvent::TransportClosed);
        }
        for producer in producers {
            producer.close_with(ProducerEvent::TransportClosed);
        }

        let _ = self.events.send(TransportEvent::Closed);
        tracing::debug!("Transport {} closed", self.id);
    }
}

struct ProducerState {
    closed: bool,
    consumers: Vec<Weak<LocalConsumer>>,
}

pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    app_data: Map<String, Value>,
    router: Weak<LocalRouter>,
    state: Mutex<ProducerState>,
    events: broadcast::Sender<ProducerEvent>,
}

impl LocalProducer {
    pub fn app_data(&self) -> &Map<String, Value> {
        &self.app_data
    }

    /// Number of consumers currently attached.
    pub fn consumer_count(&self) -> usize {
        lock(&self.state)
            .consumers
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    fn attach_consumer(&self, consumer: &Arc<LocalConsumer>) -> bool {
        let mut state = lock(&self.state);
        if state.closed {
            return false;
        }
        state.consumers.push(Arc::downgrade(consumer));
        true
    }

    fn detach_consumer(&self, id: ConsumerId) {
        lock(&self.state)
            .consumers
            .retain(|c| c.upgrade().is_some_and(|c| c.id != id));
    }

    fn close_with(&self, event: ProducerEvent) {
        let consumers = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.consumers)
        };

        if let Some(router) = self.router.upgrade() {
            router.forget_producer(self.id);
        }

        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.close_with(ConsumerEvent::ProducerClosed);
        }

        let _ = self.events.send(event);
        tracing::debug!("Producer {} closed", self.id);
    }
}

impl Producer for LocalProducer {
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
        lock(&self.state).closed
    }

    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.close_with(ProducerEvent::Closed);
    }
}

struct ConsumerState {
    closed: bool,
    paused: bool,
}

pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    producer: Weak<LocalProducer>,
    state: Mutex<ConsumerState>,
    events: broadcast::Sender<ConsumerEvent>,
}

impl LocalConsumer {
    fn close_with(&self, event: ConsumerEvent) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
        }

        if let Some(producer) = self.producer.upgrade() {
            producer.detach_consumer(self.id);
        }

        let _ = self.events.send(event);
    }
}

impl Consumer for LocalConsumer {
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
        lock(&self.state).paused
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.close_with(ConsumerEvent::Closed);
    }
}
