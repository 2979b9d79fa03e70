//! Media engine seam
//!
//! The signaling layer never touches packets. ICE, DTLS, SRTP and RTP forwarding
//! belong to a media engine reached through the traits in this module. Engine
//! notifications (DTLS state changes, closures) are delivered as messages on
//! broadcast channels that callers subscribe to.

pub mod local;
#[cfg(feature = "mediasoup")]
pub mod mediasoup;

use async_trait::async_trait;
use roomcast_protocol::{
    ConsumerId, DtlsParameters, IceCandidate, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpCodecCapability, RtpParameters, TransportId,
};
use serde_json::{Map, Value};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;

pub use local::{LocalMediaEngine, LocalRouter};
#[cfg(feature = "mediasoup")]
pub use self::mediasoup::MediasoupEngine;

/// Capacity of every engine event channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("transport closed")]
    TransportClosed,

    #[error("connect() already called")]
    AlreadyConnected,

    #[error("invalid dtlsParameters: {0}")]
    InvalidDtlsParameters(String),

    #[error("invalid rtpParameters: {0}")]
    InvalidRtpParameters(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Producer with id \"{0}\" not found")]
    ProducerNotFound(ProducerId),

    #[error("cannot consume producer {0} with the given rtpCapabilities")]
    IncompatibleCapabilities(ProducerId),

    #[error("invalid transport options: {0}")]
    InvalidTransportOptions(String),

    #[error("no more available ports")]
    PortsExhausted,

    #[error("worker closed")]
    WorkerClosed,

    #[error("failed to start media worker: {0}")]
    WorkerSpawn(String),

    /// A request the engine answered with an error, carrying its message.
    #[error("{0}")]
    Request(String),
}

/// Settings of the media worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            rtc_min_port: 10000,
            rtc_max_port: 10100,
        }
    }
}

/// DTLS state of a transport as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    DtlsStateChange(DtlsState),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerEvent {
    /// The transport carrying the producer closed; the producer is closed too
    TransportClosed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// The consumed producer closed; the consumer is closed too
    ProducerClosed,
    TransportClosed,
    Closed,
}

/// Options for creating a WebRTC transport
#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    /// Local address to bind to.
    pub listen_ip: IpAddr,
    /// Public address advertised in ICE candidates.
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

/// Entry point of a media engine: owns the worker process and creates routers
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn Router>, EngineError>;

    /// Resolves once the engine worker has died, with a description of why.
    async fn died(&self) -> String;
}

#[async_trait]
pub trait Router: Send + Sync {
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether the given capabilities can receive the given producer.
    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;
    fn ice_parameters(&self) -> IceParameters;
    fn ice_candidates(&self) -> Vec<IceCandidate>;
    fn dtls_parameters(&self) -> DtlsParameters;
    fn dtls_state(&self) -> DtlsState;
    fn is_closed(&self) -> bool;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;
    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>, EngineError>;
    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>, EngineError>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Close the transport and everything produced or consumed over it.
    fn close(&self);
}

pub trait Producer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn is_closed(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent>;
    fn close(&self);
}

pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn paused(&self) -> bool;
    fn is_closed(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent>;
    fn close(&self);
}

/// Router codecs of the deployment: Opus audio and VP8 video
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            preferred_payload_type: None,
            parameters: Map::new(),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: None,
            parameters: Map::new(),
            rtcp_feedback: vec![],
        },
    ]
}
