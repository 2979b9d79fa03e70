//! SFU session coordination
//!
//! Tracks which peer owns which transports, producers and consumers, and keeps
//! every peer's view of the room consistent. Media itself is handled by the
//! engine behind [`crate::media`].

mod consumer;
mod producer;
mod reaper;
pub mod registry;
mod session;
#[cfg(test)]
pub(crate) mod testing;
mod transport;

pub use consumer::ConsumerInfo;
pub use registry::{PeerSession, PeerState, SessionRegistry, TransportHandle, TransportState};
pub use session::SfuSessionManager;
pub use transport::TransportInfo;
