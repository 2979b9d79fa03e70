//! Roomcast signaling protocol
//!
//! Wire types shared between the SFU signaling server and its clients.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
