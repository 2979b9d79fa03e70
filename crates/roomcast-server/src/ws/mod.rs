//! Signaling Gateway: one WebSocket per peer

pub mod handler;

pub use handler::{dispatch, ws_handler};
