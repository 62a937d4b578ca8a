//! Transport layer for live sessions
//!
//! Handles the WebSocket connection carrying SFU signaling.

pub mod websocket;

pub use websocket::{ChannelEvent, ChannelState, SignalingChannel};
