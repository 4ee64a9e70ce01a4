//! Entangled message-port channels with request/response correlation.
//!
//! A [`ChannelManager`] hands out port pairs, tracks which requests are
//! awaiting a response, times them out, and flags channels that have gone
//! quiet. Ports move structured values in-process without serialization.
//!
//! This is a library API for embedders that run components in the same
//! process as the host. The `termhost` binary opens no channels itself: it
//! only builds a manager from its `channel` config section, runs the health
//! monitor, and cleans the manager up on shutdown.

pub mod error;
pub mod manager;
pub mod message;
pub mod port;

pub use error::ChannelError;
pub use manager::{
    ChannelConfig, ChannelHealth, ChannelManager, ChannelNotice, LatencyStats, PendingResponse,
};
pub use message::{now_millis, ChannelMessage, ChannelResponse, PortMessage};
pub use port::{MessagePort, PortSide};
