use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::error::ChannelError;
use crate::message::{ChannelMessage, ChannelResponse, PortMessage};

/// Which end of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSide {
    Port1,
    Port2,
}

impl PortSide {
    pub fn peer(self) -> Self {
        match self {
            PortSide::Port1 => PortSide::Port2,
            PortSide::Port2 => PortSide::Port1,
        }
    }
}

/// Posting half of a port. The manager keeps a clone of each so it can post
/// requests on a caller's behalf.
#[derive(Debug, Clone)]
pub(crate) struct PortSender {
    channel_id: Arc<str>,
    tx: mpsc::UnboundedSender<PortMessage>,
    closed: watch::Receiver<bool>,
}

impl PortSender {
    pub(crate) fn new(
        channel_id: Arc<str>,
        tx: mpsc::UnboundedSender<PortMessage>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            channel_id,
            tx,
            closed,
        }
    }

    pub(crate) fn post(&self, message: PortMessage) -> Result<(), ChannelError> {
        if *self.closed.borrow() {
            return Err(ChannelError::PortClosed(self.channel_id.to_string()));
        }
        self.tx
            .send(message)
            .map_err(|_| ChannelError::PortClosed(self.channel_id.to_string()))
    }
}

/// One end of an entangled port pair.
///
/// Messages posted here arrive at the peer port. Closing either end, or
/// dropping it, closes the whole channel.
pub struct MessagePort {
    side: PortSide,
    sender: PortSender,
    inbox: mpsc::UnboundedReceiver<PortMessage>,
    close: Arc<watch::Sender<bool>>,
}

impl MessagePort {
    pub(crate) fn new(
        side: PortSide,
        sender: PortSender,
        inbox: mpsc::UnboundedReceiver<PortMessage>,
        close: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            side,
            sender,
            inbox,
            close,
        }
    }

    pub fn side(&self) -> PortSide {
        self.side
    }

    pub fn channel_id(&self) -> &str {
        &self.sender.channel_id
    }

    pub fn post_message(&self, message: PortMessage) -> Result<(), ChannelError> {
        self.sender.post(message)
    }

    /// Post a request without registering it for a response.
    pub fn post_request(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        self.post_message(PortMessage::Request(message))
    }

    /// Answer a request received on this port.
    pub fn respond(&self, response: ChannelResponse) -> Result<(), ChannelError> {
        self.post_message(PortMessage::Response(response))
    }

    /// Next message from the peer. `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<PortMessage> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PortMessage> {
        self.inbox.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        *self.close.borrow()
    }

    pub fn close(&self) {
        self.close.send_replace(true);
    }
}

impl Drop for MessagePort {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePort")
            .field("channel_id", &self.channel_id())
            .field("side", &self.side)
            .field("closed", &self.is_closed())
            .finish()
    }
}
