//! Channel table, request/response correlation, and health tracking.
//!
//! Every port direction is watched by a monitor task that refreshes the
//! channel heartbeat, feeds latency statistics, and routes responses to their
//! pending requests. A pending request ends exactly once: by its response, by
//! its timeout, or by shutdown, whichever removes it from the table first.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::ChannelError;
use crate::message::{now_millis, ChannelMessage, ChannelResponse, PortMessage};
use crate::port::{MessagePort, PortSender, PortSide};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_STALE_AFTER_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub request_timeout_ms: u64,
    pub health_interval_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            health_interval_ms: DEFAULT_HEALTH_INTERVAL_MS,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
        }
    }
}

impl ChannelConfig {
    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Advisory notifications about channel state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    Disconnected { channel_id: String },
    Stale { channel_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHealth {
    pub last_heartbeat: Instant,
    pub connected: bool,
}

/// Running latency figures over every monitored message.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub message_count: u64,
    pub max_latency_ms: i64,
    pub avg_latency_ms: f64,
}

impl LatencyStats {
    fn record(&mut self, latency_ms: i64) {
        self.message_count += 1;
        self.max_latency_ms = self.max_latency_ms.max(latency_ms);
        self.avg_latency_ms +=
            (latency_ms as f64 - self.avg_latency_ms) / self.message_count as f64;
    }
}

type Reply = Result<Option<Value>, ChannelError>;

struct PendingRequest {
    responder: oneshot::Sender<Reply>,
    timer: JoinHandle<()>,
}

struct ChannelEntry {
    generation: u64,
    senders: [PortSender; 2],
    close: Arc<watch::Sender<bool>>,
    health: ChannelHealth,
}

impl ChannelEntry {
    fn sender(&self, side: PortSide) -> &PortSender {
        match side {
            PortSide::Port1 => &self.senders[0],
            PortSide::Port2 => &self.senders[1],
        }
    }

    fn close(&self, channel_id: &str) {
        if self.close.send(true).is_err() {
            log::warn!("channel {channel_id}: ports already closed");
        }
    }
}

#[derive(Default)]
struct State {
    channels: HashMap<String, ChannelEntry>,
    pending: HashMap<String, PendingRequest>,
    stats: LatencyStats,
    next_generation: u64,
    health_task: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    notices: mpsc::UnboundedSender<ChannelNotice>,
    config: ChannelConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, notice: ChannelNotice) {
        let _ = self.notices.send(notice);
    }

    fn record_message(&self, channel_id: &str, generation: u64, timestamp: i64) {
        let latency = now_millis().saturating_sub(timestamp).max(0);
        let mut state = self.lock();
        state.stats.record(latency);
        if let Some(entry) = state.channels.get_mut(channel_id) {
            if entry.generation == generation {
                entry.health.last_heartbeat = Instant::now();
            }
        }
    }

    fn mark_disconnected(&self, channel_id: &str, generation: u64) {
        let newly_disconnected = {
            let mut state = self.lock();
            match state.channels.get_mut(channel_id) {
                Some(entry) if entry.generation == generation && entry.health.connected => {
                    entry.health.connected = false;
                    true
                }
                _ => false,
            }
        };
        if newly_disconnected {
            log::info!("channel {channel_id} disconnected");
            self.notify(ChannelNotice::Disconnected {
                channel_id: channel_id.to_string(),
            });
        }
    }

    /// Returns the response back when no pending request has its id.
    fn handle_response(&self, response: ChannelResponse) -> Option<ChannelResponse> {
        let Some(pending) = self.lock().pending.remove(&response.id) else {
            log::debug!("response for unknown request {}", response.id);
            return Some(response);
        };
        pending.timer.abort();
        let reply = if response.success {
            Ok(response.data)
        } else {
            Err(ChannelError::Remote(
                response
                    .error
                    .unwrap_or_else(|| "request failed".to_string()),
            ))
        };
        let _ = pending.responder.send(reply);
        None
    }

    fn expire(&self, id: &str) {
        let Some(pending) = self.lock().pending.remove(id) else {
            return;
        };
        let after_ms = self.config.request_timeout_ms;
        log::warn!("request {id} timed out after {after_ms}ms");
        let _ = pending.responder.send(Err(ChannelError::Timeout {
            id: id.to_string(),
            after_ms,
        }));
    }

    fn check_health(&self) -> Vec<String> {
        let stale_after = Duration::from_millis(self.config.stale_after_ms);
        let now = Instant::now();
        let stale: Vec<String> = {
            let mut state = self.lock();
            state
                .channels
                .iter_mut()
                .filter(|(_, entry)| {
                    entry.health.connected
                        && now.duration_since(entry.health.last_heartbeat) > stale_after
                })
                .map(|(id, entry)| {
                    entry.health.connected = false;
                    id.clone()
                })
                .collect()
        };
        for channel_id in &stale {
            log::warn!("channel {channel_id} is stale");
            self.notify(ChannelNotice::Stale {
                channel_id: channel_id.clone(),
            });
        }
        stale
    }
}

/// Owns every channel and in-flight request. Cheap to clone; clones share
/// the same tables.
///
/// Channel creation and request registration spawn tokio tasks, so those
/// calls must run inside a runtime.
#[derive(Clone)]
pub struct ChannelManager {
    shared: Arc<Shared>,
}

impl ChannelManager {
    pub fn new(config: ChannelConfig) -> (Self, mpsc::UnboundedReceiver<ChannelNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let manager = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notices,
                config,
            }),
        };
        (manager, notice_rx)
    }

    /// Create an entangled port pair under `id`. An existing channel with the
    /// same id is closed first.
    pub fn create_channel(&self, id: &str) -> (MessagePort, MessagePort) {
        let channel_id: Arc<str> = Arc::from(id);
        let (close_tx, close_rx) = watch::channel(false);
        let close_tx = Arc::new(close_tx);

        let (to_port1, port1_raw) = mpsc::unbounded_channel();
        let (to_port2, port2_raw) = mpsc::unbounded_channel();
        let (port1_inbox_tx, port1_inbox) = mpsc::unbounded_channel();
        let (port2_inbox_tx, port2_inbox) = mpsc::unbounded_channel();

        // Port 1 posts towards port 2 and vice versa.
        let port1_sender = PortSender::new(Arc::clone(&channel_id), to_port2, close_rx.clone());
        let port2_sender = PortSender::new(Arc::clone(&channel_id), to_port1, close_rx.clone());

        let replaced = {
            let mut state = self.shared.lock();
            state.next_generation += 1;
            let generation = state.next_generation;

            for (raw, inbox) in [(port1_raw, port1_inbox_tx), (port2_raw, port2_inbox_tx)] {
                tokio::spawn(monitor_port(
                    Arc::downgrade(&self.shared),
                    id.to_string(),
                    generation,
                    raw,
                    inbox,
                    close_rx.clone(),
                ));
            }

            state.channels.insert(
                id.to_string(),
                ChannelEntry {
                    generation,
                    senders: [port1_sender.clone(), port2_sender.clone()],
                    close: Arc::clone(&close_tx),
                    health: ChannelHealth {
                        last_heartbeat: Instant::now(),
                        connected: true,
                    },
                },
            )
        };
        if let Some(old) = replaced {
            log::warn!("channel {id} recreated; closing previous ports");
            old.close(id);
        }
        log::debug!("channel {id} created");

        (
            MessagePort::new(PortSide::Port1, port1_sender, port1_inbox, Arc::clone(&close_tx)),
            MessagePort::new(PortSide::Port2, port2_sender, port2_inbox, close_tx),
        )
    }

    /// Post `message` on the given port of a channel and wait for the
    /// matching response.
    ///
    /// Registration happens immediately; the returned future only waits.
    pub fn send_message(
        &self,
        channel_id: &str,
        side: PortSide,
        mut message: ChannelMessage,
    ) -> PendingResponse {
        message.timestamp = now_millis();
        let id = message.id.clone();
        let (responder, reply) = oneshot::channel();

        let sender = {
            let mut state = self.shared.lock();
            let sender = match state.channels.get(channel_id) {
                Some(entry) => entry.sender(side).clone(),
                None => {
                    return PendingResponse::failed(ChannelError::UnknownChannel(
                        channel_id.to_string(),
                    ))
                }
            };
            if state.pending.contains_key(&id) {
                return PendingResponse::failed(ChannelError::DuplicateRequest(id));
            }

            let deadline = Instant::now() + self.shared.config.request_timeout();
            let weak = Arc::downgrade(&self.shared);
            let timer_id = id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(shared) = weak.upgrade() {
                    shared.expire(&timer_id);
                }
            });
            state
                .pending
                .insert(id.clone(), PendingRequest { responder, timer });
            sender
        };

        if let Err(e) = sender.post(PortMessage::Request(message)) {
            if let Some(pending) = self.shared.lock().pending.remove(&id) {
                pending.timer.abort();
            }
            log::warn!("failed to post request {id}: {e}");
            return PendingResponse::failed(e);
        }
        PendingResponse::waiting(reply)
    }

    /// Settle the pending request with the response's id. Unknown ids are
    /// ignored.
    pub fn handle_response(&self, response: ChannelResponse) {
        let _ = self.shared.handle_response(response);
    }

    /// Mark connected channels with an old heartbeat as disconnected and
    /// report them. Returns the ids that went stale. Ports stay open.
    pub fn check_health(&self) -> Vec<String> {
        self.shared.check_health()
    }

    /// Run [`check_health`](Self::check_health) periodically until
    /// [`cleanup`](Self::cleanup) or the last manager handle is dropped.
    pub fn start_health_monitor(&self) {
        let period = Duration::from_millis(self.shared.config.health_interval_ms);
        let weak = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(shared) => {
                        shared.check_health();
                    }
                    None => return,
                }
            }
        });
        if let Some(previous) = self.shared.lock().health_task.replace(task) {
            previous.abort();
        }
    }

    /// Close both ports of a channel and forget it.
    pub fn close_channel(&self, id: &str) {
        let removed = self.shared.lock().channels.remove(id);
        match removed {
            Some(entry) => {
                entry.close(id);
                log::debug!("channel {id} closed");
            }
            None => log::debug!("close for unknown channel {id}"),
        }
    }

    /// Close every channel, stop health monitoring, and reject every pending
    /// request.
    pub fn cleanup(&self) {
        let (channels, pending, health_task) = {
            let mut state = self.shared.lock();
            (
                std::mem::take(&mut state.channels),
                std::mem::take(&mut state.pending),
                state.health_task.take(),
            )
        };
        if let Some(task) = health_task {
            task.abort();
        }
        for (id, entry) in &channels {
            entry.close(id);
        }
        for (_, request) in pending {
            request.timer.abort();
            let _ = request.responder.send(Err(ChannelError::Shutdown));
        }
        log::info!("channel manager cleaned up {} channel(s)", channels.len());
    }

    pub fn health(&self, id: &str) -> Option<ChannelHealth> {
        self.shared.lock().channels.get(id).map(|entry| entry.health)
    }

    pub fn stats(&self) -> LatencyStats {
        self.shared.lock().stats
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.lock().channels.keys().cloned().collect();
        ids.sort();
        ids
    }
}

async fn monitor_port(
    shared: Weak<Shared>,
    channel_id: String,
    generation: u64,
    mut raw: mpsc::UnboundedReceiver<PortMessage>,
    inbox: mpsc::UnboundedSender<PortMessage>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            message = raw.recv() => {
                let Some(message) = message else { break };
                let Some(shared) = shared.upgrade() else { return };
                deliver(&shared, &channel_id, generation, message, &inbox);
            }
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            }
        }
    }
    // Messages posted before the close still reach the inbox.
    while let Ok(message) = raw.try_recv() {
        let Some(shared) = shared.upgrade() else { return };
        deliver(&shared, &channel_id, generation, message, &inbox);
    }
    if let Some(shared) = shared.upgrade() {
        shared.mark_disconnected(&channel_id, generation);
    }
}

/// Settle a pending request, or pass the message on to the port's owner.
fn deliver(
    shared: &Shared,
    channel_id: &str,
    generation: u64,
    message: PortMessage,
    inbox: &mpsc::UnboundedSender<PortMessage>,
) {
    shared.record_message(channel_id, generation, message.timestamp());
    let unclaimed = match message {
        PortMessage::Response(response) => {
            shared.handle_response(response).map(PortMessage::Response)
        }
        request => Some(request),
    };
    if let Some(message) = unclaimed {
        let _ = inbox.send(message);
    }
}

/// Resolves with the response data, or rejects with the failure.
pub struct PendingResponse {
    state: PendingState,
}

enum PendingState {
    Failed(Option<ChannelError>),
    Waiting(oneshot::Receiver<Reply>),
}

impl PendingResponse {
    fn failed(error: ChannelError) -> Self {
        Self {
            state: PendingState::Failed(Some(error)),
        }
    }

    fn waiting(reply: oneshot::Receiver<Reply>) -> Self {
        Self {
            state: PendingState::Waiting(reply),
        }
    }
}

impl Future for PendingResponse {
    type Output = Reply;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            PendingState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(ChannelError::Shutdown)))
            }
            PendingState::Waiting(reply) => Pin::new(reply)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(ChannelError::Shutdown))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> (ChannelManager, mpsc::UnboundedReceiver<ChannelNotice>) {
        ChannelManager::new(ChannelConfig::default())
    }

    #[tokio::test]
    async fn test_ports_exchange_messages() {
        let (manager, _notices) = manager();
        let (port1, mut port2) = manager.create_channel("c1");

        port1
            .post_request(ChannelMessage::new("m1", "ping", Some(json!(1))))
            .unwrap();
        let received = port2.recv().await.unwrap();
        assert_eq!(received.id(), "m1");

        assert_eq!(manager.stats().message_count, 1);
        assert!(manager.health("c1").unwrap().connected);
        assert_eq!(manager.channel_ids(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_request_resolves_with_response() {
        let (manager, _notices) = manager();
        let (_port1, mut port2) = manager.create_channel("c1");

        let responder = tokio::spawn(async move {
            if let Some(PortMessage::Request(request)) = port2.recv().await {
                port2
                    .respond(ChannelResponse::ok(request.id, Some(json!({"echo": request.kind}))))
                    .unwrap();
            }
            port2
        });

        let reply = manager
            .send_message("c1", PortSide::Port1, ChannelMessage::new("r1", "hello", None))
            .await;
        assert_eq!(reply, Ok(Some(json!({"echo": "hello"}))));
        assert_eq!(manager.pending_count(), 0);
        let _port2 = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_rejects() {
        let (manager, _notices) = manager();
        let (_port1, _port2) = manager.create_channel("c1");

        let pending =
            manager.send_message("c1", PortSide::Port2, ChannelMessage::new("r1", "x", None));
        manager.handle_response(ChannelResponse::err("r1", "boom"));
        assert_eq!(pending.await, Err(ChannelError::Remote("boom".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_after_exact_window() {
        let (manager, _notices) = manager();
        let (_port1, _port2) = manager.create_channel("c1");

        let pending =
            manager.send_message("c1", PortSide::Port1, ChannelMessage::new("slow", "x", None));
        assert_eq!(manager.pending_count(), 1);

        tokio::time::advance(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS - 1)).await;
        tokio::task::yield_now().await;
        assert_eq!(manager.pending_count(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        let result = pending.await;
        assert_eq!(
            result,
            Err(ChannelError::Timeout {
                id: "slow".to_string(),
                after_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            })
        );
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_after_timeout_is_ignored() {
        let (manager, _notices) = manager();
        let (_port1, _port2) = manager.create_channel("c1");

        let pending =
            manager.send_message("c1", PortSide::Port1, ChannelMessage::new("late", "x", None));
        tokio::time::advance(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)).await;
        assert!(matches!(pending.await, Err(ChannelError::Timeout { .. })));

        manager.handle_response(ChannelResponse::ok("late", None));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_response_is_noop() {
        let (manager, _notices) = manager();
        let (_port1, _port2) = manager.create_channel("c1");
        let _pending =
            manager.send_message("c1", PortSide::Port1, ChannelMessage::new("known", "x", None));

        manager.handle_response(ChannelResponse::ok("unknown", None));
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_send_on_unknown_channel_fails() {
        let (manager, _notices) = manager();
        let result = manager
            .send_message("missing", PortSide::Port1, ChannelMessage::request("x", None))
            .await;
        assert_eq!(
            result,
            Err(ChannelError::UnknownChannel("missing".to_string()))
        );
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_post_failure_cleans_up_immediately() {
        let (manager, _notices) = manager();
        let (port1, _port2) = manager.create_channel("c1");
        port1.close();

        let result = manager
            .send_message("c1", PortSide::Port1, ChannelMessage::new("r1", "x", None))
            .await;
        assert_eq!(result, Err(ChannelError::PortClosed("c1".to_string())));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let (manager, _notices) = manager();
        let (_port1, _port2) = manager.create_channel("c1");

        let _first =
            manager.send_message("c1", PortSide::Port1, ChannelMessage::new("dup", "x", None));
        let second = manager
            .send_message("c1", PortSide::Port1, ChannelMessage::new("dup", "x", None))
            .await;
        assert_eq!(second, Err(ChannelError::DuplicateRequest("dup".to_string())));
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_port_close_notifies_disconnect() {
        let (manager, mut notices) = manager();
        let (port1, mut port2) = manager.create_channel("c1");

        drop(port1);
        assert_eq!(
            notices.recv().await,
            Some(ChannelNotice::Disconnected {
                channel_id: "c1".to_string()
            })
        );
        assert!(!manager.health("c1").unwrap().connected);
        assert!(port2.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_channel_is_flagged_but_open() {
        let (manager, mut notices) = manager();
        let (port1, mut port2) = manager.create_channel("c1");

        tokio::time::advance(Duration::from_millis(DEFAULT_STALE_AFTER_MS)).await;
        assert!(manager.check_health().is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(manager.check_health(), vec!["c1".to_string()]);
        assert_eq!(
            notices.recv().await,
            Some(ChannelNotice::Stale {
                channel_id: "c1".to_string()
            })
        );
        assert!(!manager.health("c1").unwrap().connected);

        // Advisory only: the ports still work.
        port1
            .post_request(ChannelMessage::new("after", "x", None))
            .unwrap();
        assert_eq!(port2.recv().await.unwrap().id(), "after");
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_keeps_channel_fresh() {
        let (manager, _notices) = manager();
        let (port1, mut port2) = manager.create_channel("c1");

        tokio::time::advance(Duration::from_millis(50_000)).await;
        port1.post_request(ChannelMessage::new("beat", "x", None)).unwrap();
        port2.recv().await.unwrap();

        tokio::time::advance(Duration::from_millis(50_000)).await;
        assert!(manager.check_health().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_sweeps_periodically() {
        let (manager, mut notices) = manager();
        let (_port1, _port2) = manager.create_channel("c1");
        manager.start_health_monitor();

        // Sweeps at 30s and 60s see a heartbeat that is not yet older than
        // the threshold; the 90s sweep flags it.
        let notice = notices.recv().await;
        assert_eq!(
            notice,
            Some(ChannelNotice::Stale {
                channel_id: "c1".to_string()
            })
        );
        manager.cleanup();
    }

    #[tokio::test]
    async fn test_close_channel_closes_ports() {
        let (manager, _notices) = manager();
        let (port1, mut port2) = manager.create_channel("c1");

        manager.close_channel("c1");
        assert!(manager.health("c1").is_none());
        assert!(port1.is_closed());
        assert!(port2.recv().await.is_none());
        assert!(port1
            .post_request(ChannelMessage::new("x", "x", None))
            .is_err());

        // Closing twice is harmless.
        manager.close_channel("c1");
    }

    #[tokio::test]
    async fn test_recreate_closes_previous_ports() {
        let (manager, _notices) = manager();
        let (_old1, mut old2) = manager.create_channel("c1");
        let (new1, mut new2) = manager.create_channel("c1");

        assert!(old2.recv().await.is_none());
        assert!(manager.health("c1").unwrap().connected);
        new1.post_request(ChannelMessage::new("n", "x", None)).unwrap();
        assert_eq!(new2.recv().await.unwrap().id(), "n");
    }

    #[tokio::test]
    async fn test_cleanup_rejects_pending() {
        let (manager, _notices) = manager();
        let (_a1, _a2) = manager.create_channel("a");
        let (_b1, _b2) = manager.create_channel("b");

        let first = manager.send_message("a", PortSide::Port1, ChannelMessage::request("x", None));
        let second = manager.send_message("b", PortSide::Port2, ChannelMessage::request("y", None));

        manager.cleanup();
        assert_eq!(first.await, Err(ChannelError::Shutdown));
        assert_eq!(second.await, Err(ChannelError::Shutdown));
        assert_eq!(manager.pending_count(), 0);
        assert!(manager.channel_ids().is_empty());
    }

    #[tokio::test]
    async fn test_latency_stats_track_max_and_average() {
        let (manager, _notices) = manager();
        let (port1, mut port2) = manager.create_channel("c1");

        let mut old = ChannelMessage::new("old", "x", None);
        old.timestamp -= 200;
        port1.post_request(old).unwrap();
        port1.post_request(ChannelMessage::new("new", "x", None)).unwrap();
        port2.recv().await.unwrap();
        port2.recv().await.unwrap();

        let stats = manager.stats();
        assert_eq!(stats.message_count, 2);
        assert!(stats.max_latency_ms >= 200);
        assert!(stats.avg_latency_ms >= 100.0);
        assert!(stats.avg_latency_ms <= stats.max_latency_ms as f64);
    }

    #[tokio::test]
    async fn test_uncorrelated_response_reaches_peer() {
        let (manager, _notices) = manager();
        let (mut port1, mut port2) = manager.create_channel("c1");

        port1
            .post_request(ChannelMessage::new("app-1", "query", None))
            .unwrap();
        let request = port2.recv().await.unwrap();
        port2
            .respond(ChannelResponse::ok(request.id(), Some(json!("done"))))
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), port1.recv())
            .await
            .unwrap();
        match reply {
            Some(PortMessage::Response(response)) => {
                assert_eq!(response.id, "app-1");
                assert_eq!(response.data, Some(json!("done")));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_settled_response_is_not_delivered() {
        let (manager, _notices) = manager();
        let (mut port1, mut port2) = manager.create_channel("c1");

        let pending =
            manager.send_message("c1", PortSide::Port1, ChannelMessage::new("r1", "x", None));
        let request = port2.recv().await.unwrap();
        port2.respond(ChannelResponse::ok(request.id(), None)).unwrap();

        assert_eq!(pending.await, Ok(None));
        assert!(port1.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_messages_posted_before_close_are_delivered() {
        let (manager, _notices) = manager();
        let (port1, mut port2) = manager.create_channel("c1");

        for i in 0..5 {
            port1
                .post_request(ChannelMessage::new(format!("m{i}"), "x", None))
                .unwrap();
        }
        port1.close();

        let mut ids = Vec::new();
        while let Some(message) = port2.recv().await {
            ids.push(message.id().to_string());
        }
        assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_extreme_timestamp_does_not_panic() {
        let (manager, _notices) = manager();
        let (port1, mut port2) = manager.create_channel("c1");

        let mut message = ChannelMessage::new("far", "x", None);
        message.timestamp = i64::MIN;
        port1.post_request(message).unwrap();
        port1.post_request(ChannelMessage::new("next", "x", None)).unwrap();

        assert_eq!(port2.recv().await.unwrap().id(), "far");
        assert_eq!(port2.recv().await.unwrap().id(), "next");
        assert_eq!(manager.stats().message_count, 2);
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: ChannelConfig = serde_json::from_str(r#"{"request_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.request_timeout_ms, 500);
        assert_eq!(config.stale_after_ms, DEFAULT_STALE_AFTER_MS);
    }
}
