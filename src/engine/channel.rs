//! Reconnecting WebSocket client for the backend's log stream.
//!
//! One [`EventChannelClient`] holds a single logical subscription to
//! `/ws/logs`. Decoded events are pushed into a bounded queue in arrival
//! order; when the queue is full the reader stops pulling frames off the
//! socket until the subscriber catches up, so nothing is dropped.
//!
//! On connection loss the client retries up to `max_attempts` times, waiting
//! `base_delay * attempt` before each try. A successful connect resets the
//! counter. After the last attempt fails the client stops quietly; calling
//! [`EventChannelClient::connect`] again starts over.

use crate::model::AgentEvent;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based). Grows linearly.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Attempt counter driven by [`ReconnectPolicy`].
#[derive(Debug)]
struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Next `(attempt, delay)`, or `None` once attempts are exhausted.
    fn next_delay(&mut self) -> Option<(u32, Duration)> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some((self.attempts, self.policy.delay_for(self.attempts)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted.
    GaveUp,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("event channel connect failed: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("event channel connection lost: {0}")]
    Lost(#[source] tungstenite::Error),
}

/// Sender for outbound frames, present only while a socket is open.
///
/// Tagged with the epoch of the connection task that installed it so a task
/// winding down cannot clear its successor's slot.
#[derive(Default)]
struct Outbound(Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>);

impl Outbound {
    fn install(&self, epoch: u64, tx: mpsc::UnboundedSender<String>) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some((epoch, tx));
        }
    }

    fn clear(&self, epoch: u64) {
        if let Ok(mut slot) = self.0.lock() {
            if slot.as_ref().is_some_and(|(e, _)| *e == epoch) {
                *slot = None;
            }
        }
    }

    fn clear_all(&self) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = None;
        }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<String>> {
        self.0.lock().ok()?.as_ref().map(|(_, tx)| tx.clone())
    }
}

/// Shared pieces handed to the connection task.
#[derive(Clone)]
struct Wiring {
    url: String,
    policy: ReconnectPolicy,
    events: mpsc::Sender<AgentEvent>,
    errors: Option<mpsc::UnboundedSender<ChannelError>>,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Bumped on every connect/disconnect; only the current task may publish state.
    epoch: Arc<AtomicU64>,
    outbound: Arc<Outbound>,
}

impl Wiring {
    fn report(&self, err: ChannelError) {
        if let Some(tx) = self.errors.as_ref() {
            let _ = tx.send(err);
        }
    }

    fn set_state(&self, epoch: u64, next: ConnectionState) {
        self.state.send_if_modified(|s| {
            if self.epoch.load(Ordering::SeqCst) != epoch || *s == next {
                return false;
            }
            *s = next;
            true
        });
    }

    /// Start a new epoch, publishing `state` atomically with the bump.
    fn begin_epoch(&self, state: ConnectionState) -> u64 {
        let mut epoch = 0;
        self.state.send_modify(|s| {
            epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            *s = state;
        });
        epoch
    }
}

pub struct EventChannelClient {
    wiring: Wiring,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl EventChannelClient {
    /// Create a client for `url` that delivers events into `events`.
    /// Nothing happens until [`connect`](Self::connect) is called.
    pub fn new(url: &url::Url, policy: ReconnectPolicy, events: mpsc::Sender<AgentEvent>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            wiring: Wiring {
                url: url.to_string(),
                policy,
                events,
                errors: None,
                state: Arc::new(state),
                epoch: Arc::new(AtomicU64::new(0)),
                outbound: Arc::new(Outbound::default()),
            },
            task: None,
        }
    }

    /// Report connection errors to `observer`.
    pub fn with_error_observer(mut self, observer: mpsc::UnboundedSender<ChannelError>) -> Self {
        self.wiring.errors = Some(observer);
        self
    }

    /// Start (or restart) the connection task. Resets the attempt counter.
    pub fn connect(&mut self) {
        self.stop_task();
        let epoch = self.wiring.begin_epoch(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_connection(self.wiring.clone(), cancel.clone(), epoch));
        self.task = Some((cancel, handle));
    }

    /// Close the connection and suppress any further reconnects.
    pub fn disconnect(&mut self) {
        self.stop_task();
        self.wiring.begin_epoch(ConnectionState::Disconnected);
        self.wiring.outbound.clear_all();
    }

    fn stop_task(&mut self) {
        if let Some((cancel, _handle)) = self.task.take() {
            // The task sends a close frame on its way out.
            cancel.cancel();
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> ConnectionState {
        *self.wiring.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.wiring.state.subscribe()
    }

    #[allow(dead_code)]
    pub fn is_open(&self) -> bool {
        self.wiring.outbound.sender().is_some()
    }

    /// Send `data` as a JSON text frame if the channel is open; otherwise do nothing.
    #[allow(dead_code)]
    pub fn send<T: Serialize>(&self, data: &T) {
        let Some(tx) = self.wiring.outbound.sender() else {
            debug!("event channel not open, dropping outbound message");
            return;
        };
        match serde_json::to_string(data) {
            Ok(text) => {
                let _ = tx.send(text);
            }
            Err(e) => warn!(error = %e, "failed to encode outbound message"),
        }
    }
}

impl Drop for EventChannelClient {
    fn drop(&mut self) {
        self.stop_task();
    }
}

enum SessionEnd {
    Cancelled,
    SubscriberGone,
    Closed,
    Failed(tungstenite::Error),
}

async fn run_connection(wiring: Wiring, cancel: CancellationToken, epoch: u64) {
    let mut backoff = Backoff::new(wiring.policy);

    loop {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            r = connect_async(wiring.url.as_str()) => r,
        };

        match attempt {
            Ok((ws, _)) => {
                backoff.reset();
                info!(url = %wiring.url, "event channel connected");
                wiring.set_state(epoch, ConnectionState::Connected);
                match pump(ws, &wiring, &cancel, epoch).await {
                    SessionEnd::Cancelled => return,
                    SessionEnd::SubscriberGone => {
                        debug!("event subscriber dropped, closing channel");
                        wiring.set_state(epoch, ConnectionState::Disconnected);
                        return;
                    }
                    SessionEnd::Closed => info!("event channel closed by server"),
                    SessionEnd::Failed(e) => {
                        warn!(error = %e, "event channel connection lost");
                        wiring.report(ChannelError::Lost(e));
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "event channel connect failed");
                wiring.report(ChannelError::Connect(e));
            }
        }

        let Some((n, delay)) = backoff.next_delay() else {
            warn!(
                attempts = wiring.policy.max_attempts,
                "event channel giving up after repeated reconnect failures"
            );
            wiring.set_state(epoch, ConnectionState::GaveUp);
            return;
        };
        info!(attempt = n, delay_ms = delay.as_millis() as u64, "event channel reconnecting");
        wiring.set_state(epoch, ConnectionState::Reconnecting { attempt: n });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Move frames between one live socket and the subscriber until it ends.
async fn pump(
    ws: WsStream,
    wiring: &Wiring,
    cancel: &CancellationToken,
    epoch: u64,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    wiring.outbound.install(epoch, out_tx);

    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break SessionEnd::Cancelled;
            }
            Some(text) = out_rx.recv() => {
                if let Err(e) = sink.send(Message::text(text)).await {
                    break SessionEnd::Failed(e);
                }
            }
            frame = stream.next() => {
                let payload = match frame {
                    None => break SessionEnd::Closed,
                    Some(Err(e)) => break SessionEnd::Failed(e),
                    Some(Ok(Message::Close(_))) => break SessionEnd::Closed,
                    Some(Ok(Message::Text(text))) => decode_event(text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => decode_event(&data),
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => None,
                };
                let Some(event) = payload else { continue };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break SessionEnd::Cancelled,
                    sent = wiring.events.send(event) => {
                        if sent.is_err() {
                            break SessionEnd::SubscriberGone;
                        }
                    }
                }
            }
        }
    };

    wiring.outbound.clear(epoch);
    end
}

fn decode_event(payload: &[u8]) -> Option<AgentEvent> {
    match serde_json::from_slice::<AgentEvent>(payload) {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!(
                error = %e,
                payload = %String::from_utf8_lossy(payload),
                "dropping malformed event payload"
            );
            None
        }
    }
}
