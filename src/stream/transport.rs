//! Socket session: one WebSocket connection to the inference service
//!
//! Phases: `Idle -> Connecting -> Open -> {Closed, Errored}`. The session task
//! owns the socket; frames reach it through a bounded queue fed by
//! [`OutboundSink`], and inbound status messages go straight to the
//! [`Reconciler`] in arrival order.

use arc_swap::ArcSwapOption;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol::{ControlMessage, StatusMessage};
use super::sampler::{FrameSampler, FrameSink};
use crate::error::{AppError, Result};
use crate::session::{Reconciler, SessionPhase};
use crate::utils::LogThrottler;
use crate::video::capture::FrameReceiver;
use crate::video::encoder::EncodedFrame;
use crate::warn_throttled;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Grace period for the closing handshake on local close
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Local camera frames are sampled and sent
    #[default]
    Local,
    /// The server pulls from `camera_url`; nothing is sent after the control message
    Remote,
}

impl std::str::FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(CaptureMode::Local),
            "remote" => Ok(CaptureMode::Remote),
            _ => Err(format!("Unknown capture mode: {}", s)),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// `ws://` or `wss://` endpoint
    pub url: String,
    /// `None` waits indefinitely
    pub connect_timeout: Option<Duration>,
    pub mode: CaptureMode,
    /// Camera the server should pull from in remote mode
    pub camera_url: Option<String>,
    /// Send `{"action":"start"}` after the handshake in local mode
    pub send_start_action: bool,
    /// Outbound frame queue capacity
    pub outbound_queue: usize,
    /// A write that makes no progress for this long fails the session
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout: Some(Duration::from_secs(10)),
            mode: CaptureMode::Local,
            camera_url: None,
            send_start_action: false,
            outbound_queue: 2,
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    /// Control message to send after the handshake, if any
    pub fn control_message(&self) -> Option<ControlMessage> {
        match self.mode {
            CaptureMode::Remote => Some(ControlMessage::start(self.camera_url.clone())),
            CaptureMode::Local if self.send_start_action => Some(ControlMessage::start(None)),
            CaptureMode::Local => None,
        }
    }
}

/// Non-blocking frame sink into a session's outbound queue
pub struct OutboundSink {
    tx: mpsc::Sender<String>,
    open: AtomicBool,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl OutboundSink {
    fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            open: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Frames queued for sending
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Frames dropped because the socket was not open or the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSink for OutboundSink {
    fn send_frame(&self, frame: EncodedFrame) -> bool {
        if !self.is_open() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.tx.try_send(frame.data_url) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

struct Shared {
    config: TransportConfig,
    sampler: Arc<FrameSampler>,
    reconciler: Arc<Reconciler>,
    phase: watch::Sender<SessionPhase>,
}

impl Shared {
    fn set_phase(&self, session_id: &str, phase: SessionPhase) {
        self.phase.send_replace(phase);
        self.reconciler.on_phase(phase);
        info!("Session {} {}", session_id, phase);
    }
}

struct ActiveSession {
    id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of the single WebSocket session
pub struct SocketSession {
    shared: Arc<Shared>,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
    sink: ArcSwapOption<OutboundSink>,
}

impl SocketSession {
    pub fn new(
        config: TransportConfig,
        sampler: Arc<FrameSampler>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                sampler,
                reconciler,
                phase,
            }),
            active: tokio::sync::Mutex::new(None),
            sink: ArcSwapOption::empty(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn phase(&self) -> SessionPhase {
        *self.shared.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.shared.phase.subscribe()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|s| s.id.clone())
    }

    /// Open a new session, closing any previous one first.
    ///
    /// `frames` feeds the sampler in local mode. Returns the new session id;
    /// connection failures show up as the `Errored` phase, not as an error.
    pub async fn start(&self, frames: Option<FrameReceiver>) -> String {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!("Closing session {} before starting a new one", previous.id);
            Self::shutdown(previous).await;
        }

        let id = Uuid::new_v4().to_string();
        self.shared.reconciler.begin_session(&id);
        self.shared.set_phase(&id, SessionPhase::Connecting);

        let (tx, rx) = mpsc::channel(self.shared.config.outbound_queue.max(1));
        let sink = Arc::new(OutboundSink::new(tx));
        self.sink.store(Some(sink.clone()));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_session(
            self.shared.clone(),
            id.clone(),
            cancel.clone(),
            sink,
            rx,
            frames,
        ));

        *active = Some(ActiveSession {
            id: id.clone(),
            cancel,
            handle,
        });
        id
    }

    /// Close the current session and wait for its task. Idempotent.
    pub async fn close(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            Self::shutdown(previous).await;
        }
    }

    async fn shutdown(session: ActiveSession) {
        session.cancel.cancel();
        if let Err(e) = session.handle.await {
            error!("Session task {} panicked: {}", session.id, e);
        }
    }

    /// Queue a frame on the current session; dropped unless Open
    pub fn send(&self, frame: EncodedFrame) -> bool {
        match self.sink.load_full() {
            Some(sink) => sink.send_frame(frame),
            None => false,
        }
    }

    /// Frames dropped by the current session's sink
    pub fn dropped_frames(&self) -> u64 {
        self.sink.load().as_ref().map(|s| s.dropped()).unwrap_or(0)
    }

    /// Frames queued by the current session's sink
    pub fn sent_frames(&self) -> u64 {
        self.sink.load().as_ref().map(|s| s.sent()).unwrap_or(0)
    }
}

async fn connect(url: &str, timeout: Option<Duration>) -> Result<WsStream> {
    let connecting = tokio_tungstenite::connect_async(url);
    let (ws, response) = match timeout {
        Some(limit) => tokio::time::timeout(limit, connecting)
            .await
            .map_err(|_| AppError::Timeout(format!("connect to {} after {:?}", url, limit)))??,
        None => connecting.await?,
    };
    debug!("WebSocket handshake complete ({})", response.status());
    Ok(ws)
}

async fn run_session(
    shared: Arc<Shared>,
    id: String,
    cancel: CancellationToken,
    sink: Arc<OutboundSink>,
    mut outbound: mpsc::Receiver<String>,
    frames: Option<FrameReceiver>,
) {
    let config = &shared.config;
    info!("Session {} connecting to {}", id, config.url);

    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            shared.set_phase(&id, SessionPhase::Closed);
            return;
        }
        result = connect(&config.url, config.connect_timeout) => result,
    };

    let ws = match connected {
        Ok(ws) => ws,
        Err(e) => {
            error!("Session {} failed to connect: {}", id, e);
            shared.set_phase(&id, SessionPhase::Errored);
            return;
        }
    };
    let (mut write, mut read) = ws.split();

    if let Some(control) = config.control_message() {
        let sent = match control.to_json() {
            Ok(json) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        shared.set_phase(&id, SessionPhase::Closed);
                        return;
                    }
                    result = send_bounded(&mut write, Message::Text(json), config.write_timeout) => result,
                }
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            error!("Session {} failed to send control message: {}", id, e);
            shared.set_phase(&id, SessionPhase::Errored);
            return;
        }
        debug!("Session {} sent control message {:?}", id, control);
    }

    sink.open.store(true, Ordering::Release);
    shared.set_phase(&id, SessionPhase::Open);

    if config.mode == CaptureMode::Local {
        match frames {
            Some(frames) => {
                let frame_sink: Arc<dyn FrameSink> = sink.clone();
                if let Err(e) = shared.sampler.start(frames, frame_sink).await {
                    error!("Session {} could not start sampler: {}", id, e);
                }
            }
            None => warn!("Session {} open without a camera; no frames will be sent", id),
        }
    }

    let throttler = LogThrottler::with_secs(5);
    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Best effort; a peer that stopped reading does not hold up teardown
                if send_bounded(&mut write, Message::Close(None), CLOSE_GRACE).await.is_err() {
                    debug!("Session {} closed without closing handshake", id);
                }
                break SessionPhase::Closed;
            }
            Some(text) = outbound.recv() => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break SessionPhase::Closed,
                    sent = send_bounded(&mut write, Message::Text(text), config.write_timeout) => {
                        if let Err(e) = sent {
                            error!("Session {} send failed: {}", id, e);
                            break SessionPhase::Errored;
                        }
                    }
                }
            }
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    apply_status(&shared, &throttler, StatusMessage::parse(&text));
                }
                Some(Ok(Message::Binary(data))) => {
                    apply_status(&shared, &throttler, StatusMessage::parse_bytes(&data));
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("Session {} closed by server: {:?}", id, frame);
                    break SessionPhase::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Session {} socket error: {}", id, e);
                    break SessionPhase::Errored;
                }
                None => break SessionPhase::Closed,
            },
        }
    };

    // Teardown order: no frames after this point, then report
    sink.open.store(false, Ordering::Release);
    shared.sampler.stop().await;
    shared.set_phase(&id, outcome);
}

/// Write one message, failing if the peer accepts nothing for `limit`
async fn send_bounded(write: &mut WsSink, message: Message, limit: Duration) -> Result<()> {
    match tokio::time::timeout(limit, write.send(message)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(AppError::Timeout(format!("socket write stalled for {:?}", limit))),
    }
}

fn apply_status(shared: &Shared, throttler: &LogThrottler, parsed: Result<StatusMessage>) {
    match parsed {
        Ok(msg) => {
            debug!("Status {} {:?}", msg.status, msg.counters);
            shared.reconciler.on_status(msg);
        }
        Err(e) => {
            warn_throttled!(throttler, "malformed_status", "Dropping inbound message: {}", e);
        }
    }
}
