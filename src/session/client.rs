//! Duplex voice session controller.
//!
//! Owns the WebSocket connection to the gateway, the two bounded audio
//! queues with their drain timers, the sequence ordering guard, the safety
//! scanner tap, and the reconnection controller.
//!
//! # Thread Safety
//!
//! All mutable state lives behind `Arc` so the controller can be shared with
//! the spawned connection tasks. A generation counter tags every connection;
//! tasks from a superseded connection observe the mismatch and exit, which
//! makes `stop()` safe to call concurrently with an in-progress receive
//! callback.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::audio::{AudioFrame, AudioSink, EnergyVad, JitterBuffer, UplinkQueue};
use crate::draft::DraftReport;
use crate::guardrail::{self, EmergencyEvent, EmergencySeverity};
use crate::protocol::{
    self, ClientEvent, Envelope, SequenceGuard, Sequencer, ServerEvent, SessionOptions,
    TranscriptPayload, WireSessionState,
};
use crate::transcript::Role;

use super::{
    SessionError, SessionEvent, SessionEventCallback, SessionResult, SessionState,
    SessionTunables,
};

/// Channel capacity for outgoing WebSocket messages.
const WS_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Outgoing traffic queued for the writer task. Sequence numbers are
/// assigned by the writer itself so they always match send order.
enum Outgoing {
    Event(ClientEvent),
    Binary(Bytes),
}

/// Connection parameters stored only to support reconnection.
#[derive(Debug, Clone)]
struct ConnectParams {
    endpoint: String,
    credential: String,
    options: SessionOptions,
}

struct SessionShared {
    tunables: SessionTunables,
    sink: Arc<dyn AudioSink>,

    state: RwLock<SessionState>,
    connected: AtomicBool,
    muted: AtomicBool,
    turn_open: AtomicBool,
    turn_in_flight: AtomicBool,
    intentional_stop: AtomicBool,
    manual_reconnect: AtomicBool,
    binary_audio: AtomicBool,

    /// Incremented per connection; stale tasks observe the mismatch and exit.
    generation: AtomicU64,

    uplink: Mutex<UplinkQueue>,
    jitter: Mutex<JitterBuffer>,
    /// A playout cycle is live; cleared by finalization and barge-in.
    playing: AtomicBool,
    /// Arrival time of the most recent downlink frame.
    last_audio_rx: Mutex<Option<Instant>>,

    vad: Mutex<EnergyVad>,
    seq_guard: Mutex<SequenceGuard>,
    sequencer: Sequencer,
    send_errors: AtomicU32,

    ws_tx: Mutex<Option<mpsc::Sender<Outgoing>>>,
    cancel: Mutex<Option<CancellationToken>>,
    params: RwLock<Option<ConnectParams>>,

    event_cb: Mutex<Option<SessionEventCallback>>,
    emergency_seen: Mutex<HashSet<String>>,
    draft: Mutex<DraftReport>,
}

/// Client-side duplex voice session.
#[derive(Clone)]
pub struct VoiceSession {
    shared: Arc<SessionShared>,
}

impl VoiceSession {
    /// Create an idle session that will play downlink audio into `sink`.
    pub fn new(sink: Arc<dyn AudioSink>, tunables: SessionTunables) -> Self {
        let uplink = UplinkQueue::with_duration(tunables.uplink_max_ms, tunables.frame_ms);
        let jitter = JitterBuffer::with_duration(
            tunables.downlink_max_ms,
            tunables.prebuffer_ms,
            tunables.frame_ms,
        );
        let vad = EnergyVad::new(tunables.vad.clone());

        Self {
            shared: Arc::new(SessionShared {
                tunables,
                sink,
                state: RwLock::new(SessionState::Idle),
                connected: AtomicBool::new(false),
                muted: AtomicBool::new(false),
                turn_open: AtomicBool::new(false),
                turn_in_flight: AtomicBool::new(false),
                intentional_stop: AtomicBool::new(false),
                manual_reconnect: AtomicBool::new(false),
                binary_audio: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                uplink: Mutex::new(uplink),
                jitter: Mutex::new(jitter),
                playing: AtomicBool::new(false),
                last_audio_rx: Mutex::new(None),
                vad: Mutex::new(vad),
                seq_guard: Mutex::new(SequenceGuard::new()),
                sequencer: Sequencer::new(),
                send_errors: AtomicU32::new(0),
                ws_tx: Mutex::new(None),
                cancel: Mutex::new(None),
                params: RwLock::new(None),
                event_cb: Mutex::new(None),
                emergency_seen: Mutex::new(HashSet::new()),
                draft: Mutex::new(DraftReport::new()),
            }),
        }
    }

    /// Register the caller's event callback. This is the only channel through
    /// which downstream UI should observe session health.
    pub async fn on_event(&self, callback: SessionEventCallback) {
        *self.shared.event_cb.lock().await = Some(callback);
    }

    /// Open the session: dial the gateway, register the receive loop, and
    /// send the hello handshake.
    ///
    /// Calling `start` while a session is active is a no-op with a logged
    /// warning, not an error.
    pub async fn start(
        &self,
        endpoint: &str,
        credential: &str,
        options: SessionOptions,
    ) -> SessionResult<()> {
        let shared = &self.shared;

        if shared.state.read().await.is_active() {
            warn!("start called while session is active, ignoring");
            return Ok(());
        }

        // The backend rejects empty credentials; fail before dialing.
        if credential.is_empty() {
            set_state(shared, SessionState::Error).await;
            emit(
                shared,
                SessionEvent::Error {
                    message: SessionError::EmptyCredential.to_string(),
                },
            )
            .await;
            return Err(SessionError::EmptyCredential);
        }

        let parsed =
            Url::parse(endpoint).map_err(|e| SessionError::InvalidEndpoint(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SessionError::InvalidEndpoint(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        shared.intentional_stop.store(false, Ordering::SeqCst);
        shared.manual_reconnect.store(false, Ordering::SeqCst);
        shared
            .binary_audio
            .store(options.binary_audio, Ordering::SeqCst);

        let params = ConnectParams {
            endpoint: endpoint.to_string(),
            credential: credential.to_string(),
            options,
        };
        *shared.params.write().await = Some(params.clone());

        set_state(shared, SessionState::Connecting).await;

        let ws = match open_transport(endpoint, shared.tunables.connect_timeout_ms).await {
            Ok(ws) => ws,
            Err(e) => {
                set_state(shared, SessionState::Error).await;
                emit(
                    shared,
                    SessionEvent::Error {
                        message: e.to_string(),
                    },
                )
                .await;
                return Err(e);
            }
        };

        establish_connection(shared, ws).await;
        send_hello(shared, &params).await?;
        info!(endpoint, "session started");
        Ok(())
    }

    /// Feed one captured microphone frame (PCM16LE mono 16 kHz).
    ///
    /// Frames are only queued for uplink while the server is listening and
    /// the microphone is not muted; anything else is silently dropped. The
    /// local detector always sees the frame so barge-in and silence-based
    /// turn completion work regardless.
    pub async fn send_audio(&self, pcm: Bytes) {
        let shared = &self.shared;
        let vad_result = shared.vad.lock().await.process_frame(&pcm);
        let state = *shared.state.read().await;

        if vad_result.speech_start && state == SessionState::Speaking {
            info!("local speech detected during playback, barging in");
            barge_in(shared, "local_vad").await;
        }
        if vad_result.speech_end && shared.turn_open.load(Ordering::SeqCst) {
            debug!("silence confirmed, completing turn");
            self.send_turn_complete().await;
            return;
        }

        if state != SessionState::Listening
            || shared.muted.load(Ordering::SeqCst)
            || !shared.connected.load(Ordering::SeqCst)
        {
            trace!(%state, "uplink frame dropped");
            return;
        }

        shared.turn_open.store(true, Ordering::SeqCst);
        shared.uplink.lock().await.push(AudioFrame::new(pcm));
    }

    /// Signal end-of-utterance. Idempotent per utterance: explicit
    /// mute-to-talk and silence-based auto-detection may both call this.
    pub async fn send_turn_complete(&self) {
        let shared = &self.shared;
        if !shared.turn_open.swap(false, Ordering::SeqCst) {
            debug!("turn already completed, ignoring");
            return;
        }

        // Push out whatever the drain timer has not sent yet so the server
        // transcribes the full utterance.
        let backlog = shared.uplink.lock().await.drain_all();
        for frame in backlog {
            if let Err(e) = send_uplink_frame(shared, frame).await {
                debug!(error = %e, "failed to flush uplink frame");
                break;
            }
        }

        shared.turn_in_flight.store(true, Ordering::SeqCst);
        shared.emergency_seen.lock().await.clear();

        if let Err(e) = send_event(
            shared,
            ClientEvent::TurnComplete {
                transcribe_only: false,
            },
        )
        .await
        {
            warn!(error = %e, "failed to send turn completion");
        }
    }

    /// Submit a text turn instead of audio. Rejected while a turn is already
    /// in flight: at most one in-flight turn per session.
    pub async fn send_text(&self, text: &str) -> SessionResult<()> {
        let shared = &self.shared;
        if !shared.connected.load(Ordering::SeqCst) {
            return Err(SessionError::NotConnected);
        }
        if shared.turn_in_flight.swap(true, Ordering::SeqCst) {
            return Err(SessionError::TurnInFlight);
        }

        shared.emergency_seen.lock().await.clear();

        send_event(
            shared,
            ClientEvent::TextTurn {
                text: text.to_string(),
            },
        )
        .await
        .inspect_err(|_| {
            shared.turn_in_flight.store(false, Ordering::SeqCst);
        })
    }

    /// Tear the session down. Safe to call from any state; every release
    /// step is best-effort with failures logged, never re-thrown.
    pub async fn stop(&self) {
        let shared = &self.shared;
        info!("stopping session");

        shared.intentional_stop.store(true, Ordering::SeqCst);
        shared.generation.fetch_add(1, Ordering::SeqCst);

        if shared.connected.load(Ordering::SeqCst)
            && let Err(e) = send_event(shared, ClientEvent::SessionStop).await
        {
            debug!(error = %e, "failed to send stop event");
        }

        if let Some(cancel) = shared.cancel.lock().await.take() {
            cancel.cancel();
        }
        *shared.ws_tx.lock().await = None;
        shared.connected.store(false, Ordering::SeqCst);

        shared.uplink.lock().await.clear();
        shared.jitter.lock().await.clear();
        shared.playing.store(false, Ordering::SeqCst);
        shared.turn_open.store(false, Ordering::SeqCst);
        shared.turn_in_flight.store(false, Ordering::SeqCst);

        if let Err(e) = shared.sink.stop().await {
            warn!(error = %e, "audio sink failed to stop");
        }

        set_state(shared, SessionState::Stopped).await;
    }

    /// Mute or unmute the microphone (push-to-talk). Muted frames are an
    /// expected drop, not an error.
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> SessionState {
        *self.shared.state.read().await
    }

    /// Set after reconnection attempts are exhausted; the caller may then
    /// `start` again with the same parameters.
    pub fn manual_reconnect_available(&self) -> bool {
        self.shared.manual_reconnect.load(Ordering::SeqCst)
    }

    /// Snapshot of the session's draft report.
    pub async fn draft(&self) -> DraftReport {
        self.shared.draft.lock().await.clone()
    }

    /// Uplink frames evicted by backpressure so far.
    pub async fn uplink_dropped(&self) -> u64 {
        self.shared.uplink.lock().await.dropped()
    }

    /// Downlink frames evicted by backpressure so far.
    pub async fn downlink_dropped(&self) -> u64 {
        self.shared.jitter.lock().await.dropped()
    }

    /// Sequence gaps observed on this connection.
    pub async fn sequence_gaps(&self) -> u64 {
        self.shared.seq_guard.lock().await.gaps()
    }
}

// =============================================================================
// Transport
// =============================================================================

async fn open_transport(endpoint: &str, timeout_ms: u64) -> SessionResult<WsStream> {
    match tokio::time::timeout(
        Duration::from_millis(timeout_ms),
        tokio_tungstenite::connect_async(endpoint),
    )
    .await
    {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(SessionError::Transport(e.to_string())),
        Err(_) => Err(SessionError::ConnectTimeout(timeout_ms)),
    }
}

/// Wire a fresh transport into the session: new generation, new channel,
/// fresh ordering state, and the four connection tasks.
async fn establish_connection(shared: &Arc<SessionShared>, ws: WsStream) {
    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

    let cancel = CancellationToken::new();
    if let Some(old) = shared.cancel.lock().await.replace(cancel.clone()) {
        old.cancel();
    }

    let (ws_sink, ws_source) = ws.split();
    let (tx, rx) = mpsc::channel::<Outgoing>(WS_CHANNEL_CAPACITY);
    *shared.ws_tx.lock().await = Some(tx);

    shared.sequencer.reset();
    shared.seq_guard.lock().await.reset();
    shared.send_errors.store(0, Ordering::SeqCst);
    // Prior queue contents are stale by definition; never replay them.
    shared.uplink.lock().await.clear();
    shared.jitter.lock().await.clear();
    shared.playing.store(false, Ordering::SeqCst);
    *shared.last_audio_rx.lock().await = None;
    shared.turn_open.store(false, Ordering::SeqCst);
    shared.turn_in_flight.store(false, Ordering::SeqCst);
    shared.vad.lock().await.reset();

    shared.connected.store(true, Ordering::SeqCst);

    tokio::spawn(run_writer(shared.clone(), ws_sink, rx, cancel.clone()));
    tokio::spawn(run_receive_loop(
        shared.clone(),
        ws_source,
        generation,
        cancel.clone(),
    ));
    tokio::spawn(run_uplink_drain(shared.clone(), generation, cancel.clone()));
    tokio::spawn(run_downlink_drain(shared.clone(), generation, cancel));
}

async fn send_hello(shared: &Arc<SessionShared>, params: &ConnectParams) -> SessionResult<()> {
    send_event(
        shared,
        ClientEvent::Hello {
            credential: params.credential.clone(),
            session_config: params.options.clone(),
        },
    )
    .await
}

async fn send_event(shared: &Arc<SessionShared>, event: ClientEvent) -> SessionResult<()> {
    send_outgoing(shared, Outgoing::Event(event)).await
}

async fn send_outgoing(shared: &Arc<SessionShared>, outgoing: Outgoing) -> SessionResult<()> {
    let tx = shared.ws_tx.lock().await.clone();
    match tx {
        Some(tx) => tx
            .send(outgoing)
            .await
            .map_err(|_| SessionError::NotConnected),
        None => Err(SessionError::NotConnected),
    }
}

async fn send_uplink_frame(shared: &Arc<SessionShared>, frame: AudioFrame) -> SessionResult<()> {
    if shared.binary_audio.load(Ordering::SeqCst) {
        send_outgoing(shared, Outgoing::Binary(frame.data)).await
    } else {
        send_event(
            shared,
            ClientEvent::AudioChunk {
                data: protocol::encode_audio(&frame.data),
            },
        )
        .await
    }
}

// =============================================================================
// Connection Tasks
// =============================================================================

/// Pump queued outgoing messages into the WebSocket sink, tracking
/// consecutive send failures for the uplink drop policy.
async fn run_writer(
    shared: Arc<SessionShared>,
    mut ws_sink: WsSink,
    mut rx: mpsc::Receiver<Outgoing>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outgoing = rx.recv() => {
                let Some(outgoing) = outgoing else { break };
                let message = match outgoing {
                    Outgoing::Event(event) => {
                        let envelope = Envelope::new(shared.sequencer.next(), event);
                        match protocol::encode(&envelope) {
                            Ok(json) => Message::Text(json.into()),
                            Err(e) => {
                                warn!(error = %e, "failed to serialize outgoing event");
                                continue;
                            }
                        }
                    }
                    Outgoing::Binary(data) => Message::Binary(data),
                };

                match ws_sink.send(message).await {
                    Ok(()) => {
                        shared.send_errors.store(0, Ordering::SeqCst);
                    }
                    Err(e) => {
                        shared.send_errors.fetch_add(1, Ordering::SeqCst);
                        debug!(error = %e, "websocket send failed");
                    }
                }
            }
        }
    }
    let _ = ws_sink.close().await;
}

/// Read server frames, enforce ordering, and apply events. When the
/// transport drops and the session is still logically active, hand over to
/// the reconnection controller.
async fn run_receive_loop(
    shared: Arc<SessionShared>,
    mut source: WsSource,
    generation: u64,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            message = source.next() => {
                if shared.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match protocol::decode::<ServerEvent>(&text) {
                            Ok(envelope) => {
                                let decision =
                                    shared.seq_guard.lock().await.observe(envelope.seq);
                                if decision.should_apply() {
                                    handle_server_event(&shared, envelope.event).await;
                                } else {
                                    trace!(seq = envelope.seq, "dropped stale event");
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "malformed server frame");
                                handle_server_event(&shared, ServerEvent::synthetic_error(&e))
                                    .await;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        handle_downlink_audio(&shared, Bytes::from(data)).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("server closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket receive error");
                        break;
                    }
                    None => {
                        info!("websocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);

    if shared.intentional_stop.load(Ordering::SeqCst)
        || shared.generation.load(Ordering::SeqCst) != generation
        || !shared.state.read().await.is_active()
    {
        return;
    }

    run_reconnect_loop(&shared).await;
}

/// Drain the uplink queue on the frame timer. Single-flight: sends complete
/// before the next tick's batch is taken.
async fn run_uplink_drain(
    shared: Arc<SessionShared>,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(shared.tunables.frame_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if shared.generation.load(Ordering::SeqCst) != generation {
                    break;
                }

                if shared.send_errors.load(Ordering::SeqCst)
                    >= shared.tunables.send_error_threshold
                {
                    let mut queue = shared.uplink.lock().await;
                    let backlog = queue.len();
                    queue.clear();
                    drop(queue);
                    shared.send_errors.store(0, Ordering::SeqCst);
                    warn!(backlog, "dropped uplink backlog after repeated send failures");
                    continue;
                }

                // One frame per tick normally; flush everything when the
                // queue is completely full so latency does not compound.
                let batch = {
                    let mut queue = shared.uplink.lock().await;
                    if queue.is_full() {
                        queue.drain_all()
                    } else {
                        queue.pop().into_iter().collect::<Vec<_>>()
                    }
                };

                for frame in batch {
                    if let Err(e) = send_uplink_frame(&shared, frame).await {
                        trace!(error = %e, "uplink frame send failed");
                        break;
                    }
                }
            }
        }
    }
}

/// Drain the jitter buffer on the frame timer and watch the downlink
/// silence window. Feeding the sink is fire-and-forget so a slow audio
/// backend cannot stall the timer.
async fn run_downlink_drain(
    shared: Arc<SessionShared>,
    generation: u64,
    cancel: CancellationToken,
) {
    let silence_window = Duration::from_millis(shared.tunables.silence_finalize_ms);
    let mut ticker = tokio::time::interval(Duration::from_millis(shared.tunables.frame_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if shared.generation.load(Ordering::SeqCst) != generation {
                    break;
                }

                let silence_elapsed = {
                    let last = shared.last_audio_rx.lock().await;
                    last.map(|at| at.elapsed() >= silence_window).unwrap_or(false)
                };
                if shared.playing.load(Ordering::SeqCst) && silence_elapsed {
                    finalize_playback(&shared).await;
                }

                let frame = shared.jitter.lock().await.pop();
                if let Some(frame) = frame {
                    let sink = shared.sink.clone();
                    tokio::spawn(async move {
                        if let Err(e) = sink.write(frame.data).await {
                            warn!(error = %e, "audio sink write failed");
                        }
                    });
                }
            }
        }
    }
}

/// Reconnect with exponential backoff, reusing the stored connection
/// parameters. Exhausting the attempt cap is fatal.
///
/// Returns a boxed future with an explicit `Send` bound. This function sits on
/// the `establish -> receive -> reconnect` cycle; giving it a concrete
/// (non-opaque) future type breaks the otherwise-infinite auto-trait inference
/// that would leave `run_receive_loop` unable to prove `Send`.
fn run_reconnect_loop<'a>(
    shared: &'a Arc<SessionShared>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let Some(params) = shared.params.read().await.clone() else {
            return;
        };
        let config = shared.tunables.reconnect.clone();

        set_state(shared, SessionState::Reconnecting).await;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !config.should_attempt(attempt) {
                warn!(
                    attempts = config.max_attempts,
                    "reconnection attempts exhausted"
                );
                shared.manual_reconnect.store(true, Ordering::SeqCst);
                set_state(shared, SessionState::Error).await;
                emit(
                    shared,
                    SessionEvent::ReconnectExhausted {
                        attempts: config.max_attempts,
                    },
                )
                .await;
                return;
            }

            let delay = config.delay_for(attempt);
            info!(
                attempt,
                max = config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::time::sleep(delay).await;

            if shared.intentional_stop.load(Ordering::SeqCst) {
                debug!("stop requested during reconnect delay");
                return;
            }

            match open_transport(&params.endpoint, shared.tunables.connect_timeout_ms).await {
                Ok(ws) => {
                    info!(attempt, "reconnected, re-running handshake");
                    establish_connection(shared, ws).await;
                    if let Err(e) = send_hello(shared, &params).await {
                        warn!(error = %e, "handshake failed after reconnect");
                    }
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
    })
}

// =============================================================================
// Event Application
// =============================================================================

async fn handle_server_event(shared: &Arc<SessionShared>, event: ServerEvent) {
    match event {
        ServerEvent::SessionState { state } => {
            let next = match state {
                WireSessionState::Ready | WireSessionState::Listening => {
                    shared.turn_in_flight.store(false, Ordering::SeqCst);
                    SessionState::Listening
                }
                WireSessionState::Thinking => SessionState::Thinking,
                WireSessionState::Speaking => SessionState::Speaking,
                WireSessionState::Stopped => SessionState::Stopped,
            };
            set_state(shared, next).await;
        }

        ServerEvent::UserTranscriptPartial(payload) => {
            handle_transcript(shared, Role::User, payload, false).await;
        }
        ServerEvent::UserTranscriptFinal(payload) => {
            handle_transcript(shared, Role::User, payload, true).await;
        }
        ServerEvent::AssistantTranscriptPartial(payload) => {
            handle_transcript(shared, Role::Assistant, payload, false).await;
        }
        ServerEvent::AssistantTranscriptFinal(payload) => {
            // Text completion never finalizes playback; audio may still be
            // streaming after the text is fully known.
            handle_transcript(shared, Role::Assistant, payload, true).await;
        }

        ServerEvent::AudioOut { data } => match protocol::decode_audio(&data) {
            Ok(pcm) => handle_downlink_audio(shared, Bytes::from(pcm)).await,
            Err(e) => {
                warn!(error = %e, "undecodable downlink audio");
                emit(
                    shared,
                    SessionEvent::Error {
                        message: e.to_string(),
                    },
                )
                .await;
            }
        },

        ServerEvent::AudioStop { reason } => {
            barge_in(shared, &reason).await;
        }

        ServerEvent::TriageEmergency {
            severity,
            banner,
            interrupt,
            utterance_id,
        } => {
            let severity = match severity.as_str() {
                "critical" => EmergencySeverity::Critical,
                "urgent" => EmergencySeverity::Urgent,
                _ => EmergencySeverity::Advisory,
            };
            let key = utterance_id.unwrap_or_else(|| format!("triage:{banner}"));
            report_emergency(
                shared,
                key,
                EmergencyEvent {
                    severity,
                    interrupt,
                    banner,
                },
            )
            .await;
        }

        ServerEvent::ReportPatch { patch } => {
            shared.draft.lock().await.apply_patch(&patch);
            emit(shared, SessionEvent::ReportPatch(patch)).await;
        }

        ServerEvent::Error { message } => {
            warn!(%message, "server reported error");
            emit(shared, SessionEvent::Error { message }).await;
        }

        ServerEvent::Pong => {
            trace!("pong received");
        }
    }
}

/// Tap every transcript fragment through the safety scanner, then forward
/// it to the caller.
async fn handle_transcript(
    shared: &Arc<SessionShared>,
    role: Role,
    payload: TranscriptPayload,
    is_final: bool,
) {
    if let Some(emergency) = guardrail::scan(&payload.text) {
        let key = payload
            .utterance_id
            .clone()
            .unwrap_or_else(|| format!("{role}:turn"));
        report_emergency(shared, key, emergency).await;
    }

    emit(
        shared,
        SessionEvent::Transcript {
            role,
            text: payload.text,
            is_final,
        },
    )
    .await;
}

/// Surface an emergency exactly once per utterance, interrupting playback
/// first when the severity demands it.
async fn report_emergency(shared: &Arc<SessionShared>, key: String, event: EmergencyEvent) {
    if !shared.emergency_seen.lock().await.insert(key) {
        return;
    }
    if event.interrupt {
        barge_in(shared, "emergency").await;
    }
    emit(shared, SessionEvent::Emergency(event)).await;
}

async fn handle_downlink_audio(shared: &Arc<SessionShared>, pcm: Bytes) {
    *shared.last_audio_rx.lock().await = Some(Instant::now());
    shared.playing.store(true, Ordering::SeqCst);
    shared.jitter.lock().await.push(AudioFrame::new(pcm));
}

/// Immediately clear the downlink buffer and stop the output device. Runs
/// to completion before the caller processes anything else, so no new audio
/// is accepted mid-interrupt.
async fn barge_in(shared: &Arc<SessionShared>, reason: &str) {
    info!(reason, "interrupting playback");
    shared.jitter.lock().await.clear();
    shared.playing.store(false, Ordering::SeqCst);
    if let Err(e) = shared.sink.stop().await {
        warn!(error = %e, "audio sink failed to stop during interrupt");
    }
}

/// Finalize a playout cycle after the downlink silence window elapsed.
/// Guarded so exactly one finalize runs per cycle.
async fn finalize_playback(shared: &Arc<SessionShared>) {
    if !shared.playing.swap(false, Ordering::SeqCst) {
        return;
    }
    info!("downlink silence window elapsed, finalizing playback");

    shared.jitter.lock().await.clear();

    let sink = shared.sink.clone();
    tokio::spawn(async move {
        if let Err(e) = sink.stop().await {
            warn!(error = %e, "audio sink failed to stop");
        }
    });

    if *shared.state.read().await == SessionState::Speaking {
        set_state(shared, SessionState::Listening).await;
    }
}

// =============================================================================
// Notifications
// =============================================================================

async fn set_state(shared: &Arc<SessionShared>, next: SessionState) {
    {
        let mut state = shared.state.write().await;
        if *state == next {
            return;
        }
        debug!(from = %*state, to = %next, "session state changed");
        *state = next;
    }
    emit(shared, SessionEvent::StateChanged(next)).await;
}

async fn emit(shared: &Arc<SessionShared>, event: SessionEvent) {
    let callback = shared.event_cb.lock().await.clone();
    if let Some(callback) = callback {
        callback(event).await;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct NullSink;

    #[async_trait]
    impl AudioSink for NullSink {
        async fn write(&self, _frame: Bytes) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn session() -> VoiceSession {
        VoiceSession::new(Arc::new(NullSink), SessionTunables::default())
    }

    #[tokio::test]
    async fn test_empty_credential_fails_without_dialing() {
        let session = session();
        // An unroutable endpoint: a connection attempt would surface a
        // transport error, not a credential error.
        let result = session
            .start("ws://127.0.0.1:1/v1/session", "", SessionOptions::default())
            .await;

        assert!(matches!(result, Err(SessionError::EmptyCredential)));
        assert_eq!(session.state().await, SessionState::Error);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_rejected() {
        let session = session();
        let result = session
            .start("not a url", "tok", SessionOptions::default())
            .await;
        assert!(matches!(result, Err(SessionError::InvalidEndpoint(_))));

        let result = session
            .start("https://example.com", "tok", SessionOptions::default())
            .await;
        assert!(matches!(result, Err(SessionError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn test_send_text_requires_connection() {
        let session = session();
        assert!(matches!(
            session.send_text("hello").await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_turn_complete_is_noop_without_open_turn() {
        let session = session();
        // No frames accepted, so no utterance is open; must not mark a turn
        // in flight.
        session.send_turn_complete().await;
        assert!(!session.shared.turn_in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_audio_dropped_when_not_listening() {
        let session = session();
        session.send_audio(Bytes::from(vec![0u8; 640])).await;
        assert!(session.shared.uplink.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_mute_toggle() {
        let session = session();
        assert!(!session.is_muted());
        session.set_muted(true);
        assert!(session.is_muted());
    }

    #[tokio::test]
    async fn test_stop_is_safe_from_idle() {
        let session = session();
        session.stop().await;
        assert_eq!(session.state().await, SessionState::Stopped);
        // And again: stop from Stopped is still safe.
        session.stop().await;
        assert_eq!(session.state().await, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_barge_in_clears_jitter_buffer() {
        let session = session();
        {
            let mut jitter = session.shared.jitter.lock().await;
            for i in 0..8u8 {
                jitter.push(AudioFrame::new(Bytes::from(vec![i; 4])));
            }
        }
        barge_in(&session.shared, "test").await;

        let mut jitter = session.shared.jitter.lock().await;
        assert!(jitter.is_empty());
        assert!(jitter.pop().is_none());
    }

    #[tokio::test]
    async fn test_emergency_deduplicated_per_utterance() {
        let session = session();
        let payload = TranscriptPayload {
            text: "I can't breathe".to_string(),
            utterance_id: Some("u1".to_string()),
            emotion: None,
        };

        let events: Arc<Mutex<Vec<SessionEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        session
            .on_event(Arc::new(move |event| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.lock().await.push(event);
                })
            }))
            .await;

        // Model transcript and fallback recognizer both report the same
        // utterance.
        handle_transcript(&session.shared, Role::User, payload.clone(), false).await;
        handle_transcript(&session.shared, Role::User, payload, true).await;

        let events = events.lock().await;
        let emergencies = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Emergency(_)))
            .count();
        assert_eq!(emergencies, 1);
        let transcripts = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Transcript { .. }))
            .count();
        assert_eq!(transcripts, 2);
    }

    #[tokio::test]
    async fn test_report_patch_merges_into_draft() {
        let session = session();
        handle_server_event(
            &session.shared,
            ServerEvent::ReportPatch {
                patch: serde_json::json!({"reaction": {"symptoms": ["hives"]}}),
            },
        )
        .await;
        handle_server_event(
            &session.shared,
            ServerEvent::ReportPatch {
                patch: serde_json::json!({"reaction": {"onset": "10 minutes"}}),
            },
        )
        .await;

        let draft = session.draft().await;
        assert!(draft.criteria.has_symptoms);
        assert!(draft.criteria.has_onset);
        assert_eq!(
            draft.document["reaction"]["symptoms"],
            serde_json::json!(["hives"])
        );
    }

    #[tokio::test]
    async fn test_stale_events_dropped_by_guard() {
        let session = session();
        let mut guard = session.shared.seq_guard.lock().await;
        assert!(guard.observe(1).should_apply());
        assert!(guard.observe(4).should_apply());
        assert!(!guard.observe(3).should_apply());
        drop(guard);
        assert_eq!(session.sequence_gaps().await, 1);
    }

    #[tokio::test]
    async fn test_finalize_runs_once_per_cycle() {
        let session = session();
        handle_downlink_audio(&session.shared, Bytes::from(vec![0u8; 4])).await;
        assert!(session.shared.playing.load(Ordering::SeqCst));

        finalize_playback(&session.shared).await;
        assert!(!session.shared.playing.load(Ordering::SeqCst));
        assert!(session.shared.jitter.lock().await.is_empty());

        // Second finalize without new audio is a no-op.
        finalize_playback(&session.shared).await;
        assert!(!session.shared.playing.load(Ordering::SeqCst));

        // A frame arriving afterwards starts a fresh cycle.
        handle_downlink_audio(&session.shared, Bytes::from(vec![0u8; 4])).await;
        assert!(session.shared.playing.load(Ordering::SeqCst));
        assert!(session.shared.jitter.lock().await.is_prebuffering());
    }
}
