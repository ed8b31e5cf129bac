//! Session WebSocket handler.
//!
//! One connection means one conversation. The socket is split into a sender
//! task (which assigns sequence numbers in send order) and a receive loop
//! that authenticates the hello, buffers uplink audio, and dispatches turns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{EnergyVad, VadConfig};
use crate::protocol::{
    self, ClientEvent, Envelope, SequenceGuard, Sequencer, ServerEvent, SessionOptions,
    WireSessionState,
};
use crate::state::AppState;
use crate::transcript::TranscriptStore;

use super::turn::{TurnContext, TurnInput, run_turn};

/// Channel capacity for outgoing messages; sized for audio bursts.
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// How often the receive loop checks for a stale connection.
const IDLE_CHECK_PERIOD: Duration = Duration::from_secs(30);

/// Maximum idle time before the connection is closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Cap on buffered uplink audio per turn (~2 minutes at 16 kHz PCM16).
const MAX_TURN_PCM_BYTES: usize = 2 * 60 * 16_000 * 2;

/// Messages queued for the sender task.
pub(crate) enum Route {
    /// JSON event with an ordered sequence number assigned at send time.
    Ordered(ServerEvent),
    /// JSON event with `seq == 0` (diagnostics).
    Unordered(ServerEvent),
    /// Raw binary audio frame.
    Audio(Bytes),
    /// Close the connection.
    Close,
}

/// Session WebSocket handler.
///
/// Upgrades the HTTP connection for duplex voice streaming. Clients must
/// send `client.hello` as their first message.
pub async fn session_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("session WebSocket upgrade requested");

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_session_socket(socket, state))
}

async fn handle_session_socket(socket: WebSocket, app_state: Arc<AppState>) {
    info!("session WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();
    let (message_tx, mut message_rx) = mpsc::channel::<Route>(CHANNEL_BUFFER_SIZE);

    // Sender task: the single writer, so sequence numbers match send order.
    let sender_task = tokio::spawn(async move {
        let sequencer = Sequencer::new();
        while let Some(route) = message_rx.recv().await {
            let should_close = matches!(route, Route::Close);

            let result = match route {
                Route::Ordered(event) => {
                    match protocol::encode(&Envelope::new(sequencer.next(), event)) {
                        Ok(json) => sender.send(Message::Text(json.into())).await,
                        Err(e) => {
                            error!(error = %e, "failed to serialize outgoing event");
                            continue;
                        }
                    }
                }
                Route::Unordered(event) => match protocol::encode(&Envelope::unordered(event)) {
                    Ok(json) => sender.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(error = %e, "failed to serialize outgoing event");
                        continue;
                    }
                },
                Route::Audio(data) => sender.send(Message::Binary(data)).await,
                Route::Close => {
                    info!("closing session WebSocket connection");
                    sender.send(Message::Close(None)).await
                }
            };

            if let Err(e) = result {
                error!(error = %e, "failed to send WebSocket message");
                break;
            }
            if should_close {
                break;
            }
        }
    });

    let mut conn = Connection::new(app_state.clone(), message_tx.clone());
    let mut last_activity = std::time::Instant::now();

    loop {
        select! {
            msg_result = receiver.next() => {
                last_activity = std::time::Instant::now();

                match msg_result {
                    Some(Ok(msg)) => {
                        if !conn.process_message(msg).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "session WebSocket error");
                        break;
                    }
                    None => {
                        info!("session WebSocket closed by client");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(IDLE_CHECK_PERIOD) => {
                if last_activity.elapsed() > IDLE_TIMEOUT {
                    warn!(
                        idle_secs = last_activity.elapsed().as_secs(),
                        "closing stale session connection"
                    );
                    let _ = message_tx
                        .send(Route::Unordered(ServerEvent::Error {
                            message: "connection closed due to inactivity".to_string(),
                        }))
                        .await;
                    break;
                }
                debug!("session idle check - still active");
            }
        }
    }

    conn.shutdown().await;
    sender_task.abort();
    info!("session WebSocket connection terminated");
}

/// Handle to an in-flight turn pipeline.
struct TurnHandle {
    cancel: CancellationToken,
    speaking: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Per-connection state.
struct Connection {
    app_state: Arc<AppState>,
    tx: mpsc::Sender<Route>,
    session_id: String,
    authed: bool,
    options: SessionOptions,
    guard: SequenceGuard,
    vad: EnergyVad,
    turn_pcm: Vec<u8>,
    dropped_turn_bytes: u64,
    transcript: Arc<TranscriptStore>,
    turn: Option<TurnHandle>,
}

impl Connection {
    fn new(app_state: Arc<AppState>, tx: mpsc::Sender<Route>) -> Self {
        Self {
            app_state,
            tx,
            session_id: uuid::Uuid::new_v4().to_string(),
            authed: false,
            options: SessionOptions::default(),
            guard: SequenceGuard::new(),
            vad: EnergyVad::new(VadConfig::default()),
            turn_pcm: Vec::new(),
            dropped_turn_bytes: 0,
            transcript: Arc::new(TranscriptStore::new()),
            turn: None,
        }
    }

    /// Process one incoming WebSocket message. Returns `false` to terminate
    /// the connection.
    async fn process_message(&mut self, msg: Message) -> bool {
        match msg {
            Message::Text(text) => {
                let envelope: Envelope<ClientEvent> = match protocol::decode(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "malformed client frame");
                        let _ = self
                            .tx
                            .send(Route::Unordered(ServerEvent::synthetic_error(&e)))
                            .await;
                        return true;
                    }
                };

                if let Err(e) = envelope.event.validate_size() {
                    warn!(error = %e, "client frame failed validation");
                    let _ = self
                        .tx
                        .send(Route::Unordered(ServerEvent::synthetic_error(&e)))
                        .await;
                    return true;
                }

                if !self.guard.observe(envelope.seq).should_apply() {
                    debug!(seq = envelope.seq, "dropped stale client event");
                    return true;
                }

                self.handle_event(envelope.event).await
            }
            Message::Binary(data) => {
                if !self.authed {
                    debug!("binary audio before hello, dropping");
                    return true;
                }
                self.ingest_audio(&data).await;
                true
            }
            Message::Ping(_) | Message::Pong(_) => true,
            Message::Close(_) => {
                info!("session close frame received");
                false
            }
        }
    }

    async fn handle_event(&mut self, event: ClientEvent) -> bool {
        // Only the hello is allowed before authentication.
        if !self.authed && !matches!(event, ClientEvent::Hello { .. }) {
            warn!("received message before hello, rejecting");
            let _ = self
                .tx
                .send(Route::Unordered(ServerEvent::Error {
                    message: "handshake required: send client.hello first".to_string(),
                }))
                .await;
            let _ = self.tx.send(Route::Close).await;
            return false;
        }

        match event {
            ClientEvent::Hello {
                credential,
                session_config,
            } => self.handle_hello(credential, session_config).await,

            ClientEvent::AudioChunk { data } => {
                match protocol::decode_audio(&data) {
                    Ok(pcm) => self.ingest_audio(&pcm).await,
                    Err(e) => {
                        let _ = self
                            .tx
                            .send(Route::Unordered(ServerEvent::synthetic_error(&e)))
                            .await;
                    }
                }
                true
            }

            ClientEvent::TurnComplete { transcribe_only } => {
                if self.turn_active() {
                    let _ = self
                        .tx
                        .send(Route::Ordered(ServerEvent::Error {
                            message: "a turn is already in flight".to_string(),
                        }))
                        .await;
                    return true;
                }
                let pcm = std::mem::take(&mut self.turn_pcm);
                if pcm.is_empty() {
                    debug!("turn completion without audio, ignoring");
                    return true;
                }
                self.spawn_turn(TurnInput::Audio {
                    pcm,
                    transcribe_only,
                });
                true
            }

            ClientEvent::TextTurn { text } => {
                if self.turn_active() {
                    let _ = self
                        .tx
                        .send(Route::Ordered(ServerEvent::Error {
                            message: "a turn is already in flight".to_string(),
                        }))
                        .await;
                    return true;
                }
                self.spawn_turn(TurnInput::Text(text));
                true
            }

            ClientEvent::SessionStop => {
                info!(session_id = %self.session_id, "client requested session stop");
                let _ = self
                    .tx
                    .send(Route::Ordered(ServerEvent::SessionState {
                        state: WireSessionState::Stopped,
                    }))
                    .await;
                let _ = self.tx.send(Route::Close).await;
                false
            }

            ClientEvent::Ping => {
                let _ = self.tx.send(Route::Unordered(ServerEvent::Pong)).await;
                true
            }
        }
    }

    async fn handle_hello(&mut self, credential: String, options: SessionOptions) -> bool {
        if self.authed {
            warn!("duplicate hello, ignoring");
            let _ = self
                .tx
                .send(Route::Unordered(ServerEvent::Error {
                    message: "session already configured".to_string(),
                }))
                .await;
            return true;
        }

        let accepted = match (&self.app_state.config.auth_token, credential.as_str()) {
            (_, "") => false,
            (Some(expected), given) => expected == given,
            (None, _) => true,
        };

        if !accepted {
            warn!("hello rejected: invalid credential");
            let _ = self
                .tx
                .send(Route::Unordered(ServerEvent::Error {
                    message: "invalid credential".to_string(),
                }))
                .await;
            let _ = self.tx.send(Route::Close).await;
            return false;
        }

        self.authed = true;
        self.options = options;
        info!(
            session_id = %self.session_id,
            binary_audio = self.options.binary_audio,
            "session authenticated"
        );

        let _ = self
            .tx
            .send(Route::Ordered(ServerEvent::SessionState {
                state: WireSessionState::Ready,
            }))
            .await;
        let _ = self
            .tx
            .send(Route::Ordered(ServerEvent::SessionState {
                state: WireSessionState::Listening,
            }))
            .await;
        true
    }

    /// Buffer one uplink frame and watch for barge-in while the assistant
    /// is speaking.
    async fn ingest_audio(&mut self, pcm: &[u8]) {
        let vad_result = self.vad.process_frame(pcm);

        if vad_result.speech_start
            && let Some(turn) = &self.turn
            && !turn.task.is_finished()
            && turn.speaking.load(Ordering::SeqCst)
        {
            info!(session_id = %self.session_id, "user speech during playback, stopping audio");
            turn.cancel.cancel();
            let _ = self
                .tx
                .send(Route::Ordered(ServerEvent::AudioStop {
                    reason: "barge_in".to_string(),
                }))
                .await;
        }

        // While a turn is running, frames only feed the detector; the next
        // utterance starts buffering once the turn finishes.
        if self.turn_active() {
            return;
        }

        self.turn_pcm.extend_from_slice(pcm);
        if self.turn_pcm.len() > MAX_TURN_PCM_BYTES {
            let excess = self.turn_pcm.len() - MAX_TURN_PCM_BYTES;
            self.turn_pcm.drain(..excess);
            self.dropped_turn_bytes += excess as u64;
        }
    }

    fn turn_active(&self) -> bool {
        self.turn
            .as_ref()
            .map(|turn| !turn.task.is_finished())
            .unwrap_or(false)
    }

    fn spawn_turn(&mut self, input: TurnInput) {
        let cancel = CancellationToken::new();
        let speaking = Arc::new(AtomicBool::new(false));

        let ctx = TurnContext {
            state: self.app_state.clone(),
            tx: self.tx.clone(),
            transcript: self.transcript.clone(),
            options: self.options.clone(),
            binary_audio: self.options.binary_audio,
            cancel: cancel.clone(),
            speaking: speaking.clone(),
        };

        let task = tokio::spawn(run_turn(ctx, input));
        self.turn = Some(TurnHandle {
            cancel,
            speaking,
            task,
        });
    }

    /// Best-effort cleanup when the socket ends.
    async fn shutdown(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.cancel.cancel();
            turn.task.abort();
        }

        if self.dropped_turn_bytes > 0 {
            debug!(
                dropped_bytes = self.dropped_turn_bytes,
                "uplink turn buffer overflowed during session"
            );
        }

        if self.app_state.config.summarize_on_close && !self.transcript.is_empty().await {
            match self.transcript.summarize(&self.app_state.chat).await {
                Ok(summary) => {
                    info!(session_id = %self.session_id, %summary, "conversation summary")
                }
                Err(e) => warn!(error = %e, "failed to summarize conversation"),
            }
        }
    }
}
