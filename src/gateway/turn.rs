//! Per-turn pipeline: ASR, guardrail triage, chat completion, TTS streaming.
//!
//! One turn runs as its own task so the receive loop stays responsive for
//! barge-in. The pipeline announces `thinking` and `speaking` state
//! transitions on the wire and returns the session to `listening` on every
//! exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{DOWNLINK_SAMPLE_RATE, FRAME_MS, frame_bytes};
use crate::guardrail;
use crate::protocol::{self, ServerEvent, SessionOptions, TranscriptPayload, WireSessionState};
use crate::state::AppState;
use crate::transcript::{IdempotencyKey, Role, TranscriptStore};
use crate::workers::{ChatMessage, tts};

use super::handler::Route;

/// Fallback system prompt when the hello carried no instructions.
const DEFAULT_INSTRUCTIONS: &str =
    "You are a helpful voice assistant. Keep responses short and conversational. \
     When the user reports details of an allergic reaction, include a fenced \
     ```json block with a partial report patch using the keys reaction, \
     exposure, and outcome.";

/// Audio frames are streamed slightly faster than real time so the client's
/// jitter buffer stays fed without building unbounded backlog.
const STREAM_PACE: Duration = Duration::from_millis(FRAME_MS / 2);

static REPORT_PATCH_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").expect("regex must compile"));

/// Input for one turn.
pub(crate) enum TurnInput {
    Audio { pcm: Vec<u8>, transcribe_only: bool },
    Text(String),
}

/// Everything a turn task needs from its connection.
pub(crate) struct TurnContext {
    pub state: Arc<AppState>,
    pub tx: mpsc::Sender<Route>,
    pub transcript: Arc<TranscriptStore>,
    pub options: SessionOptions,
    pub binary_audio: bool,
    pub cancel: CancellationToken,
    /// Set while TTS frames are streaming; the receive loop reads it to
    /// decide whether local speech is a barge-in.
    pub speaking: Arc<AtomicBool>,
}

impl TurnContext {
    async fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(Route::Ordered(event)).await;
    }

    async fn set_wire_state(&self, state: WireSessionState) {
        self.send(ServerEvent::SessionState { state }).await;
    }
}

/// Run one conversational turn to completion.
pub(crate) async fn run_turn(ctx: TurnContext, input: TurnInput) {
    ctx.set_wire_state(WireSessionState::Thinking).await;

    // --- Speech recognition ---------------------------------------------
    let (user_text, transcribe_only) = match input {
        TurnInput::Text(text) => (text, false),
        TurnInput::Audio {
            pcm,
            transcribe_only,
        } => match ctx.state.asr.transcribe_pcm(&pcm).await {
            Ok(text) => (text, transcribe_only),
            Err(e) => {
                warn!(error = %e, "transcription failed");
                ctx.send(ServerEvent::Error {
                    message: format!("transcription failed: {e}"),
                })
                .await;
                ctx.set_wire_state(WireSessionState::Listening).await;
                return;
            }
        },
    };

    if user_text.is_empty() {
        debug!("empty transcript, ending turn");
        ctx.set_wire_state(WireSessionState::Listening).await;
        return;
    }

    let utterance_id = uuid::Uuid::new_v4().to_string();
    ctx.send(ServerEvent::UserTranscriptFinal(TranscriptPayload {
        text: user_text.clone(),
        utterance_id: Some(utterance_id.clone()),
        emotion: None,
    }))
    .await;

    // Guardrail triage taps the transcript before anything else consumes it.
    if let Some(emergency) = guardrail::scan(&user_text) {
        info!(severity = %emergency.severity, "guardrail triage triggered");
        ctx.send(ServerEvent::TriageEmergency {
            severity: emergency.severity.to_string(),
            banner: emergency.banner,
            interrupt: emergency.interrupt,
            utterance_id: Some(utterance_id.clone()),
        })
        .await;
    }

    ctx.transcript
        .append(
            Role::User,
            user_text.clone(),
            IdempotencyKey::new(utterance_id, ctx.transcript.next_counter()),
        )
        .await;

    if transcribe_only {
        ctx.set_wire_state(WireSessionState::Listening).await;
        return;
    }

    // --- Chat completion ------------------------------------------------
    let reply = match complete_reply(&ctx).await {
        Ok(reply) => reply,
        Err(message) => {
            ctx.send(ServerEvent::Error { message }).await;
            ctx.set_wire_state(WireSessionState::Listening).await;
            return;
        }
    };

    let (spoken, patch) = extract_report_patch(&reply);
    if let Some(patch) = patch {
        ctx.send(ServerEvent::ReportPatch { patch }).await;
    }

    let assistant_utterance = uuid::Uuid::new_v4().to_string();
    ctx.send(ServerEvent::AssistantTranscriptFinal(TranscriptPayload {
        text: spoken.clone(),
        utterance_id: Some(assistant_utterance.clone()),
        emotion: None,
    }))
    .await;
    ctx.transcript
        .append(
            Role::Assistant,
            spoken.clone(),
            IdempotencyKey::new(assistant_utterance, ctx.transcript.next_counter()),
        )
        .await;

    if ctx.cancel.is_cancelled() {
        ctx.set_wire_state(WireSessionState::Listening).await;
        return;
    }

    // --- Synthesis ------------------------------------------------------
    let pcm = match ctx.state.tts.synthesize(&spoken).await {
        Ok(pcm) => pcm,
        Err(e) => match ctx.state.config.tts_fallback_silence_ms {
            Some(ms) => {
                warn!(error = %e, fallback_ms = ms, "synthesis failed, sending silence");
                tts::silence(ms)
            }
            None => {
                warn!(error = %e, "synthesis failed");
                ctx.send(ServerEvent::Error {
                    message: format!("synthesis failed: {e}"),
                })
                .await;
                ctx.set_wire_state(WireSessionState::Listening).await;
                return;
            }
        },
    };

    ctx.set_wire_state(WireSessionState::Speaking).await;
    ctx.speaking.store(true, Ordering::SeqCst);
    stream_audio(&ctx, &pcm).await;
    ctx.speaking.store(false, Ordering::SeqCst);

    ctx.set_wire_state(WireSessionState::Listening).await;
}

async fn complete_reply(ctx: &TurnContext) -> Result<String, String> {
    let mut system = ctx
        .options
        .instructions
        .clone()
        .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string());
    if let Some(tone) = &ctx.options.tone {
        system.push_str(&format!("\nRespond in a {tone} tone."));
    }

    let mut messages = vec![ChatMessage::system(system)];
    messages.extend(ctx.transcript.as_chat_messages().await);

    ctx.state
        .chat
        .complete(&messages)
        .await
        .map_err(|e| format!("completion failed: {e}"))
}

/// Stream synthesized PCM as 20 ms frames, honoring barge-in cancellation
/// between frames.
async fn stream_audio(ctx: &TurnContext, pcm: &[u8]) {
    let frame_len = frame_bytes(DOWNLINK_SAMPLE_RATE);
    let mut sent = 0usize;

    for chunk in pcm.chunks(frame_len) {
        if ctx.cancel.is_cancelled() {
            info!(sent_frames = sent, "audio stream interrupted");
            return;
        }

        let route = if ctx.binary_audio {
            Route::Audio(Bytes::copy_from_slice(chunk))
        } else {
            Route::Ordered(ServerEvent::AudioOut {
                data: protocol::encode_audio(chunk),
            })
        };
        if ctx.tx.send(route).await.is_err() {
            return;
        }
        sent += 1;

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                info!(sent_frames = sent, "audio stream interrupted");
                return;
            }
            _ = tokio::time::sleep(STREAM_PACE) => {}
        }
    }

    debug!(sent_frames = sent, "audio stream complete");
}

/// Pull a fenced ```json block out of the assistant's reply.
///
/// Returns the reply with the block removed (the text that should be spoken)
/// plus the parsed patch. A block that is not valid JSON is left in place
/// untouched rather than silently dropped.
pub(crate) fn extract_report_patch(text: &str) -> (String, Option<serde_json::Value>) {
    let Some(captures) = REPORT_PATCH_BLOCK.captures(text) else {
        return (text.trim().to_string(), None);
    };

    let raw = captures.get(1).expect("group 1 always present").as_str();
    match serde_json::from_str(raw) {
        Ok(patch) => {
            let spoken = REPORT_PATCH_BLOCK.replace(text, " ");
            let spoken = spoken.split_whitespace().collect::<Vec<_>>().join(" ");
            (spoken, Some(patch))
        }
        Err(e) => {
            debug!(error = %e, "fenced block is not valid JSON, keeping text as-is");
            (text.trim().to_string(), None)
        }
    }
}
