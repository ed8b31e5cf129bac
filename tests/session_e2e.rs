//! End-to-end tests: a real gateway server on an ephemeral port, mocked
//! worker services, and the library's own session controller as the client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use parley_gateway::audio::AudioSink;
use parley_gateway::protocol::{SessionOptions, encode_audio};
use parley_gateway::session::{ReconnectConfig, SessionEvent, SessionState, SessionTunables};
use parley_gateway::transcript::Role;
use parley_gateway::{AppState, ServerConfig, VoiceSession, routes};

/// Audio sink that records every frame and stop call.
#[derive(Default)]
struct CollectingSink {
    frames: Mutex<Vec<Bytes>>,
    stops: AtomicU32,
}

#[async_trait]
impl AudioSink for CollectingSink {
    async fn write(&self, frame: Bytes) -> anyhow::Result<()> {
        self.frames.lock().await.push(frame);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl CollectingSink {
    async fn total_bytes(&self) -> usize {
        self.frames.lock().await.iter().map(|f| f.len()).sum()
    }
}

/// Start mocked ASR/chat/TTS workers.
async fn spawn_workers() -> (MockServer, MockServer, MockServer) {
    let asr = MockServer::start().await;
    let chat = MockServer::start().await;
    let tts = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/asr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "transcript": "I ate peanuts and my throat is closing"
        })))
        .mount(&asr)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "text": "Understood, noting that down.\n```json\n{\"reaction\": {\"symptoms\": [\"throat swelling\"]}}\n```"
        })))
        .mount(&chat)
        .await;

    // 200 ms of 24 kHz PCM16 silence.
    let pcm = vec![0u8; 9600];
    Mock::given(method("POST"))
        .and(path("/v1/tts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "audio_pcm_b64": encode_audio(&pcm),
            "sample_rate": 24000,
            "channels": 1
        })))
        .mount(&tts)
        .await;

    (asr, chat, tts)
}

/// Start a gateway bound to an ephemeral port.
async fn spawn_gateway(
    asr: &MockServer,
    chat: &MockServer,
    tts: &MockServer,
    auth_token: Option<&str>,
) -> SocketAddr {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        auth_token: auth_token.map(String::from),
        asr_url: asr.uri(),
        chat_url: chat.uri(),
        tts_url: tts.uri(),
        ..ServerConfig::default()
    };
    let state = Arc::new(AppState::new(config).expect("state must build"));
    let app = routes::create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Fast tunables so the tests run in well under a second per phase.
fn test_tunables() -> SessionTunables {
    SessionTunables {
        prebuffer_ms: 40,
        silence_finalize_ms: 200,
        connect_timeout_ms: 2000,
        reconnect: ReconnectConfig {
            max_attempts: 2,
            base_delay_ms: 20,
            max_delay_ms: 200,
        },
        ..SessionTunables::default()
    }
}

/// Attach an event recorder to a session.
async fn record_events(session: &VoiceSession) -> Arc<Mutex<Vec<SessionEvent>>> {
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
    events
}

/// Poll until `predicate` holds over the recorded events or time runs out.
async fn wait_for(
    events: &Arc<Mutex<Vec<SessionEvent>>>,
    timeout: Duration,
    predicate: impl Fn(&[SessionEvent]) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate(&events.lock().await) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn saw_state(events: &[SessionEvent], state: SessionState) -> bool {
    events
        .iter()
        .any(|e| matches!(e, SessionEvent::StateChanged(s) if *s == state))
}

#[tokio::test]
async fn test_handshake_reaches_listening() {
    let (asr, chat, tts) = spawn_workers().await;
    let addr = spawn_gateway(&asr, &chat, &tts, Some("tok")).await;

    let sink = Arc::new(CollectingSink::default());
    let session = VoiceSession::new(sink, test_tunables());
    let events = record_events(&session).await;

    session
        .start(
            &format!("ws://{addr}/v1/session"),
            "tok",
            SessionOptions::default(),
        )
        .await
        .expect("start should succeed");

    assert!(
        wait_for(&events, Duration::from_secs(2), |events| saw_state(
            events,
            SessionState::Listening
        ))
        .await,
        "session never reached listening"
    );

    session.stop().await;
    assert_eq!(session.state().await, SessionState::Stopped);
}

#[tokio::test]
async fn test_invalid_credential_rejected_by_server() {
    let (asr, chat, tts) = spawn_workers().await;
    let addr = spawn_gateway(&asr, &chat, &tts, Some("expected")).await;

    let sink = Arc::new(CollectingSink::default());
    let session = VoiceSession::new(sink, test_tunables());
    let events = record_events(&session).await;

    session
        .start(
            &format!("ws://{addr}/v1/session"),
            "wrong",
            SessionOptions::default(),
        )
        .await
        .expect("transport-level start succeeds; rejection arrives as an event");

    assert!(
        wait_for(&events, Duration::from_secs(2), |events| {
            events.iter().any(
                |e| matches!(e, SessionEvent::Error { message } if message.contains("credential")),
            )
        })
        .await,
        "server never rejected the credential"
    );

    session.stop().await;
}

#[tokio::test]
async fn test_text_turn_round_trip() {
    let (asr, chat, tts) = spawn_workers().await;
    let addr = spawn_gateway(&asr, &chat, &tts, None).await;

    let sink = Arc::new(CollectingSink::default());
    let session = VoiceSession::new(sink.clone(), test_tunables());
    let events = record_events(&session).await;

    session
        .start(
            &format!("ws://{addr}/v1/session"),
            "any-token",
            SessionOptions::default(),
        )
        .await
        .expect("start should succeed");

    assert!(
        wait_for(&events, Duration::from_secs(2), |events| saw_state(
            events,
            SessionState::Listening
        ))
        .await
    );

    session
        .send_text("I think I'm having a reaction")
        .await
        .expect("text turn accepted");

    // The full pipeline: thinking, transcripts for both roles, a report
    // patch, speaking, and back to listening.
    assert!(
        wait_for(&events, Duration::from_secs(5), |events| {
            let user_final = events.iter().any(|e| {
                matches!(e, SessionEvent::Transcript { role: Role::User, is_final: true, .. })
            });
            let assistant_final = events.iter().any(|e| {
                matches!(e, SessionEvent::Transcript { role: Role::Assistant, is_final: true, .. })
            });
            let patched = events
                .iter()
                .any(|e| matches!(e, SessionEvent::ReportPatch(_)));
            user_final
                && assistant_final
                && patched
                && saw_state(events, SessionState::Thinking)
                && saw_state(events, SessionState::Speaking)
        })
        .await,
        "turn pipeline did not complete"
    );

    // Synthesized audio flowed into the output sink.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(sink.total_bytes().await > 0, "no audio reached the sink");

    // The report patch was merged into the session draft.
    let draft = session.draft().await;
    assert!(draft.criteria.has_symptoms);

    session.stop().await;
}

#[tokio::test]
async fn test_audio_turn_with_emergency_triage() {
    let (asr, chat, tts) = spawn_workers().await;
    let addr = spawn_gateway(&asr, &chat, &tts, None).await;

    let sink = Arc::new(CollectingSink::default());
    let session = VoiceSession::new(sink, test_tunables());
    let events = record_events(&session).await;

    session
        .start(
            &format!("ws://{addr}/v1/session"),
            "any-token",
            SessionOptions {
                binary_audio: true,
                ..SessionOptions::default()
            },
        )
        .await
        .expect("start should succeed");

    assert!(
        wait_for(&events, Duration::from_secs(2), |events| saw_state(
            events,
            SessionState::Listening
        ))
        .await
    );

    // Speak: loud frames open the turn, then explicit completion.
    let mut loud = Vec::with_capacity(640);
    for i in 0..320 {
        let sample: i16 = if i % 2 == 0 { 8000 } else { -8000 };
        loud.extend_from_slice(&sample.to_le_bytes());
    }
    for _ in 0..10 {
        session.send_audio(Bytes::from(loud.clone())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    session.send_turn_complete().await;

    // The mocked transcript reports a closing throat: the guardrail must
    // surface exactly one emergency for the utterance even though both the
    // transcript scan and the server triage event carry it.
    assert!(
        wait_for(&events, Duration::from_secs(5), |events| {
            events
                .iter()
                .any(|e| matches!(e, SessionEvent::Emergency(em) if em.interrupt))
        })
        .await,
        "emergency never surfaced"
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    let recorded = events.lock().await;
    let emergencies = recorded
        .iter()
        .filter(|e| matches!(e, SessionEvent::Emergency(_)))
        .count();
    assert_eq!(emergencies, 1, "duplicate emergency events for one utterance");
    drop(recorded);

    session.stop().await;
}

#[tokio::test]
async fn test_reconnect_exhaustion_reaches_error() {
    use futures_util::{SinkExt, StreamExt};
    use parley_gateway::protocol::{Envelope, ServerEvent, WireSessionState, encode};
    use tokio_tungstenite::tungstenite::Message;

    // A raw one-shot server: accept a single session, announce listening,
    // then die so the port stays closed and every reconnect fails.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("ws accept");
        let _hello = ws.next().await;
        let json = encode(&Envelope::new(
            1,
            ServerEvent::SessionState {
                state: WireSessionState::Listening,
            },
        ))
        .expect("encode");
        let _ = ws.send(Message::Text(json.into())).await;
        // Dropping the socket and the listener severs the transport.
    });

    let sink = Arc::new(CollectingSink::default());
    let session = VoiceSession::new(sink, test_tunables());
    let events = record_events(&session).await;

    session
        .start(
            &format!("ws://{addr}/v1/session"),
            "any-token",
            SessionOptions::default(),
        )
        .await
        .expect("start should succeed");

    assert!(
        wait_for(&events, Duration::from_secs(2), |events| saw_state(
            events,
            SessionState::Listening
        ))
        .await
    );
    let _ = server.await;

    assert!(
        wait_for(&events, Duration::from_secs(5), |events| {
            saw_state(events, SessionState::Reconnecting)
                && saw_state(events, SessionState::Error)
                && events
                    .iter()
                    .any(|e| matches!(e, SessionEvent::ReconnectExhausted { attempts: 2 }))
        })
        .await,
        "reconnection never exhausted into Error"
    );

    assert!(session.manual_reconnect_available());
    assert_eq!(session.state().await, SessionState::Error);
}
