//! Gateway (§4.5): accepts client streams, runs the handshake, admits
//! or rejects them, and routes audio frames into a per-session decode
//! loop. Wires together admission, the session's decode loop, the
//! event-log publisher, and the health/self-monitor subsystem.

mod admission;
mod config;
mod health;
mod publisher;
mod session;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use clap::Parser;
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use shared_protocol::{Handshake, ServerMessage};
use shared_transcriber::{TranscribeOpts, Transcriber, WhisperTranscriber};
use shared_vad::{EarshotVad, VoiceActivityDetector};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use whisper_rs::{SamplingStrategy, WhisperContext, WhisperContextParameters};

use admission::{AdmissionRegistry, ConnId};
use config::{Args, EventLogConfig};
use health::HealthState;
use publisher::Publisher;
use session::{PublishRequest, Session, SessionIdentity, SessionSinks, TranscriberHandle, run_decode_loop};

/// Identifies this implementation on the wire-compatible `SERVER_READY`
/// message (§6). The gateway is built on `whisper-rs`/whisper.cpp, a
/// faster_whisper-class local backend rather than TensorRT, so it
/// reports the `faster_whisper` literal downstream tooling expects.
const BACKEND_NAME: &str = "faster_whisper";

const END_OF_AUDIO: &[u8] = b"END_OF_AUDIO";
const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const EOS_DRAIN_GRACE: Duration = Duration::from_secs(5);
const SILENT_STREAK_LIMIT: u32 = 3;

/// What the timeout sweep and accept loop need to reach into a live
/// connection from outside its own task.
#[derive(Clone)]
struct ConnHandle {
    session: Arc<Session>,
    to_client: UnboundedSender<ServerMessage>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let event_log = EventLogConfig::from_env();

    info!("loading whisper model: {}", args.model);
    let ctx = Arc::new(WhisperContext::new_with_params(&args.model, whisper_params())?);

    let expected_token = match &args.token_file {
        Some(path) => {
            info!("API token authentication enabled");
            Some(std::fs::read_to_string(path)?.trim().to_string())
        }
        None => None,
    };

    let sampling_strategy = build_sampling_strategy(args.beam_size, args.best_of);
    let transcribe_opts = TranscribeOpts {
        dynamic_audio_ctx: args.dynamic_audio_ctx,
        temperature_inc: args.temperature_inc,
        entropy_thold: args.entropy_thold,
        reinit_state: args.reinit_state,
    };

    let publisher = Arc::new(Publisher::new(&event_log.redis_url, event_log.stream_key.clone())?);
    tokio::spawn({
        let publisher = publisher.clone();
        async move { publisher.run().await }
    });

    let (publish_tx, publish_rx) = mpsc::unbounded_channel::<PublishRequest>();
    tokio::spawn(publisher::run_publish_forwarder(publisher.clone(), publish_rx));

    let health_state = HealthState::new(publisher.clone());
    tokio::spawn(health::run_self_monitor(health_state.clone()));
    {
        let state = health_state.clone();
        let address = args.address.clone();
        let health_port = args.health_port;
        tokio::spawn(async move {
            if let Err(e) = health::run_health_server(&address, health_port, state).await {
                error!("health server error: {e}");
            }
        });
    }

    let admission = Arc::new(AdmissionRegistry::new(args.max_clients, Duration::from_secs(args.max_connection_time)));
    let connections: Arc<DashMap<ConnId, ConnHandle>> = Arc::new(DashMap::new());

    tokio::spawn(run_timeout_sweep(admission.clone(), connections.clone()));

    let single_model: Option<Arc<StdMutex<Box<dyn Transcriber>>>> = if args.single_model {
        warn!("single-model mode: per-session language/initial_prompt overrides are ignored");
        let transcriber =
            WhisperTranscriber::new(ctx.clone(), None, None, sampling_strategy.clone(), transcribe_opts.clone())?;
        Some(Arc::new(StdMutex::new(Box::new(transcriber) as Box<dyn Transcriber>)))
    } else {
        None
    };

    let addr: SocketAddr = format!("{}:{}", args.address, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    health_state.mark_ready();

    while let Ok((stream, peer)) = listener.accept().await {
        info!(%peer, "connection accepted");
        let conn_id = admission.allocate_conn_id();
        let ctx = ctx.clone();
        let expected_token = expected_token.clone();
        let sampling_strategy = sampling_strategy.clone();
        let transcribe_opts = transcribe_opts.clone();
        let publish_tx = publish_tx.clone();
        let admission = admission.clone();
        let connections = connections.clone();
        let single_model = single_model.clone();

        tokio::spawn(async move {
            let result = handle_connection(
                conn_id,
                stream,
                ctx,
                expected_token,
                sampling_strategy,
                transcribe_opts,
                publish_tx,
                admission.clone(),
                connections.clone(),
                single_model,
            )
            .await;
            if let Err(e) = result {
                warn!(conn_id, error = %e, "connection ended with error");
            }
            admission.remove(conn_id);
            connections.remove(&conn_id);
        });
    }

    Ok(())
}

fn whisper_params() -> WhisperContextParameters {
    let mut params = WhisperContextParameters::default();
    params.flash_attn(true);
    #[cfg(not(feature = "vulkan"))]
    info!("running on CPU");
    #[cfg(feature = "vulkan")]
    {
        info!("running with GPU acceleration (Vulkan)");
        params.use_gpu(true);
    }
    params
}

fn build_sampling_strategy(beam_size: Option<i32>, best_of: Option<i32>) -> SamplingStrategy {
    match (beam_size, best_of) {
        (Some(beam_size), None) => {
            info!("using beam search with beam_size={beam_size}");
            SamplingStrategy::BeamSearch { beam_size, patience: -1.0 }
        }
        (None, Some(best_of)) => {
            info!("using greedy search with best_of={best_of}");
            SamplingStrategy::Greedy { best_of }
        }
        (None, None) => SamplingStrategy::Greedy { best_of: 1 },
        (Some(_), Some(_)) => unreachable!("clap enforces beam_size/best_of are mutually exclusive"),
    }
}

/// Sweeps the admission registry every 5s and force-disconnects any
/// session that has exceeded `max_connection_time` (§4.3).
async fn run_timeout_sweep(admission: Arc<AdmissionRegistry>, connections: Arc<DashMap<ConnId, ConnHandle>>) {
    let mut interval = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        for (conn_id, uid) in admission.sweep_expired() {
            if let Some(handle) = connections.get(&conn_id) {
                info!(conn_id, %uid, "session exceeded max_connection_time, disconnecting");
                handle.session.request_exit();
                let _ = handle.to_client.send(ServerMessage::disconnect(uid));
            }
        }
    }
}

/// Required handshake fields besides `uid`, checked in declaration
/// order so the rejection message lists them the way the reference
/// implementation does (§8 scenario 1).
fn missing_required_fields(h: &Handshake) -> Vec<&'static str> {
    let blank = |opt: &Option<String>| opt.as_deref().map(|s| s.trim().is_empty()).unwrap_or(true);
    let mut missing = Vec::new();
    if blank(&h.platform) {
        missing.push("platform");
    }
    if blank(&h.meeting_url) {
        missing.push("meeting_url");
    }
    if blank(&h.token) {
        missing.push("token");
    }
    if blank(&h.meeting_id) {
        missing.push("meeting_id");
    }
    missing
}

/// Taxonomy of handshake-time rejections (§7). A typed enum rather
/// than stringly-typed branching, so the gateway can match on *kind*
/// instead of inspecting message text; `Display` still renders the
/// exact wording §8's scenarios expect.
#[derive(Debug, thiserror::Error)]
enum HandshakeError {
    #[error("first message must be the JSON handshake")]
    NotJson,
    #[error("malformed handshake: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("Missing required fields: {0}")]
    MissingFields(String),
    #[error("invalid API token")]
    InvalidToken,
}

/// A handshake that has passed field and token validation, ready to
/// seed a `Session`.
struct ValidatedHandshake {
    uid: String,
    token: String,
    platform: String,
    meeting_id: String,
    meeting_url: String,
    language: Option<String>,
    initial_prompt: Option<String>,
    use_vad: bool,
}

fn validate_handshake(raw: &str, expected_token: &Option<String>) -> Result<ValidatedHandshake, HandshakeError> {
    let handshake: Handshake = serde_json::from_str(raw)?;

    let missing = missing_required_fields(&handshake);
    if !missing.is_empty() {
        return Err(HandshakeError::MissingFields(missing.join(", ")));
    }

    // uid is client-supplied when present and non-blank; otherwise the
    // gateway mints one, matching the "client-supplied or generated
    // UUID v4" identity rule (§3).
    let uid = handshake
        .uid
        .clone()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let token = handshake.token.clone().unwrap();
    let platform = handshake.platform.clone().unwrap();
    let meeting_id = handshake.meeting_id.clone().unwrap();
    let meeting_url = handshake.meeting_url.clone().unwrap();

    if let Some(expected) = expected_token {
        if &token != expected {
            return Err(HandshakeError::InvalidToken);
        }
    }

    Ok(ValidatedHandshake {
        uid,
        token,
        platform,
        meeting_id,
        meeting_url,
        language: handshake.language,
        initial_prompt: handshake.initial_prompt,
        use_vad: handshake.use_vad.unwrap_or(false),
    })
}

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    conn_id: ConnId,
    stream: TcpStream,
    ctx: Arc<WhisperContext>,
    expected_token: Option<String>,
    sampling_strategy: SamplingStrategy,
    transcribe_opts: TranscribeOpts,
    publish_tx: UnboundedSender<PublishRequest>,
    admission: Arc<AdmissionRegistry>,
    connections: Arc<DashMap<ConnId, ConnHandle>>,
    single_model: Option<Arc<StdMutex<Box<dyn Transcriber>>>>,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer_handle = tokio::spawn(run_client_writer(ws_sender, to_client_rx));

    macro_rules! reject {
        ($uid:expr, $msg:expr) => {{
            let _ = to_client_tx.send(ServerMessage::error($uid, $msg));
            drop(to_client_tx);
            let _ = writer_handle.await;
            return Ok(());
        }};
    }

    let raw = match ws_receiver.next().await {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(_)) => reject!(String::new(), HandshakeError::NotJson.to_string()),
        Some(Err(e)) => return Err(e.into()),
        None => return Ok(()), // closed before handshake
    };

    let handshake = match validate_handshake(&raw, &expected_token) {
        Ok(h) => h,
        Err(e) => {
            // best-effort uid for the error reply: a malformed/rejected
            // handshake may still carry a readable `uid` field even
            // though some other field is missing or invalid.
            let uid_for_errors = serde_json::from_str::<Handshake>(&raw)
                .ok()
                .and_then(|h| h.uid)
                .unwrap_or_default();
            reject!(uid_for_errors, e.to_string());
        }
    };
    let ValidatedHandshake { uid, token, platform, meeting_id, meeting_url, language, initial_prompt, use_vad } =
        handshake;

    if let Err(wait) = admission.try_admit(conn_id, &uid) {
        let _ = to_client_tx.send(ServerMessage::wait(uid, wait.wait_minutes));
        drop(to_client_tx);
        let _ = writer_handle.await;
        return Ok(());
    }

    let identity = SessionIdentity { uid: uid.clone(), token, platform, meeting_id, meeting_url };
    let session = Session::new(identity);
    connections.insert(conn_id, ConnHandle { session: session.clone(), to_client: to_client_tx.clone() });

    let _ = to_client_tx.send(session.ready_message(BACKEND_NAME));

    let transcriber_handle = match &single_model {
        Some(shared) => TranscriberHandle::Shared(shared.clone()),
        None => {
            let transcriber = WhisperTranscriber::new(
                ctx.clone(),
                language,
                initial_prompt,
                sampling_strategy.clone(),
                transcribe_opts.clone(),
            )
            .map_err(|e| anyhow!("failed to initialize transcriber for {uid}: {e}"))?;
            TranscriberHandle::Owned(Box::new(transcriber))
        }
    };

    let sinks = SessionSinks { to_client: to_client_tx.clone(), to_publisher: publish_tx };
    let decode_session = session.clone();
    let decode_handle = tokio::task::spawn_blocking(move || run_decode_loop(decode_session, transcriber_handle, sinks));

    let mut vad = use_vad.then(EarshotVad::new);
    let mut silent_streak: u32 = 0;
    run_receive_loop(&session, &mut ws_receiver, &mut vad, &mut silent_streak).await;

    // Give the decode loop a short grace period to flush whatever
    // audio is still buffered (e.g. the trailing partial after
    // END_OF_AUDIO) before tearing the session down.
    let drain_deadline = Instant::now() + EOS_DRAIN_GRACE;
    while session.has_pending_audio() && Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    session.request_exit();
    let _ = to_client_tx.send(ServerMessage::disconnect(session.identity.uid.clone()));
    drop(to_client_tx);
    let _ = writer_handle.await;
    let _ = decode_handle.await;
    Ok(())
}

/// Reads audio frames off the client stream until it closes,
/// `END_OF_AUDIO` arrives, or the session is force-disconnected by
/// the timeout sweep (§4.5).
async fn run_receive_loop(
    session: &Arc<Session>,
    ws_receiver: &mut (impl Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    vad: &mut Option<EarshotVad>,
    silent_streak: &mut u32,
) {
    let mut exit_check = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = exit_check.tick() => {
                if session.is_exiting() {
                    return;
                }
            }
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if data.as_ref() == END_OF_AUDIO {
                        session.set_eos(true);
                        return;
                    }
                    let frame = pcm_from_bytes(&data);
                    handle_frame(session, vad, silent_streak, &frame);
                }
                Some(Ok(Message::Text(text))) => {
                    if text.as_bytes() == END_OF_AUDIO {
                        session.set_eos(true);
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(uid = %session.identity.uid, error = %e, "client stream error");
                    return;
                }
            },
        }
    }
}

fn handle_frame(session: &Arc<Session>, vad: &mut Option<EarshotVad>, silent_streak: &mut u32, frame: &[f32]) {
    match vad {
        Some(v) => {
            if v.is_voice(frame) {
                session.append_frame(frame);
                *silent_streak = 0;
                session.set_eos(false);
            } else {
                *silent_streak += 1;
                if *silent_streak > SILENT_STREAK_LIMIT {
                    session.set_eos(true);
                }
            }
        }
        None => session.append_frame(frame),
    }
}

fn pcm_from_bytes(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect()
}

async fn run_client_writer(mut sender: WsSender, mut rx: UnboundedReceiver<ServerMessage>) {
    while let Some(msg) = rx.recv().await {
        if sender.send(Message::Text(msg.to_json())).await.is_err() {
            return;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(uid: Option<&str>, platform: &str, meeting_url: &str, token: &str, meeting_id: &str) -> Handshake {
        Handshake {
            uid: uid.map(str::to_string),
            platform: Some(platform.to_string()),
            meeting_url: Some(meeting_url.to_string()),
            token: Some(token.to_string()),
            meeting_id: Some(meeting_id.to_string()),
            language: None,
            task: None,
            model: None,
            initial_prompt: None,
            vad_parameters: None,
            use_vad: None,
            max_clients: None,
            max_connection_time: None,
        }
    }

    #[test]
    fn missing_fields_lists_everything_but_uid() {
        let h = handshake(Some("u1"), "", "", "", "");
        assert_eq!(missing_required_fields(&h), vec!["platform", "meeting_url", "token", "meeting_id"]);
    }

    #[test]
    fn fully_populated_handshake_has_no_missing_fields() {
        let h = handshake(Some("u1"), "zoom", "https://example.invalid/m1", "tok", "m1");
        assert!(missing_required_fields(&h).is_empty());
    }

    #[test]
    fn pcm_from_bytes_round_trips_little_endian_floats() {
        let original = vec![0.0_f32, 0.5, -0.5, 1.0];
        let bytes: Vec<u8> = original.iter().flat_map(|f| f.to_le_bytes()).collect();
        assert_eq!(pcm_from_bytes(&bytes), original);
    }

    #[test]
    fn validate_handshake_rejects_missing_fields_with_exact_wording() {
        // §8 scenario 1
        let raw = r#"{"uid":"u1","platform":"","meeting_url":"","token":"","meeting_id":""}"#;
        let err = validate_handshake(raw, &None).unwrap_err();
        assert_eq!(err.to_string(), "Missing required fields: platform, meeting_url, token, meeting_id");
    }

    #[test]
    fn validate_handshake_rejects_malformed_json() {
        let err = validate_handshake("not json", &None).unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedJson(_)));
    }

    #[test]
    fn validate_handshake_mints_a_uid_when_absent() {
        let raw = r#"{"platform":"zoom","meeting_url":"https://example.invalid/m1","token":"tok","meeting_id":"m1"}"#;
        let handshake = validate_handshake(raw, &None).unwrap();
        assert!(!handshake.uid.is_empty());
        assert!(uuid::Uuid::parse_str(&handshake.uid).is_ok());
    }

    #[test]
    fn validate_handshake_keeps_a_present_uid() {
        let raw = r#"{"uid":"client-chosen","platform":"zoom","meeting_url":"https://example.invalid/m1","token":"tok","meeting_id":"m1"}"#;
        let handshake = validate_handshake(raw, &None).unwrap();
        assert_eq!(handshake.uid, "client-chosen");
    }

    #[test]
    fn validate_handshake_rejects_wrong_token_when_one_is_configured() {
        let raw = r#"{"uid":"u1","platform":"zoom","meeting_url":"https://example.invalid/m1","token":"wrong","meeting_id":"m1"}"#;
        let err = validate_handshake(raw, &Some("expected".to_string())).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidToken));
    }
}
