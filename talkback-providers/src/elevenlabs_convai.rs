use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, anyhow};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest};
use url::Url;

use crate::audio::AudioInterface;
use crate::request::HttpRequest;

const WS_SEND_TIMEOUT: Duration = Duration::from_secs(3);
// Extra time `start_session` waits beyond the connect timeout before giving up on the thread.
const READY_GRACE: Duration = Duration::from_secs(2);
const SESSION_THREAD_NAME: &str = "convai-session";

fn should_emit_backpressure_warning(dropped: u64) -> bool {
    // Emit on first drop, then periodically.
    dropped > 0 && (dropped == 1 || dropped % 50 == 0)
}

#[derive(Clone, PartialEq, Eq)]
pub struct ConvaiConfig {
    pub api_base_url: Url,
    pub ws_url: Url,
    pub agent_id: String,
    pub api_key: Option<String>,

    // When set, the socket URL is a signed URL fetched with the API key.
    pub requires_auth: bool,

    // Covers signed-url fetch, websocket connect and the initiation handshake.
    pub connect_timeout: Duration,
    // Bound on flushing the close frame after the session ends.
    pub end_timeout: Duration,
}

impl std::fmt::Debug for ConvaiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvaiConfig")
            .field("api_base_url", &self.api_base_url.as_str())
            .field("ws_url", &self.ws_url.as_str())
            .field("agent_id", &self.agent_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("requires_auth", &self.requires_auth)
            .field("connect_timeout", &self.connect_timeout)
            .field("end_timeout", &self.end_timeout)
            .finish()
    }
}

impl ConvaiConfig {
    pub fn production(agent_id: impl Into<String>, api_key: Option<String>) -> anyhow::Result<Self> {
        Self::with_endpoints(
            "https://api.elevenlabs.io",
            "wss://api.elevenlabs.io/v1/convai/conversation",
            agent_id,
            api_key,
        )
    }

    pub fn with_endpoints(
        api_base_url: &str,
        ws_url: &str,
        agent_id: impl Into<String>,
        api_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        Ok(Self {
            api_base_url: Url::parse(api_base_url).context("parse elevenlabs api base url")?,
            ws_url: Url::parse(ws_url).context("parse elevenlabs conversation url")?,
            agent_id: agent_id.into(),
            requires_auth: api_key.is_some(),
            api_key,
            connect_timeout: Duration::from_secs(10),
            end_timeout: Duration::from_secs(3),
        })
    }
}

pub type TranscriptCallback = Box<dyn Fn(String) + Send + Sync + 'static>;
pub type CorrectionCallback = Box<dyn Fn(String, String) + Send + Sync + 'static>;

/// Conversation event hooks. They run on the session thread and must be quick.
#[derive(Default)]
pub struct ConversationCallbacks {
    pub user_transcript: Option<TranscriptCallback>,
    pub agent_response: Option<TranscriptCallback>,
    // (original, corrected)
    pub agent_response_correction: Option<CorrectionCallback>,
}

#[derive(Debug)]
enum ConvaiCmd {
    UserAudio(Vec<u8>),
    End,
}

struct RunningSession {
    cmd_tx: mpsc::UnboundedSender<ConvaiCmd>,
    thread: Option<JoinHandle<anyhow::Result<String>>>,
}

#[derive(Default)]
struct SessionStatus {
    ended: AtomicBool,
    conversation_id: Mutex<Option<String>>,
}

impl SessionStatus {
    fn set_conversation_id(&self, id: &str) {
        *self
            .conversation_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id.to_string());
    }
}

/// Blocking client for one ElevenLabs Conversational AI session.
///
/// The websocket runs on a dedicated thread with its own single-threaded tokio runtime, so
/// callers never need an async context.
pub struct Conversation {
    cfg: ConvaiConfig,
    audio: Arc<dyn AudioInterface>,
    callbacks: Arc<ConversationCallbacks>,
    run: Mutex<Option<RunningSession>>,
    status: Arc<SessionStatus>,
}

impl Conversation {
    pub fn new(
        cfg: ConvaiConfig,
        audio: Arc<dyn AudioInterface>,
        callbacks: ConversationCallbacks,
    ) -> Self {
        Self {
            cfg,
            audio,
            callbacks: Arc::new(callbacks),
            run: Mutex::new(None),
            status: Arc::new(SessionStatus::default()),
        }
    }

    fn run_lock(&self) -> MutexGuard<'_, Option<RunningSession>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects and blocks until the service confirms the conversation (or fails).
    pub fn start_session(&self) -> anyhow::Result<()> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ConvaiCmd>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<anyhow::Result<String>>();

        {
            let mut run = self.run_lock();
            if run.is_some() {
                return Err(anyhow!("conversation session already started"));
            }

            let session = SessionTask {
                cfg: self.cfg.clone(),
                audio: self.audio.clone(),
                callbacks: self.callbacks.clone(),
                status: self.status.clone(),
                input_tx: cmd_tx.clone(),
            };

            let thread = std::thread::Builder::new()
                .name(SESSION_THREAD_NAME.into())
                .spawn(move || session.run_blocking(cmd_rx, ready_tx))
                .context("spawn conversation session thread")?;

            *run = Some(RunningSession {
                cmd_tx,
                thread: Some(thread),
            });
        }

        // Unlocked while waiting: `end_session` may abandon the connect from another thread.
        match ready_rx.recv_timeout(self.cfg.connect_timeout + READY_GRACE) {
            Ok(Ok(conversation_id)) => {
                log::info!("conversation started: {conversation_id}");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                self.end_session();
                Err(anyhow!("timed out waiting for the conversation to start"))
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(anyhow!(
                "conversation session exited before it was confirmed"
            )),
        }
    }

    /// Requests a graceful close. Safe to call at any time, more than once.
    pub fn end_session(&self) {
        if let Some(run) = self.run_lock().as_ref() {
            let _ = run.cmd_tx.send(ConvaiCmd::End);
        }
    }

    /// Blocks until the session thread has finished and returns the conversation id.
    pub fn wait_for_session_end(&self) -> anyhow::Result<String> {
        let thread = self
            .run_lock()
            .as_mut()
            .and_then(|run| run.thread.take())
            .ok_or_else(|| anyhow!("conversation session is not running"))?;

        thread
            .join()
            .map_err(|_| anyhow!("conversation session thread panicked"))?
    }

    /// True once the session loop has exited, whether we asked for it or not.
    pub fn has_ended(&self) -> bool {
        self.status.ended.load(Ordering::Acquire)
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.status
            .conversation_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        // Don't leave a session thread talking to the service after its owner is gone.
        self.end_session();
    }
}

struct SessionTask {
    cfg: ConvaiConfig,
    audio: Arc<dyn AudioInterface>,
    callbacks: Arc<ConversationCallbacks>,
    status: Arc<SessionStatus>,
    input_tx: mpsc::UnboundedSender<ConvaiCmd>,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

impl SessionTask {
    fn run_blocking(
        self,
        cmd_rx: mpsc::UnboundedReceiver<ConvaiCmd>,
        ready_tx: std::sync::mpsc::Sender<anyhow::Result<String>>,
    ) -> anyhow::Result<String> {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                let _ = ready_tx.send(Err(anyhow::Error::new(e).context("build session runtime")));
                return Err(anyhow!("conversation session runtime unavailable"));
            }
        };

        let status = self.status.clone();
        let res = rt.block_on(self.run(cmd_rx, ready_tx));
        status.ended.store(true, Ordering::Release);
        res
    }

    async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ConvaiCmd>,
        ready_tx: std::sync::mpsc::Sender<anyhow::Result<String>>,
    ) -> anyhow::Result<String> {
        let connecting = tokio::time::timeout(self.cfg.connect_timeout, connect(&self.cfg));
        let connected = tokio::select! {
            r = connecting => r
                .map_err(|_| anyhow!("ElevenLabs conversation connect timed out"))
                .and_then(|r| r),
            _ = end_requested(&mut cmd_rx) => {
                Err(anyhow!("conversation ended before it was confirmed"))
            }
        };

        let (ws, conversation_id) = match connected {
            Ok(v) => v,
            Err(e) => {
                log::error!("conversation connect failed: {e:#}");
                let _ = ready_tx.send(Err(e));
                return Err(anyhow!("conversation never started"));
            }
        };
        self.status.set_conversation_id(&conversation_id);

        let input_tx = self.input_tx.clone();
        if let Err(e) = self.audio.start(Box::new(move |pcm| {
            let _ = input_tx.send(ConvaiCmd::UserAudio(pcm));
        })) {
            let _ = ready_tx.send(Err(e.context("start audio interface")));
            let mut ws = ws;
            let _ = ws.close(None).await;
            return Err(anyhow!("conversation never started"));
        }

        let _ = ready_tx.send(Ok(conversation_id.clone()));

        let outcome = self.pump(ws, &mut cmd_rx).await;
        self.audio.stop();

        match outcome {
            Ok(()) => Ok(conversation_id),
            Err(e) => Err(e.context(format!("conversation {conversation_id}"))),
        }
    }

    /// Main loop: forwards microphone audio out and dispatches service events in.
    async fn pump(
        &self,
        ws: WsStream,
        cmd_rx: &mut mpsc::UnboundedReceiver<ConvaiCmd>,
    ) -> anyhow::Result<()> {
        let (ws_write, mut ws_read) = ws.split();

        // Writer task: keeps reads responsive; control frames (pongs) can't be starved by audio.
        let (out_ctrl_tx, mut out_ctrl_rx) = mpsc::channel::<Message>(32);
        let (out_audio_tx, mut out_audio_rx) = mpsc::channel::<Message>(256);
        let writer = tokio::spawn(async move {
            let mut ws_write = ws_write;
            let mut ctrl_closed = false;
            let mut audio_closed = false;

            loop {
                let next_msg: Option<Message> = tokio::select! {
                    biased;
                    msg = out_ctrl_rx.recv(), if !ctrl_closed => {
                        match msg {
                            Some(m) => Some(m),
                            None => { ctrl_closed = true; None }
                        }
                    }
                    msg = out_audio_rx.recv(), if !audio_closed => {
                        match msg {
                            Some(m) => Some(m),
                            None => { audio_closed = true; None }
                        }
                    }
                };

                let Some(msg) = next_msg else {
                    if ctrl_closed && audio_closed {
                        break;
                    }
                    continue;
                };

                let res = tokio::time::timeout(WS_SEND_TIMEOUT, ws_write.send(msg)).await;
                if !matches!(res, Ok(Ok(()))) {
                    break;
                }
            }

            let _ = ws_write.send(Message::Close(None)).await;
        });

        let mut last_interrupt_id: u64 = 0;
        let mut dropped_audio_chunks: u64 = 0;
        let mut outcome: anyhow::Result<()> = Ok(());

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ConvaiCmd::UserAudio(pcm)) => {
                            let msg = build_user_audio_message(&pcm);
                            match out_audio_tx.try_send(Message::Text(msg.into())) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    // Drop the chunk rather than stalling reads.
                                    dropped_audio_chunks = dropped_audio_chunks.saturating_add(1);
                                    if should_emit_backpressure_warning(dropped_audio_chunks) {
                                        log::warn!("conversation backpressure: dropped {dropped_audio_chunks} microphone chunks");
                                    }
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {
                                    outcome = Err(anyhow!("websocket closed"));
                                    break;
                                }
                            }
                        }
                        Some(ConvaiCmd::End) | None => {
                            log::info!("ending conversation");
                            break;
                        }
                    }
                }

                msg = ws_read.next() => {
                    let Some(msg) = msg else {
                        log::info!("conversation closed by server");
                        break;
                    };
                    let msg = match msg {
                        Ok(m) => m,
                        Err(e) => {
                            outcome = Err(anyhow::Error::new(e).context("websocket read failed"));
                            break;
                        }
                    };

                    let text = match msg {
                        Message::Text(t) => t.as_str().to_owned(),
                        Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
                        Message::Close(_) => {
                            log::info!("conversation closed by server");
                            break;
                        }
                        Message::Ping(p) => {
                            let _ = out_ctrl_tx.try_send(Message::Pong(p));
                            continue;
                        }
                        _ => continue,
                    };

                    match parse_convai_message(&text) {
                        Ok(event) => {
                            self.dispatch(event, &out_ctrl_tx, &mut last_interrupt_id);
                        }
                        Err(e) => {
                            log::debug!("ignoring undecodable conversation frame: {e}");
                        }
                    }
                }
            }
        }

        // Dropping the senders ends the writer, which sends Close.
        drop(out_ctrl_tx);
        drop(out_audio_tx);
        if tokio::time::timeout(self.cfg.end_timeout, writer).await.is_err() {
            log::warn!("conversation close frame not flushed in time");
        }

        outcome
    }

    fn dispatch(
        &self,
        event: ParsedConvai,
        out_ctrl_tx: &mpsc::Sender<Message>,
        last_interrupt_id: &mut u64,
    ) {
        match event {
            ParsedConvai::InitiationMetadata { conversation_id } => {
                self.status.set_conversation_id(&conversation_id);
            }
            ParsedConvai::UserTranscript { text } => {
                if let Some(cb) = self.callbacks.user_transcript.as_ref() {
                    cb(text);
                }
            }
            ParsedConvai::AgentResponse { text } => {
                if let Some(cb) = self.callbacks.agent_response.as_ref() {
                    cb(text);
                }
            }
            ParsedConvai::AgentResponseCorrection {
                original,
                corrected,
            } => {
                if let Some(cb) = self.callbacks.agent_response_correction.as_ref() {
                    cb(original, corrected);
                }
            }
            ParsedConvai::Audio {
                event_id,
                audio_base64,
            } => {
                // Audio belonging to a turn the user already interrupted is stale.
                if event_id <= *last_interrupt_id {
                    return;
                }
                match base64::engine::general_purpose::STANDARD.decode(audio_base64.as_bytes()) {
                    Ok(pcm) => self.audio.output(&pcm),
                    Err(e) => log::warn!("bad agent audio chunk {event_id}: {e}"),
                }
            }
            ParsedConvai::Interruption { event_id } => {
                *last_interrupt_id = event_id;
                self.audio.interrupt();
            }
            ParsedConvai::Ping { event_id } => {
                let pong = build_pong_message(event_id);
                if out_ctrl_tx.try_send(Message::Text(pong.into())).is_err() {
                    log::warn!("failed to queue pong for ping {event_id}");
                }
            }
            ParsedConvai::Ignored { kind } => {
                log::debug!("ignoring conversation event: {kind}");
            }
        }
    }
}

/// Opens the socket and completes the initiation handshake. Returns the conversation id.
/// Resolves once `End` is sent (or every sender is gone). Audio is not flowing yet.
async fn end_requested(cmd_rx: &mut mpsc::UnboundedReceiver<ConvaiCmd>) {
    while let Some(cmd) = cmd_rx.recv().await {
        if matches!(cmd, ConvaiCmd::End) {
            return;
        }
    }
}

async fn connect(cfg: &ConvaiConfig) -> anyhow::Result<(WsStream, String)> {
    let url = resolve_ws_url(cfg).await?;

    let req = url
        .as_str()
        .into_client_request()
        .context("build websocket request")?;
    let (mut ws, _resp) = tokio_tungstenite::connect_async(req)
        .await
        .context("connect elevenlabs conversation websocket")?;

    ws.send(Message::Text(build_initiation_message().into()))
        .await
        .context("send conversation initiation")?;

    while let Some(msg) = ws.next().await {
        let msg = msg.context("websocket read failed during handshake")?;
        let text = match msg {
            Message::Text(t) => t.as_str().to_owned(),
            Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_owned())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "no reason given".into());
                return Err(anyhow!("conversation rejected by server: {reason}"));
            }
            _ => continue,
        };

        if let Ok(ParsedConvai::InitiationMetadata { conversation_id }) =
            parse_convai_message(&text)
        {
            return Ok((ws, conversation_id));
        }
    }

    Err(anyhow!("websocket closed before the conversation started"))
}

async fn resolve_ws_url(cfg: &ConvaiConfig) -> anyhow::Result<Url> {
    if !cfg.requires_auth {
        return build_conversation_ws_url(cfg);
    }

    let req = build_signed_url_request(cfg)?;
    let resp = crate::runtime::execute(&req, cfg.connect_timeout).await?;
    if !resp.is_success() {
        return Err(anyhow!(
            "ElevenLabs signed url request failed: status={} body={}",
            resp.status,
            resp.body_snippet()
        ));
    }

    let signed = crate::parse::parse_signed_url(&resp.body)?;
    Url::parse(&signed).context("parse signed conversation url")
}

pub fn build_conversation_ws_url(cfg: &ConvaiConfig) -> anyhow::Result<Url> {
    if cfg.agent_id.trim().is_empty() {
        return Err(anyhow!("missing ElevenLabs agent id"));
    }
    let mut url = cfg.ws_url.clone();
    url.query_pairs_mut()
        .append_pair("agent_id", cfg.agent_id.trim());
    Ok(url)
}

pub fn build_signed_url_request(cfg: &ConvaiConfig) -> anyhow::Result<HttpRequest> {
    let api_key = cfg
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| anyhow!("missing ElevenLabs API key"))?;
    if cfg.agent_id.trim().is_empty() {
        return Err(anyhow!("missing ElevenLabs agent id"));
    }

    let mut url = cfg
        .api_base_url
        .join("v1/convai/conversation/get-signed-url")
        .context("build signed url endpoint")?;
    url.query_pairs_mut()
        .append_pair("agent_id", cfg.agent_id.trim());

    Ok(HttpRequest::get(url.as_str()).with_header("xi-api-key", api_key))
}

fn build_initiation_message() -> String {
    serde_json::json!({
        "type": "conversation_initiation_client_data",
        "custom_llm_extra_body": {},
        "conversation_config_override": {},
        "dynamic_variables": {},
    })
    .to_string()
}

fn build_user_audio_message(pcm_s16le: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(pcm_s16le);
    serde_json::json!({ "user_audio_chunk": b64 }).to_string()
}

fn build_pong_message(event_id: u64) -> String {
    serde_json::json!({ "type": "pong", "event_id": event_id }).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParsedConvai {
    InitiationMetadata { conversation_id: String },
    UserTranscript { text: String },
    AgentResponse { text: String },
    AgentResponseCorrection { original: String, corrected: String },
    Audio { event_id: u64, audio_base64: String },
    Interruption { event_id: u64 },
    Ping { event_id: u64 },
    Ignored { kind: String },
}

fn str_at<'a>(v: &'a serde_json::Value, event: &str, field: &str) -> &'a str {
    v.get(event)
        .and_then(|e| e.get(field))
        .and_then(|f| f.as_str())
        .unwrap_or("")
}

fn event_id_at(v: &serde_json::Value, event: &str) -> u64 {
    v.get(event)
        .and_then(|e| e.get("event_id"))
        .and_then(|id| id.as_u64().or_else(|| id.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(0)
}

fn parse_convai_message(s: &str) -> anyhow::Result<ParsedConvai> {
    let v: serde_json::Value = serde_json::from_str(s).context("decode conversation json")?;
    let t = v
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing type"))?;

    let parsed = match t {
        "conversation_initiation_metadata" => ParsedConvai::InitiationMetadata {
            conversation_id: str_at(&v, "conversation_initiation_metadata_event", "conversation_id")
                .to_string(),
        },
        "user_transcript" => ParsedConvai::UserTranscript {
            text: str_at(&v, "user_transcription_event", "user_transcript").to_string(),
        },
        "agent_response" => ParsedConvai::AgentResponse {
            text: str_at(&v, "agent_response_event", "agent_response").to_string(),
        },
        "agent_response_correction" => ParsedConvai::AgentResponseCorrection {
            original: str_at(
                &v,
                "agent_response_correction_event",
                "original_agent_response",
            )
            .to_string(),
            corrected: str_at(
                &v,
                "agent_response_correction_event",
                "corrected_agent_response",
            )
            .to_string(),
        },
        "audio" => ParsedConvai::Audio {
            event_id: event_id_at(&v, "audio_event"),
            audio_base64: str_at(&v, "audio_event", "audio_base_64").to_string(),
        },
        "interruption" => ParsedConvai::Interruption {
            event_id: event_id_at(&v, "interruption_event"),
        },
        "ping" => ParsedConvai::Ping {
            event_id: event_id_at(&v, "ping_event"),
        },
        other => ParsedConvai::Ignored {
            kind: other.to_string(),
        },
    };
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioInputCallback, NullAudio};
    use std::sync::mpsc as std_mpsc;
    use std::time::Instant;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn local_cfg(addr: std::net::SocketAddr) -> ConvaiConfig {
        let mut cfg = ConvaiConfig::with_endpoints(
            "http://127.0.0.1:9",
            &format!("ws://{addr}/v1/convai/conversation"),
            "agent_1",
            None,
        )
        .unwrap();
        cfg.connect_timeout = Duration::from_secs(2);
        cfg.end_timeout = Duration::from_secs(1);
        cfg
    }

    fn metadata(id: &str) -> String {
        format!(
            r#"{{"type":"conversation_initiation_metadata","conversation_initiation_metadata_event":{{"conversation_id":"{id}","agent_output_audio_format":"pcm_16000"}}}}"#
        )
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[derive(Default)]
    struct ScriptedAudio {
        on_input: Mutex<Option<AudioInputCallback>>,
        played: Mutex<Vec<Vec<u8>>>,
        interrupts: Mutex<u32>,
        stops: Mutex<u32>,
    }

    impl ScriptedAudio {
        fn speak(&self, pcm: Vec<u8>) {
            if let Some(cb) = self.on_input.lock().unwrap().as_ref() {
                cb(pcm);
            }
        }
    }

    impl AudioInterface for ScriptedAudio {
        fn start(&self, on_input: AudioInputCallback) -> anyhow::Result<()> {
            *self.on_input.lock().unwrap() = Some(on_input);
            Ok(())
        }

        fn stop(&self) {
            *self.stops.lock().unwrap() += 1;
        }

        fn output(&self, pcm_s16le: &[u8]) {
            self.played.lock().unwrap().push(pcm_s16le.to_vec());
        }

        fn interrupt(&self) {
            *self.interrupts.lock().unwrap() += 1;
        }
    }

    #[test]
    fn parses_transcript_events() {
        assert_eq!(
            parse_convai_message(
                r#"{"type":"user_transcript","user_transcription_event":{"user_transcript":"hello"}}"#
            )
            .unwrap(),
            ParsedConvai::UserTranscript {
                text: "hello".into()
            }
        );
        assert_eq!(
            parse_convai_message(
                r#"{"type":"agent_response","agent_response_event":{"agent_response":"hi"}}"#
            )
            .unwrap(),
            ParsedConvai::AgentResponse { text: "hi".into() }
        );
        assert_eq!(
            parse_convai_message(
                r#"{"type":"agent_response_correction","agent_response_correction_event":{"original_agent_response":"a long answer","corrected_agent_response":"a long"}}"#
            )
            .unwrap(),
            ParsedConvai::AgentResponseCorrection {
                original: "a long answer".into(),
                corrected: "a long".into()
            }
        );
    }

    #[test]
    fn parses_control_events() {
        assert_eq!(
            parse_convai_message(&metadata("conv_1")).unwrap(),
            ParsedConvai::InitiationMetadata {
                conversation_id: "conv_1".into()
            }
        );
        assert_eq!(
            parse_convai_message(r#"{"type":"ping","ping_event":{"event_id":7,"ping_ms":40}}"#)
                .unwrap(),
            ParsedConvai::Ping { event_id: 7 }
        );
        assert_eq!(
            parse_convai_message(r#"{"type":"interruption","interruption_event":{"event_id":"12"}}"#)
                .unwrap(),
            ParsedConvai::Interruption { event_id: 12 }
        );
        assert_eq!(
            parse_convai_message(
                r#"{"type":"audio","audio_event":{"audio_base_64":"AAEC","event_id":3}}"#
            )
            .unwrap(),
            ParsedConvai::Audio {
                event_id: 3,
                audio_base64: "AAEC".into()
            }
        );
    }

    #[test]
    fn unknown_type_is_ignored_but_missing_type_is_rejected() {
        assert_eq!(
            parse_convai_message(r#"{"type":"client_tool_call"}"#).unwrap(),
            ParsedConvai::Ignored {
                kind: "client_tool_call".into()
            }
        );
        let err = parse_convai_message(r#"{"text":"hi"}"#).err().unwrap();
        assert!(err.to_string().contains("missing type"));
        assert!(parse_convai_message("nope").is_err());
    }

    #[test]
    fn builds_outbound_messages() {
        let audio: serde_json::Value =
            serde_json::from_str(&build_user_audio_message(&[0, 1, 2, 3])).unwrap();
        assert_eq!(audio["user_audio_chunk"], "AAECAw==");

        let pong: serde_json::Value = serde_json::from_str(&build_pong_message(9)).unwrap();
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["event_id"], 9);

        let init: serde_json::Value = serde_json::from_str(&build_initiation_message()).unwrap();
        assert_eq!(init["type"], "conversation_initiation_client_data");
    }

    #[test]
    fn builds_public_ws_url_with_agent_id() {
        let cfg = ConvaiConfig::production("agent 1", None).unwrap();
        assert!(!cfg.requires_auth);
        let url = build_conversation_ws_url(&cfg).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.elevenlabs.io/v1/convai/conversation?agent_id=agent+1"
        );

        let mut blank = cfg.clone();
        blank.agent_id = "  ".into();
        assert!(build_conversation_ws_url(&blank).is_err());
    }

    #[test]
    fn builds_signed_url_request_with_key_header() {
        let cfg = ConvaiConfig::production("agent_1", Some("xi-secret".into())).unwrap();
        assert!(cfg.requires_auth);

        let req = build_signed_url_request(&cfg).unwrap();
        assert_eq!(
            req.url,
            "https://api.elevenlabs.io/v1/convai/conversation/get-signed-url?agent_id=agent_1"
        );
        assert_eq!(req.header("xi-api-key"), Some("xi-secret"));
        assert!(!format!("{cfg:?}").contains("xi-secret"));
    }

    #[test]
    fn blank_key_disables_auth() {
        let cfg = ConvaiConfig::production("agent_1", Some("   ".into())).unwrap();
        assert!(!cfg.requires_auth);
        assert!(cfg.api_key.is_none());
        assert!(build_signed_url_request(&cfg).is_err());
    }

    #[test]
    fn backpressure_warning_throttles() {
        assert!(!should_emit_backpressure_warning(0));
        assert!(should_emit_backpressure_warning(1));
        assert!(!should_emit_backpressure_warning(2));
        assert!(should_emit_backpressure_warning(50));
    }

    #[test]
    fn integration_session_relays_events_and_answers_pings() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = std_mpsc::channel::<String>();

        rt.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            // Client opens with its initiation data.
            if let Some(Ok(Message::Text(t))) = ws.next().await {
                let _ = seen_tx.send(t.as_str().to_owned());
            }
            let _ = ws.send(Message::Text(metadata("conv_123").into())).await;
            let _ = ws
                .send(Message::Text(
                    r#"{"type":"user_transcript","user_transcription_event":{"user_transcript":"what's the weather"}}"#.into(),
                ))
                .await;
            let _ = ws
                .send(Message::Text(
                    r#"{"type":"agent_response","agent_response_event":{"agent_response":"Sunny all day."}}"#.into(),
                ))
                .await;
            let _ = ws
                .send(Message::Text(
                    r#"{"type":"agent_response_correction","agent_response_correction_event":{"original_agent_response":"Sunny all day.","corrected_agent_response":"Sunny"}}"#.into(),
                ))
                .await;
            let _ = ws
                .send(Message::Text(
                    r#"{"type":"ping","ping_event":{"event_id":7,"ping_ms":10}}"#.into(),
                ))
                .await;

            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(t) => {
                        let _ = seen_tx.send(t.as_str().to_owned());
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        let events = Arc::new(Mutex::new(Vec::<String>::new()));
        let (u, a, c) = (events.clone(), events.clone(), events.clone());
        let callbacks = ConversationCallbacks {
            user_transcript: Some(Box::new(move |t| u.lock().unwrap().push(format!("user:{t}")))),
            agent_response: Some(Box::new(move |t| a.lock().unwrap().push(format!("agent:{t}")))),
            agent_response_correction: Some(Box::new(move |o, n| {
                c.lock().unwrap().push(format!("correction:{o}->{n}"))
            })),
        };

        let audio = Arc::new(ScriptedAudio::default());
        let conv = Conversation::new(local_cfg(addr), audio.clone(), callbacks);
        conv.start_session().unwrap();
        assert_eq!(conv.conversation_id().as_deref(), Some("conv_123"));
        assert!(!conv.has_ended());

        assert!(wait_for(|| events.lock().unwrap().len() == 3));
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "user:what's the weather".to_string(),
                "agent:Sunny all day.".to_string(),
                "correction:Sunny all day.->Sunny".to_string(),
            ]
        );

        audio.speak(vec![0, 1, 2, 3]);

        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !(seen.iter().any(|s: &String| s.contains("pong")) && seen.iter().any(|s: &String| s.contains("user_audio_chunk"))) {
            if let Ok(s) = seen_rx.recv_timeout(Duration::from_millis(50)) {
                seen.push(s);
            }
        }
        assert!(seen[0].contains("conversation_initiation_client_data"));
        assert!(seen.iter().any(|s| s.contains(r#""type":"pong""#) && s.contains(r#""event_id":7"#)));
        assert!(seen.iter().any(|s| s.contains("AAECAw==")));

        conv.end_session();
        assert_eq!(conv.wait_for_session_end().unwrap(), "conv_123");
        assert!(conv.has_ended());
        assert!(*audio.stops.lock().unwrap() >= 1);
    }

    #[test]
    fn integration_interrupted_audio_is_not_played() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();

        rt.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            let _ = ws.send(Message::Text(metadata("conv_audio").into())).await;
            for frame in [
                r#"{"type":"audio","audio_event":{"audio_base_64":"AQI=","event_id":1}}"#,
                r#"{"type":"interruption","interruption_event":{"event_id":2}}"#,
                r#"{"type":"audio","audio_event":{"audio_base_64":"AwQ=","event_id":2}}"#,
                r#"{"type":"audio","audio_event":{"audio_base_64":"BQY=","event_id":3}}"#,
            ] {
                let _ = ws.send(Message::Text(frame.into())).await;
            }
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        });

        let audio = Arc::new(ScriptedAudio::default());
        let conv = Conversation::new(
            local_cfg(addr),
            audio.clone(),
            ConversationCallbacks::default(),
        );
        conv.start_session().unwrap();

        assert!(wait_for(|| audio.played.lock().unwrap().len() == 2));
        assert_eq!(*audio.played.lock().unwrap(), vec![vec![1u8, 2], vec![5u8, 6]]);
        assert_eq!(*audio.interrupts.lock().unwrap(), 1);

        conv.end_session();
        assert_eq!(conv.wait_for_session_end().unwrap(), "conv_audio");
    }

    #[test]
    fn integration_server_close_marks_session_ended() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();

        rt.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            let _ = ws.send(Message::Text(metadata("conv_bye").into())).await;
            let _ = ws.close(None).await;
        });

        let conv = Conversation::new(
            local_cfg(addr),
            Arc::new(NullAudio),
            ConversationCallbacks::default(),
        );
        conv.start_session().unwrap();

        assert!(wait_for(|| conv.has_ended()));
        assert_eq!(conv.wait_for_session_end().unwrap(), "conv_bye");
    }

    #[test]
    fn integration_missing_handshake_times_out() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();

        rt.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Never confirm the conversation.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut cfg = local_cfg(addr);
        cfg.connect_timeout = Duration::from_millis(300);
        let conv = Conversation::new(cfg, Arc::new(NullAudio), ConversationCallbacks::default());

        let err = conv.start_session().err().unwrap();
        assert!(err.to_string().contains("timed out"), "{err:#}");
        assert!(conv.wait_for_session_end().is_err());
        assert!(conv.has_ended());
    }

    #[test]
    fn integration_end_session_abandons_a_pending_connect() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();

        rt.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut cfg = local_cfg(addr);
        cfg.connect_timeout = Duration::from_secs(5);
        let conv = Arc::new(Conversation::new(
            cfg,
            Arc::new(NullAudio),
            ConversationCallbacks::default(),
        ));

        let ender = {
            let conv = conv.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(150));
                conv.end_session();
            })
        };

        let started = Instant::now();
        let err = conv.start_session().err().unwrap();
        assert!(err.to_string().contains("ended before"), "{err:#}");
        assert!(started.elapsed() < Duration::from_secs(3));

        ender.join().unwrap();
        assert!(conv.wait_for_session_end().is_err());
        assert!(conv.has_ended());
    }

    #[test]
    fn integration_signed_url_is_fetched_with_api_key() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();

        let (path_tx, path_rx) = std_mpsc::channel::<String>();
        rt.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let _ = path_tx.send(req.uri().to_string());
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            let _ = ws.next().await;
            let _ = ws.send(Message::Text(metadata("conv_signed").into())).await;
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        });

        let server = rt.block_on(MockServer::start());
        rt.block_on(
            Mock::given(method("GET"))
                .and(path("/v1/convai/conversation/get-signed-url"))
                .and(query_param("agent_id", "agent_1"))
                .and(header("xi-api-key", "xi-secret"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "signed_url": format!("ws://{addr}/v1/convai/conversation?agent_id=agent_1&conversation_signature=sig")
                })))
                .expect(1)
                .mount(&server),
        );

        let mut cfg = ConvaiConfig::with_endpoints(
            &server.uri(),
            "ws://127.0.0.1:9/unused",
            "agent_1",
            Some("xi-secret".into()),
        )
        .unwrap();
        cfg.connect_timeout = Duration::from_secs(2);

        let conv = Conversation::new(cfg, Arc::new(NullAudio), ConversationCallbacks::default());
        conv.start_session().unwrap();

        let uri = path_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(uri.contains("conversation_signature=sig"));

        conv.end_session();
        assert_eq!(conv.wait_for_session_end().unwrap(), "conv_signed");
        drop(server);
    }

    #[test]
    fn integration_signed_url_rejection_fails_start() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let server = rt.block_on(MockServer::start());
        rt.block_on(
            Mock::given(method("GET"))
                .and(path("/v1/convai/conversation/get-signed-url"))
                .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
                .mount(&server),
        );

        let mut cfg = ConvaiConfig::with_endpoints(
            &server.uri(),
            "ws://127.0.0.1:9/unused",
            "agent_1",
            Some("xi-bad".into()),
        )
        .unwrap();
        cfg.connect_timeout = Duration::from_secs(2);

        let conv = Conversation::new(cfg, Arc::new(NullAudio), ConversationCallbacks::default());
        let err = conv.start_session().err().unwrap();
        let msg = format!("{err:#}");
        assert!(msg.contains("status=401"), "{msg}");
        assert!(msg.contains("invalid api key"), "{msg}");
    }
}
