//! Broadcast control through obs-websocket (protocol v5).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::ObsConfig;
use crate::error::StreamError;

const OP_HELLO: u8 = 0;
const OP_IDENTIFY: u8 = 1;
const OP_IDENTIFIED: u8 = 2;
const OP_REQUEST: u8 = 6;
const OP_REQUEST_RESPONSE: u8 = 7;

const RPC_VERSION: u32 = 1;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RESTART_ACTION: &str = "OBS_WEBSOCKET_MEDIA_INPUT_ACTION_RESTART";

/// Playback state of a media input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    None,
    Playing,
    Opening,
    Buffering,
    Paused,
    Stopped,
    Ended,
    Error,
}

impl MediaState {
    /// Accepts `OBS_MEDIA_STATE_PLAYING`, `playing` and similar spellings.
    pub fn normalize(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        let state = lowered.strip_prefix("obs_media_state_").unwrap_or(&lowered);
        match state {
            "playing" => MediaState::Playing,
            "opening" => MediaState::Opening,
            "buffering" => MediaState::Buffering,
            "paused" => MediaState::Paused,
            "stopped" => MediaState::Stopped,
            "ended" => MediaState::Ended,
            "error" => MediaState::Error,
            _ => MediaState::None,
        }
    }

    /// Playback began at some point (it may already be over).
    pub fn has_started(&self) -> bool {
        matches!(self, MediaState::Playing | MediaState::Ended)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, MediaState::Ended | MediaState::Stopped | MediaState::Error)
    }
}

/// What the playback driver needs from the broadcast tool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresentationSurface: Send + Sync {
    async fn switch_scene(&self, scene: &str) -> Result<(), StreamError>;
    /// Point a media input at a local file; the file must exist.
    async fn set_media_source(&self, input: &str, path: &Path) -> Result<(), StreamError>;
    async fn restart_media(&self, input: &str) -> Result<(), StreamError>;
    async fn get_media_state(&self, input: &str) -> Result<MediaState, StreamError>;
    async fn set_filter_enabled(&self, source: &str, filter: &str, enabled: bool) -> Result<(), StreamError>;
    async fn set_overlay_text(&self, input: &str, text: &str) -> Result<(), StreamError>;
    async fn list_scenes(&self) -> Result<Vec<String>, StreamError>;
    async fn input_exists(&self, input: &str) -> Result<bool, StreamError>;
}

/// Surface that accepts everything and shows nothing (text mode).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSurface;

#[async_trait]
impl PresentationSurface for NullSurface {
    async fn switch_scene(&self, _scene: &str) -> Result<(), StreamError> {
        Ok(())
    }
    async fn set_media_source(&self, _input: &str, _path: &Path) -> Result<(), StreamError> {
        Ok(())
    }
    async fn restart_media(&self, _input: &str) -> Result<(), StreamError> {
        Ok(())
    }
    async fn get_media_state(&self, _input: &str) -> Result<MediaState, StreamError> {
        Ok(MediaState::Ended)
    }
    async fn set_filter_enabled(&self, _source: &str, _filter: &str, _enabled: bool) -> Result<(), StreamError> {
        Ok(())
    }
    async fn set_overlay_text(&self, _input: &str, _text: &str) -> Result<(), StreamError> {
        Ok(())
    }
    async fn list_scenes(&self) -> Result<Vec<String>, StreamError> {
        Ok(Vec::new())
    }
    async fn input_exists(&self, _input: &str) -> Result<bool, StreamError> {
        Ok(true)
    }
}

/// Poll `input` until playback has started or `timeout` elapses.
pub async fn wait_media_started(
    surface: &dyn PresentationSurface,
    input: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<bool, StreamError> {
    let deadline = Instant::now() + timeout;
    loop {
        if surface.get_media_state(input).await?.has_started() {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(poll).await;
    }
}

/// Verify scenes and the player exist, then play `test_media` on scene A
/// and finish on scene B.
pub async fn self_check(
    surface: &dyn PresentationSurface,
    config: &ObsConfig,
    player: &str,
    test_media: &Path,
) -> Result<(), StreamError> {
    let scenes = surface.list_scenes().await?;
    for scene in [&config.scene_a, &config.scene_b, &config.scene_idle] {
        if !scenes.iter().any(|s| s == scene) {
            return Err(StreamError::PresentationError(format!(
                "scene not found: {} (existing: {})",
                scene,
                scenes.join(", ")
            )));
        }
    }
    if !surface.input_exists(player).await? {
        return Err(StreamError::PresentationError(format!("input not found: {}", player)));
    }
    info!(target: "obs", "scenes and inputs present");

    let settle = Duration::from_millis(200);
    surface.switch_scene(&config.scene_a).await?;
    tokio::time::sleep(settle).await;

    surface.set_media_source(player, test_media).await?;
    surface.restart_media(player).await?;
    let timeout = Duration::from_secs_f64(config.start_timeout_s.max(0.0));
    if !wait_media_started(surface, player, timeout, settle).await? {
        let state = surface.get_media_state(player).await?;
        return Err(StreamError::PresentationError(format!(
            "media did not start playing (state: {:?})",
            state
        )));
    }
    info!(target: "obs", "test media playing");

    surface.switch_scene(&config.scene_b).await?;
    tokio::time::sleep(settle).await;
    info!(target: "obs", "self-check passed");
    Ok(())
}

/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
pub fn auth_response(password: &str, salt: &str, challenge: &str) -> String {
    let secret = BASE64.encode(Sha256::digest(format!("{password}{salt}").as_bytes()));
    BASE64.encode(Sha256::digest(format!("{secret}{challenge}").as_bytes()))
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    op: u8,
    d: T,
}

#[derive(Debug, Deserialize)]
struct Incoming {
    op: u8,
    #[serde(default)]
    d: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hello {
    #[serde(default)]
    authentication: Option<AuthChallenge>,
}

#[derive(Debug, Deserialize)]
struct AuthChallenge {
    challenge: String,
    salt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Identify {
    rpc_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    authentication: Option<String>,
    event_subscriptions: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Request<'a> {
    request_type: &'a str,
    request_id: String,
    request_data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestResponse {
    request_id: String,
    request_status: RequestStatus,
    #[serde(default)]
    response_data: Value,
}

#[derive(Debug, Deserialize)]
struct RequestStatus {
    result: bool,
    code: i64,
    #[serde(default)]
    comment: Option<String>,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn send_json<T: Serialize>(ws: &mut WsStream, op: u8, d: T) -> Result<(), StreamError> {
    let text = serde_json::to_string(&Envelope { op, d })?;
    ws.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn next_incoming(ws: &mut WsStream) -> Result<Incoming, StreamError> {
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
            Message::Close(frame) => {
                return Err(StreamError::PresentationError(format!("connection closed: {:?}", frame)));
            }
            _ => continue,
        }
    }
    Err(StreamError::PresentationError("connection closed".to_string()))
}

/// obs-websocket client. Reconnects lazily after a transport failure.
pub struct ObsClient {
    url: String,
    password: String,
    conn: Mutex<Option<WsStream>>,
    next_id: AtomicU64,
}

impl ObsClient {
    pub fn new(config: &ObsConfig) -> Self {
        Self::with_url(config.websocket_url(), &config.password)
    }

    pub fn with_url(url: impl Into<String>, password: &str) -> Self {
        Self {
            url: url.into(),
            password: password.to_string(),
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open and identify a connection now instead of on first request.
    pub async fn connect(&self) -> Result<(), StreamError> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.handshake().await?);
        }
        Ok(())
    }

    async fn handshake(&self) -> Result<WsStream, StreamError> {
        let (mut ws, _) = connect_async(self.url.as_str()).await.map_err(|e| {
            StreamError::PresentationError(format!(
                "cannot reach obs-websocket at {} ({}); is OBS running with the WebSocket server enabled?",
                self.url, e
            ))
        })?;

        let hello = next_incoming(&mut ws).await?;
        if hello.op != OP_HELLO {
            return Err(StreamError::UnexpectedResponse(format!("expected Hello, got op {}", hello.op)));
        }
        let hello: Hello = serde_json::from_value(hello.d)?;
        let authentication = hello
            .authentication
            .map(|auth| auth_response(&self.password, &auth.salt, &auth.challenge));

        send_json(
            &mut ws,
            OP_IDENTIFY,
            Identify {
                rpc_version: RPC_VERSION,
                authentication,
                event_subscriptions: 0,
            },
        )
        .await?;

        let identified = next_incoming(&mut ws).await?;
        if identified.op != OP_IDENTIFIED {
            return Err(StreamError::PresentationError(format!(
                "identify rejected (op {}); check OBS_PASSWORD",
                identified.op
            )));
        }
        info!(target: "obs", url = %self.url, "connected");
        Ok(ws)
    }

    async fn exchange(&self, ws: &mut WsStream, request_type: &str, data: &Value) -> Result<RequestResponse, StreamError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        send_json(
            ws,
            OP_REQUEST,
            Request {
                request_type,
                request_id: request_id.clone(),
                request_data: data.clone(),
            },
        )
        .await?;

        loop {
            let incoming = next_incoming(ws).await?;
            if incoming.op != OP_REQUEST_RESPONSE {
                continue;
            }
            let response: RequestResponse = serde_json::from_value(incoming.d)?;
            if response.request_id == request_id {
                return Ok(response);
            }
            debug!(target: "obs", id = %response.request_id, "dropping stale response");
        }
    }

    /// Send one request; a broken connection is replaced once.
    async fn call(&self, request_type: &str, data: Value) -> Result<RequestResponse, StreamError> {
        let mut conn = self.conn.lock().await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if conn.is_none() {
                *conn = Some(self.handshake().await?);
            }
            let ws = conn
                .as_mut()
                .ok_or_else(|| StreamError::PresentationError("not connected".to_string()))?;
            let outcome = tokio::time::timeout(REQUEST_TIMEOUT, self.exchange(ws, request_type, &data)).await;
            let err = match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => StreamError::Timeout(format!("obs request {}", request_type)),
            };
            *conn = None;
            if attempt >= 2 {
                return Err(err);
            }
            warn!(target: "obs", request = request_type, error = %err, "connection lost, reconnecting");
        }
    }

    /// Like [`Self::call`], but a rejected request is an error.
    async fn request(&self, request_type: &str, data: Value) -> Result<Value, StreamError> {
        let response = self.call(request_type, data).await?;
        if !response.request_status.result {
            return Err(StreamError::PresentationError(format!(
                "{} failed (code {}): {}",
                request_type,
                response.request_status.code,
                response.request_status.comment.unwrap_or_default()
            )));
        }
        Ok(response.response_data)
    }

    pub async fn close(&self) {
        if let Some(mut ws) = self.conn.lock().await.take() {
            let _ = ws.close(None).await;
        }
    }
}

#[async_trait]
impl PresentationSurface for ObsClient {
    async fn switch_scene(&self, scene: &str) -> Result<(), StreamError> {
        self.request("SetCurrentProgramScene", json!({ "sceneName": scene })).await?;
        Ok(())
    }

    async fn set_media_source(&self, input: &str, path: &Path) -> Result<(), StreamError> {
        let absolute: PathBuf = std::path::absolute(path)?;
        if !tokio::fs::try_exists(&absolute).await.unwrap_or(false) {
            return Err(StreamError::PresentationError(format!(
                "media file does not exist: {}",
                absolute.display()
            )));
        }
        self.request(
            "SetInputSettings",
            json!({
                "inputName": input,
                "inputSettings": { "local_file": absolute.to_string_lossy() },
                "overlay": true,
            }),
        )
        .await?;
        Ok(())
    }

    async fn restart_media(&self, input: &str) -> Result<(), StreamError> {
        self.request(
            "TriggerMediaInputAction",
            json!({ "inputName": input, "mediaAction": RESTART_ACTION }),
        )
        .await?;
        Ok(())
    }

    async fn get_media_state(&self, input: &str) -> Result<MediaState, StreamError> {
        let data = self.request("GetMediaInputStatus", json!({ "inputName": input })).await?;
        Ok(data
            .get("mediaState")
            .and_then(Value::as_str)
            .map(MediaState::normalize)
            .unwrap_or(MediaState::None))
    }

    async fn set_filter_enabled(&self, source: &str, filter: &str, enabled: bool) -> Result<(), StreamError> {
        self.request(
            "SetSourceFilterEnabled",
            json!({ "sourceName": source, "filterName": filter, "filterEnabled": enabled }),
        )
        .await?;
        Ok(())
    }

    async fn set_overlay_text(&self, input: &str, text: &str) -> Result<(), StreamError> {
        self.request(
            "SetInputSettings",
            json!({ "inputName": input, "inputSettings": { "text": text }, "overlay": true }),
        )
        .await?;
        Ok(())
    }

    async fn list_scenes(&self) -> Result<Vec<String>, StreamError> {
        let data = self.request("GetSceneList", json!({})).await?;
        Ok(data
            .get("scenes")
            .and_then(Value::as_array)
            .map(|scenes| {
                scenes
                    .iter()
                    .filter_map(|s| s.get("sceneName").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn input_exists(&self, input: &str) -> Result<bool, StreamError> {
        let response = self.call("GetInputSettings", json!({ "inputName": input })).await?;
        Ok(response.request_status.result)
    }
}
