//! Live streaming avatars.
//!
//! Each speaker gets one long-lived session. Turns are spoken by sending a
//! "repeat" task to that session; the browser page served by
//! [`crate::server`] reads the sessions file to attach to the streams.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::HeygenConfig;
use crate::error::{StreamError, truncate_for_log};
use crate::heygen::{IdValue, parse_envelope, read_body};
use crate::participant::Speaker;
use crate::retry::{RetryPolicy, retry};
use crate::tts::{ensure_parent, temp_sibling};

/// Which avatar a session shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamAvatar {
    Name(String),
    Id(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceSpec {
    pub voice_id: String,
    pub rate: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub avatar: StreamAvatar,
    pub voice: Option<VoiceSpec>,
    pub quality: String,
}

/// What the service hands back for a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub url: String,
    pub access_token: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamingAvatarService: Send + Sync {
    async fn create_token(&self) -> Result<String, StreamError>;
    async fn create_session(&self, token: &str, request: &SessionRequest) -> Result<SessionInfo, StreamError>;
    async fn start_session(&self, token: &str, session_id: &str) -> Result<(), StreamError>;
    /// Returns the task id when the service reports one.
    async fn send_speak_task(&self, token: &str, session_id: &str, text: &str) -> Result<Option<String>, StreamError>;
    async fn stop_session(&self, token: &str, session_id: &str) -> Result<(), StreamError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TokenFields {
    token: Option<String>,
    access_token: Option<String>,
}

impl TokenFields {
    fn token(&self) -> Option<String> {
        [&self.token, &self.access_token]
            .into_iter()
            .flatten()
            .find(|t| !t.is_empty())
            .cloned()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SessionFields {
    session_id: Option<String>,
    url: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TaskFields {
    task_id: Option<IdValue>,
}

fn parse_token(body: &str) -> Result<String, StreamError> {
    parse_envelope::<TokenFields>(body)?
        .first(TokenFields::token)
        .ok_or_else(|| StreamError::UnexpectedResponse(format!("missing token: {}", truncate_for_log(body, 300))))
}

fn parse_session(body: &str) -> Result<SessionInfo, StreamError> {
    let envelope = parse_envelope::<SessionFields>(body)?;
    let fields = envelope.data.as_ref().unwrap_or(&envelope.direct);
    let session_id = fields
        .session_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            StreamError::UnexpectedResponse(format!("missing session_id: {}", truncate_for_log(body, 300)))
        })?;
    Ok(SessionInfo {
        session_id,
        url: fields.url.clone().unwrap_or_default(),
        access_token: fields.access_token.clone().unwrap_or_default(),
    })
}

fn parse_task_id(body: &str) -> Option<String> {
    parse_envelope::<TaskFields>(body)
        .ok()?
        .first(|f| f.task_id.as_ref().and_then(IdValue::non_empty))
}

pub struct HeygenStreamClient {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl HeygenStreamClient {
    pub fn new(config: &HeygenConfig) -> Result<Self, StreamError> {
        if config.api_key.is_empty() {
            return Err(StreamError::ConfigError("HEYGEN_API_KEY is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StreamError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn post_with_token(
        &self,
        endpoint: &str,
        token: &str,
        payload: &serde_json::Value,
    ) -> Result<String, StreamError> {
        let resp = self
            .http
            .post(format!("{}/v1/{}", self.api_base, endpoint))
            .bearer_auth(token)
            .json(payload)
            .send()
            .await?;
        read_body(resp).await
    }
}

#[async_trait]
impl StreamingAvatarService for HeygenStreamClient {
    async fn create_token(&self) -> Result<String, StreamError> {
        let resp = self
            .http
            .post(format!("{}/v1/streaming.create_token", self.api_base))
            .header("X-Api-Key", &self.api_key)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        parse_token(&read_body(resp).await?)
    }

    async fn create_session(&self, token: &str, request: &SessionRequest) -> Result<SessionInfo, StreamError> {
        let mut payload = serde_json::json!({
            "quality": request.quality,
            "version": "v2",
            "video_encoding": "H264",
            "disable_idle_timeout": true,
        });
        match &request.avatar {
            StreamAvatar::Name(name) => payload["avatar_name"] = name.clone().into(),
            StreamAvatar::Id(id) => payload["avatar_id"] = id.clone().into(),
        }
        if let Some(voice) = &request.voice {
            payload["voice"] = serde_json::to_value(voice)?;
        }
        parse_session(&self.post_with_token("streaming.new", token, &payload).await?)
    }

    async fn start_session(&self, token: &str, session_id: &str) -> Result<(), StreamError> {
        let payload = serde_json::json!({ "session_id": session_id });
        self.post_with_token("streaming.start", token, &payload).await?;
        Ok(())
    }

    async fn send_speak_task(&self, token: &str, session_id: &str, text: &str) -> Result<Option<String>, StreamError> {
        let payload = serde_json::json!({
            "session_id": session_id,
            "text": text,
            "task_type": "repeat",
        });
        let body = self.post_with_token("streaming.task", token, &payload).await?;
        Ok(parse_task_id(&body))
    }

    async fn stop_session(&self, token: &str, session_id: &str) -> Result<(), StreamError> {
        let payload = serde_json::json!({ "session_id": session_id });
        self.post_with_token("streaming.stop", token, &payload).await?;
        Ok(())
    }
}

/// An open session for one speaker.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSession {
    pub agent: Speaker,
    pub session_id: String,
    pub url: String,
    pub access_token: String,
    /// API token the session was created with; never written to disk.
    pub token: String,
    pub avatar_name: String,
    pub voice_id: Option<String>,
    /// Unix seconds.
    pub created_at: f64,
}

/// The browser-facing part of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicSession {
    pub agent: Speaker,
    pub session_id: String,
    pub url: String,
    pub access_token: String,
    pub avatar_name: String,
    pub voice_id: Option<String>,
    pub created_at: f64,
}

impl From<&StreamSession> for PublicSession {
    fn from(s: &StreamSession) -> Self {
        Self {
            agent: s.agent,
            session_id: s.session_id.clone(),
            url: s.url.clone(),
            access_token: s.access_token.clone(),
            avatar_name: s.avatar_name.clone(),
            voice_id: s.voice_id.clone(),
            created_at: s.created_at,
        }
    }
}

/// Contents of the sessions file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionsFile {
    pub updated_at: f64,
    pub sessions: HashMap<String, PublicSession>,
}

impl SessionsFile {
    pub async fn read(path: &Path) -> Result<Self, StreamError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Where a speak task went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakReceipt {
    pub session_id: String,
    pub task_id: Option<String>,
}

fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

pub struct StreamSessions {
    service: Arc<dyn StreamingAvatarService>,
    config: HeygenConfig,
    policy: RetryPolicy,
    open: Mutex<HashMap<Speaker, StreamSession>>,
}

impl StreamSessions {
    pub fn new(service: Arc<dyn StreamingAvatarService>, config: HeygenConfig, policy: RetryPolicy) -> Self {
        Self {
            service,
            config,
            policy,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions_file(&self) -> &Path {
        &self.config.sessions_file
    }

    fn request_for(&self, speaker: Speaker) -> Result<SessionRequest, StreamError> {
        let avatar = self.config.avatar(speaker);
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
        let stream_avatar = match (non_empty(&avatar.stream_avatar_name), non_empty(&avatar.stream_avatar_id)) {
            (Some(name), _) => StreamAvatar::Name(name),
            (None, Some(id)) => StreamAvatar::Id(id),
            (None, None) => {
                return Err(StreamError::ConfigError(format!(
                    "streaming avatar name or id is required for speaker {}",
                    speaker
                )));
            }
        };
        Ok(SessionRequest {
            avatar: stream_avatar,
            voice: non_empty(&avatar.stream_voice_id).map(|voice_id| VoiceSpec {
                voice_id,
                rate: self.config.stream_voice_rate,
            }),
            quality: self.config.stream_quality.clone(),
        })
    }

    /// The open session for `speaker`, creating and starting one if needed.
    pub async fn ensure_session(&self, speaker: Speaker) -> Result<StreamSession, StreamError> {
        let mut open = self.open.lock().await;
        if let Some(existing) = open.get(&speaker) {
            return Ok(existing.clone());
        }

        let request = self.request_for(speaker)?;
        let service = &self.service;
        let token = retry(&self.policy, "heygen_stream_token", move || service.create_token()).await?;

        let (token_ref, request_ref) = (token.as_str(), &request);
        let info = retry(&self.policy, "heygen_stream_new", move || {
            service.create_session(token_ref, request_ref)
        })
        .await?;

        let session_id = info.session_id.as_str();
        retry(&self.policy, "heygen_stream_start", move || {
            service.start_session(token_ref, session_id)
        })
        .await?;

        let session = StreamSession {
            agent: speaker,
            session_id: info.session_id.clone(),
            url: info.url,
            access_token: info.access_token,
            token: token.clone(),
            avatar_name: match &request.avatar {
                StreamAvatar::Name(name) | StreamAvatar::Id(name) => name.clone(),
            },
            voice_id: request.voice.map(|v| v.voice_id),
            created_at: unix_now(),
        };
        info!(target: "heygen", speaker = %speaker, session = %session.session_id, "streaming session started");
        open.insert(speaker, session.clone());

        if let Err(e) = write_sessions_file(&self.config.sessions_file, &open).await {
            warn!(target: "heygen", error = %e, "failed to write sessions file");
        }
        Ok(session)
    }

    /// Have `speaker`'s avatar say `text`.
    pub async fn speak(&self, speaker: Speaker, text: &str) -> Result<SpeakReceipt, StreamError> {
        let session = self.ensure_session(speaker).await?;
        let service = &self.service;
        let (token, session_id) = (session.token.as_str(), session.session_id.as_str());
        let task_id = retry(&self.policy, "heygen_stream_task", move || {
            service.send_speak_task(token, session_id, text)
        })
        .await?;
        Ok(SpeakReceipt {
            session_id: session.session_id.clone(),
            task_id,
        })
    }

    /// Stop every open session; failures are logged.
    pub async fn close_all(&self) {
        let mut open = self.open.lock().await;
        for (speaker, session) in open.drain() {
            match self.service.stop_session(&session.token, &session.session_id).await {
                Ok(()) => info!(target: "heygen", speaker = %speaker, session = %session.session_id, "streaming session stopped"),
                Err(e) => warn!(target: "heygen", speaker = %speaker, error = %e, "failed to stop streaming session"),
            }
        }
    }
}

/// Atomically replace the sessions file with the public view of `sessions`.
async fn write_sessions_file(path: &Path, sessions: &HashMap<Speaker, StreamSession>) -> Result<(), StreamError> {
    let file = SessionsFile {
        updated_at: unix_now(),
        sessions: sessions
            .iter()
            .map(|(speaker, session)| (speaker.to_string(), PublicSession::from(session)))
            .collect(),
    };
    ensure_parent(path).await?;
    let tmp: PathBuf = temp_sibling(path, ".tmp");
    tokio::fs::write(&tmp, serde_json::to_vec(&file)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
