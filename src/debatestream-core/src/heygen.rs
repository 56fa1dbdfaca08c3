//! Talking-head video rendering.
//!
//! [`HeygenClient`] speaks the render service's HTTP API; [`VideoRenderer`]
//! chains upload, render, poll and download for one turn, each step with its
//! own retry budget, and reuses an earlier render of the same turn.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{AvatarConfig, HeygenConfig, RetryConfig};
use crate::error::{StreamError, truncate_for_log};
use crate::participant::Speaker;
use crate::retry::{RetryPolicy, retry};
use crate::tts::{ensure_parent, temp_sibling};

/// Who appears in the video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CharacterSpec {
    Avatar {
        avatar_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        avatar_style: Option<String>,
    },
    TalkingPhoto {
        talking_photo_id: String,
    },
}

impl CharacterSpec {
    pub fn from_config(avatar: &AvatarConfig) -> Result<Self, StreamError> {
        let id = avatar.character_id.trim();
        if id.is_empty() {
            return Err(StreamError::ConfigError("character id is required".to_string()));
        }
        match avatar.character_type.trim().to_lowercase().as_str() {
            "" | "avatar" => Ok(CharacterSpec::Avatar {
                avatar_id: id.to_string(),
                avatar_style: avatar.avatar_style.clone().filter(|s| !s.is_empty()),
            }),
            "talking_photo" => Ok(CharacterSpec::TalkingPhoto {
                talking_photo_id: id.to_string(),
            }),
            other => Err(StreamError::ConfigError(format!(
                "Unsupported character type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Render job state as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderStatus {
    Pending,
    Completed { url: String },
    Failed { detail: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoAvatarService: Send + Sync {
    async fn upload_asset(&self, path: &Path) -> Result<String, StreamError>;
    async fn render_video(
        &self,
        character: &CharacterSpec,
        audio_asset_id: &str,
        dimensions: Dimensions,
    ) -> Result<String, StreamError>;
    async fn poll_status(&self, job_id: &str) -> Result<RenderStatus, StreamError>;
    async fn download(&self, url: &str, out_path: &Path) -> Result<(), StreamError>;
}

/// `{...fields}` or `{"data": {...fields}}`; direct fields are checked first.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    #[serde(flatten)]
    pub(crate) direct: T,
    #[serde(default)]
    pub(crate) data: Option<T>,
}

impl<T> Envelope<T> {
    pub(crate) fn first<F>(&self, pick: F) -> Option<String>
    where
        F: Fn(&T) -> Option<String>,
    {
        pick(&self.direct).or_else(|| self.data.as_ref().and_then(&pick))
    }
}

/// Ids arrive as strings or numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum IdValue {
    Text(String),
    Number(i64),
}

impl IdValue {
    pub(crate) fn non_empty(&self) -> Option<String> {
        match self {
            IdValue::Text(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            IdValue::Text(_) => None,
            IdValue::Number(n) => Some(n.to_string()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IdFields {
    asset_id: Option<IdValue>,
    video_id: Option<IdValue>,
    id: Option<IdValue>,
}

impl IdFields {
    fn asset(&self) -> Option<String> {
        [&self.asset_id, &self.id]
            .into_iter()
            .flatten()
            .find_map(IdValue::non_empty)
    }

    fn video(&self) -> Option<String> {
        [&self.video_id, &self.id]
            .into_iter()
            .flatten()
            .find_map(IdValue::non_empty)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatusFields {
    status: Option<String>,
    video_url: Option<String>,
    error: Option<serde_json::Value>,
}

pub(crate) fn parse_envelope<T: DeserializeOwned + Default>(body: &str) -> Result<Envelope<T>, StreamError> {
    serde_json::from_str(body).map_err(|e| {
        StreamError::UnexpectedResponse(format!("{}: {}", e, truncate_for_log(body, 300)))
    })
}

fn parse_asset_id(body: &str) -> Result<String, StreamError> {
    parse_envelope::<IdFields>(body)?
        .first(IdFields::asset)
        .ok_or_else(|| StreamError::UnexpectedResponse(format!("missing asset id: {}", truncate_for_log(body, 300))))
}

fn parse_video_id(body: &str) -> Result<String, StreamError> {
    parse_envelope::<IdFields>(body)?
        .first(IdFields::video)
        .ok_or_else(|| StreamError::UnexpectedResponse(format!("missing video id: {}", truncate_for_log(body, 300))))
}

fn parse_status(body: &str) -> Result<RenderStatus, StreamError> {
    let envelope = parse_envelope::<StatusFields>(body)?;
    // The nested form is authoritative when present.
    let fields = envelope.data.as_ref().unwrap_or(&envelope.direct);
    match fields.status.as_deref().map(str::to_lowercase).as_deref() {
        Some("completed") => fields
            .video_url
            .clone()
            .filter(|u| !u.is_empty())
            .map(|url| RenderStatus::Completed { url })
            .ok_or_else(|| {
                StreamError::UnexpectedResponse(format!(
                    "completed without video url: {}",
                    truncate_for_log(body, 300)
                ))
            }),
        Some("failed") => Ok(RenderStatus::Failed {
            detail: fields
                .error
                .as_ref()
                .map(|e| truncate_for_log(&e.to_string(), 300))
                .unwrap_or_else(|| "no detail".to_string()),
        }),
        Some(_) => Ok(RenderStatus::Pending),
        None => Err(StreamError::UnexpectedResponse(format!(
            "missing status: {}",
            truncate_for_log(body, 300)
        ))),
    }
}

pub(crate) fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Read a body, turning non-success statuses into `ApiError`.
pub(crate) async fn read_body(resp: reqwest::Response) -> Result<String, StreamError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(StreamError::ApiError {
            status: status.as_u16(),
            body: truncate_for_log(&body, 300),
        });
    }
    Ok(body)
}

pub struct HeygenClient {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
    upload_url: String,
}

impl HeygenClient {
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
            upload_url: config.upload_url.clone(),
        })
    }
}

#[async_trait]
impl VideoAvatarService for HeygenClient {
    async fn upload_asset(&self, path: &Path) -> Result<String, StreamError> {
        let bytes = tokio::fs::read(path).await?;
        let resp = self
            .http
            .post(&self.upload_url)
            .header("X-Api-Key", &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, guess_mime(path))
            .body(bytes)
            .send()
            .await?;
        let asset_id = parse_asset_id(&read_body(resp).await?)?;
        debug!(target: "heygen", asset_id, path = %path.display(), "asset uploaded");
        Ok(asset_id)
    }

    async fn render_video(
        &self,
        character: &CharacterSpec,
        audio_asset_id: &str,
        dimensions: Dimensions,
    ) -> Result<String, StreamError> {
        let payload = serde_json::json!({
            "video_inputs": [{
                "character": character,
                "voice": { "type": "audio", "audio_asset_id": audio_asset_id },
                "caption": false,
            }],
            "dimension": dimensions,
        });
        let resp = self
            .http
            .post(format!("{}/v2/video/generate", self.api_base))
            .header("X-Api-Key", &self.api_key)
            .json(&payload)
            .send()
            .await?;
        let video_id = parse_video_id(&read_body(resp).await?)?;
        debug!(target: "heygen", video_id, "render requested");
        Ok(video_id)
    }

    async fn poll_status(&self, job_id: &str) -> Result<RenderStatus, StreamError> {
        let resp = self
            .http
            .get(format!("{}/v1/video_status.get", self.api_base))
            .header("X-Api-Key", &self.api_key)
            .query(&[("video_id", job_id)])
            .send()
            .await?;
        parse_status(&read_body(resp).await?)
    }

    async fn download(&self, url: &str, out_path: &Path) -> Result<(), StreamError> {
        let mut resp = self.http.get(url).send().await?.error_for_status()?;
        ensure_parent(out_path).await?;
        let part = temp_sibling(out_path, ".part");
        let mut file = tokio::fs::File::create(&part).await?;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&part, out_path).await?;
        Ok(())
    }
}

/// Retry budgets for the four render steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPolicies {
    pub upload: RetryPolicy,
    pub render: RetryPolicy,
    pub poll: RetryPolicy,
    pub download: RetryPolicy,
}

impl From<&RetryConfig> for RenderPolicies {
    fn from(retry: &RetryConfig) -> Self {
        Self {
            upload: retry.upload,
            render: retry.render,
            poll: retry.poll,
            download: retry.download,
        }
    }
}

/// `turn_{id:05}_{speaker}.mp4` under `dir`.
pub fn video_out_path(dir: &Path, turn_id: u64, speaker: Speaker) -> PathBuf {
    dir.join(format!("turn_{:05}_{}.mp4", turn_id, speaker))
}

pub struct VideoRenderer {
    service: Arc<dyn VideoAvatarService>,
    avatar_a: AvatarConfig,
    avatar_b: AvatarConfig,
    out_dir: PathBuf,
    dimensions: Dimensions,
    poll_interval: Duration,
    poll_timeout: Duration,
    policies: RenderPolicies,
}

impl VideoRenderer {
    pub fn new(
        service: Arc<dyn VideoAvatarService>,
        config: &HeygenConfig,
        out_dir: impl Into<PathBuf>,
        policies: RenderPolicies,
    ) -> Self {
        Self {
            service,
            avatar_a: config.avatar_a.clone(),
            avatar_b: config.avatar_b.clone(),
            out_dir: out_dir.into(),
            dimensions: Dimensions {
                width: config.width,
                height: config.height,
            },
            poll_interval: Duration::from_secs_f64(config.poll_interval_s.max(0.0)),
            poll_timeout: Duration::from_secs_f64(config.poll_timeout_s.max(0.0)),
            policies,
        }
    }

    fn avatar(&self, speaker: Speaker) -> &AvatarConfig {
        match speaker {
            Speaker::A => &self.avatar_a,
            Speaker::B => &self.avatar_b,
        }
    }

    /// The already rendered video for a turn, if one is on disk.
    pub async fn cached(&self, turn_id: u64, speaker: Speaker) -> Option<PathBuf> {
        let out = video_out_path(&self.out_dir, turn_id, speaker);
        if is_non_empty_file(&out).await {
            info!(target: "heygen", turn = turn_id, path = %out.display(), "reusing rendered video");
            return Some(out);
        }
        None
    }

    /// Render (or reuse) the video for a turn from its audio file.
    pub async fn render_turn(&self, turn_id: u64, speaker: Speaker, audio: &Path) -> Result<PathBuf, StreamError> {
        if let Some(out) = self.cached(turn_id, speaker).await {
            return Ok(out);
        }
        let out = video_out_path(&self.out_dir, turn_id, speaker);

        let character = CharacterSpec::from_config(self.avatar(speaker))?;
        let service = &self.service;

        let asset_id = retry(&self.policies.upload, "heygen_upload", move || service.upload_asset(audio)).await?;

        let (character, asset) = (&character, asset_id.as_str());
        let dims = self.dimensions;
        let job_id = retry(&self.policies.render, "heygen_render", move || {
            service.render_video(character, asset, dims)
        })
        .await?;
        info!(target: "heygen", turn = turn_id, job = %job_id, "render started");

        let url = self.wait_for_render(&job_id).await?;

        let (url, target) = (url.as_str(), out.as_path());
        retry(&self.policies.download, "heygen_download", move || service.download(url, target)).await?;
        info!(target: "heygen", turn = turn_id, path = %out.display(), "video ready");
        Ok(out)
    }

    async fn wait_for_render(&self, job_id: &str) -> Result<String, StreamError> {
        let deadline = Instant::now() + self.poll_timeout;
        let service = &self.service;
        loop {
            let status = retry(&self.policies.poll, "heygen_poll", move || service.poll_status(job_id)).await?;
            match status {
                RenderStatus::Completed { url } => return Ok(url),
                RenderStatus::Failed { detail } => {
                    return Err(StreamError::RenderError(format!("job {}: {}", job_id, detail)));
                }
                RenderStatus::Pending => {
                    if Instant::now() >= deadline {
                        return Err(StreamError::Timeout(format!(
                            "render job {} not ready after {:.0}s",
                            job_id,
                            self.poll_timeout.as_secs_f64()
                        )));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

async fn is_non_empty_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heygen_config() -> HeygenConfig {
        let mut config = HeygenConfig::default();
        config.avatar_a.character_id = "avatar-a".to_string();
        config.avatar_b.character_type = "talking_photo".to_string();
        config.avatar_b.character_id = "photo-b".to_string();
        config.poll_interval_s = 5.0;
        config.poll_timeout_s = 30.0;
        config
    }

    fn quick_policies() -> RenderPolicies {
        let p = RetryPolicy::new(2, 0.1, 1.0);
        RenderPolicies {
            upload: p,
            render: p,
            poll: p,
            download: p,
        }
    }

    #[test]
    fn test_envelope_fallback_order() {
        assert_eq!(parse_asset_id(r#"{"asset_id":"a1","id":"x"}"#).unwrap(), "a1");
        assert_eq!(parse_asset_id(r#"{"data":{"id":"a2"}}"#).unwrap(), "a2");
        assert_eq!(parse_asset_id(r#"{"id":"","data":{"asset_id":"a3"}}"#).unwrap(), "a3");
        assert_eq!(parse_video_id(r#"{"data":{"video_id":42}}"#).unwrap(), "42");
        assert!(matches!(
            parse_video_id(r#"{"data":{"status":"ok"}}"#),
            Err(StreamError::UnexpectedResponse(_))
        ));
        assert!(matches!(parse_asset_id("[1,2]"), Err(StreamError::UnexpectedResponse(_))));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(
            parse_status(r#"{"data":{"status":"processing"}}"#).unwrap(),
            RenderStatus::Pending
        );
        assert_eq!(
            parse_status(r#"{"data":{"status":"completed","video_url":"https://v/1.mp4"}}"#).unwrap(),
            RenderStatus::Completed {
                url: "https://v/1.mp4".to_string()
            }
        );
        assert!(matches!(
            parse_status(r#"{"status":"failed","error":{"code":"bad_audio"}}"#).unwrap(),
            RenderStatus::Failed { detail } if detail.contains("bad_audio")
        ));
        assert!(parse_status(r#"{"data":{"status":"completed"}}"#).is_err());
    }

    #[test]
    fn test_character_spec_from_config() {
        let config = heygen_config();
        assert_eq!(
            CharacterSpec::from_config(&config.avatar_b).unwrap(),
            CharacterSpec::TalkingPhoto {
                talking_photo_id: "photo-b".to_string()
            }
        );
        let json = serde_json::to_value(CharacterSpec::from_config(&config.avatar_a).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"type": "avatar", "avatar_id": "avatar-a"}));

        let missing = AvatarConfig::default();
        assert!(matches!(
            CharacterSpec::from_config(&missing),
            Err(StreamError::ConfigError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_render_skips_service() {
        let dir = tempfile::tempdir().unwrap();
        let out = video_out_path(dir.path(), 5, Speaker::A);
        std::fs::write(&out, b"mp4 bytes").unwrap();

        // No expectations: any call would panic.
        let service = MockVideoAvatarService::new();
        let renderer = VideoRenderer::new(Arc::new(service), &heygen_config(), dir.path(), quick_policies());

        for _ in 0..2 {
            let path = renderer.render_turn(5, Speaker::A, Path::new("audio.mp3")).await.unwrap();
            assert_eq!(path, out);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_render_flow() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = MockVideoAvatarService::new();
        service
            .expect_upload_asset()
            .times(1)
            .returning(|_| Ok("asset-1".to_string()));
        service
            .expect_render_video()
            .times(1)
            .returning(|character, asset, dims| {
                assert_eq!(asset, "asset-1");
                assert_eq!(dims, Dimensions { width: 1280, height: 720 });
                assert!(matches!(character, CharacterSpec::TalkingPhoto { .. }));
                Ok("job-1".to_string())
            });
        let mut polls = 0;
        service.expect_poll_status().times(3).returning(move |_| {
            polls += 1;
            Ok(if polls < 3 {
                RenderStatus::Pending
            } else {
                RenderStatus::Completed {
                    url: "https://cdn/job-1.mp4".to_string()
                }
            })
        });
        service.expect_download().times(1).returning(|url, path| {
            assert_eq!(url, "https://cdn/job-1.mp4");
            std::fs::write(path, b"video")?;
            Ok(())
        });

        let renderer = VideoRenderer::new(Arc::new(service), &heygen_config(), dir.path(), quick_policies());
        let path = renderer.render_turn(2, Speaker::B, Path::new("turn.mp3")).await.unwrap();
        assert_eq!(path, dir.path().join("turn_00002_B.mp4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_render_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = MockVideoAvatarService::new();
        service.expect_upload_asset().returning(|_| Ok("a".to_string()));
        service.expect_render_video().returning(|_, _, _| Ok("j".to_string()));
        service.expect_poll_status().times(1).returning(|_| {
            Ok(RenderStatus::Failed {
                detail: "bad audio".to_string(),
            })
        });
        service.expect_download().never();

        let renderer = VideoRenderer::new(Arc::new(service), &heygen_config(), dir.path(), quick_policies());
        let err = renderer.render_turn(1, Speaker::A, Path::new("a.mp3")).await.unwrap_err();
        assert!(matches!(err, StreamError::RenderError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = MockVideoAvatarService::new();
        service.expect_upload_asset().returning(|_| Ok("a".to_string()));
        service.expect_render_video().returning(|_, _, _| Ok("j".to_string()));
        service.expect_poll_status().returning(|_| Ok(RenderStatus::Pending));
        service.expect_download().never();

        let renderer = VideoRenderer::new(Arc::new(service), &heygen_config(), dir.path(), quick_policies());
        let err = renderer.render_turn(1, Speaker::A, Path::new("a.mp3")).await.unwrap_err();
        assert!(matches!(err, StreamError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_character_id_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = MockVideoAvatarService::new();
        let renderer = VideoRenderer::new(
            Arc::new(service),
            &HeygenConfig::default(),
            dir.path(),
            quick_policies(),
        );
        let err = renderer.render_turn(1, Speaker::A, Path::new("a.mp3")).await.unwrap_err();
        assert!(matches!(err, StreamError::ConfigError(_)));
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime(Path::new("x.MP3")), "audio/mpeg");
        assert_eq!(guess_mime(Path::new("x.wav")), "audio/wav");
        assert_eq!(guess_mime(Path::new("x")), "application/octet-stream");
    }
}
