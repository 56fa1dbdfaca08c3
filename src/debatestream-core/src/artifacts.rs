//! Media preparation for a generated turn, per output mode.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::StreamError;
use crate::heygen::VideoRenderer;
use crate::mode::OutputMode;
use crate::participant::{Personas, Speaker};
use crate::retry::{RetryPolicy, retry_or_else};
use crate::tts::{SpeechSynthesizer, audio_out_path, estimate_duration};

/// What playback gets for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// Spoken text; the bridge phrase when speech failed.
    pub text: String,
    pub audio_file: Option<PathBuf>,
    pub video_file: Option<PathBuf>,
    pub duration_estimate_s: Option<f64>,
    pub latency_s: f64,
    /// Speech failed and the bridge phrase stands in.
    pub degraded: bool,
}

impl Artifact {
    fn text_only(text: &str) -> Self {
        Self {
            text: text.to_string(),
            audio_file: None,
            video_file: None,
            duration_estimate_s: None,
            latency_s: 0.0,
            degraded: false,
        }
    }
}

/// Speech result: a file, or the bridge phrase with an estimated duration.
enum Speech {
    Audio(PathBuf),
    Bridge { text: String, estimate_s: f64 },
}

pub struct ArtifactPreparer {
    mode: OutputMode,
    speech: Option<Arc<dyn SpeechSynthesizer>>,
    renderer: Option<VideoRenderer>,
    personas: Personas,
    audio_dir: PathBuf,
    audio_ext: String,
    chars_per_second: f64,
    speech_policy: RetryPolicy,
}

impl ArtifactPreparer {
    pub fn new(mode: OutputMode, personas: Personas, audio_dir: impl Into<PathBuf>, speech_policy: RetryPolicy) -> Self {
        Self {
            mode,
            speech: None,
            renderer: None,
            personas,
            audio_dir: audio_dir.into(),
            audio_ext: "mp3".to_string(),
            chars_per_second: 14.0,
            speech_policy,
        }
    }

    pub fn with_speech(mut self, speech: Arc<dyn SpeechSynthesizer>, audio_ext: impl Into<String>) -> Self {
        self.speech = Some(speech);
        self.audio_ext = audio_ext.into();
        self
    }

    pub fn with_renderer(mut self, renderer: VideoRenderer) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_chars_per_second(mut self, chars_per_second: f64) -> Self {
        self.chars_per_second = chars_per_second;
        self
    }

    /// Check that the collaborators the mode needs are present.
    pub fn validate(&self) -> Result<(), StreamError> {
        let missing = match self.mode {
            OutputMode::Png if self.speech.is_none() => Some("speech synthesizer"),
            OutputMode::HeygenVideo if self.speech.is_none() => Some("speech synthesizer"),
            OutputMode::HeygenVideo if self.renderer.is_none() => Some("video renderer"),
            _ => None,
        };
        match missing {
            Some(what) => Err(StreamError::ConfigError(format!(
                "{} mode needs a {}",
                self.mode, what
            ))),
            None => Ok(()),
        }
    }

    /// Produce media for `text`. Only video rendering failures are errors.
    pub async fn prepare(&self, turn_id: u64, speaker: Speaker, text: &str) -> Result<Artifact, StreamError> {
        let started = Instant::now();
        let mut artifact = match self.mode {
            OutputMode::Text | OutputMode::HeygenStream => return Ok(Artifact::text_only(text)),
            OutputMode::Png => match self.synthesize(turn_id, speaker, text).await? {
                Speech::Audio(path) => Artifact {
                    audio_file: Some(path),
                    ..Artifact::text_only(text)
                },
                Speech::Bridge { text, estimate_s } => self.degraded(text, estimate_s),
            },
            OutputMode::HeygenVideo => {
                let renderer = self
                    .renderer
                    .as_ref()
                    .ok_or_else(|| StreamError::ConfigError("video renderer not configured".to_string()))?;
                if let Some(video) = renderer.cached(turn_id, speaker).await {
                    return Ok(Artifact {
                        video_file: Some(video),
                        ..Artifact::text_only(text)
                    });
                }
                match self.synthesize(turn_id, speaker, text).await? {
                    Speech::Audio(audio) => {
                        let video = renderer.render_turn(turn_id, speaker, &audio).await?;
                        Artifact {
                            video_file: Some(video),
                            ..Artifact::text_only(text)
                        }
                    }
                    Speech::Bridge { text, estimate_s } => self.degraded(text, estimate_s),
                }
            }
        };
        artifact.latency_s = started.elapsed().as_secs_f64();
        debug!(target: "prefetch", turn = turn_id, latency_s = artifact.latency_s, "media ready");
        Ok(artifact)
    }

    fn degraded(&self, text: String, estimate_s: f64) -> Artifact {
        Artifact {
            duration_estimate_s: Some(estimate_s),
            degraded: true,
            ..Artifact::text_only(&text)
        }
    }

    async fn synthesize(&self, turn_id: u64, speaker: Speaker, text: &str) -> Result<Speech, StreamError> {
        let speech = self
            .speech
            .as_ref()
            .ok_or_else(|| StreamError::ConfigError("speech synthesizer not configured".to_string()))?;
        let persona = self.personas.get(speaker);
        let out = audio_out_path(&self.audio_dir, turn_id, speaker, &self.audio_ext);
        let op_name = format!("tts_{}", speaker);

        let (voice, target) = (persona.voice.as_str(), out.as_path());
        let outcome = retry_or_else(
            &self.speech_policy,
            &op_name,
            move || async move { speech.synthesize(text, voice, target).await.map(|()| true) },
            |err| {
                warn!(target: "prefetch", turn = turn_id, error = %err, "speech failed, using bridge phrase");
                false
            },
        )
        .await;

        if outcome {
            return Ok(Speech::Audio(out));
        }
        let bridge = persona.bridge_phrase.clone();
        let estimate_s = estimate_duration(&bridge, self.chars_per_second);
        Ok(Speech::Bridge {
            text: bridge,
            estimate_s,
        })
    }
}
