//! Speech synthesis backends.
//!
//! Both backends write to `<out>.tmp` first and rename onto `<out>`, so a
//! player never sees a half-written file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kokoro_tiny::TtsEngine;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::{LlmConfig, TtsConfig};
use crate::error::{StreamError, truncate_for_log};
use crate::participant::Speaker;

/// Kokoro output sample rate.
pub const KOKORO_SAMPLE_RATE: u32 = 24_000;
/// Shortest duration ever reported for a turn.
pub const MIN_DURATION_S: f64 = 0.3;

const KOKORO_CHUNK_CHARS: usize = 200;
const KOKORO_GAP_S: f32 = 0.3;
const KOKORO_TAIL_S: f32 = 0.5;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Write `text` spoken with `voice` to `out_path`.
    async fn synthesize(&self, text: &str, voice: &str, out_path: &Path) -> Result<(), StreamError>;
}

/// `turn_{id:05}_{speaker}.{ext}` under `dir`.
pub fn audio_out_path(dir: &Path, turn_id: u64, speaker: Speaker, ext: &str) -> PathBuf {
    dir.join(format!("turn_{:05}_{}.{}", turn_id, speaker, ext))
}

/// Spoken duration guess from text length.
pub fn estimate_duration(text: &str, chars_per_second: f64) -> f64 {
    let chars = text.chars().count() as f64;
    if chars_per_second <= 0.0 {
        return MIN_DURATION_S;
    }
    (chars / chars_per_second).max(MIN_DURATION_S)
}

/// Sibling path with `suffix` appended to the full file name.
pub(crate) fn temp_sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

pub(crate) async fn ensure_parent(path: &Path) -> Result<(), StreamError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: &'a str,
}

/// OpenAI-compatible `/audio/speech` endpoint, streamed to disk.
pub struct OpenAiSpeech {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    format: String,
}

impl OpenAiSpeech {
    pub fn new(llm: &LlmConfig, tts: &TtsConfig) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(llm.timeout_s))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StreamError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: llm.api_base.trim_end_matches('/').to_string(),
            api_key: llm.api_key.clone(),
            model: tts.model.clone(),
            format: tts.format.clone(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, text: &str, voice: &str, out_path: &Path) -> Result<(), StreamError> {
        let body = SpeechRequest {
            model: &self.model,
            voice,
            input: text,
            response_format: &self.format,
        };
        let mut resp = self
            .http
            .post(format!("{}/audio/speech", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StreamError::ApiError {
                status: status.as_u16(),
                body: truncate_for_log(&body, 300),
            });
        }

        ensure_parent(out_path).await?;
        let tmp = temp_sibling(out_path, ".tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut written = 0usize;
        while let Some(chunk) = resp.chunk().await? {
            written += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if written == 0 {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StreamError::TtsError("empty audio response".to_string()));
        }
        tokio::fs::rename(&tmp, out_path).await?;
        debug!(target: "prefetch", path = %out_path.display(), bytes = written, "speech written");
        Ok(())
    }
}

/// Offline synthesis with kokoro-tiny, written as 16-bit WAV.
pub struct KokoroSpeech {
    engine: Arc<Mutex<TtsEngine>>,
}

impl KokoroSpeech {
    /// Initialize the engine (downloads the model on first run).
    pub async fn new() -> Result<Self, StreamError> {
        let engine = TtsEngine::new()
            .await
            .map_err(|e| StreamError::TtsError(format!("Failed to initialize TTS: {}", e)))?;
        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for KokoroSpeech {
    async fn synthesize(&self, text: &str, voice: &str, out_path: &Path) -> Result<(), StreamError> {
        let engine = Arc::clone(&self.engine);
        let text = text.to_string();
        let voice = voice.to_string();
        let out_path = out_path.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<(), StreamError> {
            let mut engine = engine
                .lock()
                .map_err(|_| StreamError::TtsError("TTS engine lock poisoned".to_string()))?;

            let gap = vec![0.0f32; (KOKORO_GAP_S * KOKORO_SAMPLE_RATE as f32) as usize];
            let mut samples = Vec::new();
            for chunk in split_into_chunks(&text, KOKORO_CHUNK_CHARS) {
                let part = engine
                    .synthesize(&chunk, Some(voice.as_str()))
                    .map_err(|e| StreamError::TtsError(format!("Synthesis failed: {}", e)))?;
                samples.extend(part);
                samples.extend_from_slice(&gap);
            }
            if samples.is_empty() {
                return Err(StreamError::TtsError("nothing to synthesize".to_string()));
            }
            samples.extend(vec![0.0; (KOKORO_TAIL_S * KOKORO_SAMPLE_RATE as f32) as usize]);

            if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = temp_sibling(&out_path, ".tmp");
            write_wav(&tmp, &samples, KOKORO_SAMPLE_RATE)?;
            std::fs::rename(&tmp, &out_path)?;
            Ok(())
        })
        .await
        .map_err(|e| StreamError::TtsError(format!("TTS task failed: {}", e)))?
    }
}

/// Mono 16-bit PCM WAV.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), StreamError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let wav_err = |e: hound::Error| StreamError::TtsError(format!("Failed to write WAV: {}", e));

    let mut writer = hound::WavWriter::create(path, spec).map_err(wav_err)?;
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(value).map_err(wav_err)?;
    }
    writer.finalize().map_err(wav_err)
}

/// Split text at sentence marks (then commas) into chunks of at most
/// `max_chars` where possible.
fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    let mut push_piece = |piece: &str, current: &mut String| {
        if !current.is_empty() && current.len() + piece.len() + 1 > max_chars {
            chunks.push(std::mem::take(current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(piece);
    };

    for sentence in text.split_inclusive(['.', '!', '?', ';', '…']) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        if sentence.len() <= max_chars {
            push_piece(sentence, &mut current);
        } else {
            for part in sentence.split_inclusive(',') {
                let part = part.trim();
                if !part.is_empty() {
                    push_piece(part, &mut current);
                }
            }
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
