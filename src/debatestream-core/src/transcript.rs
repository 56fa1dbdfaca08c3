//! Append-only JSONL transcript.
//!
//! One JSON object per line, tagged by `event`. Lines are flushed as they
//! are written; readers skip a trailing line that was cut short.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::StreamError;
use crate::participant::Speaker;
use crate::turn::Turn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub ts: DateTime<Local>,
    pub turn_id: u64,
    pub speaker: Speaker,
    pub text: String,
    pub topic: String,
    pub audio_file: Option<PathBuf>,
    pub video_file: Option<PathBuf>,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub llm_latency: f64,
    pub tts_latency: f64,
    pub model: String,
    pub prompt_version: String,
    pub summary_len: usize,
    pub source: String,
}

impl TurnRecord {
    pub fn from_turn(turn: &Turn, source: &str) -> Self {
        Self {
            ts: Local::now(),
            turn_id: turn.turn_id,
            speaker: turn.speaker,
            text: turn.text.clone(),
            topic: turn.topic.clone(),
            audio_file: turn.audio_file.clone(),
            video_file: turn.video_file.clone(),
            session_id: turn.session_id.clone(),
            task_id: turn.task_id.clone(),
            llm_latency: round4(turn.llm_latency_s),
            tts_latency: round4(turn.tts_latency_s),
            model: turn.model.clone(),
            prompt_version: turn.prompt_version.clone(),
            summary_len: turn.summary_len,
            source: source.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicChangeRecord {
    pub ts: DateTime<Local>,
    pub topic: String,
    pub source: String,
    pub author: Option<String>,
    pub ttl_s: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TranscriptEvent {
    Turn(TurnRecord),
    TopicChange(TopicChangeRecord),
}

/// Shared handle to the transcript file. Clones append to the same file.
#[derive(Debug, Clone)]
pub struct TranscriptLog {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl TranscriptLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, event: &TranscriptEvent) -> Result<(), StreamError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn append_turn(&self, turn: &Turn, source: &str) -> Result<(), StreamError> {
        self.append(&TranscriptEvent::Turn(TurnRecord::from_turn(turn, source)))
            .await
    }

    /// Every complete event in the file; a missing file reads as empty.
    pub async fn read_events(&self) -> Result<Vec<TranscriptEvent>, StreamError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut events = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                Err(e) if idx + 1 == lines.len() => {
                    warn!(target: "transcript", error = %e, "ignoring truncated last line");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(events)
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_turn() -> Turn {
        let mut turn = Turn::new(3, "Rotation curves stay flat.");
        turn.audio_file = Some(PathBuf::from("audio/turn_00003_A.mp3"));
        turn.llm_latency_s = 1.234_567;
        turn.model = "m".to_string();
        turn.summary_len = 42;
        turn
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::new(dir.path().join("nested/transcript.jsonl"));

        log.append_turn(&sample_turn(), "llm_tts").await.unwrap();
        log.clone()
            .append(&TranscriptEvent::TopicChange(TopicChangeRecord {
                ts: Local::now(),
                topic: "Galaxy clusters".to_string(),
                source: "youtube".to_string(),
                author: Some("viewer".to_string()),
                ttl_s: 900,
            }))
            .await
            .unwrap();

        let events = log.read_events().await.unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            TranscriptEvent::Turn(record) => {
                assert_eq!(record.turn_id, 3);
                assert_eq!(record.speaker, Speaker::A);
                assert_eq!(record.llm_latency, 1.2346);
                assert_eq!(record.source, "llm_tts");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(&events[1], TranscriptEvent::TopicChange(r) if r.topic == "Galaxy clusters"));

        let raw = tokio::fs::read_to_string(log.path()).await.unwrap();
        assert!(raw.lines().next().unwrap().contains(r#""event":"turn""#));
    }

    #[tokio::test]
    async fn test_tolerates_partial_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::new(dir.path().join("t.jsonl"));
        log.append_turn(&sample_turn(), "llm_tts").await.unwrap();

        let mut file = OpenOptions::new().append(true).open(log.path()).await.unwrap();
        file.write_all(br#"{"event":"turn","turn_id":4,"spea"#).await.unwrap();
        file.flush().await.unwrap();

        let events = log.read_events().await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::new(dir.path().join("absent.jsonl"));
        assert!(log.read_events().await.unwrap().is_empty());
    }
}
