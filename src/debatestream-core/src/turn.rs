//! Produced turns and the conversation history they feed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::participant::Speaker;

/// One line of the conversation as seen by the rules and the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub speaker: Speaker,
    pub text: String,
}

impl HistoryEntry {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

/// A prepared turn waiting in, or taken from, the playback queue.
///
/// Only `session_id`, `task_id` and `duration_estimate_s` are written after
/// the turn has been enqueued, and only by the playback side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub turn_id: u64,
    pub speaker: Speaker,
    pub text: String,
    pub topic: String,
    pub audio_file: Option<PathBuf>,
    pub video_file: Option<PathBuf>,
    /// Estimated playback length when there is nothing to measure.
    pub duration_estimate_s: Option<f64>,
    pub llm_latency_s: f64,
    pub tts_latency_s: f64,
    pub model: String,
    pub prompt_version: String,
    pub summary_len: usize,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
}

impl Turn {
    pub fn new(turn_id: u64, text: impl Into<String>) -> Self {
        Self {
            turn_id,
            speaker: Speaker::for_turn(turn_id),
            text: text.into(),
            topic: String::new(),
            audio_file: None,
            video_file: None,
            duration_estimate_s: None,
            llm_latency_s: 0.0,
            tts_latency_s: 0.0,
            model: String::new(),
            prompt_version: String::new(),
            summary_len: 0,
            session_id: None,
            task_id: None,
        }
    }

    /// The artifact played for this turn, video first.
    pub fn media_file(&self) -> Option<&PathBuf> {
        self.video_file.as_ref().or(self.audio_file.as_ref())
    }

    pub fn history_entry(&self) -> HistoryEntry {
        HistoryEntry::new(self.speaker, self.text.clone())
    }
}
