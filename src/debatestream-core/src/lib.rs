//! DebateStream Core Library
//!
//! Turn orchestration for an unattended two-persona debate stream: text
//! generation with content rules, speech and avatar-video preparation,
//! prefetching, and paced playback through a broadcast tool.

pub mod artifacts;
pub mod chat;
pub mod config;
pub mod debate_format;
pub mod error;
pub mod heygen;
pub mod heygen_stream;
pub mod llm;
pub mod media;
pub mod mode;
pub mod obs;
pub mod orchestrator;
pub mod participant;
pub mod playback;
pub mod retry;
pub mod rules;
pub mod server;
pub mod summary;
pub mod topic;
pub mod transcript;
pub mod tts;
pub mod turn;

pub use config::{Config, default_config};
pub use debate_format::{BeatSchedule, Stage};
pub use error::StreamError;
pub use mode::OutputMode;
pub use orchestrator::{Collaborators, Orchestrator, StreamCallback, StreamEvent, TopicHandle};
pub use participant::{Persona, Personas, Speaker};
pub use retry::RetryPolicy;
pub use turn::Turn;
