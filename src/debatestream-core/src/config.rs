//! Configuration module for loading TOML config files.
//!
//! Every section carries `#[serde(default)]`, so an empty file is a valid
//! configuration. Environment variables (the names used by the deployed
//! stream) are layered on top by [`Config::apply_env`].

use serde::Deserialize;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::StreamError;
use crate::mode::{self, OutputMode};
use crate::participant::{Persona, Personas, Speaker};
use crate::retry::RetryPolicy;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub summary: SummaryConfig,
    pub topic: TopicConfig,
    pub personas: Personas,
    pub rules: RulesConfig,
    pub obs: ObsConfig,
    pub heygen: HeygenConfig,
    pub chat: ChatConfig,
    pub retry: RetryConfig,
    pub server: ServerConfig,
}

/// Orchestrator and playback settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub mode: OutputMode,
    /// Last turn to produce; 0 runs forever.
    pub max_turns: u64,
    /// Prefetch keeps the queue at or above this many turns.
    pub min_queue_items: usize,
    /// History cap; 0 keeps everything.
    pub history_max: usize,
    pub max_sentences: usize,
    pub idle_sleep_s: f64,
    pub playback_pad_s: f64,
    pub text_only_sleep_s: f64,
    pub prefetch_idle_ms: u64,
    pub prefetch_error_delay_s: f64,
    /// Speaking rate used when a duration has to be estimated from text.
    pub chars_per_second: f64,
    pub audio_dir: PathBuf,
    pub video_dir: PathBuf,
    pub transcript_path: PathBuf,
    pub prompt_version: String,
    pub anchor_case: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mode: OutputMode::Png,
            max_turns: 25,
            min_queue_items: 2,
            history_max: 48,
            max_sentences: 2,
            idle_sleep_s: 1.0,
            playback_pad_s: 0.15,
            text_only_sleep_s: 0.5,
            prefetch_idle_ms: 200,
            prefetch_error_delay_s: 1.0,
            chars_per_second: 14.0,
            audio_dir: PathBuf::from("audio/preloaded"),
            video_dir: PathBuf::from("video/rendered"),
            transcript_path: PathBuf::from("transcripts/transcript.jsonl"),
            prompt_version: "v1".to_string(),
            anchor_case: String::new(),
        }
    }
}

/// OpenAI-compatible text generation endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub timeout_s: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4.1-mini".to_string(),
            max_tokens: None,
            timeout_s: 120,
        }
    }
}

/// Which speech backend produces audio files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsEngineKind {
    OpenAi,
    Kokoro,
}

impl FromStr for TtsEngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(TtsEngineKind::OpenAi),
            "kokoro" => Ok(TtsEngineKind::Kokoro),
            other => Err(format!("unknown TTS engine '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub engine: TtsEngineKind,
    pub model: String,
    /// File extension and response format (`mp3`, `wav`, ...).
    pub format: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            engine: TtsEngineKind::OpenAi,
            model: "gpt-4o-mini-tts".to_string(),
            format: "mp3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Defaults to the generation model.
    pub model: Option<String>,
    /// Summarize after every turn whose number is a multiple of this; <= 0 disables.
    pub every_n_turns: i64,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            model: None,
            every_n_turns: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Name of the environment variable holding a topic.
    pub topic_env: String,
    pub topic_file: PathBuf,
    /// Minimum seconds between modification-time checks of the topic file.
    pub reload_s: u64,
    pub default_topic: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            topic_env: "TOPIC".to_string(),
            topic_file: PathBuf::from("topic.txt"),
            reload_s: 180,
            default_topic: DEFAULT_TOPIC.to_string(),
        }
    }
}

/// A labelled keyword classifier; a text matches when it contains every
/// `all` substring and at least one `any` substring (empty lists match).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TestClassSpec {
    pub label: String,
    #[serde(default)]
    pub all: Vec<String>,
    #[serde(default)]
    pub any: Vec<String>,
}

impl TestClassSpec {
    pub fn any(label: &str, any: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            all: Vec::new(),
            any: any.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn all_any(label: &str, all: &[&str], any: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            all: all.iter().map(|s| s.to_string()).collect(),
            any: any.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Texts injected by the content rules. `{max}`, `{window}`, `{blocked}`,
/// `{allowed}` and `{test}` are expanded where noted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectiveTexts {
    pub roundup: String,
    pub intro_a: String,
    pub intro_b: String,
    pub methodology_loop: String,
    pub term_repeat: String,
    pub discriminator: String,
    /// `{max}`, `{window}`, `{blocked}`.
    pub throttle: String,
    /// `{allowed}`; appended to `throttle` when something is still allowed.
    pub throttle_allowed: String,
    pub plane_shift: String,
    pub question: String,
    pub steelman_a: String,
    pub steelman_b: String,
    /// `{test}`.
    pub test_switch: String,
    pub observations: String,
    pub interpretation: String,
    pub final_round_a: String,
    pub final_round_b: String,
    pub closing: String,
}

impl Default for DirectiveTexts {
    fn default() -> Self {
        Self {
            roundup: "Level shift: 1-2 sentences with three short items: (1) what the observations \
                      support more strongly right now, (2) what could flip it, (3) the next most \
                      decisive test."
                .to_string(),
            intro_a: "Stream opening: a short greeting, the topic and the format of the discussion."
                .to_string(),
            intro_b: "Discussion kickoff: briefly state both positions and pose the first \
                      substantive challenge."
                .to_string(),
            methodology_loop: "Anti-loop: give a concrete expected signal OR name the minimum data \
                               needed to choose between the models."
                .to_string(),
            term_repeat: "Do not repeat the lensing/offset/center-of-mass/gas/multi-wavelength motif \
                          two turns in a row: switch to another test class and add a new measurable \
                          criterion."
                .to_string(),
            discriminator: "Do not use the template \"Observation X distinguishes A from B because...\" \
                            in this turn; rephrase naturally."
                .to_string(),
            throttle: "A test class may not be used more than {max} times in {window} turns. \
                       Blocked now: {blocked}."
                .to_string(),
            throttle_allowed: " Pick another class: {allowed}.".to_string(),
            plane_shift: "Change of plane: the next test must not be about galaxy clusters \
                          (collisions included)."
                .to_string(),
            question: "Ask your opponent a short question.".to_string(),
            steelman_a: "Steelman: say it as \"The strongest case for MOND is ...\".".to_string(),
            steelman_b: "Steelman: say it as \"The strongest case for LCDM is ...\".".to_string(),
            test_switch: "Switch the type of test (keep it dark matter vs MOND): {test}.".to_string(),
            observations: "Focus on observations and signatures right now (concrete tests, minimal \
                           interpretation)."
                .to_string(),
            interpretation: "Focus on interpretation and consequences right now (how the result \
                             shifts the balance, still tied to a test)."
                .to_string(),
            final_round_a: "Final round A: what is stronger today and why, in 2 short points."
                .to_string(),
            final_round_b: "Final round B: steelman the position of A, plus what would change your \
                            mind, in 2 points."
                .to_string(),
            closing: "Stream closing: a short recap, thanks to the viewers, a goodbye and an explicit \
                      ending. Keep it to 2 sentences."
                .to_string(),
        }
    }
}

/// Content rule tuning: cadences, scripted beats and keyword tables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub roundup_every_n: u64,
    pub question_every_n: u64,
    pub steelman_every_n: u64,
    pub steelman_a_offset: u64,
    pub steelman_b_offset: u64,
    pub intro_turn_a: u64,
    pub intro_turn_b: u64,
    /// Derived from `max_turns` when unset.
    pub final_round_a: Option<u64>,
    pub final_round_b: Option<u64>,
    pub closing_turn: Option<u64>,
    pub test_class_window: usize,
    pub test_class_max: usize,
    pub test_switch_every_n: u64,
    pub obs_interp_block: u64,
    pub methodology_keywords: Vec<String>,
    pub repeat_terms: Vec<String>,
    /// All of these must appear in the latest line to trigger the rephrase rule.
    pub discriminator_markers: Vec<String>,
    /// Ordered; the first matching spec wins.
    pub test_classes: Vec<TestClassSpec>,
    pub test_cycle: Vec<String>,
    /// Label whose blocking triggers the extra change-of-plane directive.
    pub plane_shift_class: Option<String>,
    pub directives: DirectiveTexts,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            roundup_every_n: 6,
            question_every_n: 3,
            steelman_every_n: 8,
            steelman_a_offset: 4,
            steelman_b_offset: 0,
            intro_turn_a: 1,
            intro_turn_b: 2,
            final_round_a: None,
            final_round_b: None,
            closing_turn: None,
            test_class_window: 10,
            test_class_max: 2,
            test_switch_every_n: 4,
            obs_interp_block: 4,
            methodology_keywords: strings(&[
                "shield",
                "control",
                "noise",
                "interference",
                "error bar",
                "confound",
                "environment",
                "vacuum",
                "isolat",
            ]),
            repeat_terms: strings(&[
                "lensing",
                "systematic",
                "multi-wavelength",
                "gas",
                "x-ray",
                "potential",
                "offset",
                "center of mass",
                "centre of mass",
            ]),
            discriminator_markers: strings(&["distinguishes", "because"]),
            test_classes: vec![
                TestClassSpec::any(
                    "cluster collisions",
                    &["cluster", "bullet", "el gordo", "collision"],
                ),
                TestClassSpec::any("weak lensing", &["weak lensing", "lensing", "shear"]),
                TestClassSpec::all_any("rotation curves", &["rotation"], &["curve", "flat"]),
                TestClassSpec::any(
                    "satellite dynamics",
                    &["satellite", "subhalo", "substructure", "orbit", "dwarf"],
                ),
                TestClassSpec::any(
                    "CMB+BAO",
                    &["cmb", "bao", "acoustic", "microwave background"],
                ),
                TestClassSpec::any(
                    "direct detection",
                    &[
                        "direct detection",
                        "xenon",
                        "liquid argon",
                        "dama/libra",
                        "lux-zeplin",
                        "supercdms",
                    ],
                ),
                TestClassSpec::any(
                    "structure growth",
                    &[
                        "growth of structure",
                        "structure growth",
                        "sigma_8",
                        "sigma8",
                        "fs8",
                        "redshift-space",
                    ],
                ),
            ],
            test_cycle: strings(&[
                "rotation curves",
                "weak lensing",
                "satellite dynamics",
                "cluster collisions",
                "CMB+BAO",
                "direct detection",
                "structure growth",
            ]),
            plane_shift_class: Some("cluster collisions".to_string()),
            directives: DirectiveTexts::default(),
        }
    }
}

/// Broadcast-control connection and presentation targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObsConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub scene_a: String,
    pub scene_b: String,
    pub scene_idle: String,
    pub audio_player: String,
    pub video_player_a: String,
    pub video_player_b: String,
    /// Asset played during the startup self-check.
    pub test_media: PathBuf,
    pub avatar_a_source: String,
    pub avatar_b_source: String,
    pub filter_speak: String,
    pub filter_dim: String,
    pub highlight_enabled: bool,
    pub overlay_speaker: String,
    pub overlay_topic: String,
    pub overlay_stage: String,
    pub overlays_enabled: bool,
    pub poll_ms: u64,
    pub start_timeout_s: f64,
    pub max_play_s: f64,
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4455,
            password: String::new(),
            scene_a: "SCENE_A".to_string(),
            scene_b: "SCENE_B".to_string(),
            scene_idle: "SCENE_IDLE".to_string(),
            audio_player: "AUDIO_PLAYER".to_string(),
            video_player_a: "VIDEO_PLAYER".to_string(),
            video_player_b: "VIDEO_PLAYER".to_string(),
            test_media: PathBuf::from("audio/test.wav"),
            avatar_a_source: "AVATAR_A".to_string(),
            avatar_b_source: "AVATAR_B".to_string(),
            filter_speak: "SPEAK".to_string(),
            filter_dim: "DIM".to_string(),
            highlight_enabled: true,
            overlay_speaker: "TXT_SPEAKER".to_string(),
            overlay_topic: "TXT_TOPIC".to_string(),
            overlay_stage: "TXT_STAGE".to_string(),
            overlays_enabled: true,
            poll_ms: 300,
            start_timeout_s: 5.0,
            max_play_s: 60.0,
        }
    }
}

impl ObsConfig {
    pub fn websocket_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn scene_for(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::A => &self.scene_a,
            Speaker::B => &self.scene_b,
        }
    }

    pub fn video_player_for(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::A => &self.video_player_a,
            Speaker::B => &self.video_player_b,
        }
    }

    pub fn avatar_source_for(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::A => &self.avatar_a_source,
            Speaker::B => &self.avatar_b_source,
        }
    }
}

/// Per-speaker avatar identities for the video and streaming services.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    /// `avatar` or `talking_photo`.
    pub character_type: String,
    pub character_id: String,
    pub avatar_style: Option<String>,
    pub stream_avatar_name: Option<String>,
    pub stream_avatar_id: Option<String>,
    pub stream_voice_id: Option<String>,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            character_type: "avatar".to_string(),
            character_id: String::new(),
            avatar_style: None,
            stream_avatar_name: None,
            stream_avatar_id: None,
            stream_voice_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeygenConfig {
    pub api_key: String,
    pub api_base: String,
    pub upload_url: String,
    pub timeout_s: u64,
    pub width: u32,
    pub height: u32,
    pub poll_interval_s: f64,
    pub poll_timeout_s: f64,
    pub stream_quality: String,
    pub stream_voice_rate: f32,
    pub sessions_file: PathBuf,
    pub avatar_a: AvatarConfig,
    pub avatar_b: AvatarConfig,
}

impl Default for HeygenConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: "https://api.heygen.com".to_string(),
            upload_url: "https://upload.heygen.com/v1/asset".to_string(),
            timeout_s: 120,
            width: 1280,
            height: 720,
            poll_interval_s: 5.0,
            poll_timeout_s: 600.0,
            stream_quality: "high".to_string(),
            stream_voice_rate: 1.0,
            sessions_file: PathBuf::from("stream_sessions.json"),
            avatar_a: AvatarConfig::default(),
            avatar_b: AvatarConfig::default(),
        }
    }
}

impl HeygenConfig {
    pub fn avatar(&self, speaker: Speaker) -> &AvatarConfig {
        match speaker {
            Speaker::A => &self.avatar_a,
            Speaker::B => &self.avatar_b,
        }
    }
}

/// Live-chat topic watcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub api_key: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub live_chat_id: String,
    pub broadcast_id: String,
    pub command_prefix: String,
    pub cooldown_s: u64,
    pub topic_ttl_s: u64,
    /// Channel ids or display names; when non-empty only these may set topics.
    pub allowlist: Vec<String>,
    pub mods_only: bool,
    pub poll_fallback_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token: String::new(),
            live_chat_id: String::new(),
            broadcast_id: String::new(),
            command_prefix: "!topic".to_string(),
            cooldown_s: 180,
            topic_ttl_s: 900,
            allowlist: Vec::new(),
            mods_only: true,
            poll_fallback_ms: 2000,
        }
    }
}

impl ChatConfig {
    /// Whether there is enough to locate a chat and authenticate.
    pub fn is_enabled(&self) -> bool {
        let has_chat = !self.live_chat_id.is_empty() || !self.broadcast_id.is_empty();
        let has_auth = !self.api_key.is_empty()
            || (!self.client_id.is_empty()
                && !self.client_secret.is_empty()
                && !self.refresh_token.is_empty());
        has_chat && has_auth
    }
}

/// Independent retry budgets per external call category.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RetryConfig {
    pub text: RetryPolicy,
    pub summary: RetryPolicy,
    pub speech: RetryPolicy,
    pub upload: RetryPolicy,
    pub render: RetryPolicy,
    pub poll: RetryPolicy,
    pub download: RetryPolicy,
    pub streaming: RetryPolicy,
}

/// Session page server (streaming avatar mode).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub web_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8099,
            web_root: PathBuf::from("web"),
        }
    }
}

impl Default for Personas {
    fn default() -> Self {
        Self {
            a: Persona::new("Scientist", DEFAULT_SCIENTIST_PROMPT)
                .with_voice("alloy")
                .with_bridge_phrase("Let me pause on that for a second and come back to the evidence."),
            b: Persona::new("Skeptic", DEFAULT_SKEPTIC_PROMPT)
                .with_voice("verse")
                .with_bridge_phrase("Hold on, let's look at that from another angle."),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StreamError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| StreamError::ConfigError(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| StreamError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from string content.
    pub fn from_str(content: &str) -> Result<Self, StreamError> {
        toml::from_str(content)
            .map_err(|e| StreamError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Override fields from the process environment.
    pub fn apply_env(&mut self) -> Result<(), StreamError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Override fields from an arbitrary key lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), StreamError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        if let Some(mode) = mode::mode_from_env(&lookup) {
            self.stream.mode = mode;
        }

        let s = &mut self.stream;
        env.parse("MAX_TURNS", &mut s.max_turns)?;
        env.parse("MIN_QUEUE_ITEMS", &mut s.min_queue_items)?;
        env.parse("HISTORY_MAX", &mut s.history_max)?;
        env.parse("MAX_SENTENCES", &mut s.max_sentences)?;
        env.parse("IDLE_SLEEP_S", &mut s.idle_sleep_s)?;
        env.parse("PLAYBACK_PAD_S", &mut s.playback_pad_s)?;
        env.parse("TEXT_ONLY_SLEEP_S", &mut s.text_only_sleep_s)?;
        env.parse("CHARS_PER_SECOND", &mut s.chars_per_second)?;
        env.path("AUDIO_DIR", &mut s.audio_dir);
        env.path("VIDEO_DIR", &mut s.video_dir);
        env.path("TRANSCRIPT_PATH", &mut s.transcript_path);
        env.string("PROMPT_VERSION", &mut s.prompt_version);
        env.string("ANCHOR_CASE", &mut s.anchor_case);

        let l = &mut self.llm;
        env.string("OPENAI_BASE_URL", &mut l.api_base);
        env.string("OPENAI_API_BASE", &mut l.api_base);
        env.string("OPENAI_API_KEY", &mut l.api_key);
        env.string("OPENAI_MODEL", &mut l.model);
        env.opt_parse("OPENAI_MAX_TOKENS", &mut l.max_tokens)?;

        env.parse("TTS_ENGINE", &mut self.tts.engine)?;
        env.string("TTS_MODEL", &mut self.tts.model);
        env.string("TTS_FORMAT", &mut self.tts.format);
        env.string("TTS_VOICE_A", &mut self.personas.a.voice);
        env.string("TTS_VOICE_B", &mut self.personas.b.voice);
        env.string("BRIDGE_PHRASE_A", &mut self.personas.a.bridge_phrase);
        env.string("BRIDGE_PHRASE_B", &mut self.personas.b.bridge_phrase);

        env.opt_string("SUMMARY_MODEL", &mut self.summary.model);
        env.parse("SUMMARY_EVERY_N", &mut self.summary.every_n_turns)?;

        let t = &mut self.topic;
        env.string("TOPIC_ENV", &mut t.topic_env);
        env.path("TOPIC_FILE", &mut t.topic_file);
        env.parse("TOPIC_RELOAD_S", &mut t.reload_s)?;
        env.string("TOPIC_DEFAULT", &mut t.default_topic);

        let r = &mut self.rules;
        env.parse("ROUNDUP_EVERY_N", &mut r.roundup_every_n)?;
        env.parse("STEELMAN_EVERY_N", &mut r.steelman_every_n)?;
        env.parse("STEELMAN_A_OFFSET", &mut r.steelman_a_offset)?;
        env.parse("STEELMAN_B_OFFSET", &mut r.steelman_b_offset)?;
        env.parse("STREAM_INTRO_TURN_A", &mut r.intro_turn_a)?;
        env.parse("STREAM_INTRO_TURN_B", &mut r.intro_turn_b)?;
        env.opt_parse("FINAL_ROUND_A", &mut r.final_round_a)?;
        env.opt_parse("FINAL_ROUND_B", &mut r.final_round_b)?;
        env.opt_parse("STREAM_CLOSING_TURN", &mut r.closing_turn)?;
        env.parse("TEST_CLASS_WINDOW", &mut r.test_class_window)?;
        env.parse("TEST_CLASS_MAX", &mut r.test_class_max)?;
        env.parse("TEST_SWITCH_EVERY_N", &mut r.test_switch_every_n)?;
        env.parse("OBS_INTERP_BLOCK", &mut r.obs_interp_block)?;

        let o = &mut self.obs;
        env.string("OBS_HOST", &mut o.host);
        env.parse("OBS_PORT", &mut o.port)?;
        env.string("OBS_PASSWORD", &mut o.password);
        env.string("SCENE_A", &mut o.scene_a);
        env.string("SCENE_B", &mut o.scene_b);
        env.string("SCENE_IDLE", &mut o.scene_idle);
        env.string("AUDIO_PLAYER", &mut o.audio_player);
        if let Some(player) = env.get("VIDEO_PLAYER") {
            o.video_player_a = player.clone();
            o.video_player_b = player;
        }
        env.string("VIDEO_PLAYER_A", &mut o.video_player_a);
        env.string("VIDEO_PLAYER_B", &mut o.video_player_b);
        env.path("TEST_WAV", &mut o.test_media);
        env.string("AVATAR_A_SOURCE", &mut o.avatar_a_source);
        env.string("AVATAR_B_SOURCE", &mut o.avatar_b_source);
        env.string("FILTER_SPEAK", &mut o.filter_speak);
        env.string("FILTER_DIM", &mut o.filter_dim);
        env.flag("OBS_HIGHLIGHT", &mut o.highlight_enabled);
        env.flag("OBS_OVERLAYS", &mut o.overlays_enabled);
        env.parse("POLL_MS", &mut o.poll_ms)?;

        let h = &mut self.heygen;
        env.string("HEYGEN_API_KEY", &mut h.api_key);
        env.string("HEYGEN_API_BASE", &mut h.api_base);
        env.string("HEYGEN_UPLOAD_URL", &mut h.upload_url);
        env.parse("HEYGEN_WIDTH", &mut h.width)?;
        env.parse("HEYGEN_HEIGHT", &mut h.height)?;
        env.parse("HEYGEN_POLL_S", &mut h.poll_interval_s)?;
        env.parse("HEYGEN_POLL_TIMEOUT_S", &mut h.poll_timeout_s)?;
        env.string("HEYGEN_STREAM_QUALITY", &mut h.stream_quality);
        env.path("STREAM_SESSION_FILE", &mut h.sessions_file);
        for (suffix, avatar) in [("A", &mut h.avatar_a), ("B", &mut h.avatar_b)] {
            env.string(&format!("HEYGEN_CHARACTER_TYPE_{suffix}"), &mut avatar.character_type);
            env.string(&format!("HEYGEN_CHARACTER_ID_{suffix}"), &mut avatar.character_id);
            env.opt_string(&format!("HEYGEN_AVATAR_STYLE_{suffix}"), &mut avatar.avatar_style);
            env.opt_string(&format!("HEYGEN_STREAM_AVATAR_{suffix}"), &mut avatar.stream_avatar_name);
            env.opt_string(&format!("HEYGEN_STREAM_AVATAR_ID_{suffix}"), &mut avatar.stream_avatar_id);
            env.opt_string(&format!("HEYGEN_STREAM_VOICE_{suffix}"), &mut avatar.stream_voice_id);
        }

        let c = &mut self.chat;
        env.string("YOUTUBE_API_KEY", &mut c.api_key);
        env.string("YOUTUBE_CLIENT_ID", &mut c.client_id);
        env.string("YOUTUBE_CLIENT_SECRET", &mut c.client_secret);
        env.string("YOUTUBE_REFRESH_TOKEN", &mut c.refresh_token);
        env.string("YOUTUBE_LIVE_CHAT_ID", &mut c.live_chat_id);
        env.string("YOUTUBE_BROADCAST_ID", &mut c.broadcast_id);
        env.string("YOUTUBE_TOPIC_PREFIX", &mut c.command_prefix);
        env.parse("YOUTUBE_TOPIC_COOLDOWN_S", &mut c.cooldown_s)?;
        env.parse("YOUTUBE_TOPIC_TTL_S", &mut c.topic_ttl_s)?;
        env.flag("YOUTUBE_MODS_ONLY", &mut c.mods_only);
        if let Some(raw) = env.get("YOUTUBE_TOPIC_ALLOWLIST") {
            c.allowlist = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        env.string("STREAM_SERVER_HOST", &mut self.server.host);
        env.parse("STREAM_SERVER_PORT", &mut self.server.port)?;
        env.path("STREAM_WEB_ROOT", &mut self.server.web_root);

        Ok(())
    }

    /// Get the persona for a speaker.
    pub fn persona(&self, speaker: Speaker) -> &Persona {
        self.personas.get(speaker)
    }

    /// Model used for the running summary.
    pub fn summary_model(&self) -> &str {
        self.summary.model.as_deref().unwrap_or(&self.llm.model)
    }
}

/// Default configuration embedded in the binary.
pub fn default_config() -> Config {
    Config::default()
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Non-empty, trimmed value.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = self.get(key) {
            *target = value;
        }
    }

    fn opt_string(&self, key: &str, target: &mut Option<String>) {
        if let Some(value) = self.get(key) {
            *target = Some(value);
        }
    }

    fn path(&self, key: &str, target: &mut PathBuf) {
        if let Some(value) = self.get(key) {
            *target = PathBuf::from(value);
        }
    }

    fn flag(&self, key: &str, target: &mut bool) {
        if let Some(value) = self.get(key) {
            *target = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }

    fn parse<T>(&self, key: &str, target: &mut T) -> Result<(), StreamError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = self.get(key) {
            *target = value.parse().map_err(|e| {
                StreamError::ConfigError(format!("Invalid value for {}: '{}' ({})", key, value, e))
            })?;
        }
        Ok(())
    }

    fn opt_parse<T>(&self, key: &str, target: &mut Option<T>) -> Result<(), StreamError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = self.get(key) {
            let parsed = value.parse::<T>().map_err(|e| {
                StreamError::ConfigError(format!("Invalid value for {}: '{}' ({})", key, value, e))
            })?;
            *target = Some(parsed);
        }
        Ok(())
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

const DEFAULT_TOPIC: &str = "Dark matter or modified gravity: what do the observations really say?";

const DEFAULT_SCIENTIST_PROMPT: &str = r#"You are {name}. You speak in a lively, human way, but precisely.

DISCUSSION TOPIC: {topic}

ANSWER FORMAT:
- 1-2 sentences (6-10 seconds of speech); 3 sentences only if the meaning would otherwise be lost
- A clear thought, then one concrete argument, and ALWAYS end with a testable prediction or signal
  ("if X is true, then under Y we will see Z")

STYLE RULES:
- Do not stop at "we need to measure it": name the expected sign or direction of the effect, without numbers
- State the competing hypotheses explicitly
- Start from a concrete case or example; avoid generic statements like "theories should..."
- No jargon unless it takes part in the test or prediction
- Avoid "certainly", "unambiguously", "definitely"; say "strongly supports", "shifts the balance" instead
- If you are unsure, mark the claim as a hypothesis
- Short conversational connectors are fine, bureaucratic language is not
- Do not repeat ideas from the last 3 lines

CRITICAL OUTPUT RULES:
- Output ONLY your spoken words - no stage directions, no markdown, no asterisks
"#;

const DEFAULT_SKEPTIC_PROMPT: &str = r#"You are {name}. You check claims critically, but without toxicity.

DISCUSSION TOPIC: {topic}

ANSWER FORMAT:
- 1-2 sentences (6-10 seconds of speech); 3 sentences only if the meaning would otherwise be lost
- A counterargument or doubt plus an alternative explanation OR a counter-test
- ALWAYS end with how to tell them apart (which test or observation separates X from Z)

STYLE RULES:
- Do not stop at "we need to measure it": name the expected sign or direction of the effect, without numbers
- State the competing hypotheses explicitly
- Start from a concrete case or example; avoid generic statements
- Avoid "certainly", "unambiguously", "definitely"; say "strongly supports", "shifts the balance" instead
- If you are unsure, mark the claim as a hypothesis
- Short conversational connectors are fine, bureaucratic language is not
- Do not repeat ideas from the last 3 lines

CRITICAL OUTPUT RULES:
- Output ONLY your spoken words - no stage directions, no markdown, no asterisks
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.stream.max_turns, 25);
        assert_eq!(config.stream.min_queue_items, 2);
        assert_eq!(config.rules.test_class_window, 10);
        assert_eq!(config.rules.test_classes.len(), 7);
        assert_eq!(config.personas.a.name, "Scientist");
        assert_eq!(config.retry.upload, RetryPolicy::default());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = Config::from_str(
            r#"
            [stream]
            max_turns = 4
            mode = "text"

            [rules]
            methodology_keywords = ["loop"]

            [[rules.test_classes]]
            label = "L"
            any = ["ell"]

            [retry.render]
            max_retries = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.stream.max_turns, 4);
        assert_eq!(config.stream.mode, OutputMode::Text);
        assert_eq!(config.stream.history_max, 48);
        assert_eq!(config.rules.methodology_keywords, vec!["loop".to_string()]);
        assert_eq!(config.rules.test_classes, vec![TestClassSpec::any("L", &["ell"])]);
        assert_eq!(config.retry.render.max_retries, 2);
        assert_eq!(config.retry.render.base_delay_s, 0.8);
    }

    #[test]
    fn test_apply_env_overrides() {
        let mut config = default_config();
        config
            .apply_env_from(lookup(&[
                ("MAX_TURNS", "10"),
                ("SCENE_A", "Left"),
                ("TTS_VOICE_B", "onyx"),
                ("FINAL_ROUND_A", "7"),
                ("VIDEO_PLAYER", "VP"),
                ("YOUTUBE_TOPIC_ALLOWLIST", "chan1, Bob ,"),
                ("TEXT_ONLY", "1"),
                ("OPENAI_MODEL", "  "),
            ]))
            .unwrap();

        assert_eq!(config.stream.max_turns, 10);
        assert_eq!(config.obs.scene_a, "Left");
        assert_eq!(config.personas.b.voice, "onyx");
        assert_eq!(config.rules.final_round_a, Some(7));
        assert_eq!(config.obs.video_player_a, "VP");
        assert_eq!(config.obs.video_player_b, "VP");
        assert_eq!(config.chat.allowlist, vec!["chan1".to_string(), "Bob".to_string()]);
        assert_eq!(config.stream.mode, OutputMode::Text);
        assert_eq!(config.llm.model, "gpt-4.1-mini");
    }

    #[test]
    fn test_apply_env_rejects_bad_number() {
        let mut config = default_config();
        let err = config
            .apply_env_from(lookup(&[("MIN_QUEUE_ITEMS", "two")]))
            .unwrap_err();
        match err {
            StreamError::ConfigError(msg) => assert!(msg.contains("MIN_QUEUE_ITEMS")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_summary_model_falls_back_to_llm_model() {
        let mut config = default_config();
        assert_eq!(config.summary_model(), "gpt-4.1-mini");
        config.summary.model = Some("gpt-4o-mini".to_string());
        assert_eq!(config.summary_model(), "gpt-4o-mini");
    }

    #[test]
    fn test_chat_enabled_requires_chat_and_auth() {
        let mut chat = ChatConfig::default();
        assert!(!chat.is_enabled());
        chat.live_chat_id = "abc".to_string();
        assert!(!chat.is_enabled());
        chat.api_key = "key".to_string();
        assert!(chat.is_enabled());
    }
}
