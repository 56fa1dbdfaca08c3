//! Puts one turn on air and waits for it to finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ObsConfig;
use crate::debate_format::BeatSchedule;
use crate::error::StreamError;
use crate::heygen_stream::StreamSessions;
use crate::media::DurationProbe;
use crate::mode::OutputMode;
use crate::obs::{PresentationSurface, wait_media_started};
use crate::participant::{Personas, Speaker};
use crate::transcript::TranscriptLog;
use crate::tts::estimate_duration;
use crate::turn::Turn;

/// What the broadcast currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationState {
    Idle,
    Speaking(Speaker),
}

/// Playback timing knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct PacingConfig {
    pub playback_pad: Duration,
    pub text_only_sleep: Duration,
    pub idle_sleep: Duration,
    pub poll: Duration,
    pub start_timeout: Duration,
    pub max_play: Duration,
    pub chars_per_second: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            playback_pad: Duration::from_millis(150),
            text_only_sleep: Duration::from_millis(500),
            idle_sleep: Duration::from_secs(1),
            poll: Duration::from_millis(300),
            start_timeout: Duration::from_secs(5),
            max_play: Duration::from_secs(60),
            chars_per_second: 14.0,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl PacingConfig {
    pub fn from_config(stream: &crate::config::StreamConfig, obs: &ObsConfig) -> Self {
        Self {
            playback_pad: secs(stream.playback_pad_s),
            text_only_sleep: secs(stream.text_only_sleep_s),
            idle_sleep: secs(stream.idle_sleep_s),
            poll: Duration::from_millis(obs.poll_ms.max(1)),
            start_timeout: secs(obs.start_timeout_s),
            max_play: secs(obs.max_play_s),
            chars_per_second: stream.chars_per_second,
        }
    }
}

pub struct PlaybackDriver {
    surface: Arc<dyn PresentationSurface>,
    obs: ObsConfig,
    mode: OutputMode,
    probe: DurationProbe,
    transcript: TranscriptLog,
    sessions: Option<Arc<StreamSessions>>,
    beats: BeatSchedule,
    personas: Personas,
    pacing: PacingConfig,
    state: PresentationState,
    current_scene: Option<String>,
}

impl PlaybackDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        surface: Arc<dyn PresentationSurface>,
        obs: ObsConfig,
        mode: OutputMode,
        probe: DurationProbe,
        transcript: TranscriptLog,
        beats: BeatSchedule,
        personas: Personas,
        pacing: PacingConfig,
    ) -> Self {
        Self {
            surface,
            obs,
            mode,
            probe,
            transcript,
            sessions: None,
            beats,
            personas,
            pacing,
            state: PresentationState::Idle,
            current_scene: None,
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<StreamSessions>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn state(&self) -> PresentationState {
        self.state
    }

    pub fn current_scene(&self) -> Option<&str> {
        self.current_scene.as_deref()
    }

    /// Transcript source tag for this mode.
    fn source_tag(&self) -> &'static str {
        match self.mode {
            OutputMode::Png => "llm_tts",
            OutputMode::HeygenVideo => "llm_heygen_video",
            OutputMode::HeygenStream => "llm_heygen_stream",
            OutputMode::Text => "llm_text",
        }
    }

    async fn switch_scene(&mut self, scene: &str) {
        if self.current_scene.as_deref() == Some(scene) {
            return;
        }
        match self.surface.switch_scene(scene).await {
            Ok(()) => {
                debug!(target: "playback", scene, "scene switched");
                self.current_scene = Some(scene.to_string());
            }
            Err(e) => warn!(target: "playback", scene, error = %e, "scene switch failed"),
        }
    }

    /// Show the idle scene and wait a moment.
    pub async fn show_idle(&mut self) {
        if self.state != PresentationState::Idle {
            info!(target: "playback", "queue empty, going idle");
        }
        self.state = PresentationState::Idle;
        let scene = self.obs.scene_idle.clone();
        self.switch_scene(&scene).await;
        tokio::time::sleep(self.pacing.idle_sleep).await;
    }

    /// Play `turn` to completion and return it with playback fields filled.
    pub async fn play(&mut self, mut turn: Turn) -> Turn {
        let speaker = turn.speaker;
        self.state = PresentationState::Speaking(speaker);
        let scene = self.obs.scene_for(speaker).to_string();
        self.switch_scene(&scene).await;

        let media_started = self.start_media(&mut turn).await;
        self.update_overlays(&turn).await;

        if let Err(e) = self.transcript.append_turn(&turn, self.source_tag()).await {
            warn!(target: "transcript", turn = turn.turn_id, error = %e, "failed to append turn");
        }

        self.wait_for_end(&turn, media_started).await;
        turn
    }

    /// Assign and restart the turn's media; dispatch speech in streaming mode.
    /// Returns the player input when a file was started.
    async fn start_media(&mut self, turn: &mut Turn) -> Option<String> {
        match self.mode {
            OutputMode::Text => None,
            OutputMode::HeygenStream => {
                let estimate = estimate_duration(&turn.text, self.pacing.chars_per_second);
                turn.duration_estimate_s = Some(estimate);
                let sessions = self.sessions.as_ref()?;
                match sessions.speak(turn.speaker, &turn.text).await {
                    Ok(receipt) => {
                        turn.session_id = Some(receipt.session_id);
                        turn.task_id = receipt.task_id;
                    }
                    Err(e) => warn!(target: "playback", turn = turn.turn_id, error = %e, "speak task failed"),
                }
                None
            }
            OutputMode::Png | OutputMode::HeygenVideo => {
                let file = turn.media_file()?.clone();
                let player = match self.mode {
                    OutputMode::HeygenVideo => self.obs.video_player_for(turn.speaker).to_string(),
                    _ => self.obs.audio_player.clone(),
                };
                let started: Result<(), StreamError> = async {
                    self.surface.set_media_source(&player, &file).await?;
                    self.surface.restart_media(&player).await
                }
                .await;
                match started {
                    Ok(()) => Some(player),
                    Err(e) => {
                        warn!(
                            target: "playback",
                            turn = turn.turn_id,
                            player = %player,
                            file = %file.display(),
                            error = %e,
                            "media assignment failed"
                        );
                        None
                    }
                }
            }
        }
    }

    async fn update_overlays(&self, turn: &Turn) {
        let surface = &self.surface;
        if self.obs.overlays_enabled {
            let stage = self.beats.stage(turn.turn_id).name();
            let overlays = [
                (&self.obs.overlay_speaker, self.personas.get(turn.speaker).name.as_str()),
                (&self.obs.overlay_topic, turn.topic.as_str()),
                (&self.obs.overlay_stage, stage),
            ];
            for (input, text) in overlays {
                if input.is_empty() {
                    continue;
                }
                if let Err(e) = surface.set_overlay_text(input, text).await {
                    debug!(target: "playback", input = %input, error = %e, "overlay update failed");
                }
            }
        }

        if self.obs.highlight_enabled {
            for (speaker, active) in [(turn.speaker, true), (turn.speaker.other(), false)] {
                let source = self.obs.avatar_source_for(speaker);
                if source.is_empty() {
                    continue;
                }
                for (filter, enabled) in [(&self.obs.filter_speak, active), (&self.obs.filter_dim, !active)] {
                    if let Err(e) = surface.set_filter_enabled(source, filter, enabled).await {
                        debug!(target: "playback", source, filter = %filter, error = %e, "highlight update failed");
                    }
                }
            }
        }
    }

    async fn wait_for_end(&self, turn: &Turn, player: Option<String>) {
        if let Some(player) = player {
            let file = turn.media_file().cloned();
            let probed = match &file {
                Some(path) => self.probe.probe(path).await,
                None => None,
            };
            match probed {
                Some(duration) => {
                    debug!(target: "playback", turn = turn.turn_id, duration_s = duration, "sleeping for media");
                    tokio::time::sleep(secs(duration) + self.pacing.playback_pad).await;
                }
                None => self.poll_until_finished(&player, turn.turn_id).await,
            }
            return;
        }

        let wait = match (self.mode, turn.duration_estimate_s) {
            (_, Some(estimate)) => secs(estimate),
            (OutputMode::Text, None) => self.pacing.text_only_sleep,
            (_, None) => secs(estimate_duration(&turn.text, self.pacing.chars_per_second)),
        };
        tokio::time::sleep(wait).await;
    }

    async fn poll_until_finished(&self, player: &str, turn_id: u64) {
        let surface = self.surface.as_ref();
        match wait_media_started(surface, player, self.pacing.start_timeout, self.pacing.poll).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(target: "playback", turn = turn_id, player, "media did not start, moving on");
                return;
            }
            Err(e) => {
                warn!(target: "playback", turn = turn_id, error = %e, "media state unavailable");
                return;
            }
        }

        let deadline = Instant::now() + self.pacing.max_play;
        while Instant::now() < deadline {
            match surface.get_media_state(player).await {
                Ok(state) if state.is_finished() => return,
                Ok(_) => {}
                Err(e) => {
                    warn!(target: "playback", turn = turn_id, error = %e, "media state unavailable");
                    return;
                }
            }
            tokio::time::sleep(self.pacing.poll).await;
        }
        warn!(target: "playback", turn = turn_id, "media still playing at max play time");
    }
}
