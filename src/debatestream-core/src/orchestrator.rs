//! Stream orchestration.
//!
//! A background prefetch task keeps the turn queue filled while the
//! foreground loop plays turns one at a time. Queue, turn counter, history
//! and running summary live behind one lock that is never held across a
//! network call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Local;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactPreparer;
use crate::config::Config;
use crate::debate_format::BeatSchedule;
use crate::error::StreamError;
use crate::heygen::{RenderPolicies, VideoAvatarService, VideoRenderer};
use crate::heygen_stream::StreamSessions;
use crate::llm::{TextGenerator, TurnGenerator, TurnRequest};
use crate::media::DurationProbe;
use crate::mode::OutputMode;
use crate::obs::PresentationSurface;
use crate::participant::Speaker;
use crate::playback::{PacingConfig, PlaybackDriver};
use crate::rules::RuleEngine;
use crate::summary::Summarizer;
use crate::topic::TopicProvider;
use crate::transcript::{TopicChangeRecord, TranscriptEvent, TranscriptLog};
use crate::tts::SpeechSynthesizer;
use crate::turn::{HistoryEntry, Turn};

/// Callback for stream events.
pub type StreamCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Events emitted while the stream runs.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A prepared turn entered the queue.
    TurnQueued {
        turn_id: u64,
        speaker: Speaker,
        queue_len: usize,
    },
    /// A turn is about to play.
    TurnPlaying(Turn),
    /// The queue was empty and the idle scene is showing.
    Idle,
    TopicChanged {
        topic: String,
        source: String,
        author: Option<String>,
    },
    /// Every turn has been played.
    Finished,
}

fn emit(callback: &Option<StreamCallback>, event: StreamEvent) {
    if let Some(callback) = callback {
        callback(event);
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<Turn>,
    /// Id of the last published turn.
    turn_seq: u64,
    history: VecDeque<HistoryEntry>,
    summary: String,
}

/// State shared by the producer and the player.
#[derive(Debug, Default)]
struct Shared {
    state: Mutex<QueueState>,
    stop: Arc<AtomicBool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// What the producer reads before going to the network.
struct Snapshot {
    turn_id: u64,
    history: Vec<HistoryEntry>,
    summary: String,
}

struct ProducerSettings {
    max_turns: u64,
    min_queue_items: usize,
    history_max: usize,
    prompt_version: String,
    prefetch_idle: Duration,
    error_delay: Duration,
}

/// The prefetch side: generates, prepares and publishes turns.
struct Producer {
    shared: Arc<Shared>,
    topics: Arc<TopicProvider>,
    rules: RuleEngine,
    generator: TurnGenerator,
    preparer: ArtifactPreparer,
    summarizer: Summarizer,
    settings: ProducerSettings,
    callback: Option<StreamCallback>,
}

impl Producer {
    fn snapshot(&self) -> Snapshot {
        let state = self.shared.lock();
        Snapshot {
            turn_id: state.turn_seq + 1,
            history: state.history.iter().cloned().collect(),
            summary: state.summary.clone(),
        }
    }

    /// Produce and publish the next turn. A failed cycle publishes nothing,
    /// so the next attempt reuses the same turn id.
    async fn prefetch_next(&self) -> Result<u64, StreamError> {
        let snapshot = self.snapshot();
        let turn_id = snapshot.turn_id;
        let speaker = Speaker::for_turn(turn_id);
        let topic = self.topics.get();

        let outcome = self.rules.evaluate(turn_id, speaker, &snapshot.history);
        debug!(
            target: "prefetch",
            turn = turn_id,
            directives = outcome.directives.len(),
            blocked = ?outcome.blocked_classes,
            "rules evaluated"
        );

        let generated = self
            .generator
            .generate(&TurnRequest {
                turn_id,
                speaker,
                topic: &topic,
                summary: &snapshot.summary,
                history: &snapshot.history,
                directives: &outcome.directives,
            })
            .await;
        let artifact = self.preparer.prepare(turn_id, speaker, &generated.text).await?;

        let mut turn = Turn::new(turn_id, artifact.text);
        turn.topic = topic;
        turn.audio_file = artifact.audio_file;
        turn.video_file = artifact.video_file;
        turn.duration_estimate_s = artifact.duration_estimate_s;
        turn.llm_latency_s = generated.latency_s;
        turn.tts_latency_s = artifact.latency_s;
        turn.model = self.generator.model().to_string();
        turn.prompt_version = self.settings.prompt_version.clone();
        turn.summary_len = snapshot.summary.chars().count();

        let (queue_len, history) = {
            let mut state = self.shared.lock();
            state.turn_seq = turn_id;
            state.history.push_back(turn.history_entry());
            let cap = self.settings.history_max;
            while cap > 0 && state.history.len() > cap {
                state.history.pop_front();
            }
            state.queue.push_back(turn);
            let history = if self.summarizer.should_summarize(turn_id as usize) {
                Some(state.history.iter().cloned().collect::<Vec<_>>())
            } else {
                None
            };
            (state.queue.len(), history)
        };

        info!(target: "prefetch", turn = turn_id, speaker = %speaker, queue_len, "turn queued");
        emit(
            &self.callback,
            StreamEvent::TurnQueued {
                turn_id,
                speaker,
                queue_len,
            },
        );

        if let Some(history) = history
            && let Ok(summary) = self.summarizer.summarize(&snapshot.summary, &history).await
        {
            self.shared.lock().summary = summary;
        }
        Ok(turn_id)
    }

    async fn prefetch_loop(self: Arc<Self>) {
        let settings = &self.settings;
        loop {
            if self.shared.stopped() {
                break;
            }
            let (turn_seq, queue_len) = {
                let state = self.shared.lock();
                (state.turn_seq, state.queue.len())
            };
            if settings.max_turns > 0 && turn_seq >= settings.max_turns {
                info!(target: "prefetch", turn_seq, "turn limit reached, stopping prefetch");
                self.shared.stop.store(true, Ordering::SeqCst);
                break;
            }

            if queue_len < settings.min_queue_items {
                if let Err(e) = self.prefetch_next().await {
                    error!(target: "prefetch", turn = turn_seq + 1, error = %e, "prefetch cycle failed");
                    tokio::time::sleep(settings.error_delay).await;
                }
            } else {
                tokio::time::sleep(settings.prefetch_idle).await;
            }
        }
    }
}

/// Concrete collaborators the orchestrator drives.
pub struct Collaborators {
    pub llm: Arc<dyn TextGenerator>,
    /// Required in audio and video modes.
    pub speech: Option<Arc<dyn SpeechSynthesizer>>,
    /// Extension of synthesized audio files.
    pub audio_ext: String,
    /// Required in video mode.
    pub video: Option<Arc<dyn VideoAvatarService>>,
    /// Required in streaming-avatar mode.
    pub streaming: Option<Arc<StreamSessions>>,
    pub surface: Arc<dyn PresentationSurface>,
    pub probe: DurationProbe,
    pub topics: Arc<TopicProvider>,
    pub transcript: TranscriptLog,
}

/// Lets topic watchers change the topic while the stream runs.
#[derive(Clone)]
pub struct TopicHandle {
    topics: Arc<TopicProvider>,
    transcript: TranscriptLog,
    surface: Arc<dyn PresentationSurface>,
    overlay_topic: Option<String>,
    callback: Option<StreamCallback>,
}

impl TopicHandle {
    /// Override the topic for `ttl`, log it and update the overlay.
    pub async fn set_topic(&self, topic: &str, ttl: Duration, source: &str, author: Option<&str>) {
        let topic = topic.trim();
        if topic.is_empty() {
            return;
        }
        self.topics.set_override(topic, ttl, source, author);

        let record = TopicChangeRecord {
            ts: Local::now(),
            topic: topic.to_string(),
            source: source.to_string(),
            author: author.map(str::to_string),
            ttl_s: ttl.as_secs(),
        };
        if let Err(e) = self.transcript.append(&TranscriptEvent::TopicChange(record)).await {
            warn!(target: "transcript", error = %e, "failed to append topic change");
        }
        if let Some(input) = &self.overlay_topic
            && let Err(e) = self.surface.set_overlay_text(input, topic).await
        {
            debug!(target: "topic", input = %input, error = %e, "topic overlay update failed");
        }

        emit(
            &self.callback,
            StreamEvent::TopicChanged {
                topic: topic.to_string(),
                source: source.to_string(),
                author: author.map(str::to_string),
            },
        );
    }
}

/// Runs the stream: prefetch in the background, playback in the foreground.
pub struct Orchestrator {
    shared: Arc<Shared>,
    producer: Option<Producer>,
    prefetch_task: Option<JoinHandle<()>>,
    playback: PlaybackDriver,
    topic_handle: TopicHandle,
    callback: Option<StreamCallback>,
    idle_announced: bool,
}

impl Orchestrator {
    /// Wire the stream for `config.stream.mode`. Fails when the mode lacks a
    /// collaborator it needs.
    pub fn new(config: &Config, collaborators: Collaborators) -> Result<Self, StreamError> {
        let stream = &config.stream;
        let mode = stream.mode;
        let Collaborators {
            llm,
            speech,
            audio_ext,
            video,
            streaming,
            surface,
            probe,
            topics,
            transcript,
        } = collaborators;

        let beats = BeatSchedule::from_rules(&config.rules, stream.max_turns);
        let personas = config.personas.clone();

        let mut preparer = ArtifactPreparer::new(mode, personas.clone(), &stream.audio_dir, config.retry.speech)
            .with_chars_per_second(stream.chars_per_second);
        if let Some(speech) = speech {
            preparer = preparer.with_speech(speech, audio_ext);
        }
        if mode == OutputMode::HeygenVideo
            && let Some(video) = video
        {
            let renderer = VideoRenderer::new(
                video,
                &config.heygen,
                &stream.video_dir,
                RenderPolicies::from(&config.retry),
            );
            preparer = preparer.with_renderer(renderer);
        }
        preparer.validate()?;

        let mut playback = PlaybackDriver::new(
            Arc::clone(&surface),
            config.obs.clone(),
            mode,
            probe,
            transcript.clone(),
            beats,
            personas.clone(),
            PacingConfig::from_config(stream, &config.obs),
        );
        match (mode, streaming) {
            (OutputMode::HeygenStream, Some(sessions)) => playback = playback.with_sessions(sessions),
            (OutputMode::HeygenStream, None) => {
                return Err(StreamError::ConfigError(
                    "heygen_stream mode needs streaming sessions".to_string(),
                ));
            }
            _ => {}
        }

        let generator = TurnGenerator::new(Arc::clone(&llm), personas, config.llm.model.clone(), config.retry.text)
            .with_anchor_case(stream.anchor_case.clone())
            .with_max_sentences(stream.max_sentences);
        let summarizer = Summarizer::new(
            llm,
            config.summary_model(),
            config.summary.every_n_turns,
            config.retry.summary,
        );

        let shared = Arc::new(Shared::default());
        let producer = Producer {
            shared: Arc::clone(&shared),
            topics: Arc::clone(&topics),
            rules: RuleEngine::new(config.rules.clone(), beats),
            generator,
            preparer,
            summarizer,
            settings: ProducerSettings {
                max_turns: stream.max_turns,
                min_queue_items: stream.min_queue_items.max(1),
                history_max: stream.history_max,
                prompt_version: stream.prompt_version.clone(),
                prefetch_idle: Duration::from_millis(stream.prefetch_idle_ms),
                error_delay: Duration::from_secs_f64(stream.prefetch_error_delay_s.max(0.0)),
            },
            callback: None,
        };

        let overlay_topic = (config.obs.overlays_enabled && !config.obs.overlay_topic.is_empty())
            .then(|| config.obs.overlay_topic.clone());
        info!(
            target: "prefetch",
            mode = %mode,
            max_turns = stream.max_turns,
            min_queue_items = stream.min_queue_items,
            "orchestrator ready"
        );

        Ok(Self {
            shared,
            producer: Some(producer),
            prefetch_task: None,
            playback,
            topic_handle: TopicHandle {
                topics,
                transcript,
                surface,
                overlay_topic,
                callback: None,
            },
            callback: None,
            idle_announced: false,
        })
    }

    /// Set a callback for stream events. Call before [`Self::start_prefetch`].
    pub fn with_callback(mut self, callback: StreamCallback) -> Self {
        if let Some(producer) = self.producer.as_mut() {
            producer.callback = Some(Arc::clone(&callback));
        }
        self.topic_handle.callback = Some(Arc::clone(&callback));
        self.callback = Some(callback);
        self
    }

    /// Handle for topic watchers.
    pub fn topic_handle(&self) -> TopicHandle {
        self.topic_handle.clone()
    }

    /// Flag that stops prefetching; playback then drains the queue.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.stop)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Spawn the prefetch task. Does nothing when it is already running.
    pub fn start_prefetch(&mut self) {
        if let Some(producer) = self.producer.take() {
            self.prefetch_task = Some(tokio::spawn(Arc::new(producer).prefetch_loop()));
        }
    }

    /// Play the head of the queue, or show the idle scene when it is empty.
    pub async fn play_next(&mut self) -> Option<Turn> {
        let next = self.shared.lock().queue.pop_front();
        match next {
            Some(turn) => {
                self.idle_announced = false;
                emit(&self.callback, StreamEvent::TurnPlaying(turn.clone()));
                Some(self.playback.play(turn).await)
            }
            None => {
                if !self.idle_announced {
                    self.idle_announced = true;
                    emit(&self.callback, StreamEvent::Idle);
                }
                self.playback.show_idle().await;
                None
            }
        }
    }

    /// Play until prefetch has stopped and the queue is drained.
    pub async fn run(&mut self) {
        self.start_prefetch();
        loop {
            if self.shared.stopped() && self.queue_len() == 0 {
                break;
            }
            self.play_next().await;
        }

        if let Some(task) = self.prefetch_task.take() {
            task.abort();
        }
        self.playback.show_idle().await;
        info!(target: "playback", "stream finished");
        emit(&self.callback, StreamEvent::Finished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::heygen::{MockVideoAvatarService, RenderStatus};
    use crate::llm::MockTextGenerator;
    use crate::obs::NullSurface;
    use crate::playback::tests::RecordingSurface;
    use crate::tts::MockSpeechSynthesizer;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    fn text_config(dir: &Path, max_turns: u64) -> Config {
        let mut config = default_config();
        config.stream.mode = OutputMode::Text;
        config.stream.max_turns = max_turns;
        config.stream.min_queue_items = 2;
        config.stream.transcript_path = dir.join("transcript.jsonl");
        config.stream.audio_dir = dir.join("audio");
        config.stream.video_dir = dir.join("video");
        config.retry.text = crate::retry::RetryPolicy::new(2, 0.1, 0.5);
        config.retry.summary = crate::retry::RetryPolicy::new(2, 0.1, 0.5);
        config
    }

    /// Answers turns with "Line N." and summaries with "Summary so far."
    fn scripted_llm() -> MockTextGenerator {
        let counter = AtomicUsize::new(0);
        let mut llm = MockTextGenerator::new();
        llm.expect_complete().returning(move |_, system, _| {
            if system.contains("condense") {
                return Ok("Summary so far.".to_string());
            }
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("Line {n}. Extra sentence. Another one."))
        });
        llm
    }

    fn collaborators(config: &Config, llm: MockTextGenerator, surface: Arc<dyn PresentationSurface>) -> Collaborators {
        Collaborators {
            llm: Arc::new(llm),
            speech: None,
            audio_ext: "mp3".to_string(),
            video: None,
            streaming: None,
            surface,
            probe: DurationProbe::without_ffprobe(),
            topics: Arc::new(TopicProvider::new(config.topic.clone()).with_env_lookup(|_| None)),
            transcript: TranscriptLog::new(config.stream.transcript_path.clone()),
        }
    }

    fn recorder() -> (StreamCallback, Arc<Mutex<Vec<StreamEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: StreamCallback = Arc::new(move |event| sink.lock().unwrap().push(event));
        (callback, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_plays_all_turns_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = text_config(dir.path(), 4);
        let (callback, events) = recorder();
        let mut orchestrator = Orchestrator::new(&config, collaborators(&config, scripted_llm(), Arc::new(NullSurface)))
            .unwrap()
            .with_callback(callback);

        orchestrator.run().await;
        assert_eq!(orchestrator.queue_len(), 0);

        let events = events.lock().unwrap();
        let played: Vec<(u64, Speaker)> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TurnPlaying(turn) => Some((turn.turn_id, turn.speaker)),
                _ => None,
            })
            .collect();
        assert_eq!(
            played,
            vec![(1, Speaker::A), (2, Speaker::B), (3, Speaker::A), (4, Speaker::B)]
        );
        assert!(matches!(events.last(), Some(StreamEvent::Finished)));
        let queued = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::TurnQueued { .. }))
            .count();
        assert_eq!(queued, 4);

        let log = TranscriptLog::new(config.stream.transcript_path.clone());
        let ids: Vec<u64> = log
            .read_events()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|e| match e {
                TranscriptEvent::Turn(record) => Some(record.turn_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_publishes_truncated_text_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = text_config(dir.path(), 0);
        config.stream.history_max = 2;
        config.summary.every_n_turns = 2;
        let orchestrator =
            Orchestrator::new(&config, collaborators(&config, scripted_llm(), Arc::new(NullSurface))).unwrap();
        let producer = orchestrator.producer.as_ref().unwrap();

        for expected in 1..=3 {
            assert_eq!(producer.prefetch_next().await.unwrap(), expected);
        }

        let state = orchestrator.shared.lock();
        assert_eq!(state.turn_seq, 3);
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0].text, "Line 2. Extra sentence.");
        assert_eq!(state.summary, "Summary so far.");

        let turns: Vec<&Turn> = state.queue.iter().collect();
        assert_eq!(turns[0].text, "Line 1. Extra sentence.");
        assert_eq!(turns[0].summary_len, 0);
        // Summary fired after turn 2, so turn 3 saw it.
        assert_eq!(turns[2].summary_len, "Summary so far.".len());
        assert_eq!(turns[2].prompt_version, config.stream.prompt_version);
        assert_eq!(turns[2].model, config.llm.model);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_retries_same_turn_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = text_config(dir.path(), 1);
        config.stream.mode = OutputMode::HeygenVideo;
        config.heygen.avatar_a.character_id = "avatar-a".to_string();
        config.heygen.avatar_b.character_id = "avatar-b".to_string();
        let quick = crate::retry::RetryPolicy::new(2, 0.1, 0.5);
        config.retry.upload = quick;
        config.retry.render = quick;
        config.retry.poll = quick;
        config.retry.download = quick;

        let mut speech = MockSpeechSynthesizer::new();
        speech.expect_synthesize().returning(|_, _, _| Ok(()));

        let renders = AtomicUsize::new(0);
        let mut video = MockVideoAvatarService::new();
        video.expect_upload_asset().returning(|_| Ok("asset".to_string()));
        video.expect_render_video().times(2).returning(move |_, _, _| {
            if renders.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StreamError::RenderError("avatar not found".to_string()))
            } else {
                Ok("job".to_string())
            }
        });
        video.expect_poll_status().returning(|_| {
            Ok(RenderStatus::Completed {
                url: "https://cdn.example/v.mp4".to_string(),
            })
        });
        video.expect_download().returning(|_, path| {
            std::fs::create_dir_all(path.parent().unwrap())?;
            std::fs::write(path, b"mp4")?;
            Ok(())
        });

        let mut collaborators = collaborators(&config, scripted_llm(), Arc::new(NullSurface));
        collaborators.speech = Some(Arc::new(speech));
        collaborators.video = Some(Arc::new(video));
        let mut orchestrator = Orchestrator::new(&config, collaborators).unwrap();

        orchestrator.start_prefetch();
        let task = orchestrator.prefetch_task.take().unwrap();
        task.await.unwrap();

        assert!(orchestrator.shared.stopped());
        let state = orchestrator.shared.lock();
        assert_eq!(state.turn_seq, 1);
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].turn_id, 1);
        assert_eq!(
            state.queue[0].video_file,
            Some(config.stream.video_dir.join("turn_00001_A.mp4"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_waits_error_delay_before_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = text_config(dir.path(), 1);
        config.stream.mode = OutputMode::HeygenVideo;
        config.stream.prefetch_error_delay_s = 3.0;
        config.heygen.avatar_a.character_id = "avatar-a".to_string();
        config.heygen.avatar_b.character_id = "avatar-b".to_string();
        let quick = crate::retry::RetryPolicy::new(2, 0.1, 0.5);
        config.retry.upload = quick;
        config.retry.render = quick;
        config.retry.poll = quick;
        config.retry.download = quick;

        let mut speech = MockSpeechSynthesizer::new();
        speech.expect_synthesize().returning(|_, _, _| Ok(()));

        // The first cycle exhausts its upload retries on a 503.
        let uploads = AtomicUsize::new(0);
        let mut video = MockVideoAvatarService::new();
        video.expect_upload_asset().times(3).returning(move |_| {
            if uploads.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StreamError::ApiError {
                    status: 503,
                    body: "busy".to_string(),
                })
            } else {
                Ok("asset".to_string())
            }
        });
        video.expect_render_video().returning(|_, _, _| Ok("job".to_string()));
        video.expect_poll_status().returning(|_| {
            Ok(RenderStatus::Completed {
                url: "https://cdn.example/v.mp4".to_string(),
            })
        });
        video.expect_download().returning(|_, path| {
            std::fs::create_dir_all(path.parent().unwrap())?;
            std::fs::write(path, b"mp4")?;
            Ok(())
        });

        let started = tokio::time::Instant::now();
        let queued_at = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&queued_at);
        let callback: StreamCallback = Arc::new(move |event| {
            if let StreamEvent::TurnQueued { turn_id, .. } = event {
                sink.lock().unwrap().push((turn_id, started.elapsed()));
            }
        });

        let mut collaborators = collaborators(&config, scripted_llm(), Arc::new(NullSurface));
        collaborators.speech = Some(Arc::new(speech));
        collaborators.video = Some(Arc::new(video));
        let mut orchestrator = Orchestrator::new(&config, collaborators)
            .unwrap()
            .with_callback(callback);
        orchestrator.run().await;

        let queued_at = queued_at.lock().unwrap();
        assert_eq!(queued_at.len(), 1);
        assert_eq!(queued_at[0].0, 1);
        assert!(queued_at[0].1 >= Duration::from_secs(3), "queued after {:?}", queued_at[0].1);

        let ids: Vec<u64> = TranscriptLog::new(config.stream.transcript_path.clone())
            .read_events()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|e| match e {
                TranscriptEvent::Turn(record) => Some(record.turn_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_playback_keeps_queue_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = text_config(dir.path(), 8);
        config.stream.min_queue_items = 4;
        config.stream.text_only_sleep_s = 5.0;
        let (callback, events) = recorder();
        let mut orchestrator = Orchestrator::new(&config, collaborators(&config, scripted_llm(), Arc::new(NullSurface)))
            .unwrap()
            .with_callback(callback);

        orchestrator.run().await;

        let events = events.lock().unwrap();
        let played: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TurnPlaying(turn) => Some(turn.turn_id),
                _ => None,
            })
            .collect();
        assert_eq!(played, (1..=8).collect::<Vec<_>>());

        let deepest = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TurnQueued { queue_len, .. } => Some(*queue_len),
                _ => None,
            })
            .max()
            .unwrap();
        assert!(deepest >= 3, "queue never filled up: {deepest}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_goes_idle_without_consuming() {
        let dir = tempfile::tempdir().unwrap();
        let config = text_config(dir.path(), 4);
        let surface = Arc::new(RecordingSurface::default());
        let (callback, events) = recorder();
        let mut orchestrator = Orchestrator::new(&config, collaborators(&config, scripted_llm(), surface.clone()))
            .unwrap()
            .with_callback(callback);

        assert!(orchestrator.play_next().await.is_none());
        assert!(orchestrator.play_next().await.is_none());
        assert_eq!(surface.calls(), vec!["scene:SCENE_IDLE".to_string()]);
        let idles = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, StreamEvent::Idle))
            .count();
        assert_eq!(idles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_topic_handle_overrides_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let config = text_config(dir.path(), 4);
        let surface = Arc::new(RecordingSurface::default());
        let (callback, events) = recorder();
        let collaborators = collaborators(&config, scripted_llm(), surface.clone());
        let topics = Arc::clone(&collaborators.topics);
        let orchestrator = Orchestrator::new(&config, collaborators)
            .unwrap()
            .with_callback(callback);

        orchestrator
            .topic_handle()
            .set_topic(" Bullet Cluster ", Duration::from_secs(10), "youtube", Some("mod"))
            .await;
        assert_eq!(topics.get(), "Bullet Cluster");
        assert!(surface.calls().contains(&"text:TXT_TOPIC:Bullet Cluster".to_string()));

        let logged = TranscriptLog::new(config.stream.transcript_path.clone())
            .read_events()
            .await
            .unwrap();
        assert!(matches!(
            &logged[0],
            TranscriptEvent::TopicChange(r) if r.topic == "Bullet Cluster" && r.author.as_deref() == Some("mod") && r.ttl_s == 10
        ));
        assert!(events.lock().unwrap().iter().any(|e| matches!(
            e,
            StreamEvent::TopicChanged { topic, source, .. } if topic == "Bullet Cluster" && source == "youtube"
        )));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_ne!(topics.get(), "Bullet Cluster");
    }

    #[tokio::test]
    async fn test_mode_requires_collaborators() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = text_config(dir.path(), 4);
        config.stream.mode = OutputMode::HeygenStream;
        let result = Orchestrator::new(&config, collaborators(&config, scripted_llm(), Arc::new(NullSurface)));
        assert!(matches!(result, Err(StreamError::ConfigError(_))));

        config.stream.mode = OutputMode::Png;
        let result = Orchestrator::new(&config, collaborators(&config, scripted_llm(), Arc::new(NullSurface)));
        assert!(matches!(result, Err(StreamError::ConfigError(_))));
    }
}
