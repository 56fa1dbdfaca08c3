//! DebateStream CLI - unattended AI debate stream
//!
//! Runs the turn orchestrator against a broadcast tool, or prints the debate
//! to the console in text-only mode.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use debatestream_core::chat::YouTubeTopicWatcher;
use debatestream_core::config::TtsEngineKind;
use debatestream_core::heygen::{HeygenClient, VideoAvatarService};
use debatestream_core::heygen_stream::{HeygenStreamClient, StreamSessions, StreamingAvatarService};
use debatestream_core::llm::OpenAiTextGenerator;
use debatestream_core::media::DurationProbe;
use debatestream_core::obs::{self, NullSurface, ObsClient, PresentationSurface};
use debatestream_core::server::spawn_server;
use debatestream_core::topic::TopicProvider;
use debatestream_core::transcript::TranscriptLog;
use debatestream_core::tts::{KokoroSpeech, OpenAiSpeech, SpeechSynthesizer};
use debatestream_core::{
    Collaborators, Config, Orchestrator, OutputMode, Personas, Speaker, StreamCallback, StreamEvent,
    default_config,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Loaded when `--config` is not given and the file exists.
const DEFAULT_CONFIG_FILE: &str = "debatestream.toml";

#[derive(Parser)]
#[command(
    name = "debatestream",
    version,
    about = "DebateStream - an unattended AI debate stream",
    long_about = "Generates alternating debate turns with an OpenAI-compatible model, \
                  turns them into speech or avatar video, and plays them through OBS."
)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print turns to the console only (no audio, video or OBS)
    #[arg(long, conflicts_with_all = ["audio", "mode"])]
    text_only: bool,

    /// Speech audio over still images
    #[arg(long, conflicts_with = "mode")]
    audio: bool,

    /// Seconds to pause after each turn in text-only mode
    #[arg(long, value_name = "SECS")]
    text_sleep: Option<f64>,

    /// Output mode: png, heygen_video, heygen_stream or text
    #[arg(long, value_name = "MODE")]
    mode: Option<OutputMode>,

    /// Last turn to produce (0 runs until interrupted)
    #[arg(long, value_name = "N")]
    max_turns: Option<u64>,

    /// Run the OBS self-check and exit
    #[arg(long)]
    self_check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let mut config = load_config(cli.config.as_deref())?;
    config.apply_env()?;
    apply_cli(&cli, &mut config);
    let mode = config.stream.mode;

    if config.llm.api_key.is_empty() {
        eprintln!(
            "{}",
            "Warning: OPENAI_API_KEY not set. API calls may fail.".yellow()
        );
    }

    // Broadcast surface and startup self-check
    let obs_client = mode.uses_broadcast().then(|| Arc::new(ObsClient::new(&config.obs)));
    let surface: Arc<dyn PresentationSurface> = match &obs_client {
        Some(client) => client.clone(),
        None => Arc::new(NullSurface),
    };

    if let Some(client) = &obs_client {
        if let Err(e) = client.connect().await {
            eprintln!("{} {}", "Error:".red().bold(), e);
            return Err(e.into());
        }
        let player = match mode {
            OutputMode::HeygenVideo => config.obs.video_player_a.clone(),
            _ => config.obs.audio_player.clone(),
        };
        if let Err(e) = obs::self_check(surface.as_ref(), &config.obs, &player, &config.obs.test_media).await {
            error!(target: "obs", error = %e, "self-check failed");
            eprintln!("{} {}", "Error:".red().bold(), e);
            return Err(e.into());
        }
    }
    if cli.self_check {
        println!("{}", "Self-check passed.".bright_green().bold());
        return Ok(());
    }

    // Turn preparation collaborators
    let llm = Arc::new(OpenAiTextGenerator::new(&config.llm)?);

    let (speech, audio_ext) = match mode {
        OutputMode::Png | OutputMode::HeygenVideo => {
            let (engine, ext) = speech_engine(&config).await?;
            (Some(engine), ext)
        }
        _ => (None, config.tts.format.clone()),
    };

    let video: Option<Arc<dyn VideoAvatarService>> = match mode {
        OutputMode::HeygenVideo => Some(Arc::new(HeygenClient::new(&config.heygen)?)),
        _ => None,
    };

    let streaming = match mode {
        OutputMode::HeygenStream => {
            let client: Arc<dyn StreamingAvatarService> = Arc::new(HeygenStreamClient::new(&config.heygen)?);
            let sessions = Arc::new(StreamSessions::new(client, config.heygen.clone(), config.retry.streaming));
            let (addr, _server) = spawn_server(&config.server, sessions.sessions_file()).await?;
            println!("{} http://{}/agent.html", "Session pages:".bold(), addr);
            for speaker in [Speaker::A, Speaker::B] {
                sessions.ensure_session(speaker).await?;
            }
            Some(sessions)
        }
        _ => None,
    };

    let probe = DurationProbe::detect();
    if mode == OutputMode::HeygenVideo && !probe.has_ffprobe() {
        warn!(target: "playback", "ffprobe not found; video turns will be paced by polling the player");
    }

    let personas = config.personas.clone();
    print_header(&config, &personas);

    let collaborators = Collaborators {
        llm,
        speech,
        audio_ext,
        video,
        streaming: streaming.clone(),
        surface,
        probe,
        topics: Arc::new(TopicProvider::new(config.topic.clone())),
        transcript: TranscriptLog::new(config.stream.transcript_path.clone()),
    };
    let mut orchestrator = Orchestrator::new(&config, collaborators)?.with_callback(create_console_callback(personas));

    if config.chat.is_enabled() {
        let watcher = YouTubeTopicWatcher::new(config.chat.clone())?;
        let topics = orchestrator.topic_handle();
        tokio::spawn(async move {
            if let Err(e) = watcher.run(topics).await {
                warn!(target: "chat", error = %e, "topic watcher stopped");
            }
        });
    }

    tokio::select! {
        _ = orchestrator.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }

    if let Some(sessions) = &streaming {
        sessions.close_all().await;
    }
    if let Some(client) = &obs_client {
        client.close().await;
    }

    println!();
    println!("{}", "═".repeat(70).bright_blue());
    println!("{}", "  Stream concluded.".bright_green().bold());
    println!("{}", "═".repeat(70).bright_blue());
    println!();

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Ok(Config::load(DEFAULT_CONFIG_FILE)?),
        None => Ok(default_config()),
    }
}

/// The configured speech engine and the extension of the files it writes.
async fn speech_engine(config: &Config) -> Result<(Arc<dyn SpeechSynthesizer>, String), Box<dyn std::error::Error>> {
    match config.tts.engine {
        TtsEngineKind::OpenAi => {
            let engine: Arc<dyn SpeechSynthesizer> = Arc::new(OpenAiSpeech::new(&config.llm, &config.tts)?);
            Ok((engine, config.tts.format.clone()))
        }
        TtsEngineKind::Kokoro => {
            let engine: Arc<dyn SpeechSynthesizer> = Arc::new(KokoroSpeech::new().await?);
            Ok((engine, "wav".to_string()))
        }
    }
}

/// Command-line flags win over the file and the environment.
fn apply_cli(cli: &Cli, config: &mut Config) {
    if cli.text_only {
        config.stream.mode = OutputMode::Text;
    } else if cli.audio {
        config.stream.mode = OutputMode::Png;
    } else if let Some(mode) = cli.mode {
        config.stream.mode = mode;
    }
    if let Some(secs) = cli.text_sleep {
        config.stream.text_only_sleep_s = secs.max(0.0);
    }
    if let Some(max_turns) = cli.max_turns {
        config.stream.max_turns = max_turns;
    }
}

fn print_header(config: &Config, personas: &Personas) {
    println!();
    println!("{}", "═".repeat(70).bright_blue());
    println!(
        "{}",
        format!("  {} - {} mode", "DebateStream".bold(), config.stream.mode)
            .bright_blue()
            .bold()
    );
    println!("{}", "═".repeat(70).bright_blue());
    println!();
    println!("{}", "Participants:".bold());
    for speaker in [Speaker::A, Speaker::B] {
        println!(
            "  {}. {} - using {}",
            speaker,
            personas.get(speaker).name.bright_cyan(),
            config.llm.model.dimmed()
        );
    }
    let limit = match config.stream.max_turns {
        0 => "unlimited".to_string(),
        n => n.to_string(),
    };
    println!("{} {}", "Turns:".bold(), limit);
    println!();
    println!("{}", "─".repeat(70).dimmed());
}

/// Create a callback that prints stream events to the console.
fn create_console_callback(personas: Personas) -> StreamCallback {
    Arc::new(move |event| match event {
        StreamEvent::TurnPlaying(turn) => {
            println!(
                "{} {} {}",
                "▶".bright_cyan(),
                personas.get(turn.speaker).name.bright_cyan().bold(),
                format!("(turn {})", turn.turn_id).yellow()
            );
            let wrapped = textwrap(&turn.text, 66);
            for line in wrapped.lines() {
                println!("  {}", line);
            }
            println!();
        }
        StreamEvent::TopicChanged { topic, source, author } => {
            let by = author.map(|a| format!(" by {}", a)).unwrap_or_default();
            println!(
                "{}",
                format!("  Topic changed ({}{}): {}", source, by, topic)
                    .bright_magenta()
                    .bold()
            );
            println!();
        }
        StreamEvent::Idle => {
            println!("{}", "  … waiting for the next turn".dimmed());
        }
        StreamEvent::TurnQueued { .. } | StreamEvent::Finished => {
            // Logged by the core / handled in main
        }
    })
}

/// Simple text wrapping function.
fn textwrap(text: &str, width: usize) -> String {
    let mut result = String::new();
    let mut current_line_len = 0;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if current_line_len + word_len + 1 > width && current_line_len > 0 {
            result.push('\n');
            current_line_len = 0;
        }
        if current_line_len > 0 {
            result.push(' ');
            current_line_len += 1;
        }
        result.push_str(word);
        current_line_len += word_len;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_textwrap_breaks_on_width() {
        let wrapped = textwrap("one two three four", 9);
        assert_eq!(wrapped, "one two\nthree\nfour");
    }

    #[test]
    fn test_cli_flags_override_config() {
        let cli = Cli::parse_from(["debatestream", "--text-only", "--text-sleep", "2", "--max-turns", "6"]);
        let mut config = default_config();
        apply_cli(&cli, &mut config);
        assert_eq!(config.stream.mode, OutputMode::Text);
        assert_eq!(config.stream.text_only_sleep_s, 2.0);
        assert_eq!(config.stream.max_turns, 6);

        let cli = Cli::parse_from(["debatestream", "--mode", "heygen_video"]);
        apply_cli(&cli, &mut config);
        assert_eq!(config.stream.mode, OutputMode::HeygenVideo);
    }

    #[test]
    fn test_text_only_conflicts_with_audio() {
        assert!(Cli::try_parse_from(["debatestream", "--text-only", "--audio"]).is_err());
    }
}
