//! Output mode selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How turns are rendered on air.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Speech audio over static avatar images.
    #[default]
    Png,
    /// Pre-rendered talking-head video per turn.
    HeygenVideo,
    /// Live streaming avatars driven by speak tasks.
    HeygenStream,
    /// No media at all; paced console output.
    Text,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Png => "png",
            OutputMode::HeygenVideo => "heygen_video",
            OutputMode::HeygenStream => "heygen_stream",
            OutputMode::Text => "text",
        }
    }

    /// Whether the broadcast-control surface is needed.
    pub fn uses_broadcast(&self) -> bool {
        !matches!(self, OutputMode::Text)
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "png" => Ok(OutputMode::Png),
            "heygen_video" => Ok(OutputMode::HeygenVideo),
            "heygen_stream" => Ok(OutputMode::HeygenStream),
            "text" => Ok(OutputMode::Text),
            other => Err(format!("unknown output mode '{other}'")),
        }
    }
}

/// Resolve the mode from environment-style settings.
///
/// An explicit `AVATAR_MODE` wins; `auto`, empty or unknown values fall
/// through to the legacy flags (`TEXT_ONLY`, `HEYGEN_STREAMING` /
/// `STREAM_MODE`, `VIDEO_MODE`, in that priority). Returns `None` when
/// nothing selects a mode.
pub fn mode_from_env<F>(lookup: F) -> Option<OutputMode>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_lowercase()).unwrap_or_default();

    if let Ok(mode) = get("AVATAR_MODE").parse::<OutputMode>() {
        return Some(mode);
    }

    let streaming = get("HEYGEN_STREAMING") == "1"
        || matches!(get("STREAM_MODE").as_str(), "heygen" | "stream" | "streaming");

    if get("TEXT_ONLY") == "1" {
        Some(OutputMode::Text)
    } else if streaming {
        Some(OutputMode::HeygenStream)
    } else if get("VIDEO_MODE") == "1" {
        Some(OutputMode::HeygenVideo)
    } else {
        None
    }
}

/// [`mode_from_env`] with the `Png` default applied.
pub fn resolve_mode<F>(lookup: F) -> OutputMode
where
    F: Fn(&str) -> Option<String>,
{
    mode_from_env(lookup).unwrap_or_default()
}
