//! Media duration probing.

use std::collections::HashMap;
use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::process::Command;
use tracing::debug;

use crate::tts::MIN_DURATION_S;

/// Measures how long a media file plays. Results are cached per path.
#[derive(Debug, Default)]
pub struct DurationProbe {
    ffprobe: Option<PathBuf>,
    cache: Mutex<HashMap<PathBuf, f64>>,
}

impl DurationProbe {
    /// Probe that uses `ffprobe` when it is on `PATH`.
    pub fn detect() -> Self {
        Self::detect_in(env::var_os("PATH").unwrap_or_default())
    }

    /// Probe that looks for an executable `ffprobe` in `search_path`.
    pub fn detect_in(search_path: impl AsRef<OsStr>) -> Self {
        let ffprobe = which::which_in("ffprobe", Some(search_path), Path::new(".")).ok();
        debug!(target: "playback", ffprobe = ?ffprobe, "duration probe ready");
        Self {
            ffprobe,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// WAV-only probe.
    pub fn without_ffprobe() -> Self {
        Self::default()
    }

    pub fn has_ffprobe(&self) -> bool {
        self.ffprobe.is_some()
    }

    /// Duration in seconds (at least 0.3), or `None` when nothing can measure it.
    pub async fn probe(&self, path: &Path) -> Option<f64> {
        if let Some(cached) = self.cached(path) {
            return Some(cached);
        }

        let measured = match wav_duration(path) {
            Some(d) => Some(d),
            None => self.ffprobe_duration(path).await,
        }?;

        let duration = measured.max(MIN_DURATION_S);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(path.to_path_buf(), duration);
        }
        Some(duration)
    }

    fn cached(&self, path: &Path) -> Option<f64> {
        self.cache.lock().ok()?.get(path).copied()
    }

    async fn ffprobe_duration(&self, path: &Path) -> Option<f64> {
        let ffprobe = self.ffprobe.as_ref()?;
        let output = Command::new(ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }
}

/// Frames / sample rate for readable WAV files.
fn wav_duration(path: &Path) -> Option<f64> {
    let is_wav = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
    if !is_wav {
        return None;
    }
    let reader = hound::WavReader::open(path).ok()?;
    let rate = reader.spec().sample_rate;
    if rate == 0 {
        return None;
    }
    Some(f64::from(reader.duration()) / f64::from(rate))
}
