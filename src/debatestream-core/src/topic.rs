//! Current discussion topic.
//!
//! Resolution order: an unexpired override (set by a chat watcher), the
//! environment variable named in the config, the topic file (re-read when
//! its modification time changes, checked at most every `reload_s`), and
//! finally the configured default.

use std::fs;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TopicConfig;

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A time-limited topic set from outside the process.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicOverride {
    pub topic: String,
    pub expires_at: Instant,
    pub source: String,
    pub author: Option<String>,
}

#[derive(Debug, Default)]
struct TopicState {
    active: Option<TopicOverride>,
    file_topic: Option<String>,
    last_check: Option<Instant>,
    last_mtime: Option<SystemTime>,
}

pub struct TopicProvider {
    config: TopicConfig,
    env: EnvLookup,
    state: Mutex<TopicState>,
}

impl TopicProvider {
    pub fn new(config: TopicConfig) -> Self {
        Self {
            config,
            env: Box::new(|key| std::env::var(key).ok()),
            state: Mutex::new(TopicState::default()),
        }
    }

    /// Replace the environment source (tests, embedding).
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(lookup);
        self
    }

    pub fn get(&self) -> String {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Instant::now();
        if let Some(active) = &state.active {
            if now < active.expires_at {
                return active.topic.clone();
            }
            debug!(target: "topic", topic = %active.topic, "override expired");
            state.active = None;
        }

        if let Some(topic) = (self.env)(&self.config.topic_env)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
        {
            return topic;
        }

        self.refresh_file(&mut state, now);
        state
            .file_topic
            .clone()
            .unwrap_or_else(|| self.config.default_topic.clone())
    }

    /// Set a topic that wins over every other source for `ttl`.
    pub fn set_override(&self, topic: &str, ttl: Duration, source: &str, author: Option<&str>) {
        let topic = topic.trim();
        if topic.is_empty() {
            return;
        }
        let active = TopicOverride {
            topic: topic.to_string(),
            expires_at: Instant::now() + ttl,
            source: source.to_string(),
            author: author.map(str::to_string),
        };
        info!(
            target: "topic",
            topic,
            source,
            author = author.unwrap_or("-"),
            ttl_s = ttl.as_secs(),
            "topic override set"
        );
        match self.state.lock() {
            Ok(mut guard) => guard.active = Some(active),
            Err(poisoned) => poisoned.into_inner().active = Some(active),
        }
    }

    /// The override, if one is set and unexpired.
    pub fn active_override(&self) -> Option<TopicOverride> {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state
            .active
            .clone()
            .filter(|active| Instant::now() < active.expires_at)
    }

    fn refresh_file(&self, state: &mut TopicState, now: Instant) {
        let reload = Duration::from_secs(self.config.reload_s);
        let fresh = state
            .last_check
            .is_some_and(|checked| now.duration_since(checked) < reload);
        if state.file_topic.is_some() && fresh {
            return;
        }
        state.last_check = Some(now);

        let path = &self.config.topic_file;
        let mtime = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return,
        };
        if state.last_mtime == Some(mtime) {
            return;
        }
        state.last_mtime = Some(mtime);

        match fs::read_to_string(path) {
            Ok(content) => {
                let content = content.trim();
                if !content.is_empty() {
                    debug!(target: "topic", path = %path.display(), "topic file reloaded");
                    state.file_topic = Some(content.to_string());
                }
            }
            Err(e) => warn!(target: "topic", path = %path.display(), error = %e, "failed to read topic file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    fn config(file: &Path, reload_s: u64) -> TopicConfig {
        TopicConfig {
            topic_env: "DEBATESTREAM_TEST_TOPIC".to_string(),
            topic_file: file.to_path_buf(),
            reload_s,
            default_topic: "Default topic".to_string(),
        }
    }

    fn write_topic(path: &Path, text: &str, mtime: SystemTime) {
        let mut file = File::create(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_expires_into_fallback_chain() {
        let dir = tempfile::tempdir().unwrap();
        let provider = TopicProvider::new(config(&dir.path().join("missing.txt"), 180))
            .with_env_lookup(|_| Some("From env".to_string()));

        provider.set_override("X", Duration::from_secs(10), "youtube", Some("viewer"));
        assert_eq!(provider.get(), "X");
        assert_eq!(provider.active_override().unwrap().author.as_deref(), Some("viewer"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(provider.get(), "From env");
        assert!(provider.active_override().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_then_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topic.txt");
        let provider = TopicProvider::new(config(&path, 0)).with_env_lookup(|_| None);

        assert_eq!(provider.get(), "Default topic");

        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        write_topic(&path, "  File topic \n", t0);
        assert_eq!(provider.get(), "File topic");

        write_topic(&path, "Changed topic", t0 + Duration::from_secs(5));
        assert_eq!(provider.get(), "Changed topic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_reload_waits_for_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topic.txt");
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(2_000_000);
        write_topic(&path, "First", t0);

        let provider = TopicProvider::new(config(&path, 180)).with_env_lookup(|_| None);
        assert_eq!(provider.get(), "First");

        write_topic(&path, "Second", t0 + Duration::from_secs(5));
        assert_eq!(provider.get(), "First");

        tokio::time::advance(Duration::from_secs(181)).await;
        assert_eq!(provider.get(), "Second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_override_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let provider =
            TopicProvider::new(config(&dir.path().join("none"), 180)).with_env_lookup(|_| None);
        provider.set_override("   ", Duration::from_secs(60), "youtube", None);
        assert_eq!(provider.get(), "Default topic");
    }

    #[test]
    #[serial]
    fn test_process_environment_is_default_source() {
        let dir = tempfile::tempdir().unwrap();
        let provider = TopicProvider::new(config(&dir.path().join("none"), 180));

        // SAFETY: serialized with every other test touching this variable.
        unsafe { std::env::set_var("DEBATESTREAM_TEST_TOPIC", "Env topic") };
        assert_eq!(provider.get(), "Env topic");

        unsafe { std::env::remove_var("DEBATESTREAM_TEST_TOPIC") };
        assert_eq!(provider.get(), "Default topic");
    }
}
