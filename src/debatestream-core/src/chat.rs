//! Live-chat topic commands.
//!
//! Viewers (moderators by default) type `!topic <text>` in the YouTube live
//! chat; accepted commands become a time-limited topic override.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::error::StreamError;
use crate::heygen::read_body;
use crate::orchestrator::TopicHandle;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const SEEN_MAX: usize = 2000;
const SEEN_KEEP: usize = 1000;
const ERROR_PAUSE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatAuthor {
    pub channel_id: String,
    pub display_name: String,
    pub is_chat_owner: bool,
    pub is_chat_moderator: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatSnippet {
    pub display_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub snippet: ChatSnippet,
    pub author_details: ChatAuthor,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatPage {
    pub items: Vec<ChatMessage>,
    pub next_page_token: Option<String>,
    pub polling_interval_millis: Option<u64>,
}

/// An accepted `!topic` command.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicCommand {
    pub topic: String,
    pub author: ChatAuthor,
}

/// Decides which chat messages change the topic.
#[derive(Debug)]
pub struct TopicCommandFilter {
    prefix: String,
    allowlist: HashSet<String>,
    mods_only: bool,
    cooldown: Duration,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
    last_change: Option<Instant>,
}

impl TopicCommandFilter {
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            prefix: config.command_prefix.trim().to_lowercase(),
            allowlist: config
                .allowlist
                .iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
            mods_only: config.mods_only,
            cooldown: Duration::from_secs(config.cooldown_s),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            last_change: None,
        }
    }

    fn author_allowed(&self, author: &ChatAuthor) -> bool {
        if !self.allowlist.is_empty() {
            return self.allowlist.contains(&author.channel_id) || self.allowlist.contains(&author.display_name);
        }
        if self.mods_only {
            return author.is_chat_owner || author.is_chat_moderator;
        }
        true
    }

    /// Returns false for messages already processed.
    fn remember(&mut self, id: &str) -> bool {
        if id.is_empty() || !self.seen.insert(id.to_string()) {
            return false;
        }
        self.seen_order.push_back(id.to_string());
        if self.seen_order.len() > SEEN_MAX {
            while self.seen_order.len() > SEEN_KEEP {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        true
    }

    fn parse_command<'a>(&self, text: &'a str) -> Option<&'a str> {
        let head = text.get(..self.prefix.len())?;
        if self.prefix.is_empty() || head.to_lowercase() != self.prefix {
            return None;
        }
        let topic = text[self.prefix.len()..].trim_matches(|c: char| c == ' ' || c == ':');
        (!topic.is_empty()).then_some(topic)
    }

    pub fn accept(&mut self, message: &ChatMessage, now: Instant) -> Option<TopicCommand> {
        if !self.remember(&message.id) {
            return None;
        }
        let text = message.snippet.display_message.trim();
        if text.is_empty() || !self.author_allowed(&message.author_details) {
            return None;
        }
        let topic = self.parse_command(text)?;
        if let Some(last) = self.last_change
            && now.duration_since(last) < self.cooldown
        {
            debug!(target: "chat", topic, "topic command ignored during cooldown");
            return None;
        }
        self.last_change = Some(now);
        Some(TopicCommand {
            topic: topic.to_string(),
            author: message.author_details.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BroadcastSnippet {
    live_chat_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BroadcastItem {
    snippet: BroadcastSnippet,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BroadcastList {
    items: Vec<BroadcastItem>,
}

/// YouTube Data API client for live chat.
pub struct YouTubeChatClient {
    http: reqwest::Client,
    config: ChatConfig,
    token: Mutex<Option<(String, Instant)>>,
}

impl YouTubeChatClient {
    pub fn new(config: ChatConfig) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StreamError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    fn has_oauth(&self) -> bool {
        !self.config.client_id.is_empty()
            && !self.config.client_secret.is_empty()
            && !self.config.refresh_token.is_empty()
    }

    /// A cached OAuth access token, refreshed a minute before expiry.
    async fn access_token(&self) -> Result<Option<String>, StreamError> {
        if !self.has_oauth() {
            return Ok(None);
        }
        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref()
            && Instant::now() + Duration::from_secs(60) < *expires_at
        {
            return Ok(Some(token.clone()));
        }

        let resp = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", self.config.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        let body = read_body(resp).await?;
        let parsed: TokenResponse = serde_json::from_str(&body)?;
        let token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| StreamError::UnexpectedResponse("token refresh missing access_token".to_string()))?;
        *cached = Some((token.clone(), Instant::now() + Duration::from_secs(parsed.expires_in)));
        debug!(target: "chat", "access token refreshed");
        Ok(Some(token))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, StreamError> {
        let mut request = self.http.get(format!("{}/{}", API_BASE, endpoint)).query(params);
        match self.access_token().await? {
            Some(token) => request = request.bearer_auth(token),
            None if !self.config.api_key.is_empty() => {
                request = request.query(&[("key", self.config.api_key.as_str())]);
            }
            None => {}
        }
        let body = read_body(request.send().await?).await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn live_chat_id(&self) -> Result<String, StreamError> {
        if !self.config.live_chat_id.is_empty() {
            return Ok(self.config.live_chat_id.clone());
        }
        if self.config.broadcast_id.is_empty() {
            return Err(StreamError::ConfigError(
                "YOUTUBE_BROADCAST_ID or YOUTUBE_LIVE_CHAT_ID is required".to_string(),
            ));
        }
        let list: BroadcastList = self
            .get_json(
                "liveBroadcasts",
                &[("part", "snippet"), ("id", self.config.broadcast_id.as_str())],
            )
            .await?;
        list.items
            .into_iter()
            .next()
            .and_then(|item| item.snippet.live_chat_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| StreamError::UnexpectedResponse("liveChatId missing in broadcast".to_string()))
    }

    pub async fn list_messages(&self, live_chat_id: &str, page_token: Option<&str>) -> Result<ChatPage, StreamError> {
        let mut params = vec![
            ("liveChatId", live_chat_id),
            ("part", "snippet,authorDetails"),
            ("maxResults", "200"),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        self.get_json("liveChatMessages", &params).await
    }
}

/// Polls the live chat and forwards accepted topic commands.
pub struct YouTubeTopicWatcher {
    client: YouTubeChatClient,
    filter: TopicCommandFilter,
    ttl: Duration,
    poll_fallback: Duration,
    stop: Arc<AtomicBool>,
}

impl YouTubeTopicWatcher {
    pub fn new(config: ChatConfig) -> Result<Self, StreamError> {
        Ok(Self {
            filter: TopicCommandFilter::new(&config),
            ttl: Duration::from_secs(config.topic_ttl_s),
            poll_fallback: Duration::from_millis(config.poll_fallback_ms),
            client: YouTubeChatClient::new(config)?,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that ends [`Self::run`] after the current poll.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub async fn run(mut self, topics: TopicHandle) -> Result<(), StreamError> {
        let live_chat_id = self.client.live_chat_id().await?;
        info!(target: "chat", live_chat_id, "watching live chat for topic commands");

        let mut page_token: Option<String> = None;
        while !self.stop.load(Ordering::Relaxed) {
            match self.client.list_messages(&live_chat_id, page_token.as_deref()).await {
                Ok(page) => {
                    page_token = page.next_page_token.clone();
                    for message in &page.items {
                        if let Some(command) = self.filter.accept(message, Instant::now()) {
                            let author = if command.author.display_name.is_empty() {
                                None
                            } else {
                                Some(command.author.display_name.as_str())
                            };
                            topics.set_topic(&command.topic, self.ttl, "youtube", author).await;
                        }
                    }
                    let wait = page
                        .polling_interval_millis
                        .map(Duration::from_millis)
                        .unwrap_or(self.poll_fallback);
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    warn!(target: "chat", error = %e, "live chat poll failed");
                    tokio::time::sleep(ERROR_PAUSE).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, text: &str, moderator: bool) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            snippet: ChatSnippet {
                display_message: text.to_string(),
            },
            author_details: ChatAuthor {
                channel_id: format!("chan-{id}"),
                display_name: format!("user-{id}"),
                is_chat_owner: false,
                is_chat_moderator: moderator,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepts_moderator_command() {
        let mut filter = TopicCommandFilter::new(&ChatConfig::default());
        let cmd = filter
            .accept(&message("1", "!Topic: Galaxy rotation curves ", true), Instant::now())
            .unwrap();
        assert_eq!(cmd.topic, "Galaxy rotation curves");
        assert_eq!(cmd.author.display_name, "user-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_non_moderators_and_noise() {
        let mut filter = TopicCommandFilter::new(&ChatConfig::default());
        let now = Instant::now();
        assert!(filter.accept(&message("1", "!topic lensing", false), now).is_none());
        assert!(filter.accept(&message("2", "hello", true), now).is_none());
        assert!(filter.accept(&message("3", "!topic   ", true), now).is_none());
        assert!(filter.accept(&message("", "!topic lensing", true), now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ids_are_ignored() {
        let mut filter = TopicCommandFilter::new(&ChatConfig {
            cooldown_s: 0,
            ..ChatConfig::default()
        });
        let now = Instant::now();
        assert!(filter.accept(&message("7", "!topic A", true), now).is_some());
        assert!(filter.accept(&message("7", "!topic A", true), now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_between_changes() {
        let mut filter = TopicCommandFilter::new(&ChatConfig::default());
        let start = Instant::now();
        assert!(filter.accept(&message("1", "!topic first", true), start).is_some());
        assert!(
            filter
                .accept(&message("2", "!topic second", true), start + Duration::from_secs(60))
                .is_none()
        );
        assert!(
            filter
                .accept(&message("3", "!topic third", true), start + Duration::from_secs(181))
                .is_some()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowlist_overrides_moderator_check() {
        let mut filter = TopicCommandFilter::new(&ChatConfig {
            allowlist: vec!["user-2".to_string()],
            cooldown_s: 0,
            ..ChatConfig::default()
        });
        let now = Instant::now();
        assert!(filter.accept(&message("1", "!topic a", true), now).is_none());
        assert!(filter.accept(&message("2", "!topic b", false), now).is_some());
    }

    #[test]
    fn test_seen_set_is_bounded() {
        let mut filter = TopicCommandFilter::new(&ChatConfig::default());
        for i in 0..=SEEN_MAX {
            assert!(filter.remember(&i.to_string()));
        }
        assert_eq!(filter.seen.len(), SEEN_KEEP);
        assert!(filter.remember("0"));
        assert!(!filter.remember(&SEEN_MAX.to_string()));
    }

    #[test]
    fn test_chat_page_parsing() {
        let raw = r#"{
            "nextPageToken": "p2",
            "pollingIntervalMillis": 5000,
            "items": [{
                "id": "m1",
                "snippet": {"displayMessage": "!topic MOND"},
                "authorDetails": {"channelId": "c", "displayName": "d", "isChatModerator": true}
            }]
        }"#;
        let page: ChatPage = serde_json::from_str(raw).unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("p2"));
        assert_eq!(page.polling_interval_millis, Some(5000));
        assert!(page.items[0].author_details.is_chat_moderator);
    }
}
