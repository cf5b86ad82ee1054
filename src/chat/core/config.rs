//! Configuration for the chat client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::chat::core::errors::{ChatError, ChatResult};

/// Default REST backend.
pub const DEFAULT_API_URL: &str = "https://galaxy-backend-imkz.onrender.com";
/// Default realtime endpoint.
pub const DEFAULT_SOCKET_URL: &str = "wss://galaxy-backend-imkz.onrender.com";

/// Top-level configuration for a chat session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatConfig {
    /// REST backend settings.
    pub api: ApiConfig,
    /// Realtime transport settings.
    pub realtime: RealtimeConfig,
    /// Typing presence settings.
    pub typing: TypingConfig,
    /// History pagination settings.
    pub history: HistoryConfig,
    /// Attachment bounds.
    pub attachments: AttachmentLimits,
    /// Number of conversation message caches kept in memory.
    pub cache_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            realtime: RealtimeConfig::default(),
            typing: TypingConfig::default(),
            history: HistoryConfig::default(),
            attachments: AttachmentLimits::default(),
            cache_capacity: 16,
        }
    }
}

impl ChatConfig {
    /// Create a new config with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from `GALAXY_*` environment variables.
    ///
    /// # Errors
    /// Returns an error if a variable is set to an unparsable value.
    pub fn from_env() -> ChatResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, starting from defaults.
    ///
    /// # Errors
    /// Returns an error if a value cannot be parsed or the result is invalid.
    pub fn from_lookup<F>(lookup: F) -> ChatResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("GALAXY_API_URL") {
            config.api.base_url = url;
        }
        if let Some(url) = lookup("GALAXY_SOCKET_URL") {
            config.realtime.endpoint = url;
        }
        if let Some(raw) = lookup("GALAXY_PAGE_SIZE") {
            config.history.page_size = parse_var("GALAXY_PAGE_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("GALAXY_TYPING_TIMEOUT_MS") {
            config.typing.inactivity =
                Duration::from_millis(parse_var("GALAXY_TYPING_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("GALAXY_RECONNECT_ATTEMPTS") {
            config.realtime.reconnect.max_attempts = parse_var("GALAXY_RECONNECT_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("GALAXY_RECONNECT_DELAY_MS") {
            config.realtime.reconnect.delay =
                Duration::from_millis(parse_var("GALAXY_RECONNECT_DELAY_MS", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the REST backend base URL.
    #[must_use]
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api.base_url = url.into();
        self
    }

    /// Set the realtime endpoint.
    #[must_use]
    pub fn with_socket_url(mut self, url: impl Into<String>) -> Self {
        self.realtime.endpoint = url.into();
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub const fn with_reconnect(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.realtime.reconnect = ReconnectPolicy {
            max_attempts,
            delay,
        };
        self
    }

    /// Set the typing inactivity timeout.
    #[must_use]
    pub const fn with_typing_timeout(mut self, timeout: Duration) -> Self {
        self.typing.inactivity = timeout;
        self
    }

    /// Set the history page size.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: u32) -> Self {
        self.history.page_size = page_size;
        self
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> ChatResult<()> {
        Url::parse(&self.api.base_url)
            .map_err(|e| ChatError::Config(format!("api.base_url: {e}")))?;

        let socket = Url::parse(&self.realtime.endpoint)
            .map_err(|e| ChatError::Config(format!("realtime.endpoint: {e}")))?;
        if !matches!(socket.scheme(), "ws" | "wss" | "http" | "https") {
            return Err(ChatError::Config(format!(
                "realtime.endpoint has unsupported scheme {}",
                socket.scheme()
            )));
        }

        if self.history.page_size == 0 {
            return Err(ChatError::Config(
                "history.page_size must be > 0".to_string(),
            ));
        }

        if self.attachments.max_files == 0 {
            return Err(ChatError::Config(
                "attachments.max_files must be > 0".to_string(),
            ));
        }

        if self.cache_capacity == 0 {
            return Err(ChatError::Config("cache_capacity must be > 0".to_string()));
        }

        Ok(())
    }
}

/// REST backend settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL every `/chats/v1` and `/user/v1` path is joined onto.
    pub base_url: String,
    /// Whole-request timeout.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// TCP/TLS connect timeout.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Realtime transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Websocket endpoint.
    pub endpoint: String,
    /// Socket.IO mount path.
    pub path: String,
    /// Deadline for a single connection attempt, handshake included.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Reconnection policy after an unexpected loss.
    pub reconnect: ReconnectPolicy,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SOCKET_URL.to_string(),
            path: "/socket.io".to_string(),
            connect_timeout: Duration::from_millis(10_000),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Bounded, fixed-interval reconnection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Attempts made before giving up.
    pub max_attempts: u32,
    /// Pause before each attempt.
    #[serde(with = "duration_ms")]
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Typing presence settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Quiet period after which a typing user reverts to idle.
    #[serde(with = "duration_ms")]
    pub inactivity: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            inactivity: Duration::from_millis(3000),
        }
    }
}

/// History pagination settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Messages requested per page.
    pub page_size: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { page_size: 50 }
    }
}

/// Bounds applied to selected files before upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentLimits {
    /// Maximum files per message.
    pub max_files: usize,
    /// Maximum size of one file in bytes.
    pub max_file_bytes: u64,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_files: 3,
            max_file_bytes: 5 * 1024 * 1024, // 5 MiB
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> ChatResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| ChatError::Config(format!("{key} has invalid value {raw:?}")))
}

/// Serde module for millisecond durations.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
