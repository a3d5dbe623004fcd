//! Configuration for the runtime and protocol sessions.
//!
//! Options load from a TOML file with per-field defaults, or are built in
//! code. Session-facing option structs are plain `Clone` values handed to
//! each session at creation time.

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Severity for the embedder-facing logger callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Log sink for session-level events (timeouts, protocol errors,
/// connection teardown). Invoked from worker threads.
pub type LoggerCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// The default logger: forward everything to tracing.
pub fn tracing_logger() -> LoggerCallback {
    Arc::new(|level, message| match level {
        LogLevel::Debug => tracing::debug!("{}", message),
        LogLevel::Info => tracing::info!("{}", message),
        LogLevel::Warn => tracing::warn!("{}", message),
        LogLevel::Error => tracing::error!("{}", message),
    })
}

/// Per-session transport options.
#[derive(Clone)]
pub struct SessionOptions {
    /// Capacity limit of the receive buffer.
    pub max_buffer_size: usize,
    /// Idle timeout; zero or negative disables the idle timer.
    pub timeout_millis: i64,
    pub logger: LoggerCallback,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            max_buffer_size: default_max_buffer_size(),
            timeout_millis: default_timeout_millis(),
            logger: tracing_logger(),
        }
    }
}

/// HTTP decoder and session options.
#[derive(Clone)]
pub struct HttpOptions {
    pub session: SessionOptions,
    pub max_first_line_size: usize,
    pub max_header_size: usize,
    /// Per-message content limit; `None` is unlimited.
    pub max_content_size: Option<usize>,
    /// Injected into outgoing requests.
    pub user_agent: String,
    /// Injected into outgoing responses.
    pub server_name: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        HttpOptions {
            session: SessionOptions::default(),
            max_first_line_size: default_max_first_line_size(),
            max_header_size: default_max_header_size(),
            max_content_size: Some(default_max_content_size()),
            user_agent: default_user_agent(),
            server_name: default_server_name(),
        }
    }
}

/// WebSocket options; the handshake phase runs under the HTTP options.
#[derive(Clone)]
pub struct WsOptions {
    pub http: HttpOptions,
    /// Limit for a single frame payload and for reassembled messages.
    pub max_payload_size: usize,
}

impl Default for WsOptions {
    fn default() -> Self {
        WsOptions {
            http: HttpOptions::default(),
            max_payload_size: default_max_payload_size(),
        }
    }
}

/// TOML-loadable configuration.
#[derive(Debug, Deserialize, Default)]
pub struct RuntimeOptions {
    #[serde(default)]
    pub runtime: ThreadConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

/// Thread pool sizing; 0 selects hardware defaults.
#[derive(Debug, Deserialize, Default)]
pub struct ThreadConfig {
    #[serde(default)]
    pub worker_threads: usize,
    #[serde(default)]
    pub event_loops: usize,
}

#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default = "default_timeout_millis")]
    pub timeout_millis: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_buffer_size: default_max_buffer_size(),
            timeout_millis: default_timeout_millis(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_max_first_line_size")]
    pub max_first_line_size: usize,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// 0 means unlimited.
    #[serde(default = "default_max_content_size")]
    pub max_content_size: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            max_first_line_size: default_max_first_line_size(),
            max_header_size: default_max_header_size(),
            max_content_size: default_max_content_size(),
            user_agent: default_user_agent(),
            server_name: default_server_name(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_payload_size: default_max_payload_size(),
        }
    }
}

fn default_max_buffer_size() -> usize {
    4 * 1024 * 1024
}

fn default_timeout_millis() -> i64 {
    60_000
}

fn default_max_first_line_size() -> usize {
    8 * 1024
}

fn default_max_header_size() -> usize {
    64 * 1024
}

fn default_max_content_size() -> usize {
    4 * 1024 * 1024
}

fn default_max_payload_size() -> usize {
    4 * 1024 * 1024
}

fn default_user_agent() -> String {
    "wireloop-http-client".to_string()
}

fn default_server_name() -> String {
    "wireloop-server".to_string()
}

impl RuntimeOptions {
    pub fn from_toml(text: &str) -> Result<RuntimeOptions, ConfigError> {
        toml::from_str(text).map_err(ConfigError::TomlParse)
    }

    pub fn from_toml_file(path: impl Into<PathBuf>) -> Result<RuntimeOptions, ConfigError> {
        let path = path.into();
        let contents =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        Self::from_toml(&contents)
    }

    /// Session options with the default tracing logger.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            max_buffer_size: self.session.max_buffer_size,
            timeout_millis: self.session.timeout_millis,
            logger: tracing_logger(),
        }
    }

    pub fn http_options(&self) -> HttpOptions {
        HttpOptions {
            session: self.session_options(),
            max_first_line_size: self.http.max_first_line_size,
            max_header_size: self.http.max_header_size,
            max_content_size: match self.http.max_content_size {
                0 => None,
                n => Some(n),
            },
            user_agent: self.http.user_agent.clone(),
            server_name: self.http.server_name.clone(),
        }
    }

    pub fn ws_options(&self) -> WsOptions {
        WsOptions {
            http: self.http_options(),
            max_payload_size: self.websocket.max_payload_size,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(e) => {
                write!(f, "Failed to parse config: {}", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = RuntimeOptions::default();
        assert_eq!(options.runtime.worker_threads, 0);
        assert_eq!(options.session.max_buffer_size, 4 * 1024 * 1024);
        assert_eq!(options.session.timeout_millis, 60_000);
        assert_eq!(options.http.max_first_line_size, 8 * 1024);
        assert_eq!(options.http.max_header_size, 64 * 1024);
        assert_eq!(options.http.user_agent, "wireloop-http-client");
        assert_eq!(options.http.server_name, "wireloop-server");
        assert_eq!(options.websocket.max_payload_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [runtime]
            worker_threads = 4
            event_loops = 2

            [session]
            max_buffer_size = 65536
            timeout_millis = 5000

            [http]
            max_content_size = 0
            server_name = "edge-1"

            [websocket]
            max_payload_size = 1048576
        "#;

        let options = RuntimeOptions::from_toml(toml_str).unwrap();
        assert_eq!(options.runtime.worker_threads, 4);
        assert_eq!(options.runtime.event_loops, 2);
        assert_eq!(options.session.max_buffer_size, 65536);
        assert_eq!(options.session.timeout_millis, 5000);
        assert_eq!(options.http.server_name, "edge-1");
        // defaults fill unspecified fields
        assert_eq!(options.http.max_header_size, 64 * 1024);
        assert_eq!(options.websocket.max_payload_size, 1024 * 1024);

        // content size 0 maps to unlimited
        let http = options.http_options();
        assert_eq!(http.max_content_size, None);
        assert_eq!(http.session.timeout_millis, 5000);
    }

    #[test]
    fn test_toml_parse_error() {
        let err = RuntimeOptions::from_toml("runtime = nonsense").unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(_)));
    }
}
