/// Configuration management
use crate::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

/// Realtime core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the portal request/response API
    pub api_base_url: String,

    /// Path of the server-push (SSE) endpoint, relative to `api_base_url`
    pub events_path: String,

    /// Timeout for a single request/response call
    pub request_timeout: Duration,

    /// Timeout for opening the push channel
    pub connect_timeout: Duration,

    /// Silence on the push channel longer than this counts as a dropped channel
    pub keepalive_timeout: Duration,

    /// Delay before the first reconnect attempt
    pub reconnect_initial_delay: Duration,

    /// Ceiling for the reconnect delay
    pub reconnect_max_delay: Duration,

    /// Growth factor applied per consecutive failure
    pub reconnect_multiplier: u32,

    /// Local quiet period after which a "stop typing" signal is emitted
    pub typing_quiet_period: Duration,

    /// How long a remote "start typing" signal stays valid
    pub remote_typing_timeout: Duration,

    /// Messages requested per history page
    pub history_page_size: usize,

    /// Notifications requested per page
    pub notification_page_size: usize,

    /// Capacity of the push event broadcast
    pub event_buffer: usize,

    /// Conversation the binary opens on start (optional)
    pub conversation: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            events_path: "/events".to_string(),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(45),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_multiplier: 2,
            typing_quiet_period: Duration::from_secs(3),
            remote_typing_timeout: Duration::from_secs(5),
            history_page_size: 30,
            notification_page_size: 20,
            event_buffer: 256,
            conversation: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(RealtimeError::Config(format!(
                "Usage: {} <api_base_url> [--conversation <id>] [--events-path <path>] [--reconnect-initial-ms <ms>] [--reconnect-max-ms <ms>] [--typing-timeout-ms <ms>]",
                args.first().map(String::as_str).unwrap_or("realtime")
            )));
        }

        let mut config = Self {
            api_base_url: parse_base_url(&args[1])?,
            ..Default::default()
        };

        let mut i = 2;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = || {
                args.get(i + 1).ok_or_else(|| {
                    RealtimeError::Config(format!("{} requires an argument", flag))
                })
            };
            match flag {
                "--conversation" => {
                    config.conversation = Some(value()?.clone());
                }
                "--events-path" => {
                    let path = value()?;
                    if !path.starts_with('/') {
                        return Err(RealtimeError::Config(
                            "--events-path must start with '/'".to_string(),
                        ));
                    }
                    config.events_path = path.clone();
                }
                "--reconnect-initial-ms" => {
                    config.reconnect_initial_delay = parse_millis(flag, value()?)?;
                }
                "--reconnect-max-ms" => {
                    config.reconnect_max_delay = parse_millis(flag, value()?)?;
                }
                "--typing-timeout-ms" => {
                    config.remote_typing_timeout = parse_millis(flag, value()?)?;
                }
                other => {
                    return Err(RealtimeError::Config(format!("Unknown argument: {}", other)));
                }
            }
            i += 2;
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("PORTAL_API_URL") {
            config.api_base_url = parse_base_url(&url)?;
        }
        if let Some(ms) = std::env::var("PORTAL_RECONNECT_MAX_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.reconnect_max_delay = Duration::from_millis(ms);
        }

        if config.reconnect_initial_delay > config.reconnect_max_delay {
            return Err(RealtimeError::Config(
                "reconnect initial delay must not exceed the maximum delay".to_string(),
            ));
        }

        Ok(config)
    }

    /// Full URL of the push endpoint
    pub fn events_url(&self) -> String {
        format!("{}{}", self.api_base_url, self.events_path)
    }
}

fn parse_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim_end_matches('/');
    if !trimmed.starts_with("http://") {
        return Err(RealtimeError::Config(format!(
            "API URL must be an http:// URL, got '{}'",
            raw
        )));
    }
    Ok(trimmed.to_string())
}

fn parse_millis(flag: &str, raw: &str) -> Result<Duration> {
    raw.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| RealtimeError::Config(format!("{} must be a number of milliseconds", flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_requires_base_url() {
        assert!(matches!(
            Config::from_args(&args(&["realtime"])),
            Err(RealtimeError::Config(_))
        ));
    }

    #[test]
    fn test_parses_flags() {
        let config = Config::from_args(&args(&[
            "realtime",
            "http://portal.local:8000/",
            "--conversation",
            "conv-7",
            "--reconnect-max-ms",
            "5000",
        ]))
        .unwrap();

        assert_eq!(config.api_base_url, "http://portal.local:8000");
        assert_eq!(config.conversation.as_deref(), Some("conv-7"));
        assert_eq!(config.reconnect_max_delay, Duration::from_secs(5));
        assert_eq!(config.events_url(), "http://portal.local:8000/events");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_args(&args(&["realtime", "ftp://x"])).is_err());
        assert!(Config::from_args(&args(&[
            "realtime",
            "http://x",
            "--typing-timeout-ms",
            "soon"
        ]))
        .is_err());
        assert!(Config::from_args(&args(&["realtime", "http://x", "--conversation"])).is_err());
    }
}
