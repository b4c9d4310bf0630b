use crate::backoff::BackoffPolicy;
use crate::error::{SyncError, SyncResult};
use crew_core::stream_protocol::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;
use tracing::warn;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8787";
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_PROMOTE_EVERY: u32 = 6;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_REPORT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Base URL for the configuration check and snapshot reads.
    pub api_url: Url,
    /// Base URL for push subscriptions; derived from `api_url` when unset.
    pub stream_url: Option<Url>,
    /// When false every resource is mirrored by polling only.
    pub push_enabled: bool,
    pub backoff: BackoffPolicy,
    /// Consecutive push failures before a resource is demoted to polling.
    pub failure_threshold: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    /// Poll cycles between promotion probes; 0 disables periodic probing.
    pub promote_every: u32,
    pub report_capacity: usize,
    pub max_frame_bytes: usize,
}

impl SyncConfig {
    pub fn new(api_url: Url) -> Self {
        Self {
            api_url,
            stream_url: None,
            push_enabled: true,
            backoff: BackoffPolicy::default(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            promote_every: DEFAULT_PROMOTE_EVERY,
            report_capacity: DEFAULT_REPORT_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn parse(api_url: &str) -> SyncResult<Self> {
        Ok(Self::new(parse_url("api url", api_url)?))
    }

    /// Build from `CREW_*` environment variables. Only a malformed URL is an
    /// error; malformed numbers fall back to defaults.
    pub fn from_env() -> SyncResult<Self> {
        let api_url = std::env::var("CREW_API_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let mut config = Self::parse(&api_url)?;

        if let Some(stream_url) = std::env::var("CREW_STREAM_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
        {
            config.stream_url = Some(parse_url("stream url", &stream_url)?);
        }
        if let Ok(value) = std::env::var("CREW_PUSH_ENABLED") {
            match parse_bool_flag(&value) {
                Some(enabled) => config.push_enabled = enabled,
                None => warn!("config_invalid_flag: CREW_PUSH_ENABLED={value}"),
            }
        }
        if let Some(ms) = env_number::<u64>("CREW_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("CREW_BACKOFF_BASE_MS") {
            config.backoff.base = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("CREW_BACKOFF_CAP_MS") {
            config.backoff.cap = Duration::from_millis(ms);
        }
        if let Some(threshold) = env_number::<u32>("CREW_FAILURE_THRESHOLD") {
            config.failure_threshold = threshold;
        }
        if let Some(every) = env_number::<u32>("CREW_PROMOTE_EVERY") {
            config.promote_every = every;
        }
        if let Some(ms) = env_number::<u64>("CREW_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("CREW_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn set_api_url(&mut self, raw: &str) -> SyncResult<()> {
        self.api_url = parse_url("api url", raw)?;
        Ok(())
    }

    pub fn set_stream_url(&mut self, raw: &str) -> SyncResult<()> {
        self.stream_url = Some(parse_url("stream url", raw)?);
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.failure_threshold == 0 {
            return Err(SyncError::InvalidConfig(
                "failure threshold must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(SyncError::InvalidConfig(
                "poll interval must be positive".to_string(),
            ));
        }
        if self.report_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "report capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// WebSocket base for push subscriptions.
    pub fn stream_base(&self) -> SyncResult<Url> {
        if let Some(url) = &self.stream_url {
            return Ok(url.clone());
        }
        let mut url = self.api_url.clone();
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(SyncError::InvalidConfig(format!(
                    "unsupported api url scheme: {other}"
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            SyncError::InvalidConfig(format!("cannot derive stream url from {}", self.api_url))
        })?;
        Ok(url)
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_url(label: &str, raw: &str) -> SyncResult<Url> {
    Url::parse(raw.trim()).map_err(|err| SyncError::InvalidConfig(format!("{label} '{raw}': {err}")))
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("config_invalid_number: {name}={value}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_base_swaps_http_scheme_for_websocket() {
        let config = SyncConfig::parse("https://crew.example.com/base").expect("config");
        assert_eq!(
            config.stream_base().expect("stream").as_str(),
            "wss://crew.example.com/base"
        );

        let local = SyncConfig::parse("http://127.0.0.1:8787").expect("config");
        assert_eq!(local.stream_base().expect("stream").scheme(), "ws");
    }

    #[test]
    fn explicit_stream_url_wins() {
        let mut config = SyncConfig::parse("http://127.0.0.1:8787").expect("config");
        config.stream_url = Some(Url::parse("ws://10.0.0.2:9000").expect("url"));
        assert_eq!(
            config.stream_base().expect("stream").as_str(),
            "ws://10.0.0.2:9000/"
        );
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(matches!(
            SyncConfig::parse("not a url"),
            Err(SyncError::InvalidConfig(_))
        ));
        let mut config = SyncConfig::parse(DEFAULT_API_URL).expect("config");
        config.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_replace_urls() {
        let mut config = SyncConfig::parse(DEFAULT_API_URL).expect("config");
        config.set_api_url("https://crew.example.com").expect("api url");
        config.set_stream_url("wss://push.example.com").expect("stream url");
        assert_eq!(config.api_url.host_str(), Some("crew.example.com"));
        assert_eq!(
            config.stream_base().expect("stream").host_str(),
            Some("push.example.com")
        );
        assert!(config.set_api_url("::nope").is_err());
    }

    #[test]
    fn bool_flags_accept_common_spellings() {
        assert_eq!(parse_bool_flag(" Yes "), Some(true));
        assert_eq!(parse_bool_flag("off"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
    }
}
