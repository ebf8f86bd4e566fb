//! extsvc.toml configuration parser and the resolved runtime settings.
//!
//! The file is optional and every field in it is optional; durations are
//! strings such as `"3s"`, `"500ms"` or `"2m"`.

use std::path::Path;
use std::time::Duration;

use extsvc_backend::ConsulConfig;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtsvcConfig {
    pub backend: BackendSection,
    pub watcher: WatcherSection,
    pub session: SessionSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendSection {
    pub address: Option<String>,
    pub token: Option<String>,
    pub datacenter: Option<String>,
    pub request_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatcherSection {
    pub node: Option<String>,
    pub wait_time: Option<String>,
    pub leadership_poll: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionSection {
    pub ttl: Option<String>,
    pub refresh_interval: Option<String>,
    pub lock_delay: Option<String>,
}

impl ExtsvcConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Connection settings for the Consul agent.
    pub fn consul_config(&self) -> Result<ConsulConfig> {
        let defaults = ConsulConfig::default();
        Ok(ConsulConfig {
            address: self.backend.address.clone().unwrap_or(defaults.address),
            token: self.backend.token.clone(),
            datacenter: self.backend.datacenter.clone(),
            request_timeout: duration_field(
                "backend.request_timeout",
                &self.backend.request_timeout,
                defaults.request_timeout,
            )?,
        })
    }

    /// Session settings. Setting only `ttl` derives the refresh period.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.session.ttl {
            Some(_) => SessionConfig::with_ttl(duration_field(
                "session.ttl",
                &self.session.ttl,
                SessionConfig::DEFAULT_TTL,
            )?),
            None => SessionConfig::default(),
        };
        config.refresh_interval = duration_field(
            "session.refresh_interval",
            &self.session.refresh_interval,
            config.refresh_interval,
        )?;
        config.lock_delay =
            duration_field("session.lock_delay", &self.session.lock_delay, config.lock_delay)?;
        config.validate()?;
        Ok(config)
    }

    pub fn watcher_config(&self) -> Result<WatcherConfig> {
        let defaults = WatcherConfig::default();
        Ok(WatcherConfig {
            wait_time: duration_field("watcher.wait_time", &self.watcher.wait_time, defaults.wait_time)?,
            leadership_poll: duration_field(
                "watcher.leadership_poll",
                &self.watcher.leadership_poll,
                defaults.leadership_poll,
            )?,
            session: self.session_config()?,
        })
    }
}

fn duration_field(name: &str, value: &Option<String>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw)
            .ok_or_else(|| Error::InvalidConfig(format!("{name}: invalid duration {raw:?}"))),
    }
}

/// Lease settings for a [`Session`](crate::Session).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// TTL of the session's check.
    pub ttl: Duration,
    /// How often the check is passed. Must be shorter than `ttl`.
    pub refresh_interval: Duration,
    /// How long a key released by an invalidated session stays locked.
    pub lock_delay: Duration,
}

impl SessionConfig {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

    /// Session with the given TTL, refreshed three times per TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            refresh_interval: ttl / 3,
            lock_delay: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "session refresh interval must be positive".to_string(),
            ));
        }
        if self.refresh_interval >= self.ttl {
            return Err(Error::InvalidConfig(format!(
                "session refresh interval {:?} must be shorter than ttl {:?}",
                self.refresh_interval, self.ttl
            )));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Self::DEFAULT_TTL,
            refresh_interval: Duration::from_secs(1),
            lock_delay: Duration::ZERO,
        }
    }
}

/// Settings for an [`ExternalServiceWatcher`](crate::ExternalServiceWatcher)
/// and the driver around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Upper bound of each blocking query in the reconciliation loops.
    pub wait_time: Duration,
    /// How often the driver re-checks leadership.
    pub leadership_poll: Duration,
    pub session: SessionConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(3),
            leadership_poll: Duration::from_secs(10),
            session: SessionConfig::default(),
        }
    }
}

/// Parse a duration string like "5s", "500ms", "2m", "1h" or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_defaults_without_file() {
        let config = ExtsvcConfig::default();
        let watcher = config.watcher_config().unwrap();
        assert_eq!(watcher, WatcherConfig::default());
        assert_eq!(watcher.wait_time, Duration::from_secs(3));
        assert_eq!(watcher.session.ttl, Duration::from_secs(10));
        assert_eq!(watcher.session.refresh_interval, Duration::from_secs(1));
        assert_eq!(config.consul_config().unwrap(), ConsulConfig::default());
    }

    #[test]
    fn test_parse_full_file() {
        let toml_str = r#"
[backend]
address = "consul.internal:8500"
token = "secret"
datacenter = "dc2"
request_timeout = "5s"

[watcher]
node = "edge-1"
wait_time = "500ms"
leadership_poll = "2s"

[session]
ttl = "15s"
refresh_interval = "5s"
lock_delay = "1s"
"#;
        let config = ExtsvcConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.watcher.node.as_deref(), Some("edge-1"));

        let consul = config.consul_config().unwrap();
        assert_eq!(consul.address, "consul.internal:8500");
        assert_eq!(consul.token.as_deref(), Some("secret"));
        assert_eq!(consul.request_timeout, Duration::from_secs(5));

        let watcher = config.watcher_config().unwrap();
        assert_eq!(watcher.wait_time, Duration::from_millis(500));
        assert_eq!(watcher.leadership_poll, Duration::from_secs(2));
        assert_eq!(watcher.session.ttl, Duration::from_secs(15));
        assert_eq!(watcher.session.refresh_interval, Duration::from_secs(5));
        assert_eq!(watcher.session.lock_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_ttl_alone_derives_refresh() {
        let config = ExtsvcConfig::from_toml_str("[session]\nttl = \"30s\"\n").unwrap();
        let session = config.session_config().unwrap();
        assert_eq!(session.refresh_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_refresh_must_be_shorter_than_ttl() {
        let config =
            ExtsvcConfig::from_toml_str("[session]\nttl = \"5s\"\nrefresh_interval = \"5s\"\n")
                .unwrap();
        assert!(matches!(config.session_config(), Err(Error::InvalidConfig(_))));

        let zero = SessionConfig {
            refresh_interval: Duration::ZERO,
            ..SessionConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_bad_duration_is_reported() {
        let config = ExtsvcConfig::from_toml_str("[watcher]\nwait_time = \"fast\"\n").unwrap();
        let err = config.watcher_config().unwrap_err();
        assert!(err.to_string().contains("watcher.wait_time"));
    }

    #[test]
    fn test_unknown_section_value_type_is_rejected() {
        assert!(ExtsvcConfig::from_toml_str("[watcher]\nwait_time = 3\n").is_err());
    }
}
