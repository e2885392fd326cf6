//! Connection settings and timing policy.
//!
//! Settings are read from a small TOML file:
//!
//! ```toml
//! host = "192.168.1.100"
//! port = 7905
//! secure = false
//! password = "hunter2"
//!
//! [timings]
//! heartbeat_interval = 3500
//! ```
//!
//! Every timing is in milliseconds and optional.

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use url::Url;
use veil::Redact;

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Eq, Hash, Deserialize, Redact)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Use `wss` instead of `ws`.
    pub secure: bool,

    #[redact]
    pub password: String,

    pub timings: Timings,
}

/// Timers of the session, in milliseconds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timings {
    /// Delay before retrying after a failed or lost connection.
    pub reconnect_interval: u64,

    /// Time between a heartbeat response and the next heartbeat, and the
    /// time a heartbeat may go unanswered before the socket is declared dead.
    pub heartbeat_interval: u64,

    /// Age after which an unanswered call is forgotten.
    pub call_timeout: u64,

    /// How often forgotten calls are swept.
    pub sweep_interval: u64,

    /// Upper bound on opening a socket.
    pub connect_timeout: u64,

    /// Grace period between the last client leaving and disconnecting.
    pub idle_disconnect_delay: u64,

    /// Delay of the reconnect that backs up the connectivity signal.
    pub failsafe_delay: u64,
}

impl Config {
    /// Configuration files are tiny; anything larger is a mistake.
    const MAX_FILE_SIZE: u64 = 4096;

    /// Loads settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is too large, or does
    /// not parse.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        contents.parse()
    }

    /// Returns the socket URL, e.g. `ws://192.168.1.100:7905`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the host does not form a valid URL.
    pub fn url(&self) -> Result<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let url = Url::parse(&format!("{scheme}://{}:{}", self.host, self.port))?;
        Ok(url)
    }

    /// Whether a host and port are configured at all.
    #[must_use]
    pub fn has_valid_connection(&self) -> bool {
        !self.host.trim().is_empty() && self.port > 0
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::from("192.168.1.100"),
            port: 7905,
            secure: false,
            password: String::new(),
            timings: Timings::default(),
        }
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config = toml::from_str::<Self>(s)?;
        trace!("config: {config:?}");
        Ok(config)
    }
}

impl Timings {
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    #[must_use]
    pub fn idle_disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.idle_disconnect_delay)
    }

    #[must_use]
    pub fn failsafe_delay(&self) -> Duration {
        Duration::from_millis(self.failsafe_delay)
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            reconnect_interval: 2_000,
            heartbeat_interval: 3_500,
            call_timeout: 30_000,
            sweep_interval: 30_000,
            connect_timeout: 5_000,
            idle_disconnect_delay: 5_000,
            failsafe_delay: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timings() {
        let timings = Timings::default();
        assert_eq!(timings.reconnect_interval(), Duration::from_secs(2));
        assert_eq!(timings.heartbeat_interval(), Duration::from_millis(3_500));
        assert_eq!(timings.call_timeout(), Duration::from_secs(30));
        assert_eq!(timings.connect_timeout(), Duration::from_secs(5));
        assert_eq!(timings.idle_disconnect_delay(), Duration::from_secs(5));
        assert_eq!(timings.failsafe_delay(), Duration::from_secs(2));
    }

    #[test]
    fn parses_partial_files() {
        let config: Config = r#"
            host = "media.local"
            secure = true
            password = "hunter2"

            [timings]
            heartbeat_interval = 1000
        "#
        .parse()
        .unwrap();

        assert_eq!(config.host, "media.local");
        assert_eq!(config.port, 7905);
        assert_eq!(config.timings.heartbeat_interval, 1000);
        assert_eq!(config.timings.reconnect_interval, 2000);
        assert_eq!(config.url().unwrap().as_str(), "wss://media.local:7905/");
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!("hostname = \"x\"".parse::<Config>().is_err());
    }

    #[test]
    fn password_is_redacted() {
        let config = Config {
            password: String::from("hunter2"),
            ..Config::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn requires_host_and_port() {
        let mut config = Config::default();
        assert!(config.has_valid_connection());
        config.port = 0;
        assert!(!config.has_valid_connection());
        config.port = 1;
        config.host = String::from(" ");
        assert!(!config.has_valid_connection());
    }
}
