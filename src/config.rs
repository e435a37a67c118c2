use std::env;
use std::fmt;
use std::time::Duration;

use url::Url;

use crate::control::LoopConfig;

pub const DEFAULT_WEATHER_URL: &str =
    "https://dd.weather.gc.ca/citypage_weather/xml/QC/s0000635_e.xml"; // Montreal
const DEFAULT_POLL_INTERVAL_MS: u64 = 15 * 60 * 1000;
const DEFAULT_COMFORT_LEVEL: f64 = 25.0;
const DEFAULT_WEATHER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PLUG_PORT: u16 = 6668;
const LOCAL_KEY_LEN: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Connection parameters for the smart plug
#[derive(Clone)]
pub struct PlugConfig {
    pub address: String,
    pub device_id: String,
    pub local_key: [u8; LOCAL_KEY_LEN],
    pub port: u16,
    /// How long to listen for the plug's broadcast; zero skips discovery
    pub discovery_timeout: Duration,
}

// Keep the local key out of logs
impl fmt::Debug for PlugConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlugConfig")
            .field("address", &self.address)
            .field("device_id", &self.device_id)
            .field("local_key", &"<redacted>")
            .field("port", &self.port)
            .field("discovery_timeout", &self.discovery_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub plug: PlugConfig,
    pub weather_url: String,
    pub weather_timeout: Duration,
    pub poll_interval: Duration,
    pub comfort_level: f64,
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source
    ///
    /// `lookup` returns the value of a variable, or None when unset.
    /// Blank values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &'static str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let address = require("TUYAPLUGIP")?;
        let device_id = require("TUYAPLUGID")?;
        let local_key = parse_local_key(&require("TUYAPLUGKEY")?)?;

        let weather_url = match get("WEATHER_URL") {
            Some(url) => url,
            None => DEFAULT_WEATHER_URL.to_string(),
        };
        Url::parse(&weather_url).map_err(|e| ConfigError::Invalid {
            name: "WEATHER_URL",
            reason: e.to_string(),
        })?;

        let poll_interval_ms =
            parse_or_default(get("POLL_INTERVAL_MS"), "POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        if poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "POLL_INTERVAL_MS",
                reason: "must be greater than zero".into(),
            });
        }

        let comfort_level =
            parse_or_default(get("COMFORT_LEVEL"), "COMFORT_LEVEL", DEFAULT_COMFORT_LEVEL)?;
        if !comfort_level.is_finite() {
            return Err(ConfigError::Invalid {
                name: "COMFORT_LEVEL",
                reason: "must be a finite number".into(),
            });
        }

        let weather_timeout_secs = parse_or_default(
            get("WEATHER_TIMEOUT_SECS"),
            "WEATHER_TIMEOUT_SECS",
            DEFAULT_WEATHER_TIMEOUT_SECS,
        )?;
        let discovery_timeout_secs = parse_or_default(
            get("DISCOVERY_TIMEOUT_SECS"),
            "DISCOVERY_TIMEOUT_SECS",
            DEFAULT_DISCOVERY_TIMEOUT_SECS,
        )?;

        Ok(AppConfig {
            plug: PlugConfig {
                address,
                device_id,
                local_key,
                port: DEFAULT_PLUG_PORT,
                discovery_timeout: Duration::from_secs(discovery_timeout_secs),
            },
            weather_url,
            weather_timeout: Duration::from_secs(weather_timeout_secs),
            poll_interval: Duration::from_millis(poll_interval_ms),
            comfort_level,
        })
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            interval: self.poll_interval,
            comfort_level: self.comfort_level,
        }
    }
}

fn parse_local_key(raw: &str) -> Result<[u8; LOCAL_KEY_LEN], ConfigError> {
    raw.as_bytes()
        .try_into()
        .map_err(|_| ConfigError::Invalid {
            name: "TUYAPLUGKEY",
            reason: format!("expected {} bytes, got {}", LOCAL_KEY_LEN, raw.len()),
        })
}

fn parse_or_default<T>(
    value: Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match value {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: format!("'{}': {}", raw, e),
        }),
        None => Ok(default),
    }
}
