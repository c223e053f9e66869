use crate::error::{Error, Result};
use envconfig::Envconfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use validator::Validate;

pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Envconfig, Validate, Clone)]
pub struct Settings {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; throttle history stays in memory when unset
    #[envconfig(from = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Default throttle policies, by catalog name
    #[envconfig(from = "THROTTLE_CLASSES", default = "anon,user")]
    pub throttle_classes: String,

    /// `scope=rate` pairs; `none` disables a scope
    #[envconfig(from = "THROTTLE_RATES", default = "user=1000/day,anon=100/day")]
    pub throttle_rates: String,

    /// Number of reverse proxies in front of the service
    #[envconfig(from = "NUM_PROXIES")]
    #[validate(range(max = 32))]
    pub num_proxies: Option<u32>,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    #[validate(length(min = 1))]
    pub log_level: String,

    /// Largest request body a route reads, in bytes
    #[envconfig(from = "MAX_BODY_BYTES", default = "2097152")]
    #[validate(range(min = 1))]
    pub max_body_bytes: usize,

    /// In-memory throttle history cleanup interval in seconds
    #[envconfig(from = "CLEANUP_INTERVAL", default = "300")]
    #[validate(range(min = 1))]
    pub cleanup_interval_secs: u64,

    /// Connect and command timeout for Redis, in milliseconds
    #[envconfig(from = "REDIS_TIMEOUT_MS", default = "500")]
    #[validate(range(min = 1))]
    pub redis_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: None,
            throttle_classes: "anon,user".to_string(),
            throttle_rates: "user=1000/day,anon=100/day".to_string(),
            num_proxies: None,
            log_level: "info".to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            cleanup_interval_secs: 300,
            redis_timeout_ms: 500,
        }
    }
}

impl Settings {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let settings =
            Settings::init_from_env().map_err(|e| Error::Configuration(e.to_string()))?;
        settings.check()?;
        Ok(settings)
    }

    /// Field validation plus the cross-field checks the derive cannot express.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        if let Some(url) = &self.redis_url {
            validate_redis_url(url)?;
        }
        self.throttle()?;
        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    pub fn throttle(&self) -> Result<ThrottleSettings> {
        Ok(ThrottleSettings {
            throttle_classes: parse_list(&self.throttle_classes),
            throttle_rates: parse_rates(&self.throttle_rates)?,
            num_proxies: self.num_proxies,
        })
    }
}

/// Throttling section of the settings, as policies consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleSettings {
    pub throttle_classes: Vec<String>,
    pub throttle_rates: HashMap<String, Option<String>>,
    pub num_proxies: Option<u32>,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        // The literal defaults always parse.
        Settings::default()
            .throttle()
            .unwrap_or_else(|_| ThrottleSettings {
                throttle_classes: Vec::new(),
                throttle_rates: HashMap::new(),
                num_proxies: None,
            })
    }
}

impl ThrottleSettings {
    pub fn with_rate(mut self, scope: &str, rate: Option<&str>) -> Self {
        self.throttle_rates
            .insert(scope.to_string(), rate.map(str::to_string));
        self
    }

    pub fn with_classes(mut self, classes: &[&str]) -> Self {
        self.throttle_classes = classes.iter().map(|c| c.to_string()).collect();
        self
    }
}

pub fn validate_redis_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(Error::Configuration("Redis URL cannot be empty".to_string()));
    }

    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
        return Err(Error::Configuration(
            "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
        ));
    }

    Ok(())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_rates(raw: &str) -> Result<HashMap<String, Option<String>>> {
    let mut rates = HashMap::new();
    for entry in parse_list(raw) {
        let (scope, rate) = entry.split_once('=').ok_or_else(|| {
            Error::Configuration(format!(
                "throttle rate entry `{}` must look like `scope=rate`",
                entry
            ))
        })?;
        let scope = scope.trim();
        if scope.is_empty() {
            return Err(Error::Configuration(format!(
                "throttle rate entry `{}` has an empty scope",
                entry
            )));
        }
        let rate = rate.trim();
        let rate = if rate.eq_ignore_ascii_case("none") || rate.is_empty() {
            None
        } else {
            Some(rate.to_string())
        };
        rates.insert(scope.to_string(), rate);
    }
    Ok(rates)
}
