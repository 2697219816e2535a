use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WhaleError};

/// Dedup window used when `alert.window_minutes` is zero or negative.
pub const DEFAULT_DEDUP_WINDOW_SECS: u64 = 3600;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub alert: AlertConfig,
    pub database: DatabaseConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub etherscan_api_key: String,
    pub etherscan_calls_per_sec: u32,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertConfig {
    pub score_threshold: u8,
    pub flow_threshold_usd: f64,
    pub window_minutes: i64,
    pub webhook_url: String,
    pub webhook_secret: String,
    pub webhook_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub cache_ttl_hours: u32,
    pub exchange_csv: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamConfig {
    pub interval_secs: u64,
    pub threshold: u8,
    pub hours: u32,
    /// Score streamed wallets against their cohort like a batch scan does.
    pub correlate_peers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            alert: AlertConfig::default(),
            database: DatabaseConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            etherscan_api_key: String::new(),
            etherscan_calls_per_sec: 5,
            http_timeout_secs: 30,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            score_threshold: 70,
            flow_threshold_usd: 1_000_000.0,
            window_minutes: 60,
            webhook_url: String::new(),
            webhook_secret: String::new(),
            webhook_timeout_secs: 15,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_dir().join("whale.db").to_string_lossy().into_owned(),
            cache_ttl_hours: 24,
            exchange_csv: None,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            threshold: 70,
            hours: 1,
            correlate_peers: false,
        }
    }
}

impl AlertConfig {
    /// Resolve the dedup window, falling back to one hour when unset.
    pub fn dedup_window(&self) -> Duration {
        if self.window_minutes <= 0 {
            Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS)
        } else {
            Duration::from_secs(self.window_minutes as u64 * 60)
        }
    }

    pub fn webhook_url(&self) -> Option<&str> {
        Some(self.webhook_url.trim()).filter(|u| !u.is_empty())
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        Some(self.webhook_secret.as_str()).filter(|s| !s.is_empty())
    }
}

fn default_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".whalecli")
}

impl Config {
    /// Resolve the config file path: explicit, then `WHALECLI_CONFIG_PATH`, then the default.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Some(env_path) = std::env::var_os("WHALECLI_CONFIG_PATH") {
            return PathBuf::from(env_path);
        }
        default_dir().join("config.toml")
    }

    /// Load config from a TOML file, apply env overrides and validate.
    /// A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| WhaleError::Config(format!("failed to read {}: {e}", path.display())))?;
            let config = Self::parse(&contents)
                .map_err(|e| WhaleError::Config(format!("invalid TOML in {}: {e}", path.display())))?;
            tracing::info!("Config loaded from {}", path.display());
            config
        } else {
            tracing::info!("Config file {} not found, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply `WHALECLI_*` overrides through the given lookup.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parsed<T: std::str::FromStr>(key: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| WhaleError::Config(format!("invalid value for {key}: {raw:?}")))
        }

        if let Some(v) = lookup("WHALECLI_ETHERSCAN_API_KEY") {
            self.api.etherscan_api_key = v;
        }
        if let Some(v) = lookup("WHALECLI_SCORE_THRESHOLD") {
            self.alert.score_threshold = parsed("WHALECLI_SCORE_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("WHALECLI_FLOW_THRESHOLD_USD") {
            self.alert.flow_threshold_usd = parsed("WHALECLI_FLOW_THRESHOLD_USD", v)?;
        }
        if let Some(v) = lookup("WHALECLI_WEBHOOK_URL") {
            self.alert.webhook_url = v;
        }
        if let Some(v) = lookup("WHALECLI_WEBHOOK_SECRET") {
            self.alert.webhook_secret = v;
        }
        if let Some(v) = lookup("WHALECLI_DB_PATH") {
            self.database.path = v;
        }
        if let Some(v) = lookup("WHALECLI_CACHE_TTL_HOURS") {
            self.database.cache_ttl_hours = parsed("WHALECLI_CACHE_TTL_HOURS", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.alert.score_threshold > 100 {
            return Err(WhaleError::Config(format!(
                "alert.score_threshold must be 0-100, got {}",
                self.alert.score_threshold
            )));
        }
        if self.stream.threshold > 100 {
            return Err(WhaleError::Config(format!(
                "stream.threshold must be 0-100, got {}",
                self.stream.threshold
            )));
        }
        if !(self.alert.flow_threshold_usd >= 0.0) {
            return Err(WhaleError::Config(format!(
                "alert.flow_threshold_usd must be non-negative, got {}",
                self.alert.flow_threshold_usd
            )));
        }
        if self.api.etherscan_calls_per_sec == 0 {
            return Err(WhaleError::Config("api.etherscan_calls_per_sec must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.alert.score_threshold, 70);
        assert_eq!(config.alert.flow_threshold_usd, 1_000_000.0);
        assert_eq!(config.stream.interval_secs, 60);
        assert!(!config.stream.correlate_peers);
        assert_eq!(config.database.cache_ttl_hours, 24);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = Config::parse(
            "[alert]\nscore_threshold = 85\nwebhook_url = \"https://hooks.example.com/w\"\n",
        )
        .unwrap();
        assert_eq!(config.alert.score_threshold, 85);
        assert_eq!(config.alert.window_minutes, 60);
        assert_eq!(config.alert.webhook_url(), Some("https://hooks.example.com/w"));
        assert_eq!(config.alert.webhook_secret(), None);
    }

    #[test]
    fn dedup_window_falls_back_to_one_hour() {
        let mut alert = AlertConfig::default();
        alert.window_minutes = 0;
        assert_eq!(alert.dedup_window(), Duration::from_secs(3600));
        alert.window_minutes = -5;
        assert_eq!(alert.dedup_window(), Duration::from_secs(3600));
        alert.window_minutes = 15;
        assert_eq!(alert.dedup_window(), Duration::from_secs(900));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("WHALECLI_SCORE_THRESHOLD", "90"),
            ("WHALECLI_WEBHOOK_SECRET", "s3cret"),
            ("WHALECLI_DB_PATH", "/tmp/w.db"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.alert.score_threshold, 90);
        assert_eq!(config.alert.webhook_secret(), Some("s3cret"));
        assert_eq!(config.database.path, "/tmp/w.db");
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(|k| (k == "WHALECLI_FLOW_THRESHOLD_USD").then(|| "lots".to_string()))
            .unwrap_err();
        assert_eq!(err.error_code(), "config_error");
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let mut config = Config::default();
        config.alert.score_threshold = 101;
        assert!(config.validate().is_err());
        config.alert.score_threshold = 100;
        config.alert.flow_threshold_usd = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join(format!("whalecli_missing_{}.toml", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.alert.webhook_timeout_secs, 15);
    }
}
