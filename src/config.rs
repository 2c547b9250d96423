/// config.rs – Load settings from config.yaml + environment variables.
///
/// Environment variables always override YAML values. Settings are read once
/// at startup.
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::metrics::DEFAULT_FRESH_WINDOW_SECONDS;
use crate::registry::DEFAULT_HISTORY_LEN;

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    /// Log file used while the dashboard owns the terminal.
    pub log_file: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_file: "account-monitor.log".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout_seconds: f64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            request_timeout_seconds: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Push endpoint (`ws://`, `wss://` or an SSE `http(s)://` URL). Unset
    /// means the connector starts in polling mode.
    pub stream_url: Option<String>,
    /// How long the push stream gets to deliver its first update.
    pub push_grace_seconds: f64,
    pub poll_interval_seconds: f64,
    /// An account is "Live" while its last update is younger than this.
    pub fresh_window_seconds: f64,
    /// Equity samples kept per account for the trend sparkline.
    pub history_len: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            stream_url: None,
            push_grace_seconds: 3.0,
            poll_interval_seconds: 2.0,
            fresh_window_seconds: DEFAULT_FRESH_WINDOW_SECONDS as f64,
            history_len: DEFAULT_HISTORY_LEN,
        }
    }
}

impl LiveConfig {
    /// Configured push URL; blank and the literal `"undefined"` count as unset.
    pub fn stream_url(&self) -> Option<&str> {
        self.stream_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty() && *u != "undefined")
    }

    pub fn push_grace(&self) -> Duration {
        Duration::from_secs_f64(self.push_grace_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds)
    }

    pub fn fresh_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.fresh_window_seconds * 1000.0).round() as i64)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GroupsConfig {
    /// SQLite file holding account → group assignments.
    pub db_path: String,
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            db_path: "account-groups.db".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Dashboard refresh rate in seconds.
    pub refresh_rate: f64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { refresh_rate: 1.0 }
    }
}

// ---------------------------------------------------------------------------
// Top-level settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub app: AppConfig,
    pub api: ApiConfig,
    pub live: LiveConfig,
    pub groups: GroupsConfig,
    pub dashboard: DashboardConfig,
}

impl Settings {
    /// Load settings from *config_path* YAML file, then overlay env vars.
    pub fn load(config_path: &str) -> Result<Self> {
        // Try to load .env file (ignore error if absent)
        let _ = dotenvy::dotenv();

        let mut settings = if std::path::Path::new(config_path).exists() {
            let yaml = std::fs::read_to_string(config_path).context("reading config file")?;
            serde_yaml::from_str::<Settings>(&yaml).context("parsing config YAML")?
        } else {
            Settings::default()
        };

        settings.apply_env(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Overlay environment values. `lookup` is injected so tests do not
    /// touch the process environment.
    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("API_URL") {
            self.api.base_url = url;
        }
        if let Some(url) = lookup("LIVE_URL") {
            self.live.stream_url = Some(url);
        }
        if let Some(raw) = lookup("FRESH_WINDOW_SECONDS") {
            self.live.fresh_window_seconds = raw
                .trim()
                .parse()
                .with_context(|| format!("FRESH_WINDOW_SECONDS is not a number: {raw}"))?;
        }
        if let Some(path) = lookup("GROUPS_DB") {
            self.groups.db_path = path;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let base = self.api.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            bail!("api.base_url must be an http(s) URL, got '{base}'");
        }
        validate_seconds("api.request_timeout_seconds", self.api.request_timeout_seconds)?;
        validate_seconds("live.push_grace_seconds", self.live.push_grace_seconds)?;
        validate_seconds("live.poll_interval_seconds", self.live.poll_interval_seconds)?;
        validate_seconds("live.fresh_window_seconds", self.live.fresh_window_seconds)?;
        validate_seconds("dashboard.refresh_rate", self.dashboard.refresh_rate)?;

        if self.live.history_len == 0 {
            bail!("live.history_len must be > 0");
        }
        if self.groups.db_path.trim().is_empty() {
            bail!("groups.db_path must not be empty");
        }
        Ok(())
    }
}

/// Upper bound for every duration setting. Keeps `Duration` conversions
/// and deadline arithmetic (`Instant + grace`) from overflowing.
const MAX_SECONDS: f64 = 86_400.0;

fn validate_seconds(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 || value > MAX_SECONDS {
        bail!("{name} must be > 0 and at most {MAX_SECONDS} seconds, got {value}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.live.stream_url(), None);
        assert_eq!(settings.live.fresh_window(), chrono::Duration::seconds(90));
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let mut settings = Settings::default();
        settings.live.poll_interval_seconds = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_durations() {
        let mut settings = Settings::default();
        settings.live.push_grace_seconds = 1e20;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.live.fresh_window_seconds = MAX_SECONDS + 1.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.dashboard.refresh_rate = f64::INFINITY;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.live.push_grace_seconds = MAX_SECONDS;
        assert!(settings.validate().is_ok());
        assert_eq!(settings.live.push_grace(), Duration::from_secs(86_400));
    }

    #[test]
    fn validate_rejects_non_http_base_url() {
        let mut settings = Settings::default();
        settings.api.base_url = "127.0.0.1:8000".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_history() {
        let mut settings = Settings::default();
        settings.live.history_len = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn env_overrides_yaml_values() {
        let yaml = "api:\n  base_url: http://yaml.test\nlive:\n  fresh_window_seconds: 30\n";
        let mut settings: Settings = serde_yaml::from_str(yaml).unwrap();
        settings
            .apply_env(env(&[
                ("API_URL", "http://env.test"),
                ("LIVE_URL", "wss://env.test/live"),
                ("FRESH_WINDOW_SECONDS", "6"),
            ]))
            .unwrap();
        assert_eq!(settings.api.base_url, "http://env.test");
        assert_eq!(settings.live.stream_url(), Some("wss://env.test/live"));
        assert_eq!(settings.live.fresh_window_seconds, 6.0);
    }

    #[test]
    fn env_rejects_bad_fresh_window() {
        let mut settings = Settings::default();
        assert!(settings
            .apply_env(env(&[("FRESH_WINDOW_SECONDS", "soon")]))
            .is_err());
    }

    #[test]
    fn blank_or_undefined_stream_url_is_unset() {
        let mut live = LiveConfig::default();
        live.stream_url = Some("  ".into());
        assert_eq!(live.stream_url(), None);
        live.stream_url = Some("undefined".into());
        assert_eq!(live.stream_url(), None);
    }
}
