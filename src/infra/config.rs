//! Configuration loading from TOML files
//!
//! A configuration fault is fatal at startup: the controller must not start
//! monitoring doors with a partial or malformed configuration, so `from_file`
//! returns an error instead of falling back to defaults.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Alert channel kinds, in the wire names used by the `[alerts] channels` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Smtp,
    Pushbullet,
    Pushover,
    Telegram,
    Ifttt,
}

impl std::str::FromStr for ChannelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "smtp" => ChannelKind::Smtp,
            "pushbullet" => ChannelKind::Pushbullet,
            "pushover" => ChannelKind::Pushover,
            "telegram" => ChannelKind::Telegram,
            "ifttt" => ChannelKind::Ifttt,
            other => bail!("unknown alert channel {:?}", other),
        })
    }
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Smtp => "smtp",
            ChannelKind::Pushbullet => "pushbullet",
            ChannelKind::Pushover => "pushover",
            ChannelKind::Telegram => "telegram",
            ChannelKind::Ifttt => "ifttt",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteToml {
    #[serde(default = "default_site_id")]
    pub id: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SiteToml {
    fn default() -> Self {
        Self {
            id: default_site_id(),
            http_port: default_http_port(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_site_id() -> String {
    "garage".to_string()
}

fn default_http_port() -> u16 {
    8444
}

fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct DoorToml {
    pub name: String,
    pub relay_pin: u8,
    pub state_pin: u8,
    /// Sensor level that means "closed" (pull-up wiring reads low when closed)
    #[serde(default)]
    pub closed_value: bool,
    #[serde(default = "default_travel_secs")]
    pub time_to_open_secs: u64,
    #[serde(default = "default_travel_secs")]
    pub time_to_close_secs: u64,
    #[serde(default)]
    pub openhab_item: Option<String>,
    #[serde(default)]
    pub ifttt_open_event: Option<String>,
    #[serde(default)]
    pub ifttt_close_event: Option<String>,
}

fn default_travel_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    pub username: String,
    pub password: String,
    pub to_email: String,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushbulletSettings {
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushoverSettings {
    pub api_key: String,
    pub user_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramSettings {
    pub api_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IftttSettings {
    pub key: String,
    pub open_event: String,
    pub close_event: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsToml {
    #[serde(default)]
    pub enabled: bool,
    /// How long a door may stay open before the "opened" alert fires.
    /// Zero alerts on the very first tick the door is observed open.
    #[serde(default = "default_time_to_wait_secs")]
    pub time_to_wait_secs: u64,
    /// Channel names in dispatch order
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub smtp: Option<SmtpSettings>,
    #[serde(default)]
    pub pushbullet: Option<PushbulletSettings>,
    #[serde(default)]
    pub pushover: Option<PushoverSettings>,
    #[serde(default)]
    pub telegram: Option<TelegramSettings>,
    #[serde(default)]
    pub ifttt: Option<IftttSettings>,
}

impl Default for AlertsToml {
    fn default() -> Self {
        Self {
            enabled: false,
            time_to_wait_secs: default_time_to_wait_secs(),
            channels: Vec::new(),
            smtp: None,
            pushbullet: None,
            pushover: None,
            telegram: None,
            ifttt: None,
        }
    }
}

fn default_time_to_wait_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SyncToml {
    #[serde(default)]
    pub openhab_enabled: bool,
    #[serde(default)]
    pub openhab_url: Option<String>,
    #[serde(default)]
    pub ifttt_enabled: bool,
    #[serde(default)]
    pub ifttt_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiToml {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteToml,
    /// Door table keyed by id. BTreeMap gives a stable sorted-by-id registry
    /// order, matching how the doors are walked every tick.
    pub doors: BTreeMap<String, DoorToml>,
    #[serde(default)]
    pub alerts: AlertsToml,
    #[serde(default)]
    pub sync: SyncToml,
    #[serde(default)]
    pub api: ApiToml,
}

/// Per-door configuration after flattening (durations in milliseconds)
#[derive(Debug, Clone)]
pub struct DoorConfig {
    pub id: String,
    pub name: String,
    pub relay_pin: u8,
    pub state_pin: u8,
    pub closed_value: bool,
    pub time_to_open_ms: u64,
    pub time_to_close_ms: u64,
    pub openhab_item: Option<String>,
    pub ifttt_open_event: Option<String>,
    pub ifttt_close_event: Option<String>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    http_port: u16,
    poll_interval_ms: u64,
    doors: Vec<DoorConfig>,
    alerts_enabled: bool,
    time_to_wait_ms: u64,
    channels: Vec<ChannelKind>,
    smtp: Option<SmtpSettings>,
    pushbullet: Option<PushbulletSettings>,
    pushover: Option<PushoverSettings>,
    telegram: Option<TelegramSettings>,
    ifttt: Option<IftttSettings>,
    openhab_enabled: bool,
    openhab_url: Option<String>,
    ifttt_sync_enabled: bool,
    ifttt_sync_key: Option<String>,
    api_enabled: bool,
    api_key: Option<String>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let doors = vec![
            DoorConfig {
                id: "left".to_string(),
                name: "Left".to_string(),
                relay_pin: 23,
                state_pin: 17,
                closed_value: false,
                time_to_open_ms: 10_000,
                time_to_close_ms: 10_000,
                openhab_item: None,
                ifttt_open_event: None,
                ifttt_close_event: None,
            },
            DoorConfig {
                id: "right".to_string(),
                name: "Right".to_string(),
                relay_pin: 24,
                state_pin: 27,
                closed_value: false,
                time_to_open_ms: 10_000,
                time_to_close_ms: 10_000,
                openhab_item: None,
                ifttt_open_event: None,
                ifttt_close_event: None,
            },
        ];
        Self {
            site_id: default_site_id(),
            http_port: default_http_port(),
            poll_interval_ms: default_poll_interval_ms(),
            doors,
            alerts_enabled: false,
            time_to_wait_ms: default_time_to_wait_secs() * 1000,
            channels: Vec::new(),
            smtp: None,
            pushbullet: None,
            pushover: None,
            telegram: None,
            ifttt: None,
            openhab_enabled: false,
            openhab_url: None,
            ifttt_sync_enabled: false,
            ifttt_sync_key: None,
            api_enabled: false,
            api_key: None,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Any missing required field, malformed value, or inconsistent section is
    /// an error; there is no fallback configuration.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::from_toml(toml_config, path.display().to_string())
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> anyhow::Result<Self> {
        if toml_config.doors.is_empty() {
            bail!("no doors configured");
        }

        let mut channels = Vec::with_capacity(toml_config.alerts.channels.len());
        for name in &toml_config.alerts.channels {
            let kind: ChannelKind = name.parse()?;
            let configured = match kind {
                ChannelKind::Smtp => toml_config.alerts.smtp.is_some(),
                ChannelKind::Pushbullet => toml_config.alerts.pushbullet.is_some(),
                ChannelKind::Pushover => toml_config.alerts.pushover.is_some(),
                ChannelKind::Telegram => toml_config.alerts.telegram.is_some(),
                ChannelKind::Ifttt => toml_config.alerts.ifttt.is_some(),
            };
            if !configured {
                bail!("alert channel {:?} listed but [alerts.{}] is missing", name, kind.as_str());
            }
            channels.push(kind);
        }

        if toml_config.api.enabled
            && toml_config.api.key.as_deref().map_or(true, |k| k.is_empty())
        {
            bail!("[api] enabled without a key");
        }
        if toml_config.sync.openhab_enabled && toml_config.sync.openhab_url.is_none() {
            bail!("[sync] openhab_enabled without openhab_url");
        }
        if toml_config.sync.ifttt_enabled && toml_config.sync.ifttt_key.is_none() {
            bail!("[sync] ifttt_enabled without ifttt_key");
        }

        let doors = toml_config
            .doors
            .into_iter()
            .map(|(id, d)| DoorConfig {
                id,
                name: d.name,
                relay_pin: d.relay_pin,
                state_pin: d.state_pin,
                closed_value: d.closed_value,
                time_to_open_ms: d.time_to_open_secs * 1000,
                time_to_close_ms: d.time_to_close_secs * 1000,
                openhab_item: d.openhab_item,
                ifttt_open_event: d.ifttt_open_event,
                ifttt_close_event: d.ifttt_close_event,
            })
            .collect();

        Ok(Self {
            site_id: toml_config.site.id,
            http_port: toml_config.site.http_port,
            poll_interval_ms: toml_config.site.poll_interval_ms,
            doors,
            alerts_enabled: toml_config.alerts.enabled,
            time_to_wait_ms: toml_config.alerts.time_to_wait_secs * 1000,
            channels,
            smtp: toml_config.alerts.smtp,
            pushbullet: toml_config.alerts.pushbullet,
            pushover: toml_config.alerts.pushover,
            telegram: toml_config.alerts.telegram,
            ifttt: toml_config.alerts.ifttt,
            openhab_enabled: toml_config.sync.openhab_enabled,
            openhab_url: toml_config.sync.openhab_url,
            ifttt_sync_enabled: toml_config.sync.ifttt_enabled,
            ifttt_sync_key: toml_config.sync.ifttt_key,
            api_enabled: toml_config.api.enabled,
            api_key: toml_config.api.key,
            config_file,
        })
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
    }

    pub fn doors(&self) -> &[DoorConfig] {
        &self.doors
    }

    pub fn alerts_enabled(&self) -> bool {
        self.alerts_enabled
    }

    pub fn time_to_wait_ms(&self) -> u64 {
        self.time_to_wait_ms
    }

    pub fn channels(&self) -> &[ChannelKind] {
        &self.channels
    }

    pub fn smtp(&self) -> Option<&SmtpSettings> {
        self.smtp.as_ref()
    }

    pub fn pushbullet(&self) -> Option<&PushbulletSettings> {
        self.pushbullet.as_ref()
    }

    pub fn pushover(&self) -> Option<&PushoverSettings> {
        self.pushover.as_ref()
    }

    pub fn telegram(&self) -> Option<&TelegramSettings> {
        self.telegram.as_ref()
    }

    pub fn ifttt(&self) -> Option<&IftttSettings> {
        self.ifttt.as_ref()
    }

    pub fn openhab_enabled(&self) -> bool {
        self.openhab_enabled
    }

    pub fn openhab_url(&self) -> Option<&str> {
        self.openhab_url.as_deref()
    }

    pub fn ifttt_sync_enabled(&self) -> bool {
        self.ifttt_sync_enabled
    }

    pub fn ifttt_sync_key(&self) -> Option<&str> {
        self.ifttt_sync_key.as_deref()
    }

    pub fn api_enabled(&self) -> bool {
        self.api_enabled
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the alert threshold
    #[cfg(test)]
    pub fn with_time_to_wait_ms(mut self, ms: u64) -> Self {
        self.time_to_wait_ms = ms;
        self
    }

    /// Builder method for tests to enable alert evaluation
    #[cfg(test)]
    pub fn with_alerts_enabled(mut self, enabled: bool) -> Self {
        self.alerts_enabled = enabled;
        self
    }

    /// Builder method for tests to enable the keyed API
    #[cfg(test)]
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_enabled = true;
        self.api_key = Some(key.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "garage");
        assert_eq!(config.http_port(), 8444);
        assert_eq!(config.poll_interval_ms(), 500);
        assert_eq!(config.doors().len(), 2);
        assert_eq!(config.doors()[0].id, "left");
        assert_eq!(config.doors()[0].time_to_open_ms, 10_000);
        assert!(!config.alerts_enabled());
        assert!(!config.api_enabled());
    }

    fn parse(content: &str) -> anyhow::Result<Config> {
        let toml_config: TomlConfig = toml::from_str(content)?;
        Config::from_toml(toml_config, "test".to_string())
    }

    #[test]
    fn test_doors_sorted_by_id() {
        let config = parse(
            r#"
            [doors.zulu]
            name = "Z"
            relay_pin = 5
            state_pin = 6

            [doors.alpha]
            name = "A"
            relay_pin = 7
            state_pin = 8
            "#,
        )
        .unwrap();

        let ids: Vec<&str> = config.doors().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zulu"]);
    }

    #[test]
    fn test_no_doors_is_fatal() {
        let err = parse("[site]\nid = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("doors"));
    }

    #[test]
    fn test_channel_without_settings_is_fatal() {
        let err = parse(
            r#"
            [doors.main]
            name = "Main"
            relay_pin = 23
            state_pin = 17

            [alerts]
            enabled = true
            channels = ["pushover"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("pushover"));
    }

    #[test]
    fn test_unknown_channel_is_fatal() {
        let err = parse(
            r#"
            [doors.main]
            name = "Main"
            relay_pin = 23
            state_pin = 17

            [alerts]
            channels = ["pager"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("pager"));
    }

    #[test]
    fn test_api_without_key_is_fatal() {
        let err = parse(
            r#"
            [doors.main]
            name = "Main"
            relay_pin = 23
            state_pin = 17

            [api]
            enabled = true
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("key"));
    }

    #[test]
    fn test_channel_kind_parse() {
        assert_eq!("smtp".parse::<ChannelKind>().unwrap(), ChannelKind::Smtp);
        assert_eq!("ifttt".parse::<ChannelKind>().unwrap(), ChannelKind::Ifttt);
        assert!("".parse::<ChannelKind>().is_err());
    }
}
