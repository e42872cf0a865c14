//! Alert fan-out across configured notification channels
//!
//! A dispatch walks the configured channel list in order; every channel gets
//! exactly one delivery attempt and a failing channel is logged and skipped,
//! never blocking its siblings or the next tick. The pushbullet channel has
//! replace semantics: the previous note for a door is deleted before the new
//! one is created, so at most one note per door is ever outstanding.

use crate::infra::config::{
    ChannelKind, Config, IftttSettings, PushbulletSettings, PushoverSettings, SmtpSettings,
    TelegramSettings,
};
use crate::infra::metrics::Metrics;
use crate::services::door::Door;
use anyhow::Context;
use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const PUSHBULLET_PUSHES: &str = "https://api.pushbullet.com/v2/pushes";
const PUSHOVER_MESSAGES: &str = "https://api.pushover.net/1/messages.json";

/// Which side of the open/closed episode an alert reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Opened,
    Closed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Opened => "open",
            AlertStatus::Closed => "closed",
        }
    }
}

/// One alert to fan out, with the rendered texts every channel shares
#[derive(Debug, Clone)]
pub struct Alert {
    pub door_id: String,
    pub door_name: String,
    pub status: AlertStatus,
    pub title: String,
    pub message: String,
}

impl Alert {
    /// Alert for a door that exceeded the open threshold
    pub fn opened(door: &Door, now: u64, time_to_wait_ms: u64) -> Self {
        let title = format!("{}'s garage door open", door.name);
        let message = if time_to_wait_ms == 0 {
            format!("{}'s garage door just opened", door.name)
        } else {
            let elapsed = humanize_secs(now.saturating_sub(door.open_time) / 1000);
            format!("{}'s garage door has been open for {}", door.name, elapsed)
        };
        Self {
            door_id: door.id.clone(),
            door_name: door.name.clone(),
            status: AlertStatus::Opened,
            title,
            message,
        }
    }

    /// Alert for a door that closed after an alerted open episode
    pub fn closed(door: &Door, now: u64) -> Self {
        let elapsed = humanize_secs(now.saturating_sub(door.open_time) / 1000);
        Self {
            door_id: door.id.clone(),
            door_name: door.name.clone(),
            status: AlertStatus::Closed,
            title: format!("{}'s garage door closed", door.name),
            message: format!("{}'s garage door is now closed after {}", door.name, elapsed),
        }
    }
}

/// Turn a duration in seconds into a short human form ("1h 4m 2s").
/// Returns an empty string for zero.
pub fn humanize_secs(seconds: u64) -> String {
    const PARTS: [(&str, u64); 6] = [
        ("y", 60 * 60 * 24 * 7 * 52),
        ("w", 60 * 60 * 24 * 7),
        ("d", 60 * 60 * 24),
        ("h", 60 * 60),
        ("m", 60),
        ("s", 1),
    ];

    let mut remaining = seconds;
    let mut pieces = Vec::new();
    for (suffix, length) in PARTS {
        let value = remaining / length;
        if value > 0 {
            remaining %= length;
            pieces.push(format!("{}{}", value, suffix));
        }
        if remaining < 1 {
            break;
        }
    }
    pieces.join(" ")
}

/// One notification channel: a single delivery attempt per dispatch.
///
/// `note` is the door's outstanding replace-token slot. Channels without
/// replace semantics leave it untouched; the replace channel takes the prior
/// id out (so a failed create never leaves a stale id behind), deletes that
/// note, and stores the id returned by the create call.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, alert: &Alert, note: &mut Option<String>) -> anyhow::Result<()>;
}

/// Email over direct SMTP submission
pub struct SmtpChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    to: String,
    subject: Option<String>,
}

impl SmtpChannel {
    pub fn new(settings: &SmtpSettings) -> anyhow::Result<Self> {
        let builder = if settings.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .with_context(|| format!("smtp relay {}", settings.host))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };
        let transport = builder
            .port(settings.port)
            .credentials(Credentials::new(settings.username.clone(), settings.password.clone()))
            .build();
        Ok(Self {
            transport,
            from: settings.username.clone(),
            to: settings.to_email.clone(),
            subject: settings.subject.clone(),
        })
    }
}

#[async_trait]
impl AlertChannel for SmtpChannel {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, alert: &Alert, _note: &mut Option<String>) -> anyhow::Result<()> {
        let subject = self.subject.as_deref().unwrap_or(&alert.title);
        let email = Message::builder()
            .from(self.from.parse().context("smtp from address")?)
            .to(self.to.parse().context("smtp to address")?)
            .subject(subject)
            .body(alert.message.clone())
            .context("smtp message build")?;
        self.transport.send(email).await.context("smtp submit")?;
        Ok(())
    }
}

/// Replace-style push note (pushbullet)
pub struct PushbulletChannel {
    client: reqwest::Client,
    access_token: String,
}

impl PushbulletChannel {
    pub fn new(client: reqwest::Client, settings: &PushbulletSettings) -> Self {
        Self { client, access_token: settings.access_token.clone() }
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

#[async_trait]
impl AlertChannel for PushbulletChannel {
    fn name(&self) -> &'static str {
        "pushbullet"
    }

    async fn send(&self, alert: &Alert, note: &mut Option<String>) -> anyhow::Result<()> {
        if let Some(prior) = note.take() {
            self.client
                .delete(format!("{}/{}", PUSHBULLET_PUSHES, prior))
                .header("Authorization", self.auth())
                .send()
                .await
                .context("pushbullet delete")?
                .error_for_status()
                .context("pushbullet delete status")?;
        }

        let response = self
            .client
            .post(PUSHBULLET_PUSHES)
            .header("Authorization", self.auth())
            .json(&json!({
                "type": "note",
                "title": alert.title,
                "body": alert.message,
            }))
            .send()
            .await
            .context("pushbullet create")?
            .error_for_status()
            .context("pushbullet create status")?;

        let body: serde_json::Value = response.json().await.context("pushbullet response")?;
        let iden = body
            .get("iden")
            .and_then(|v| v.as_str())
            .context("pushbullet response missing iden")?;
        *note = Some(iden.to_string());
        Ok(())
    }
}

/// Simple webhook-style push (pushover), one POST, fire-and-forget
pub struct PushoverChannel {
    client: reqwest::Client,
    api_key: String,
    user_key: String,
}

impl PushoverChannel {
    pub fn new(client: reqwest::Client, settings: &PushoverSettings) -> Self {
        Self { client, api_key: settings.api_key.clone(), user_key: settings.user_key.clone() }
    }
}

#[async_trait]
impl AlertChannel for PushoverChannel {
    fn name(&self) -> &'static str {
        "pushover"
    }

    async fn send(&self, alert: &Alert, _note: &mut Option<String>) -> anyhow::Result<()> {
        self.client
            .post(PUSHOVER_MESSAGES)
            .form(&[
                ("token", self.api_key.as_str()),
                ("user", self.user_key.as_str()),
                ("title", alert.title.as_str()),
                ("message", alert.message.as_str()),
            ])
            .send()
            .await
            .context("pushover send")?
            .error_for_status()
            .context("pushover status")?;
        Ok(())
    }
}

/// Chat-bot message (telegram), one POST
pub struct TelegramChannel {
    client: reqwest::Client,
    api_token: String,
    chat_id: String,
}

impl TelegramChannel {
    pub fn new(client: reqwest::Client, settings: &TelegramSettings) -> Self {
        Self { client, api_token: settings.api_token.clone(), chat_id: settings.chat_id.clone() }
    }
}

#[async_trait]
impl AlertChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, alert: &Alert, _note: &mut Option<String>) -> anyhow::Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.api_token);
        self.client
            .post(url)
            .form(&[("chat_id", self.chat_id.as_str()), ("text", alert.message.as_str())])
            .send()
            .await
            .context("telegram send")?
            .error_for_status()
            .context("telegram status")?;
        Ok(())
    }
}

/// Automation webhook (IFTTT maker) with a distinct trigger per status
pub struct IftttChannel {
    client: reqwest::Client,
    key: String,
    open_event: String,
    close_event: String,
}

impl IftttChannel {
    pub fn new(client: reqwest::Client, settings: &IftttSettings) -> Self {
        Self {
            client,
            key: settings.key.clone(),
            open_event: settings.open_event.clone(),
            close_event: settings.close_event.clone(),
        }
    }
}

#[async_trait]
impl AlertChannel for IftttChannel {
    fn name(&self) -> &'static str {
        "ifttt"
    }

    async fn send(&self, alert: &Alert, _note: &mut Option<String>) -> anyhow::Result<()> {
        let event = match alert.status {
            AlertStatus::Opened => &self.open_event,
            AlertStatus::Closed => &self.close_event,
        };
        let url = format!("https://maker.ifttt.com/trigger/{}/with/key/{}", event, self.key);
        self.client
            .post(url)
            .form(&[
                ("value1", alert.door_name.as_str()),
                ("value2", alert.status.as_str()),
                ("value3", alert.message.as_str()),
            ])
            .send()
            .await
            .context("ifttt send")?
            .error_for_status()
            .context("ifttt status")?;
        Ok(())
    }
}

/// Walks the ordered channel list for each alert and tracks the outstanding
/// replace-note id per door.
///
/// The note table lives here rather than on the doors: it is touched only by
/// dispatch calls on the controller task, so channel sends can never race on
/// the same door's note id.
pub struct AlertDispatcher {
    channels: Vec<Box<dyn AlertChannel>>,
    notes: HashMap<String, String>,
    metrics: Arc<Metrics>,
}

impl AlertDispatcher {
    /// Build channels in configured order. Config validation has already
    /// checked that every listed channel has its settings table.
    pub fn from_config(config: &Config, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("alert http client")?;

        let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();
        for kind in config.channels() {
            match kind {
                ChannelKind::Smtp => {
                    let settings = config.smtp().context("smtp settings missing")?;
                    channels.push(Box::new(SmtpChannel::new(settings)?));
                }
                ChannelKind::Pushbullet => {
                    let settings = config.pushbullet().context("pushbullet settings missing")?;
                    channels.push(Box::new(PushbulletChannel::new(client.clone(), settings)));
                }
                ChannelKind::Pushover => {
                    let settings = config.pushover().context("pushover settings missing")?;
                    channels.push(Box::new(PushoverChannel::new(client.clone(), settings)));
                }
                ChannelKind::Telegram => {
                    let settings = config.telegram().context("telegram settings missing")?;
                    channels.push(Box::new(TelegramChannel::new(client.clone(), settings)));
                }
                ChannelKind::Ifttt => {
                    let settings = config.ifttt().context("ifttt settings missing")?;
                    channels.push(Box::new(IftttChannel::new(client.clone(), settings)));
                }
            }
        }

        Ok(Self { channels, notes: HashMap::new(), metrics })
    }

    #[cfg(test)]
    pub(crate) fn with_channels(channels: Vec<Box<dyn AlertChannel>>, metrics: Arc<Metrics>) -> Self {
        Self { channels, notes: HashMap::new(), metrics }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Outstanding replace-note id for a door, if any
    pub fn pending_note(&self, door_id: &str) -> Option<&str> {
        self.notes.get(door_id).map(String::as_str)
    }

    /// Fan an alert out to every channel, independently. Each channel gets
    /// one attempt; failures are logged and do not propagate.
    pub async fn dispatch(&mut self, alert: &Alert) {
        self.metrics.record_alert();
        let mut note = self.notes.remove(&alert.door_id);

        for channel in &self.channels {
            match channel.send(alert, &mut note).await {
                Ok(()) => {
                    debug!(channel = channel.name(), door = %alert.door_id, "alert_sent");
                }
                Err(e) => {
                    self.metrics.record_alert_failure();
                    warn!(
                        channel = channel.name(),
                        door = %alert.door_id,
                        error = %e,
                        "alert_send_failed"
                    );
                }
            }
        }

        if let Some(id) = note {
            self.notes.insert(alert.door_id.clone(), id);
        }
    }
}
