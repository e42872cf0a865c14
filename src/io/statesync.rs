//! Settled-state push to external home-automation collaborators
//!
//! Only settled states (open, closed) are pushed; the transitional predictions
//! stay internal. Pushes run on detached tasks so a slow collaborator can
//! never hold up the controller tick, and failures are logged and dropped.

use crate::domain::types::DoorState;
use crate::infra::config::Config;
use anyhow::Context;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One settled transition to publish
#[derive(Debug, Clone)]
pub struct SyncUpdate {
    pub door_id: String,
    pub state: DoorState,
    /// openHAB item to PUT the state into, when the door has one
    pub openhab_item: Option<String>,
    /// IFTTT trigger event for this transition, when the door has one
    pub ifttt_event: Option<String>,
}

pub struct StateSync {
    client: reqwest::Client,
    openhab_url: Option<String>,
    ifttt_key: Option<String>,
}

impl StateSync {
    /// Config validation has already required a URL/key for each enabled flag.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("sync http client")?;

        let openhab_url = if config.openhab_enabled() {
            config.openhab_url().map(str::to_string)
        } else {
            None
        };
        let ifttt_key = if config.ifttt_sync_enabled() {
            config.ifttt_sync_key().map(str::to_string)
        } else {
            None
        };

        Ok(Self { client, openhab_url, ifttt_key })
    }

    pub fn is_active(&self) -> bool {
        self.openhab_url.is_some() || self.ifttt_key.is_some()
    }

    /// Publish on a detached task; returns immediately.
    pub fn publish(self: &Arc<Self>, update: SyncUpdate) {
        if !self.is_active() {
            return;
        }
        let sync = self.clone();
        tokio::spawn(async move { sync.push(update).await });
    }

    async fn push(&self, update: SyncUpdate) {
        if let (Some(base), Some(item)) = (&self.openhab_url, &update.openhab_item) {
            let url = openhab_item_url(base, item);
            let result = self
                .client
                .put(url)
                .header(CONTENT_TYPE, "text/plain")
                // openHAB item states are conventionally uppercase (OPEN/CLOSED)
                .body(update.state.as_str().to_uppercase())
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match result {
                Ok(_) => debug!(door = %update.door_id, state = %update.state, "openhab_synced"),
                Err(e) => warn!(door = %update.door_id, error = %e, "openhab_sync_failed"),
            }
        }

        if let (Some(key), Some(event)) = (&self.ifttt_key, &update.ifttt_event) {
            let url = ifttt_trigger_url(event, key);
            let result = self
                .client
                .post(url)
                .form(&[("value1", update.door_id.as_str()), ("value2", update.state.as_str())])
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match result {
                Ok(_) => debug!(door = %update.door_id, event = %event, "ifttt_synced"),
                Err(e) => warn!(door = %update.door_id, error = %e, "ifttt_sync_failed"),
            }
        }
    }
}

fn openhab_item_url(base: &str, item: &str) -> String {
    format!("{}/rest/items/{}/state", base.trim_end_matches('/'), item)
}

fn ifttt_trigger_url(event: &str, key: &str) -> String {
    format!("https://maker.ifttt.com/trigger/{}/with/key/{}", event, key)
}
