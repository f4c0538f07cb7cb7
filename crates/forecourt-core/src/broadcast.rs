// Maintenance lock and operator broadcast, both derived from the global
// settings record.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::SettingsRecord;
use crate::remote::{with_timeout, ChangeEvent, Disposer, RemoteStore, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Unrecognised or missing severities are `Info`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("warning") => Severity::Warning,
            Some("critical") => Severity::Critical,
            _ => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub text: String,
    pub severity: Severity,
    /// Millisecond stamp, strictly increasing across derivations. A new
    /// revision with unchanged text still means "show it again".
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaintenanceState {
    pub active: bool,
}

/// The two signals derived from one settings payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BroadcastSignals {
    pub maintenance: MaintenanceState,
    pub message: Option<BroadcastMessage>,
}

pub struct BroadcastController {
    remote: Arc<dyn RemoteStore>,
    request_timeout: Duration,
    signals: BroadcastSignals,
    last_revision: i64,
    subscription: Option<(Disposer, JoinHandle<()>)>,
}

impl BroadcastController {
    pub fn new(remote: Arc<dyn RemoteStore>, request_timeout: Duration) -> Self {
        Self {
            remote,
            request_timeout,
            signals: BroadcastSignals::default(),
            last_revision: 0,
            subscription: None,
        }
    }

    pub fn signals(&self) -> &BroadcastSignals {
        &self.signals
    }

    /// Fetch the settings record once, then forward every pushed update into
    /// `settings_tx`. Failures are logged and leave the signals as they were.
    pub async fn start(&mut self, settings_tx: mpsc::Sender<ChangeEvent>) {
        self.stop();
        self.refresh().await;

        match with_timeout(self.request_timeout, self.remote.subscribe(Topic::Settings)).await {
            Ok(subscription) => {
                let (mut rx, disposer) = subscription.into_parts();
                let forwarder = tokio::spawn(async move {
                    while let Some(change) = rx.recv().await {
                        if settings_tx.send(change).await.is_err() {
                            break;
                        }
                    }
                });
                self.subscription = Some((disposer, forwarder));
                info!("Subscribed to settings updates");
            }
            Err(e) => warn!("Failed to subscribe to settings updates: {e}"),
        }
    }

    /// Unsubscribe from settings updates.
    pub fn stop(&mut self) {
        if let Some((disposer, forwarder)) = self.subscription.take() {
            disposer.dispose();
            forwarder.abort();
            debug!("Settings subscription stopped");
        }
    }

    /// Handle a pushed change. A record-less change (resync) re-fetches.
    pub async fn handle(&mut self, change: ChangeEvent) -> bool {
        match change.record {
            Some(record) => self.apply_payload(&record),
            None => self.refresh().await,
        }
    }

    async fn refresh(&mut self) -> bool {
        match with_timeout(self.request_timeout, self.remote.settings()).await {
            Ok(record) => self.apply_payload(&record),
            Err(e) => {
                warn!("Failed to fetch settings: {e}");
                false
            }
        }
    }

    /// Derive both signals from a raw settings row. Returns false if the
    /// payload could not be read.
    pub fn apply_payload(&mut self, payload: &Value) -> bool {
        match serde_json::from_value::<SettingsRecord>(payload.clone()) {
            Ok(record) => {
                self.signals = self.derive(&record);
                true
            }
            Err(e) => {
                warn!("Ignoring malformed settings payload: {e}");
                false
            }
        }
    }

    /// Maintenance and message are derived independently. Every non-empty
    /// message gets a fresh revision.
    pub fn derive(&mut self, record: &SettingsRecord) -> BroadcastSignals {
        let maintenance = MaintenanceState {
            active: record.downtime_active.unwrap_or(false),
        };
        let text = record.broadcast_msg.as_deref().map(str::trim).unwrap_or_default();
        let message = if text.is_empty() {
            None
        } else {
            Some(BroadcastMessage {
                text: text.to_string(),
                severity: Severity::parse(record.broadcast_type.as_deref()),
                revision: self.mint_revision(),
            })
        };
        BroadcastSignals {
            maintenance,
            message,
        }
    }

    fn mint_revision(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_revision = now.max(self.last_revision + 1);
        self.last_revision
    }
}

impl Drop for BroadcastController {
    fn drop(&mut self) {
        self.stop();
    }
}
