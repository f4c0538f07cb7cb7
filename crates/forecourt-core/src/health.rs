// Operator-visible system health check.

use std::time::Duration;

use tracing::info;

use crate::assets::AssetLoader;
use crate::measure::LookupDatasets;
use crate::model::StationSnapshot;

pub const INITIAL_HEADLINE: &str = "INITIALIZING...";
pub const PENDING_HEADLINE: &str = "SYNCING...";
pub const OK_HEADLINE: &str = "ALL SYSTEMS LIVE";
pub const ERROR_HEADLINE: &str = "ASSET LOAD ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pulse {
    #[default]
    Pending,
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub pulse: Pulse,
    pub headline: String,
    /// One line per passed condition, or the single remedy on error.
    pub checks: Vec<String>,
    /// Whether a probe has completed since startup or the last reset.
    pub checked: bool,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            pulse: Pulse::Pending,
            headline: INITIAL_HEADLINE.to_string(),
            checks: Vec::new(),
            checked: false,
        }
    }
}

impl HealthStatus {
    /// Result of evaluating the current station and datasets.
    pub fn evaluate(station: Option<&StationSnapshot>, datasets: &LookupDatasets) -> Self {
        match station {
            Some(station) if datasets.is_complete() => Self {
                pulse: Pulse::Ok,
                headline: OK_HEADLINE.to_string(),
                checks: vec![
                    "Database Connected".to_string(),
                    "Station Configured".to_string(),
                    format!("{} Tanks Configured", station.tanks.len()),
                ],
                checked: true,
            },
            _ => Self {
                pulse: Pulse::Error,
                headline: ERROR_HEADLINE.to_string(),
                checks: vec!["Check Internet Connection".to_string()],
                checked: true,
            },
        }
    }
}

/// Two-step probe so the caller can publish the pending state before the
/// settle interval elapses.
#[derive(Clone)]
pub struct SystemHealthProbe {
    loader: AssetLoader,
    settle: Duration,
}

impl SystemHealthProbe {
    pub fn new(loader: AssetLoader, settle: Duration) -> Self {
        Self { loader, settle }
    }

    /// Mark the probe as running. Returns false (and changes nothing) when
    /// the last run passed and `force` is not set.
    pub fn begin(&self, status: &mut HealthStatus, force: bool) -> bool {
        if status.pulse == Pulse::Ok && !force {
            return false;
        }
        status.pulse = Pulse::Pending;
        status.headline = PENDING_HEADLINE.to_string();
        true
    }

    /// Wait out the settle interval, load missing datasets, and leave
    /// `status` ok or error.
    pub async fn finish(
        &self,
        status: &mut HealthStatus,
        datasets: &mut LookupDatasets,
        station: Option<&StationSnapshot>,
    ) {
        tokio::time::sleep(self.settle).await;
        if !datasets.is_complete() {
            datasets.merge(self.loader.load().await);
        }
        *status = HealthStatus::evaluate(station, datasets);
        info!("Health check finished: {}", status.headline);
    }
}
