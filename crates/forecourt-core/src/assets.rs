// Fetches the density-correction table and the dip charts from the remote
// store.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::measure::{DensityTable, LookupDatasets, VolumeCharts};
use crate::remote::{with_timeout, AssetKey, RemoteStore};

/// Loads [`LookupDatasets`]. Each load yields a fresh value; callers merge
/// it into what they hold so a failed table keeps its last good copy.
#[derive(Clone)]
pub struct AssetLoader {
    remote: Arc<dyn RemoteStore>,
    request_timeout: Duration,
}

impl AssetLoader {
    pub fn new(remote: Arc<dyn RemoteStore>, request_timeout: Duration) -> Self {
        Self {
            remote,
            request_timeout,
        }
    }

    /// Fetch both datasets concurrently. A dataset whose fetch fails is left
    /// `None` and logged; the other is still returned.
    pub async fn load(&self) -> LookupDatasets {
        let (density, charts) = tokio::join!(
            self.fetch::<DensityTable>(AssetKey::DensityTable),
            self.fetch::<VolumeCharts>(AssetKey::TankCharts),
        );

        let datasets = LookupDatasets { density, charts };
        if datasets.is_complete() {
            info!("Lookup datasets loaded");
        } else {
            warn!(
                "Lookup datasets incomplete (density: {}, charts: {})",
                datasets.density.is_some(),
                datasets.charts.is_some()
            );
        }
        datasets
    }

    async fn fetch<T: DeserializeOwned>(&self, key: AssetKey) -> Option<T> {
        let payload = match with_timeout(self.request_timeout, self.remote.asset(key)).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to fetch asset {}: {e}", key.as_str());
                return None;
            }
        };
        match serde_json::from_value(payload) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Asset {} is malformed: {e}", key.as_str());
                None
            }
        }
    }
}
