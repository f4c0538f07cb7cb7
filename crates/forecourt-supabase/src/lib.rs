// Supabase-backed remote store: PostgREST for row queries, Realtime for
// row subscriptions.

pub mod realtime;
pub mod rest;

use std::time::Duration;

use async_trait::async_trait;
use forecourt_core::config::Config;
use forecourt_core::remote::{AssetKey, RemoteError, RemoteStore, Subscription, Topic};
use serde_json::Value;
use tracing::warn;

use crate::realtime::RealtimeOptions;
use crate::rest::{eq, RestClient};

const STATION_WITH_TANKS: &str = "*,tanks(*)";

pub struct SupabaseRemote {
    rest: RestClient,
    realtime: RealtimeOptions,
}

impl SupabaseRemote {
    pub fn new(
        url: &str,
        anon_key: &str,
        request_timeout: Duration,
        heartbeat: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            rest: RestClient::new(url, anon_key, request_timeout)?,
            realtime: RealtimeOptions {
                socket_url: realtime::socket_url(url, anon_key),
                heartbeat,
                connect_timeout: request_timeout,
            },
        })
    }

    /// A missing anon key is not fatal: every request is then rejected and
    /// the app keeps running on its cached session.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let anon_key = config.credentials.anon_key.as_deref().unwrap_or_else(|| {
            warn!("No anon_key in config/credentials.toml; remote requests will be rejected");
            ""
        });
        Self::new(
            &config.remote.url,
            anon_key,
            config.remote.request_timeout,
            config.remote.heartbeat,
        )
    }
}

#[async_trait]
impl RemoteStore for SupabaseRemote {
    async fn station_by_id(&self, station_id: &str) -> Result<Value, RemoteError> {
        self.rest
            .select_one(
                "stations",
                &[
                    ("select", STATION_WITH_TANKS.into()),
                    ("station_id", eq(station_id)),
                    ("tanks.order", "tank_no.asc".into()),
                ],
            )
            .await
    }

    async fn tanks_by_station(&self, station_id: &str) -> Result<Vec<Value>, RemoteError> {
        self.rest
            .select_many(
                "tanks",
                &[
                    ("select", "*".into()),
                    ("station_id", eq(station_id)),
                    ("order", "tank_no.asc".into()),
                ],
            )
            .await
    }

    async fn settings(&self) -> Result<Value, RemoteError> {
        self.rest
            .select_one("system_settings", &[("select", "*".into()), ("id", eq("1"))])
            .await
    }

    async fn asset(&self, key: AssetKey) -> Result<Value, RemoteError> {
        let mut row = self
            .rest
            .select_one(
                "system_assets",
                &[("select", "data".into()), ("key", eq(key.as_str()))],
            )
            .await?;
        match row.get_mut("data").map(Value::take) {
            Some(Value::Null) | None => Err(RemoteError::Decode(format!(
                "asset {} has no data",
                key.as_str()
            ))),
            Some(data) => Ok(data),
        }
    }

    async fn find_manager(&self, user: &str, secret: &str) -> Result<Option<Value>, RemoteError> {
        self.rest
            .select_first(
                "stations",
                &[
                    ("select", STATION_WITH_TANKS.into()),
                    ("manager_user", eq(user)),
                    ("manager_pass", eq(secret)),
                    ("tanks.order", "tank_no.asc".into()),
                ],
            )
            .await
    }

    async fn find_staff(&self, phone: &str, pin: &str) -> Result<Option<Value>, RemoteError> {
        let row = self
            .rest
            .select_first(
                "staff",
                &[
                    ("select", "*,stations(*)".into()),
                    ("phone", eq(phone)),
                    ("pin", eq(pin)),
                ],
            )
            .await?;
        Ok(row.and_then(|mut row| staff_station(&mut row, phone)))
    }

    async fn subscribe(&self, topic: Topic) -> Result<Subscription, RemoteError> {
        realtime::subscribe(&self.realtime, topic).await
    }
}

/// The station embedded in a staff row under `stations`.
fn staff_station(row: &mut Value, phone: &str) -> Option<Value> {
    let station = row.get_mut("stations").map(Value::take).unwrap_or(Value::Null);
    if !station.is_object() {
        warn!("Staff member {phone} has no station");
        return None;
    }
    Some(station)
}
