// In-memory remote store.
//
// Holds station, tank, staff, settings and asset rows in process, emits
// change events to live subscriptions when rows are edited, and lets tests
// inject failures and latency.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

use super::{
    AssetKey, ChangeEvent, ChangeOp, Disposer, RemoteError, RemoteStore, Subscription, Topic,
};

const SUBSCRIPTION_BUFFER: usize = 64;

/// In-memory [`RemoteStore`].
///
/// Clones share the same rows, so a test can keep one handle to edit data
/// while the core holds another.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRemote {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    stations: HashMap<String, Map<String, Value>>,
    tanks: Vec<Map<String, Value>>,
    staff: Vec<Map<String, Value>>,
    settings: Option<Value>,
    assets: HashMap<&'static str, Value>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    fail_queue: VecDeque<RemoteError>,
    offline: bool,
    latency: Option<Duration>,
    calls: Vec<String>,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    topic: Topic,
    tx: mpsc::Sender<ChangeEvent>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("in-memory remote mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Seeding and editing rows
    // ------------------------------------------------------------------

    /// Insert a station row. Nested `tanks` are split out into tank rows.
    pub fn insert_station(&self, row: Value) {
        let Value::Object(mut row) = row else {
            warn!("ignoring non-object station row");
            return;
        };
        let Some(station_id) = row_id(&row, "station_id") else {
            warn!("ignoring station row without station_id");
            return;
        };
        let nested = row.remove("tanks");

        let mut inner = self.lock();
        if let Some(Value::Array(tanks)) = nested {
            for tank in tanks {
                if let Value::Object(mut tank) = tank {
                    tank.insert("station_id".into(), Value::String(station_id.clone()));
                    inner.tanks.push(tank);
                }
            }
        }
        inner.stations.insert(station_id, row);
    }

    /// Apply column changes to a station row and notify its subscribers
    /// with the full updated row.
    pub fn update_station(&self, station_id: &str, changes: Value) {
        let mut inner = self.lock();
        let Some(row) = inner.stations.get_mut(station_id) else {
            warn!("update_station: unknown station {station_id}");
            return;
        };
        if let Value::Object(changes) = changes {
            row.extend(changes);
        }
        let record = Value::Object(row.clone());
        inner.emit(
            &Topic::Station(station_id.to_string()),
            ChangeEvent {
                op: ChangeOp::Update,
                record: Some(record),
            },
        );
    }

    pub fn remove_station(&self, station_id: &str) {
        let mut inner = self.lock();
        inner.stations.remove(station_id);
        inner
            .tanks
            .retain(|t| row_id(t, "station_id").as_deref() != Some(station_id));
    }

    /// Insert or replace (by `id`) a tank row of `station_id`.
    pub fn upsert_tank(&self, station_id: &str, row: Value) {
        let Value::Object(mut row) = row else {
            warn!("ignoring non-object tank row");
            return;
        };
        row.insert("station_id".into(), Value::String(station_id.to_string()));
        let id = row_id(&row, "id");

        let mut inner = self.lock();
        let existing = inner
            .tanks
            .iter()
            .position(|t| row_id(t, "id") == id && row_id(t, "station_id").as_deref() == Some(station_id));
        let op = match existing {
            Some(idx) => {
                inner.tanks[idx] = row.clone();
                ChangeOp::Update
            }
            None => {
                inner.tanks.push(row.clone());
                ChangeOp::Insert
            }
        };
        inner.emit(
            &Topic::Tanks(station_id.to_string()),
            ChangeEvent {
                op,
                record: Some(Value::Object(row)),
            },
        );
    }

    pub fn remove_tank(&self, station_id: &str, tank_id: &str) {
        let mut inner = self.lock();
        let before = inner.tanks.len();
        inner.tanks.retain(|t| {
            !(row_id(t, "id").as_deref() == Some(tank_id)
                && row_id(t, "station_id").as_deref() == Some(station_id))
        });
        if inner.tanks.len() != before {
            inner.emit(
                &Topic::Tanks(station_id.to_string()),
                ChangeEvent {
                    op: ChangeOp::Delete,
                    record: None,
                },
            );
        }
    }

    /// Replace the settings singleton and notify its subscribers.
    pub fn put_settings(&self, row: Value) {
        let mut inner = self.lock();
        inner.settings = Some(row.clone());
        inner.emit(
            &Topic::Settings,
            ChangeEvent {
                op: ChangeOp::Update,
                record: Some(row),
            },
        );
    }

    pub fn put_asset(&self, key: AssetKey, data: Value) {
        self.lock().assets.insert(key.as_str(), data);
    }

    /// Add a staff row (`station_id`, `name`, `phone`, `pin`).
    pub fn add_staff(&self, row: Value) {
        if let Value::Object(row) = row {
            self.lock().staff.push(row);
        }
    }

    /// Push a raw event to every subscriber of `topic`.
    pub fn emit(&self, topic: &Topic, event: ChangeEvent) {
        self.lock().emit(topic, event);
    }

    // ------------------------------------------------------------------
    // Failure injection and inspection
    // ------------------------------------------------------------------

    /// The next query fails with `err`. Calls queue up in order.
    pub fn fail_next(&self, err: RemoteError) {
        self.lock().fail_queue.push_back(err);
    }

    /// While offline every query and subscribe fails as unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Delay every query by `latency` before answering.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|s| &s.topic == topic)
            .count()
    }

    /// Number of calls made to the named operation (e.g. `"tanks_by_station"`).
    pub fn call_count(&self, operation: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == operation).count()
    }

    async fn begin(&self, operation: &str) -> Result<(), RemoteError> {
        let latency = {
            let mut inner = self.lock();
            inner.calls.push(operation.to_string());
            inner.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut inner = self.lock();
        if inner.offline {
            return Err(RemoteError::Unreachable("offline".into()));
        }
        match inner.fail_queue.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn station_with_tanks(inner: &Inner, station_id: &str) -> Option<Value> {
        let mut row = inner.stations.get(station_id)?.clone();
        row.insert(
            "tanks".into(),
            Value::Array(inner.tanks_of(station_id).into_iter().map(Value::Object).collect()),
        );
        Some(Value::Object(row))
    }
}

impl Inner {
    fn emit(&mut self, topic: &Topic, event: ChangeEvent) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        for sub in self.subscribers.iter().filter(|s| &s.topic == topic) {
            if let Err(e) = sub.tx.try_send(event.clone()) {
                warn!("dropping change event for subscriber {}: {e}", sub.id);
            }
        }
    }

    fn tanks_of(&self, station_id: &str) -> Vec<Map<String, Value>> {
        let mut tanks: Vec<_> = self
            .tanks
            .iter()
            .filter(|t| row_id(t, "station_id").as_deref() == Some(station_id))
            .cloned()
            .collect();
        tanks.sort_by_key(|t| t.get("tank_no").and_then(Value::as_i64).unwrap_or_default());
        tanks
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn station_by_id(&self, station_id: &str) -> Result<Value, RemoteError> {
        self.begin("station_by_id").await?;
        let inner = self.lock();
        Self::station_with_tanks(&inner, station_id).ok_or(RemoteError::NotFound)
    }

    async fn tanks_by_station(&self, station_id: &str) -> Result<Vec<Value>, RemoteError> {
        self.begin("tanks_by_station").await?;
        let inner = self.lock();
        Ok(inner.tanks_of(station_id).into_iter().map(Value::Object).collect())
    }

    async fn settings(&self) -> Result<Value, RemoteError> {
        self.begin("settings").await?;
        self.lock().settings.clone().ok_or(RemoteError::NotFound)
    }

    async fn asset(&self, key: AssetKey) -> Result<Value, RemoteError> {
        self.begin("asset").await?;
        self.lock()
            .assets
            .get(key.as_str())
            .cloned()
            .ok_or(RemoteError::NotFound)
    }

    async fn find_manager(&self, user: &str, secret: &str) -> Result<Option<Value>, RemoteError> {
        self.begin("find_manager").await?;
        let inner = self.lock();
        let station_id = inner
            .stations
            .iter()
            .find(|(_, row)| {
                row.get("manager_user").and_then(Value::as_str) == Some(user)
                    && row.get("manager_pass").and_then(Value::as_str) == Some(secret)
            })
            .map(|(id, _)| id.clone());
        Ok(station_id.and_then(|id| Self::station_with_tanks(&inner, &id)))
    }

    async fn find_staff(&self, phone: &str, pin: &str) -> Result<Option<Value>, RemoteError> {
        self.begin("find_staff").await?;
        let inner = self.lock();
        let Some(staff) = inner.staff.iter().find(|s| {
            s.get("phone").and_then(Value::as_str) == Some(phone)
                && s.get("pin").and_then(Value::as_str) == Some(pin)
        }) else {
            return Ok(None);
        };
        Ok(row_id(staff, "station_id")
            .and_then(|id| inner.stations.get(&id).cloned())
            .map(Value::Object))
    }

    async fn subscribe(&self, topic: Topic) -> Result<Subscription, RemoteError> {
        {
            let mut inner = self.lock();
            inner.calls.push("subscribe".to_string());
            if inner.offline {
                return Err(RemoteError::Unreachable("offline".into()));
            }
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = {
            let mut inner = self.lock();
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.push(Subscriber {
                id,
                topic: topic.clone(),
                tx,
            });
            id
        };

        let shared = Arc::clone(&self.inner);
        let disposer = Disposer::new(move || {
            if let Ok(mut inner) = shared.lock() {
                inner.subscribers.retain(|s| s.id != id);
            }
        });
        Ok(Subscription::new(topic, rx, disposer))
    }
}

fn row_id(row: &Map<String, Value>, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
