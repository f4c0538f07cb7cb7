// Remote data store abstraction.
//
// The station core never talks to the network directly. Everything it
// reads (station rows, tank rows, the settings singleton, lookup assets) and
// every live change stream goes through `RemoteStore`, so the bootstrap
// and sync logic can run against `InMemoryRemote` in tests.
//
// Rows travel as raw JSON: the store has arbitrary profile columns and the
// core only interprets the fields it needs.

mod memory;

pub use memory::InMemoryRemote;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::Error;

/// Collaborator-level failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    /// The queried record definitively does not exist.
    #[error("record not found")]
    NotFound,

    #[error("request timed out")]
    Timeout,

    #[error("network unreachable: {0}")]
    Unreachable(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound => Error::NotFound,
            other => Error::transient(other.to_string()),
        }
    }
}

/// A live change stream the core can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Updates to one station's row.
    Station(String),
    /// Inserts, updates and deletes of one station's tank rows.
    Tanks(String),
    /// Updates to the global settings singleton.
    Settings,
}

impl Topic {
    /// Channel name used when registering the subscription remotely.
    pub fn channel_name(&self) -> String {
        match self {
            Topic::Station(id) => format!("station-updates-{id}"),
            Topic::Tanks(id) => format!("tank-updates-{id}"),
            Topic::Settings => "global-broadcast".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One row change delivered by a subscription.
///
/// `record` is the row after the change. It is `None` for deletes and for
/// the synthetic resync event a transport emits after reconnecting.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub record: Option<Value>,
}

impl ChangeEvent {
    pub fn resync() -> Self {
        Self {
            op: ChangeOp::Update,
            record: None,
        }
    }
}

/// Unregisters a subscription from its transport. Runs at most once, either
/// explicitly through [`Disposer::dispose`] or when dropped.
pub struct Disposer(Option<Box<dyn FnOnce() + Send + Sync>>);

impl Disposer {
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn dispose(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Disposer").field(&self.0.is_some()).finish()
    }
}

/// A cancellable stream of [`ChangeEvent`]s for one [`Topic`].
///
/// Dropping the subscription disposes it.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    events: mpsc::Receiver<ChangeEvent>,
    disposer: Disposer,
}

impl Subscription {
    pub fn new(topic: Topic, events: mpsc::Receiver<ChangeEvent>, disposer: Disposer) -> Self {
        Self {
            topic,
            events,
            disposer,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Split into the event receiver and the disposer so the owner can
    /// unregister synchronously while a task drains the receiver.
    pub fn into_parts(self) -> (mpsc::Receiver<ChangeEvent>, Disposer) {
        (self.events, self.disposer)
    }
}

/// Lookup datasets stored remotely under fixed keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKey {
    DensityTable,
    TankCharts,
}

impl AssetKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKey::DensityTable => "density_table",
            AssetKey::TankCharts => "tank_charts",
        }
    }
}

/// Row-query and row-subscribe access to the remote data store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Station row with its tanks nested under `tanks`.
    async fn station_by_id(&self, station_id: &str) -> Result<Value, RemoteError>;

    /// Tank rows of a station ordered by tank number.
    async fn tanks_by_station(&self, station_id: &str) -> Result<Vec<Value>, RemoteError>;

    /// The settings singleton row.
    async fn settings(&self) -> Result<Value, RemoteError>;

    /// Payload of a lookup asset.
    async fn asset(&self, key: AssetKey) -> Result<Value, RemoteError>;

    /// Station row whose manager credentials match, if any.
    async fn find_manager(&self, user: &str, secret: &str) -> Result<Option<Value>, RemoteError>;

    /// Station row of the staff member whose phone and PIN match, if any.
    /// A staff member without a station is no match.
    async fn find_staff(&self, phone: &str, pin: &str) -> Result<Option<Value>, RemoteError>;

    async fn subscribe(&self, topic: Topic) -> Result<Subscription, RemoteError>;
}

/// Await a remote call, failing with [`RemoteError::Timeout`] once `limit`
/// elapses.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(RemoteError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn only_not_found_maps_to_not_found() {
        assert_eq!(Error::from(RemoteError::NotFound), Error::NotFound);
        for err in [
            RemoteError::Timeout,
            RemoteError::Unreachable("dns".into()),
            RemoteError::Server {
                status: 503,
                message: "unavailable".into(),
            },
            RemoteError::Decode("eof".into()),
        ] {
            assert!(Error::from(err).is_transient());
        }
    }

    #[test]
    fn disposer_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let disposer = Disposer::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        disposer.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&count);
        drop(Disposer::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropping_subscription_disposes_it() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(
            Topic::Settings,
            rx,
            Disposer::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tx.send(ChangeEvent::resync()).await.unwrap();
        assert_eq!(sub.next().await, Some(ChangeEvent::resync()));
        assert_eq!(sub.topic(), &Topic::Settings);

        drop(sub);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn channel_names_are_scoped_by_station() {
        assert_eq!(Topic::Station("S1".into()).channel_name(), "station-updates-S1");
        assert_eq!(Topic::Tanks("S1".into()).channel_name(), "tank-updates-S1");
        assert_eq!(Topic::Settings.channel_name(), "global-broadcast");
    }
}
