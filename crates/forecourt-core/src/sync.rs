// Live station sync.
//
// While a station identity is active, two subscriptions (station row and
// tank rows) are forwarded into the application event loop as `SyncEvent`s.
// Every event carries the generation of the attachment that produced it;
// `apply` rejects anything from an attachment that has since been detached,
// including events already sitting in the channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bootstrap::SessionContext;
use crate::error::{Error, Result};
use crate::model::{record_station_id, StationSnapshot, Tank};
use crate::protocol::Notification;
use crate::remote::{with_timeout, ChangeEvent, Disposer, RemoteStore, Topic};
use crate::store::SessionStore;

/// A change forwarded from one of the attachment's subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Profile { generation: u64, change: ChangeEvent },
    Inventory { generation: u64, change: ChangeEvent },
}

impl SyncEvent {
    pub fn generation(&self) -> u64 {
        match self {
            SyncEvent::Profile { generation, .. } | SyncEvent::Inventory { generation, .. } => {
                *generation
            }
        }
    }
}

/// Identifies one attachment. Detaching with a handle from an older
/// attachment does nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentHandle {
    pub station_id: String,
    pub generation: u64,
}

struct Attachment {
    handle: AttachmentHandle,
    disposers: Vec<Disposer>,
    forwarders: Vec<JoinHandle<()>>,
}

pub struct RealtimeSync {
    remote: Arc<dyn RemoteStore>,
    store: Arc<SessionStore>,
    request_timeout: Duration,
    events_tx: mpsc::Sender<SyncEvent>,
    attachment: Option<Attachment>,
    /// Bumped on every attach. u64 will not wrap in practice.
    generation: u64,
}

impl RealtimeSync {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<SessionStore>,
        request_timeout: Duration,
        events_tx: mpsc::Sender<SyncEvent>,
    ) -> Self {
        Self {
            remote,
            store,
            request_timeout,
            events_tx,
            attachment: None,
            generation: 0,
        }
    }

    pub fn current(&self) -> Option<&AttachmentHandle> {
        self.attachment.as_ref().map(|a| &a.handle)
    }

    /// Subscribe to the station's profile and tank streams.
    ///
    /// Re-attaching to the current station is a no-op. Attaching to another
    /// station detaches the current one first.
    pub async fn attach(&mut self, station_id: &str) -> Result<AttachmentHandle> {
        if let Some(current) = self.current() {
            if current.station_id == station_id {
                debug!("Already attached to {station_id}");
                return Ok(current.clone());
            }
        }
        self.detach_all();

        let (profile, inventory) = tokio::join!(
            with_timeout(
                self.request_timeout,
                self.remote.subscribe(Topic::Station(station_id.to_string()))
            ),
            with_timeout(
                self.request_timeout,
                self.remote.subscribe(Topic::Tanks(station_id.to_string()))
            ),
        );
        // On partial failure the successful subscription is dropped here,
        // which disposes it.
        let (profile, inventory) = match (profile, inventory) {
            (Ok(p), Ok(i)) => (p, i),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to attach realtime sync for {station_id}: {e}");
                return Err(Error::transient(e.to_string()));
            }
        };

        self.generation += 1;
        let generation = self.generation;
        let (profile_rx, profile_disposer) = profile.into_parts();
        let (inventory_rx, inventory_disposer) = inventory.into_parts();

        let forwarders = vec![
            spawn_forwarder(profile_rx, self.events_tx.clone(), move |change| {
                SyncEvent::Profile { generation, change }
            }),
            spawn_forwarder(inventory_rx, self.events_tx.clone(), move |change| {
                SyncEvent::Inventory { generation, change }
            }),
        ];

        let handle = AttachmentHandle {
            station_id: station_id.to_string(),
            generation,
        };
        self.attachment = Some(Attachment {
            handle: handle.clone(),
            disposers: vec![profile_disposer, inventory_disposer],
            forwarders,
        });
        info!("Realtime sync attached to {station_id} (gen: {generation})");
        Ok(handle)
    }

    /// Detach if `handle` is the live attachment.
    pub fn detach(&mut self, handle: &AttachmentHandle) {
        if self.current() == Some(handle) {
            self.detach_all();
        } else {
            debug!("Ignoring detach of stale attachment {handle:?}");
        }
    }

    /// Unregister every subscription before returning. No event of the old
    /// attachment is applied afterwards.
    pub fn detach_all(&mut self) {
        let Some(attachment) = self.attachment.take() else {
            return;
        };
        for disposer in attachment.disposers {
            disposer.dispose();
        }
        for forwarder in attachment.forwarders {
            forwarder.abort();
        }
        info!(
            "Realtime sync detached from {} (gen: {})",
            attachment.handle.station_id, attachment.handle.generation
        );
    }

    /// Merge an event into the context's snapshot and persist it. Returns the
    /// notification to surface, or `None` if nothing changed.
    pub async fn apply(&self, event: SyncEvent, ctx: &mut SessionContext) -> Option<Notification> {
        let station_id = match self.current() {
            Some(handle) if handle.generation == event.generation() => handle.station_id.clone(),
            _ => {
                debug!("Discarding stale sync event (gen: {})", event.generation());
                return None;
            }
        };
        if ctx.station_id() != Some(station_id.as_str()) || ctx.station.is_none() {
            debug!("Sync event for {station_id} does not match the active session");
            return None;
        }

        match event {
            SyncEvent::Profile { change, .. } => self.apply_profile(&station_id, change, ctx).await,
            SyncEvent::Inventory { change, .. } => {
                debug!("Tank change ({:?}) for {station_id}", change.op);
                self.refresh_tanks(&station_id, ctx).await
            }
        }
    }

    async fn apply_profile(
        &self,
        station_id: &str,
        change: ChangeEvent,
        ctx: &mut SessionContext,
    ) -> Option<Notification> {
        let fields = match change.record {
            Some(Value::Object(fields)) => fields,
            Some(other) => {
                warn!("Ignoring non-object station update: {other}");
                return None;
            }
            // Resync after a reconnect: fetch the row and merge its profile.
            None => match with_timeout(self.request_timeout, self.remote.station_by_id(station_id)).await
            {
                Ok(Value::Object(fields)) => fields,
                Ok(_) => return None,
                Err(e) => {
                    warn!("Station resync for {station_id} failed, keeping snapshot: {e}");
                    return None;
                }
            },
        };

        if let Some(row_station) = record_station_id(&fields) {
            if row_station != station_id {
                debug!("Ignoring update for station {row_station}");
                return None;
            }
        }

        let mut merged = ctx.station.clone()?;
        merged.merge_profile(&fields);
        self.commit(ctx, merged);
        Some(Notification::ProfileUpdated)
    }

    async fn refresh_tanks(&self, station_id: &str, ctx: &mut SessionContext) -> Option<Notification> {
        let rows = match with_timeout(self.request_timeout, self.remote.tanks_by_station(station_id)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Tank refresh for {station_id} failed, keeping snapshot: {e}");
                return None;
            }
        };
        let tanks: Vec<Tank> = rows
            .into_iter()
            .filter_map(|row| match serde_json::from_value(row) {
                Ok(tank) => Some(tank),
                Err(e) => {
                    warn!("Skipping malformed tank row: {e}");
                    None
                }
            })
            .collect();

        let mut merged = ctx.station.clone()?;
        merged.replace_tanks(tanks);
        self.commit(ctx, merged);
        Some(Notification::TanksUpdated)
    }

    /// Persist then expose.
    fn commit(&self, ctx: &mut SessionContext, merged: StationSnapshot) {
        if let Some(session) = ctx.session.as_ref() {
            if let Err(e) = self.store.save(session, &merged) {
                warn!("Failed to persist merged snapshot: {e:#}");
            }
        }
        ctx.station = Some(merged);
    }
}

impl Drop for RealtimeSync {
    fn drop(&mut self) {
        self.detach_all();
    }
}

fn spawn_forwarder(
    mut rx: mpsc::Receiver<ChangeEvent>,
    tx: mpsc::Sender<SyncEvent>,
    wrap: impl Fn(ChangeEvent) -> SyncEvent + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(change) = rx.recv().await {
            if tx.send(wrap(change)).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootPhase;
    use crate::model::{Role, Session};
    use crate::remote::{ChangeOp, InMemoryRemote};
    use serde_json::json;

    struct Fixture {
        remote: InMemoryRemote,
        store: Arc<SessionStore>,
        sync: RealtimeSync,
        rx: mpsc::Receiver<SyncEvent>,
        ctx: SessionContext,
    }

    fn fixture() -> Fixture {
        let remote = InMemoryRemote::new();
        for id in ["S1", "S2"] {
            remote.insert_station(json!({
                "station_id": id,
                "name": format!("Station {id}"),
                "location": "NH-48",
                "tanks": [
                    {"id": 1, "name": "MS 1", "type": "MS", "tank_no": 1},
                    {"id": 2, "name": "HSD 2", "type": "HSD", "tank_no": 2}
                ]
            }));
        }
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        let (tx, rx) = mpsc::channel(16);
        let sync = RealtimeSync::new(
            Arc::new(remote.clone()),
            Arc::clone(&store),
            Duration::from_secs(5),
            tx,
        );

        let station = StationSnapshot::from_record(json!({
            "station_id": "S1",
            "name": "Station S1",
            "location": "NH-48",
            "tanks": [
                {"id": 1, "name": "MS 1", "type": "MS", "tank_no": 1},
                {"id": 2, "name": "HSD 2", "type": "HSD", "tank_no": 2}
            ]
        }))
        .unwrap();
        let ctx = SessionContext {
            phase: BootPhase::Ready,
            session: Some(Session {
                station_id: "S1".into(),
                role: Role::Manager,
                user_id: "m1".into(),
                remembered_credential_present: false,
            }),
            station: Some(station),
        };
        Fixture {
            remote,
            store,
            sync,
            rx,
            ctx,
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("sync event should arrive")
            .expect("sync channel open")
    }

    #[tokio::test]
    async fn attaching_twice_to_same_station_is_a_noop() {
        let mut f = fixture();
        let first = f.sync.attach("S1").await.unwrap();
        let second = f.sync.attach("S1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.remote.subscriber_count(&Topic::Station("S1".into())), 1);
        assert_eq!(f.remote.subscriber_count(&Topic::Tanks("S1".into())), 1);
        assert_eq!(f.remote.call_count("subscribe"), 2);
    }

    #[tokio::test]
    async fn attaching_elsewhere_detaches_first() {
        let mut f = fixture();
        let first = f.sync.attach("S1").await.unwrap();
        let second = f.sync.attach("S2").await.unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(f.remote.subscriber_count(&Topic::Station("S1".into())), 0);
        assert_eq!(f.remote.subscriber_count(&Topic::Tanks("S1".into())), 0);
        assert_eq!(f.remote.subscriber_count(&Topic::Station("S2".into())), 1);

        // Old handle no longer detaches anything.
        f.sync.detach(&first);
        assert_eq!(f.sync.current(), Some(&second));
    }

    #[tokio::test]
    async fn profile_update_merges_and_persists_without_touching_tanks() {
        let mut f = fixture();
        f.sync.attach("S1").await.unwrap();
        let tanks_before = f.ctx.station.as_ref().unwrap().tanks.clone();

        f.remote.update_station("S1", json!({"name": "Renamed", "manager_pass": "x"}));
        let event = next_event(&mut f.rx).await;
        let note = f.sync.apply(event, &mut f.ctx).await;

        assert_eq!(note, Some(Notification::ProfileUpdated));
        let station = f.ctx.station.as_ref().unwrap();
        assert_eq!(station.name.as_deref(), Some("Renamed"));
        assert_eq!(station.tanks, tanks_before);
        assert!(!station.profile.contains_key("manager_pass"));
        assert_eq!(f.store.load().unwrap().station.as_ref(), Some(station));
    }

    #[tokio::test]
    async fn tank_change_refetches_the_whole_list() {
        let mut f = fixture();
        f.sync.attach("S1").await.unwrap();

        f.remote
            .upsert_tank("S1", json!({"id": 3, "name": "XP 0", "type": "XP", "tank_no": 0}));
        let event = next_event(&mut f.rx).await;
        assert!(matches!(event, SyncEvent::Inventory { ref change, .. } if change.op == ChangeOp::Insert));

        let note = f.sync.apply(event, &mut f.ctx).await;
        assert_eq!(note, Some(Notification::TanksUpdated));
        let station = f.ctx.station.as_ref().unwrap();
        let names: Vec<_> = station.tanks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["XP 0", "MS 1", "HSD 2"]);
        assert_eq!(station.location.as_deref(), Some("NH-48"));
        assert_eq!(f.store.load().unwrap().station.unwrap().tanks.len(), 3);
    }

    #[tokio::test]
    async fn interleaved_streams_keep_both_updates() {
        let mut f = fixture();
        f.sync.attach("S1").await.unwrap();

        f.remote.remove_tank("S1", "2");
        f.remote.update_station("S1", json!({"theme": "jio"}));
        for _ in 0..2 {
            let event = next_event(&mut f.rx).await;
            assert!(f.sync.apply(event, &mut f.ctx).await.is_some());
        }

        let station = f.ctx.station.as_ref().unwrap();
        assert_eq!(station.theme.as_deref(), Some("jio"));
        assert_eq!(station.tanks.len(), 1);
        assert_eq!(f.store.load().unwrap().station.as_ref(), Some(station));
    }

    #[tokio::test]
    async fn queued_events_are_rejected_after_detach() {
        let mut f = fixture();
        let handle = f.sync.attach("S1").await.unwrap();

        f.remote.update_station("S1", json!({"name": "Too late"}));
        let queued = next_event(&mut f.rx).await;

        f.sync.detach(&handle);
        assert_eq!(f.remote.subscriber_count(&Topic::Station("S1".into())), 0);
        assert_eq!(f.sync.apply(queued, &mut f.ctx).await, None);
        assert_eq!(f.ctx.station.as_ref().unwrap().name.as_deref(), Some("Station S1"));

        f.remote.update_station("S1", json!({"name": "Even later"}));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), f.rx.recv())
                .await
                .is_err(),
            "no event may be delivered after detach"
        );
    }

    #[tokio::test]
    async fn resync_refetches_profile() {
        let mut f = fixture();
        f.sync.attach("S1").await.unwrap();
        f.remote.update_station("S1", json!({"location": "Ring Road"}));
        // Drain the live event; apply the synthetic resync instead.
        let _ = next_event(&mut f.rx).await;

        let generation = f.sync.current().unwrap().generation;
        let note = f
            .sync
            .apply(
                SyncEvent::Profile {
                    generation,
                    change: ChangeEvent::resync(),
                },
                &mut f.ctx,
            )
            .await;
        assert_eq!(note, Some(Notification::ProfileUpdated));
        let station = f.ctx.station.as_ref().unwrap();
        assert_eq!(station.location.as_deref(), Some("Ring Road"));
        assert_eq!(station.tanks.len(), 2);
    }

    #[tokio::test]
    async fn transient_refresh_failure_keeps_snapshot() {
        let mut f = fixture();
        f.sync.attach("S1").await.unwrap();
        f.remote
            .upsert_tank("S1", json!({"id": 9, "name": "XP", "type": "XP", "tank_no": 9}));
        let event = next_event(&mut f.rx).await;

        f.remote.set_offline(true);
        let before = f.ctx.station.clone();
        assert_eq!(f.sync.apply(event, &mut f.ctx).await, None);
        assert_eq!(f.ctx.station, before);
    }
}
