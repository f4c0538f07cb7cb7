// Session lifecycle: restore on startup, login, logout.
//
// `SessionContext` is the single owner of the in-memory Session and
// StationSnapshot. The bootstrapper mutates it; everything else reads it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{RememberedLogin, Role, Session, StationSnapshot};
use crate::remote::{with_timeout, RemoteError, RemoteStore};
use crate::store::SessionStore;

// ---------------------------------------------------------------------------
// Session context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootPhase {
    #[default]
    Start,
    /// Cached session exposed, not yet confirmed by the remote store.
    Hydrated,
    /// Session confirmed (or freshly logged in).
    Ready,
    /// No usable session.
    Anonymous,
}

/// The live session and station snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    pub phase: BootPhase,
    pub session: Option<Session>,
    pub station: Option<StationSnapshot>,
}

impl SessionContext {
    /// Station id of the active session, if any.
    pub fn station_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.station_id.as_str())
    }

    /// Drop the in-memory session and snapshot.
    pub fn teardown(&mut self) {
        self.session = None;
        self.station = None;
        self.phase = BootPhase::Anonymous;
    }
}

// ---------------------------------------------------------------------------
// Bootstrapper
// ---------------------------------------------------------------------------

pub struct SessionBootstrapper {
    store: Arc<SessionStore>,
    remote: Arc<dyn RemoteStore>,
    request_timeout: Duration,
    /// Persist the secret along with the identity for "remember me".
    remember_secret: bool,
}

impl SessionBootstrapper {
    pub fn new(
        store: Arc<SessionStore>,
        remote: Arc<dyn RemoteStore>,
        request_timeout: Duration,
        remember_secret: bool,
    ) -> Self {
        Self {
            store,
            remote,
            request_timeout,
            remember_secret,
        }
    }

    /// Restore the persisted session and reconcile it with the remote store.
    ///
    /// The cached snapshot is exposed before the network is touched. Only a
    /// definitive not-found clears it; any other failure keeps what was
    /// cached. Returns the phase reached. `hydrate` and `reconcile` are the
    /// two halves, for callers that publish the hydrated state in between.
    pub async fn bootstrap(&self, ctx: &mut SessionContext) -> BootPhase {
        match self.hydrate(ctx) {
            Some(session) => self.reconcile(ctx, session).await,
            None => ctx.phase,
        }
    }

    /// Expose the cached session without touching the network. Returns the
    /// persisted identity still to be verified, or `None` (phase
    /// `Anonymous`) when nothing was persisted.
    pub fn hydrate(&self, ctx: &mut SessionContext) -> Option<Session> {
        ctx.phase = BootPhase::Start;

        let Some(persisted) = self.store.load() else {
            info!("No persisted session");
            ctx.phase = BootPhase::Anonymous;
            return None;
        };

        let session = persisted.session;
        if let Some(cached) = persisted.station {
            info!("Hydrated session for station {} from cache", session.station_id);
            ctx.session = Some(session.clone());
            ctx.station = Some(cached);
            ctx.phase = BootPhase::Hydrated;
        } else {
            debug!(
                "Persisted identity for {} has no cached snapshot",
                session.station_id
            );
        }
        Some(session)
    }

    /// Verify a persisted identity against the remote store.
    pub async fn reconcile(&self, ctx: &mut SessionContext, session: Session) -> BootPhase {
        let station_id = session.station_id.clone();
        match self.fetch_station(&station_id).await {
            Ok(station) => {
                self.persist(&session, &station);
                info!("Session for station {station_id} verified");
                ctx.session = Some(session);
                ctx.station = Some(station);
                ctx.phase = BootPhase::Ready;
            }
            Err(Error::NotFound) => {
                warn!("Station {station_id} no longer exists, clearing session");
                if let Err(e) = self.store.clear() {
                    warn!("Failed to clear persisted session: {e:#}");
                }
                ctx.teardown();
            }
            Err(e) => {
                warn!("Could not verify session for {station_id}, keeping cache: {e:?}");
                if ctx.phase != BootPhase::Hydrated {
                    ctx.phase = BootPhase::Anonymous;
                }
            }
        }
        ctx.phase
    }

    /// Authenticate as a manager (user id + password) or, failing that, as
    /// staff (phone + PIN). On success the context holds the new session.
    pub async fn login(
        &self,
        ctx: &mut SessionContext,
        user_id: &str,
        secret: &str,
        remember: bool,
    ) -> Result<()> {
        let user_id = user_id.trim();
        if user_id.is_empty() || secret.is_empty() {
            return Err(Error::Unauthenticated);
        }

        let (role, mut record) = match self.lookup_credentials(user_id, secret).await? {
            Some(found) => found,
            None => {
                info!("Login rejected for {user_id}");
                return Err(Error::Unauthenticated);
            }
        };

        if !StationSnapshot::record_has_tanks(&record) {
            let station_id = record
                .as_object()
                .and_then(crate::model::record_station_id)
                .unwrap_or_default();
            let tanks = match with_timeout(
                self.request_timeout,
                self.remote.tanks_by_station(&station_id),
            )
            .await
            {
                Ok(tanks) => tanks,
                Err(e) => {
                    warn!("Failed to fetch tanks for {station_id} during login: {e}");
                    Vec::new()
                }
            };
            if let Some(obj) = record.as_object_mut() {
                obj.insert("tanks".into(), Value::Array(tanks));
            }
        }

        let station = StationSnapshot::from_record(record)
            .map_err(|e| Error::transient(format!("malformed station row: {e}")))?;

        self.update_remembered_login(user_id, secret, remember);

        let session = Session {
            station_id: station.station_id.clone(),
            role,
            user_id: user_id.to_string(),
            remembered_credential_present: remember,
        };
        self.persist(&session, &station);
        info!(
            "Logged in to station {} as {}",
            session.station_id,
            role.as_str()
        );

        ctx.session = Some(session);
        ctx.station = Some(station);
        ctx.phase = BootPhase::Ready;
        Ok(())
    }

    /// Clear the persisted and in-memory session. The remembered login is
    /// kept.
    pub fn logout(&self, ctx: &mut SessionContext) {
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear persisted session: {e:#}");
        }
        ctx.teardown();
        info!("Logged out");
    }

    pub fn remembered_login(&self) -> Option<RememberedLogin> {
        self.store.remembered_login()
    }

    /// Revoke the remembered login.
    pub fn forget_login(&self, ctx: &mut SessionContext) {
        if let Err(e) = self.store.forget_login() {
            warn!("Failed to forget remembered login: {e:#}");
        }
        if let Some(session) = ctx.session.as_mut() {
            session.remembered_credential_present = false;
        }
    }

    // -- helpers --

    async fn fetch_station(&self, station_id: &str) -> Result<StationSnapshot> {
        let record = with_timeout(self.request_timeout, self.remote.station_by_id(station_id))
            .await
            .map_err(Error::from)?;
        StationSnapshot::from_record(record)
            .map_err(|e| Error::transient(format!("malformed station row: {e}")))
    }

    /// Manager first, then staff. Any remote failure is transient: a lookup
    /// miss is reported as `None`, never as an error.
    async fn lookup_credentials(&self, user_id: &str, secret: &str) -> Result<Option<(Role, Value)>> {
        let manager = with_timeout(self.request_timeout, self.remote.find_manager(user_id, secret))
            .await
            .map_err(login_error)?;
        if let Some(record) = manager {
            return Ok(Some((Role::Manager, record)));
        }

        let staff = with_timeout(self.request_timeout, self.remote.find_staff(user_id, secret))
            .await
            .map_err(login_error)?;
        Ok(staff.map(|station| (Role::Staff, station)))
    }

    fn update_remembered_login(&self, user_id: &str, secret: &str, remember: bool) {
        let result = if remember {
            self.store.remember_login(&RememberedLogin {
                user_id: user_id.to_string(),
                secret: self.remember_secret.then(|| secret.to_string()),
            })
        } else {
            self.store.forget_login()
        };
        if let Err(e) = result {
            warn!("Failed to update remembered login: {e:#}");
        }
    }

    fn persist(&self, session: &Session, station: &StationSnapshot) {
        if let Err(e) = self.store.save(session, station) {
            warn!("Failed to persist session: {e:#}");
        }
    }
}

fn login_error(err: RemoteError) -> Error {
    Error::transient(err.to_string())
}
