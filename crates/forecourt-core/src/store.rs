// SQLite persistence for the session identity and cached station snapshot.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::model::{RememberedLogin, Role, Session, StationSnapshot};

const STATION_ID_KEY: &str = "station_id";
const ROLE_KEY: &str = "user_role";
const USER_ID_KEY: &str = "user_id";
const STATION_DATA_KEY: &str = "station_data";
const REMEMBERED_LOGIN_KEY: &str = "remembered_login";

/// Session keys removed by `clear`. The remembered login is deliberately not
/// among them: it outlives logout.
const SESSION_KEYS: &[&str] = &[STATION_ID_KEY, ROLE_KEY, USER_ID_KEY, STATION_DATA_KEY];

/// What `load` found on disk. `station` is `None` when an identity was
/// persisted but its cached snapshot is missing or unreadable.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSession {
    pub session: Session,
    pub station: Option<StationSnapshot>,
}

/// Durable key/value store for the session and station snapshot.
///
/// Every write is whole-value and last-write-wins; callers always hand in the
/// already-merged snapshot.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (or create) the store at `path`. Pass `":memory:"` for an
    /// ephemeral store.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open session store at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set session store pragmas")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS local_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .context("failed to create session store schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock).
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("session store mutex poisoned")
    }

    /// Persist the session and its station snapshot in one transaction.
    pub fn save(&self, session: &Session, station: &StationSnapshot) -> Result<()> {
        let station_json =
            serde_json::to_string(station).context("failed to serialize station snapshot")?;

        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin save transaction")?;
        for (key, value) in [
            (STATION_ID_KEY, session.station_id.as_str()),
            (ROLE_KEY, session.role.as_str()),
            (USER_ID_KEY, session.user_id.as_str()),
            (STATION_DATA_KEY, station_json.as_str()),
        ] {
            tx.execute(
                "INSERT OR REPLACE INTO local_state (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .with_context(|| format!("failed to write {key}"))?;
        }
        tx.commit().context("failed to commit session save")?;
        Ok(())
    }

    /// Load the persisted session. Never fails: a missing, partial or
    /// unreadable record yields `None` (or a session without a snapshot).
    pub fn load(&self) -> Option<PersistedSession> {
        match self.try_load() {
            Ok(found) => found,
            Err(e) => {
                warn!("Session store unreadable, treating as empty: {e:#}");
                None
            }
        }
    }

    fn try_load(&self) -> Result<Option<PersistedSession>> {
        let Some(station_id) = self.get(STATION_ID_KEY)? else {
            return Ok(None);
        };
        let role = Role::parse(self.get(ROLE_KEY)?.as_deref());

        let station = match self.get(STATION_DATA_KEY)? {
            Some(json) => match serde_json::from_str::<StationSnapshot>(&json) {
                Ok(snapshot) if snapshot.station_id == station_id => Some(snapshot),
                Ok(snapshot) => {
                    warn!(
                        "Cached snapshot belongs to station {} not {station_id}, ignoring it",
                        snapshot.station_id
                    );
                    None
                }
                Err(e) => {
                    warn!("Cached station snapshot is corrupt, ignoring it: {e}");
                    None
                }
            },
            None => None,
        };

        let user_id = match self.get(USER_ID_KEY)? {
            Some(id) => id,
            None => fallback_user_id(role, station.as_ref()),
        };

        let remembered_credential_present = self.remembered_login().is_some();

        Ok(Some(PersistedSession {
            session: Session {
                station_id,
                role,
                user_id,
                remembered_credential_present,
            },
            station,
        }))
    }

    /// Remove the session identity and cached snapshot.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin clear transaction")?;
        for key in SESSION_KEYS {
            tx.execute("DELETE FROM local_state WHERE key = ?1", params![key])
                .with_context(|| format!("failed to delete {key}"))?;
        }
        tx.commit().context("failed to commit session clear")?;
        Ok(())
    }

    pub fn remembered_login(&self) -> Option<RememberedLogin> {
        let json = match self.get(REMEMBERED_LOGIN_KEY) {
            Ok(Some(json)) => json,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read remembered login: {e:#}");
                return None;
            }
        };
        serde_json::from_str(&json)
            .map_err(|e| warn!("Remembered login is corrupt, ignoring it: {e}"))
            .ok()
    }

    pub fn remember_login(&self, login: &RememberedLogin) -> Result<()> {
        let json = serde_json::to_string(login).context("failed to serialize remembered login")?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO local_state (key, value) VALUES (?1, ?2)",
                params![REMEMBERED_LOGIN_KEY, json],
            )
            .context("failed to save remembered login")?;
        Ok(())
    }

    pub fn forget_login(&self) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM local_state WHERE key = ?1",
                params![REMEMBERED_LOGIN_KEY],
            )
            .context("failed to forget remembered login")?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM local_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {key}"))
    }
}

/// User id for sessions persisted before the id itself was stored: managers
/// are identified by their station's manager login, staff generically.
fn fallback_user_id(role: Role, station: Option<&StationSnapshot>) -> String {
    match role {
        Role::Staff => "Staff".to_string(),
        Role::Manager => station
            .and_then(|s| s.manager_user.clone())
            .unwrap_or_default(),
    }
}
