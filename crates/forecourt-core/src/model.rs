// Session identity, station snapshot, tanks and the settings record.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Manager,
    Staff,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Staff => "staff",
        }
    }

    /// Parse a persisted role. Anything unrecognised is treated as a manager,
    /// matching how sessions were stored before roles were recorded.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("staff") => Role::Staff,
            _ => Role::Manager,
        }
    }
}

/// The authenticated identity operating this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub station_id: String,
    pub role: Role,
    pub user_id: String,
    #[serde(default)]
    pub remembered_credential_present: bool,
}

impl Session {
    pub fn display_name(&self) -> &'static str {
        match self.role {
            Role::Manager => "Manager",
            Role::Staff => "Staff Member",
        }
    }

    /// Only managers may edit the staff roster.
    pub fn can_manage_staff(&self) -> bool {
        self.role == Role::Manager
    }
}

/// Identity (and optionally secret) kept for login auto-fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberedLogin {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

// ---------------------------------------------------------------------------
// Tanks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tank {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub name: String,
    #[serde(rename = "type", default, deserialize_with = "nullable_string")]
    pub tank_type: String,
    #[serde(rename = "tank_no", default)]
    pub tank_number: i64,
}

/// Order tanks by tank number. The sort is stable so rows sharing a number
/// keep the order the remote returned them in.
pub fn sort_tanks(tanks: &mut [Tank]) {
    tanks.sort_by_key(|t| t.tank_number);
}

// ---------------------------------------------------------------------------
// Station snapshot
// ---------------------------------------------------------------------------

/// Columns that must never be held in memory or written to local storage.
const CREDENTIAL_FIELDS: &[&str] = &["manager_pass"];

/// The client's view of its station: typed profile columns, the ordered tank
/// list, and every other profile column kept verbatim in `profile`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationSnapshot {
    #[serde(deserialize_with = "string_or_number")]
    pub station_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub manager_user: Option<String>,
    #[serde(default, deserialize_with = "nullable_tanks")]
    pub tanks: Vec<Tank>,
    #[serde(flatten)]
    pub profile: Map<String, Value>,
}

impl StationSnapshot {
    /// Build a snapshot from a full station row (tanks nested or absent).
    /// Credentials are scrubbed and tanks put in tank-number order.
    pub fn from_record(record: Value) -> Result<Self, serde_json::Error> {
        let mut snapshot: StationSnapshot = serde_json::from_value(record)?;
        for field in CREDENTIAL_FIELDS {
            snapshot.profile.remove(*field);
        }
        sort_tanks(&mut snapshot.tanks);
        Ok(snapshot)
    }

    /// Whether a raw row carried a `tanks` array at all (as opposed to an
    /// empty one).
    pub fn record_has_tanks(record: &Value) -> bool {
        record.get("tanks").is_some_and(Value::is_array)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Station")
    }

    /// Merge the changed profile columns of a station row. `tanks` and the
    /// station id are never touched, and credential columns are dropped.
    pub fn merge_profile(&mut self, fields: &Map<String, Value>) {
        for (key, value) in fields {
            if key == "tanks" || key == "station_id" || CREDENTIAL_FIELDS.contains(&key.as_str()) {
                continue;
            }
            match key.as_str() {
                "name" => self.name = text(value),
                "theme" => self.theme = text(value),
                "location" => self.location = text(value),
                "manager_user" => self.manager_user = text(value),
                _ => {
                    self.profile.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Replace the tank list wholesale. Profile columns are untouched.
    pub fn replace_tanks(&mut self, mut tanks: Vec<Tank>) {
        sort_tanks(&mut tanks);
        self.tanks = tanks;
    }

    pub fn tank(&self, tank_id: &str) -> Option<&Tank> {
        self.tanks.iter().find(|t| t.id == tank_id)
    }
}

/// Read a row's `station_id` column as a string.
pub fn record_station_id(record: &Map<String, Value>) -> Option<String> {
    record.get("station_id").and_then(text)
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Settings singleton
// ---------------------------------------------------------------------------

/// The global settings row driving maintenance and broadcasts.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SettingsRecord {
    #[serde(default)]
    pub downtime_active: Option<bool>,
    #[serde(default)]
    pub broadcast_msg: Option<String>,
    #[serde(default)]
    pub broadcast_type: Option<String>,
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number identifier, got {other}"
        ))),
    }
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn nullable_tanks<'de, D>(deserializer: D) -> Result<Vec<Tank>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Tank>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn station_row() -> Value {
        json!({
            "station_id": "S1",
            "name": "Highway Fuels",
            "theme": "bpcl",
            "location": "NH-48",
            "manager_user": "9875345863",
            "manager_pass": "hunter2",
            "owner": "R. Mehta",
            "tanks": [
                {"id": 7, "name": "HSD 2", "type": "HSD", "tank_no": 2},
                {"id": 3, "name": "MS 1", "type": "MS", "tank_no": 1}
            ]
        })
    }

    #[test]
    fn from_record_orders_tanks_and_scrubs_credentials() {
        let snap = StationSnapshot::from_record(station_row()).unwrap();

        assert_eq!(snap.station_id, "S1");
        assert_eq!(snap.display_name(), "Highway Fuels");
        assert_eq!(snap.tanks.len(), 2);
        assert_eq!(snap.tanks[0].name, "MS 1");
        assert_eq!(snap.tanks[0].id, "3");
        assert_eq!(snap.tanks[1].tank_number, 2);
        assert!(!snap.profile.contains_key("manager_pass"));
        assert_eq!(snap.profile.get("owner"), Some(&json!("R. Mehta")));
    }

    #[test]
    fn snapshot_serialization_never_contains_secret() {
        let snap = StationSnapshot::from_record(station_row()).unwrap();
        let stored = serde_json::to_string(&snap).unwrap();
        assert!(!stored.contains("hunter2"));

        let back: StationSnapshot = serde_json::from_str(&stored).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn missing_or_null_tanks_become_empty_list() {
        let snap = StationSnapshot::from_record(json!({"station_id": 42, "tanks": null})).unwrap();
        assert_eq!(snap.station_id, "42");
        assert!(snap.tanks.is_empty());
        assert!(!StationSnapshot::record_has_tanks(&json!({"station_id": "S1"})));
        assert!(StationSnapshot::record_has_tanks(&json!({"tanks": []})));
    }

    #[test]
    fn profile_merge_preserves_tanks_and_their_order() {
        let mut snap = StationSnapshot::from_record(station_row()).unwrap();
        let tanks_before = snap.tanks.clone();

        let update = json!({
            "station_id": "S1",
            "name": "Highway Fuels & Lubes",
            "theme": "iocl",
            "manager_pass": "changed",
            "tanks": [],
            "pumps": 6
        });
        snap.merge_profile(update.as_object().unwrap());

        assert_eq!(snap.tanks, tanks_before);
        assert_eq!(snap.name.as_deref(), Some("Highway Fuels & Lubes"));
        assert_eq!(snap.theme.as_deref(), Some("iocl"));
        assert_eq!(snap.location.as_deref(), Some("NH-48"));
        assert_eq!(snap.profile.get("pumps"), Some(&json!(6)));
        assert_eq!(snap.profile.get("owner"), Some(&json!("R. Mehta")));
        assert!(!snap.profile.contains_key("manager_pass"));
    }

    #[test]
    fn replacing_tanks_keeps_unrelated_profile_fields() {
        let mut snap = StationSnapshot::from_record(station_row()).unwrap();
        let profile_before = snap.profile.clone();

        snap.replace_tanks(vec![
            Tank {
                id: "9".into(),
                name: "XP 3".into(),
                tank_type: "XP".into(),
                tank_number: 3,
            },
            Tank {
                id: "3".into(),
                name: "MS 1".into(),
                tank_type: "MS".into(),
                tank_number: 1,
            },
        ]);

        assert_eq!(snap.profile, profile_before);
        assert_eq!(snap.name.as_deref(), Some("Highway Fuels"));
        let order: Vec<_> = snap.tanks.iter().map(|t| t.tank_number).collect();
        assert_eq!(order, vec![1, 3]);
        assert!(snap.tank("9").is_some());
        assert!(snap.tank("7").is_none());
    }

    #[test]
    fn role_parse_defaults_to_manager() {
        assert_eq!(Role::parse(Some("staff")), Role::Staff);
        assert_eq!(Role::parse(Some("manager")), Role::Manager);
        assert_eq!(Role::parse(None), Role::Manager);
        assert_eq!(Role::parse(Some("owner")), Role::Manager);
    }

    #[test]
    fn only_managers_manage_staff() {
        let mut session = Session {
            station_id: "S1".into(),
            role: Role::Manager,
            user_id: "9875345863".into(),
            remembered_credential_present: false,
        };
        assert!(session.can_manage_staff());
        assert_eq!(session.display_name(), "Manager");

        session.role = Role::Staff;
        assert!(!session.can_manage_staff());
        assert_eq!(session.display_name(), "Staff Member");
    }

    #[test]
    fn settings_record_tolerates_nulls() {
        let settings: SettingsRecord = serde_json::from_value(json!({
            "id": 1,
            "downtime_active": null,
            "broadcast_msg": "Price revision at midnight",
            "broadcast_type": null
        }))
        .unwrap();
        assert_eq!(settings.downtime_active, None);
        assert_eq!(settings.broadcast_msg.as_deref(), Some("Price revision at midnight"));
    }
}
