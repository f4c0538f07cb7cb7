// Messages between the shell and the application event loop.
//
// The shell sends `UserCommand`s; the loop answers with `UiUpdate`s. The
// shell never reads core state directly, only the `AppSnapshot`s it is sent.

use std::fmt;

use crate::bootstrap::BootPhase;
use crate::broadcast::{BroadcastMessage, MaintenanceState};
use crate::health::HealthStatus;
use crate::measure::AuditOutcome;
use crate::model::{Session, StationSnapshot};
use crate::theme::Palette;

/// Actions the shell can request.
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    Login {
        user_id: String,
        secret: String,
        remember: bool,
    },
    Logout,
    /// Revoke the remembered login.
    ForgetLogin,
    RunHealthCheck {
        force: bool,
    },
    Measure(MeasurementRequest),
    /// Ask for a fresh snapshot.
    Status,
    Quit,
}

/// A calculation to run against the loaded datasets.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementRequest {
    CorrectDensity {
        observed: f64,
        temperature: f64,
    },
    /// The tank's type is resolved from the current station.
    DipVolume {
        tank_id: String,
        dip: f64,
    },
    AuditInvoice {
        observed: f64,
        temperature: f64,
        invoice: f64,
    },
}

/// Transient toast surfaced after a live merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    ProfileUpdated,
    TanksUpdated,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Notification::ProfileUpdated => "Station Data Updated",
            Notification::TanksUpdated => "Tank Levels Updated",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementResult {
    Density {
        standard_density: f64,
    },
    Volume {
        tank_id: String,
        tank_name: String,
        /// Unrounded; shells display whole litres.
        litres: f64,
    },
    Audit(AuditOutcome),
}

/// Everything the shell may render.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSnapshot {
    pub phase: BootPhase,
    pub session: Option<Session>,
    pub station: Option<StationSnapshot>,
    pub palette: Palette,
    pub assets_loaded: bool,
    pub broadcast: Option<BroadcastMessage>,
    pub maintenance: MaintenanceState,
    pub health: HealthStatus,
    /// User id to pre-fill on the login prompt.
    pub remembered_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    /// Startup reconciliation is over. Sent exactly once.
    LoadingFinished,
    Snapshot(Box<AppSnapshot>),
    Notification(Notification),
    LoginSucceeded,
    /// Literal message for the operator.
    LoginFailed(String),
    Measurement(MeasurementResult),
    MeasurementFailed(String),
}
