// Line-oriented shell.
//
// Reads commands from stdin and prints one line per UI update. It holds no
// station state of its own beyond the last status line it printed.

use forecourt_core::bootstrap::BootPhase;
use forecourt_core::broadcast::Severity;
use forecourt_core::health::Pulse;
use forecourt_core::protocol::{
    AppSnapshot, MeasurementRequest, MeasurementResult, UiUpdate, UserCommand,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const USAGE: &str = "commands: login <id> <secret> [--remember] | logout | forget | \
health [--force] | density <observed> <temp> | dip <tank-id> <reading> | \
audit <observed> <temp> <invoice> | status | quit";

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<UserCommand>, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&verb, args)) = words.split_first() else {
        return Ok(None);
    };

    let cmd = match (verb.to_ascii_lowercase().as_str(), args) {
        ("login", [user_id, secret]) => UserCommand::Login {
            user_id: user_id.to_string(),
            secret: secret.to_string(),
            remember: false,
        },
        ("login", [user_id, secret, "--remember"]) => UserCommand::Login {
            user_id: user_id.to_string(),
            secret: secret.to_string(),
            remember: true,
        },
        ("logout", []) => UserCommand::Logout,
        ("forget", []) => UserCommand::ForgetLogin,
        ("health", []) => UserCommand::RunHealthCheck { force: false },
        ("health", ["--force"]) => UserCommand::RunHealthCheck { force: true },
        ("density", [observed, temperature]) => {
            UserCommand::Measure(MeasurementRequest::CorrectDensity {
                observed: number(observed)?,
                temperature: number(temperature)?,
            })
        }
        ("dip", [tank_id, dip]) => UserCommand::Measure(MeasurementRequest::DipVolume {
            tank_id: tank_id.to_string(),
            dip: number(dip)?,
        }),
        ("audit", [observed, temperature, invoice]) => {
            UserCommand::Measure(MeasurementRequest::AuditInvoice {
                observed: number(observed)?,
                temperature: number(temperature)?,
                invoice: number(invoice)?,
            })
        }
        ("status", []) => UserCommand::Status,
        ("quit" | "exit", []) => UserCommand::Quit,
        _ => return Err(format!("unrecognised command: {}", line.trim())),
    };
    Ok(Some(cmd))
}

fn number(raw: &str) -> Result<f64, String> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("not a number: {raw}"))
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub fn render(update: &UiUpdate) -> String {
    match update {
        UiUpdate::LoadingFinished => "ready".to_string(),
        UiUpdate::Snapshot(snapshot) => render_snapshot(snapshot),
        UiUpdate::Notification(note) => format!("* {note}"),
        UiUpdate::LoginSucceeded => "login ok".to_string(),
        UiUpdate::LoginFailed(message) => format!("login failed: {message}"),
        UiUpdate::Measurement(result) => render_measurement(result),
        UiUpdate::MeasurementFailed(message) => format!("error: {message}"),
    }
}

fn render_snapshot(s: &AppSnapshot) -> String {
    let mut parts = Vec::new();

    match (&s.session, &s.station) {
        (Some(session), Some(station)) => parts.push(format!(
            "{} [{}] {} {} | {} tanks",
            station.display_name(),
            station.station_id,
            session.display_name(),
            session.user_id,
            station.tanks.len()
        )),
        (Some(session), None) => parts.push(format!("station {} (not loaded)", session.station_id)),
        _ => parts.push(match &s.remembered_user_id {
            Some(user) => format!("signed out (remembered: {user})"),
            None => "signed out".to_string(),
        }),
    }

    match s.phase {
        BootPhase::Hydrated => parts.push("offline (cached)".to_string()),
        BootPhase::Start => parts.push("starting".to_string()),
        BootPhase::Ready | BootPhase::Anonymous => {}
    }

    let pulse = match s.health.pulse {
        Pulse::Pending => "..",
        Pulse::Ok => "ok",
        Pulse::Error => "!!",
    };
    parts.push(format!("health {pulse} {}", s.health.headline));
    if !s.assets_loaded {
        parts.push("assets not loaded".to_string());
    }
    if s.maintenance.active {
        parts.push("MAINTENANCE".to_string());
    }
    if let Some(message) = &s.broadcast {
        let tag = match message.severity {
            Severity::Info => "info",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        };
        parts.push(format!("[{tag}] {}", message.text));
    }

    parts.join(" | ")
}

fn render_measurement(result: &MeasurementResult) -> String {
    match result {
        MeasurementResult::Density { standard_density } => {
            format!("density @15C: {standard_density:.1} kg/m3")
        }
        MeasurementResult::Volume {
            tank_name, litres, ..
        } => format!("{tank_name}: {} L", litres.floor()),
        MeasurementResult::Audit(outcome) => format!(
            "standard {:.1} | invoice {:.1} | variance {:+.1} | {}",
            outcome.standard_density,
            outcome.invoice_density,
            outcome.variance,
            if outcome.pass { "PASS" } else { "FAIL" }
        ),
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Suppresses status lines the operator has already seen. The loop
/// republishes after every change, so most repeats are noise, but a new
/// broadcast revision is shown again even when its text is unchanged.
#[derive(Debug, Default)]
struct StatusLine {
    line: String,
    revision: Option<i64>,
}

impl StatusLine {
    fn should_print(&mut self, snapshot: &AppSnapshot, line: &str) -> bool {
        let revision = snapshot.broadcast.as_ref().map(|b| b.revision);
        if line == self.line && revision == self.revision {
            return false;
        }
        self.line = line.to_string();
        self.revision = revision;
        true
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Run the shell until the user quits, stdin closes, or the app loop goes
/// away.
pub async fn run(
    mut ui_rx: mpsc::Receiver<UiUpdate>,
    cmd_tx: mpsc::Sender<UserCommand>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status = StatusLine::default();
    println!("{USAGE}");

    loop {
        tokio::select! {
            update = ui_rx.recv() => {
                let Some(update) = update else {
                    info!("UI channel closed, leaving shell");
                    break;
                };
                let line = render(&update);
                if let UiUpdate::Snapshot(snapshot) = &update {
                    if !status.should_print(snapshot, &line) {
                        continue;
                    }
                }
                println!("{line}");
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    let _ = cmd_tx.send(UserCommand::Quit).await;
                    break;
                };
                match parse_command(&line) {
                    Ok(Some(cmd)) => {
                        debug!("Shell command: {cmd:?}");
                        let quit = cmd == UserCommand::Quit;
                        if cmd == UserCommand::Status {
                            // Always show the answer to an explicit status request.
                            status.reset();
                        }
                        if cmd_tx.send(cmd).await.is_err() || quit {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(message) => println!("{message}\n{USAGE}"),
                }
            }
        }
    }
    Ok(())
}
