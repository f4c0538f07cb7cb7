// Application state and orchestration logic.
//
// The central event loop owns every piece of mutable state: the session
// context, the lookup datasets, health, the realtime attachment and the
// broadcast signals. It multiplexes shell commands, realtime sync events and
// settings pushes, and pushes UI updates to the shell.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::assets::AssetLoader;
use crate::bootstrap::{BootPhase, SessionBootstrapper, SessionContext};
use crate::broadcast::BroadcastController;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::{HealthStatus, SystemHealthProbe};
use crate::measure::LookupDatasets;
use crate::protocol::{AppSnapshot, MeasurementRequest, MeasurementResult, UiUpdate, UserCommand};
use crate::remote::{ChangeEvent, RemoteStore};
use crate::store::SessionStore;
use crate::sync::{RealtimeSync, SyncEvent};
use crate::theme::palette_for;

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    pub config: Config,
    pub ctx: SessionContext,
    /// Tables are merged in per load; a failed fetch keeps the old copy.
    pub datasets: LookupDatasets,
    pub health: HealthStatus,
    pub bootstrapper: SessionBootstrapper,
    pub sync: RealtimeSync,
    pub broadcast: BroadcastController,
    pub loader: AssetLoader,
    pub probe: SystemHealthProbe,
    /// Cloned into the settings forwarder when the broadcast controller
    /// starts.
    settings_tx: mpsc::Sender<ChangeEvent>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<SessionStore>,
        remote: Arc<dyn RemoteStore>,
        sync_tx: mpsc::Sender<SyncEvent>,
        settings_tx: mpsc::Sender<ChangeEvent>,
    ) -> Self {
        let timeout = config.remote.request_timeout;
        let loader = AssetLoader::new(Arc::clone(&remote), timeout);
        let probe = SystemHealthProbe::new(loader.clone(), config.health_settle);

        AppState {
            bootstrapper: SessionBootstrapper::new(
                Arc::clone(&store),
                Arc::clone(&remote),
                timeout,
                config.remember_secret,
            ),
            sync: RealtimeSync::new(Arc::clone(&remote), store, timeout, sync_tx),
            broadcast: BroadcastController::new(remote, timeout),
            loader,
            probe,
            config,
            ctx: SessionContext::default(),
            datasets: LookupDatasets::default(),
            health: HealthStatus::default(),
            settings_tx,
        }
    }

    pub fn build_snapshot(&self) -> AppSnapshot {
        let signals = self.broadcast.signals();
        AppSnapshot {
            phase: self.ctx.phase,
            session: self.ctx.session.clone(),
            station: self.ctx.station.clone(),
            palette: palette_for(self.ctx.station.as_ref().and_then(|s| s.theme.as_deref())),
            assets_loaded: self.datasets.is_complete(),
            broadcast: signals.message.clone(),
            maintenance: signals.maintenance,
            health: self.health.clone(),
            remembered_user_id: self.bootstrapper.remembered_login().map(|r| r.user_id),
        }
    }

    /// Attach realtime sync to the current station, if there is one.
    /// Already being attached to it is a no-op.
    pub async fn attach_current_station(&mut self) {
        let Some(station_id) = self.ctx.station_id().map(str::to_string) else {
            return;
        };
        if self.ctx.station.is_none() {
            return;
        }
        if let Err(e) = self.sync.attach(&station_id).await {
            warn!("Realtime sync unavailable for {station_id}: {e:?}");
        }
    }

    pub async fn reload_assets(&mut self) {
        let fresh = self.loader.load().await;
        self.datasets.merge(fresh);
    }

    /// Run one measurement against the current datasets and snapshot.
    pub fn measure(&self, request: &MeasurementRequest) -> Result<MeasurementResult> {
        match request {
            MeasurementRequest::CorrectDensity {
                observed,
                temperature,
            } => Ok(MeasurementResult::Density {
                standard_density: self.datasets.correct_density(*observed, *temperature)?,
            }),
            MeasurementRequest::DipVolume { tank_id, dip } => {
                let tank = self
                    .ctx
                    .station
                    .as_ref()
                    .and_then(|s| s.tank(tank_id))
                    .ok_or_else(|| Error::UnknownTank(tank_id.clone()))?;
                Ok(MeasurementResult::Volume {
                    tank_id: tank.id.clone(),
                    tank_name: tank.name.clone(),
                    litres: self.datasets.dip_volume(&tank.tank_type, *dip)?,
                })
            }
            MeasurementRequest::AuditInvoice {
                observed,
                temperature,
                invoice,
            } => Ok(MeasurementResult::Audit(self.datasets.audit_invoice(
                *observed,
                *temperature,
                *invoice,
            )?)),
        }
    }
}

async fn send_snapshot(state: &AppState, ui_tx: &mpsc::Sender<UiUpdate>) {
    let snapshot = state.build_snapshot();
    let _ = ui_tx.send(UiUpdate::Snapshot(Box::new(snapshot))).await;
}

/// Run the probe, publishing the pending state before the settle wait and
/// the verdict after it.
async fn run_health_check(state: &mut AppState, force: bool, ui_tx: &mpsc::Sender<UiUpdate>) {
    if !state.probe.begin(&mut state.health, force) {
        debug!("Health already ok, skipping check");
        return;
    }
    send_snapshot(state, ui_tx).await;
    state
        .probe
        .finish(&mut state.health, &mut state.datasets, state.ctx.station.as_ref())
        .await;
    send_snapshot(state, ui_tx).await;
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Startup: hydrate, reconcile (concurrently with the first settings fetch),
/// signal loading finished once, then load assets, attach sync and run the
/// first health check.
async fn startup(state: &mut AppState, ui_tx: &mpsc::Sender<UiUpdate>) {
    let persisted = state.bootstrapper.hydrate(&mut state.ctx);
    if state.ctx.phase == BootPhase::Hydrated {
        send_snapshot(state, ui_tx).await;
    }

    let settings_tx = state.settings_tx.clone();
    match persisted {
        Some(session) => {
            tokio::join!(
                state.bootstrapper.reconcile(&mut state.ctx, session),
                state.broadcast.start(settings_tx),
            );
        }
        None => state.broadcast.start(settings_tx).await,
    }
    info!("Startup reconciliation finished in phase {:?}", state.ctx.phase);

    send_snapshot(state, ui_tx).await;
    let _ = ui_tx.send(UiUpdate::LoadingFinished).await;

    if state.ctx.phase == BootPhase::Ready {
        state.reload_assets().await;
    }
    if state.ctx.station.is_some() {
        state.attach_current_station().await;
        run_health_check(state, false, ui_tx).await;
    }
}

/// Run the main application event loop.
///
/// Listens on three channels using `tokio::select!`:
/// 1. Commands from the shell
/// 2. Realtime station/tank events
/// 3. Settings pushes
///
/// Pushes UI updates through `ui_tx`.
pub async fn run(
    mut cmd_rx: mpsc::Receiver<UserCommand>,
    mut sync_rx: mpsc::Receiver<SyncEvent>,
    mut settings_rx: mpsc::Receiver<ChangeEvent>,
    ui_tx: mpsc::Sender<UiUpdate>,
    mut state: AppState,
) -> anyhow::Result<()> {
    info!("Application event loop started");
    startup(&mut state, &ui_tx).await;

    let mut sync_open = true;
    let mut settings_open = true;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UserCommand::Quit) => {
                        info!("Quit command received, shutting down");
                        break;
                    }
                    Some(cmd) => handle_user_command(&mut state, cmd, &ui_tx).await,
                    None => {
                        info!("Command channel closed, shutting down");
                        break;
                    }
                }
            }

            event = sync_rx.recv(), if sync_open => {
                match event {
                    Some(event) => {
                        if let Some(note) = state.sync.apply(event, &mut state.ctx).await {
                            let _ = ui_tx.send(UiUpdate::Notification(note)).await;
                            send_snapshot(&state, &ui_tx).await;
                        }
                    }
                    None => {
                        info!("Sync channel closed");
                        sync_open = false;
                    }
                }
            }

            change = settings_rx.recv(), if settings_open => {
                match change {
                    Some(change) => {
                        if state.broadcast.handle(change).await {
                            send_snapshot(&state, &ui_tx).await;
                        }
                    }
                    None => {
                        info!("Settings channel closed");
                        settings_open = false;
                    }
                }
            }
        }
    }

    // Cleanup
    state.sync.detach_all();
    state.broadcast.stop();
    info!("Application event loop exiting");
    Ok(())
}

async fn handle_user_command(
    state: &mut AppState,
    cmd: UserCommand,
    ui_tx: &mpsc::Sender<UiUpdate>,
) {
    match cmd {
        UserCommand::Login {
            user_id,
            secret,
            remember,
        } => {
            match state
                .bootstrapper
                .login(&mut state.ctx, &user_id, &secret, remember)
                .await
            {
                Ok(()) => {
                    state.attach_current_station().await;
                    state.reload_assets().await;
                    let _ = ui_tx.send(UiUpdate::LoginSucceeded).await;
                    send_snapshot(state, ui_tx).await;
                    if !state.health.checked {
                        run_health_check(state, false, ui_tx).await;
                    }
                }
                Err(e) => {
                    let _ = ui_tx.send(UiUpdate::LoginFailed(e.to_string())).await;
                }
            }
        }
        UserCommand::Logout => {
            // Subscriptions go before the state they would write to.
            state.sync.detach_all();
            state.bootstrapper.logout(&mut state.ctx);
            state.health = HealthStatus::default();
            send_snapshot(state, ui_tx).await;
        }
        UserCommand::ForgetLogin => {
            state.bootstrapper.forget_login(&mut state.ctx);
            send_snapshot(state, ui_tx).await;
        }
        UserCommand::RunHealthCheck { force } => {
            state.attach_current_station().await;
            run_health_check(state, force, ui_tx).await;
        }
        UserCommand::Measure(request) => {
            let update = match state.measure(&request) {
                Ok(result) => UiUpdate::Measurement(result),
                Err(e) => {
                    debug!("Measurement failed: {e:?}");
                    UiUpdate::MeasurementFailed(e.to_string())
                }
            };
            let _ = ui_tx.send(update).await;
        }
        UserCommand::Status => send_snapshot(state, ui_tx).await,
        UserCommand::Quit => {}
    }
}
