// Forecourt station client entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file, not terminal)
// 2. Load config
// 3. Open the session store
// 4. Build the Supabase remote
// 5. Create mpsc channels and the application state
// 6. Spawn app logic task
// 7. Run the shell until the user quits
// 8. Cleanup on exit

mod console;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use forecourt_core::app;
use forecourt_core::config;
use forecourt_core::remote::RemoteStore;
use forecourt_core::store::SessionStore;
use forecourt_supabase::SupabaseRemote;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing (log to file, not terminal)
    init_tracing()?;
    info!("Forecourt starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: remote={}, timeout={:?}",
        config.remote.url, config.remote.request_timeout
    );

    // 3. Open the session store
    if let Some(parent) = config.storage_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let storage_path = config.storage_path.to_string_lossy().to_string();
    let store = Arc::new(SessionStore::open(&storage_path).context("failed to open session store")?);
    info!("Session store opened at {storage_path}");

    // 4. Build the Supabase remote
    let remote: Arc<dyn RemoteStore> =
        Arc::new(SupabaseRemote::from_config(&config).context("failed to build remote client")?);

    // 5. Create mpsc channels and the application state
    let (sync_tx, sync_rx) = mpsc::channel(256);
    let (settings_tx, settings_rx) = mpsc::channel(64);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (ui_tx, ui_rx) = mpsc::channel(256);

    let app_state = app::AppState::new(config, store, remote, sync_tx, settings_tx);

    // 6. Spawn app logic task
    let app_handle = tokio::spawn(async move {
        if let Err(e) = app::run(cmd_rx, sync_rx, settings_rx, ui_tx, app_state).await {
            error!("Application loop error: {}", e);
        }
    });

    // 7. Run the shell (blocks until quit or end of input)
    if let Err(e) = console::run(ui_rx, cmd_tx).await {
        error!("Shell error: {}", e);
    }

    // 8. Cleanup: wait for app task to finish (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = app_handle.await;
    })
    .await;

    info!("Forecourt shut down cleanly");
    Ok(())
}

/// Initialize tracing to log to a file (stdout belongs to the shell).
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("forecourt.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("forecourt=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
