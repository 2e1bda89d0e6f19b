use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use color_eyre::{eyre::eyre, Result};
use io_hass_bridge::bridge::{Bridge, BridgeHandle};
use io_hass_bridge::model::{
    AutomationRow, HostSnapshot, ProfileDefinition, ProfileId, RowId, SwitchCommand,
};
use io_hass_bridge::mqtt::RumqttConnector;
use io_hass_bridge::persistence::TomlFileStore;
use io_hass_bridge::HostApp;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const HOST_FILE: &str = "host.toml";

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let host_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| TomlFileStore::config_dir().join(HOST_FILE));
    let snapshot = load_host_file(&host_path).await?;
    info!(
        "Loaded {} rows and {} profiles from {:?}",
        snapshot.rows.len(),
        snapshot.profiles.len(),
        host_path
    );

    let store = TomlFileStore::open(TomlFileStore::default_path())
        .await
        .map_err(|e| eyre!("Failed to open store: {}", e))?;

    let (intent_tx, mut intent_rx) = mpsc::unbounded_channel();
    let host = FileHost {
        snapshot: Arc::new(Mutex::new(snapshot)),
        intents: intent_tx,
    };
    let shared_snapshot = host.snapshot.clone();

    let bridge = Bridge::new(RumqttConnector, store, host)
        .await
        .map_err(|e| eyre!("Failed to initialize bridge: {}", e))?;
    let handle = BridgeHandle::spawn(bridge);

    let mut status = handle.status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            Some(intent) = intent_rx.recv() => {
                apply_intent(intent, &shared_snapshot, &handle).await;
            }
            Ok(()) = status.changed() => {
                let current = status.borrow_and_update().clone();
                if let Some(last) = current.last_error() {
                    warn!("Bridge {:?}, last error: {}", current.connection_state, last);
                }
            }
        }
    }

    handle
        .shutdown()
        .await
        .map_err(|e| eyre!("Bridge shutdown failed: {}", e))?;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Rows and profiles as they sit in `host.toml`
#[derive(Deserialize, Debug, Default)]
struct HostFile {
    #[serde(default)]
    rows: Vec<AutomationRow>,
    #[serde(default)]
    profiles: Vec<ProfileDefinition>,
    #[serde(default)]
    active_profile_id: Option<ProfileId>,
}

async fn load_host_file(path: &Path) -> Result<HostSnapshot> {
    if !tokio::fs::try_exists(path).await? {
        warn!("No host file at {:?}, starting without rows", path);
        return Ok(HostSnapshot::default());
    }
    let content = tokio::fs::read_to_string(path).await?;
    let file: HostFile =
        toml::from_str(&content).map_err(|e| eyre!("Invalid host file {:?}: {}", path, e))?;
    Ok(HostSnapshot {
        rows: file.rows.into_iter().map(|row| (row.id.clone(), row)).collect(),
        profiles: file.profiles,
        active_profile_id: file.active_profile_id,
    })
}

#[derive(Debug)]
enum HostIntent {
    Trigger(RowId, SwitchCommand),
    SwitchProfile(Option<ProfileId>),
}

/// Standalone host: rows come from a file, intents go back to `main`
struct FileHost {
    snapshot: Arc<Mutex<HostSnapshot>>,
    intents: mpsc::UnboundedSender<HostIntent>,
}

impl FileHost {
    fn dispatch(&self, intent: HostIntent) {
        if self.intents.send(intent).is_err() {
            error!("Host intent channel closed");
        }
    }
}

impl HostApp for FileHost {
    fn snapshot(&self) -> HostSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn trigger_row(&self, row_id: &RowId, command: SwitchCommand) {
        self.dispatch(HostIntent::Trigger(row_id.clone(), command));
    }

    fn switch_profile(&self, profile_id: Option<ProfileId>) {
        self.dispatch(HostIntent::SwitchProfile(profile_id));
    }
}

async fn apply_intent(
    intent: HostIntent,
    snapshot: &Arc<Mutex<HostSnapshot>>,
    handle: &BridgeHandle,
) {
    match intent {
        HostIntent::Trigger(row_id, command) => {
            info!("Row {} triggered: {}", row_id, command);
        }
        HostIntent::SwitchProfile(profile_id) => {
            let info = {
                let mut snapshot = snapshot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                snapshot.active_profile_id = profile_id;
                snapshot.active_profile_info()
            };
            info!("Active profile is now {:?}", info.id);
            if let Err(e) = handle.on_active_profile_changed(info).await {
                error!("Bridge rejected profile change: {}", e);
            }
        }
    }
}
