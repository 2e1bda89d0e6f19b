use std::collections::BTreeSet;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::orchestrator::Bridge;
use super::status::BridgeStatus;
use crate::config::{ConfigChange, ConfigPatch, ExposureConfig};
use crate::error::{BridgeError, Result};
use crate::host::HostApp;
use crate::model::{ActiveProfileInfo, RowId};
use crate::mqtt::Connector;
use crate::persistence::KeyValueStore;
use crate::reconcile::ReconcileSummary;

const COMMAND_BUFFER: usize = 32;

macro_rules! handle_action {
    ($action:expr, $response_tx:expr) => {
        if $response_tx.send($action).is_err() {
            warn!("Bridge caller went away before the response");
        }
    };
}

/// Requests served by the bridge task
#[derive(Debug)]
pub enum BridgeCommand {
    Connect {
        response_tx: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        response_tx: oneshot::Sender<Result<()>>,
    },
    RegisterDevice {
        response_tx: oneshot::Sender<Result<ReconcileSummary>>,
    },
    UnregisterDevice {
        response_tx: oneshot::Sender<Result<usize>>,
    },
    ExposeRow {
        row_id: RowId,
        response_tx: oneshot::Sender<Result<bool>>,
    },
    UnexposeRow {
        row_id: RowId,
        response_tx: oneshot::Sender<Result<bool>>,
    },
    UpdateConfig {
        patch: ConfigPatch,
        response_tx: oneshot::Sender<Result<ConfigChange>>,
    },
    ActiveProfileChanged {
        info: ActiveProfileInfo,
        response_tx: oneshot::Sender<Result<()>>,
    },
    RefreshEntities {
        response_tx: oneshot::Sender<Result<ReconcileSummary>>,
    },
    GetConfig {
        response_tx: oneshot::Sender<ExposureConfig>,
    },
    GetRegisteredRows {
        response_tx: oneshot::Sender<BTreeSet<RowId>>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Owner-side handle of a running bridge task
pub struct BridgeHandle {
    tx: mpsc::Sender<BridgeCommand>,
    status_rx: watch::Receiver<BridgeStatus>,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// Moves the bridge onto its own task; connects right away when enabled
    pub fn spawn<C, S, H>(bridge: Bridge<C, S, H>) -> Self
    where
        C: Connector,
        S: KeyValueStore,
        H: HostApp,
    {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let status_rx = bridge.subscribe_status();
        let task = tokio::spawn(run(bridge, rx));
        Self { tx, status_rx, task }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> BridgeCommand,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| BridgeError::ChannelClosed("bridge task is not running".into()))?;
        response_rx
            .await
            .map_err(|_| BridgeError::ChannelClosed("bridge task dropped the request".into()))
    }

    pub async fn connect(&self) -> Result<()> {
        self.request(|response_tx| BridgeCommand::Connect { response_tx })
            .await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|response_tx| BridgeCommand::Disconnect { response_tx })
            .await?
    }

    pub async fn register_device(&self) -> Result<ReconcileSummary> {
        self.request(|response_tx| BridgeCommand::RegisterDevice { response_tx })
            .await?
    }

    pub async fn unregister_device(&self) -> Result<usize> {
        self.request(|response_tx| BridgeCommand::UnregisterDevice { response_tx })
            .await?
    }

    pub async fn expose_row(&self, row_id: RowId) -> Result<bool> {
        self.request(|response_tx| BridgeCommand::ExposeRow {
            row_id,
            response_tx,
        })
        .await?
    }

    pub async fn unexpose_row(&self, row_id: RowId) -> Result<bool> {
        self.request(|response_tx| BridgeCommand::UnexposeRow {
            row_id,
            response_tx,
        })
        .await?
    }

    pub async fn update_config(&self, patch: ConfigPatch) -> Result<ConfigChange> {
        self.request(|response_tx| BridgeCommand::UpdateConfig { patch, response_tx })
            .await?
    }

    pub async fn on_active_profile_changed(&self, info: ActiveProfileInfo) -> Result<()> {
        self.request(|response_tx| BridgeCommand::ActiveProfileChanged { info, response_tx })
            .await?
    }

    pub async fn refresh_entities(&self) -> Result<ReconcileSummary> {
        self.request(|response_tx| BridgeCommand::RefreshEntities { response_tx })
            .await?
    }

    pub async fn config(&self) -> Result<ExposureConfig> {
        self.request(|response_tx| BridgeCommand::GetConfig { response_tx })
            .await
    }

    pub async fn registered_rows(&self) -> Result<BTreeSet<RowId>> {
        self.request(|response_tx| BridgeCommand::GetRegisteredRows { response_tx })
            .await
    }

    /// Latest status plus change notifications
    pub fn status(&self) -> watch::Receiver<BridgeStatus> {
        self.status_rx.clone()
    }

    /// Ends the broker session and waits for the task; retained entities stay
    pub async fn shutdown(self) -> Result<()> {
        self.request(|response_tx| BridgeCommand::Shutdown { response_tx })
            .await?;
        self.task
            .await
            .map_err(|e| BridgeError::ChannelClosed(format!("bridge task failed: {e}")))
    }
}

async fn run<C, S, H>(mut bridge: Bridge<C, S, H>, mut rx: mpsc::Receiver<BridgeCommand>)
where
    C: Connector,
    S: KeyValueStore,
    H: HostApp,
{
    if bridge.config().enabled {
        if let Err(e) = bridge.connect() {
            warn!("Bridge enabled but could not connect: {}", e);
        }
    }

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    debug!("All bridge handles dropped");
                    bridge.shutdown();
                    break;
                };
                if handle_command(&mut bridge, command).await {
                    break;
                }
            }
            event = bridge.next_event() => {
                bridge.handle_connection_event(event);
            }
        }
    }
    info!("Bridge task stopped");
}

/// Returns `true` once the task should stop
async fn handle_command<C, S, H>(bridge: &mut Bridge<C, S, H>, command: BridgeCommand) -> bool
where
    C: Connector,
    S: KeyValueStore,
    H: HostApp,
{
    match command {
        BridgeCommand::Connect { response_tx } => {
            handle_action!(bridge.connect(), response_tx);
        }
        BridgeCommand::Disconnect { response_tx } => {
            handle_action!(bridge.disconnect().await, response_tx);
        }
        BridgeCommand::RegisterDevice { response_tx } => {
            handle_action!(bridge.register_device().await, response_tx);
        }
        BridgeCommand::UnregisterDevice { response_tx } => {
            handle_action!(bridge.unregister_device().await, response_tx);
        }
        BridgeCommand::ExposeRow {
            row_id,
            response_tx,
        } => {
            handle_action!(bridge.expose_row(row_id).await, response_tx);
        }
        BridgeCommand::UnexposeRow {
            row_id,
            response_tx,
        } => {
            handle_action!(bridge.unexpose_row(&row_id).await, response_tx);
        }
        BridgeCommand::UpdateConfig { patch, response_tx } => {
            handle_action!(bridge.update_config(patch).await, response_tx);
        }
        BridgeCommand::ActiveProfileChanged { info, response_tx } => {
            handle_action!(bridge.on_active_profile_changed(info), response_tx);
        }
        BridgeCommand::RefreshEntities { response_tx } => {
            handle_action!(bridge.refresh_entities(), response_tx);
        }
        BridgeCommand::GetConfig { response_tx } => {
            handle_action!(bridge.config().clone(), response_tx);
        }
        BridgeCommand::GetRegisteredRows { response_tx } => {
            handle_action!(bridge.registered_rows().clone(), response_tx);
        }
        BridgeCommand::Shutdown { response_tx } => {
            bridge.shutdown();
            if response_tx.send(()).is_err() {
                error!("Shutdown requested but nobody is waiting for it");
            }
            return true;
        }
    }
    false
}
