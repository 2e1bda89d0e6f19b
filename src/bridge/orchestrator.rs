//! The bridge state owner
//!
//! [`Bridge`] holds every piece of mutable state: config, connection handle,
//! assumed registry, active-profile cache and the `ha_registered` flag. It is
//! driven from exactly one task (see [`super::worker`]), so none of it needs
//! locking.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::status::BridgeStatus;
use crate::config::{ConfigChange, ConfigPatch, ExposureConfig};
use crate::discovery::topic::resolve_exposed_row;
use crate::discovery::{
    compute_device_descriptor, publish_selector_state, register_entity,
    register_profile_selector_entity, resolve_selection, unregister_entity,
    unregister_profile_selector_entity, CommandTopic, DeviceDescriptor, ProfileSelection,
};
use crate::error::{BridgeError, Result};
use crate::host::HostApp;
use crate::model::{ActiveProfileInfo, RowId, SwitchCommand};
use crate::mqtt::{ConnectionEvent, ConnectionState, Connector, MqttLink, MqttMessage, OfflineLink};
use crate::persistence::{self, KeyValueStore};
use crate::reconcile::{is_desired, reconcile, AssumedRegistry, ReconcileSummary};

/// Pause between clearing retained topics and ending the session
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

pub struct Bridge<C: Connector, S: KeyValueStore, H: HostApp> {
    connector: C,
    store: S,
    host: H,
    config: ExposureConfig,
    link: Option<C::Link>,
    events_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    connection_state: ConnectionState,
    registry: AssumedRegistry,
    active_profile: ActiveProfileInfo,
    ha_registered: bool,
    status: BridgeStatus,
    status_tx: watch::Sender<BridgeStatus>,
    disconnect_grace: Duration,
}

fn as_link<L: MqttLink>(link: &Option<L>) -> &dyn MqttLink {
    match link {
        Some(link) => link,
        None => &OfflineLink,
    }
}

/// Unregisters every tracked row and the selector under `config`'s prefix
fn teardown(link: &dyn MqttLink, registry: &mut AssumedRegistry, config: &ExposureConfig) -> usize {
    let rows = registry.drain();
    for row_id in &rows {
        unregister_entity(row_id, config, link);
    }
    unregister_profile_selector_entity(config, link);
    info!("Tore down {} row entities and the profile selector", rows.len());
    rows.len()
}

impl<C: Connector, S: KeyValueStore, H: HostApp> Bridge<C, S, H> {
    /// Loads config and the registered flag; broker state is unknown until the
    /// first `Connected` event
    pub async fn new(connector: C, store: S, host: H) -> Result<Self> {
        let config = persistence::load_config(&store).await?;
        let ha_registered = persistence::load_registered_flag(&store).await?;
        let active_profile = host.snapshot().active_profile_info();
        let status = BridgeStatus {
            ha_registered,
            ..Default::default()
        };
        let (status_tx, _) = watch::channel(status.clone());

        info!(
            "Bridge initialized (enabled: {}, registered: {}, {} rows on the exposure list)",
            config.enabled,
            ha_registered,
            config.exposed_row_ids.len()
        );

        Ok(Self {
            connector,
            store,
            host,
            config,
            link: None,
            events_rx: None,
            connection_state: ConnectionState::Disconnected,
            registry: AssumedRegistry::new(),
            active_profile,
            ha_registered,
            status,
            status_tx,
            disconnect_grace: DISCONNECT_GRACE,
        })
    }

    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    pub fn config(&self) -> &ExposureConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn is_registered(&self) -> bool {
        self.ha_registered
    }

    pub fn registered_rows(&self) -> &BTreeSet<RowId> {
        self.registry.rows()
    }

    pub fn active_profile(&self) -> &ActiveProfileInfo {
        &self.active_profile
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BridgeStatus> {
        self.status_tx.subscribe()
    }

    fn is_live(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_connected())
    }

    fn device(&self) -> Result<DeviceDescriptor> {
        compute_device_descriptor(&self.config)
            .ok_or_else(|| BridgeError::ConfigInvalid("ioInstanceId is not set".into()))
    }

    fn publish_status(&mut self) {
        self.status.connection_state = self.connection_state;
        self.status.ha_registered = self.ha_registered;
        self.status.registered_entities = self.registry.len();
        self.status_tx.send_replace(self.status.clone());
    }

    fn record_error(&mut self, error: &BridgeError) {
        self.status.push_error(error.to_string());
        self.publish_status();
    }

    fn end_connection(&mut self) {
        if let Some(link) = self.link.take() {
            self.connector.disconnect(link);
        }
        self.events_rx = None;
        let dropped = self.registry.drain();
        if !dropped.is_empty() {
            debug!("Forgot {} assumed registrations", dropped.len());
        }
        self.connection_state = ConnectionState::Disconnected;
    }

    /// Starts a new connection, replacing any existing one
    pub fn connect(&mut self) -> Result<()> {
        if let Err(e) = self.config.validate() {
            warn!("Connect refused: {}", e);
            self.record_error(&e);
            return Err(e);
        }
        if self.link.is_some() {
            self.end_connection();
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.events_rx = Some(events_rx);
        match self.connector.connect(&self.config, events_tx) {
            Ok(link) => {
                self.link = Some(link);
                self.connection_state = ConnectionState::Connecting;
                self.publish_status();
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Removes published entities when registered, then ends the connection
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.link.is_none() {
            debug!("Disconnect requested without a connection");
            return Ok(());
        }
        if self.ha_registered && self.is_live() {
            teardown(as_link(&self.link), &mut self.registry, &self.config);
            tokio::time::sleep(self.disconnect_grace).await;
        }
        self.end_connection();
        self.publish_status();
        info!("Disconnected from broker");
        Ok(())
    }

    /// Ends the connection but leaves retained entities for the next start
    pub fn shutdown(&mut self) {
        self.end_connection();
        self.publish_status();
        info!("Bridge shut down");
    }

    /// Registers the selector and all desired rows; deferred until the next
    /// `Connected` event when offline
    pub async fn register_device(&mut self) -> Result<ReconcileSummary> {
        self.config.validate()?;
        self.device()?;

        if !self.ha_registered {
            persistence::save_registered_flag(&self.store, true).await?;
            self.ha_registered = true;
        }
        if !self.is_live() {
            info!("Not connected, device registration deferred until connect");
            self.publish_status();
            return Ok(ReconcileSummary::default());
        }
        self.publish_device_entities()
    }

    /// Removes every tracked entity and clears the registered flag
    pub async fn unregister_device(&mut self) -> Result<usize> {
        self.config.validate()?;
        let removed = teardown(as_link(&self.link), &mut self.registry, &self.config);
        persistence::save_registered_flag(&self.store, false).await?;
        self.ha_registered = false;
        self.publish_status();
        Ok(removed)
    }

    /// Adds a row to the exposure list and publishes it when it is desired
    /// right now; returns whether its discovery config went out
    pub async fn expose_row(&mut self, row_id: RowId) -> Result<bool> {
        self.config.validate()?;
        if !self.config.exposed_row_ids.contains(&row_id) {
            let mut next = self.config.clone();
            next.exposed_row_ids.insert(row_id.clone());
            persistence::save_config(&self.store, &next).await?;
            self.config = next;
        }

        if !(self.ha_registered && self.is_live()) {
            debug!("Row {} exposed, publish waits for registration", row_id);
            return Ok(false);
        }
        let snapshot = self.host.snapshot();
        if !is_desired(&row_id, &self.active_profile, &snapshot.rows, &self.config) {
            debug!("Row {} exposed but not part of the active profile", row_id);
            return Ok(false);
        }
        let Some(row) = snapshot.rows.get(&row_id) else {
            return Ok(false);
        };

        let device = self.device()?;
        let published = register_entity(row, &self.config, &device, as_link(&self.link));
        self.registry.insert(row_id);
        self.publish_status();
        Ok(published)
    }

    /// Drops a row from the exposure list and unpublishes it
    pub async fn unexpose_row(&mut self, row_id: &RowId) -> Result<bool> {
        self.config.validate()?;
        if self.config.exposed_row_ids.contains(row_id) {
            let mut next = self.config.clone();
            next.exposed_row_ids.remove(row_id);
            persistence::save_config(&self.store, &next).await?;
            self.config = next;
        }

        self.registry.remove(row_id);
        let removed = unregister_entity(row_id, &self.config, as_link(&self.link));
        self.publish_status();
        Ok(removed)
    }

    /// Merges `patch` into the config and persists it
    ///
    /// Broker identity changes and enable flips tear down under the old config,
    /// end the connection and reconnect when still enabled.
    ///
    /// A patch that leaves the bridge enabled with a missing host or instance id
    /// is rejected with `ConfigInvalid` and nothing is applied or saved.
    /// Disabled configs may stay incomplete.
    pub async fn update_config(&mut self, patch: ConfigPatch) -> Result<ConfigChange> {
        let mut next = self.config.clone();
        let change = next.apply(patch);
        if next.enabled {
            if let Err(e) = next.validate() {
                warn!("Config update rejected: {}", e);
                self.record_error(&e);
                return Err(e);
            }
        }
        persistence::save_config(&self.store, &next).await?;
        let previous = std::mem::replace(&mut self.config, next);

        if change.requires_reconnect() {
            info!("Connection settings changed, reconnecting");
            if self.link.is_some() {
                if self.ha_registered && self.is_live() {
                    teardown(as_link(&self.link), &mut self.registry, &previous);
                    tokio::time::sleep(self.disconnect_grace).await;
                }
                self.end_connection();
            }
            if self.config.enabled {
                self.connect()?;
            }
        } else if self.ha_registered && self.is_live() {
            if change.device_changed {
                // same topics, new payloads: republish everything
                self.registry.drain();
                self.publish_device_entities()?;
            } else if change.exposure_changed {
                self.reconcile_now()?;
            }
        }

        self.publish_status();
        Ok(change)
    }

    /// Caches the new selection and re-reconciles when registered and live
    pub fn on_active_profile_changed(&mut self, info: ActiveProfileInfo) -> Result<()> {
        let previous = std::mem::replace(&mut self.active_profile, info);
        if !(self.ha_registered && self.is_live()) {
            return Ok(());
        }

        self.reconcile_now()?;
        if previous.id != self.active_profile.id {
            let snapshot = self.host.snapshot();
            publish_selector_state(
                self.active_profile.id.as_ref(),
                &snapshot.profiles,
                &self.config,
                as_link(&self.link),
            );
        }
        Ok(())
    }

    /// Republishes discovery configs after row or profile edits
    ///
    /// Reconciles first, then republishes every row that was already in place
    /// and the selector with a fresh options list.
    pub fn refresh_entities(&mut self) -> Result<ReconcileSummary> {
        if !(self.ha_registered && self.is_live()) {
            return Ok(ReconcileSummary::default());
        }
        let device = self.device()?;
        let snapshot = self.host.snapshot();
        let link = as_link(&self.link);

        let kept = self.registry.rows().clone();
        let summary = reconcile(
            &self.active_profile,
            &snapshot.rows,
            &self.config,
            &device,
            link,
            &mut self.registry,
        );
        for row_id in kept.intersection(self.registry.rows()) {
            if let Some(row) = snapshot.rows.get(row_id) {
                register_entity(row, &self.config, &device, link);
            }
        }
        register_profile_selector_entity(
            &snapshot.profiles,
            self.active_profile.id.as_ref(),
            &self.config,
            &device,
            link,
        );
        self.publish_status();
        Ok(summary)
    }

    fn reconcile_now(&mut self) -> Result<ReconcileSummary> {
        let device = self.device()?;
        let snapshot = self.host.snapshot();
        let summary = reconcile(
            &self.active_profile,
            &snapshot.rows,
            &self.config,
            &device,
            as_link(&self.link),
            &mut self.registry,
        );
        self.publish_status();
        Ok(summary)
    }

    fn publish_device_entities(&mut self) -> Result<ReconcileSummary> {
        let device = self.device()?;
        let snapshot = self.host.snapshot();
        register_profile_selector_entity(
            &snapshot.profiles,
            self.active_profile.id.as_ref(),
            &self.config,
            &device,
            as_link(&self.link),
        );
        self.reconcile_now()
    }

    /// Waits for the next event of the current connection
    ///
    /// Never resolves while there is no connection, so it can sit in a
    /// `select!` next to the command channel.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        loop {
            match self.events_rx.as_mut() {
                Some(rx) => match rx.recv().await {
                    Some(event) => return event,
                    None => self.events_rx = None,
                },
                None => std::future::pending::<()>().await,
            }
        }
    }

    pub fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                info!("Broker session established");
                self.connection_state = ConnectionState::Connected;
                // retained state may not have survived, start from scratch
                self.registry.drain();
                if self.ha_registered {
                    if let Err(e) = self.publish_device_entities() {
                        warn!("Registration after connect failed: {}", e);
                        self.record_error(&e);
                    }
                }
            }
            ConnectionEvent::Reconnecting => {
                self.connection_state = ConnectionState::Reconnecting;
            }
            ConnectionEvent::Error(message) => {
                warn!("Connection error: {}", message);
                self.status.push_error(BridgeError::Connection(message).to_string());
            }
            ConnectionEvent::Closed => {
                self.connection_state = ConnectionState::Disconnected;
                self.registry.drain();
            }
            ConnectionEvent::Offline => {
                self.connection_state = ConnectionState::Reconnecting;
                self.registry.drain();
            }
            ConnectionEvent::Message(message) => {
                self.status.messages_received += 1;
                self.status.last_activity = Some(message.received_at);
                if let Err(e) = self.route_inbound(&message) {
                    warn!("Inbound message dropped: {}", e);
                    self.status.push_error(e.to_string());
                }
            }
        }
        self.publish_status();
    }

    /// Routes a command topic to the host's trigger or profile-switch entry point
    pub fn route_inbound(&mut self, message: &MqttMessage) -> Result<()> {
        match CommandTopic::parse(&self.config.discovery_prefix, &message.topic) {
            CommandTopic::Switch { sanitized_id } => {
                let Some(row_id) = resolve_exposed_row(&sanitized_id, &self.config.exposed_row_ids)
                else {
                    return Err(BridgeError::ParseFailure {
                        topic: message.topic.clone(),
                        reason: format!("row {sanitized_id} is not exposed"),
                    });
                };
                let command = SwitchCommand::parse(&message.payload).ok_or_else(|| {
                    BridgeError::ParseFailure {
                        topic: message.topic.clone(),
                        reason: format!("unexpected payload {:?}", message.payload),
                    }
                })?;
                info!("Home Assistant switched row {} {}", row_id, command);
                self.host.trigger_row(&row_id, command);
                Ok(())
            }
            CommandTopic::Selector => {
                let snapshot = self.host.snapshot();
                match resolve_selection(&message.payload, &snapshot.profiles) {
                    ProfileSelection::NoProfile => {
                        info!("Home Assistant deactivated profiles");
                        self.host.switch_profile(None);
                        Ok(())
                    }
                    ProfileSelection::Profile(id) => {
                        info!("Home Assistant selected profile {}", id);
                        self.host.switch_profile(Some(id));
                        Ok(())
                    }
                    ProfileSelection::Unknown(name) => {
                        // put the selector back to what is actually active
                        publish_selector_state(
                            self.active_profile.id.as_ref(),
                            &snapshot.profiles,
                            &self.config,
                            as_link(&self.link),
                        );
                        Err(BridgeError::UnknownProfileName(name))
                    }
                }
            }
            CommandTopic::Unknown => Err(BridgeError::ParseFailure {
                topic: message.topic.clone(),
                reason: "not a bridge command topic".into(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fakes for the orchestrator's collaborators

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use crate::config::ExposureConfig;
    use crate::error::Result;
    use crate::host::HostApp;
    use crate::model::{HostSnapshot, ProfileId, RowId, SwitchCommand};
    use crate::mqtt::link::testing::RecordingLink;
    use crate::mqtt::{ConnectionEvent, Connector};

    /// Hands out one shared recording link; connects start offline
    #[derive(Clone)]
    pub struct FakeConnector {
        pub link: RecordingLink,
        pub connects: Arc<AtomicUsize>,
        pub disconnects: Arc<AtomicUsize>,
        pub connected_with: Arc<Mutex<Vec<ExposureConfig>>>,
        pub events: Arc<Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>>,
    }

    impl FakeConnector {
        pub fn new() -> Self {
            Self {
                link: RecordingLink::disconnected(),
                connects: Arc::default(),
                disconnects: Arc::default(),
                connected_with: Arc::default(),
                events: Arc::default(),
            }
        }
    }

    impl Connector for FakeConnector {
        type Link = RecordingLink;

        fn connect(
            &self,
            config: &ExposureConfig,
            events: mpsc::UnboundedSender<ConnectionEvent>,
        ) -> Result<RecordingLink> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected_with.lock().unwrap().push(config.clone());
            *self.events.lock().unwrap() = Some(events);
            Ok(self.link.clone())
        }

        fn disconnect(&self, link: RecordingLink) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            link.set_connected(false);
        }
    }

    #[derive(Clone, Default)]
    pub struct FakeHost {
        pub snapshot: Arc<Mutex<HostSnapshot>>,
        pub triggers: Arc<Mutex<Vec<(RowId, SwitchCommand)>>>,
        pub switches: Arc<Mutex<Vec<Option<ProfileId>>>>,
    }

    impl HostApp for FakeHost {
        fn snapshot(&self) -> HostSnapshot {
            self.snapshot.lock().unwrap().clone()
        }

        fn trigger_row(&self, row_id: &RowId, command: SwitchCommand) {
            self.triggers.lock().unwrap().push((row_id.clone(), command));
        }

        fn switch_profile(&self, profile_id: Option<ProfileId>) {
            self.switches.lock().unwrap().push(profile_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeConnector, FakeHost};
    use super::*;
    use crate::model::{AutomationRow, HostSnapshot, ProfileDefinition, ProfileId};
    use crate::mqtt::link::testing::Op;
    use crate::persistence::{MemoryStore, CONFIG_KEY, REGISTERED_KEY};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    type TestBridge = Bridge<FakeConnector, MemoryStore, FakeHost>;

    const NO_PROFILE: &str = crate::discovery::selector::NO_PROFILE_OPTION;

    fn ids(list: &[&str]) -> BTreeSet<RowId> {
        list.iter().map(|id| RowId::from(*id)).collect()
    }

    fn snapshot(rows: &[&str], profiles: Vec<ProfileDefinition>) -> HostSnapshot {
        let rows: HashMap<RowId, AutomationRow> = rows
            .iter()
            .map(|id| {
                let row = AutomationRow {
                    id: RowId::from(*id),
                    input: Default::default(),
                    output: Default::default(),
                    enabled: true,
                };
                (row.id.clone(), row)
            })
            .collect();
        HostSnapshot {
            rows,
            profiles,
            active_profile_id: None,
        }
    }

    fn profile(id: &str, name: &str, rows: &[&str]) -> ProfileDefinition {
        ProfileDefinition {
            id: ProfileId::from(id),
            name: name.into(),
            icon: None,
            included_row_ids: rows.iter().map(|r| RowId::from(*r)).collect(),
        }
    }

    fn stored_config(exposed: &[&str]) -> String {
        let config = ExposureConfig {
            enabled: true,
            mqtt_host: Some("broker".into()),
            io_instance_id: Some("abc".into()),
            exposed_row_ids: ids(exposed),
            ..Default::default()
        };
        serde_json::to_string(&config).unwrap()
    }

    async fn bridge_with(
        exposed: &[&str],
        registered: bool,
        host_snapshot: HostSnapshot,
    ) -> (TestBridge, FakeConnector, FakeHost) {
        let store = MemoryStore::with_entries([
            (CONFIG_KEY.to_string(), stored_config(exposed)),
            (REGISTERED_KEY.to_string(), registered.to_string()),
        ]);
        let connector = FakeConnector::new();
        let host = FakeHost::default();
        *host.snapshot.lock().unwrap() = host_snapshot;
        let bridge = Bridge::new(connector.clone(), store, host.clone())
            .await
            .unwrap()
            .with_disconnect_grace(Duration::ZERO);
        (bridge, connector, host)
    }

    fn go_online(bridge: &mut TestBridge, connector: &FakeConnector) {
        bridge.connect().unwrap();
        connector.link.set_connected(true);
        bridge.handle_connection_event(ConnectionEvent::Connected);
    }

    fn config_publishes(ops: &[Op]) -> Vec<(String, bool)> {
        ops.iter()
            .filter_map(|op| match op {
                Op::Publish { topic, payload, .. } if topic.ends_with("/config") => {
                    Some((topic.clone(), !payload.is_empty()))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn connect_registers_everything_when_flag_is_set() {
        let (mut bridge, connector, _) =
            bridge_with(&["A", "B"], true, snapshot(&["A", "B", "C"], vec![])).await;
        go_online(&mut bridge, &connector);

        assert_eq!(bridge.registered_rows(), &ids(&["A", "B"]));
        let published = config_publishes(&connector.link.take());
        assert_eq!(
            published,
            vec![
                ("homeassistant/select/io_profile_selector/config".to_string(), true),
                ("homeassistant/switch/io_row_A/config".to_string(), true),
                ("homeassistant/switch/io_row_B/config".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn connect_without_flag_publishes_nothing() {
        let (mut bridge, connector, _) =
            bridge_with(&["A"], false, snapshot(&["A"], vec![])).await;
        go_online(&mut bridge, &connector);
        assert!(bridge.registered_rows().is_empty());
        assert!(connector.link.take().is_empty());
    }

    #[tokio::test]
    async fn missing_host_short_circuits_operations() {
        let store = MemoryStore::default();
        let connector = FakeConnector::new();
        let mut bridge = Bridge::new(connector.clone(), store, FakeHost::default())
            .await
            .unwrap();

        assert!(matches!(bridge.connect(), Err(BridgeError::ConfigInvalid(_))));
        assert!(matches!(
            bridge.register_device().await,
            Err(BridgeError::ConfigInvalid(_))
        ));
        assert!(matches!(
            bridge.expose_row(RowId::from("A")).await,
            Err(BridgeError::ConfigInvalid(_))
        ));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert!(bridge.subscribe_status().borrow().last_error().is_some());
    }

    #[tokio::test]
    async fn register_device_persists_flag_and_publishes() {
        let (mut bridge, connector, _) =
            bridge_with(&["A"], false, snapshot(&["A"], vec![])).await;
        go_online(&mut bridge, &connector);

        let summary = bridge.register_device().await.unwrap();
        assert_eq!(summary.registered, 1);
        assert!(bridge.is_registered());
        assert_eq!(
            bridge.store.get(REGISTERED_KEY).await.unwrap().as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn register_device_while_offline_is_deferred() {
        let (mut bridge, connector, _) =
            bridge_with(&["A"], false, snapshot(&["A"], vec![])).await;
        bridge.connect().unwrap();

        let summary = bridge.register_device().await.unwrap();
        assert_eq!(summary, ReconcileSummary::default());
        assert!(bridge.registered_rows().is_empty());

        connector.link.set_connected(true);
        bridge.handle_connection_event(ConnectionEvent::Connected);
        assert_eq!(bridge.registered_rows(), &ids(&["A"]));
    }

    #[tokio::test]
    async fn unregister_device_clears_everything() {
        let (mut bridge, connector, _) =
            bridge_with(&["A", "B"], true, snapshot(&["A", "B"], vec![])).await;
        go_online(&mut bridge, &connector);
        connector.link.take();

        assert_eq!(bridge.unregister_device().await.unwrap(), 2);
        assert!(!bridge.is_registered());
        assert!(bridge.registered_rows().is_empty());
        let cleared = config_publishes(&connector.link.take());
        assert_eq!(cleared.len(), 3);
        assert!(cleared.iter().all(|(_, has_payload)| !has_payload));
    }

    #[tokio::test]
    async fn profile_change_reconciles_and_publishes_selector_state() {
        let profiles = vec![profile("p1", "Work", &["B"])];
        let (mut bridge, connector, _) =
            bridge_with(&["A", "B"], true, snapshot(&["A", "B"], profiles.clone())).await;
        go_online(&mut bridge, &connector);
        connector.link.take();

        bridge
            .on_active_profile_changed(ActiveProfileInfo::from_profile(&profiles[0]))
            .unwrap();
        assert_eq!(bridge.registered_rows(), &ids(&["B"]));
        assert_eq!(
            connector
                .link
                .publishes_to("homeassistant/select/io_profile_selector/state"),
            vec!["Work".to_string()]
        );
        assert_eq!(
            connector.link.publishes_to("homeassistant/switch/io_row_A/config"),
            vec![String::new()]
        );

        // same profile again: nothing to do, no selector state
        connector.link.take();
        bridge
            .on_active_profile_changed(ActiveProfileInfo::from_profile(&profiles[0]))
            .unwrap();
        assert!(connector.link.take().is_empty());
    }

    #[tokio::test]
    async fn profile_change_while_offline_only_updates_cache() {
        let profiles = vec![profile("p1", "Work", &["B"])];
        let (mut bridge, connector, _) =
            bridge_with(&["A", "B"], true, snapshot(&["A", "B"], profiles.clone())).await;

        bridge
            .on_active_profile_changed(ActiveProfileInfo::from_profile(&profiles[0]))
            .unwrap();
        assert_eq!(bridge.active_profile().id, Some(ProfileId::from("p1")));
        assert!(connector.link.take().is_empty());

        go_online(&mut bridge, &connector);
        assert_eq!(bridge.registered_rows(), &ids(&["B"]));
    }

    #[tokio::test]
    async fn expose_and_unexpose_single_rows() {
        let (mut bridge, connector, _) =
            bridge_with(&[], true, snapshot(&["A", "B"], vec![])).await;
        go_online(&mut bridge, &connector);
        connector.link.take();

        assert!(bridge.expose_row(RowId::from("A")).await.unwrap());
        assert_eq!(bridge.registered_rows(), &ids(&["A"]));
        assert!(bridge.config().exposed_row_ids.contains(&RowId::from("A")));

        // rows the host does not know are remembered but not published
        assert!(!bridge.expose_row(RowId::from("Z")).await.unwrap());
        assert_eq!(bridge.registered_rows(), &ids(&["A"]));

        assert!(bridge.unexpose_row(&RowId::from("A")).await.unwrap());
        assert!(bridge.registered_rows().is_empty());
        assert!(!bridge.config().exposed_row_ids.contains(&RowId::from("A")));
        assert_eq!(
            connector.link.publishes_to("homeassistant/switch/io_row_A/config").last(),
            Some(&String::new())
        );
    }

    #[tokio::test]
    async fn exposing_twice_is_idempotent() {
        let (mut bridge, connector, _) = bridge_with(&[], true, snapshot(&["A"], vec![])).await;
        go_online(&mut bridge, &connector);
        connector.link.take();

        bridge.expose_row(RowId::from("A")).await.unwrap();
        bridge.expose_row(RowId::from("A")).await.unwrap();
        assert_eq!(bridge.registered_rows(), &ids(&["A"]));

        let payloads = connector.link.publishes_to("homeassistant/switch/io_row_A/config");
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0], payloads[1]);
    }

    #[tokio::test]
    async fn exposure_update_reconciles_without_reconnect() {
        let (mut bridge, connector, _) =
            bridge_with(&["A"], true, snapshot(&["A", "B"], vec![])).await;
        go_online(&mut bridge, &connector);

        let change = bridge
            .update_config(ConfigPatch {
                exposed_row_ids: Some(ids(&["B"])),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(change.exposure_changed);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.registered_rows(), &ids(&["B"]));
    }

    #[tokio::test]
    async fn connection_change_unregisters_under_old_prefix_then_reconnects() {
        let (mut bridge, connector, _) =
            bridge_with(&["A"], true, snapshot(&["A"], vec![])).await;
        go_online(&mut bridge, &connector);
        connector.link.take();

        bridge
            .update_config(ConfigPatch {
                discovery_prefix: Some("ha2".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let cleared = config_publishes(&connector.link.take());
        assert_eq!(
            cleared,
            vec![
                ("homeassistant/switch/io_row_A/config".to_string(), false),
                ("homeassistant/select/io_profile_selector/config".to_string(), false),
            ]
        );
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(
            connector.connected_with.lock().unwrap().last().map(|c| c.discovery_prefix.clone()),
            Some("ha2".to_string())
        );
        assert_eq!(bridge.connection_state(), ConnectionState::Connecting);

        connector.link.set_connected(true);
        bridge.handle_connection_event(ConnectionEvent::Connected);
        assert_eq!(
            config_publishes(&connector.link.take()),
            vec![
                ("ha2/select/io_profile_selector/config".to_string(), true),
                ("ha2/switch/io_row_A/config".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn enabling_an_incomplete_config_is_rejected_unsaved() {
        let store = MemoryStore::default();
        let mut bridge = Bridge::new(FakeConnector::new(), store, FakeHost::default())
            .await
            .unwrap();

        let err = bridge
            .update_config(ConfigPatch {
                enabled: Some(true),
                io_instance_id: Some(Some("abc".into())),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConfigInvalid(_)));
        assert_eq!(bridge.config(), &ExposureConfig::default());
        assert_eq!(bridge.store.get(CONFIG_KEY).await.unwrap(), None);

        // incomplete but disabled is fine
        bridge
            .update_config(ConfigPatch {
                io_instance_id: Some(Some("abc".into())),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(bridge.config().instance_id(), Some("abc"));
        assert!(bridge.store.get(CONFIG_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clearing_the_host_of_an_enabled_bridge_is_rejected() {
        let (mut bridge, connector, _) =
            bridge_with(&["A"], true, snapshot(&["A"], vec![])).await;
        go_online(&mut bridge, &connector);

        let err = bridge
            .update_config(ConfigPatch {
                mqtt_host: Some(None),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConfigInvalid(_)));
        assert_eq!(bridge.config().host(), Some("broker"));
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.registered_rows(), &ids(&["A"]));
    }

    #[tokio::test]
    async fn disabling_disconnects_without_reconnect() {
        let (mut bridge, connector, _) =
            bridge_with(&["A"], true, snapshot(&["A"], vec![])).await;
        go_online(&mut bridge, &connector);

        bridge
            .update_config(ConfigPatch {
                enabled: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.connection_state(), ConnectionState::Disconnected);
        assert!(bridge.is_registered());
    }

    #[tokio::test]
    async fn disconnect_tears_down_and_clears_registry() {
        let (mut bridge, connector, _) =
            bridge_with(&["A"], true, snapshot(&["A"], vec![])).await;
        go_online(&mut bridge, &connector);
        connector.link.take();

        bridge.disconnect().await.unwrap();
        assert_eq!(config_publishes(&connector.link.take()).len(), 2);
        assert!(bridge.registered_rows().is_empty());
        assert_eq!(bridge.connection_state(), ConnectionState::Disconnected);

        // idempotent without a handle
        bridge.disconnect().await.unwrap();
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnect_runs_full_registration_again() {
        let (mut bridge, connector, _) =
            bridge_with(&["A"], true, snapshot(&["A"], vec![])).await;
        go_online(&mut bridge, &connector);

        connector.link.set_connected(false);
        bridge.handle_connection_event(ConnectionEvent::Closed);
        bridge.handle_connection_event(ConnectionEvent::Offline);
        assert!(bridge.registered_rows().is_empty());
        assert_eq!(bridge.connection_state(), ConnectionState::Reconnecting);
        connector.link.take();

        connector.link.set_connected(true);
        bridge.handle_connection_event(ConnectionEvent::Connected);
        assert_eq!(bridge.registered_rows(), &ids(&["A"]));
        assert_eq!(
            connector.link.publishes_to("homeassistant/switch/io_row_A/config").len(),
            1
        );
    }

    #[tokio::test]
    async fn switch_command_is_forwarded_only_for_exposed_rows() {
        let (mut bridge, connector, host) =
            bridge_with(&["io-1234"], true, snapshot(&["io-1234", "io-9"], vec![])).await;
        go_online(&mut bridge, &connector);

        bridge.handle_connection_event(ConnectionEvent::Message(MqttMessage::new(
            "homeassistant/switch/io_row_io_1234/set",
            "ON",
        )));
        bridge.handle_connection_event(ConnectionEvent::Message(MqttMessage::new(
            "homeassistant/switch/io_row_io_9/set",
            "ON",
        )));
        assert_eq!(
            host.triggers.lock().unwrap().clone(),
            vec![(RowId::from("io-1234"), SwitchCommand::On)]
        );

        let err = bridge
            .route_inbound(&MqttMessage::new(
                "homeassistant/switch/io_row_io_1234/set",
                "TOGGLE",
            ))
            .unwrap_err();
        assert!(matches!(err, BridgeError::ParseFailure { .. }));
        assert_eq!(bridge.subscribe_status().borrow().messages_received, 2);
    }

    #[tokio::test]
    async fn selector_command_switches_profiles() {
        let profiles = vec![profile("p1", "Work", &["A"])];
        let (mut bridge, connector, host) =
            bridge_with(&["A"], true, snapshot(&["A"], profiles)).await;
        go_online(&mut bridge, &connector);

        let topic = "homeassistant/select/io_profile_selector/set";
        bridge.route_inbound(&MqttMessage::new(topic, "Work")).unwrap();
        bridge
            .route_inbound(&MqttMessage::new(topic, NO_PROFILE))
            .unwrap();
        assert_eq!(
            host.switches.lock().unwrap().clone(),
            vec![Some(ProfileId::from("p1")), None]
        );
    }

    #[tokio::test]
    async fn unknown_profile_name_self_heals_selector_state() {
        let profiles = vec![profile("p1", "Work", &["A"])];
        let (mut bridge, connector, host) =
            bridge_with(&["A"], true, snapshot(&["A"], profiles)).await;
        go_online(&mut bridge, &connector);
        connector.link.take();

        let err = bridge
            .route_inbound(&MqttMessage::new(
                "homeassistant/select/io_profile_selector/set",
                "Vanished",
            ))
            .unwrap_err();
        assert_eq!(err, BridgeError::UnknownProfileName("Vanished".into()));
        assert!(host.switches.lock().unwrap().is_empty());
        assert_eq!(
            connector
                .link
                .publishes_to("homeassistant/select/io_profile_selector/state"),
            vec![NO_PROFILE.to_string()]
        );
    }

    #[tokio::test]
    async fn refresh_republishes_kept_rows_and_drops_deleted_ones() {
        let (mut bridge, connector, host) =
            bridge_with(&["A", "B"], true, snapshot(&["A", "B"], vec![])).await;
        go_online(&mut bridge, &connector);
        connector.link.take();

        *host.snapshot.lock().unwrap() = snapshot(&["A"], vec![profile("p1", "New", &[])]);
        let summary = bridge.refresh_entities().unwrap();
        assert_eq!(summary.unregistered, 1);
        assert_eq!(bridge.registered_rows(), &ids(&["A"]));

        let ops = connector.link.take();
        let published = config_publishes(&ops);
        assert!(published.contains(&("homeassistant/switch/io_row_B/config".to_string(), false)));
        assert!(published.contains(&("homeassistant/switch/io_row_A/config".to_string(), true)));
        let selector = ops.iter().find_map(|op| match op {
            Op::Publish { topic, payload, .. }
                if topic == "homeassistant/select/io_profile_selector/config" =>
            {
                Some(payload.clone())
            }
            _ => None,
        });
        assert!(selector.is_some_and(|p| p.contains("\"New\"")));
    }

    #[tokio::test]
    async fn stale_events_are_dropped_after_reconnect() {
        let (mut bridge, connector, _) =
            bridge_with(&["A"], false, snapshot(&["A"], vec![])).await;
        bridge.connect().unwrap();
        let old_sender = connector.events.lock().unwrap().clone().unwrap();

        bridge.connect().unwrap();
        assert!(old_sender.send(ConnectionEvent::Connected).is_err());

        let new_sender = connector.events.lock().unwrap().clone().unwrap();
        new_sender.send(ConnectionEvent::Reconnecting).unwrap();
        assert_eq!(bridge.next_event().await, ConnectionEvent::Reconnecting);
    }
}
