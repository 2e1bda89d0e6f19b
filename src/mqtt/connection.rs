//! Connection manager
//!
//! Owns the rumqttc client and its event loop task. Client events are
//! translated into [`ConnectionEvent`]s and pushed onto a channel supplied by
//! the caller; outbound operations go through the [`MqttLink`] impl on
//! [`MqttConnection`].
//!
//! ```text
//! MqttLink ──[Outbound]──► forwarder task ──► AsyncClient ──► EventLoop task
//!                                                                  │
//!                                caller ◄──[ConnectionEvent]───────┘
//!          CancellationToken (disconnect) stops both tasks
//! ```
//!
//! Link calls only enqueue. The forwarder hands requests to the client in
//! order and waits for room in its request channel, so a large burst of
//! registrations is never cut short while the session is up.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::link::MqttLink;
use super::message::MqttMessage;
use crate::config::ExposureConfig;
use crate::error::{BridgeError, Result};

pub const KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const RECONNECT_PERIOD: Duration = Duration::from_secs(5);
pub const CONNECT_TIMEOUT_SECS: u64 = 10;
const REQUEST_CHANNEL_CAPACITY: usize = 100;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Everything the event loop reports back to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Broker accepted the session
    Connected,
    /// A new connection attempt is about to start
    Reconnecting,
    Error(String),
    /// An established session ended
    Closed,
    /// The client is offline until the next successful attempt
    Offline,
    Message(MqttMessage),
}

/// Client options derived from the exposure config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
}

impl ClientSettings {
    pub fn from_config(config: &ExposureConfig) -> Result<Self> {
        config.validate()?;
        let (Some(raw_host), Some(instance)) = (config.host(), config.instance_id()) else {
            return Err(BridgeError::ConfigInvalid(
                "mqttHost and ioInstanceId are required".into(),
            ));
        };

        let (host, url_port) = split_broker_host(raw_host).ok_or_else(|| {
            BridgeError::ConfigInvalid(format!("Cannot extract a host from {raw_host:?}"))
        })?;

        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let credentials = config
            .username
            .as_ref()
            .filter(|u| !u.is_empty())
            .map(|u| (u.clone(), config.password.clone().unwrap_or_default()));

        Ok(Self {
            host,
            port: url_port.unwrap_or(config.mqtt_port),
            client_id: format!("io-hub-{instance}-{suffix}"),
            credentials,
        })
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(KEEP_ALIVE).set_clean_session(true);
        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user.clone(), password.clone());
        }
        options
    }
}

/// Accepts `broker`, `broker:1883` or `mqtt://broker:1883`
fn split_broker_host(raw: &str) -> Option<(String, Option<u16>)> {
    let raw = raw.trim();
    if raw.contains("://") {
        let url = url::Url::parse(raw).ok()?;
        let host = url.host_str()?.to_string();
        return Some((host, url.port()));
    }
    match raw.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            port.parse().ok().map(|p| (host.to_string(), Some(p)))
        }
        _ => Some((raw.to_string(), None)),
    }
}

/// Request queued by the link for the forwarder task
#[derive(Debug)]
enum Outbound {
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Subscribe(String),
    Unsubscribe(String),
}

impl Outbound {
    fn topic(&self) -> &str {
        match self {
            Outbound::Publish { topic, .. } => topic,
            Outbound::Subscribe(topic) | Outbound::Unsubscribe(topic) => topic,
        }
    }

    async fn send(self, client: &AsyncClient) -> std::result::Result<(), ClientError> {
        match self {
            Outbound::Publish {
                topic,
                payload,
                retain,
            } => client.publish(topic, QoS::AtLeastOnce, retain, payload).await,
            Outbound::Subscribe(topic) => client.subscribe(topic, QoS::AtLeastOnce).await,
            Outbound::Unsubscribe(topic) => client.unsubscribe(topic).await,
        }
    }
}

/// Live connection handle
pub struct MqttConnection {
    client: AsyncClient,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MqttConnection {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Ends the session without waiting for in-flight publishes
    pub fn end(mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("MQTT connection ended");
    }

    fn enqueue(&self, request: Outbound, action: &str) -> bool {
        if !self.is_connected() {
            debug!("Not connected, {} {} skipped", action, request.topic());
            return false;
        }
        match self.outbound.send(request) {
            Ok(()) => true,
            Err(e) => {
                warn!("{} {} failed, forwarder stopped", action, e.0.topic());
                false
            }
        }
    }
}

impl MqttLink for MqttConnection {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn publish(&self, topic: &str, payload: &str, retain: bool) -> bool {
        let request = Outbound::Publish {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            retain,
        };
        self.enqueue(request, "publish to")
    }

    fn subscribe(&self, topic: &str) -> bool {
        self.enqueue(Outbound::Subscribe(topic.to_string()), "subscribe to")
    }

    fn unsubscribe(&self, topic: &str) -> bool {
        self.enqueue(Outbound::Unsubscribe(topic.to_string()), "unsubscribe from")
    }
}

/// Starts a connection and returns immediately
///
/// Missing required fields are reported both as the returned error and as a
/// [`ConnectionEvent::Error`] on `events`. Must be called inside a tokio runtime.
pub fn connect(
    config: &ExposureConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<MqttConnection> {
    start(config, events, RECONNECT_PERIOD)
}

fn start(
    config: &ExposureConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    retry: Duration,
) -> Result<MqttConnection> {
    let settings = match ClientSettings::from_config(config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Cannot connect: {}", e);
            let _ = events.send(ConnectionEvent::Error(e.to_string()));
            return Err(e);
        }
    };

    info!(
        "Connecting to MQTT broker {}:{} as {}",
        settings.host, settings.port, settings.client_id
    );

    let (client, mut eventloop) = AsyncClient::new(settings.mqtt_options(), REQUEST_CHANNEL_CAPACITY);
    eventloop
        .network_options
        .set_connection_timeout(CONNECT_TIMEOUT_SECS);

    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let tasks = vec![
        tokio::spawn(run_event_loop(
            eventloop,
            state_tx,
            events,
            cancel.clone(),
            retry,
        )),
        tokio::spawn(forward_requests(client.clone(), outbound_rx, cancel.clone())),
    ];

    Ok(MqttConnection {
        client,
        outbound: outbound_tx,
        state: state_rx,
        cancel,
        tasks,
    })
}

/// Force-ends a connection; a `None` handle is a no-op
pub fn disconnect(handle: Option<MqttConnection>) {
    if let Some(connection) = handle {
        connection.end();
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
    retry: Duration,
) {
    let emit = |event: ConnectionEvent| {
        if events.send(event).is_err() {
            debug!("Connection event receiver dropped");
        }
    };

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("MQTT connected");
                    state.send_replace(ConnectionState::Connected);
                    emit(ConnectionEvent::Connected);
                } else {
                    warn!("Broker refused connection: {:?}", ack.code);
                    emit(ConnectionEvent::Error(format!("Connection refused: {:?}", ack.code)));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Received message on {}", publish.topic);
                emit(ConnectionEvent::Message(MqttMessage::from_bytes(
                    publish.topic.clone(),
                    &publish.payload,
                )));
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                state.send_replace(ConnectionState::Disconnected);
                emit(ConnectionEvent::Closed);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let previous = state.send_replace(ConnectionState::Reconnecting);
                error!("MQTT connection error: {}", e);
                emit(ConnectionEvent::Error(e.to_string()));
                if previous == ConnectionState::Connected {
                    emit(ConnectionEvent::Closed);
                    emit(ConnectionEvent::Offline);
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry) => {}
                }
                debug!("Retrying MQTT connection");
                emit(ConnectionEvent::Reconnecting);
            }
        }
    }

    state.send_replace(ConnectionState::Disconnected);
    debug!("MQTT event loop stopped");
}

async fn forward_requests(
    client: AsyncClient,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = outbound.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let topic = request.topic().to_string();
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = request.send(&client) => {
                if let Err(e) = sent {
                    warn!("Request for {} not handed to the client: {}", topic, e);
                }
            }
        }
    }
    debug!("MQTT request forwarder stopped");
}

/// Seam between the orchestrator and the transport
pub trait Connector: Send + 'static {
    type Link: MqttLink + Send + 'static;

    fn connect(
        &self,
        config: &ExposureConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self::Link>;

    fn disconnect(&self, link: Self::Link);
}

/// Production connector backed by rumqttc
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttConnector;

impl Connector for RumqttConnector {
    type Link = MqttConnection;

    fn connect(
        &self,
        config: &ExposureConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<MqttConnection> {
        connect(config, events)
    }

    fn disconnect(&self, link: MqttConnection) {
        disconnect(Some(link));
    }
}
