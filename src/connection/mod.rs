//! # Connection Module
//!
//! Owns one MAVLink link to one vehicle.
//!
//! This module handles:
//! - Connection establishment with a bounded heartbeat handshake
//! - GCS heartbeat emission and heartbeat-loss detection (1s watchdog)
//! - Reconnection scheduling with fixed backoff, retried until success
//! - Post-connect data-stream rate configuration with legacy fallback
//! - Demultiplexing decoded messages to registered subscribers
//! - Deterministic teardown: `disconnect()` joins every background task
//!
//! All mutable link state lives behind one mutex which is never held across
//! an await point and always released before subscriber callbacks run.

use mavlink::ardupilotmega::{MavCmd, MavMessage, MavType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ControlConfig, LinkConfig, StreamRates};
use crate::error::{Result, RoverLinkError};
use crate::lock;
use crate::transport::{
    LinkTransport, MessageKind, Target, TransportConnector, RC_OVERRIDE_CHANNELS,
};

/// Watchdog tick: heartbeat emission and loss check
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

// MAVLink message ids used for SET_MESSAGE_INTERVAL
const MSG_ID_HEARTBEAT: u32 = 0;
const MSG_ID_SYS_STATUS: u32 = 1;
const MSG_ID_GPS_RAW_INT: u32 = 24;
const MSG_ID_ATTITUDE: u32 = 30;
const MSG_ID_GLOBAL_POSITION_INT: u32 = 33;
const MSG_ID_SERVO_OUTPUT_RAW: u32 = 36;
const MSG_ID_MISSION_CURRENT: u32 = 42;
const MSG_ID_NAV_CONTROLLER_OUTPUT: u32 = 62;
const MSG_ID_RC_CHANNELS: u32 = 65;
const MSG_ID_VFR_HUD: u32 = 74;
const MSG_ID_BATTERY_STATUS: u32 = 147;
const MSG_ID_EKF_STATUS_REPORT: u32 = 193;
const MSG_ID_STATUSTEXT: u32 = 253;

/// Legacy REQUEST_DATA_STREAM fallback: (stream id, rate Hz).
/// Covers firmware that ignores the per-message interval mechanism.
const LEGACY_STREAMS: &[(u8, u16)] = &[
    (0, 1),   // all
    (1, 10),  // raw sensors
    (2, 5),   // extended status
    (3, 10),  // rc channels
    (6, 10),  // position
    (10, 20), // extra1: attitude
    (11, 10), // extra2: vfr hud
    (12, 5),  // extra3
];

/// Lifecycle phase of the vehicle link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Connected,
    /// No vehicle heartbeat within the loss window; treated as
    /// disconnected by every consumer until a heartbeat returns
    HeartbeatLost,
}

/// Subscriber invoked for each decoded message of a registered kind.
///
/// A failing handler is logged and isolated; it never affects the receive
/// loop or sibling handlers.
pub type MessageHandler = Arc<dyn Fn(&MavMessage) -> Result<()> + Send + Sync>;

/// Subscriber invoked on connected/disconnected transitions
pub type ConnectionListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Background activities of one established connection
struct LinkSession {
    transport: Arc<dyn LinkTransport>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct LinkState {
    phase: LinkPhase,
    target: Option<Target>,
    last_heartbeat: Option<Instant>,
    streams_configured: bool,
    reconnect_pending: bool,
    session: Option<LinkSession>,
    reconnect_task: Option<JoinHandle<()>>,
}

struct ConnectionInner {
    link: LinkConfig,
    streams: StreamRates,
    control: ControlConfig,
    connector: Arc<dyn TransportConnector>,
    state: Mutex<LinkState>,
    handlers: Mutex<HashMap<MessageKind, Vec<MessageHandler>>>,
    listeners: Mutex<Vec<ConnectionListener>>,
}

/// Manages the link to one vehicle.
///
/// Cheap to clone; clones share the same underlying link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    /// Create a manager for the configured endpoint.
    ///
    /// No I/O happens until [`connect`](Self::connect) is called.
    pub fn new(config: &Config, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                link: config.link.clone(),
                streams: config.streams.clone(),
                control: config.control.clone(),
                connector,
                state: Mutex::new(LinkState {
                    phase: LinkPhase::Disconnected,
                    target: None,
                    last_heartbeat: None,
                    streams_configured: false,
                    reconnect_pending: false,
                    session: None,
                    reconnect_task: None,
                }),
                handlers: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attempt to establish the link.
    ///
    /// Blocks up to the configured handshake timeout waiting for the first
    /// vehicle heartbeat. On failure the link ends `Disconnected` and a
    /// reconnect is scheduled after the configured backoff, retried until a
    /// connection succeeds or [`disconnect`](Self::disconnect) is called.
    pub async fn connect(&self) -> bool {
        match ConnectionInner::try_connect(&self.inner).await {
            Ok(()) => true,
            Err(e) => {
                error!("Connection attempt failed: {}", e);
                ConnectionInner::schedule_reconnect(&self.inner);
                false
            }
        }
    }

    /// Tear the link down.
    ///
    /// Stops the reconnect schedule, joins the receive loop and watchdog,
    /// closes the transport and notifies connection listeners synchronously
    /// before returning.
    pub async fn disconnect(&self) {
        info!("Disconnecting from vehicle");

        let reconnect = {
            let mut st = lock(&self.inner.state);
            st.reconnect_pending = false;
            st.reconnect_task.take()
        };
        if let Some(task) = reconnect {
            task.abort();
            let _ = task.await;
        }

        self.inner.teardown_session().await;

        {
            let mut st = lock(&self.inner.state);
            st.phase = LinkPhase::Disconnected;
            st.target = None;
            st.last_heartbeat = None;
        }
        self.inner.notify_connection(false);
        info!("Disconnected");
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> LinkPhase {
        lock(&self.inner.state).phase
    }

    /// True while the vehicle heartbeat is healthy
    pub fn is_connected(&self) -> bool {
        self.phase() == LinkPhase::Connected
    }

    /// Vehicle address learned from the first heartbeat
    pub fn target(&self) -> Option<Target> {
        lock(&self.inner.state).target
    }

    /// Subscribe to decoded messages of one kind
    pub fn register_message_handler(&self, kind: MessageKind, handler: MessageHandler) {
        lock(&self.inner.handlers)
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Subscribe to connected/disconnected transitions
    pub fn register_connection_listener(&self, listener: ConnectionListener) {
        lock(&self.inner.listeners).push(listener);
    }

    /// Send a COMMAND_LONG to the vehicle. Requires a healthy link.
    pub async fn send_command(&self, command: MavCmd, params: [f32; 7]) -> Result<()> {
        let (transport, target) = self.inner.connected_transport()?;
        transport.send_command(target, command, params).await
    }

    /// Send a raw RC override frame. Requires a healthy link.
    pub async fn send_rc_override(&self, values: [u16; RC_OVERRIDE_CHANNELS]) -> Result<()> {
        let (transport, target) = self.inner.connected_transport()?;
        transport.send_rc_override(target, values).await
    }

    /// Request a mode change. Requires a healthy link.
    pub async fn send_mode(&self, base_mode: u8, custom_mode: u32) -> Result<()> {
        let (transport, target) = self.inner.connected_transport()?;
        transport.send_mode(target, base_mode, custom_mode).await
    }
}

impl ConnectionInner {
    /// One full connection attempt: open, handshake, start background
    /// activities, run post-connect configuration.
    async fn try_connect(inner: &Arc<Self>) -> Result<()> {
        inner.teardown_session().await;
        lock(&inner.state).phase = LinkPhase::Connecting;

        info!("Connecting to vehicle at {}", inner.link.endpoint);
        let transport = match inner.connector.open(&inner.link).await {
            Ok(transport) => transport,
            Err(e) => {
                lock(&inner.state).phase = LinkPhase::Disconnected;
                return Err(e);
            }
        };

        debug!("Waiting for vehicle heartbeat");
        let handshake = transport.wait_heartbeat(inner.link.connect_timeout()).await;
        let Some((target, heartbeat)) = handshake else {
            transport.close();
            lock(&inner.state).phase = LinkPhase::Disconnected;
            return Err(RoverLinkError::Transport(format!(
                "no heartbeat within {}s",
                inner.link.connect_timeout_s
            )));
        };

        if heartbeat.mavtype != MavType::MAV_TYPE_GROUND_ROVER {
            warn!(
                "Connected system reports type {:?}, expected a ground rover",
                heartbeat.mavtype
            );
        }
        info!(
            "Connected to vehicle system {} component {}",
            target.system, target.component
        );

        {
            let mut st = lock(&inner.state);
            st.target = Some(target);
            st.phase = LinkPhase::Connected;
            st.last_heartbeat = Some(Instant::now());
            st.streams_configured = false;
            st.reconnect_pending = false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let receive_task = tokio::spawn(Self::receive_loop(
            Arc::clone(inner),
            Arc::clone(&transport),
            shutdown_rx.clone(),
        ));
        let watchdog_task = tokio::spawn(Self::watchdog_loop(
            Arc::clone(inner),
            Arc::clone(&transport),
            shutdown_rx,
        ));
        lock(&inner.state).session = Some(LinkSession {
            transport: Arc::clone(&transport),
            shutdown: shutdown_tx,
            tasks: vec![receive_task, watchdog_task],
        });

        inner.notify_connection(true);

        if inner.claim_stream_configuration() {
            inner.configure_data_streams(&transport, target).await;
        }
        if inner.control.auto_configure_override {
            inner.configure_override_params(&transport, target).await;
        }

        Ok(())
    }

    /// Stop and join the receive loop and watchdog, then close the transport
    async fn teardown_session(&self) {
        let session = lock(&self.state).session.take();
        if let Some(session) = session {
            let _ = session.shutdown.send(true);
            for task in session.tasks {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        warn!("Link task ended abnormally: {}", e);
                    }
                }
            }
            session.transport.close();
        }
    }

    /// Arrange a reconnect attempt after the configured backoff.
    ///
    /// Only one reconnect schedule exists at a time; it retries until the
    /// link is healthy again or `disconnect()` aborts it.
    fn schedule_reconnect(inner: &Arc<Self>) {
        let backoff = inner.link.reconnect_backoff();
        let mut st = lock(&inner.state);
        if st.reconnect_pending {
            return;
        }
        st.reconnect_pending = true;
        info!("Reconnecting in {}s", backoff.as_secs());

        let task_inner = Arc::clone(inner);
        st.reconnect_task = Some(tokio::spawn(async move {
            loop {
                sleep(backoff).await;
                if lock(&task_inner.state).phase == LinkPhase::Connected {
                    // Heartbeat came back on its own
                    break;
                }
                info!("Attempting reconnect");
                match Self::try_connect(&task_inner).await {
                    Ok(()) => break,
                    Err(e) => warn!("Reconnect failed: {}", e),
                }
            }
            lock(&task_inner.state).reconnect_pending = false;
        }));
    }

    /// Claim the one-time post-connect stream configuration.
    ///
    /// Returns true exactly once per established connection.
    fn claim_stream_configuration(&self) -> bool {
        let mut st = lock(&self.state);
        if st.streams_configured {
            false
        } else {
            st.streams_configured = true;
            true
        }
    }

    /// Request per-message telemetry rates, then the legacy bulk streams.
    ///
    /// Individual failures are logged and skipped; partial success is fine.
    async fn configure_data_streams(&self, transport: &Arc<dyn LinkTransport>, target: Target) {
        let rates = [
            (MSG_ID_ATTITUDE, self.streams.attitude_hz),
            (MSG_ID_GLOBAL_POSITION_INT, self.streams.position_hz),
            (MSG_ID_VFR_HUD, self.streams.vfr_hud_hz),
            (MSG_ID_SERVO_OUTPUT_RAW, self.streams.servo_output_hz),
            (MSG_ID_RC_CHANNELS, self.streams.rc_channels_hz),
            (MSG_ID_SYS_STATUS, self.streams.sys_status_hz),
            (MSG_ID_HEARTBEAT, self.streams.heartbeat_hz),
            (MSG_ID_BATTERY_STATUS, self.streams.battery_hz),
            (MSG_ID_GPS_RAW_INT, self.streams.gps_hz),
            (MSG_ID_NAV_CONTROLLER_OUTPUT, self.streams.nav_controller_hz),
            (MSG_ID_EKF_STATUS_REPORT, self.streams.ekf_status_hz),
            (MSG_ID_STATUSTEXT, self.streams.status_text_hz),
            (MSG_ID_MISSION_CURRENT, self.streams.mission_current_hz),
        ];
        let delay = Duration::from_millis(self.streams.setup_delay_ms);

        let mut configured = 0usize;
        for (message_id, rate_hz) in rates {
            let interval_us = 1_000_000 / rate_hz;
            let result = transport
                .send_command(
                    target,
                    MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL,
                    [message_id as f32, interval_us as f32, 0.0, 0.0, 0.0, 0.0, 0.0],
                )
                .await;
            match result {
                Ok(()) => configured += 1,
                Err(e) => warn!("Failed to set interval for message {}: {}", message_id, e),
            }
            sleep(delay).await;
        }
        info!("Configured {}/{} telemetry streams", configured, rates.len());

        for &(stream_id, rate_hz) in LEGACY_STREAMS {
            if let Err(e) = transport
                .send_stream_request(target, stream_id, rate_hz, true)
                .await
            {
                warn!("Legacy stream request {} failed: {}", stream_id, e);
            }
            sleep(delay).await;
        }
    }

    /// Write the RC-override related parameters after connect
    async fn configure_override_params(&self, transport: &Arc<dyn LinkTransport>, target: Target) {
        if self.control.vehicle_override_timeout_s >= 0 {
            let timeout = self.control.vehicle_override_timeout_s as f32;
            if let Err(e) = transport
                .send_param_set(target, "RC_OVERRIDE_TIME", timeout)
                .await
            {
                warn!("Failed to set RC_OVERRIDE_TIME: {}", e);
            }
        }
        // Clear options that would make the vehicle ignore GCS overrides
        if let Err(e) = transport.send_param_set(target, "RC_OPTIONS", 0.0).await {
            warn!("Failed to set RC_OPTIONS: {}", e);
        }
    }

    async fn receive_loop(
        inner: Arc<Self>,
        transport: Arc<dyn LinkTransport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!("Receive loop started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = transport.receive_next() => {
                    if let Some((_header, message)) = received {
                        Self::process_message(&inner, &transport, &message).await;
                    }
                }
            }
        }
        debug!("Receive loop stopped");
    }

    async fn process_message(
        inner: &Arc<Self>,
        transport: &Arc<dyn LinkTransport>,
        message: &MavMessage,
    ) {
        if let MavMessage::HEARTBEAT(_) = message {
            let (regained, target, needs_config) = {
                let mut st = lock(&inner.state);
                st.last_heartbeat = Some(Instant::now());
                let regained = st.phase == LinkPhase::HeartbeatLost;
                if regained {
                    st.phase = LinkPhase::Connected;
                }
                (regained, st.target, !st.streams_configured)
            };
            if regained {
                info!("Vehicle heartbeat recovered, link restored");
                inner.notify_connection(true);
            }
            if needs_config && inner.claim_stream_configuration() {
                if let Some(target) = target {
                    inner.configure_data_streams(transport, target).await;
                }
            }
        }
        inner.dispatch(message);
    }

    /// Fan a decoded message out to its subscribers.
    ///
    /// Handlers run outside the state lock; a failing handler is logged and
    /// never stops the loop or affects other subscribers.
    fn dispatch(&self, message: &MavMessage) {
        let kind = MessageKind::of(message);
        let handlers: Vec<MessageHandler> = lock(&self.handlers)
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            if let Err(e) = handler(message) {
                error!("{} handler failed: {}", kind, e);
            }
        }
    }

    async fn watchdog_loop(
        inner: Arc<Self>,
        transport: Arc<dyn LinkTransport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(WATCHDOG_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = transport.send_heartbeat().await {
                        warn!("GCS heartbeat send failed: {}", e);
                        Self::mark_heartbeat_lost(&inner, "heartbeat send failure");
                        continue;
                    }

                    let silent_for = {
                        let st = lock(&inner.state);
                        match (st.phase, st.last_heartbeat) {
                            (LinkPhase::Connected, Some(at)) => Some(at.elapsed()),
                            _ => None,
                        }
                    };
                    if let Some(elapsed) = silent_for {
                        if elapsed > inner.link.heartbeat_loss() {
                            warn!(
                                "No vehicle heartbeat for {:.1}s",
                                elapsed.as_secs_f64()
                            );
                            Self::mark_heartbeat_lost(&inner, "heartbeat timeout");
                        }
                    }
                }
            }
        }
    }

    /// Connected → HeartbeatLost transition plus reconnect scheduling.
    /// Idempotent; only the first caller after a loss does anything.
    fn mark_heartbeat_lost(inner: &Arc<Self>, reason: &str) {
        let transitioned = {
            let mut st = lock(&inner.state);
            if st.phase == LinkPhase::Connected {
                st.phase = LinkPhase::HeartbeatLost;
                true
            } else {
                false
            }
        };
        if transitioned {
            warn!("Link lost ({}), scheduling reconnect", reason);
            inner.notify_connection(false);
            Self::schedule_reconnect(inner);
        }
    }

    fn connected_transport(&self) -> Result<(Arc<dyn LinkTransport>, Target)> {
        let st = lock(&self.state);
        match (&st.session, st.target, st.phase) {
            (Some(session), Some(target), LinkPhase::Connected) => {
                Ok((Arc::clone(&session.transport), target))
            }
            _ => Err(RoverLinkError::NotConnected),
        }
    }

    fn notify_connection(&self, connected: bool) {
        let listeners: Vec<ConnectionListener> = lock(&self.listeners).clone();
        for listener in listeners {
            listener(connected);
        }
    }
}
