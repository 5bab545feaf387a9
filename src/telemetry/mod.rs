//! # Telemetry Module
//!
//! Decodes vehicle messages into typed snapshots and bounded history.
//!
//! This module handles:
//! - Unit conversions at the decode boundary (radians→degrees, mV→V,
//!   cA→A, 1e7 fixed-point→degrees, mm→m)
//! - Latest-value snapshots per signal class, overwritten in place
//! - Dual-capped history series for attitude/velocity/battery charting
//! - A bounded FIFO of vehicle status texts
//! - Per-signal observers with failure isolation
//! - The dashboard composite, including the explicit offline shape

use mavlink::ardupilotmega::{MavMessage, MavModeFlag};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error};

use crate::config::TelemetryConfig;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::lock;
use crate::modes::FlightMode;
use crate::transport::MessageKind;

pub mod history;
pub mod snapshot;

use history::{HistoryPoint, SeriesHistory};
use snapshot::{
    AttitudePoint, AttitudeSnapshot, BatteryPoint, BatterySnapshot, DashboardData,
    EkfStatusSnapshot, PositionSnapshot, RcChannelsSnapshot, ServoOutputSnapshot, StatusTextMessage,
    SystemStatusSnapshot, VelocityPoint, VelocitySnapshot,
};

/// Signal classes observers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Attitude,
    Velocity,
    Position,
    Battery,
    System,
    RcChannels,
    ServoOutput,
    Gps,
    EkfStatus,
    StatusText,
    Connection,
}

/// Observer invoked after a signal's snapshot has been updated.
///
/// Observers run outside the telemetry lock, so they can safely query the
/// aggregator; a failing observer is logged and isolated.
pub type SignalObserver = Arc<dyn Fn(SignalKind) -> Result<()> + Send + Sync>;

/// Series selectable through [`TelemetryAggregator::history`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartSignal {
    Attitude,
    Velocity,
    Battery,
}

/// One charted series, ready for serialization
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum ChartSeries {
    Attitude(Vec<HistoryPoint<AttitudePoint>>),
    Velocity(Vec<HistoryPoint<VelocityPoint>>),
    Battery(Vec<HistoryPoint<BatteryPoint>>),
}

struct TelemetryState {
    connected: bool,
    attitude: AttitudeSnapshot,
    velocity: VelocitySnapshot,
    position: PositionSnapshot,
    battery: BatterySnapshot,
    system: SystemStatusSnapshot,
    rc_channels: RcChannelsSnapshot,
    servo_output: ServoOutputSnapshot,
    ekf_status: EkfStatusSnapshot,
    attitude_history: SeriesHistory<AttitudePoint>,
    velocity_history: SeriesHistory<VelocityPoint>,
    battery_history: SeriesHistory<BatteryPoint>,
    status_messages: VecDeque<StatusTextMessage>,
}

struct TelemetryInner {
    config: TelemetryConfig,
    state: Mutex<TelemetryState>,
    observers: Mutex<HashMap<SignalKind, Vec<SignalObserver>>>,
}

/// Aggregates decoded telemetry for one vehicle link.
///
/// Cheap to clone; clones share the same snapshots.
#[derive(Clone)]
pub struct TelemetryAggregator {
    inner: Arc<TelemetryInner>,
}

impl TelemetryAggregator {
    pub fn new(config: TelemetryConfig) -> Self {
        let window = config.history_window();
        let cap = config.max_history_points;
        Self {
            inner: Arc::new(TelemetryInner {
                config,
                state: Mutex::new(TelemetryState {
                    connected: false,
                    attitude: AttitudeSnapshot::default(),
                    velocity: VelocitySnapshot::default(),
                    position: PositionSnapshot::default(),
                    battery: BatterySnapshot::default(),
                    system: SystemStatusSnapshot::default(),
                    rc_channels: RcChannelsSnapshot::default(),
                    servo_output: ServoOutputSnapshot::default(),
                    ekf_status: EkfStatusSnapshot::default(),
                    attitude_history: SeriesHistory::new(window, cap),
                    velocity_history: SeriesHistory::new(window, cap),
                    battery_history: SeriesHistory::new(window, cap),
                    status_messages: VecDeque::new(),
                }),
                observers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe this aggregator to a connection's decoded messages and
    /// connection-status changes.
    pub fn attach(&self, connection: &ConnectionManager) {
        const KINDS: &[MessageKind] = &[
            MessageKind::Heartbeat,
            MessageKind::Attitude,
            MessageKind::VfrHud,
            MessageKind::GlobalPosition,
            MessageKind::SysStatus,
            MessageKind::BatteryStatus,
            MessageKind::RcChannels,
            MessageKind::ServoOutput,
            MessageKind::GpsRaw,
            MessageKind::StatusText,
            MessageKind::EkfStatus,
        ];
        for &kind in KINDS {
            let inner = Arc::clone(&self.inner);
            connection.register_message_handler(
                kind,
                Arc::new(move |message| {
                    inner.handle_message(message);
                    Ok(())
                }),
            );
        }

        let inner = Arc::clone(&self.inner);
        connection.register_connection_listener(Arc::new(move |connected| {
            inner.set_connected(connected);
        }));
    }

    /// Register an observer for one signal class
    pub fn register_observer(&self, kind: SignalKind, observer: SignalObserver) {
        lock(&self.inner.observers)
            .entry(kind)
            .or_default()
            .push(observer);
    }

    /// True while the aggregator considers the link healthy
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state).connected
    }

    /// Consistent point-in-time composite of every current snapshot.
    ///
    /// Returns the explicit offline composite while the link is unhealthy,
    /// never stale or partially-populated data.
    pub fn dashboard_data(&self) -> DashboardData {
        let state = lock(&self.inner.state);
        if !state.connected {
            return DashboardData::offline();
        }
        DashboardData {
            timestamp: chrono::Utc::now(),
            connection_status: true,
            offline: false,
            attitude: state.attitude.clone(),
            velocity: state.velocity.clone(),
            position: state.position.clone(),
            battery: state.battery.clone(),
            system: state.system.clone(),
            rc_channels: state.rc_channels.clone(),
            servo_output: state.servo_output.clone(),
            ekf_status: state.ekf_status.clone(),
        }
    }

    /// Ordered history of one signal, newest-relative window
    pub fn history(&self, signal: ChartSignal, window: Duration) -> ChartSeries {
        let state = lock(&self.inner.state);
        match signal {
            ChartSignal::Attitude => ChartSeries::Attitude(state.attitude_history.within(window)),
            ChartSignal::Velocity => ChartSeries::Velocity(state.velocity_history.within(window)),
            ChartSignal::Battery => ChartSeries::Battery(state.battery_history.within(window)),
        }
    }

    /// The most recent `count` status messages, oldest first
    pub fn status_messages(&self, count: usize) -> Vec<StatusTextMessage> {
        let state = lock(&self.inner.state);
        let skip = state.status_messages.len().saturating_sub(count);
        state.status_messages.iter().skip(skip).cloned().collect()
    }
}

impl TelemetryInner {
    fn set_connected(&self, connected: bool) {
        {
            let mut state = lock(&self.state);
            state.connected = connected;
        }
        debug!(
            "Telemetry aggregator {}",
            if connected { "online" } else { "offline" }
        );
        self.notify(SignalKind::Connection);
    }

    fn handle_message(&self, message: &MavMessage) {
        match message {
            MavMessage::HEARTBEAT(data) => {
                {
                    let mut state = lock(&self.state);
                    state.system.armed = data
                        .base_mode
                        .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                    state.system.flight_mode = FlightMode::from_custom_mode(data.custom_mode);
                    state.system.captured_at = chrono::Utc::now();
                }
                self.notify(SignalKind::System);
            }
            MavMessage::ATTITUDE(data) => {
                {
                    let mut state = lock(&self.state);
                    let now = chrono::Utc::now();
                    state.attitude.roll = data.roll;
                    state.attitude.pitch = data.pitch;
                    state.attitude.yaw = data.yaw;
                    state.attitude.roll_degrees = (data.roll as f64).to_degrees();
                    state.attitude.pitch_degrees = (data.pitch as f64).to_degrees();
                    state.attitude.yaw_degrees = (data.yaw as f64).to_degrees();
                    state.attitude.captured_at = now;
                    let point = AttitudePoint {
                        roll_degrees: state.attitude.roll_degrees,
                        pitch_degrees: state.attitude.pitch_degrees,
                        yaw_degrees: state.attitude.yaw_degrees,
                    };
                    state.attitude_history.push(now, point);
                }
                self.notify(SignalKind::Attitude);
            }
            MavMessage::VFR_HUD(data) => {
                {
                    let mut state = lock(&self.state);
                    let now = chrono::Utc::now();
                    state.velocity.ground_speed = data.groundspeed;
                    state.velocity.air_speed = data.airspeed;
                    state.velocity.climb_rate = data.climb;
                    state.velocity.heading = (data.heading as i32).rem_euclid(360) as f32;
                    state.velocity.captured_at = now;
                    let point = VelocityPoint {
                        ground_speed: state.velocity.ground_speed,
                        heading: state.velocity.heading,
                    };
                    state.velocity_history.push(now, point);
                }
                self.notify(SignalKind::Velocity);
            }
            MavMessage::GLOBAL_POSITION_INT(data) => {
                {
                    let mut state = lock(&self.state);
                    state.position.latitude = data.lat as f64 / 1e7;
                    state.position.longitude = data.lon as f64 / 1e7;
                    state.position.altitude_msl = data.alt as f64 / 1000.0;
                    state.position.altitude_relative = data.relative_alt as f64 / 1000.0;
                    state.position.captured_at = chrono::Utc::now();
                }
                self.notify(SignalKind::Position);
            }
            MavMessage::SYS_STATUS(data) => {
                {
                    let mut state = lock(&self.state);
                    let now = chrono::Utc::now();
                    if data.voltage_battery != u16::MAX {
                        state.battery.voltage = Some(data.voltage_battery as f32 / 1000.0);
                    }
                    if data.current_battery != -1 {
                        state.battery.current = Some(data.current_battery as f32 / 100.0);
                    }
                    if data.battery_remaining != -1 {
                        state.battery.remaining_percent = Some(data.battery_remaining as u8);
                    }
                    state.battery.captured_at = now;
                    state.system.system_load_percent = data.load as f32 / 10.0;
                    state.system.captured_at = now;
                }
                self.notify(SignalKind::System);
            }
            MavMessage::BATTERY_STATUS(data) => {
                {
                    let mut state = lock(&self.state);
                    let now = chrono::Utc::now();
                    if data.voltages[0] != u16::MAX {
                        state.battery.voltage = Some(data.voltages[0] as f32 / 1000.0);
                    }
                    if data.current_battery != -1 {
                        state.battery.current = Some(data.current_battery as f32 / 100.0);
                    }
                    if data.battery_remaining != -1 {
                        state.battery.remaining_percent = Some(data.battery_remaining as u8);
                    }
                    if data.current_consumed != -1 {
                        state.battery.consumed_mah = Some(data.current_consumed as f32);
                    }
                    state.battery.captured_at = now;
                    let point = BatteryPoint {
                        voltage: state.battery.voltage,
                        current: state.battery.current,
                        remaining_percent: state.battery.remaining_percent,
                    };
                    state.battery_history.push(now, point);
                }
                self.notify(SignalKind::Battery);
            }
            MavMessage::RC_CHANNELS(data) => {
                {
                    let mut state = lock(&self.state);
                    state.rc_channels.channels = [
                        data.chan1_raw,
                        data.chan2_raw,
                        data.chan3_raw,
                        data.chan4_raw,
                        data.chan5_raw,
                        data.chan6_raw,
                        data.chan7_raw,
                        data.chan8_raw,
                        data.chan9_raw,
                        data.chan10_raw,
                        data.chan11_raw,
                        data.chan12_raw,
                        data.chan13_raw,
                        data.chan14_raw,
                        data.chan15_raw,
                        data.chan16_raw,
                        data.chan17_raw,
                        data.chan18_raw,
                    ];
                    state.rc_channels.signal_strength = data.rssi;
                    state.rc_channels.captured_at = chrono::Utc::now();
                }
                self.notify(SignalKind::RcChannels);
            }
            MavMessage::SERVO_OUTPUT_RAW(data) => {
                {
                    let mut state = lock(&self.state);
                    state.servo_output.outputs = [
                        data.servo1_raw,
                        data.servo2_raw,
                        data.servo3_raw,
                        data.servo4_raw,
                        data.servo5_raw,
                        data.servo6_raw,
                        data.servo7_raw,
                        data.servo8_raw,
                        data.servo9_raw,
                        data.servo10_raw,
                        data.servo11_raw,
                        data.servo12_raw,
                        data.servo13_raw,
                        data.servo14_raw,
                        data.servo15_raw,
                        data.servo16_raw,
                    ];
                    state.servo_output.captured_at = chrono::Utc::now();
                }
                self.notify(SignalKind::ServoOutput);
            }
            MavMessage::GPS_RAW_INT(data) => {
                {
                    let mut state = lock(&self.state);
                    state.system.gps_fix_type = data.fix_type as u8;
                    state.system.satellites_visible = data.satellites_visible;
                    state.system.captured_at = chrono::Utc::now();
                }
                self.notify(SignalKind::Gps);
            }
            MavMessage::STATUSTEXT(data) => {
                let text = String::from_utf8_lossy(&data.text)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string();
                {
                    let mut state = lock(&self.state);
                    state.status_messages.push_back(StatusTextMessage {
                        severity: data.severity as u8,
                        text,
                        captured_at: chrono::Utc::now(),
                    });
                    while state.status_messages.len() > self.config.status_message_limit {
                        state.status_messages.pop_front();
                    }
                }
                self.notify(SignalKind::StatusText);
            }
            MavMessage::EKF_STATUS_REPORT(data) => {
                {
                    let mut state = lock(&self.state);
                    state.ekf_status.flags = data.flags.bits();
                    state.ekf_status.velocity_variance = data.velocity_variance;
                    state.ekf_status.pos_horiz_variance = data.pos_horiz_variance;
                    state.ekf_status.pos_vert_variance = data.pos_vert_variance;
                    state.ekf_status.compass_variance = data.compass_variance;
                    state.ekf_status.terrain_alt_variance = data.terrain_alt_variance;
                    state.ekf_status.captured_at = chrono::Utc::now();
                }
                self.notify(SignalKind::EkfStatus);
            }
            _ => {}
        }
    }

    /// Invoke observers for one signal, outside the state lock
    fn notify(&self, kind: SignalKind) {
        let observers: Vec<SignalObserver> = lock(&self.observers)
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        for observer in observers {
            if let Err(e) = observer(kind) {
                error!("{:?} observer failed: {}", kind, e);
            }
        }
    }
}
