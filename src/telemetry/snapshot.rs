//! # Telemetry Snapshots
//!
//! Typed, immutable-at-read value records for every monitored signal class,
//! plus the dashboard composite handed to the presentation layer.
//!
//! Wire sentinels (65535 mV, -1 cA, -1 %) are converted to `Option` fields
//! at the decode boundary; `None` means "the vehicle has not reported this
//! yet", never zero.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::modes::FlightMode;
use crate::transport::{PWM_NEUTRAL, RC_OVERRIDE_CHANNELS, SERVO_OUTPUT_COUNT};

/// Vehicle attitude. Degrees are recomputed from the radian fields on every
/// update.
#[derive(Debug, Clone, Serialize)]
pub struct AttitudeSnapshot {
    /// Roll in radians
    pub roll: f32,
    /// Pitch in radians
    pub pitch: f32,
    /// Yaw in radians
    pub yaw: f32,
    pub roll_degrees: f64,
    pub pitch_degrees: f64,
    pub yaw_degrees: f64,
    pub captured_at: DateTime<Utc>,
}

impl Default for AttitudeSnapshot {
    fn default() -> Self {
        Self {
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            roll_degrees: 0.0,
            pitch_degrees: 0.0,
            yaw_degrees: 0.0,
            captured_at: Utc::now(),
        }
    }
}

/// Speeds and heading from the HUD message
#[derive(Debug, Clone, Serialize)]
pub struct VelocitySnapshot {
    /// Ground speed in m/s
    pub ground_speed: f32,
    /// Air speed in m/s (rarely meaningful on a rover, reported anyway)
    pub air_speed: f32,
    /// Climb rate in m/s
    pub climb_rate: f32,
    /// Heading in degrees, [0, 360)
    pub heading: f32,
    pub captured_at: DateTime<Utc>,
}

impl Default for VelocitySnapshot {
    fn default() -> Self {
        Self {
            ground_speed: 0.0,
            air_speed: 0.0,
            climb_rate: 0.0,
            heading: 0.0,
            captured_at: Utc::now(),
        }
    }
}

/// Global position decoded from fixed-point wire values
#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Altitude above mean sea level in meters
    pub altitude_msl: f64,
    /// Altitude above the home position in meters
    pub altitude_relative: f64,
    pub captured_at: DateTime<Utc>,
}

impl Default for PositionSnapshot {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            altitude_msl: 0.0,
            altitude_relative: 0.0,
            captured_at: Utc::now(),
        }
    }
}

/// Battery state. `None` fields have never been reported by the vehicle.
#[derive(Debug, Clone, Serialize)]
pub struct BatterySnapshot {
    /// Volts
    pub voltage: Option<f32>,
    /// Amperes
    pub current: Option<f32>,
    /// Remaining capacity, 0-100
    pub remaining_percent: Option<u8>,
    /// Consumed charge in mAh
    pub consumed_mah: Option<f32>,
    pub captured_at: DateTime<Utc>,
}

impl Default for BatterySnapshot {
    fn default() -> Self {
        Self {
            voltage: None,
            current: None,
            remaining_percent: None,
            consumed_mah: None,
            captured_at: Utc::now(),
        }
    }
}

/// Arming state, mode, GPS fix and system load
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatusSnapshot {
    pub armed: bool,
    pub flight_mode: FlightMode,
    /// GPS fix type (0 = no GPS, 1 = no fix, 2 = 2D, 3 = 3D, ...)
    pub gps_fix_type: u8,
    pub satellites_visible: u8,
    /// Autopilot main-loop load in percent
    pub system_load_percent: f32,
    pub captured_at: DateTime<Utc>,
}

impl Default for SystemStatusSnapshot {
    fn default() -> Self {
        Self {
            armed: false,
            flight_mode: FlightMode::default(),
            gps_fix_type: 0,
            satellites_visible: 0,
            system_load_percent: 0.0,
            captured_at: Utc::now(),
        }
    }
}

/// Raw RC receiver channel values in PWM microseconds.
/// Channels default to neutral until the first real reading.
#[derive(Debug, Clone, Serialize)]
pub struct RcChannelsSnapshot {
    pub channels: [u16; RC_OVERRIDE_CHANNELS],
    pub signal_strength: u8,
    pub captured_at: DateTime<Utc>,
}

impl Default for RcChannelsSnapshot {
    fn default() -> Self {
        Self {
            channels: [PWM_NEUTRAL; RC_OVERRIDE_CHANNELS],
            signal_strength: 0,
            captured_at: Utc::now(),
        }
    }
}

/// Servo output values in PWM microseconds
#[derive(Debug, Clone, Serialize)]
pub struct ServoOutputSnapshot {
    pub outputs: [u16; SERVO_OUTPUT_COUNT],
    pub captured_at: DateTime<Utc>,
}

impl Default for ServoOutputSnapshot {
    fn default() -> Self {
        Self {
            outputs: [PWM_NEUTRAL; SERVO_OUTPUT_COUNT],
            captured_at: Utc::now(),
        }
    }
}

/// Estimator health report
#[derive(Debug, Clone, Serialize)]
pub struct EkfStatusSnapshot {
    pub flags: u16,
    pub velocity_variance: f32,
    pub pos_horiz_variance: f32,
    pub pos_vert_variance: f32,
    pub compass_variance: f32,
    pub terrain_alt_variance: f32,
    pub captured_at: DateTime<Utc>,
}

impl Default for EkfStatusSnapshot {
    fn default() -> Self {
        Self {
            flags: 0,
            velocity_variance: 0.0,
            pos_horiz_variance: 0.0,
            pos_vert_variance: 0.0,
            compass_variance: 0.0,
            terrain_alt_variance: 0.0,
            captured_at: Utc::now(),
        }
    }
}

/// One decoded STATUSTEXT entry
#[derive(Debug, Clone, Serialize)]
pub struct StatusTextMessage {
    /// MAVLink severity (0 = emergency ... 7 = debug)
    pub severity: u8,
    pub text: String,
    pub captured_at: DateTime<Utc>,
}

// History point payloads, flattened next to their timestamps

#[derive(Debug, Clone, Serialize)]
pub struct AttitudePoint {
    pub roll_degrees: f64,
    pub pitch_degrees: f64,
    pub yaw_degrees: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VelocityPoint {
    pub ground_speed: f32,
    pub heading: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatteryPoint {
    pub voltage: Option<f32>,
    pub current: Option<f32>,
    pub remaining_percent: Option<u8>,
}

/// Point-in-time composite of every current snapshot.
///
/// When the link is not healthy this is the explicit offline composite:
/// `connection_status == false`, `offline == true` and every field at its
/// documented neutral default, never stale values from a prior connection.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    pub timestamp: DateTime<Utc>,
    pub connection_status: bool,
    pub offline: bool,
    pub attitude: AttitudeSnapshot,
    pub velocity: VelocitySnapshot,
    pub position: PositionSnapshot,
    pub battery: BatterySnapshot,
    pub system: SystemStatusSnapshot,
    pub rc_channels: RcChannelsSnapshot,
    pub servo_output: ServoOutputSnapshot,
    pub ekf_status: EkfStatusSnapshot,
}

impl DashboardData {
    /// The offline composite: all defaults, flagged as offline
    pub fn offline() -> Self {
        Self {
            timestamp: Utc::now(),
            connection_status: false,
            offline: true,
            attitude: AttitudeSnapshot::default(),
            velocity: VelocitySnapshot::default(),
            position: PositionSnapshot::default(),
            battery: BatterySnapshot::default(),
            system: SystemStatusSnapshot::default(),
            rc_channels: RcChannelsSnapshot::default(),
            servo_output: ServoOutputSnapshot::default(),
            ekf_status: EkfStatusSnapshot::default(),
        }
    }
}
