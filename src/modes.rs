//! # Rover Flight Modes
//!
//! ArduRover custom-mode numbers and their display names.

use serde::Serialize;
use std::fmt;

/// ArduRover driving modes, keyed by the autopilot's custom-mode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoverMode {
    Manual = 0,
    Acro = 1,
    Learning = 2,
    Steering = 3,
    Hold = 4,
    Loiter = 5,
    Follow = 6,
    Simple = 7,
    Dock = 8,
    Circle = 9,
    Auto = 10,
    Rtl = 11,
    SmartRtl = 12,
    Guided = 15,
    Initialising = 16,
}

impl RoverMode {
    /// Custom-mode number sent over the wire
    pub fn custom_mode(self) -> u32 {
        self as u32
    }

    /// Look up a mode by its custom-mode number
    pub fn from_custom_mode(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Manual),
            1 => Some(Self::Acro),
            2 => Some(Self::Learning),
            3 => Some(Self::Steering),
            4 => Some(Self::Hold),
            5 => Some(Self::Loiter),
            6 => Some(Self::Follow),
            7 => Some(Self::Simple),
            8 => Some(Self::Dock),
            9 => Some(Self::Circle),
            10 => Some(Self::Auto),
            11 => Some(Self::Rtl),
            12 => Some(Self::SmartRtl),
            15 => Some(Self::Guided),
            16 => Some(Self::Initialising),
            _ => None,
        }
    }

    /// Canonical ArduPilot mode name
    pub fn name(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Acro => "ACRO",
            Self::Learning => "LEARNING",
            Self::Steering => "STEERING",
            Self::Hold => "HOLD",
            Self::Loiter => "LOITER",
            Self::Follow => "FOLLOW",
            Self::Simple => "SIMPLE",
            Self::Dock => "DOCK",
            Self::Circle => "CIRCLE",
            Self::Auto => "AUTO",
            Self::Rtl => "RTL",
            Self::SmartRtl => "SMART_RTL",
            Self::Guided => "GUIDED",
            Self::Initialising => "INITIALISING",
        }
    }
}

impl fmt::Display for RoverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flight mode as reported by the vehicle.
///
/// Unknown custom-mode numbers are carried through explicitly instead of
/// being collapsed into a default, so a firmware running modes this table
/// does not know still renders something diagnosable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum FlightMode {
    Named(RoverMode),
    Unknown(u32),
}

impl FlightMode {
    /// Decode a heartbeat custom-mode number
    pub fn from_custom_mode(code: u32) -> Self {
        match RoverMode::from_custom_mode(code) {
            Some(mode) => Self::Named(mode),
            None => Self::Unknown(code),
        }
    }
}

impl Default for FlightMode {
    fn default() -> Self {
        Self::Unknown(u32::MAX)
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(mode) => write!(f, "{}", mode),
            Self::Unknown(code) if *code == u32::MAX => write!(f, "UNKNOWN"),
            Self::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

impl From<FlightMode> for String {
    fn from(mode: FlightMode) -> Self {
        mode.to_string()
    }
}
