//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::Deserialize;
use serde::de::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// History playback window clamp range in seconds
pub const HISTORY_WINDOW_MIN_S: u64 = 60;
pub const HISTORY_WINDOW_MAX_S: u64 = 3600;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub streams: StreamRates,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Vehicle link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    /// Endpoint: a serial device ("/dev/ttyACM0", "COM6") or a full
    /// transport address ("udpin:0.0.0.0:14550", "tcpout:10.0.0.2:5760")
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Our MAVLink system id (255 = standard GCS)
    #[serde(default = "default_source_system")]
    pub source_system: u8,

    #[serde(default = "default_source_component")]
    pub source_component: u8,

    /// How long connect() waits for the first vehicle heartbeat
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,

    /// Heartbeat silence after which the link counts as lost
    #[serde(default = "default_heartbeat_loss_s")]
    pub heartbeat_loss_s: u64,

    /// Delay between reconnect attempts
    #[serde(default = "default_reconnect_backoff_s")]
    pub reconnect_backoff_s: u64,
}

/// Requested per-message telemetry rates in Hz
#[derive(Debug, Deserialize, Clone)]
pub struct StreamRates {
    #[serde(default = "default_attitude_hz")]
    pub attitude_hz: u32,

    #[serde(default = "default_position_hz")]
    pub position_hz: u32,

    #[serde(default = "default_vfr_hud_hz")]
    pub vfr_hud_hz: u32,

    #[serde(default = "default_servo_output_hz")]
    pub servo_output_hz: u32,

    #[serde(default = "default_rc_channels_hz")]
    pub rc_channels_hz: u32,

    #[serde(default = "default_sys_status_hz")]
    pub sys_status_hz: u32,

    #[serde(default = "default_heartbeat_hz")]
    pub heartbeat_hz: u32,

    #[serde(default = "default_battery_hz")]
    pub battery_hz: u32,

    #[serde(default = "default_gps_hz")]
    pub gps_hz: u32,

    #[serde(default = "default_nav_controller_hz")]
    pub nav_controller_hz: u32,

    #[serde(default = "default_ekf_status_hz")]
    pub ekf_status_hz: u32,

    #[serde(default = "default_status_text_hz")]
    pub status_text_hz: u32,

    #[serde(default = "default_mission_current_hz")]
    pub mission_current_hz: u32,

    /// Pause between individual rate-set commands so the transport
    /// is not overrun by the configuration burst
    #[serde(default = "default_setup_delay_ms")]
    pub setup_delay_ms: u64,
}

/// RC override and safety configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    /// RC channel carrying throttle (vehicle-specific wiring)
    #[serde(default = "default_throttle_channel")]
    pub throttle_channel: u8,

    /// RC channel carrying steering
    #[serde(default = "default_steering_channel")]
    pub steering_channel: u8,

    /// Maximum PWM the throttle override may command (min is symmetric)
    #[serde(default = "default_throttle_limit")]
    pub throttle_limit: u16,

    /// Maximum PWM the steering override may command (min is symmetric)
    #[serde(default = "default_steering_limit")]
    pub steering_limit: u16,

    /// Interval at which an active override is resent to the vehicle
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Caller-side watchdog: overrides not renewed within this window
    /// are cleared automatically
    #[serde(default = "default_safety_timeout_s")]
    pub safety_timeout_s: f64,

    #[serde(default = "default_safety_limits_enabled")]
    pub safety_limits_enabled: bool,

    /// Write RC_OVERRIDE_TIME / RC_OPTIONS parameters after connect
    #[serde(default = "default_auto_configure_override")]
    pub auto_configure_override: bool,

    /// Vehicle-side override expiry in seconds, -1 to leave untouched
    #[serde(default = "default_vehicle_override_timeout_s")]
    pub vehicle_override_timeout_s: i32,
}

/// Telemetry history and status queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    /// Chart playback window in seconds, clamped to [60, 3600]
    #[serde(default = "default_history_window_s")]
    pub history_window_s: u64,

    /// Point cap per history series
    #[serde(default = "default_max_history_points")]
    pub max_history_points: usize,

    /// Bounded status-text FIFO depth
    #[serde(default = "default_status_message_limit")]
    pub status_message_limit: usize,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,

    #[serde(default = "default_log_to_file")]
    pub to_file: bool,
}

// Default value functions
fn default_endpoint() -> String { "/dev/ttyACM0".to_string() }
fn default_baud_rate() -> u32 { 57600 }
fn default_source_system() -> u8 { 255 }
fn default_source_component() -> u8 { 0 }
fn default_connect_timeout_s() -> u64 { 8 }
fn default_heartbeat_loss_s() -> u64 { 5 }
fn default_reconnect_backoff_s() -> u64 { 5 }

fn default_attitude_hz() -> u32 { 20 }
fn default_position_hz() -> u32 { 10 }
fn default_vfr_hud_hz() -> u32 { 10 }
fn default_servo_output_hz() -> u32 { 10 }
fn default_rc_channels_hz() -> u32 { 10 }
fn default_sys_status_hz() -> u32 { 5 }
fn default_heartbeat_hz() -> u32 { 1 }
fn default_battery_hz() -> u32 { 2 }
fn default_gps_hz() -> u32 { 5 }
fn default_nav_controller_hz() -> u32 { 5 }
fn default_ekf_status_hz() -> u32 { 2 }
fn default_status_text_hz() -> u32 { 1 }
fn default_mission_current_hz() -> u32 { 1 }
fn default_setup_delay_ms() -> u64 { 10 }

fn default_throttle_channel() -> u8 { 1 }
fn default_steering_channel() -> u8 { 2 }
fn default_throttle_limit() -> u16 { 1800 }
fn default_steering_limit() -> u16 { 1800 }
fn default_refresh_interval_ms() -> u64 { 500 }
fn default_safety_timeout_s() -> f64 { 5.0 }
fn default_safety_limits_enabled() -> bool { true }
fn default_auto_configure_override() -> bool { true }
fn default_vehicle_override_timeout_s() -> i32 { -1 }

fn default_history_window_s() -> u64 { 300 }
fn default_max_history_points() -> usize { 5000 }
fn default_status_message_limit() -> usize { 100 }

fn default_log_dir() -> String { "./logs".to_string() }
fn default_log_to_file() -> bool { true }

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            baud_rate: default_baud_rate(),
            source_system: default_source_system(),
            source_component: default_source_component(),
            connect_timeout_s: default_connect_timeout_s(),
            heartbeat_loss_s: default_heartbeat_loss_s(),
            reconnect_backoff_s: default_reconnect_backoff_s(),
        }
    }
}

impl Default for StreamRates {
    fn default() -> Self {
        Self {
            attitude_hz: default_attitude_hz(),
            position_hz: default_position_hz(),
            vfr_hud_hz: default_vfr_hud_hz(),
            servo_output_hz: default_servo_output_hz(),
            rc_channels_hz: default_rc_channels_hz(),
            sys_status_hz: default_sys_status_hz(),
            heartbeat_hz: default_heartbeat_hz(),
            battery_hz: default_battery_hz(),
            gps_hz: default_gps_hz(),
            nav_controller_hz: default_nav_controller_hz(),
            ekf_status_hz: default_ekf_status_hz(),
            status_text_hz: default_status_text_hz(),
            mission_current_hz: default_mission_current_hz(),
            setup_delay_ms: default_setup_delay_ms(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            throttle_channel: default_throttle_channel(),
            steering_channel: default_steering_channel(),
            throttle_limit: default_throttle_limit(),
            steering_limit: default_steering_limit(),
            refresh_interval_ms: default_refresh_interval_ms(),
            safety_timeout_s: default_safety_timeout_s(),
            safety_limits_enabled: default_safety_limits_enabled(),
            auto_configure_override: default_auto_configure_override(),
            vehicle_override_timeout_s: default_vehicle_override_timeout_s(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            history_window_s: default_history_window_s(),
            max_history_points: default_max_history_points(),
            status_message_limit: default_status_message_limit(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            to_file: default_log_to_file(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            streams: StreamRates::default(),
            control: ControlConfig::default(),
            telemetry: TelemetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Connect handshake timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }

    /// Heartbeat-loss threshold as a [`Duration`]
    pub fn heartbeat_loss(&self) -> Duration {
        Duration::from_secs(self.heartbeat_loss_s)
    }

    /// Reconnect backoff as a [`Duration`]
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_s)
    }
}

impl ControlConfig {
    /// Override refresh interval as a [`Duration`]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Default caller-side safety deadline as a [`Duration`]
    pub fn safety_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.safety_timeout_s)
    }
}

impl TelemetryConfig {
    /// Effective playback window, clamped to the supported range
    pub fn history_window(&self) -> Duration {
        Duration::from_secs(
            self.history_window_s
                .clamp(HISTORY_WINDOW_MIN_S, HISTORY_WINDOW_MAX_S),
        )
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rover_link::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.link.endpoint.is_empty() {
            return Err(crate::error::RoverLinkError::Config(
                toml::de::Error::custom("link endpoint cannot be empty")
            ));
        }

        if self.link.baud_rate == 0 {
            return Err(crate::error::RoverLinkError::Config(
                toml::de::Error::custom("baud_rate must be greater than 0")
            ));
        }

        if self.link.connect_timeout_s == 0 || self.link.connect_timeout_s > 60 {
            return Err(crate::error::RoverLinkError::Config(
                toml::de::Error::custom("connect_timeout_s must be between 1 and 60")
            ));
        }

        if self.link.heartbeat_loss_s == 0 || self.link.heartbeat_loss_s > 60 {
            return Err(crate::error::RoverLinkError::Config(
                toml::de::Error::custom("heartbeat_loss_s must be between 1 and 60")
            ));
        }

        if self.link.reconnect_backoff_s == 0 || self.link.reconnect_backoff_s > 300 {
            return Err(crate::error::RoverLinkError::Config(
                toml::de::Error::custom("reconnect_backoff_s must be between 1 and 300")
            ));
        }

        // Every monitored message needs a positive rate
        for (name, hz) in [
            ("attitude_hz", self.streams.attitude_hz),
            ("position_hz", self.streams.position_hz),
            ("vfr_hud_hz", self.streams.vfr_hud_hz),
            ("servo_output_hz", self.streams.servo_output_hz),
            ("rc_channels_hz", self.streams.rc_channels_hz),
            ("sys_status_hz", self.streams.sys_status_hz),
            ("heartbeat_hz", self.streams.heartbeat_hz),
            ("battery_hz", self.streams.battery_hz),
            ("gps_hz", self.streams.gps_hz),
            ("nav_controller_hz", self.streams.nav_controller_hz),
            ("ekf_status_hz", self.streams.ekf_status_hz),
            ("status_text_hz", self.streams.status_text_hz),
            ("mission_current_hz", self.streams.mission_current_hz),
        ] {
            if hz == 0 || hz > 50 {
                return Err(crate::error::RoverLinkError::Config(
                    toml::de::Error::custom(format!("{} must be between 1 and 50", name))
                ));
            }
        }

        for (name, ch) in [
            ("throttle_channel", self.control.throttle_channel),
            ("steering_channel", self.control.steering_channel),
        ] {
            if ch == 0 || ch > 18 {
                return Err(crate::error::RoverLinkError::Config(
                    toml::de::Error::custom(format!("{} must be between 1 and 18", name))
                ));
            }
        }

        if self.control.throttle_channel == self.control.steering_channel {
            return Err(crate::error::RoverLinkError::Config(
                toml::de::Error::custom("throttle_channel and steering_channel must differ")
            ));
        }

        for (name, limit) in [
            ("throttle_limit", self.control.throttle_limit),
            ("steering_limit", self.control.steering_limit),
        ] {
            if !(1500..=2000).contains(&limit) {
                return Err(crate::error::RoverLinkError::Config(
                    toml::de::Error::custom(format!("{} must be between 1500 and 2000", name))
                ));
            }
        }

        if self.control.refresh_interval_ms < 100 || self.control.refresh_interval_ms > 5000 {
            return Err(crate::error::RoverLinkError::Config(
                toml::de::Error::custom("refresh_interval_ms must be between 100 and 5000")
            ));
        }

        if self.control.safety_timeout_s < 0.5 || self.control.safety_timeout_s > 60.0 {
            return Err(crate::error::RoverLinkError::Config(
                toml::de::Error::custom("safety_timeout_s must be between 0.5 and 60")
            ));
        }

        if self.telemetry.max_history_points == 0 {
            return Err(crate::error::RoverLinkError::Config(
                toml::de::Error::custom("max_history_points must be greater than 0")
            ));
        }

        if self.telemetry.status_message_limit == 0 {
            return Err(crate::error::RoverLinkError::Config(
                toml::de::Error::custom("status_message_limit must be greater than 0")
            ));
        }

        if self.log.to_file && self.log.dir.is_empty() {
            return Err(crate::error::RoverLinkError::Config(
                toml::de::Error::custom("log dir cannot be empty when file logging is enabled")
            ));
        }

        Ok(())
    }
}
