//! # Controller Module
//!
//! The only write path to the vehicle: RC override, mode changes,
//! arm/disarm and the emergency stop.
//!
//! The override state machine has two states, `Idle` and `Active`. While
//! `Active` two independent watchdogs run:
//! - a repeating refresh task resends the channel map so the vehicle-side
//!   firmware does not expire the override;
//! - a one-shot safety deadline clears everything if the *caller* stops
//!   issuing commands. Each `set_override` re-arms it; a generation counter
//!   makes superseded deadlines inert.
//!
//! Every command-send failure is non-fatal: it is reported as a boolean
//! failure and logged. Controller state only changes on the transitions
//! described here, never as a side effect of an unrelated failure.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ControlConfig};
use crate::connection::ConnectionManager;
use crate::lock;
use crate::modes::RoverMode;
use crate::telemetry::snapshot::DashboardData;
use crate::telemetry::TelemetryAggregator;
use crate::transport::{OVERRIDE_RELEASE, PWM_MAX, PWM_MIN, RC_OVERRIDE_CHANNELS};
use mavlink::ardupilotmega::MavCmd;

/// MAV_MODE_FLAG_CUSTOM_MODE_ENABLED, the base mode ArduPilot expects
/// alongside a custom mode number
const BASE_MODE_CUSTOM_ENABLED: u8 = 1;

/// PWM change per percent for the drive helpers (±100% maps to ±500us)
const PWM_PER_PERCENT: f32 = 5.0;

/// RC override state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideState {
    Idle,
    Active,
}

/// Controller state for the presentation layer
#[derive(Debug, Clone, Serialize)]
pub struct ControlStatus {
    pub active: bool,
    /// Channels currently overridden, channel number → PWM
    pub channels: BTreeMap<u8, u16>,
    pub emergency_stop_active: bool,
    pub safety_limits_enabled: bool,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

/// Control status merged with connection health and the dashboard composite
#[derive(Debug, Clone, Serialize)]
pub struct RoverStatus {
    pub timestamp: DateTime<Utc>,
    pub connection_status: bool,
    pub control: ControlStatus,
    pub dashboard: DashboardData,
}

struct ControllerState {
    override_state: OverrideState,
    channels: BTreeMap<u8, u16>,
    last_refresh_at: Option<DateTime<Utc>>,
    emergency_stop: bool,
    safety_limits_enabled: bool,
    refresh_task: Option<JoinHandle<()>>,
    deadline_task: Option<JoinHandle<()>>,
    deadline_generation: u64,
}

struct ControllerInner {
    connection: ConnectionManager,
    telemetry: TelemetryAggregator,
    config: ControlConfig,
    state: Mutex<ControllerState>,
}

/// Safe actuation for one rover link.
///
/// Cheap to clone; clones share the same override state machine.
#[derive(Clone)]
pub struct RoverController {
    inner: Arc<ControllerInner>,
}

impl RoverController {
    pub fn new(
        connection: ConnectionManager,
        telemetry: TelemetryAggregator,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                connection,
                telemetry,
                config: config.control.clone(),
                state: Mutex::new(ControllerState {
                    override_state: OverrideState::Idle,
                    channels: BTreeMap::new(),
                    last_refresh_at: None,
                    emergency_stop: false,
                    safety_limits_enabled: config.control.safety_limits_enabled,
                    refresh_task: None,
                    deadline_task: None,
                    deadline_generation: 0,
                }),
            }),
        }
    }

    /// Apply an RC override.
    ///
    /// Each requested value is clamped into its safety range, merged into
    /// the active channel map and sent as one override frame. On success the
    /// controller is `Active`, the refresh loop is running and the safety
    /// deadline is re-armed to `timeout` (configuration default when
    /// `None`).
    ///
    /// Rejected without state change while disconnected or while the
    /// emergency stop is latched.
    pub async fn set_override(
        &self,
        channels: &BTreeMap<u8, u16>,
        timeout: Option<Duration>,
    ) -> bool {
        if !self.inner.connection.is_connected() {
            warn!("Override rejected: not connected");
            return false;
        }

        let merged = {
            let st = lock(&self.inner.state);
            if st.emergency_stop {
                warn!("Override rejected: emergency stop active");
                return false;
            }
            let mut merged = st.channels.clone();
            for (&channel, &value) in channels {
                if channel == 0 || channel as usize > RC_OVERRIDE_CHANNELS {
                    warn!("Ignoring override for invalid channel {}", channel);
                    continue;
                }
                merged.insert(
                    channel,
                    self.inner
                        .clamp_channel(channel, value, st.safety_limits_enabled),
                );
            }
            if merged.is_empty() {
                warn!("Override rejected: no valid channels requested");
                return false;
            }
            merged
        };

        if !self.inner.telemetry.dashboard_data().system.armed {
            debug!("Vehicle not armed; override accepted but may have no effect");
        }

        let frame = build_override_frame(&merged);
        if let Err(e) = self.inner.connection.send_rc_override(frame).await {
            error!("Override send failed: {}", e);
            return false;
        }

        let generation = {
            let mut st = lock(&self.inner.state);
            st.channels = merged;
            st.override_state = OverrideState::Active;
            st.last_refresh_at = Some(Utc::now());
            st.deadline_generation += 1;
            st.deadline_generation
        };

        let deadline = timeout.unwrap_or_else(|| self.inner.config.safety_timeout());
        ControllerInner::arm_deadline(&self.inner, generation, deadline);
        ControllerInner::ensure_refresh_task(&self.inner);
        true
    }

    /// Remove channels from the active override (all when `None`).
    ///
    /// Cleared channels are sent as the release value so the vehicle hands
    /// them back to the RC radio. When the map becomes empty the controller
    /// drops to `Idle` and both watchdogs are cancelled. Safe to call any
    /// number of times.
    pub async fn clear_override(&self, channels: Option<&[u8]>) -> bool {
        let (frame, stopped) = {
            let mut st = lock(&self.inner.state);
            match channels {
                None => st.channels.clear(),
                Some(list) => {
                    for channel in list {
                        st.channels.remove(channel);
                    }
                }
            }
            let mut stopped = Vec::new();
            if st.channels.is_empty() {
                st.override_state = OverrideState::Idle;
                st.deadline_generation += 1;
                if let Some(task) = st.refresh_task.take() {
                    stopped.push(task);
                }
                if let Some(task) = st.deadline_task.take() {
                    stopped.push(task);
                }
            }
            (build_override_frame(&st.channels), stopped)
        };
        for task in stopped {
            task.abort();
        }

        if !self.inner.connection.is_connected() {
            // Local state is cleared regardless; the vehicle-side override
            // timeout covers the link-loss case
            debug!("Override cleared locally while disconnected");
            return true;
        }
        match self.inner.connection.send_rc_override(frame).await {
            Ok(()) => {
                debug!("Override clear sent");
                true
            }
            Err(e) => {
                error!("Override clear send failed: {}", e);
                false
            }
        }
    }

    /// Latch the emergency stop: clear every override, force HOLD mode and
    /// reject all further `set_override` calls until released.
    ///
    /// The latch always engages; the return value reports whether the stop
    /// actions reached the vehicle.
    pub async fn emergency_stop(&self) -> bool {
        warn!("EMERGENCY STOP engaged");
        {
            let mut st = lock(&self.inner.state);
            st.emergency_stop = true;
        }

        let cleared = self.clear_override(None).await;
        let held = if self.inner.connection.is_connected() {
            self.set_mode(RoverMode::Hold).await
        } else {
            true
        };
        cleared && held
    }

    /// Release the emergency-stop latch. Does not resume any prior
    /// override.
    pub fn release_emergency_stop(&self) -> bool {
        let mut st = lock(&self.inner.state);
        st.emergency_stop = false;
        info!("Emergency stop released");
        true
    }

    /// One-shot mode change, gated only on connection health
    pub async fn set_mode(&self, mode: RoverMode) -> bool {
        if !self.inner.connection.is_connected() {
            warn!("Mode change rejected: not connected");
            return false;
        }
        match self
            .inner
            .connection
            .send_mode(BASE_MODE_CUSTOM_ENABLED, mode.custom_mode())
            .await
        {
            Ok(()) => {
                info!("Mode change to {} requested", mode);
                true
            }
            Err(e) => {
                error!("Mode change to {} failed: {}", mode, e);
                false
            }
        }
    }

    /// One-shot arm/disarm, gated only on connection health
    pub async fn arm(&self, arm: bool) -> bool {
        if !self.inner.connection.is_connected() {
            warn!("Arm command rejected: not connected");
            return false;
        }
        let flag = if arm { 1.0 } else { 0.0 };
        match self
            .inner
            .connection
            .send_command(
                MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
                [flag, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            )
            .await
        {
            Ok(()) => {
                info!("{} command sent", if arm { "Arm" } else { "Disarm" });
                true
            }
            Err(e) => {
                error!("Arm command failed: {}", e);
                false
            }
        }
    }

    /// Drive helper: throttle as a percentage, -100..=100
    pub async fn set_throttle_percent(&self, percent: f32) -> bool {
        let channel = self.inner.config.throttle_channel;
        self.set_override(&BTreeMap::from([(channel, percent_to_pwm(percent))]), None)
            .await
    }

    /// Drive helper: steering as a percentage, -100..=100
    pub async fn set_steering_percent(&self, percent: f32) -> bool {
        let channel = self.inner.config.steering_channel;
        self.set_override(&BTreeMap::from([(channel, percent_to_pwm(percent))]), None)
            .await
    }

    /// Drive helper: throttle and steering in one override frame
    pub async fn set_movement_percent(&self, throttle: f32, steering: f32) -> bool {
        let channels = BTreeMap::from([
            (self.inner.config.throttle_channel, percent_to_pwm(throttle)),
            (self.inner.config.steering_channel, percent_to_pwm(steering)),
        ]);
        self.set_override(&channels, None).await
    }

    /// Toggle the throttle/steering clamps. The generic PWM bound always
    /// applies.
    pub fn set_safety_limits_enabled(&self, enabled: bool) {
        let mut st = lock(&self.inner.state);
        st.safety_limits_enabled = enabled;
        info!(
            "Safety limits {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Current override and safety state
    pub fn control_status(&self) -> ControlStatus {
        let st = lock(&self.inner.state);
        ControlStatus {
            active: st.override_state == OverrideState::Active,
            channels: st.channels.clone(),
            emergency_stop_active: st.emergency_stop,
            safety_limits_enabled: st.safety_limits_enabled,
            last_refresh_at: st.last_refresh_at,
        }
    }

    /// Control status merged with connection health and telemetry
    pub fn rover_status(&self) -> RoverStatus {
        RoverStatus {
            timestamp: Utc::now(),
            connection_status: self.inner.connection.is_connected(),
            control: self.control_status(),
            dashboard: self.inner.telemetry.dashboard_data(),
        }
    }

    /// Clear any active override and stop both watchdogs.
    ///
    /// Called on application teardown, before the link is closed.
    pub async fn shutdown(&self) {
        let active = lock(&self.inner.state).override_state == OverrideState::Active;
        if active {
            let _ = self.clear_override(None).await;
        }
        // clear_override cancelled the tasks; nothing else owns background
        // work
    }
}

impl ControllerInner {
    /// Clamp one channel value into its safety range.
    ///
    /// Throttle and steering get symmetric role-specific bounds around
    /// neutral; everything else gets the raw protocol range.
    fn clamp_channel(&self, channel: u8, value: u16, safety_limits: bool) -> u16 {
        let value = if safety_limits {
            if channel == self.config.throttle_channel {
                let max = self.config.throttle_limit;
                value.clamp(3000 - max, max)
            } else if channel == self.config.steering_channel {
                let max = self.config.steering_limit;
                value.clamp(3000 - max, max)
            } else {
                value
            }
        } else {
            value
        };
        value.clamp(PWM_MIN, PWM_MAX)
    }

    /// Arm the one-shot safety deadline, superseding any previous one
    fn arm_deadline(inner: &Arc<Self>, generation: u64, timeout: Duration) {
        let previous = {
            let mut st = lock(&inner.state);
            let task_inner = Arc::clone(inner);
            std::mem::replace(
                &mut st.deadline_task,
                Some(tokio::spawn(async move {
                    sleep(timeout).await;
                    Self::deadline_expired(&task_inner, generation).await;
                })),
            )
        };
        if let Some(task) = previous {
            task.abort();
        }
    }

    /// The caller stopped renewing its override: clear everything
    async fn deadline_expired(inner: &Arc<Self>, generation: u64) {
        let stopped = {
            let mut st = lock(&inner.state);
            if st.deadline_generation != generation
                || st.override_state != OverrideState::Active
            {
                return; // superseded by a newer set_override or already idle
            }
            warn!("Override safety deadline expired, clearing all channels");
            st.channels.clear();
            st.override_state = OverrideState::Idle;
            st.deadline_task = None;
            st.refresh_task.take()
        };
        if let Some(task) = stopped {
            task.abort();
        }

        if inner.connection.is_connected() {
            let frame = [OVERRIDE_RELEASE; RC_OVERRIDE_CHANNELS];
            if let Err(e) = inner.connection.send_rc_override(frame).await {
                warn!("Failed to send override clear after deadline: {}", e);
            }
        }
    }

    /// Spawn the refresh loop if it is not already running
    fn ensure_refresh_task(inner: &Arc<Self>) {
        let mut st = lock(&inner.state);
        if st.refresh_task.is_some() {
            return;
        }
        let task_inner = Arc::clone(inner);
        st.refresh_task = Some(tokio::spawn(async move {
            Self::refresh_loop(task_inner).await;
        }));
    }

    /// Resend the active channel map until the override ends.
    ///
    /// A failed resend drops the controller to `Idle` instead of retrying:
    /// the vehicle-side expiry will stop the rover, which beats driving on
    /// a link that cannot deliver a stop.
    async fn refresh_loop(inner: Arc<Self>) {
        let interval = inner.config.refresh_interval();
        loop {
            sleep(interval).await;
            let frame = {
                let st = lock(&inner.state);
                if st.override_state != OverrideState::Active {
                    break;
                }
                build_override_frame(&st.channels)
            };
            match inner.connection.send_rc_override(frame).await {
                Ok(()) => {
                    let mut st = lock(&inner.state);
                    if st.override_state == OverrideState::Active {
                        st.last_refresh_at = Some(Utc::now());
                    }
                }
                Err(e) => {
                    warn!("Override refresh failed, dropping to idle: {}", e);
                    inner.fail_to_idle();
                    break;
                }
            }
        }
    }

    /// Active → Idle after a refresh failure
    fn fail_to_idle(&self) {
        let stopped = {
            let mut st = lock(&self.state);
            st.override_state = OverrideState::Idle;
            st.channels.clear();
            st.deadline_generation += 1;
            st.refresh_task = None;
            st.deadline_task.take()
        };
        if let Some(task) = stopped {
            task.abort();
        }
    }
}

/// Lay the channel map out as the 18-value wire frame. Channels without an
/// entry carry the release value.
fn build_override_frame(channels: &BTreeMap<u8, u16>) -> [u16; RC_OVERRIDE_CHANNELS] {
    let mut frame = [OVERRIDE_RELEASE; RC_OVERRIDE_CHANNELS];
    for (&channel, &value) in channels {
        frame[(channel - 1) as usize] = value;
    }
    frame
}

/// Map -100..=100 percent onto PWM around neutral
fn percent_to_pwm(percent: f32) -> u16 {
    let percent = percent.clamp(-100.0, 100.0);
    (1500.0 + percent * PWM_PER_PERCENT).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::mocks::{MockConnector, MockTransport, SentFrame};

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    /// Drive the paused clock forward in small steps.
    ///
    /// Yields first so freshly spawned tasks arm their timers at the
    /// current instant, then advances in increments with a settle between
    /// each so periodic `interval`/`sleep` loops fire once per elapsed
    /// period rather than collapsing into a single tick per jump.
    async fn advance(total: Duration) {
        settle().await;
        let step = Duration::from_millis(50);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            let d = step.min(total - elapsed);
            tokio::time::advance(d).await;
            elapsed += d;
            settle().await;
        }
    }

    async fn connected_stack() -> (RoverController, ConnectionManager, Arc<MockTransport>) {
        let config = Config::default();
        let transport = MockTransport::new();
        transport.push_heartbeat(0, true);
        let connector = MockConnector::with_transport(Arc::clone(&transport));
        let manager = ConnectionManager::new(&config, connector);
        let telemetry = TelemetryAggregator::new(config.telemetry.clone());
        telemetry.attach(&manager);
        let controller = RoverController::new(manager.clone(), telemetry, &config);
        assert!(manager.connect().await);
        (controller, manager, transport)
    }

    fn channels(pairs: &[(u8, u16)]) -> BTreeMap<u8, u16> {
        pairs.iter().copied().collect()
    }

    // ==================== Frame Building Tests ====================

    #[test]
    fn test_build_frame_releases_unset_channels() {
        let frame = build_override_frame(&channels(&[(1, 1700), (3, 1200)]));
        assert_eq!(frame[0], 1700);
        assert_eq!(frame[1], OVERRIDE_RELEASE);
        assert_eq!(frame[2], 1200);
        assert_eq!(frame[17], OVERRIDE_RELEASE);
    }

    #[test]
    fn test_percent_to_pwm() {
        assert_eq!(percent_to_pwm(0.0), 1500);
        assert_eq!(percent_to_pwm(100.0), 2000);
        assert_eq!(percent_to_pwm(-100.0), 1000);
        assert_eq!(percent_to_pwm(50.0), 1750);
        assert_eq!(percent_to_pwm(250.0), 2000); // clamped
    }

    // ==================== set_override Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_set_override_activates_and_sends() {
        let (controller, _manager, transport) = connected_stack().await;

        assert!(
            controller
                .set_override(&channels(&[(1, 1700), (2, 1300)]), None)
                .await
        );

        let status = controller.control_status();
        assert!(status.active);
        assert_eq!(status.channels.get(&1), Some(&1700));
        assert_eq!(status.channels.get(&2), Some(&1300));
        assert!(status.last_refresh_at.is_some());

        let frames = transport.override_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], 1700);
        assert_eq!(frames[0][1], 1300);
        assert_eq!(frames[0][2], OVERRIDE_RELEASE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_clamped_to_limit() {
        let (controller, _manager, transport) = connected_stack().await;

        // Limit is 1800: a 2500 request must go out as exactly 1800
        assert!(controller.set_override(&channels(&[(1, 2500)]), None).await);
        assert_eq!(transport.override_frames()[0][0], 1800);

        // Symmetric lower bound: 3000 - 1800 = 1200
        assert!(controller.set_override(&channels(&[(1, 900)]), None).await);
        assert_eq!(transport.override_frames()[1][0], 1200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_channels_get_generic_clamp() {
        let (controller, _manager, transport) = connected_stack().await;

        assert!(
            controller
                .set_override(&channels(&[(5, 2500), (6, 500)]), None)
                .await
        );
        let frame = transport.override_frames()[0];
        assert_eq!(frame[4], 2000);
        assert_eq!(frame[5], 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_safety_limits_keep_generic_clamp() {
        let (controller, _manager, transport) = connected_stack().await;
        controller.set_safety_limits_enabled(false);

        assert!(controller.set_override(&channels(&[(1, 1950)]), None).await);
        assert_eq!(transport.override_frames()[0][0], 1950);

        assert!(controller.set_override(&channels(&[(1, 2500)]), None).await);
        assert_eq!(transport.override_frames()[1][0], 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_override_rejected_when_disconnected() {
        let config = Config::default();
        let manager = ConnectionManager::new(&config, MockConnector::new());
        let telemetry = TelemetryAggregator::new(config.telemetry.clone());
        let controller = RoverController::new(manager, telemetry, &config);

        assert!(!controller.set_override(&channels(&[(1, 1600)]), None).await);
        assert!(!controller.control_status().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_override_ignores_invalid_channels() {
        let (controller, _manager, transport) = connected_stack().await;

        assert!(
            controller
                .set_override(&channels(&[(0, 1600), (19, 1600), (4, 1600)]), None)
                .await
        );
        let frame = transport.override_frames()[0];
        assert_eq!(frame[3], 1600);

        // Nothing valid requested: rejected without state change
        assert!(!controller.set_override(&channels(&[(19, 1600)]), None).await);
    }

    // ==================== Refresh Loop Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_active_override_is_resent() {
        let (controller, _manager, transport) = connected_stack().await;

        assert!(
            controller
                .set_override(&channels(&[(1, 1700), (2, 1300)]), None)
                .await
        );
        advance(Duration::from_millis(600)).await;
        settle().await;

        let frames = transport.override_frames();
        assert!(frames.len() >= 2, "expected a refresh resend");
        assert_eq!(frames[0], frames[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_drops_to_idle() {
        let (controller, _manager, transport) = connected_stack().await;

        assert!(controller.set_override(&channels(&[(1, 1700)]), None).await);
        transport.set_fail_overrides(true);

        advance(Duration::from_millis(600)).await;
        settle().await;

        let status = controller.control_status();
        assert!(!status.active);
        assert!(status.channels.is_empty());
    }

    // ==================== Safety Deadline Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_deadline_auto_clears_override() {
        let (controller, _manager, transport) = connected_stack().await;

        assert!(
            controller
                .set_override(
                    &channels(&[(1, 1700), (2, 1300)]),
                    Some(Duration::from_secs(2)),
                )
                .await
        );

        advance(Duration::from_millis(2200)).await;
        settle().await;

        let status = controller.control_status();
        assert!(!status.active);
        assert!(status.channels.is_empty());

        // The final frame releases every channel
        let frames = transport.override_frames();
        let last = frames.last().unwrap();
        assert_eq!(*last, [OVERRIDE_RELEASE; RC_OVERRIDE_CHANNELS]);
        // And no further frames after the clear
        let count = frames.len();
        advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(transport.override_frames().len(), count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_override_supersedes_deadline() {
        let (controller, _manager, _transport) = connected_stack().await;

        assert!(
            controller
                .set_override(&channels(&[(1, 1700)]), Some(Duration::from_secs(2)))
                .await
        );

        advance(Duration::from_millis(1500)).await;
        settle().await;
        assert!(
            controller
                .set_override(&channels(&[(1, 1750)]), Some(Duration::from_secs(2)))
                .await
        );

        // Original deadline would have fired at 2.0s; the renewal holds
        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert!(controller.control_status().active);

        // The renewed deadline fires at 3.5s
        advance(Duration::from_millis(1200)).await;
        settle().await;
        assert!(!controller.control_status().active);
    }

    // ==================== clear_override Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_clear_override_is_idempotent() {
        let (controller, _manager, _transport) = connected_stack().await;

        assert!(controller.set_override(&channels(&[(1, 1700)]), None).await);
        assert!(controller.clear_override(None).await);
        assert!(!controller.control_status().active);

        // Second clear: still idle, still no error
        assert!(controller.clear_override(None).await);
        assert!(!controller.control_status().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_clear_keeps_remaining_channels() {
        let (controller, _manager, transport) = connected_stack().await;

        assert!(
            controller
                .set_override(&channels(&[(1, 1700), (2, 1300)]), None)
                .await
        );
        assert!(controller.clear_override(Some(&[1])).await);

        let status = controller.control_status();
        assert!(status.active, "one channel still overridden");
        assert_eq!(status.channels.get(&2), Some(&1300));
        assert!(status.channels.get(&1).is_none());

        let last = *transport.override_frames().last().unwrap();
        assert_eq!(last[0], OVERRIDE_RELEASE);
        assert_eq!(last[1], 1300);

        assert!(controller.clear_override(None).await);
        assert!(!controller.control_status().active);
    }

    // ==================== Emergency Stop Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_clears_and_latches() {
        let (controller, _manager, transport) = connected_stack().await;

        assert!(
            controller
                .set_override(&channels(&[(1, 1700), (2, 1300)]), None)
                .await
        );
        assert!(controller.emergency_stop().await);

        let status = controller.control_status();
        assert!(!status.active);
        assert!(status.channels.is_empty());
        assert!(status.emergency_stop_active);

        // Forced into the safe holding mode
        assert!(transport.sent().iter().any(|frame| matches!(
            frame,
            SentFrame::Mode { base_mode: 1, custom_mode: 4 }
        )));

        // Blocked until released
        assert!(!controller.set_override(&channels(&[(1, 1600)]), None).await);
        assert!(controller.release_emergency_stop());
        assert!(controller.set_override(&channels(&[(1, 1600)]), None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_does_not_resume_override() {
        let (controller, _manager, _transport) = connected_stack().await;

        assert!(controller.set_override(&channels(&[(1, 1700)]), None).await);
        assert!(controller.emergency_stop().await);
        assert!(controller.release_emergency_stop());

        let status = controller.control_status();
        assert!(!status.active);
        assert!(status.channels.is_empty());
    }

    // ==================== Mode / Arm Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_set_mode_sends_custom_mode() {
        let (controller, _manager, transport) = connected_stack().await;

        assert!(controller.set_mode(RoverMode::Auto).await);
        assert!(transport.sent().iter().any(|frame| matches!(
            frame,
            SentFrame::Mode { base_mode: 1, custom_mode: 10 }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_and_disarm_commands() {
        let (controller, _manager, transport) = connected_stack().await;

        assert!(controller.arm(true).await);
        assert!(controller.arm(false).await);

        let arm_commands = transport.commands(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM);
        assert_eq!(arm_commands.len(), 2);
        assert_eq!(arm_commands[0][0], 1.0);
        assert_eq!(arm_commands[1][0], 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_rejected_when_disconnected() {
        let config = Config::default();
        let manager = ConnectionManager::new(&config, MockConnector::new());
        let telemetry = TelemetryAggregator::new(config.telemetry.clone());
        let controller = RoverController::new(manager, telemetry, &config);

        assert!(!controller.set_mode(RoverMode::Manual).await);
        assert!(!controller.arm(true).await);
    }

    // ==================== Drive Helper Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_movement_percent_maps_to_pwm() {
        let (controller, _manager, transport) = connected_stack().await;

        assert!(controller.set_movement_percent(50.0, -30.0).await);
        let frame = transport.override_frames()[0];
        assert_eq!(frame[0], 1750);
        assert_eq!(frame[1], 1350);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_throttle_percent_is_clamped_by_safety() {
        let (controller, _manager, transport) = connected_stack().await;

        // 100% would be 2000, the 1800 throttle limit applies
        assert!(controller.set_throttle_percent(100.0).await);
        assert_eq!(transport.override_frames()[0][0], 1800);
    }

    // ==================== Status Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_rover_status_merges_sources() {
        let (controller, _manager, _transport) = connected_stack().await;

        assert!(controller.set_override(&channels(&[(1, 1700)]), None).await);
        let status = controller.rover_status();
        assert!(status.connection_status);
        assert!(status.control.active);
        assert!(!status.dashboard.offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_active_override() {
        let (controller, _manager, transport) = connected_stack().await;

        assert!(controller.set_override(&channels(&[(1, 1700)]), None).await);
        controller.shutdown().await;

        assert!(!controller.control_status().active);
        let count = transport.override_frames().len();
        advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(transport.override_frames().len(), count);
    }
}
