//! # Transport Module
//!
//! Narrow boundary to the MAVLink codec/transport library.
//!
//! The rest of the crate never touches wire encoding: it consumes
//! already-decoded [`MavMessage`] values and a handful of typed send
//! operations through the [`LinkTransport`] trait. The production
//! implementation lives in [`mavlink`](crate::transport::mavlink); tests use
//! the scripted mock in [`mocks`].

use async_trait::async_trait;
use mavlink::ardupilotmega::{HEARTBEAT_DATA, MavCmd, MavMessage};
use mavlink::MavHeader;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LinkConfig;
use crate::error::Result;

pub mod mavlink_port;

/// Lowest PWM value accepted on any override channel
pub const PWM_MIN: u16 = 1000;

/// Highest PWM value accepted on any override channel
pub const PWM_MAX: u16 = 2000;

/// Neutral stick position
pub const PWM_NEUTRAL: u16 = 1500;

/// Override frame value releasing a channel back to the RC radio
pub const OVERRIDE_RELEASE: u16 = 0;

/// Channels carried by an RC override frame
pub const RC_OVERRIDE_CHANNELS: usize = 18;

/// Servo outputs reported by the vehicle
pub const SERVO_OUTPUT_COUNT: usize = 16;

/// MAVLink address of the vehicle we are commanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub system: u8,
    pub component: u8,
}

/// Message classes the link manager demultiplexes on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Heartbeat,
    Attitude,
    VfrHud,
    GlobalPosition,
    SysStatus,
    BatteryStatus,
    RcChannels,
    ServoOutput,
    GpsRaw,
    StatusText,
    EkfStatus,
    NavController,
    MissionCurrent,
    Other,
}

impl MessageKind {
    /// Classify a decoded message
    pub fn of(message: &MavMessage) -> Self {
        match message {
            MavMessage::HEARTBEAT(_) => Self::Heartbeat,
            MavMessage::ATTITUDE(_) => Self::Attitude,
            MavMessage::VFR_HUD(_) => Self::VfrHud,
            MavMessage::GLOBAL_POSITION_INT(_) => Self::GlobalPosition,
            MavMessage::SYS_STATUS(_) => Self::SysStatus,
            MavMessage::BATTERY_STATUS(_) => Self::BatteryStatus,
            MavMessage::RC_CHANNELS(_) => Self::RcChannels,
            MavMessage::SERVO_OUTPUT_RAW(_) => Self::ServoOutput,
            MavMessage::GPS_RAW_INT(_) => Self::GpsRaw,
            MavMessage::STATUSTEXT(_) => Self::StatusText,
            MavMessage::EKF_STATUS_REPORT(_) => Self::EkfStatus,
            MavMessage::NAV_CONTROLLER_OUTPUT(_) => Self::NavController,
            MavMessage::MISSION_CURRENT(_) => Self::MissionCurrent,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One open channel to a vehicle.
///
/// All operations are non-fatal at this boundary: send failures surface as
/// `Err`, receive operations time out to `None`. `close` is idempotent.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Block up to `timeout` for the first vehicle heartbeat.
    ///
    /// Returns the sender address and the heartbeat payload, or `None` on
    /// timeout. Non-heartbeat traffic arriving first is discarded.
    async fn wait_heartbeat(&self, timeout: Duration) -> Option<(Target, HEARTBEAT_DATA)>;

    /// Poll for the next decoded message.
    ///
    /// Waits at most a short internal interval; `None` means nothing
    /// arrived, not end-of-stream.
    async fn receive_next(&self) -> Option<(MavHeader, MavMessage)>;

    /// Emit a GCS heartbeat so the vehicle sees us as alive
    async fn send_heartbeat(&self) -> Result<()>;

    /// Send a `COMMAND_LONG` with up to seven parameters
    async fn send_command(&self, target: Target, command: MavCmd, params: [f32; 7]) -> Result<()>;

    /// Send a raw 18-channel RC override frame
    async fn send_rc_override(
        &self,
        target: Target,
        values: [u16; RC_OVERRIDE_CHANNELS],
    ) -> Result<()>;

    /// Request a mode change (`base_mode` flags plus custom mode number)
    async fn send_mode(&self, target: Target, base_mode: u8, custom_mode: u32) -> Result<()>;

    /// Write a named float parameter on the vehicle
    async fn send_param_set(&self, target: Target, name: &str, value: f32) -> Result<()>;

    /// Legacy bulk stream-rate request (`REQUEST_DATA_STREAM`)
    async fn send_stream_request(
        &self,
        target: Target,
        stream_id: u8,
        rate_hz: u16,
        start: bool,
    ) -> Result<()>;

    /// Shut the channel down. Idempotent.
    fn close(&self);
}

/// Opens [`LinkTransport`] channels for a configured endpoint.
///
/// Split from the transport itself so reconnection can produce a fresh
/// channel, and so tests can hand out scripted transports.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self, config: &LinkConfig) -> Result<Arc<dyn LinkTransport>>;
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::error::RoverLinkError;
    use mavlink::ardupilotmega::{MavAutopilot, MavModeFlag, MavState, MavType};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Interval the mock sleeps between polls of its scripted queue
    const MOCK_POLL: Duration = Duration::from_millis(25);

    /// Everything a mock transport has been asked to send
    #[derive(Debug, Clone, PartialEq)]
    pub enum SentFrame {
        Heartbeat,
        Command {
            command: MavCmd,
            params: [f32; 7],
        },
        Override([u16; RC_OVERRIDE_CHANNELS]),
        Mode {
            base_mode: u8,
            custom_mode: u32,
        },
        ParamSet {
            name: String,
            value: f32,
        },
        StreamRequest {
            stream_id: u8,
            rate_hz: u16,
            start: bool,
        },
    }

    /// Scripted transport for tests.
    ///
    /// Incoming traffic is a queue the test fills; every send is recorded
    /// and can be failed on demand.
    pub struct MockTransport {
        incoming: Mutex<VecDeque<(MavHeader, MavMessage)>>,
        sent: Mutex<Vec<SentFrame>>,
        fail_sends: AtomicBool,
        fail_overrides: AtomicBool,
        closed: AtomicBool,
    }

    impl MockTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                incoming: Mutex::new(VecDeque::new()),
                sent: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
                fail_overrides: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            })
        }

        /// Header used for scripted vehicle traffic (system 1, autopilot 1)
        pub fn vehicle_header() -> MavHeader {
            MavHeader {
                system_id: 1,
                component_id: 1,
                sequence: 0,
            }
        }

        /// Queue a decoded message as if the vehicle had sent it
        pub fn push_message(&self, message: MavMessage) {
            self.incoming
                .lock()
                .unwrap()
                .push_back((Self::vehicle_header(), message));
        }

        /// Queue a rover heartbeat
        pub fn push_heartbeat(&self, custom_mode: u32, armed: bool) {
            let base_mode = if armed {
                MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED
                    | MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED
            } else {
                MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED
            };
            self.push_message(MavMessage::HEARTBEAT(HEARTBEAT_DATA {
                custom_mode,
                mavtype: MavType::MAV_TYPE_GROUND_ROVER,
                autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
                base_mode,
                system_status: MavState::MAV_STATE_ACTIVE,
                mavlink_version: 3,
            }));
        }

        pub fn set_fail_sends(&self, fail: bool) {
            self.fail_sends.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_overrides(&self, fail: bool) {
            self.fail_overrides.store(fail, Ordering::SeqCst);
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn sent(&self) -> Vec<SentFrame> {
            self.sent.lock().unwrap().clone()
        }

        /// Just the override frames, in send order
        pub fn override_frames(&self) -> Vec<[u16; RC_OVERRIDE_CHANNELS]> {
            self.sent()
                .into_iter()
                .filter_map(|frame| match frame {
                    SentFrame::Override(values) => Some(values),
                    _ => None,
                })
                .collect()
        }

        /// Commands sent with the given id
        pub fn commands(&self, command: MavCmd) -> Vec<[f32; 7]> {
            self.sent()
                .into_iter()
                .filter_map(|frame| match frame {
                    SentFrame::Command { command: c, params } if c == command => Some(params),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, frame: SentFrame) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(RoverLinkError::Transport("mock send failure".to_string()));
            }
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }
    }

    #[async_trait]
    impl LinkTransport for MockTransport {
        async fn wait_heartbeat(&self, timeout: Duration) -> Option<(Target, HEARTBEAT_DATA)> {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let popped = self.incoming.lock().unwrap().pop_front();
                match popped {
                    Some((header, MavMessage::HEARTBEAT(data))) => {
                        return Some((
                            Target {
                                system: header.system_id,
                                component: header.component_id,
                            },
                            data,
                        ));
                    }
                    // Pre-heartbeat traffic is discarded, as on a real link
                    Some(_) => continue,
                    None => {
                        if tokio::time::Instant::now() >= deadline {
                            return None;
                        }
                        tokio::time::sleep(MOCK_POLL).await;
                    }
                }
            }
        }

        async fn receive_next(&self) -> Option<(MavHeader, MavMessage)> {
            let popped = self.incoming.lock().unwrap().pop_front();
            match popped {
                Some(entry) => Some(entry),
                None => {
                    tokio::time::sleep(MOCK_POLL).await;
                    None
                }
            }
        }

        async fn send_heartbeat(&self) -> Result<()> {
            self.record(SentFrame::Heartbeat)
        }

        async fn send_command(
            &self,
            _target: Target,
            command: MavCmd,
            params: [f32; 7],
        ) -> Result<()> {
            self.record(SentFrame::Command { command, params })
        }

        async fn send_rc_override(
            &self,
            _target: Target,
            values: [u16; RC_OVERRIDE_CHANNELS],
        ) -> Result<()> {
            if self.fail_overrides.load(Ordering::SeqCst) {
                return Err(RoverLinkError::Transport(
                    "mock override failure".to_string(),
                ));
            }
            self.record(SentFrame::Override(values))
        }

        async fn send_mode(&self, _target: Target, base_mode: u8, custom_mode: u32) -> Result<()> {
            self.record(SentFrame::Mode {
                base_mode,
                custom_mode,
            })
        }

        async fn send_param_set(&self, _target: Target, name: &str, value: f32) -> Result<()> {
            self.record(SentFrame::ParamSet {
                name: name.to_string(),
                value,
            })
        }

        async fn send_stream_request(
            &self,
            _target: Target,
            stream_id: u8,
            rate_hz: u16,
            start: bool,
        ) -> Result<()> {
            self.record(SentFrame::StreamRequest {
                stream_id,
                rate_hz,
                start,
            })
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Connector handing out a fixed sequence of scripted transports.
    ///
    /// Once the queue is exhausted, `open` fails — convenient for
    /// reconnect tests that expect indefinite retries.
    pub struct MockConnector {
        transports: Mutex<VecDeque<Arc<MockTransport>>>,
        open_calls: AtomicUsize,
    }

    impl MockConnector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                transports: Mutex::new(VecDeque::new()),
                open_calls: AtomicUsize::new(0),
            })
        }

        pub fn with_transport(transport: Arc<MockTransport>) -> Arc<Self> {
            let connector = Self::new();
            connector.queue_transport(transport);
            connector
        }

        pub fn queue_transport(&self, transport: Arc<MockTransport>) {
            self.transports.lock().unwrap().push_back(transport);
        }

        pub fn open_calls(&self) -> usize {
            self.open_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransportConnector for MockConnector {
        async fn open(&self, _config: &LinkConfig) -> Result<Arc<dyn LinkTransport>> {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            match self.transports.lock().unwrap().pop_front() {
                Some(transport) => Ok(transport),
                None => Err(RoverLinkError::Transport(
                    "mock endpoint unavailable".to_string(),
                )),
            }
        }
    }
}
