//! Input shaping between the operator's controls and the link.
//!
//! Two input sources feed this module: discrete trigger commands from the
//! buttons and a continuous position stream from the joystick, sampled on
//! every UI frame. The dispatcher quantizes, de-duplicates and rate-limits
//! that stream so the embedded side only ever sees a command when something
//! actually changed, and guarantees a `stop` when the stick is released.

pub mod dispatcher;
pub mod quantize;

pub use dispatcher::{DispatcherHandle, InputDispatcher};

use crate::link::ControlLink;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Ceiling of the PWM speed scale understood by the vehicle.
pub const SPEED_MAX: u16 = 1023;

/// One normalized joystick sample.
///
/// `y` is positive toward forward; the widget converts screen coordinates
/// (where y grows downward) before handing samples in. `magnitude` is the
/// radial distance from center, clamped to the stick's travel radius and
/// normalized to `[0, 1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PositionSample {
    pub x: f32,
    pub y: f32,
    pub magnitude: f32,
    /// Whether the stick is currently pressed
    pub active: bool,
}

/// The mutually exclusive movement commands of the directional channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl Direction {
    pub fn command(self) -> Command {
        match self {
            Direction::Forward => Command::Forward,
            Direction::Backward => Command::Backward,
            Direction::Left => Command::Left,
            Direction::Right => Command::Right,
            Direction::Stop => Command::Stop,
        }
    }
}

/// Command vocabulary of the wire protocol, one line each.
///
/// The vehicle firmware fixes these words; `Display` renders the exact wire
/// form, without the line terminator (the link adds that).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
    LedOn,
    LedOff,
    ForkliftUp,
    ForkliftDown,
    CamA,
    CamB,
    /// Base speed for PWM actions, 0..=1023
    SetSpeed(u16),
}

impl Command {
    /// The directional channel this command belongs to, if any.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Command::Forward => Some(Direction::Forward),
            Command::Backward => Some(Direction::Backward),
            Command::Left => Some(Direction::Left),
            Command::Right => Some(Direction::Right),
            Command::Stop => Some(Direction::Stop),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Forward => write!(f, "forward"),
            Command::Backward => write!(f, "backward"),
            Command::Left => write!(f, "left"),
            Command::Right => write!(f, "right"),
            Command::Stop => write!(f, "stop"),
            Command::LedOn => write!(f, "led_on"),
            Command::LedOff => write!(f, "led_off"),
            Command::ForkliftUp => write!(f, "forklift_up"),
            Command::ForkliftDown => write!(f, "forklift_down"),
            Command::CamA => write!(f, "cam_a"),
            Command::CamB => write!(f, "cam_b"),
            Command::SetSpeed(value) => write!(f, "set_speed:{}", value),
        }
    }
}

/// Input events consumed by the dispatcher task.
#[derive(Clone, Debug)]
pub enum InputEvent {
    /// Discrete button command, transmitted immediately
    Trigger(Command),
    /// Continuous joystick sample, rate-limited by the tick loop
    Sample(PositionSample),
    /// Manual speed control released at the given value
    SpeedCommitted(u16),
    /// The link dropped; reset to neutral without transmitting
    LinkDown,
}

/// Configuration for the dispatcher's continuous-input handling.
#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    /// Re-evaluation period while the stick is held, in milliseconds
    pub tick_interval_ms: u64,

    /// Magnitude below which a sample counts as centered
    pub dead_zone: f32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 80, // slow enough for the serial-fed motor driver, fast enough to feel direct
            dead_zone: 0.08,      // 8% of stick travel
        }
    }
}

/// Errors when feeding the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatcher task is gone or its queue is full
    #[error("Failed to queue input event: {0}")]
    ChannelError(String),
}

/// Outbound seam between the dispatcher and the transport.
pub trait CommandSink: Send + Sync + 'static {
    /// Hands one command line to the transport, fire-and-forget.
    fn submit(&self, line: String);
}

impl CommandSink for ControlLink {
    fn submit(&self, line: String) {
        self.send(line);
    }
}

impl CommandSink for mpsc::Sender<String> {
    fn submit(&self, line: String) {
        if let Err(e) = self.try_send(line) {
            warn!("Command sink rejected line: {}", e);
        }
    }
}
