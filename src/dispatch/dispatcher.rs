//! The dispatcher task: turns trigger events and frame-rate joystick
//! samples into the low-frequency command stream the vehicle can keep up
//! with.
//!
//! One task owns all dispatch state; every input funnels through a single
//! channel, so there is exactly one writer for the de-duplication state and
//! the periodic re-evaluation can never race a sample update. The speed
//! channel is manual-only: it is driven by [`InputEvent::SpeedCommitted`]
//! from the shell's speed control and never derived from sample magnitude,
//! so setting a speed for the forklift or camera survives driving around.

use super::quantize::quantize;
use super::{
    Command, CommandSink, DispatchError, DispatcherSettings, Direction, InputEvent,
    PositionSample, SPEED_MAX,
};
use crate::persistence::CommandLog;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

/// Capacity of the input channel; sized for frame-rate sample bursts.
const INPUT_BUFFER: usize = 256;

/// Handle for feeding the dispatcher task.
///
/// All methods are fire-and-forget and safe from the UI timeline; they fail
/// only when the dispatcher task itself is gone or hopelessly backed up.
#[derive(Clone)]
pub struct DispatcherHandle {
    input: mpsc::Sender<InputEvent>,
}

impl DispatcherHandle {
    /// Spawns the dispatcher task and returns the handle feeding it.
    ///
    /// `sink` receives every transmitted command line (the control link in
    /// production); `log` gets one entry per transmitted command.
    pub fn spawn(
        settings: Option<DispatcherSettings>,
        sink: Arc<dyn CommandSink>,
        log: CommandLog,
    ) -> Self {
        let settings = settings.unwrap_or_default();
        info!("Spawning input dispatcher with settings: {:?}", settings);

        let (input, input_rx) = mpsc::channel(INPUT_BUFFER);
        let dispatcher = InputDispatcher::new(settings, sink, log);
        tokio::spawn(dispatcher.run(input_rx));

        Self { input }
    }

    /// Discrete button command, transmitted immediately.
    pub fn trigger(&self, command: Command) -> Result<(), DispatchError> {
        self.push(InputEvent::Trigger(command))
    }

    /// Latest joystick sample; call on every UI frame while the stick moves.
    pub fn sample(&self, sample: PositionSample) -> Result<(), DispatchError> {
        self.push(InputEvent::Sample(sample))
    }

    /// Manual speed control released at `value` (clamped to 0..=1023).
    pub fn commit_speed(&self, value: u16) -> Result<(), DispatchError> {
        self.push(InputEvent::SpeedCommitted(value))
    }

    /// The link reported loss; resets dispatch state to neutral.
    pub fn link_down(&self) -> Result<(), DispatchError> {
        self.push(InputEvent::LinkDown)
    }

    fn push(&self, event: InputEvent) -> Result<(), DispatchError> {
        self.input
            .try_send(event)
            .map_err(|e| DispatchError::ChannelError(e.to_string()))
    }
}

/// Owns all dispatch state; lives inside the spawned task.
///
/// `last_direction` always reflects the most recent directional command
/// handed to the sink; it exists purely to suppress redundant sends and is
/// only reset outside a transmission by [`InputEvent::LinkDown`].
pub struct InputDispatcher {
    settings: DispatcherSettings,
    sink: Arc<dyn CommandSink>,
    log: CommandLog,
    latest: PositionSample,
    continuous_active: bool,
    last_direction: Direction,
    last_speed: Option<u16>,
}

impl InputDispatcher {
    pub fn new(settings: DispatcherSettings, sink: Arc<dyn CommandSink>, log: CommandLog) -> Self {
        Self {
            settings,
            sink,
            log,
            latest: PositionSample::default(),
            continuous_active: false,
            last_direction: Direction::Stop,
            last_speed: None,
        }
    }

    /// Event loop; returns once every handle is dropped.
    pub async fn run(mut self, mut input: mpsc::Receiver<InputEvent>) {
        let mut tick = interval(Duration::from_millis(self.settings.tick_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = input.recv() => match event {
                    Some(event) => self.handle_input(event),
                    None => break,
                },
                _ = tick.tick(), if self.continuous_active => self.evaluate(),
            }
        }

        // Handles gone mid-drive: leave the vehicle stationary.
        if self.continuous_active && self.last_direction != Direction::Stop {
            self.transmit(Command::Stop);
        }
        info!("Input dispatcher stopped");
    }

    fn handle_input(&mut self, event: InputEvent) {
        match event {
            InputEvent::Trigger(command) => {
                if let Some(direction) = command.direction() {
                    self.last_direction = direction;
                }
                self.transmit(command);
            }
            InputEvent::Sample(sample) => self.handle_sample(sample),
            InputEvent::SpeedCommitted(value) => {
                let value = value.min(SPEED_MAX);
                debug!("Speed committed: {} (was {:?})", value, self.last_speed);
                self.last_speed = Some(value);
                self.transmit(Command::SetSpeed(value));
            }
            InputEvent::LinkDown => {
                debug!("Link down, resetting dispatch state");
                self.continuous_active = false;
                self.latest = PositionSample::default();
                self.last_direction = Direction::Stop;
                self.last_speed = None;
            }
        }
    }

    fn handle_sample(&mut self, sample: PositionSample) {
        self.latest = sample;
        if sample.active {
            if !self.continuous_active {
                debug!("Continuous input engaged");
                self.continuous_active = true;
                // First evaluation right away; the tick takes over from here.
                self.evaluate();
            }
        } else if self.continuous_active {
            debug!("Continuous input released");
            self.continuous_active = false;
            if self.last_direction != Direction::Stop {
                self.last_direction = Direction::Stop;
                self.transmit(Command::Stop);
            }
        }
    }

    /// One re-evaluation: quantize the latest sample, send only on change.
    fn evaluate(&mut self) {
        let desired = quantize(self.latest, self.settings.dead_zone);
        if desired != self.last_direction {
            self.last_direction = desired;
            self.transmit(desired.command());
        }
    }

    fn transmit(&self, command: Command) {
        let line = command.to_string();
        debug!("Transmitting command: {}", line);
        self.sink.submit(line.clone());
        self.log.append(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    fn spawn_dispatcher() -> (DispatcherHandle, mpsc::Receiver<String>, CommandLog) {
        let (tx, rx) = mpsc::channel(32);
        let log = CommandLog::new();
        let handle = DispatcherHandle::spawn(None, Arc::new(tx), log.clone());
        (handle, rx, log)
    }

    fn stick(x: f32, y: f32) -> PositionSample {
        PositionSample {
            x,
            y,
            magnitude: (x * x + y * y).sqrt().min(1.0),
            active: true,
        }
    }

    fn released() -> PositionSample {
        PositionSample::default()
    }

    async fn expect_line(rx: &mut mpsc::Receiver<String>) -> String {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("sink closed")
    }

    /// Lets the dispatcher drain everything queued up to now.
    async fn settle(rx: &mut mpsc::Receiver<String>) {
        sleep(Duration::from_millis(410)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "unexpected extra command");
    }

    #[tokio::test]
    async fn trigger_commands_transmit_immediately() {
        let (handle, mut rx, log) = spawn_dispatcher();

        handle.trigger(Command::LedOn).unwrap();
        assert_eq!(expect_line(&mut rx).await, "led_on");
        assert_eq!(log.count(), 1);
        assert_eq!(log.recent(1)[0].command, "led_on");
    }

    #[tokio::test(start_paused = true)]
    async fn held_direction_is_sent_once() {
        let (handle, mut rx, _log) = spawn_dispatcher();

        handle.sample(stick(0.6, 0.1)).unwrap();
        assert_eq!(expect_line(&mut rx).await, "right");

        // More frames and several ticks with the same quantized direction.
        for _ in 0..5 {
            handle.sample(stick(0.62, 0.08)).unwrap();
            sleep(Duration::from_millis(90)).await;
        }
        assert!(rx.try_recv().is_err(), "duplicate directional command");
    }

    #[tokio::test(start_paused = true)]
    async fn direction_change_is_picked_up_by_the_tick() {
        let (handle, mut rx, _log) = spawn_dispatcher();

        handle.sample(stick(0.6, 0.1)).unwrap();
        assert_eq!(expect_line(&mut rx).await, "right");

        handle.sample(stick(0.1, 0.6)).unwrap();
        assert_eq!(expect_line(&mut rx).await, "forward");
    }

    #[tokio::test(start_paused = true)]
    async fn release_triggers_a_single_stop() {
        let (handle, mut rx, _log) = spawn_dispatcher();

        handle.sample(stick(0.0, 0.7)).unwrap();
        assert_eq!(expect_line(&mut rx).await, "forward");

        handle.sample(released()).unwrap();
        assert_eq!(expect_line(&mut rx).await, "stop");

        // Tick loop is off after release; nothing else goes out.
        settle(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn release_inside_dead_zone_sends_nothing() {
        let (handle, mut rx, _log) = spawn_dispatcher();

        handle.sample(stick(0.02, 0.03)).unwrap();
        sleep(Duration::from_millis(200)).await;
        handle.sample(released()).unwrap();

        settle(&mut rx).await;
    }

    #[tokio::test]
    async fn speed_commit_clamps_and_formats() {
        let (handle, mut rx, _log) = spawn_dispatcher();

        handle.commit_speed(512).unwrap();
        assert_eq!(expect_line(&mut rx).await, "set_speed:512");

        handle.commit_speed(4096).unwrap();
        assert_eq!(expect_line(&mut rx).await, "set_speed:1023");
    }

    #[tokio::test(start_paused = true)]
    async fn directional_trigger_primes_deduplication() {
        let (handle, mut rx, _log) = spawn_dispatcher();

        handle.trigger(Command::Forward).unwrap();
        assert_eq!(expect_line(&mut rx).await, "forward");

        // The stick agreeing with the button produces nothing new.
        handle.sample(stick(0.1, 0.5)).unwrap();
        settle(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn link_down_resets_the_direction_state() {
        let (handle, mut rx, _log) = spawn_dispatcher();

        handle.sample(stick(0.6, 0.1)).unwrap();
        assert_eq!(expect_line(&mut rx).await, "right");

        handle.link_down().unwrap();

        // After a reconnect the same heading must be transmitted again.
        handle.sample(stick(0.6, 0.1)).unwrap();
        assert_eq!(expect_line(&mut rx).await, "right");
    }
}
