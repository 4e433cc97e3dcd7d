// High-level stage driver
//
// Wraps one APT controller channel and exposes home / move / position / stop in
// degrees. Every blocking wait is bounded and can be cancelled via the stage's token.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::apt::{
    AptBus, Counter, DcStatus, Frame, GENERIC_USB, HwInfo, MessageId, Result, StageError,
};
use super::discovery;
use super::link::{Link, SerialLink};
use super::units::{ScaleFactors, TravelRange};
use crate::wait::{BoundedWait, DEFAULT_POLL_INTERVAL};

/// Homing a rotation mount from the far side can take well over a minute
pub const HOME_TIMEOUT: Duration = Duration::from_secs(120);
pub const MOVE_TIMEOUT: Duration = Duration::from_secs(60);
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// How close a settled readback must be to the commanded angle
pub const DEFAULT_SETTLE_TOLERANCE_DEG: f64 = 0.05;

const ENABLE: u8 = 0x01;
const DISABLE: u8 = 0x02;
const STOP_IMMEDIATE: u8 = 0x01;

/// Everything the driver needs to know about one stage
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub channel: u8,
    pub destination: u8,
    pub scale: ScaleFactors,
    pub travel: TravelRange,
    pub settle_tolerance_deg: f64,
    pub home_timeout: Duration,
    pub move_timeout: Duration,
    pub query_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            channel: 1,
            destination: GENERIC_USB,
            scale: ScaleFactors::default(),
            travel: TravelRange::default(),
            settle_tolerance_deg: DEFAULT_SETTLE_TOLERANCE_DEG,
            home_timeout: HOME_TIMEOUT,
            move_timeout: MOVE_TIMEOUT,
            query_timeout: QUERY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// One motorized axis
pub struct Stage {
    serial: String,
    bus: AptBus,
    settings: StageSettings,
    cancel: CancellationToken,
}

impl Stage {
    /// Find the controller with `serial` among the serial ports and open it
    pub fn open(serial: &str, settings: StageSettings) -> Result<Self> {
        let port = discovery::locate(serial)?;
        info!("Opening stage {} on {}", serial, port);
        let link = SerialLink::open(&port)?;
        Ok(Self::with_link(serial, Box::new(link), settings))
    }

    /// Use an already-open link (simulator, tests)
    pub fn with_link(serial: &str, link: Box<dyn Link>, settings: StageSettings) -> Self {
        let bus = AptBus::new(link, settings.destination);
        Self {
            serial: serial.to_string(),
            bus,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the token that aborts in-flight waits
    pub fn set_cancel_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    fn wait(&self, timeout: Duration) -> BoundedWait {
        BoundedWait::new(timeout)
            .poll_every(self.settings.poll_interval)
            .cancel_on(self.cancel.clone())
    }

    fn channel(&self) -> u8 {
        self.settings.channel
    }

    /// Prepare the controller to send completion messages, then enable the channel.
    ///
    /// Some cubes only report MOVE_HOMED / MOVE_COMPLETED after they have been
    /// asked for hardware info; benchtop units additionally need NO_FLASH_PROGRAMMING.
    pub fn initialize(&mut self) -> Result<()> {
        info!("Initializing stage {}", self.serial);
        let dest = self.bus.destination();
        self.bus
            .command(Frame::short(MessageId::HwReqInfo, 0, 0, dest))?;
        self.bus
            .command(Frame::short(MessageId::HwNoFlashProgramming, 0, 0, dest))?;
        self.enable()
    }

    pub fn hardware_info(&mut self) -> Result<HwInfo> {
        let request = Frame::short(MessageId::HwReqInfo, 0, 0, self.bus.destination());
        let wait = self.wait(self.settings.query_timeout);
        let reply = self.bus.transact(request, MessageId::HwGetInfo, &wait)?;
        HwInfo::parse(&reply.data)
    }

    /// Blink the front-panel LED
    pub fn identify(&mut self) -> Result<()> {
        let frame = Frame::short(MessageId::ModIdentify, self.channel(), 0, self.bus.destination());
        self.bus.command(frame)
    }

    /// Power the motor coils
    pub fn enable(&mut self) -> Result<()> {
        debug!("Enabling channel {} on {}", self.channel(), self.serial);
        let frame = Frame::short(
            MessageId::ModSetChanEnableState,
            self.channel(),
            ENABLE,
            self.bus.destination(),
        );
        self.bus.command(frame)
    }

    /// Cut power to the motor coils; the stage ignores moves until re-enabled
    pub fn disable(&mut self) -> Result<()> {
        info!("Disabling channel {} on {}", self.channel(), self.serial);
        let frame = Frame::short(
            MessageId::ModSetChanEnableState,
            self.channel(),
            DISABLE,
            self.bus.destination(),
        );
        self.bus.command(frame)
    }

    /// Home the stage, blocking until the controller reports completion
    pub fn home(&mut self) -> Result<()> {
        info!("Homing stage {}", self.serial);
        let frame = Frame::short(MessageId::MotMoveHome, self.channel(), 0, self.bus.destination());
        let wait = self.wait(self.settings.home_timeout);
        self.bus.transact(frame, MessageId::MotMoveHomed, &wait)?;
        info!("Stage {} homed", self.serial);
        Ok(())
    }

    /// Move to an absolute angle and block until the move completes.
    ///
    /// Out-of-range targets are rejected before anything is sent. Returns the
    /// settled position reported by the controller.
    pub fn move_absolute(&mut self, degrees: f64) -> Result<f64> {
        let travel = self.settings.travel;
        if !travel.contains(degrees) {
            return Err(StageError::OutOfRange {
                requested: degrees,
                min: travel.min_deg,
                max: travel.max_deg,
            });
        }

        let counts = self.settings.scale.to_counts(degrees);
        debug!("Moving {} to {:.4}° ({} counts)", self.serial, degrees, counts);

        let data = Counter {
            channel: self.channel() as u16,
            counts,
        }
        .encode();
        let frame = Frame::long(MessageId::MotMoveAbsolute, self.bus.destination(), data);
        let wait = self.wait(self.settings.move_timeout);
        let reply = self
            .bus
            .transact(frame, MessageId::MotMoveCompleted, &wait)?;

        // DC controllers attach a status block; others send a bare header
        let settled = if reply.data.len() >= DcStatus::LEN {
            let status = DcStatus::parse(&reply.data)?;
            self.settings.scale.to_degrees(status.counts)
        } else {
            self.position()?
        };

        if (settled - degrees).abs() > self.settings.settle_tolerance_deg {
            warn!(
                "Stage {} settled at {:.4}°, commanded {:.4}°",
                self.serial, settled, degrees
            );
        }
        Ok(settled)
    }

    /// Current position from the position counter
    pub fn position(&mut self) -> Result<f64> {
        let counter = self.query_counter(MessageId::MotReqPosCounter, MessageId::MotGetPosCounter)?;
        Ok(self.settings.scale.to_degrees(counter.counts))
    }

    /// Current position from the encoder counter
    pub fn encoder_position(&mut self) -> Result<f64> {
        let counter = self.query_counter(MessageId::MotReqEncCounter, MessageId::MotGetEncCounter)?;
        Ok(self.settings.scale.to_degrees(counter.counts))
    }

    fn query_counter(&mut self, request: MessageId, reply: MessageId) -> Result<Counter> {
        let frame = Frame::short(request, self.channel(), 0, self.bus.destination());
        let wait = self.wait(self.settings.query_timeout);
        let reply = self.bus.transact(frame, reply, &wait)?;
        Counter::parse(&reply.data)
    }

    /// Position, velocity and status bits in one round trip
    pub fn status(&mut self) -> Result<DcStatus> {
        let frame = Frame::short(
            MessageId::MotReqDcStatusUpdate,
            self.channel(),
            0,
            self.bus.destination(),
        );
        let wait = self.wait(self.settings.query_timeout);
        let reply = self
            .bus
            .transact(frame, MessageId::MotGetDcStatusUpdate, &wait)?;
        DcStatus::parse(&reply.data)
    }

    /// Stop immediately. Best effort: does not wait for MOVE_STOPPED.
    pub fn stop(&mut self) -> Result<()> {
        info!("Stopping stage {}", self.serial);
        let frame = Frame::short(
            MessageId::MotMoveStop,
            self.channel(),
            STOP_IMMEDIATE,
            self.bus.destination(),
        );
        self.bus.command(frame)
    }

    /// Release the serial port
    pub fn close(self) {
        info!("Closing stage {}", self.serial);
        // Drop stops the motor and releases the link
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        // Stop the motor when the handle goes away
        if let Err(e) = self.stop() {
            warn!("Failed to stop stage {} on drop: {}", self.serial, e);
        }
    }
}
