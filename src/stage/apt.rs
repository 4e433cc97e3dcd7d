// Thorlabs APT host-controller protocol
//
// Every message starts with a 6-byte header:
// [id_lo, id_hi, param1, param2, dest, source]
// When bit 7 of dest is set, param1/param2 hold a little-endian data length
// and that many payload bytes follow the header.

use bitflags::bitflags;
use std::time::Duration;
use tracing::{debug, trace};

use super::link::Link;
use crate::wait::{BoundedWait, WaitError};

/// Source byte for everything the host sends
pub const HOST: u8 = 0x01;
/// Destination for single-channel USB controllers (K-Cubes, T-Cubes)
pub const GENERIC_USB: u8 = 0x50;

pub const HEADER_LEN: usize = 6;
const DATA_FLAG: u8 = 0x80;

/// Largest payload any message in our set carries; anything bigger is line noise
const MAX_DATA_LEN: usize = 255;

/// Controllers stop sending status updates unless acknowledged every 50 commands
const STATUS_ACK_INTERVAL: u32 = 40;

/// Message ids
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    HwReqInfo = 0x0005,
    HwGetInfo = 0x0006,
    HwNoFlashProgramming = 0x0018,
    HwResponse = 0x0080,
    HwRichResponse = 0x0081,
    ModSetChanEnableState = 0x0210,
    ModIdentify = 0x0223,
    MotReqEncCounter = 0x040A,
    MotGetEncCounter = 0x040B,
    MotReqPosCounter = 0x0411,
    MotGetPosCounter = 0x0412,
    MotMoveHome = 0x0443,
    MotMoveHomed = 0x0444,
    MotMoveAbsolute = 0x0453,
    MotMoveCompleted = 0x0464,
    MotMoveStop = 0x0465,
    MotMoveStopped = 0x0466,
    MotReqDcStatusUpdate = 0x0490,
    MotGetDcStatusUpdate = 0x0491,
    MotAckDcStatusUpdate = 0x0492,
}

impl MessageId {
    pub fn from_raw(raw: u16) -> Option<Self> {
        use MessageId::*;
        let id = match raw {
            0x0005 => HwReqInfo,
            0x0006 => HwGetInfo,
            0x0018 => HwNoFlashProgramming,
            0x0080 => HwResponse,
            0x0081 => HwRichResponse,
            0x0210 => ModSetChanEnableState,
            0x0223 => ModIdentify,
            0x040A => MotReqEncCounter,
            0x040B => MotGetEncCounter,
            0x0411 => MotReqPosCounter,
            0x0412 => MotGetPosCounter,
            0x0443 => MotMoveHome,
            0x0444 => MotMoveHomed,
            0x0453 => MotMoveAbsolute,
            0x0464 => MotMoveCompleted,
            0x0465 => MotMoveStop,
            0x0466 => MotMoveStopped,
            0x0490 => MotReqDcStatusUpdate,
            0x0491 => MotGetDcStatusUpdate,
            0x0492 => MotAckDcStatusUpdate,
            _ => return None,
        };
        Some(id)
    }

    /// Name as it appears in the vendor protocol document
    pub fn name(self) -> &'static str {
        use MessageId::*;
        match self {
            HwReqInfo => "HW_REQ_INFO",
            HwGetInfo => "HW_GET_INFO",
            HwNoFlashProgramming => "HW_NO_FLASH_PROGRAMMING",
            HwResponse => "HW_RESPONSE",
            HwRichResponse => "HW_RICHRESPONSE",
            ModSetChanEnableState => "MOD_SET_CHANENABLESTATE",
            ModIdentify => "MOD_IDENTIFY",
            MotReqEncCounter => "MOT_REQ_ENCCOUNTER",
            MotGetEncCounter => "MOT_GET_ENCCOUNTER",
            MotReqPosCounter => "MOT_REQ_POSCOUNTER",
            MotGetPosCounter => "MOT_GET_POSCOUNTER",
            MotMoveHome => "MOT_MOVE_HOME",
            MotMoveHomed => "MOT_MOVE_HOMED",
            MotMoveAbsolute => "MOT_MOVE_ABSOLUTE",
            MotMoveCompleted => "MOT_MOVE_COMPLETED",
            MotMoveStop => "MOT_MOVE_STOP",
            MotMoveStopped => "MOT_MOVE_STOPPED",
            MotReqDcStatusUpdate => "MOT_REQ_DCSTATUSUPDATE",
            MotGetDcStatusUpdate => "MOT_GET_DCSTATUSUPDATE",
            MotAckDcStatusUpdate => "MOT_ACK_DCSTATUSUPDATE",
        }
    }
}

/// Error types for stage communication
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("No controller with serial number {serial} found on any serial port")]
    DeviceNotFound { serial: String },

    #[error("Timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        after: Duration,
    },

    #[error("Controller reported fault 0x{code:04X}: {message}")]
    Controller { code: u16, message: String },

    #[error("Position {requested}° is outside the travel range [{min}°, {max}°]")]
    OutOfRange { requested: f64, min: f64, max: f64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid response from controller: {reason}")]
    InvalidResponse { reason: String },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WaitError> for StageError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::TimedOut(after) => StageError::Timeout {
                waiting_for: "response",
                after,
            },
            WaitError::Cancelled => StageError::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, StageError>;

fn invalid(reason: impl Into<String>) -> StageError {
    StageError::InvalidResponse {
        reason: reason.into(),
    }
}

/// One APT message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    /// Header parameter bytes; carry the data length when `data` is non-empty
    pub params: [u8; 2],
    /// Destination without the data flag
    pub dest: u8,
    pub source: u8,
    pub data: Vec<u8>,
}

impl Frame {
    /// Header-only message from the host
    pub fn short(id: MessageId, param1: u8, param2: u8, dest: u8) -> Self {
        Self {
            id: id as u16,
            params: [param1, param2],
            dest,
            source: HOST,
            data: Vec::new(),
        }
    }

    /// Message with a data payload from the host
    pub fn long(id: MessageId, dest: u8, data: Vec<u8>) -> Self {
        let len = (data.len() as u16).to_le_bytes();
        Self {
            id: id as u16,
            params: len,
            dest,
            source: HOST,
            data,
        }
    }

    pub fn message(&self) -> Option<MessageId> {
        MessageId::from_raw(self.id)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.id.to_le_bytes());
        if self.data.is_empty() {
            out.extend_from_slice(&self.params);
            out.push(self.dest);
        } else {
            out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
            out.push(self.dest | DATA_FLAG);
        }
        out.push(self.source);
        out.extend_from_slice(&self.data);
        out
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the buffer holds less than a full frame, and
    /// the number of bytes consumed otherwise.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let id = u16::from_le_bytes([buf[0], buf[1]]);
        let params = [buf[2], buf[3]];
        let dest = buf[4];
        let source = buf[5];

        if dest & DATA_FLAG == 0 {
            let frame = Frame {
                id,
                params,
                dest,
                source,
                data: Vec::new(),
            };
            return Ok(Some((frame, HEADER_LEN)));
        }

        let len = u16::from_le_bytes(params) as usize;
        if len > MAX_DATA_LEN {
            return Err(invalid(format!(
                "Message 0x{:04X} claims {} data bytes",
                id, len
            )));
        }
        let total = HEADER_LEN + len;
        if buf.len() < total {
            return Ok(None);
        }

        let frame = Frame {
            id,
            params,
            dest: dest & !DATA_FLAG,
            source,
            data: buf[HEADER_LEN..total].to_vec(),
        };
        Ok(Some((frame, total)))
    }
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_i32(data: &[u8], at: usize) -> i32 {
    read_u32(data, at) as i32
}

/// NUL-padded ASCII field to String
fn ascii(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

fn padded(text: &str, len: usize) -> Vec<u8> {
    let mut out: Vec<u8> = text.bytes().take(len).collect();
    out.resize(len, 0);
    out
}

fn expect_len(data: &[u8], len: usize, what: &str) -> Result<()> {
    if data.len() < len {
        return Err(invalid(format!(
            "{} payload: expected {} bytes, got {}",
            what,
            len,
            data.len()
        )));
    }
    Ok(())
}

/// HW_GET_INFO payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwInfo {
    pub serial_number: u32,
    pub model: String,
    pub hw_type: u16,
    pub firmware: u32,
    pub notes: String,
    pub hw_version: u16,
    pub mod_state: u16,
    pub channels: u16,
}

impl HwInfo {
    pub const LEN: usize = 84;

    pub fn parse(data: &[u8]) -> Result<Self> {
        expect_len(data, Self::LEN, "HW_GET_INFO")?;
        Ok(Self {
            serial_number: read_u32(data, 0),
            model: ascii(&data[4..12]),
            hw_type: read_u16(data, 12),
            firmware: read_u32(data, 14),
            notes: ascii(&data[18..66]),
            // 66..78 reserved
            hw_version: read_u16(data, 78),
            mod_state: read_u16(data, 80),
            channels: read_u16(data, 82),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.serial_number.to_le_bytes());
        out.extend_from_slice(&padded(&self.model, 8));
        out.extend_from_slice(&self.hw_type.to_le_bytes());
        out.extend_from_slice(&self.firmware.to_le_bytes());
        out.extend_from_slice(&padded(&self.notes, 48));
        out.extend_from_slice(&[0u8; 12]);
        out.extend_from_slice(&self.hw_version.to_le_bytes());
        out.extend_from_slice(&self.mod_state.to_le_bytes());
        out.extend_from_slice(&self.channels.to_le_bytes());
        out
    }

    /// Firmware as major.interim.minor
    pub fn firmware_version(&self) -> String {
        let [minor, interim, major, _] = self.firmware.to_le_bytes();
        format!("{}.{}.{}", major, interim, minor)
    }
}

/// Position or encoder counter payload (also the MOT_MOVE_ABSOLUTE payload)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub channel: u16,
    pub counts: i32,
}

impl Counter {
    pub const LEN: usize = 6;

    pub fn parse(data: &[u8]) -> Result<Self> {
        expect_len(data, Self::LEN, "counter")?;
        Ok(Self {
            channel: read_u16(data, 0),
            counts: read_i32(data, 2),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.channel.to_le_bytes());
        out.extend_from_slice(&self.counts.to_le_bytes());
        out
    }
}

bitflags! {
    /// DC servo status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusBits: u32 {
        const FORWARD_HARDWARE_LIMIT = 0x0000_0001;
        const REVERSE_HARDWARE_LIMIT = 0x0000_0002;
        const MOVING_FORWARD = 0x0000_0010;
        const MOVING_REVERSE = 0x0000_0020;
        const JOGGING_FORWARD = 0x0000_0040;
        const JOGGING_REVERSE = 0x0000_0080;
        const HOMING = 0x0000_0200;
        const HOMED = 0x0000_0400;
        const TRACKING = 0x0000_1000;
        const SETTLED = 0x0000_2000;
        const MOTION_ERROR = 0x0000_4000;
        const CURRENT_LIMIT = 0x0100_0000;
        const CHANNEL_ENABLED = 0x8000_0000;
    }
}

/// MOT_GET_DCSTATUSUPDATE payload (also carried by MOT_MOVE_COMPLETED on DC controllers)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcStatus {
    pub channel: u16,
    pub counts: i32,
    pub velocity: u16,
    pub status: StatusBits,
}

impl DcStatus {
    pub const LEN: usize = 14;

    pub fn parse(data: &[u8]) -> Result<Self> {
        expect_len(data, Self::LEN, "DC status")?;
        Ok(Self {
            channel: read_u16(data, 0),
            counts: read_i32(data, 2),
            velocity: read_u16(data, 6),
            // 8..10 reserved
            status: StatusBits::from_bits_retain(read_u32(data, 10)),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.channel.to_le_bytes());
        out.extend_from_slice(&self.counts.to_le_bytes());
        out.extend_from_slice(&self.velocity.to_le_bytes());
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&self.status.bits().to_le_bytes());
        out
    }

    pub fn is_moving(&self) -> bool {
        self.status.intersects(
            StatusBits::MOVING_FORWARD
                | StatusBits::MOVING_REVERSE
                | StatusBits::JOGGING_FORWARD
                | StatusBits::JOGGING_REVERSE
                | StatusBits::HOMING,
        )
    }
}

/// HW_RICHRESPONSE payload: a controller-side fault report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RichResponse {
    pub message: u16,
    pub code: u16,
    pub notes: String,
}

impl RichResponse {
    pub const LEN: usize = 68;

    pub fn parse(data: &[u8]) -> Result<Self> {
        expect_len(data, Self::LEN, "HW_RICHRESPONSE")?;
        Ok(Self {
            message: read_u16(data, 0),
            code: read_u16(data, 2),
            notes: ascii(&data[4..68]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.message.to_le_bytes());
        out.extend_from_slice(&self.code.to_le_bytes());
        out.extend_from_slice(&padded(&self.notes, 64));
        out
    }
}

/// APT bus - one controller on one serial link
///
/// All methods take `&mut self`, so a handle can never have two commands in
/// flight. Input left over from an earlier exchange is discarded before each send.
pub struct AptBus {
    link: Box<dyn Link>,
    rx: Vec<u8>,
    destination: u8,
    since_ack: u32,
}

impl AptBus {
    pub fn new(link: Box<dyn Link>, destination: u8) -> Self {
        Self {
            link,
            rx: Vec::new(),
            destination,
            since_ack: 0,
        }
    }

    pub fn destination(&self) -> u8 {
        self.destination
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        trace!("-> 0x{:04X} {:02X?}", frame.id, frame.data);
        self.link.write_all(&frame.encode())?;
        self.link.flush()?;
        Ok(())
    }

    /// Send a frame, acknowledging status updates first when due
    fn send(&mut self, frame: &Frame) -> Result<()> {
        if self.since_ack >= STATUS_ACK_INTERVAL {
            let ack = Frame::short(MessageId::MotAckDcStatusUpdate, 0, 0, self.destination);
            self.write_frame(&ack)?;
            self.since_ack = 0;
        }
        self.write_frame(frame)?;
        self.since_ack += 1;
        Ok(())
    }

    /// Drop unread input, both ours and the driver's
    pub fn discard_input(&mut self) -> Result<()> {
        self.rx.clear();
        self.link.discard_input()?;
        Ok(())
    }

    /// Send a frame that has no reply
    pub fn command(&mut self, frame: Frame) -> Result<()> {
        self.discard_input()?;
        self.send(&frame)
    }

    /// Send a frame and wait for the reply with id `expect`
    pub fn transact(&mut self, frame: Frame, expect: MessageId, wait: &BoundedWait) -> Result<Frame> {
        self.command(frame)?;
        self.await_message(expect, wait)
    }

    /// Wait for a frame with id `expect`, discarding anything else that arrives
    pub fn await_message(&mut self, expect: MessageId, wait: &BoundedWait) -> Result<Frame> {
        wait.run(|| {
            self.fill()?;
            while let Some(frame) = self.next_frame()? {
                match frame.message() {
                    Some(id) if id == expect => return Ok(Some(frame)),
                    Some(MessageId::HwRichResponse) => {
                        let fault = RichResponse::parse(&frame.data)?;
                        return Err(StageError::Controller {
                            code: fault.code,
                            message: fault.notes,
                        });
                    }
                    Some(MessageId::HwResponse) => {
                        return Err(StageError::Controller {
                            code: 0,
                            message: "unspecified fault".to_string(),
                        });
                    }
                    _ => debug!(
                        "Discarding message 0x{:04X} while waiting for {}",
                        frame.id,
                        expect.name()
                    ),
                }
            }
            Ok(None)
        })
        .map_err(|err| match err {
            StageError::Timeout { after, .. } => StageError::Timeout {
                waiting_for: expect.name(),
                after,
            },
            other => other,
        })
    }

    /// Pull whatever the link has into the receive buffer
    fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; 128];
        match self.link.read(&mut chunk) {
            Ok(n) => {
                self.rx.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match Frame::decode(&self.rx) {
            Ok(Some((frame, used))) => {
                self.rx.drain(..used);
                trace!("<- 0x{:04X} {:02X?}", frame.id, frame.data);
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.rx.clear();
                Err(e)
            }
        }
    }
}
