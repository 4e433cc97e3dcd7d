// In-memory APT controller
//
// Answers host frames the way a single-channel DC cube does, so the driver and
// the tracker can run without hardware. Replies can be delayed by a number of
// reads, suppressed, truncated, or replaced by a fault report.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use super::apt::{
    Counter, DcStatus, Frame, HOST, HwInfo, MessageId, RichResponse, StatusBits,
};
use super::link::Link;

/// How the simulated controller misbehaves
#[derive(Debug, Clone, Default)]
pub struct SimBehavior {
    /// Never answer anything
    pub silent: bool,
    /// Answer this request with HW_RICHRESPONSE instead of its normal reply
    pub fault_on: Option<MessageId>,
    /// Cut every reply short by this many bytes
    pub truncate_replies: usize,
    /// Reads before MOVE_HOMED appears
    pub home_latency: u32,
    /// Reads before MOVE_COMPLETED appears
    pub move_latency: u32,
    /// Counts between commanded and settled position
    pub settle_error_counts: i32,
}

/// Ids of every host frame the controller received
pub type SimLog = Arc<Mutex<Vec<MessageId>>>;

pub struct SimulatedController {
    info: HwInfo,
    behavior: SimBehavior,
    counts: i32,
    enabled: bool,
    homed: bool,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    pending: VecDeque<(u32, Frame)>,
    log: SimLog,
}

impl SimulatedController {
    pub fn new(serial_number: u32) -> Self {
        Self::with_behavior(serial_number, SimBehavior::default())
    }

    pub fn with_behavior(serial_number: u32, behavior: SimBehavior) -> Self {
        Self {
            info: HwInfo {
                serial_number,
                model: "KDC101".to_string(),
                hw_type: 16,
                firmware: 0x0003_0A01,
                notes: "Simulated DC Motor Controller".to_string(),
                hw_version: 1,
                mod_state: 0,
                channels: 1,
            },
            behavior,
            counts: 0,
            enabled: false,
            homed: false,
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            pending: VecDeque::new(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Start from a known position
    pub fn at_counts(mut self, counts: i32) -> Self {
        self.counts = counts;
        self
    }

    /// Shared view of received message ids; stays valid after the controller is boxed
    pub fn log(&self) -> SimLog {
        Arc::clone(&self.log)
    }

    fn status_bits(&self) -> StatusBits {
        let mut bits = StatusBits::SETTLED;
        if self.enabled {
            bits |= StatusBits::CHANNEL_ENABLED;
        }
        if self.homed {
            bits |= StatusBits::HOMED;
        }
        bits
    }

    fn dc_status(&self, channel: u16) -> DcStatus {
        DcStatus {
            channel,
            counts: self.counts,
            velocity: 0,
            status: self.status_bits(),
        }
    }

    fn reply(&mut self, latency: u32, frame: Frame) {
        self.pending.push_back((latency, frame));
    }

    fn handle(&mut self, frame: Frame) {
        let Some(id) = frame.message() else {
            return;
        };
        if let Ok(mut log) = self.log.lock() {
            log.push(id);
        }
        if self.behavior.silent {
            return;
        }

        if self.behavior.fault_on == Some(id) {
            let fault = RichResponse {
                message: id as u16,
                code: 0x0029,
                notes: "Simulated motion error".to_string(),
            };
            self.reply(0, Frame::long(MessageId::HwRichResponse, HOST, fault.encode()));
            return;
        }

        let channel = frame.params[0] as u16;
        match id {
            MessageId::HwReqInfo => {
                let data = self.info.encode();
                self.reply(0, Frame::long(MessageId::HwGetInfo, HOST, data));
            }
            MessageId::ModSetChanEnableState => {
                self.enabled = frame.params[1] == 0x01;
            }
            MessageId::MotMoveHome => {
                self.counts = 0;
                self.homed = true;
                let latency = self.behavior.home_latency;
                self.reply(latency, Frame::short(MessageId::MotMoveHomed, frame.params[0], 0, HOST));
            }
            MessageId::MotMoveAbsolute => {
                let Ok(target) = Counter::parse(&frame.data) else {
                    return;
                };
                self.counts = target.counts + self.behavior.settle_error_counts;
                let status = self.dc_status(target.channel);
                let latency = self.behavior.move_latency;
                self.reply(
                    latency,
                    Frame::long(MessageId::MotMoveCompleted, HOST, status.encode()),
                );
            }
            MessageId::MotReqPosCounter | MessageId::MotReqEncCounter => {
                let reply_id = if id == MessageId::MotReqPosCounter {
                    MessageId::MotGetPosCounter
                } else {
                    MessageId::MotGetEncCounter
                };
                let data = Counter {
                    channel,
                    counts: self.counts,
                }
                .encode();
                self.reply(0, Frame::long(reply_id, HOST, data));
            }
            MessageId::MotReqDcStatusUpdate => {
                let data = self.dc_status(channel).encode();
                self.reply(0, Frame::long(MessageId::MotGetDcStatusUpdate, HOST, data));
            }
            MessageId::MotMoveStop => {
                self.pending
                    .retain(|(_, f)| f.message() != Some(MessageId::MotMoveCompleted));
                let data = self.dc_status(channel).encode();
                self.reply(0, Frame::long(MessageId::MotMoveStopped, HOST, data));
            }
            _ => {}
        }
    }

    /// Release replies whose latency has run out
    fn tick(&mut self) {
        for (remaining, _) in self.pending.iter_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        while self.pending.front().is_some_and(|(remaining, _)| *remaining == 0) {
            if let Some((_, frame)) = self.pending.pop_front() {
                let mut bytes = frame.encode();
                let keep = bytes.len().saturating_sub(self.behavior.truncate_replies);
                bytes.truncate(keep);
                self.outbox.extend(bytes);
            }
        }
    }
}

impl Read for SimulatedController {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.tick();
        if self.outbox.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedController {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inbox.extend_from_slice(buf);
        loop {
            match Frame::decode(&self.inbox) {
                Ok(Some((frame, used))) => {
                    self.inbox.drain(..used);
                    self.handle(frame);
                }
                Ok(None) => break,
                Err(_) => {
                    self.inbox.clear();
                    break;
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for SimulatedController {
    fn discard_input(&mut self) -> io::Result<()> {
        self.outbox.clear();
        Ok(())
    }
}
