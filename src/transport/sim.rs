//! Simulated plate bus
//!
//! A deterministic stand-in for the SPI bus and the FRAME/ACK lines, used by
//! the test suite and by `piplate sim`. Time is virtual: transfers, delays
//! and ACK samples advance a private clock instead of sleeping, so timeouts
//! and stalls are exact and fast.
//!
//! Plates behave like the real boards:
//! - a command is accepted only while FRAME is asserted
//! - ACK-wire plates hold ACK high while idle and pull it low once their
//!   response is ready, then append a verification byte
//! - MISO reads `0xFF` whenever no plate drives it
//!
//! Faults can be injected to exercise the engine's recovery paths, and every
//! line change and byte on the wire is recorded in a shared [`EventLog`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::BusError;
use crate::plates::{PlateFamily, CMD_GET_ADDRESS, CMD_GET_ID};
use crate::protocol::{verification_byte, BUS_IDLE, COMMAND_LEN, NUL};
use crate::transport::Transport;

/// Virtual cost of one ACK sample
const ACK_SAMPLE_COST: Duration = Duration::from_micros(2);

/// A simulated plate
#[derive(Debug, Clone)]
pub struct SimPlate {
    pub address: u8,
    pub id_string: String,
    pub uses_ack: bool,
    responses: HashMap<u8, Vec<u8>>,
}

impl SimPlate {
    pub fn new(address: u8, id_string: &str, uses_ack: bool) -> Self {
        Self {
            address,
            id_string: id_string.to_string(),
            uses_ack,
            responses: HashMap::new(),
        }
    }

    /// Board `board` of a family
    pub fn from_family(family: &PlateFamily, board: u8) -> Self {
        Self::new(
            family.base_address.wrapping_add(board),
            family.id_string,
            family.uses_ack,
        )
    }

    /// Answer `command` with a fixed payload
    pub fn with_response(mut self, command: u8, payload: &[u8]) -> Self {
        self.responses.insert(command, payload.to_vec());
        self
    }

    /// Payload for a received frame, if the plate answers it
    fn respond(&self, frame: &[u8; COMMAND_LEN]) -> Option<Vec<u8>> {
        let command = frame[1];
        if let Some(payload) = self.responses.get(&command) {
            return Some(payload.clone());
        }
        match command {
            CMD_GET_ADDRESS => Some(vec![self.address]),
            CMD_GET_ID => {
                let mut payload = self.id_string.as_bytes().to_vec();
                payload.push(NUL);
                Some(payload)
            }
            _ => None,
        }
    }
}

/// Misbehaviour a plate or the bus can be made to show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Verification byte off by one
    CorruptChecksum,
    /// Command transfer takes this much longer
    Stall(Duration),
    /// Plate never pulls ACK low for its response
    AckStuckHigh,
    /// Plate ignores the command, MISO stays idle
    IdleResponse,
    /// First response byte replaced with this value
    Glitch(u8),
    /// The transfer primitive itself fails
    TransferError,
}

impl Fault {
    fn same_kind(&self, other: &Fault) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Debug, Clone)]
struct Injection {
    fault: Fault,
    /// `None` means every occurrence
    remaining: Option<u32>,
}

/// Something observed on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    /// FRAME changed level
    Frame(bool),
    /// A command frame was clocked out
    Command([u8; COMMAND_LEN]),
    /// A response byte was clocked in
    Read(u8),
}

/// Shared record of bus activity.
///
/// Cloning yields another handle to the same log, so a test can keep one
/// while the bus itself is owned by an engine.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<BusEvent>>>,
}

impl EventLog {
    fn lock(&self) -> MutexGuard<'_, Vec<BusEvent>> {
        // log stays readable after a panic on another thread
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, event: BusEvent) {
        self.lock().push(event);
    }

    /// Snapshot of all events so far
    pub fn events(&self) -> Vec<BusEvent> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Current FRAME level as last recorded
    pub fn frame_asserted(&self) -> bool {
        self.lock()
            .iter()
            .rev()
            .find_map(|e| match e {
                BusEvent::Frame(level) => Some(*level),
                _ => None,
            })
            .unwrap_or(false)
    }

    /// Command frames sent so far
    pub fn commands(&self) -> Vec<[u8; COMMAND_LEN]> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                BusEvent::Command(frame) => Some(*frame),
                _ => None,
            })
            .collect()
    }

    /// Number of bytes read back
    pub fn read_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|e| matches!(e, BusEvent::Read(_)))
            .count()
    }

    /// Bus traffic that happened while FRAME was low
    pub fn unframed_traffic(&self) -> Vec<BusEvent> {
        let mut framed = false;
        let mut stray = Vec::new();
        for event in self.lock().iter() {
            match event {
                BusEvent::Frame(level) => framed = *level,
                other if !framed => stray.push(*other),
                _ => {}
            }
        }
        stray
    }

    /// Events between each FRAME assertion and the following deassertion
    pub fn frame_spans(&self) -> Vec<Vec<BusEvent>> {
        let mut spans = Vec::new();
        let mut current: Option<Vec<BusEvent>> = None;
        for event in self.lock().iter() {
            match event {
                BusEvent::Frame(true) => current = Some(Vec::new()),
                BusEvent::Frame(false) => {
                    if let Some(span) = current.take() {
                        spans.push(span);
                    }
                }
                other => {
                    if let Some(span) = current.as_mut() {
                        span.push(*other);
                    }
                }
            }
        }
        if let Some(span) = current {
            spans.push(span);
        }
        spans
    }
}

/// Simulated SPI bus with plates attached
#[derive(Debug)]
pub struct SimBus {
    plates: Vec<SimPlate>,
    injections: Vec<Injection>,
    log: EventLog,
    origin: Instant,
    elapsed: Duration,
    frame: bool,
    /// Addressed plate has its response ready
    ack_low: bool,
    /// Plates hold ACK low until this virtual time
    busy_until: Duration,
    outgoing: VecDeque<u8>,
}

impl SimBus {
    /// Empty bus, no plates attached
    pub fn new() -> Self {
        Self {
            plates: Vec::new(),
            injections: Vec::new(),
            log: EventLog::default(),
            origin: Instant::now(),
            elapsed: Duration::ZERO,
            frame: false,
            ack_low: false,
            busy_until: Duration::ZERO,
            outgoing: VecDeque::new(),
        }
    }

    /// Bus with the given plates attached
    pub fn with_plates(plates: impl IntoIterator<Item = SimPlate>) -> Self {
        let mut bus = Self::new();
        bus.plates.extend(plates);
        bus
    }

    pub fn attach(&mut self, plate: SimPlate) {
        self.plates.push(plate);
    }

    /// Handle to the event log
    pub fn event_log(&self) -> EventLog {
        self.log.clone()
    }

    /// Inject `fault` for its next `times` occurrences
    pub fn inject(&mut self, fault: Fault, times: u32) {
        if times > 0 {
            self.injections.push(Injection {
                fault,
                remaining: Some(times),
            });
        }
    }

    /// Inject `fault` on every occurrence
    pub fn inject_always(&mut self, fault: Fault) {
        self.injections.push(Injection {
            fault,
            remaining: None,
        });
    }

    pub fn clear_faults(&mut self) {
        self.injections.clear();
    }

    /// Keep ACK low (plates busy) for `duration` of virtual time
    pub fn hold_ack_low_for(&mut self, duration: Duration) {
        self.busy_until = self.elapsed + duration;
    }

    /// Virtual time since the bus was created
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn frame_asserted(&self) -> bool {
        self.frame
    }

    fn advance(&mut self, by: Duration) {
        self.elapsed += by;
    }

    fn take_fault(&mut self, kind: Fault) -> Option<Fault> {
        let idx = self
            .injections
            .iter()
            .position(|inj| inj.fault.same_kind(&kind))?;
        let fault = self.injections[idx].fault;
        if let Some(remaining) = self.injections[idx].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.injections.remove(idx);
            }
        }
        Some(fault)
    }

    fn wire_time(bytes: usize, speed_hz: u32) -> Duration {
        let bits = bytes as u64 * 8;
        Duration::from_nanos(bits * 1_000_000_000 / u64::from(speed_hz.max(1)))
    }

    fn receive_command(&mut self, frame: [u8; COMMAND_LEN]) {
        self.outgoing.clear();
        self.ack_low = false;

        if let Some(Fault::Stall(extra)) = self.take_fault(Fault::Stall(Duration::ZERO)) {
            self.advance(extra);
        }

        let Some(plate) = self.plates.iter().find(|p| p.address == frame[0]) else {
            return;
        };
        let uses_ack = plate.uses_ack;
        let Some(payload) = plate.respond(&frame) else {
            return;
        };

        if self.take_fault(Fault::IdleResponse).is_some() {
            return;
        }

        let mut wire = payload.clone();
        if uses_ack {
            let mut verifier = verification_byte(&payload);
            if self.take_fault(Fault::CorruptChecksum).is_some() {
                verifier = verifier.wrapping_add(1);
            }
            wire.push(verifier);
            self.ack_low = self.take_fault(Fault::AckStuckHigh).is_none();
        }

        if let Some(Fault::Glitch(byte)) = self.take_fault(Fault::Glitch(0)) {
            if let Some(first) = wire.first_mut() {
                *first = byte;
            }
        }

        self.outgoing = wire.into();
    }

    fn next_byte(&mut self) -> u8 {
        if !self.frame {
            return BUS_IDLE;
        }
        self.outgoing.pop_front().unwrap_or(BUS_IDLE)
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimBus {
    fn transfer(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        speed_hz: u32,
        delay_us: u32,
    ) -> Result<(), BusError> {
        if self.take_fault(Fault::TransferError).is_some() {
            return Err(BusError::Transfer("simulated controller fault".into()));
        }

        let bytes = tx.len().max(rx.len());
        self.advance(Self::wire_time(bytes, speed_hz) + Duration::from_micros(u64::from(delay_us)));

        if let Ok(frame) = <[u8; COMMAND_LEN]>::try_from(tx) {
            self.log.record(BusEvent::Command(frame));
            if self.frame {
                self.receive_command(frame);
            }
        }

        for slot in rx.iter_mut() {
            *slot = self.next_byte();
            self.log.record(BusEvent::Read(*slot));
        }

        Ok(())
    }

    fn set_frame(&mut self, asserted: bool) {
        if self.frame != asserted {
            self.log.record(BusEvent::Frame(asserted));
        }
        self.frame = asserted;
        if !asserted {
            self.outgoing.clear();
            self.ack_low = false;
        }
    }

    fn ack_is_high(&mut self) -> bool {
        self.advance(ACK_SAMPLE_COST);
        !(self.ack_low || self.elapsed < self.busy_until)
    }

    fn now(&self) -> Instant {
        self.origin + self.elapsed
    }

    fn delay_us(&mut self, us: u64) {
        self.advance(Duration::from_micros(us));
    }
}
