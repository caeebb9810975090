//! Protocol engine
//!
//! Runs one command/response exchange with a plate:
//!
//! ```text
//!   FRAME ____/‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾\____
//!   MOSI      [addr cmd p1 p2]
//!   ACK  ‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾\___________________/‾‾‾   (ACK plates only)
//!   MISO                       [b0][b1]...[bn][verifier]
//! ```
//!
//! Timing and data anomalies restart the exchange from the top with FRAME
//! dropped, up to the configured number of attempts. A failing transfer
//! primitive ends the exchange immediately.

use log::{debug, error, warn};

use crate::buffer::{CapacityExceeded, ResponseBuffer};
use crate::config::EngineConfig;
use crate::error::{AckPhase, Anomaly, BusError, ConfigError, ExchangeError};
use crate::protocol::{is_printable, payload_sum, verify, BUS_IDLE, MAX_ID_LEN, NUL};
use crate::request::{ExchangeRequest, ExchangeResult, ResponseShape};
use crate::transport::{poll_until, Transport};

/// Attempts allowed for one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    limit: u32,
    used: u32,
}

impl RetryBudget {
    /// Budget of `limit` attempts, never less than one
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            used: 0,
        }
    }

    /// Start an attempt, returning its 1-based number
    pub fn consume(&mut self) -> u32 {
        self.used = self.used.saturating_add(1);
        self.used
    }

    #[inline]
    pub fn used(&self) -> u32 {
        self.used
    }

    #[inline]
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

/// Why an attempt stopped early
#[derive(Debug)]
enum Abort {
    Restart(Anomaly),
    Fatal(ExchangeError),
}

impl From<Anomaly> for Abort {
    fn from(anomaly: Anomaly) -> Self {
        Abort::Restart(anomaly)
    }
}

impl From<BusError> for Abort {
    fn from(err: BusError) -> Self {
        Abort::Fatal(err.into())
    }
}

impl From<CapacityExceeded> for Abort {
    fn from(err: CapacityExceeded) -> Self {
        Abort::Fatal(ExchangeError::InvalidRequest(err.to_string()))
    }
}

/// Master side of the plate protocol, owning the bus and both lines
pub struct Engine<T: Transport> {
    transport: T,
    config: EngineConfig,
}

impl<T: Transport> Engine<T> {
    /// Validate `config`, take the transport and drive FRAME low
    pub fn new(mut transport: T, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        transport.set_frame(false);
        debug!(
            "Engine attached: {} Hz, buffer {} bytes, {} attempts, FRAME GPIO {}, ACK GPIO {}",
            config.bus.max_speed_hz,
            config.bus.buf_size,
            config.retry.max_attempts,
            config.pins.frame,
            config.pins.ack
        );
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drive FRAME low and hand the transport back
    pub fn detach(mut self) -> T {
        self.transport.set_frame(false);
        self.transport
    }

    /// Run one exchange to success, a fatal error or budget exhaustion.
    ///
    /// FRAME is low whenever this returns.
    pub fn exchange(&mut self, request: &ExchangeRequest) -> Result<ExchangeResult, ExchangeError> {
        let capacity = self.config.bus.buf_size;
        let needed = request.response.required_capacity();
        if needed > capacity {
            return Err(ExchangeError::InvalidRequest(format!(
                "response needs {} bytes, buffer holds {}",
                needed, capacity
            )));
        }

        debug!(
            "{} exchange: address {}, command {:#04x}, response {:?}",
            if request.ack_mode { "ACK" } else { "Non-ACK" },
            request.address,
            request.command,
            request.response
        );

        let mut budget = RetryBudget::new(self.config.retry.max_attempts);
        let mut buffer = ResponseBuffer::with_capacity(capacity);

        loop {
            let attempt = budget.consume();
            self.release_frame();
            buffer.clear();

            match self.attempt(request, &mut buffer, attempt == 1) {
                Ok(()) => {
                    self.release_frame();
                    debug!(
                        "Exchange with {} succeeded after {} attempt(s), {} bytes",
                        request.address,
                        attempt,
                        buffer.len()
                    );
                    return Ok(ExchangeResult::new(buffer, request.response, attempt));
                }
                Err(Abort::Fatal(err)) => {
                    self.transport.set_frame(false);
                    error!("Exchange with {} failed: {}", request.address, err);
                    return Err(err);
                }
                Err(Abort::Restart(anomaly)) => {
                    self.transport.set_frame(false);
                    if budget.is_exhausted() {
                        error!(
                            "Exchange with {} gave up after {} attempts: {}",
                            request.address, attempt, anomaly
                        );
                        return Err(ExchangeError::RetriesExhausted {
                            attempts: attempt,
                            last: anomaly,
                        });
                    }
                    warn!(
                        "Restarting exchange with {} ({} attempts left): {}",
                        request.address,
                        budget.remaining(),
                        anomaly
                    );
                }
            }
        }
    }

    /// Drop FRAME and give the plate time to reset
    fn release_frame(&mut self) {
        self.transport.set_frame(false);
        self.transport.delay(self.config.plate_chill());
    }

    fn attempt(
        &mut self,
        request: &ExchangeRequest,
        buffer: &mut ResponseBuffer,
        first_attempt: bool,
    ) -> Result<(), Abort> {
        let frame = request.frame();

        if request.ack_mode {
            self.wait_for_ack(AckPhase::Ready)?;
        }

        self.transport.set_frame(true);

        let started = self.transport.now();
        self.transport.transfer(
            &frame,
            &mut [],
            self.config.bus.max_speed_hz,
            self.config.timing.command_byte_delay_us,
        )?;
        let elapsed = self.transport.now().saturating_duration_since(started);
        if elapsed > self.config.stall_ceiling() {
            return Err(Anomaly::BusStall { elapsed }.into());
        }

        if request.response.is_empty() {
            return Ok(());
        }

        if request.ack_mode {
            self.wait_for_ack(AckPhase::Response)?;
        } else {
            self.transport.delay(self.config.first_byte_delay());
        }

        match request.response {
            ResponseShape::None => {}
            ResponseShape::Fixed(len) => {
                self.read_fixed(len, request.ack_mode, first_attempt, buffer)?
            }
            ResponseShape::Text => self.read_text(request.ack_mode, buffer)?,
        }

        if request.ack_mode {
            let verifier = self.read_byte(true)?;
            let payload = buffer.as_slice();
            if !verify(payload, verifier) {
                return Err(Anomaly::ChecksumMismatch {
                    sum: payload_sum(payload),
                    verifier,
                }
                .into());
            }
        }

        Ok(())
    }

    /// Wait for ACK to reach the level `phase` expects
    fn wait_for_ack(&mut self, phase: AckPhase) -> Result<(), Anomaly> {
        let want_high = phase == AckPhase::Ready;
        let timeout = self.config.ack_timeout();
        if poll_until(&mut self.transport, timeout, |t| t.ack_is_high() == want_high) {
            Ok(())
        } else {
            Err(Anomaly::TimingTimeout { phase, timeout })
        }
    }

    /// Clock in one response byte with the mode's byte timing
    fn read_byte(&mut self, ack_mode: bool) -> Result<u8, BusError> {
        let timing = &self.config.timing;
        let delay_us = if ack_mode {
            timing.ack_byte_delay_us
        } else {
            timing.rx_settle_us
        };
        let mut rx = [0u8; 1];
        self.transport
            .transfer(&[], &mut rx, self.config.bus.max_speed_hz, delay_us)?;
        if !ack_mode {
            self.transport.delay(self.config.byte_gap());
        }
        Ok(rx[0])
    }

    fn read_fixed(
        &mut self,
        len: usize,
        ack_mode: bool,
        first_attempt: bool,
        buffer: &mut ResponseBuffer,
    ) -> Result<(), Abort> {
        for i in 0..len {
            let byte = self.read_byte(ack_mode)?;
            // A missing plate leaves MISO floating high. Later attempts accept
            // 0xFF since some commands legitimately return it.
            if i == 0 && !ack_mode && first_attempt && byte == BUS_IDLE {
                return Err(Anomaly::UnresponsivePeripheral.into());
            }
            buffer.push(byte)?;
        }
        Ok(())
    }

    fn read_text(&mut self, ack_mode: bool, buffer: &mut ResponseBuffer) -> Result<(), Abort> {
        for _ in 0..MAX_ID_LEN {
            let byte = self.read_byte(ack_mode)?;
            if byte == NUL {
                buffer.push(NUL)?;
                return Ok(());
            }
            if !is_printable(byte) {
                return Err(Anomaly::InvalidCharacter(byte).into());
            }
            buffer.push(byte)?;
        }
        buffer.push(NUL)?;
        Ok(())
    }
}

impl<T: Transport> std::fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
