//! `embedded-hal` backend
//!
//! Runs the protocol over any HAL that provides:
//!
//! | Role  | Trait        | Default line |
//! |-------|--------------|--------------|
//! | SPI   | `SpiDevice`  | SPI0 CE0     |
//! | FRAME | `OutputPin`  | GPIO 25      |
//! | ACK   | `InputPin`   | GPIO 23      |
//! | Delay | `DelayNs`    | -            |
//!
//! Each [`Transport::transfer`] is one `SpiDevice` transaction, so chip
//! select wraps every byte group exactly like one kernel `spi_sync` message.
//! The per-transfer delay is issued as `Operation::DelayNs` inside the
//! transaction, before chip select is released.

use std::time::Instant;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{Error as _, InputPin, OutputPin, PinState};
use embedded_hal::spi::{Error as _, Operation, SpiDevice};
use log::error;

use crate::error::BusError;
use crate::transport::Transport;

/// Transport over `embedded-hal` 1.0 traits
pub struct HalTransport<SPI, FRAME, ACK, D> {
    spi: SPI,
    frame: FRAME,
    ack: ACK,
    delay: D,
}

impl<SPI, FRAME, ACK, D> HalTransport<SPI, FRAME, ACK, D>
where
    SPI: SpiDevice<u8>,
    FRAME: OutputPin,
    ACK: InputPin,
    D: DelayNs,
{
    /// Take ownership of the bus, both lines and a delay source.
    ///
    /// The SPI device must already be configured for mode 0 at the clock
    /// rate the engine is configured with; `SpiDevice` has no way to change
    /// the clock per transfer.
    pub fn new(spi: SPI, frame: FRAME, ack: ACK, delay: D) -> Self {
        Self {
            spi,
            frame,
            ack,
            delay,
        }
    }

    /// Give the peripherals back
    pub fn release(self) -> (SPI, FRAME, ACK, D) {
        (self.spi, self.frame, self.ack, self.delay)
    }
}

impl<SPI, FRAME, ACK, D> Transport for HalTransport<SPI, FRAME, ACK, D>
where
    SPI: SpiDevice<u8>,
    FRAME: OutputPin,
    ACK: InputPin,
    D: DelayNs,
{
    fn transfer(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        _speed_hz: u32,
        delay_us: u32,
    ) -> Result<(), BusError> {
        let delay_ns = delay_us.saturating_mul(1_000);
        let result = match (tx.is_empty(), rx.is_empty()) {
            (true, true) => return Ok(()),
            (false, true) => self
                .spi
                .transaction(&mut [Operation::Write(tx), Operation::DelayNs(delay_ns)]),
            (true, false) => self
                .spi
                .transaction(&mut [Operation::Read(rx), Operation::DelayNs(delay_ns)]),
            (false, false) => {
                if tx.len() != rx.len() {
                    return Err(BusError::Transfer(format!(
                        "length mismatch: tx {} bytes, rx {} bytes",
                        tx.len(),
                        rx.len()
                    )));
                }
                self.spi
                    .transaction(&mut [Operation::Transfer(rx, tx), Operation::DelayNs(delay_ns)])
            }
        };
        result.map_err(|e| BusError::Transfer(format!("{:?}", e.kind())))
    }

    fn set_frame(&mut self, asserted: bool) {
        if let Err(e) = self.frame.set_state(PinState::from(asserted)) {
            let level = if asserted { "high" } else { "low" };
            error!("Failed to drive FRAME {}: {:?}", level, e.kind());
        }
    }

    fn ack_is_high(&mut self) -> bool {
        match self.ack.is_high() {
            Ok(level) => level,
            Err(e) => {
                // unreadable ACK counts as busy, so the exchange times out and retries
                error!("Failed to read ACK: {:?}", e.kind());
                false
            }
        }
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn delay_us(&mut self, us: u64) {
        let mut remaining = us;
        while remaining > 0 {
            let chunk = remaining.min(u64::from(u32::MAX));
            self.delay.delay_us(chunk as u32);
            remaining -= chunk;
        }
    }
}
