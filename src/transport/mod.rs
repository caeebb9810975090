//! Bus and control line access
//!
//! The engine talks to hardware only through [`Transport`]:
//! - one synchronous SPI transfer primitive
//! - FRAME (output) and ACK (input) lines
//! - a monotonic clock and a busy-wait delay
//!
//! Two backends are provided: [`hal::HalTransport`] over `embedded-hal`
//! traits, and [`sim::SimBus`], a simulated plate bus with virtual time.

pub mod hal;
pub mod sim;

pub use hal::HalTransport;
pub use sim::SimBus;

use std::time::{Duration, Instant};

use crate::error::BusError;

/// Primitives the protocol engine consumes.
pub trait Transport {
    /// Run one SPI transfer.
    ///
    /// An empty `tx` is a read-only transfer and an empty `rx` a write-only
    /// one; otherwise both have the same length. `delay_us` is held after the
    /// last byte before chip select changes.
    fn transfer(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        speed_hz: u32,
        delay_us: u32,
    ) -> Result<(), BusError>;

    /// Drive FRAME. `true` marks an exchange in progress.
    fn set_frame(&mut self, asserted: bool);

    /// Sample the ACK line
    fn ack_is_high(&mut self) -> bool;

    /// Monotonic time
    fn now(&self) -> Instant;

    /// Busy-wait without yielding to the scheduler
    fn delay_us(&mut self, us: u64);

    /// Busy-wait for `duration`
    fn delay(&mut self, duration: Duration) {
        self.delay_us(duration.as_micros() as u64);
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
///
/// Returns whether the predicate was satisfied. The predicate is always
/// sampled at least once, and once more after the deadline passes. A
/// timeout too large to form a deadline gets a single sample.
pub fn poll_until<T, F>(transport: &mut T, timeout: Duration, mut predicate: F) -> bool
where
    T: Transport + ?Sized,
    F: FnMut(&mut T) -> bool,
{
    let Some(deadline) = transport.now().checked_add(timeout) else {
        return predicate(transport);
    };
    loop {
        if predicate(transport) {
            return true;
        }
        if transport.now() >= deadline {
            return predicate(transport);
        }
    }
}
