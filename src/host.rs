//! Host adapter
//!
//! The ioctl-style front door. A [`PlateDevice`] owns the engine behind a
//! mutex so at most one exchange is on the bus at any time; callers open
//! [`PlateHandle`] sessions and submit [`Message`]s with [`PIPLATE_SENDCMD`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use crate::engine::Engine;
use crate::error::HostError;
use crate::request::{ExchangeRequest, ResponseShape};
use crate::transport::Transport;

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

pub const IOC_WRITE: u32 = 1;
pub const IOC_READ: u32 = 2;

/// Encode an ioctl request number the way `_IOC` does
pub const fn ioc(dir: u32, ty: u8, nr: u8, size: u32) -> u32 {
    (dir << IOC_DIRSHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | (size << IOC_SIZESHIFT)
}

/// Ioctl magic shared by all plate commands
pub const IOC_MAGIC: u8 = b'Q';

/// Send one command and collect its response: `_IOWR('Q', 0, int)`
pub const PIPLATE_SENDCMD: u32 = ioc(
    IOC_READ | IOC_WRITE,
    IOC_MAGIC,
    0,
    std::mem::size_of::<i32>() as u32,
);

/// How long a blocked caller sleeps between lock attempts
const LOCK_RETRY_INTERVAL: Duration = Duration::from_micros(50);

/// Request/response record exchanged with the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub addr: u8,
    pub cmd: u8,
    pub p1: u8,
    pub p2: u8,
    /// Response bytes, filled in on success
    pub r_buf: Vec<u8>,
    /// `0` none, `>0` byte count, `-1` identity string
    pub bytes_to_return: i32,
    pub use_ack: bool,
    /// Set once the command completed
    pub state: bool,
}

impl Message {
    pub fn new(addr: u8, cmd: u8) -> Self {
        Self {
            addr,
            cmd,
            ..Default::default()
        }
    }

    pub fn with_params(mut self, p1: u8, p2: u8) -> Self {
        self.p1 = p1;
        self.p2 = p2;
        self
    }

    pub fn with_ack(mut self, use_ack: bool) -> Self {
        self.use_ack = use_ack;
        self
    }

    pub fn returning(mut self, bytes_to_return: i32) -> Self {
        self.bytes_to_return = bytes_to_return;
        self
    }

    /// Translate into an engine request
    pub fn to_request(&self) -> Result<ExchangeRequest, HostError> {
        let response = ResponseShape::from_raw(self.bytes_to_return).ok_or_else(|| {
            HostError::InvalidRequest(format!(
                "bytes_to_return must be -1 or non-negative, got {}",
                self.bytes_to_return
            ))
        })?;
        Ok(ExchangeRequest::new(self.addr, self.cmd)
            .with_params(self.p1, self.p2)
            .with_ack(self.use_ack)
            .with_response(response))
    }
}

/// Interrupts a caller waiting for the bus
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The plate bus as seen by the host
pub struct PlateDevice<T: Transport> {
    engine: Mutex<Engine<T>>,
    buf_size: usize,
    sessions: AtomicUsize,
}

impl<T: Transport> PlateDevice<T> {
    pub fn new(engine: Engine<T>) -> Self {
        let buf_size = engine.config().bus.buf_size;
        Self {
            engine: Mutex::new(engine),
            buf_size,
            sessions: AtomicUsize::new(0),
        }
    }

    /// Open a session on a shared device
    pub fn open(self: &Arc<Self>) -> PlateHandle<T> {
        let open = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Device opened ({} session(s))", open);
        PlateHandle {
            device: Arc::clone(self),
        }
    }

    /// Sessions currently open
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Dispatch one ioctl.
    ///
    /// Only [`PIPLATE_SENDCMD`] is recognised. On success the response is
    /// copied into `message.r_buf` and `message.state` is set.
    pub fn ioctl(
        &self,
        code: u32,
        message: &mut Message,
        cancel: &CancelToken,
    ) -> Result<(), HostError> {
        if code != PIPLATE_SENDCMD {
            error!("Invalid command {:#010x}", code);
            return Err(HostError::InvalidCommand(code));
        }

        let request = message.to_request()?;
        let needed = request.response.required_capacity();
        if needed > self.buf_size {
            return Err(HostError::InvalidRequest(format!(
                "response needs {} bytes, device buffer holds {}",
                needed, self.buf_size
            )));
        }

        let mut engine = self.lock_engine(cancel)?;
        match engine.exchange(&request) {
            Ok(result) => {
                message.r_buf = result.into_buffer().into_vec();
                message.state = true;
                Ok(())
            }
            Err(e) => {
                error!("Failed to send message: {}", e);
                Err(e.into())
            }
        }
    }

    /// Take the engine back once no session needs it
    pub fn into_engine(self) -> Engine<T> {
        self.engine.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_engine(&self, cancel: &CancelToken) -> Result<MutexGuard<'_, Engine<T>>, HostError> {
        loop {
            match self.engine.try_lock() {
                Ok(guard) => return Ok(guard),
                // A holder panicked mid-exchange and may have left FRAME high
                Err(TryLockError::Poisoned(poisoned)) => {
                    warn!("Recovering engine from a panicked session");
                    let mut guard = poisoned.into_inner();
                    guard.transport_mut().set_frame(false);
                    return Ok(guard);
                }
                Err(TryLockError::WouldBlock) => {
                    if cancel.is_cancelled() {
                        debug!("Interrupted while waiting for the bus");
                        return Err(HostError::Interrupted);
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
            }
        }
    }
}

/// An open session on a [`PlateDevice`]
pub struct PlateHandle<T: Transport> {
    device: Arc<PlateDevice<T>>,
}

impl<T: Transport> PlateHandle<T> {
    /// See [`PlateDevice::ioctl`]
    pub fn ioctl(
        &self,
        code: u32,
        message: &mut Message,
        cancel: &CancelToken,
    ) -> Result<(), HostError> {
        self.device.ioctl(code, message, cancel)
    }

    /// Shorthand for a `PIPLATE_SENDCMD` that cannot be interrupted
    pub fn send(&self, message: &mut Message) -> Result<(), HostError> {
        self.device.ioctl(PIPLATE_SENDCMD, message, &CancelToken::new())
    }

    pub fn device(&self) -> &Arc<PlateDevice<T>> {
        &self.device
    }
}

impl<T: Transport> Clone for PlateHandle<T> {
    fn clone(&self) -> Self {
        self.device.open()
    }
}

impl<T: Transport> Drop for PlateHandle<T> {
    fn drop(&mut self) {
        let left = self.device.sessions.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("Device released ({} session(s) left)", left);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::{EINTR, EINVAL, EIO};
    use crate::plates::{CMD_GET_ADDRESS, CMD_GET_ID, RELAY, TINKER};
    use crate::transport::sim::{Fault, SimBus, SimPlate};

    fn device() -> Arc<PlateDevice<SimBus>> {
        let bus = SimBus::with_plates([
            SimPlate::from_family(&RELAY, 0),
            SimPlate::from_family(&TINKER, 5),
        ]);
        Arc::new(PlateDevice::new(
            Engine::new(bus, EngineConfig::default()).unwrap(),
        ))
    }

    #[test]
    fn test_sendcmd_code() {
        assert_eq!(PIPLATE_SENDCMD, 0xC004_5100);
    }

    #[test]
    fn test_send_fills_message() {
        let handle = device().open();
        let mut msg = Message::new(24, CMD_GET_ADDRESS).returning(1);
        handle.send(&mut msg).unwrap();
        assert_eq!(msg.r_buf, vec![24]);
        assert!(msg.state);
    }

    #[test]
    fn test_identity_query() {
        let handle = device().open();
        let mut msg = Message::new(53, CMD_GET_ID).with_ack(true).returning(-1);
        handle.send(&mut msg).unwrap();
        assert_eq!(msg.r_buf, b"Pi-Plate TINKERplate\0".to_vec());
    }

    #[test]
    fn test_invalid_command_rejected() {
        let dev = device();
        let handle = dev.open();
        let mut msg = Message::new(24, CMD_GET_ADDRESS).returning(1);
        let err = handle.ioctl(0x1234, &mut msg, &CancelToken::new()).unwrap_err();
        assert_eq!(err, HostError::InvalidCommand(0x1234));
        assert_eq!(err.errno(), EINVAL);
        assert!(!msg.state);

        drop(handle);
        let engine = Arc::try_unwrap(dev).ok().unwrap().into_engine();
        assert!(engine.transport().event_log().events().is_empty());
    }

    #[test]
    fn test_malformed_length_rejected() {
        let handle = device().open();
        let mut msg = Message::new(24, CMD_GET_ADDRESS).returning(-2);
        assert_eq!(handle.send(&mut msg).unwrap_err().errno(), EINVAL);

        let mut msg = Message::new(24, CMD_GET_ADDRESS).returning(4096);
        assert_eq!(handle.send(&mut msg).unwrap_err().errno(), EINVAL);
    }

    #[test]
    fn test_exchange_failure_is_eio() {
        let dev = device();
        dev.engine.lock().unwrap().transport_mut().inject_always(Fault::CorruptChecksum);
        let handle = dev.open();
        let mut msg = Message::new(53, CMD_GET_ADDRESS).with_ack(true).returning(1);
        let err = handle.send(&mut msg).unwrap_err();
        assert_eq!(err.errno(), EIO);
        assert!(!msg.state);
    }

    #[test]
    fn test_cancel_while_waiting() {
        let dev = device();
        let held = dev.engine.lock().unwrap();

        let token = CancelToken::new();
        let waiter = {
            let handle = dev.open();
            let token = token.clone();
            thread::spawn(move || {
                let mut msg = Message::new(24, CMD_GET_ADDRESS).returning(1);
                handle.ioctl(PIPLATE_SENDCMD, &mut msg, &token)
            })
        };

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err, HostError::Interrupted);
        assert_eq!(err.errno(), EINTR);
        assert!(held.transport().event_log().commands().is_empty());
    }

    #[test]
    fn test_cancelled_token_with_free_lock_proceeds() {
        let handle = device().open();
        let token = CancelToken::new();
        token.cancel();
        let mut msg = Message::new(24, CMD_GET_ADDRESS).returning(1);
        handle.ioctl(PIPLATE_SENDCMD, &mut msg, &token).unwrap();
        assert!(msg.state);
    }

    #[test]
    fn test_poisoned_lock_drops_frame() {
        let dev = device();
        let holder = Arc::clone(&dev);
        let crashed = thread::spawn(move || {
            let mut engine = holder.engine.lock().unwrap();
            engine.transport_mut().set_frame(true);
            panic!("session died with FRAME high");
        })
        .join();
        assert!(crashed.is_err());
        assert!(dev.engine.is_poisoned());

        {
            let guard = dev.lock_engine(&CancelToken::new()).unwrap();
            assert!(!guard.transport().frame_asserted());
        }

        let handle = dev.open();
        let mut msg = Message::new(24, CMD_GET_ADDRESS).returning(1);
        handle.send(&mut msg).unwrap();
        assert_eq!(msg.r_buf, vec![24]);
    }

    #[test]
    fn test_session_count() {
        let dev = device();
        let a = dev.open();
        let b = a.clone();
        assert_eq!(dev.sessions(), 2);
        drop(a);
        drop(b);
        assert_eq!(dev.sessions(), 0);
    }
}
