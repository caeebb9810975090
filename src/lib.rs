//! # Pi-Plate SPI Protocol Engine
//!
//! Master side of the Pi-Plates command/response protocol: a 4-byte command
//! on SPI, framed by the FRAME line, with an optional ACK handshake and a
//! verification byte on newer boards.
//!
//! ## Layout
//!
//! ```text
//!   host::PlateDevice ── Mutex ──► engine::Engine ──► transport::Transport
//!        (ioctl)                    (exchange)         ├─ HalTransport (embedded-hal)
//!                                                      └─ SimBus (simulated plates)
//! ```
//!
//! ## Example
//!
//! ```
//! use piplate_spi::plates::{CMD_GET_ID, TINKER};
//! use piplate_spi::transport::sim::{SimBus, SimPlate};
//! use piplate_spi::{Engine, EngineConfig, ExchangeRequest};
//!
//! let bus = SimBus::with_plates([SimPlate::from_family(&TINKER, 5)]);
//! let mut engine = Engine::new(bus, EngineConfig::default()).unwrap();
//!
//! let request = ExchangeRequest::new(53, CMD_GET_ID).with_ack(true).expecting_text();
//! let result = engine.exchange(&request).unwrap();
//! assert_eq!(result.text(), Some("Pi-Plate TINKERplate"));
//! ```

pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod plates;
pub mod protocol;
pub mod request;
pub mod transport;

pub use buffer::ResponseBuffer;
pub use config::{DebugLevel, EngineConfig};
pub use engine::{Engine, RetryBudget};
pub use error::{Anomaly, BusError, ConfigError, ExchangeError, HostError};
pub use host::{CancelToken, Message, PlateDevice, PlateHandle, PIPLATE_SENDCMD};
pub use request::{ExchangeRequest, ExchangeResult, ResponseShape};
pub use transport::Transport;
