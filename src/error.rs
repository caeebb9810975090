//! Error types
//!
//! Restart-class conditions are [`Anomaly`] values and never leave the engine
//! except as the last cause inside [`ExchangeError::RetriesExhausted`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("SPI transfer failed: {0}")]
    Transfer(String),
}

/// Which level the engine was waiting for on the ACK line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPhase {
    /// Plate ready to accept a command (line high)
    Ready,
    /// Plate has a response prepared (line low)
    Response,
}

impl std::fmt::Display for AckPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckPhase::Ready => write!(f, "ACK high"),
            AckPhase::Response => write!(f, "ACK low"),
        }
    }
}

/// A timing or data anomaly that restarts the whole exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Anomaly {
    #[error("timed out after {timeout:?} waiting for {phase}")]
    TimingTimeout { phase: AckPhase, timeout: Duration },

    #[error("command transfer took {elapsed:?}, plate stalled the bus")]
    BusStall { elapsed: Duration },

    #[error("verification byte {verifier:#04x} does not match payload sum {sum:#04x}")]
    ChecksumMismatch { sum: u8, verifier: u8 },

    #[error("plate did not respond (bus idle)")]
    UnresponsivePeripheral,

    #[error("invalid character {0:#04x} in identity string")]
    InvalidCharacter(u8),
}

/// Definitive outcome of a failed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("ran out of attempts after {attempts} tries (last: {last})")]
    RetriesExhausted { attempts: u32, last: Anomaly },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub const EINTR: i32 = 4;
pub const EIO: i32 = 5;
pub const EINVAL: i32 = 22;

/// Errors surfaced at the host boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("unrecognized command code {0:#010x}")]
    InvalidCommand(u32),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("interrupted while waiting for the bus")]
    Interrupted,

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl HostError {
    /// Driver return code for this error
    pub fn errno(&self) -> i32 {
        match self {
            HostError::InvalidCommand(_) | HostError::InvalidRequest(_) => EINVAL,
            HostError::Interrupted => EINTR,
            HostError::Exchange(ExchangeError::InvalidRequest(_)) => EINVAL,
            HostError::Exchange(_) => EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(HostError::InvalidCommand(7).errno(), EINVAL);
        assert_eq!(HostError::Interrupted.errno(), EINTR);
        let exhausted = ExchangeError::RetriesExhausted {
            attempts: 10,
            last: Anomaly::UnresponsivePeripheral,
        };
        assert_eq!(HostError::from(exhausted).errno(), EIO);
        let bus = ExchangeError::from(BusError::Transfer("nack".into()));
        assert_eq!(HostError::from(bus).errno(), EIO);
    }

    #[test]
    fn test_anomaly_display() {
        let anomaly = Anomaly::ChecksumMismatch { sum: 0x12, verifier: 0xEE };
        assert_eq!(
            anomaly.to_string(),
            "verification byte 0xee does not match payload sum 0x12"
        );
    }
}
