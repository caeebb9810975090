//! Wire format helpers
//!
//! A command is always four bytes: `{address, command, param1, param2}`.
//! ACK-wire plates follow their payload with a verification byte equal to
//! the bitwise complement of the payload sum.

/// Length of a command frame
pub const COMMAND_LEN: usize = 4;

/// Longest identity string a plate returns
pub const MAX_ID_LEN: usize = 25;

/// Value read from MISO when no plate drives it
pub const BUS_IDLE: u8 = 0xFF;

/// Identity string terminator
pub const NUL: u8 = 0x00;

/// Build the command frame for a plate
pub fn command_frame(address: u8, command: u8, param1: u8, param2: u8) -> [u8; COMMAND_LEN] {
    [address, command, param1, param2]
}

/// Sum of payload bytes modulo 256
pub fn payload_sum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Verification byte a plate appends to `payload`
pub fn verification_byte(payload: &[u8]) -> u8 {
    !payload_sum(payload)
}

/// Check a received verification byte against its payload
pub fn verify(payload: &[u8], verifier: u8) -> bool {
    payload_sum(payload) == !verifier
}

/// Whether `byte` may appear inside an identity string
pub fn is_printable(byte: u8) -> bool {
    (0x20..0x7F).contains(&byte)
}
