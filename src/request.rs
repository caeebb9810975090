//! Exchange descriptors and results

use crate::buffer::ResponseBuffer;
use crate::protocol::{command_frame, COMMAND_LEN, MAX_ID_LEN, NUL};

/// Raw response length meaning "identity string"
pub const TEXT_RESPONSE: i32 = -1;

/// Expected response for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Command only, nothing is read back
    None,
    /// Exactly this many payload bytes
    Fixed(usize),
    /// NUL-terminated ASCII string of at most 25 characters
    Text,
}

impl ResponseShape {
    /// Parse the host's `bytes_to_return` convention
    pub fn from_raw(len: i32) -> Option<Self> {
        match len {
            0 => Some(ResponseShape::None),
            TEXT_RESPONSE => Some(ResponseShape::Text),
            n if n > 0 => Some(ResponseShape::Fixed(n as usize)),
            _ => None,
        }
    }

    /// Back to the host convention
    pub fn to_raw(self) -> i32 {
        match self {
            ResponseShape::None => 0,
            ResponseShape::Fixed(n) => n as i32,
            ResponseShape::Text => TEXT_RESPONSE,
        }
    }

    /// Whether nothing is read back
    pub fn is_empty(self) -> bool {
        matches!(self, ResponseShape::None | ResponseShape::Fixed(0))
    }

    /// Buffer space the response needs, terminator included
    pub fn required_capacity(self) -> usize {
        match self {
            ResponseShape::None => 0,
            ResponseShape::Fixed(n) => n,
            ResponseShape::Text => MAX_ID_LEN + 1,
        }
    }
}

/// One command/response transaction with a plate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeRequest {
    pub address: u8,
    pub command: u8,
    pub param1: u8,
    pub param2: u8,
    /// Use the ACK handshake and verification byte
    pub ack_mode: bool,
    pub response: ResponseShape,
}

impl ExchangeRequest {
    /// Command with no parameters and no response
    pub fn new(address: u8, command: u8) -> Self {
        Self {
            address,
            command,
            param1: 0,
            param2: 0,
            ack_mode: false,
            response: ResponseShape::None,
        }
    }

    pub fn with_params(mut self, param1: u8, param2: u8) -> Self {
        self.param1 = param1;
        self.param2 = param2;
        self
    }

    pub fn with_ack(mut self, ack_mode: bool) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    /// Set the expected response. `Fixed(0)` is stored as `None`.
    pub fn with_response(mut self, response: ResponseShape) -> Self {
        self.response = if response.is_empty() {
            ResponseShape::None
        } else {
            response
        };
        self
    }

    /// Expect exactly `len` bytes back, or nothing when `len` is 0
    pub fn expecting(self, len: usize) -> Self {
        self.with_response(ResponseShape::Fixed(len))
    }

    /// Expect an identity string back
    pub fn expecting_text(self) -> Self {
        self.with_response(ResponseShape::Text)
    }

    /// The 4-byte frame put on the wire
    pub fn frame(&self) -> [u8; COMMAND_LEN] {
        command_frame(self.address, self.command, self.param1, self.param2)
    }
}

/// Data returned by a successful exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeResult {
    data: ResponseBuffer,
    shape: ResponseShape,
    attempts: u32,
}

impl ExchangeResult {
    pub(crate) fn new(data: ResponseBuffer, shape: ResponseShape, attempts: u32) -> Self {
        Self { data, shape, attempts }
    }

    /// Received bytes. Identity strings include their NUL terminator.
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Identity string without its terminator
    pub fn text(&self) -> Option<&str> {
        if self.shape != ResponseShape::Text {
            return None;
        }
        let bytes = self.data.as_slice();
        let end = bytes.iter().position(|&b| b == NUL).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end]).ok()
    }

    pub fn shape(&self) -> ResponseShape {
        self.shape
    }

    /// Attempts the exchange took, at least 1
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn into_buffer(self) -> ResponseBuffer {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_from_raw() {
        assert_eq!(ResponseShape::from_raw(0), Some(ResponseShape::None));
        assert_eq!(ResponseShape::from_raw(3), Some(ResponseShape::Fixed(3)));
        assert_eq!(ResponseShape::from_raw(-1), Some(ResponseShape::Text));
        assert_eq!(ResponseShape::from_raw(-2), None);
        assert_eq!(ResponseShape::Fixed(7).to_raw(), 7);
        assert_eq!(ResponseShape::Text.to_raw(), -1);
    }

    #[test]
    fn test_required_capacity() {
        assert_eq!(ResponseShape::None.required_capacity(), 0);
        assert_eq!(ResponseShape::Fixed(12).required_capacity(), 12);
        assert_eq!(ResponseShape::Text.required_capacity(), 26);
    }

    #[test]
    fn test_zero_length_is_no_response() {
        assert!(ResponseShape::Fixed(0).is_empty());
        assert!(!ResponseShape::Text.is_empty());
        let req = ExchangeRequest::new(48, 0x10).expecting(0);
        assert_eq!(req.response, ResponseShape::None);
    }

    #[test]
    fn test_request_builder() {
        let req = ExchangeRequest::new(53, 0x01)
            .with_params(4, 5)
            .with_ack(true)
            .expecting_text();
        assert_eq!(req.frame(), [53, 0x01, 4, 5]);
        assert!(req.ack_mode);
        assert_eq!(req.response, ResponseShape::Text);
    }

    #[test]
    fn test_result_text() {
        let mut buf = ResponseBuffer::with_capacity(32);
        for &b in b"Pi-Plate RELAY\0" {
            buf.push(b).unwrap();
        }
        let result = ExchangeResult::new(buf, ResponseShape::Text, 1);
        assert_eq!(result.text(), Some("Pi-Plate RELAY"));
        assert_eq!(result.data().last(), Some(&NUL));
    }

    #[test]
    fn test_result_text_only_for_text_shape() {
        let mut buf = ResponseBuffer::with_capacity(4);
        buf.push(b'A').unwrap();
        let result = ExchangeResult::new(buf, ResponseShape::Fixed(1), 2);
        assert_eq!(result.text(), None);
        assert_eq!(result.attempts(), 2);
    }
}
