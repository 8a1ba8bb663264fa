//! All bytes that leave this crate go through here, so control messages, rollback messages
//! and packed input payloads agree on one layout: bincode `standard()` with fixed-width
//! little-endian integers. Fixed-width integers give every fixed-layout message a known
//! encoded size, which the control codec relies on for its minimum-payload checks.
//!
//! # Examples
//!
//! ```
//! use rollback_netplay::network::codec::{decode, encode, encoded_size};
//!
//! let bytes = encode(&(7u32, -1i32)).expect("encoding should succeed");
//! assert_eq!(bytes.len(), 8);
//! assert_eq!(encoded_size(&0u16).expect("size"), 2);
//!
//! let ((a, b), read): ((u32, i32), _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!((a, b, read), (7, -1, 8));
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
}

/// What was being encoded or decoded when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a control message.
    EncodeControl,
    /// Decoding a control message.
    DecodeControl,
    /// Encoding a rollback message.
    EncodeRollback,
    /// Decoding a rollback message.
    DecodeRollback,
    /// Appending to a buffer.
    AppendToBuffer,
    /// A generic encoding operation.
    Encode,
    /// A generic decoding operation.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeControl => write!(f, "encoding control message"),
            Self::DecodeControl => write!(f, "decoding control message"),
            Self::EncodeRollback => write!(f, "encoding rollback message"),
            Self::DecodeRollback => write!(f, "decoding rollback message"),
            Self::AppendToBuffer => write!(f, "appending to buffer"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode errors are opaque, so their message is kept as a string.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }

    /// Re-tags the error with a more specific operation.
    #[must_use]
    pub fn during(self, operation: CodecOperation) -> Self {
        match self {
            Self::EncodeError { message, .. } => Self::EncodeError { message, operation },
            Self::DecodeError { message, .. } => Self::DecodeError { message, operation },
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value by appending to an existing `Vec<u8>`. Returns the number of bytes added.
///
/// ```
/// use rollback_netplay::network::codec::encode_append;
///
/// let mut buffer = vec![0xAA];
/// let added = encode_append(&42u32, &mut buffer).expect("encoding should succeed");
/// assert_eq!(added, 4);
/// assert_eq!(buffer, [0xAA, 42, 0, 0, 0]);
/// ```
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::AppendToBuffer))
}

/// Number of bytes `value` occupies once encoded.
pub fn encoded_size<T: Serialize>(value: &T) -> CodecResult<usize> {
    encode(value).map(|bytes| bytes.len())
}

/// Decodes a value from a byte slice, returning it with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value from a byte slice, ignoring the bytes consumed.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize, Default)]
    struct Fixed {
        kind: u32,
        size: u32,
        name: [u8; 4],
    }

    #[test]
    fn test_fixed_layout_is_little_endian_and_unpadded() {
        let value = Fixed {
            kind: 1,
            size: 0x0102,
            name: *b"abcd",
        };
        let bytes = encode(&value).unwrap();
        assert_eq!(bytes, [1, 0, 0, 0, 2, 1, 0, 0, b'a', b'b', b'c', b'd']);
        assert_eq!(encoded_size(&Fixed::default()).unwrap(), 12);
    }

    #[test]
    fn test_decode_reports_bytes_consumed() {
        let mut bytes = encode(&Fixed::default()).unwrap();
        bytes.extend_from_slice(&[9, 9, 9]);
        let (decoded, read): (Fixed, _) = decode(&bytes).unwrap();
        assert_eq!(decoded, Fixed::default());
        assert_eq!(read, 12);
    }

    #[test]
    fn test_decode_truncated_data_fails() {
        let result: CodecResult<(u64, _)> = decode(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(CodecError::DecodeError { .. })));
    }

    #[test]
    fn test_during_retags_operation() {
        let err = decode_value::<u64>(&[1])
            .unwrap_err()
            .during(CodecOperation::DecodeControl);
        assert!(err.to_string().contains("decoding control message"));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let inputs = vec![3u32, 0, 7];
        assert_eq!(encode(&inputs).unwrap(), encode(&inputs).unwrap());
    }
}
