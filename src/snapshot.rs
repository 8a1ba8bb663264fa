//! The container the host broadcasts with every reset.
//!
//! Layout: `"RNSS"`, a little-endian `u32` state-format version, the `u32` uncompressed size,
//! then the lz4 block (itself prefixed with its uncompressed size, as `lz4_flex` writes it).

use crate::NetplayError;

const MAGIC: [u8; 4] = *b"RNSS";
const HEADER_LEN: usize = 12;

/// Largest state a snapshot may claim to hold.
pub const MAX_STATE_SIZE: usize = 64 * 1024 * 1024;

/// Encoding and decoding of reset snapshots.
///
/// ```
/// use rollback_netplay::snapshot::Snapshot;
///
/// let raw = vec![7u8; 4096];
/// let bytes = Snapshot::encode(3, &raw);
/// assert!(bytes.len() < raw.len());
/// assert_eq!(Snapshot::decode(&bytes, 3)?, raw);
/// assert!(Snapshot::decode(&bytes, 4).is_err());
/// # Ok::<(), rollback_netplay::NetplayError>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Snapshot;

impl Snapshot {
    /// Wraps and compresses a raw simulation state.
    #[must_use]
    pub fn encode(version: u32, raw: &[u8]) -> Vec<u8> {
        let compressed = lz4_flex::compress_prepend_size(raw);
        let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&version.to_le_bytes());
        out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
        out.extend_from_slice(&compressed);
        out
    }

    /// Reads the version of an encoded snapshot without decompressing it.
    ///
    /// # Errors
    /// Returns [`NetplayError::Snapshot`] if the header is missing or malformed.
    pub fn version(bytes: &[u8]) -> Result<u32, NetplayError> {
        header(bytes).map(|(version, _)| version)
    }

    /// Checks the header against `expected_version` and decompresses the state.
    ///
    /// # Errors
    /// Returns [`NetplayError::Snapshot`] on a bad magic, a version mismatch, or a payload that
    /// does not decompress to the recorded size.
    pub fn decode(bytes: &[u8], expected_version: u32) -> Result<Vec<u8>, NetplayError> {
        let (version, size) = header(bytes)?;
        if version != expected_version {
            return Err(NetplayError::Snapshot {
                context: format!(
                    "state format version {version} does not match ours ({expected_version})"
                ),
            });
        }
        let payload = bytes.get(HEADER_LEN..).unwrap_or_default();
        let prepended = payload
            .get(..4)
            .and_then(|b| <[u8; 4]>::try_from(b).ok())
            .map(|b| u32::from_le_bytes(b) as usize);
        if size > MAX_STATE_SIZE || prepended != Some(size) {
            return Err(NetplayError::Snapshot {
                context: format!("snapshot claims an implausible size of {size} bytes"),
            });
        }
        let raw = lz4_flex::decompress_size_prepended(payload).map_err(|e| {
            NetplayError::Snapshot {
                context: format!("corrupt snapshot payload: {e}"),
            }
        })?;
        if raw.len() != size {
            return Err(NetplayError::Snapshot {
                context: format!(
                    "snapshot decompressed to {} bytes, header says {}",
                    raw.len(),
                    size
                ),
            });
        }
        Ok(raw)
    }
}

fn header(bytes: &[u8]) -> Result<(u32, usize), NetplayError> {
    let read_u32 = |at: usize| {
        bytes
            .get(at..at + 4)
            .and_then(|b| <[u8; 4]>::try_from(b).ok())
            .map(u32::from_le_bytes)
    };
    if bytes.get(..4) != Some(MAGIC.as_slice()) {
        return Err(NetplayError::Snapshot {
            context: "missing snapshot magic".to_owned(),
        });
    }
    match (read_u32(4), read_u32(8)) {
        (Some(version), Some(size)) => Ok((version, size as usize)),
        _ => Err(NetplayError::Snapshot {
            context: format!("snapshot header truncated at {} bytes", bytes.len()),
        }),
    }
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
    use proptest::prelude::*;

    #[test]
    fn header_layout() {
        let bytes = Snapshot::encode(0x0102, &[1, 2, 3]);
        assert_eq!(&bytes[..4], b"RNSS");
        assert_eq!(&bytes[4..8], &[2, 1, 0, 0]);
        assert_eq!(&bytes[8..12], &[3, 0, 0, 0]);
        assert_eq!(Snapshot::version(&bytes).unwrap(), 0x0102);
    }

    #[test]
    fn empty_state_survives() {
        let bytes = Snapshot::encode(1, &[]);
        assert_eq!(Snapshot::decode(&bytes, 1).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = Snapshot::encode(1, &[5; 64]);
        bytes[0] = b'X';
        assert!(matches!(
            Snapshot::decode(&bytes, 1),
            Err(NetplayError::Snapshot { .. })
        ));
        assert!(Snapshot::version(&[b'R', b'N']).is_err());
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut bytes = Snapshot::encode(1, &[5; 64]);
        bytes[8] = 65;
        assert!(Snapshot::decode(&bytes, 1).is_err());
    }

    #[test]
    fn oversized_claims_are_rejected_before_decompressing() {
        let mut bytes = Snapshot::encode(1, &[0; 16]);
        let huge = (MAX_STATE_SIZE as u32 + 1).to_le_bytes();
        bytes[8..12].copy_from_slice(&huge);
        bytes[12..16].copy_from_slice(&huge);
        assert!(Snapshot::decode(&bytes, 1).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = Snapshot::encode(1, &(0..=255).collect::<Vec<u8>>());
        assert!(Snapshot::decode(&bytes[..bytes.len() - 10], 1).is_err());
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = Snapshot::decode(&bytes, 1);
        }

        #[test]
        fn encode_then_decode_returns_the_state(raw in proptest::collection::vec(any::<u8>(), 0..2048), version in any::<u32>()) {
            prop_assert_eq!(Snapshot::decode(&Snapshot::encode(version, &raw), version).unwrap(), raw);
        }
    }
}
