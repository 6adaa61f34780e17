/**
 * nat_traversal/hole_punching.rs
 *
 * Peer-to-peer datagram framing: ping probes and data packets
 */

use rand::RngCore;

use crate::error::WireError;

/// "DATADATA"
pub const MAGIC_DATA: u64 = 0x4441_5441_4441_5441;

/// "PINGPING"
pub const MAGIC_PING: u64 = 0x5049_4e47_5049_4e47;

/// Magic plus filler. Some NAT paths silently drop tiny UDP packets,
/// so every datagram is padded to at least this size.
pub const HEADER_LEN: usize = 128;

const MAGIC_LEN: usize = 8;

/// A decoded peer datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    Ping,
    Data(&'a [u8]),
}

/// Build a 128 byte ping probe
pub fn encode_ping() -> Vec<u8> {
    framed(MAGIC_PING, &[])
}

/// Build a data packet carrying `payload` after the 128 byte header
pub fn encode_data(payload: &[u8]) -> Vec<u8> {
    framed(MAGIC_DATA, payload)
}

/// Classify a datagram received from a peer
pub fn decode(datagram: &[u8]) -> Result<Packet<'_>, WireError> {
    if datagram.len() < MAGIC_LEN {
        return Err(WireError::TooShort(datagram.len()));
    }

    let mut magic = [0u8; MAGIC_LEN];
    magic.copy_from_slice(&datagram[..MAGIC_LEN]);

    match u64::from_be_bytes(magic) {
        MAGIC_PING => Ok(Packet::Ping),
        MAGIC_DATA => datagram
            .get(HEADER_LEN..)
            .map(Packet::Data)
            .ok_or(WireError::Truncated(datagram.len())),
        other => Err(WireError::UnknownMagic(other)),
    }
}

fn framed(magic: u64, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; HEADER_LEN + payload.len()];

    rand::thread_rng().fill_bytes(&mut bytes[MAGIC_LEN..HEADER_LEN]);
    bytes[..MAGIC_LEN].copy_from_slice(&magic.to_be_bytes());
    bytes[HEADER_LEN..].copy_from_slice(payload);

    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_magic_is_ascii() {
        assert_eq!(&MAGIC_DATA.to_be_bytes(), b"DATADATA");
        assert_eq!(&MAGIC_PING.to_be_bytes(), b"PINGPING");
    }

    #[test]
    fn test_ping_layout() {
        let ping = encode_ping();
        assert_eq!(ping.len(), HEADER_LEN);
        assert_eq!(&ping[..8], b"PINGPING");
        assert_eq!(decode(&ping), Ok(Packet::Ping));
    }

    #[test]
    fn test_ping_needs_only_magic() {
        assert_eq!(decode(b"PINGPING"), Ok(Packet::Ping));
    }

    #[test]
    fn test_data_layout() {
        let data = encode_data(b"hello");
        assert_eq!(data.len(), HEADER_LEN + 5);
        assert_eq!(&data[..8], b"DATADATA");
        assert_eq!(&data[HEADER_LEN..], b"hello");
        assert_eq!(decode(&data), Ok(Packet::Data(b"hello")));
    }

    #[test]
    fn test_empty_data() {
        let data = encode_data(&[]);
        assert_eq!(decode(&data), Ok(Packet::Data(&[])));
    }

    #[test]
    fn test_truncated_data() {
        let mut data = encode_data(b"x");
        data.truncate(HEADER_LEN - 1);
        assert_eq!(decode(&data), Err(WireError::Truncated(HEADER_LEN - 1)));
        assert_eq!(decode(b"DATADATA"), Err(WireError::Truncated(8)));
    }

    #[test]
    fn test_filler_varies() {
        // 120 random bytes colliding twice is not a realistic outcome
        assert_ne!(encode_ping(), encode_ping());
    }

    proptest! {
        #[test]
        fn prop_data_survives(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let bytes = encode_data(&payload);
            prop_assert_eq!(decode(&bytes), Ok(Packet::Data(&payload[..])));
        }

        #[test]
        fn prop_short_datagrams(bytes in proptest::collection::vec(any::<u8>(), 0..8)) {
            prop_assert_eq!(decode(&bytes), Err(WireError::TooShort(bytes.len())));
        }

        #[test]
        fn prop_unknown_magic(magic in any::<u64>(), tail in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assume!(magic != MAGIC_DATA && magic != MAGIC_PING);
            let mut bytes = magic.to_be_bytes().to_vec();
            bytes.extend_from_slice(&tail);
            prop_assert_eq!(decode(&bytes), Err(WireError::UnknownMagic(magic)));
        }
    }
}
