//! Capture file codec and the immutable packet store.
//!
//! A capture is a plain concatenation of little-endian records:
//!
//! ```text
//! [u64 LE: timestamp_ms][i32 LE: length][length bytes of payload]...
//! ```
//!
//! End of input at a record boundary terminates the sequence. End of input
//! anywhere inside a record is a [`ReplayError::MalformedCapture`].

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

use crate::error::{ReplayError, Result};

/// Size of the fixed record header: timestamp plus length.
pub const RECORD_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub timestamp: u64, // Virtual capture time in milliseconds
    pub payload: Vec<u8>, // Opaque bytes replayed verbatim to clients
}

impl Packet {
    pub fn new(timestamp: u64, payload: Vec<u8>) -> Self {
        Self { timestamp, payload }
    }

    /// Encoded size of this packet as a capture record.
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.payload.len()
    }
}

/// Shape of a loaded capture, for logging and `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    pub packets: usize,
    pub bytes: u64,
    pub leading_zero_packets: usize,
    pub first_timestamp_ms: Option<u64>,
    pub last_timestamp_ms: Option<u64>,
    pub duration_ms: u64,
}

/// Ordered, index-addressable packets. Never mutated after construction and
/// never re-sorted: capture order is trusted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PacketStore {
    packets: Vec<Packet>,
}

impl PacketStore {
    pub fn from_packets(packets: Vec<Packet>) -> Self {
        Self { packets }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Packet> {
        self.packets.get(index)
    }

    /// Payload of the packet at `index`.
    ///
    /// Callers only ask for indices below a cursor they observed, so an
    /// out-of-range index is a bug and panics.
    pub fn payload(&self, index: usize) -> &[u8] {
        match self.packets.get(index) {
            Some(packet) => &packet.payload,
            None => panic!(
                "packet index {} out of range for capture of {} packets",
                index,
                self.packets.len()
            ),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Packet> {
        self.packets.iter()
    }

    /// Number of leading packets stamped at time zero. These are treated as
    /// already revealed when playback is constructed.
    pub fn leading_zero_count(&self) -> usize {
        self.packets
            .iter()
            .take_while(|packet| packet.timestamp == 0)
            .count()
    }

    pub fn summary(&self) -> CaptureSummary {
        let first = self.packets.first().map(|p| p.timestamp);
        let last = self.packets.last().map(|p| p.timestamp);
        CaptureSummary {
            packets: self.packets.len(),
            bytes: self.packets.iter().map(|p| p.payload.len() as u64).sum(),
            leading_zero_packets: self.leading_zero_count(),
            first_timestamp_ms: first,
            last_timestamp_ms: last,
            duration_ms: match (first, last) {
                (Some(first), Some(last)) => last.saturating_sub(first),
                _ => 0,
            },
        }
    }

    pub fn into_packets(self) -> Vec<Packet> {
        self.packets
    }
}

/// Decode a complete capture held in memory.
pub fn decode(bytes: &[u8]) -> Result<PacketStore> {
    let mut packets = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        if remaining < RECORD_HEADER_LEN {
            return Err(ReplayError::MalformedCapture {
                offset,
                detail: format!(
                    "record header needs {} bytes, only {} left",
                    RECORD_HEADER_LEN, remaining
                ),
            });
        }

        let timestamp = LittleEndian::read_u64(&bytes[offset..offset + 8]);
        let declared = LittleEndian::read_i32(&bytes[offset + 8..offset + RECORD_HEADER_LEN]);
        let length = usize::try_from(declared).map_err(|_| ReplayError::MalformedCapture {
            offset,
            detail: format!("negative payload length {}", declared),
        })?;

        let start = offset + RECORD_HEADER_LEN;
        let available = bytes.len() - start;
        if available < length {
            return Err(ReplayError::MalformedCapture {
                offset,
                detail: format!(
                    "payload declares {} bytes, only {} left",
                    length, available
                ),
            });
        }

        packets.push(Packet::new(timestamp, bytes[start..start + length].to_vec()));
        offset = start + length;
    }

    debug!("Decoded {} packets from {} capture bytes", packets.len(), bytes.len());
    Ok(PacketStore::from_packets(packets))
}

/// Read `reader` to end of input and decode it. Nothing is kept on failure.
pub fn load<R: Read>(mut reader: R) -> Result<PacketStore> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    decode(&bytes)
}

pub fn load_file(path: impl AsRef<Path>) -> Result<PacketStore> {
    let file = File::open(path.as_ref())?;
    load(BufReader::new(file))
}

/// Encode packets as capture records.
pub fn write_capture<'a, W, I>(writer: &mut W, packets: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a Packet>,
{
    for (index, packet) in packets.into_iter().enumerate() {
        let length = i32::try_from(packet.payload.len()).map_err(|_| {
            ReplayError::PayloadTooLarge {
                index,
                len: packet.payload.len(),
            }
        })?;
        writer.write_u64::<LittleEndian>(packet.timestamp)?;
        writer.write_i32::<LittleEndian>(length)?;
        writer.write_all(&packet.payload)?;
    }
    Ok(())
}

pub fn write_capture_file<'a, I>(path: impl AsRef<Path>, packets: I) -> Result<()>
where
    I: IntoIterator<Item = &'a Packet>,
{
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    write_capture(&mut writer, packets)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(packets: &[Packet]) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_capture(&mut bytes, packets).unwrap();
        bytes
    }

    #[test]
    fn test_decode_records() {
        let packets = vec![
            Packet::new(0, b"A".to_vec()),
            Packet::new(0, b"B".to_vec()),
            Packet::new(100, b"CDE".to_vec()),
        ];
        let bytes = encode(&packets);
        assert_eq!(bytes.len(), 3 * RECORD_HEADER_LEN + 5);

        let store = decode(&bytes).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.payload(2), b"CDE");
        assert_eq!(store.leading_zero_count(), 2);
    }

    #[test]
    fn test_layout_is_little_endian() {
        let bytes = encode(&[Packet::new(0x0102, vec![0xAA, 0xBB])]);
        assert_eq!(
            bytes,
            vec![0x02, 0x01, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_empty_capture() {
        let store = load(&[][..]).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.summary().duration_ms, 0);
    }

    #[test]
    fn test_truncated_payload() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&50u64.to_le_bytes());
        bytes.extend_from_slice(&10i32.to_le_bytes());
        bytes.extend_from_slice(b"abcd");

        match decode(&bytes) {
            Err(ReplayError::MalformedCapture { offset, .. }) => assert_eq!(offset, 0),
            other => panic!("expected malformed capture, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_header_after_good_record() {
        let mut bytes = encode(&[Packet::new(5, b"ok".to_vec())]);
        bytes.extend_from_slice(&[1, 2, 3]);

        match decode(&bytes) {
            Err(ReplayError::MalformedCapture { offset, .. }) => {
                assert_eq!(offset, RECORD_HEADER_LEN + 2)
            }
            other => panic!("expected malformed capture, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(ReplayError::MalformedCapture { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_payload_out_of_range_panics() {
        let store = PacketStore::from_packets(vec![Packet::new(1, vec![1])]);
        store.payload(1);
    }

    #[test]
    fn test_summary() {
        let store = PacketStore::from_packets(vec![
            Packet::new(0, vec![1, 2]),
            Packet::new(40, vec![3]),
            Packet::new(250, vec![4, 5, 6]),
        ]);
        let summary = store.summary();
        assert_eq!(summary.packets, 3);
        assert_eq!(summary.bytes, 6);
        assert_eq!(summary.leading_zero_packets, 1);
        assert_eq!(summary.duration_ms, 250);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.cap");
        let packets = vec![Packet::new(0, b"hello".to_vec()), Packet::new(7, Vec::new())];

        write_capture_file(&path, &packets).unwrap();
        let store = load_file(&path).unwrap();
        assert_eq!(store.into_packets(), packets);
    }

    proptest! {
        #[test]
        fn prop_decode_reencode_matches(
            records in proptest::collection::vec(
                (any::<u64>(), proptest::collection::vec(any::<u8>(), 0..64)),
                0..16,
            )
        ) {
            let packets: Vec<Packet> = records
                .into_iter()
                .map(|(ts, payload)| Packet::new(ts, payload))
                .collect();
            let bytes = encode(&packets);

            let store = decode(&bytes).unwrap();
            prop_assert_eq!(store.len(), packets.len());
            prop_assert_eq!(encode(&store.into_packets()), bytes);
        }

        #[test]
        fn prop_cut_inside_last_record_fails(
            payload in proptest::collection::vec(any::<u8>(), 0..32),
            cut in 1usize..44,
        ) {
            let packet = Packet::new(9, payload);
            let bytes = encode(&[packet.clone()]);
            let cut = cut.min(packet.record_len());
            prop_assume!(cut < packet.record_len());

            let is_malformed = matches!(
                decode(&bytes[..bytes.len() - cut]),
                Err(ReplayError::MalformedCapture { .. })
            );
            prop_assert!(is_malformed);
        }
    }
}
