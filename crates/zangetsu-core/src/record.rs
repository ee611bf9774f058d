//! Record Framing Codec
//!
//! Every record in a time-entry data file is framed the same way:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (17 bytes)                                           │
//! │ - Magic bytes: "ZGRC" (4 bytes)                             │
//! │ - Payload size (4 bytes, u32 LE)                            │
//! │ - Timestamp (8 bytes, u64 LE)                               │
//! │ - Flags (1 byte, bit 0 = corrupted)                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Payload (payload_size bytes)                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Footer (8 bytes)                                            │
//! │ - CRC32 over header + payload (4 bytes, u32 LE)             │
//! │ - Magic bytes: "ZGRF" (4 bytes)                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The layout is a sealed constant of the format: all integers are
//! fixed-width little-endian and nothing here is configurable. `HEADER_SIZE`
//! and `FOOTER_SIZE` are public so callers can do offset arithmetic (a
//! record written at offset `o` is followed by one at
//! `o + HEADER_SIZE + payload_size + FOOTER_SIZE`).
//!
//! A record can be flagged `corrupted` at write time; the flag travels with
//! the record and is handed back to readers unchanged. This is distinct from
//! the codec-level corruption errors (`MalformedHeader`, `CrcMismatch`),
//! which mean the framing itself does not check out.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Magic bytes opening every record header: "ZGRC"
pub const HEADER_MAGIC: [u8; 4] = *b"ZGRC";

/// Magic bytes closing every record footer: "ZGRF"
pub const FOOTER_MAGIC: [u8; 4] = *b"ZGRF";

/// Record header size: magic (4) + payload size (4) + timestamp (8) + flags (1)
pub const HEADER_SIZE: usize = 17;

/// Record footer size: crc32 (4) + magic (4)
pub const FOOTER_SIZE: usize = 8;

const FLAG_CORRUPTED: u8 = 0b0000_0001;

/// Total on-disk length of a record with the given payload length.
pub fn record_size(payload_len: usize) -> usize {
    HEADER_SIZE + payload_len + FOOTER_SIZE
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Payload length in bytes
    pub payload_size: u32,

    /// Timestamp carried by the record
    pub timestamp: u64,

    /// Whether the writer flagged the record as corrupted
    pub corrupted: bool,
}

impl RecordHeader {
    /// Decode a header from the first `HEADER_SIZE` bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::MalformedHeader);
        }
        if buf[0..4] != HEADER_MAGIC {
            return Err(Error::MalformedHeader);
        }

        let mut rest = &buf[4..HEADER_SIZE];
        let payload_size = rest.get_u32_le();
        let timestamp = rest.get_u64_le();
        let flags = rest.get_u8();

        // Unknown flag bits mean this was not written by this codec.
        if flags & !FLAG_CORRUPTED != 0 {
            return Err(Error::MalformedHeader);
        }

        Ok(Self {
            payload_size,
            timestamp,
            corrupted: flags & FLAG_CORRUPTED != 0,
        })
    }

    /// Total on-disk length of the record this header describes.
    pub fn record_size(&self) -> usize {
        record_size(self.payload_size as usize)
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&HEADER_MAGIC);
        buf.put_u32_le(self.payload_size);
        buf.put_u64_le(self.timestamp);
        buf.put_u8(if self.corrupted { FLAG_CORRUPTED } else { 0 });
    }
}

/// Encode one record from a list of payload buffers.
///
/// The buffers are concatenated into a single payload; the returned bytes
/// are the complete framed record (header + payload + footer).
pub fn encode_record(buffers: &[&[u8]], timestamp: u64, corrupted: bool) -> Bytes {
    let payload_len: usize = buffers.iter().map(|b| b.len()).sum();
    let header = RecordHeader {
        payload_size: payload_len as u32,
        timestamp,
        corrupted,
    };

    let mut buf = BytesMut::with_capacity(record_size(payload_len));
    header.encode_into(&mut buf);
    for b in buffers {
        buf.put_slice(b);
    }

    let crc = crc32fast::hash(&buf[..]);
    buf.put_u32_le(crc);
    buf.put_slice(&FOOTER_MAGIC);

    buf.freeze()
}

/// Verify the footer of a complete framed record.
///
/// `framed` must span header, payload, and footer. The footer magic is
/// checked first, then the CRC over header + payload.
pub fn verify_footer(framed: &[u8]) -> Result<()> {
    if framed.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(Error::TruncatedRecord);
    }

    let body = &framed[..framed.len() - FOOTER_SIZE];
    let footer = &framed[framed.len() - FOOTER_SIZE..];

    if footer[4..8] != FOOTER_MAGIC {
        return Err(Error::MalformedFooter);
    }

    let expected = u32::from_le_bytes(footer[0..4].try_into().expect("footer crc is 4 bytes"));
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(Error::CrcMismatch { expected, actual });
    }

    Ok(())
}

/// Decode a complete framed record, verifying header and footer.
///
/// Returns the header and the payload slice.
pub fn decode_record(framed: &[u8]) -> Result<(RecordHeader, &[u8])> {
    let header = RecordHeader::decode(framed)?;
    if framed.len() != header.record_size() {
        return Err(Error::TruncatedRecord);
    }
    verify_footer(framed)?;
    Ok((header, &framed[HEADER_SIZE..HEADER_SIZE + header.payload_size as usize]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode() {
        let framed = encode_record(&[b"hello world"], 172_800, false);
        assert_eq!(framed.len(), record_size(11));

        let (header, payload) = decode_record(&framed).unwrap();
        assert_eq!(header.payload_size, 11);
        assert_eq!(header.timestamp, 172_800);
        assert!(!header.corrupted);
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn encode_concatenates_buffers() {
        let framed = encode_record(&[b"hel", b"lo ", b"world"], 0, false);
        let (_, payload) = decode_record(&framed).unwrap();
        assert_eq!(payload, b"hello world");

        // Identical to encoding the payload in one buffer.
        let single = encode_record(&[b"hello world"], 0, false);
        assert_eq!(framed, single);
    }

    #[test]
    fn corrupted_flag_round_trips() {
        let framed = encode_record(&[b"x"], 7, true);
        let (header, _) = decode_record(&framed).unwrap();
        assert!(header.corrupted);
    }

    #[test]
    fn empty_payload() {
        let framed = encode_record(&[], 1, false);
        assert_eq!(framed.len(), HEADER_SIZE + FOOTER_SIZE);
        let (header, payload) = decode_record(&framed).unwrap();
        assert_eq!(header.payload_size, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut framed = encode_record(&[b"data"], 0, false).to_vec();
        framed[0] ^= 0xFF;
        assert!(matches!(
            RecordHeader::decode(&framed),
            Err(Error::MalformedHeader)
        ));
    }

    #[test]
    fn header_rejects_short_input() {
        let framed = encode_record(&[b"data"], 0, false);
        assert!(matches!(
            RecordHeader::decode(&framed[..HEADER_SIZE - 1]),
            Err(Error::MalformedHeader)
        ));
    }

    #[test]
    fn header_rejects_unknown_flags() {
        let mut framed = encode_record(&[b"data"], 0, false).to_vec();
        framed[HEADER_SIZE - 1] = 0b1000_0000;
        assert!(matches!(
            RecordHeader::decode(&framed),
            Err(Error::MalformedHeader)
        ));
    }

    #[test]
    fn footer_detects_payload_corruption() {
        let mut framed = encode_record(&[b"some payload"], 42, false).to_vec();
        framed[HEADER_SIZE + 3] ^= 0x01;
        assert!(matches!(
            verify_footer(&framed),
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn footer_detects_header_corruption() {
        let mut framed = encode_record(&[b"some payload"], 42, false).to_vec();
        // Flip a timestamp byte; the header still decodes but the CRC no
        // longer matches.
        framed[10] ^= 0x01;
        assert!(RecordHeader::decode(&framed).is_ok());
        assert!(matches!(
            verify_footer(&framed),
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let mut framed = encode_record(&[b"p"], 0, false).to_vec();
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        assert!(matches!(
            verify_footer(&framed),
            Err(Error::MalformedFooter)
        ));
    }

    #[test]
    fn decode_rejects_truncated_record() {
        let framed = encode_record(&[b"hello"], 0, false);
        assert!(matches!(
            decode_record(&framed[..framed.len() - 1]),
            Err(Error::TruncatedRecord)
        ));
    }

    #[test]
    fn offset_arithmetic_matches_record_size() {
        // Two records back to back: the second starts exactly record_size
        // bytes after the first.
        let first = encode_record(&[b"hello"], 0, false);
        let second = encode_record(&[b"world!"], 0, false);
        let mut file = first.to_vec();
        file.extend_from_slice(&second);

        let offset = record_size(5);
        assert_eq!(offset, HEADER_SIZE + 5 + FOOTER_SIZE);
        let (header, payload) = decode_record(&file[offset..]).unwrap();
        assert_eq!(header.payload_size, 6);
        assert_eq!(payload, b"world!");
    }
}
