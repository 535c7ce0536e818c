//! Checksummed length-prefixed frames shared by the WAL and segment files.
//!
//! Layout: `[len: u32 LE][crc32(len): u32 LE][crc32(payload): u32 LE][payload; len]`.
//!
//! The length carries its own checksum, so a damaged length is told apart
//! from a frame whose payload was cut short at the end of the buffer.

/// Bytes before the payload.
pub(super) const HEADER_LEN: usize = 12;

/// Largest payload a frame may claim.
pub(super) const MAX_PAYLOAD_LEN: usize = 1 << 30;

/// Outcome of decoding one frame from a buffer.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum FrameRead<'a> {
    /// Clean end of buffer.
    End,
    /// A frame whose checksums matched.
    Complete { payload: &'a [u8], next: usize },
    /// The buffer ends inside the header, or inside the payload of a frame
    /// whose header is intact.
    Truncated,
    /// A complete header whose length fails its checksum or is out of range.
    BadHeader,
    /// The full frame is present but its payload checksum does not match.
    ChecksumMismatch { end: usize },
}

/// Wrap `payload` in a frame.
pub(super) fn encode(payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() as u32).to_le_bytes();
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&len);
    out.extend_from_slice(&crc32fast::hash(&len).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn word(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Decode the frame starting at `offset`.
pub(super) fn read_at(buf: &[u8], offset: usize) -> FrameRead<'_> {
    if offset >= buf.len() {
        return FrameRead::End;
    }
    let rest = &buf[offset..];
    if rest.len() < HEADER_LEN {
        return FrameRead::Truncated;
    }
    if crc32fast::hash(&rest[..4]) != word(rest, 4) {
        return FrameRead::BadHeader;
    }
    let len = word(rest, 0) as usize;
    if len > MAX_PAYLOAD_LEN {
        return FrameRead::BadHeader;
    }
    if rest.len() - HEADER_LEN < len {
        return FrameRead::Truncated;
    }
    let payload = &rest[HEADER_LEN..HEADER_LEN + len];
    let end = offset + HEADER_LEN + len;
    if crc32fast::hash(payload) != word(rest, 8) {
        return FrameRead::ChecksumMismatch { end };
    }
    FrameRead::Complete { payload, next: end }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_decode_in_sequence() {
        let mut buf = encode(b"first");
        buf.extend(encode(b""));
        buf.extend(encode(b"third"));

        let FrameRead::Complete { payload, next } = read_at(&buf, 0) else {
            panic!("expected a frame");
        };
        assert_eq!(payload, b"first");
        let FrameRead::Complete { payload, next } = read_at(&buf, next) else {
            panic!("expected a frame");
        };
        assert!(payload.is_empty());
        let FrameRead::Complete { payload, next } = read_at(&buf, next) else {
            panic!("expected a frame");
        };
        assert_eq!(payload, b"third");
        assert_eq!(read_at(&buf, next), FrameRead::End);
    }

    #[test]
    fn test_torn_and_corrupt_frames() {
        let frame = encode(b"payload");
        assert_eq!(read_at(&frame[..5], 0), FrameRead::Truncated);
        assert_eq!(read_at(&frame[..frame.len() - 1], 0), FrameRead::Truncated);

        let mut flipped = frame.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;
        assert_eq!(
            read_at(&flipped, 0),
            FrameRead::ChecksumMismatch { end: frame.len() }
        );
    }

    #[test]
    fn test_damaged_length_is_a_bad_header() {
        let mut frame = encode(b"payload");
        frame[0] ^= 0x01;
        assert_eq!(read_at(&frame, 0), FrameRead::BadHeader);

        let mut huge = encode(b"payload");
        huge[3] = 0xff;
        assert_eq!(read_at(&huge, 0), FrameRead::BadHeader);
    }
}
