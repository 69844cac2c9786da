use thiserror::Error;

/// Total size of one wire record: tag + length + fixed data area.
pub const FRAME_LEN: usize = 515;

/// Size of the tag + length header.
pub const HEADER_LEN: usize = 3;

/// Maximum number of significant payload bytes in one record.
pub const MAX_PAYLOAD: usize = 512;

/// Frame tags. Server-originated tags live in 0x01–0x04, client-originated
/// tags in 0x11–0x14.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    ServerAck = 0x01,
    ServerError = 0x02,
    ServerChat = 0x03,
    ServerNotification = 0x04,
    ClientJoin = 0x11,
    ClientLeave = 0x12,
    ClientChat = 0x13,
    /// Reserved for future commands (status changes, whispers).
    ClientCommand = 0x14,
}

impl Tag {
    /// Convert from the wire byte, returning `None` for unknown tags.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Tag::ServerAck),
            0x02 => Some(Tag::ServerError),
            0x03 => Some(Tag::ServerChat),
            0x04 => Some(Tag::ServerNotification),
            0x11 => Some(Tag::ClientJoin),
            0x12 => Some(Tag::ClientLeave),
            0x13 => Some(Tag::ClientChat),
            0x14 => Some(Tag::ClientCommand),
            _ => None,
        }
    }

    /// Whether this tag may be sent by a client.
    pub fn is_client(self) -> bool {
        (self as u8) >= 0x11
    }

    /// Whether this tag may be sent by the server.
    pub fn is_server(self) -> bool {
        (self as u8) <= 0x04
    }
}

/// Errors produced while decoding a wire record.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than [`FRAME_LEN`] bytes were available.
    #[error("record truncated: {0} of 515 bytes")]
    Truncated(usize),
    /// The tag byte is not a known server or client tag.
    #[error("unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),
    /// The declared payload length exceeds [`MAX_PAYLOAD`].
    #[error("declared payload length {0} exceeds 512")]
    Oversize(u16),
}

/// A decoded view into one wire record. Borrows the significant payload
/// bytes from the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameView<'a> {
    pub tag: Tag,
    pub payload: &'a [u8],
}

/// Decode one record from the front of `buf`.
///
/// Succeeds only when at least [`FRAME_LEN`] bytes are available, the tag
/// is known, and the declared length is within bounds. Bytes beyond
/// [`FRAME_LEN`] belong to the next record and are ignored here.
pub fn decode(buf: &[u8]) -> Result<FrameView<'_>, FrameError> {
    if buf.len() < FRAME_LEN {
        return Err(FrameError::Truncated(buf.len()));
    }
    let tag = Tag::from_u8(buf[0]).ok_or(FrameError::UnknownTag(buf[0]))?;
    let len = u16::from_le_bytes([buf[1], buf[2]]);
    if len as usize > MAX_PAYLOAD {
        return Err(FrameError::Oversize(len));
    }
    Ok(FrameView {
        tag,
        payload: &buf[HEADER_LEN..HEADER_LEN + len as usize],
    })
}

/// Encode a record into `out`. The data area beyond `payload` is zeroed.
///
/// # Panics
///
/// Panics if `payload` exceeds [`MAX_PAYLOAD`] bytes; callers construct
/// payloads and are expected to bound them.
pub fn encode(tag: Tag, payload: &[u8], out: &mut [u8; FRAME_LEN]) {
    assert!(
        payload.len() <= MAX_PAYLOAD,
        "payload of {} bytes exceeds the 512-byte data area",
        payload.len()
    );
    out[0] = tag as u8;
    out[1..3].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    out[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    out[HEADER_LEN + payload.len()..].fill(0);
}

/// Build the 4-byte JOIN payload for a session id.
pub fn join_payload(session_id: u32) -> [u8; 4] {
    (session_id as i32).to_le_bytes()
}

/// Parse the session id out of a JOIN payload.
///
/// The wire carries a little-endian `i32`; negative ids and short
/// payloads are rejected.
pub fn join_session_id(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    let id = i32::from_le_bytes(bytes);
    if id < 0 { None } else { Some(id as u32) }
}

/// Sanitize a chat payload in place, compacting it to the left.
///
/// Keeps printable ASCII (0x20–0x7E), HT/LF/CR, and bytes with the high
/// bit set; strips everything else. Returns the new length.
pub fn sanitize_in_place(data: &mut [u8]) -> usize {
    let mut kept = 0;
    for i in 0..data.len() {
        let b = data[i];
        if (32..=126).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t' || b >= 128 {
            data[kept] = b;
            kept += 1;
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(tag: u8, len: u16, payload: &[u8]) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = tag;
        buf[1..3].copy_from_slice(&len.to_le_bytes());
        buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
        buf
    }

    #[test]
    fn encode_decode_identity() {
        let mut buf = [0u8; FRAME_LEN];
        encode(Tag::ClientChat, b"hello", &mut buf);
        let view = decode(&buf).unwrap();
        assert_eq!(view.tag, Tag::ClientChat);
        assert_eq!(view.payload, b"hello");
    }

    #[test]
    fn empty_payload() {
        let mut buf = [0u8; FRAME_LEN];
        encode(Tag::ClientLeave, b"", &mut buf);
        let view = decode(&buf).unwrap();
        assert_eq!(view.tag, Tag::ClientLeave);
        assert!(view.payload.is_empty());
    }

    #[test]
    fn max_payload_round_trips() {
        let payload = [0x41u8; MAX_PAYLOAD];
        let mut buf = [0u8; FRAME_LEN];
        encode(Tag::ServerChat, &payload, &mut buf);
        let view = decode(&buf).unwrap();
        assert_eq!(view.payload.len(), MAX_PAYLOAD);
    }

    #[test]
    fn oversize_length_rejected() {
        let buf = frame_bytes(0x13, 513, b"");
        assert_eq!(decode(&buf), Err(FrameError::Oversize(513)));
    }

    #[test]
    fn unknown_tags_rejected() {
        for tag in [0x00u8, 0x05, 0x10, 0x15, 0xFF] {
            let buf = frame_bytes(tag, 0, b"");
            assert_eq!(decode(&buf), Err(FrameError::UnknownTag(tag)));
        }
    }

    #[test]
    fn reserved_command_tag_accepted() {
        let buf = frame_bytes(0x14, 0, b"");
        assert_eq!(decode(&buf).unwrap().tag, Tag::ClientCommand);
    }

    #[test]
    fn truncated_record_rejected() {
        let buf = [0x13u8; FRAME_LEN - 1];
        assert_eq!(decode(&buf), Err(FrameError::Truncated(FRAME_LEN - 1)));
    }

    #[test]
    fn trailing_bytes_belong_to_next_record() {
        let mut double = vec![0u8; FRAME_LEN * 2];
        let mut first = [0u8; FRAME_LEN];
        encode(Tag::ClientChat, b"one", &mut first);
        double[..FRAME_LEN].copy_from_slice(&first);
        double[FRAME_LEN] = 0xFF; // garbage that must not affect the first record
        let view = decode(&double).unwrap();
        assert_eq!(view.payload, b"one");
    }

    #[test]
    fn tag_partition() {
        assert!(Tag::ServerAck.is_server());
        assert!(!Tag::ServerAck.is_client());
        assert!(Tag::ClientJoin.is_client());
        assert!(!Tag::ClientJoin.is_server());
    }

    #[test]
    fn join_payload_round_trip() {
        assert_eq!(join_session_id(&join_payload(7)), Some(7));
        assert_eq!(join_session_id(&join_payload(0)), Some(0));
    }

    #[test]
    fn join_payload_rejects_short_and_negative() {
        assert_eq!(join_session_id(&[1, 2, 3]), None);
        assert_eq!(join_session_id(&(-5i32).to_le_bytes()), None);
    }

    #[test]
    fn sanitize_strips_control_bytes() {
        let mut data = *b"a\x01b\x02c";
        let n = sanitize_in_place(&mut data);
        assert_eq!(&data[..n], b"abc");
    }

    #[test]
    fn sanitize_keeps_whitespace_and_high_bit() {
        let mut data = *b"hi\tthere\n\xc3\xa9";
        let n = sanitize_in_place(&mut data);
        assert_eq!(&data[..n], b"hi\tthere\n\xc3\xa9");
    }

    #[test]
    fn sanitize_can_empty_a_payload() {
        let mut data = [0x01u8, 0x02, 0x1F];
        assert_eq!(sanitize_in_place(&mut data), 0);
    }
}
