use std::os::fd::RawFd;

/// Sentinel buffer index meaning "no buffer travels with this operation".
pub const NO_BUFFER: u16 = u16::MAX;

/// Bit set in a WRITE buffer index when it names a send-copy-pool slot
/// rather than a recv-pool slot. Copy slot indices are therefore bounded
/// to 15 bits.
pub const COPY_SLOT_BIT: u16 = 0x8000;

/// Operation tags carried in the submission context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpTag {
    Accept = 1,
    Read = 2,
    Write = 3,
    Close = 4,
}

impl OpTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(OpTag::Accept),
            2 => Some(OpTag::Read),
            3 => Some(OpTag::Write),
            4 => Some(OpTag::Close),
            _ => None,
        }
    }
}

/// Encoded user_data for io_uring CQE identification.
///
/// Layout (64-bit):
/// ```text
/// Bits 31..0:  client descriptor (i32, two's complement)
/// Bits 39..32: OpTag (8 bits)
/// Bits 55..40: buffer index (16 bits)
/// Bits 63..56: zero
/// ```
///
/// This is the little-endian image of the packed
/// `{i32 fd, u8 op, u16 buf_idx}` operation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData(pub u64);

impl UserData {
    const TAG_SHIFT: u64 = 32;
    const BUF_SHIFT: u64 = 40;
    const TAG_MASK: u64 = 0xFF << Self::TAG_SHIFT;
    const BUF_MASK: u64 = 0xFFFF << Self::BUF_SHIFT;
    const FD_MASK: u64 = 0xFFFF_FFFF;

    /// Encode an operation tag, client descriptor, and buffer index.
    #[inline]
    pub fn encode(tag: OpTag, fd: RawFd, buf_idx: u16) -> Self {
        let v = (fd as u32 as u64)
            | ((tag as u64) << Self::TAG_SHIFT)
            | ((buf_idx as u64) << Self::BUF_SHIFT);
        UserData(v)
    }

    /// Decode the operation tag. `None` for anything outside the four
    /// known operations.
    #[inline]
    pub fn tag(self) -> Option<OpTag> {
        let raw = ((self.0 & Self::TAG_MASK) >> Self::TAG_SHIFT) as u8;
        OpTag::from_u8(raw)
    }

    /// Decode the client descriptor.
    #[inline]
    pub fn fd(self) -> RawFd {
        (self.0 & Self::FD_MASK) as u32 as i32
    }

    /// Decode the buffer index.
    #[inline]
    pub fn buffer_index(self) -> u16 {
        ((self.0 & Self::BUF_MASK) >> Self::BUF_SHIFT) as u16
    }

    /// Get the raw u64 value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}
