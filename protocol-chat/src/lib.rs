//! Wire framing for the chatring relay.
//!
//! Every message on the wire is exactly [`FRAME_LEN`] (515) bytes:
//!
//! ```text
//! +--------+----------------+--------------------+
//! | tag    | length         | data               |
//! | (1 B)  | (2 B, LE)      | (512 B, fixed)     |
//! +--------+----------------+--------------------+
//! ```
//!
//! The declared length names how many of the 512 data bytes are
//! significant; the remainder is padding and is always transmitted.
//! Tags are partitioned into a server range (0x01–0x04) and a client
//! range (0x11–0x14); everything else is malformed.

mod frame;

pub use frame::{
    FRAME_LEN, FrameError, FrameView, HEADER_LEN, MAX_PAYLOAD, Tag, decode, encode,
    join_payload, join_session_id, sanitize_in_place,
};
