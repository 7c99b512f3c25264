//! Framed binary codec for the live-room chat protocol.
//!
//! The wire format is a 16-byte big-endian header followed by a payload:
//!
//! ```text
//! u32 total_len | u16 header_len (= 16) | u16 protocol | u32 operation | u32 version (= 1)
//! ```
//!
//! Payload interpretation depends on `protocol`:
//!
//! - [`proto::JSON`]: UTF-8 JSON document
//! - [`proto::INT`]: 4-byte big-endian integer
//! - [`proto::COMPRESSED`]: zlib-compressed *outer frames*, which a
//!   decoder splices back onto the front of its input buffer
//!
//! [`FrameBuffer`] implements the streaming decode side, including the
//! compressed splice-back; [`encode`] builds outgoing frames.

pub mod error;
pub mod frame;

pub use error::{FrameError, Result};
pub use frame::{Frame, FrameBuffer, HEADER_LEN, VERSION, encode, op, proto};
