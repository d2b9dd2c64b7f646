//! Switchboard wire protocol.
//!
//! Everything a peer needs to speak to a Switchboard server, with no I/O
//! policy of its own:
//!
//! - [`Buffer`]: growable byte container with read/write cursors and a cheap
//!   prepend region, filled from any [`std::io::Read`] with one vectored read
//! - [`FrameCodec`]: 4-byte big-endian length prefix + body framing
//! - [`Message`]: the JSON envelope carried in each frame body
//!
//! # Wire format
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │ length: i32 (BE, 4B) │ body: `length` bytes of JSON │
//! └──────────────────────┴──────────────────────────────┘
//! ```
//!
//! A negative length or one above [`MAX_FRAME_SIZE`] is a protocol violation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod errors;
pub mod frame;
pub mod message;

pub use buffer::Buffer;
pub use errors::{ProtocolError, Result};
pub use frame::{FrameCodec, HEADER_SIZE, MAX_FRAME_SIZE};
pub use message::{Message, MessageKind, UserId};
