//! Length-prefixed framing for the worker channel.
//!
//! Every message on the wire is framed as:
//! - A 4-byte little-endian payload length
//! - Exactly that many bytes of UTF-8 payload
//!
//! Inbound bytes are reassembled by a bounded [`RecvBuffer`]; callers only
//! ever see complete payloads.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, FrameConfig, HEADER_SIZE, MESSAGE_MAX_LEN, PAYLOAD_MAX_LEN,
    RECV_BUFFER_MAX_LEN,
};
pub use error::{FrameError, Result};
pub use reader::{FrameReader, RecvBuffer};
pub use writer::FrameWriter;
