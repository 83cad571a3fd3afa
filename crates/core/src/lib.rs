//! Core types for ember
//!
//! This crate defines the foundational pieces shared by every other crate in
//! the workspace:
//! - `ByteString`: immutable byte buffer with a cached 32-bit content hash
//! - `DynStr`: growable byte buffer with the string pre-allocation policy
//! - `resp`: wire framing for commands and replies (client protocol,
//!   replication stream, and command log all share it)
//! - `Crc64`: streaming checksum for the snapshot file footer
//! - `FrameError`: framing error hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bytes;
pub mod crc64;
pub mod dynstr;
pub mod error;
pub mod resp;

pub use bytes::{intern_command, ByteString};
pub use crc64::{crc64, Crc64};
pub use dynstr::DynStr;
pub use error::{FrameError, FrameResult};
pub use resp::{
    decode_command, encode_command, encode_reply, Reply, MAX_ARRAY_LEN, MAX_BULK_LEN,
};
