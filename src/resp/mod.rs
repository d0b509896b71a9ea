//! RESP (Redis Serialization Protocol) codec.
//!
//! The codec is streaming in both directions: the decoder parses pipelines of
//! commands and replies incrementally from a buffered reader, and the encoder
//! buffers writes until an explicit flush. Five type-tagged frames are
//! supported: `+` simple string, `-` error, `:` integer, `$` bulk string and
//! `*` array, with `-1` lengths denoting null bulk strings and null arrays.

pub mod decode;
pub mod encode;
pub mod value;

pub use decode::{ReplyHeader, RespReader};
pub use encode::RespWriter;
pub use value::{FromResp, RespValue};
