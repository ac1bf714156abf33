//! PostgreSQL v3 wire protocol: body codec, message catalogue and the stream decoder.
pub mod codec;
pub mod decoder;
pub mod messages;

pub use codec::{CodecError, Validation, WireType};
pub use decoder::{DecodeResult, Decoder, DecoderCallbacks, DecoderState, Outbound};
pub use messages::*;
