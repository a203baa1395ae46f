//! TDM Protocol - Wire protocol for the Thymio Device Manager
//!
//! This crate defines the framed binary protocol spoken between the
//! broker and its client applications, over raw TCP and WebSocket:
//!
//! - `message` - the tagged message unions for both directions
//! - `codec` - the length-prefixed frame codec and payload encoding
//! - `version` - protocol version negotiation

pub mod codec;
pub mod message;
pub mod version;

pub use codec::{decode_payload, encode_message, encode_payload, read_frame, write_frame, CodecError};
pub use message::{ClientMessage, ErrorType, Node, ServerMessage, WatchFlags};
pub use version::{negotiate, MAX_MESSAGE_SIZE, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
