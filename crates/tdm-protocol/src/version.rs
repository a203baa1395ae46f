//! Protocol versioning for safe upgrades.
//!
//! Each side advertises the newest version it speaks and the oldest it
//! still accepts. The negotiated version is the newest both sides speak;
//! 0 means the ranges are disjoint and the connection must be dropped.

/// Newest protocol version this broker speaks.
pub const PROTOCOL_VERSION: u16 = 1;

/// Oldest client protocol version this broker still accepts.
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Largest frame payload the broker accepts, advertised in its handshake.
pub const MAX_MESSAGE_SIZE: u32 = 1_048_576;

/// Negotiates a protocol version against a client handshake.
///
/// Returns `min(PROTOCOL_VERSION, client_version)` when the version
/// ranges overlap, and 0 when they are disjoint.
#[must_use]
pub fn negotiate(client_version: u16, client_min_version: u16) -> u16 {
    if client_version < MIN_PROTOCOL_VERSION || PROTOCOL_VERSION < client_min_version {
        return 0;
    }
    client_version.min(PROTOCOL_VERSION)
}
