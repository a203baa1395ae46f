//! Node identity, status and capabilities.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

// ============================================================================
// Node Identity
// ============================================================================

/// Unique identifier for a node instance.
///
/// 128 bits, globally unique per node instance. On the wire this is the
/// raw 16-byte blob with the first three UUID fields in big-endian order,
/// so it round-trips with the textual UUID representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generates a fresh random node id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds a node id from the 16-byte wire blob.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the 16-byte wire blob.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns a shortened display form (first 8 hex digits).
    #[must_use]
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NodeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// The id must always travel as a 16-byte string, independent of how the
// serializer buffers nested content, so the serde impls are explicit
// rather than derived through `Uuid`.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0.as_bytes())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeIdVisitor;

        impl<'de> Visitor<'de> for NodeIdVisitor {
            type Value = NodeId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 16-byte node id")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<NodeId, E> {
                let bytes: [u8; 16] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(NodeId::from_bytes(bytes))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<NodeId, E> {
                self.visit_bytes(&v)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<NodeId, A::Error> {
                let mut bytes = [0u8; 16];
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                if seq.next_element::<u8>()?.is_some() {
                    return Err(de::Error::invalid_length(17, &self));
                }
                Ok(NodeId::from_bytes(bytes))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<NodeId, E> {
                Uuid::parse_str(v)
                    .map(NodeId::from)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_bytes(NodeIdVisitor)
    }
}

// ============================================================================
// Status and Type
// ============================================================================

/// Connection and lock status of a node, as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// The backend is still establishing the device link.
    Connected,
    /// The node can be locked and used.
    Available,
    /// The node is locked by some other endpoint.
    Busy,
    /// The node is locked by the receiving endpoint.
    Ready,
    /// The node is gone. Terminal: the registry removes the node after
    /// emitting this status.
    Disconnected,
}

impl NodeStatus {
    /// A disconnected node never comes back under the same id.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connected => "connected",
            Self::Available => "available",
            Self::Busy => "busy",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

/// Hardware flavor of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Thymio2,
    Thymio3,
    SimulatedThymio2,
    DummyNode,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Thymio2 => "thymio2",
            Self::Thymio3 => "thymio3",
            Self::SimulatedThymio2 => "simulated-thymio2",
            Self::DummyNode => "dummy",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Per-endpoint capability mask for a node.
///
/// Capabilities are only granted to endpoints on the local machine; a
/// remote client always sees an empty mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(u32);

impl Capabilities {
    /// The endpoint may force-stop the node without holding its lock.
    pub const FORCE_RESET_AND_STOP: u32 = 0x1;
    /// The endpoint may rename the node.
    pub const RENAME: u32 = 0x2;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    #[must_use]
    pub const fn with(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }
}

// ============================================================================
// Node View
// ============================================================================

/// Registry-side snapshot of a node's identity fields.
///
/// This is what the registry hands to observers; the endpoint translates
/// it to the wire representation (masking `Busy` for the lock holder and
/// computing the capability mask for its locality).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
    pub id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    /// Whether the backend allows renaming this node. Feeds the `RENAME`
    /// capability for local endpoints.
    pub renamable: bool,
}
