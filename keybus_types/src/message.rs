use std::fmt::Debug;

use bytes::Bytes;

/// The payload contract between a registration and the KV layer.
///
/// The member stack never interprets payload contents - it only needs a
/// stable byte representation to persist. Application codecs implement this
/// trait outside this workspace.
pub trait Message: Debug + Send + Sync {
    /// Produce the serialized representation of this message.
    fn serialize(&self) -> Bytes;
}

/// A trivial [`Message`] carrying an opaque byte blob, also used as the test
/// payload type throughout the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMessage(pub Bytes);

impl BlobMessage {
    /// Reconstruct a blob message from its serialized form.
    pub fn deserialize(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl Message for BlobMessage {
    fn serialize(&self) -> Bytes {
        self.0.clone()
    }
}
