use std::fmt::Display;

use uuid::Uuid;

/// The logical KV database a shard chunk maps onto.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Hash)]
pub struct DbNumber(u32);

impl DbNumber {
    /// Wrap a raw database number.
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    /// The raw database number.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Display for DbNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A partition of the keyspace, as assigned by the shard directory.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Hash)]
pub struct ShardChunkId(u32);

impl ShardChunkId {
    /// Wrap a raw shard chunk ID.
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    /// The raw shard chunk ID.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Display for ShardChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A shard-directory routing entry: which shard chunk a key belongs to, and
/// which KV database that chunk is stored in.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ShardDbInfo {
    /// The shard chunk the key hashes into.
    pub chunk: ShardChunkId,
    /// The KV database backing that chunk.
    pub db: DbNumber,
}

impl Display for ShardDbInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chunk={}/db={}", self.chunk, self.db)
    }
}

/// An opaque completion token minted by the KV engine for a staged write,
/// required to commit it.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Hash)]
pub struct SerialNumber(i64);

impl SerialNumber {
    /// Wrap a raw engine serial number.
    pub const fn new(v: i64) -> Self {
        Self(v)
    }

    /// The raw serial number.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The bus-wide identity of one transaction.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Mint a fresh random transaction identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The member-local identity of one subtree registration.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Hash)]
pub struct RegistrationId(u64);

impl RegistrationId {
    /// Wrap a raw registration ID.
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// The raw registration ID.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The member-local identity of one in-flight data object, used to correlate
/// asynchronous KV completions back to the object that issued the operation.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Hash)]
pub struct DataObjectId(u64);

impl DataObjectId {
    /// Wrap a raw data object ID.
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// The raw data object ID.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for DataObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
