use std::collections::BTreeMap;
use std::fmt::{self, Display, Write};
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// The largest byte length of a single path component (namespace, tag, key
/// or value) representable in the binary encoding.
const MAX_COMPONENT_LEN: usize = u16::MAX as usize;

/// Errors returned when constructing, parsing or decoding a [`PathKey`].
#[derive(Debug, Error)]
pub enum PathKeyError {
    /// The textual form contained no path segments.
    #[error("empty path")]
    EmptyPath,

    /// The textual category prefix is not one of `C`, `D`, `I` or `O`, or
    /// the binary discriminant is out of range.
    #[error("bad path category {0:?}")]
    BadCategory(String),

    /// A segment tag was empty.
    #[error("empty path segment")]
    EmptySegment,

    /// A `{k=v,...}` key block could not be parsed.
    #[error("malformed key block {0:?}")]
    MalformedKeyBlock(String),

    /// A component exceeds the length representable in the binary encoding.
    #[error("path component of {len} bytes exceeds the {MAX_COMPONENT_LEN} byte limit")]
    ComponentTooLong {
        /// Length of the offending component in bytes.
        len: usize,
    },

    /// The binary encoding ended mid-field.
    #[error("truncated binpath")]
    Truncated,

    /// The binary encoding decoded cleanly but left unconsumed bytes.
    #[error("{0} trailing bytes after binpath")]
    TrailingBytes(usize),

    /// A component in the binary encoding is not valid UTF-8.
    #[error("binpath component is not valid utf-8")]
    BadUtf8(#[from] std::str::Utf8Error),
}

/// The category of data-model node a [`PathKey`] addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathCategory {
    /// Configuration state.
    Config,
    /// Operational state.
    Data,
    /// RPC input parameters.
    RpcInput,
    /// RPC output parameters.
    RpcOutput,
}

impl PathCategory {
    fn wire_value(self) -> u8 {
        match self {
            Self::Config => 1,
            Self::Data => 2,
            Self::RpcInput => 3,
            Self::RpcOutput => 4,
        }
    }

    fn from_wire(v: u8) -> Result<Self, PathKeyError> {
        match v {
            1 => Ok(Self::Config),
            2 => Ok(Self::Data),
            3 => Ok(Self::RpcInput),
            4 => Ok(Self::RpcOutput),
            _ => Err(PathKeyError::BadCategory(v.to_string())),
        }
    }

    fn prefix_char(self) -> char {
        match self {
            Self::Config => 'C',
            Self::Data => 'D',
            Self::RpcInput => 'I',
            Self::RpcOutput => 'O',
        }
    }
}

/// One element of a hierarchical [`PathKey`]: a `(namespace, tag)` pair with
/// optional list-key values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathSegment {
    ns: String,
    tag: String,
    keys: BTreeMap<String, String>,
}

impl PathSegment {
    /// Create a validated segment. The namespace may be empty; the tag must
    /// not be, and every component must fit the binary encoding.
    pub fn new(
        ns: impl Into<String>,
        tag: impl Into<String>,
        keys: BTreeMap<String, String>,
    ) -> Result<Self, PathKeyError> {
        let ns = ns.into();
        let tag = tag.into();
        if tag.is_empty() {
            return Err(PathKeyError::EmptySegment);
        }
        check_len(&ns)?;
        check_len(&tag)?;
        if keys.len() > MAX_COMPONENT_LEN {
            return Err(PathKeyError::ComponentTooLong { len: keys.len() });
        }
        for (k, v) in &keys {
            check_len(k)?;
            check_len(v)?;
        }
        Ok(Self { ns, tag, keys })
    }

    /// The segment namespace, possibly empty.
    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// The segment tag, never empty.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The list-key values attached to this segment, sorted by key.
    pub fn keys(&self) -> &BTreeMap<String, String> {
        &self.keys
    }
}

fn check_len(s: &str) -> Result<(), PathKeyError> {
    if s.len() > MAX_COMPONENT_LEN {
        return Err(PathKeyError::ComponentTooLong { len: s.len() });
    }
    Ok(())
}

/// An immutable, hierarchically structured identifier for a node in the
/// managed data model.
///
/// Equality and hashing are structural. [`PathKey::encode()`] produces the
/// canonical binary encoding ("binpath") used verbatim as KV key material
/// and as the sharding input; [`PathKey::decode()`] is its inverse.
///
/// A human-readable text form is available through `Display` / `FromStr`:
///
/// ```text
/// C:/interface{name=eth0}/mtu
/// ```
///
/// renders a `Config` key of two segments, the first carrying one list key.
/// Namespaced segments render as `ns:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey {
    category: PathCategory,
    segments: Vec<PathSegment>,
}

impl PathKey {
    /// Construct a key from pre-validated segments.
    pub fn new(category: PathCategory, segments: Vec<PathSegment>) -> Result<Self, PathKeyError> {
        if segments.len() > MAX_COMPONENT_LEN {
            return Err(PathKeyError::ComponentTooLong {
                len: segments.len(),
            });
        }
        Ok(Self { category, segments })
    }

    /// The category of this key.
    pub fn category(&self) -> PathCategory {
        self.category
    }

    /// The ordered path segments.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Produce the canonical binary encoding of this key.
    ///
    /// The encoding is deterministic: equal keys always produce equal bytes,
    /// so the result is usable directly as KV key material and as input to
    /// shard routing.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size_hint());
        buf.put_u8(self.category.wire_value());
        buf.put_u16(self.segments.len() as u16);
        for seg in &self.segments {
            put_component(&mut buf, &seg.ns);
            put_component(&mut buf, &seg.tag);
            buf.put_u16(seg.keys.len() as u16);
            for (k, v) in &seg.keys {
                put_component(&mut buf, k);
                put_component(&mut buf, v);
            }
        }
        buf.freeze()
    }

    /// Decode a binpath produced by [`PathKey::encode()`].
    pub fn decode(mut buf: &[u8]) -> Result<Self, PathKeyError> {
        if buf.remaining() < 3 {
            return Err(PathKeyError::Truncated);
        }
        let category = PathCategory::from_wire(buf.get_u8())?;
        let n_segments = buf.get_u16() as usize;

        let mut segments = Vec::with_capacity(n_segments);
        for _ in 0..n_segments {
            let ns = get_component(&mut buf)?;
            let tag = get_component(&mut buf)?;
            if buf.remaining() < 2 {
                return Err(PathKeyError::Truncated);
            }
            let n_keys = buf.get_u16() as usize;
            let mut keys = BTreeMap::new();
            for _ in 0..n_keys {
                let k = get_component(&mut buf)?;
                let v = get_component(&mut buf)?;
                keys.insert(k, v);
            }
            segments.push(PathSegment::new(ns, tag, keys)?);
        }

        if buf.has_remaining() {
            return Err(PathKeyError::TrailingBytes(buf.remaining()));
        }
        Self::new(category, segments)
    }

    /// Returns true if `self` addresses the subtree containing `other`: same
    /// category, and every segment of `self` (tag, namespace and list keys)
    /// matches the corresponding leading segment of `other`.
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        if self.category != other.category || self.segments.len() > other.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| a == b)
    }

    fn encoded_size_hint(&self) -> usize {
        3 + self
            .segments
            .iter()
            .map(|s| {
                6 + s.ns.len()
                    + s.tag.len()
                    + s.keys
                        .iter()
                        .map(|(k, v)| 4 + k.len() + v.len())
                        .sum::<usize>()
            })
            .sum::<usize>()
    }
}

fn put_component(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_component(buf: &mut &[u8]) -> Result<String, PathKeyError> {
    if buf.remaining() < 2 {
        return Err(PathKeyError::Truncated);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(PathKeyError::Truncated);
    }
    let s = std::str::from_utf8(&buf[..len])?.to_string();
    buf.advance(len);
    Ok(s)
}

impl Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.category.prefix_char())?;
        for seg in &self.segments {
            f.write_char('/')?;
            if !seg.ns.is_empty() {
                write!(f, "{}:", seg.ns)?;
            }
            f.write_str(&seg.tag)?;
            if !seg.keys.is_empty() {
                f.write_char('{')?;
                for (i, (k, v)) in seg.keys.iter().enumerate() {
                    if i > 0 {
                        f.write_char(',')?;
                    }
                    write!(f, "{k}={v}")?;
                }
                f.write_char('}')?;
            }
        }
        Ok(())
    }
}

impl FromStr for PathKey {
    type Err = PathKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, rest) = s
            .split_once(':')
            .ok_or_else(|| PathKeyError::BadCategory(s.to_string()))?;
        let category = match prefix {
            "C" => PathCategory::Config,
            "D" => PathCategory::Data,
            "I" => PathCategory::RpcInput,
            "O" => PathCategory::RpcOutput,
            other => return Err(PathKeyError::BadCategory(other.to_string())),
        };

        let rest = rest
            .strip_prefix('/')
            .ok_or(PathKeyError::EmptyPath)?;
        if rest.is_empty() {
            return Err(PathKeyError::EmptyPath);
        }

        let segments = rest
            .split('/')
            .map(parse_segment)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(category, segments)
    }
}

impl TryFrom<&str> for PathKey {
    type Error = PathKeyError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

fn parse_segment(token: &str) -> Result<PathSegment, PathKeyError> {
    let (head, keys) = match token.split_once('{') {
        Some((head, block)) => {
            let block = block
                .strip_suffix('}')
                .ok_or_else(|| PathKeyError::MalformedKeyBlock(token.to_string()))?;
            let mut keys = BTreeMap::new();
            for pair in block.split(',') {
                let (k, v) = pair
                    .split_once('=')
                    .ok_or_else(|| PathKeyError::MalformedKeyBlock(token.to_string()))?;
                if k.is_empty() {
                    return Err(PathKeyError::MalformedKeyBlock(token.to_string()));
                }
                keys.insert(k.to_string(), v.to_string());
            }
            (head, keys)
        }
        None => (token, BTreeMap::new()),
    };

    let (ns, tag) = match head.split_once(':') {
        Some((ns, tag)) => (ns, tag),
        None => ("", head),
    };
    PathSegment::new(ns, tag, keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn key(s: &str) -> PathKey {
        s.parse().expect("test key must parse")
    }

    #[test]
    fn parse_and_display_round_trip() {
        for s in [
            "C:/interface{name=eth0}/mtu",
            "D:/system/stats",
            "I:/rpc:restart{node=n1,wave=2}",
            "O:/result",
            "C:/a/b{k=1}",
        ] {
            assert_eq!(key(s).to_string(), s);
        }
    }

    #[test]
    fn parse_errors() {
        assert_matches!(
            PathKey::from_str("X:/a"),
            Err(PathKeyError::BadCategory(_))
        );
        assert_matches!(PathKey::from_str("C:"), Err(PathKeyError::EmptyPath));
        assert_matches!(PathKey::from_str("C:/"), Err(PathKeyError::EmptyPath));
        assert_matches!(
            PathKey::from_str("C:/a//b"),
            Err(PathKeyError::EmptySegment)
        );
        assert_matches!(
            PathKey::from_str("C:/a{k1}"),
            Err(PathKeyError::MalformedKeyBlock(_))
        );
        assert_matches!(
            PathKey::from_str("C:/a{k=1"),
            Err(PathKeyError::MalformedKeyBlock(_))
        );
    }

    #[test]
    fn encode_decode_round_trip() {
        for s in [
            "C:/interface{name=eth0}/mtu",
            "D:/system/stats",
            "I:/rpc:restart{node=n1,wave=2}",
        ] {
            let k = key(s);
            let bin = k.encode();
            assert_eq!(PathKey::decode(&bin).unwrap(), k);
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        // Same structural key, built through different routes, must encode
        // identically - the binpath is used as KV key material.
        let a = key("C:/a{x=1,y=2}");
        let b = PathKey::new(
            PathCategory::Config,
            vec![PathSegment::new(
                "",
                "a",
                [("y", "2"), ("x", "1")]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
            .unwrap()],
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn decode_rejects_truncation_and_trailing_bytes() {
        let bin = key("C:/a/b").encode();
        assert_matches!(
            PathKey::decode(&bin[..bin.len() - 1]),
            Err(PathKeyError::Truncated)
        );

        let mut extended = bin.to_vec();
        extended.push(0);
        assert_matches!(
            PathKey::decode(&extended),
            Err(PathKeyError::TrailingBytes(1))
        );

        assert_matches!(
            PathKey::decode(&[9, 0, 0]),
            Err(PathKeyError::BadCategory(_))
        );
    }

    #[test]
    fn prefix_matching() {
        let root = key("C:/a");
        let keyed = key("C:/a{k=1}");
        let deep = key("C:/a{k=1}/b/c");

        assert!(root.is_prefix_of(&key("C:/a/b")));
        assert!(root.is_prefix_of(&root));
        assert!(keyed.is_prefix_of(&deep));
        assert!(!deep.is_prefix_of(&keyed));

        // List keys on present segments must match exactly.
        assert!(!keyed.is_prefix_of(&key("C:/a{k=2}/b")));
        assert!(!root.is_prefix_of(&keyed));

        // Category mismatch never matches.
        assert!(!root.is_prefix_of(&key("D:/a/b")));
    }

    #[test]
    fn empty_tag_rejected() {
        assert_matches!(
            PathSegment::new("ns", "", BTreeMap::new()),
            Err(PathKeyError::EmptySegment)
        );
    }
}
