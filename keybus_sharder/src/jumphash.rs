use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use keybus_types::ShardDbInfo;
use siphasher::sip::SipHasher13;

use crate::{DirectoryError, ShardDirectory};

/// An in-process [`ShardDirectory`] that consistently maps a salted binpath
/// to one of a fixed set of shard assignments.
///
/// Different instances constructed with the same shard set (in the same
/// order) always map the same input to the same [`ShardDbInfo`].
///
/// For `N` shards this type uses `O(N)` memory and `O(ln N)` lookup,
/// utilising Google's [jump hash] internally. Adding 1 additional shard
/// causes approximately `1/N` keys to be remapped.
///
/// [jump hash]: https://arxiv.org/ftp/arxiv/papers/1406/1406.2294.pdf
#[derive(Debug)]
pub struct JumpHashDirectory {
    hasher: SipHasher13,
    shards: Vec<ShardDbInfo>,
}

impl JumpHashDirectory {
    /// Initialise a directory that consistently maps keys to one of
    /// `shards`.
    ///
    /// # Correctness
    ///
    /// Changing the number of, or order of, the elements in `shards` when
    /// constructing two instances changes the mapping produced.
    ///
    /// # Panics
    ///
    /// This constructor panics if the number of elements in `shards` is 0.
    pub fn new(shards: impl IntoIterator<Item = ShardDbInfo>) -> Self {
        // A randomly generated static siphash key to ensure all member
        // instances hash the same input to the same u64 routing key.
        //
        // Generated with: xxd -i -l 16 /dev/urandom
        let key = [
            0x36, 0x9a, 0x21, 0x4f, 0x70, 0x5e, 0xd3, 0x18, 0xc2, 0x44, 0x8b, 0x0d, 0xe1, 0x57,
            0x9f, 0x6a,
        ];

        let shards = shards.into_iter().collect::<Vec<_>>();
        assert!(!shards.is_empty(), "empty shard set given to directory");

        Self {
            hasher: SipHasher13::new_with_key(&key),
            shards,
        }
    }

    /// Return a slice of all the shard assignments this instance is
    /// configured with.
    pub fn shards(&self) -> &[ShardDbInfo] {
        &self.shards
    }

    /// Consistently hash a salted binpath to one of the configured shards.
    pub fn shard_for(&self, binpath: &[u8], salt: &[u8]) -> ShardDbInfo {
        // The derived hash impl for RouteKey is hardened against prefix
        // collisions when combining the two fields.
        let mut state = self.hasher;
        RouteKey { salt, binpath }.hash(&mut state);
        let mut key = state.finish();

        let mut b = -1;
        let mut j = 0;
        while j < self.shards.len() as i64 {
            b = j;
            key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
            j = ((b.wrapping_add(1) as f64) * (((1u64 << 31) as f64) / (((key >> 33) + 1) as f64)))
                as i64
        }

        assert!(b >= 0);
        *self
            .shards
            .get(b as usize)
            .expect("jump hash mapped input to non-existent bucket")
    }
}

#[derive(Hash)]
struct RouteKey<'a> {
    salt: &'a [u8],
    binpath: &'a [u8],
}

#[async_trait]
impl ShardDirectory for JumpHashDirectory {
    async fn resolve(
        &self,
        binpath: &[u8],
        salt: &[u8],
    ) -> Result<Vec<ShardDbInfo>, DirectoryError> {
        Ok(vec![self.shard_for(binpath, salt)])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use keybus_types::{DbNumber, PathKey, ShardChunkId};

    use super::*;

    fn shard(i: u32) -> ShardDbInfo {
        ShardDbInfo {
            chunk: ShardChunkId::new(i),
            db: DbNumber::new(i % 4),
        }
    }

    #[test]
    #[should_panic = "empty shard set given to directory"]
    fn empty_shard_set_panics() {
        JumpHashDirectory::new([]);
    }

    #[test]
    fn consistent_mapping_across_instances() {
        let a = JumpHashDirectory::new((0..10).map(shard));
        let b = JumpHashDirectory::new((0..10).map(shard));

        let binpath = "C:/a/b{k=1}".parse::<PathKey>().unwrap().encode();
        let got = a.shard_for(&binpath, b"salt");
        assert_eq!(got, b.shard_for(&binpath, b"salt"));
        // Stable over repeated lookups.
        assert_eq!(got, a.shard_for(&binpath, b"salt"));
    }

    #[test]
    fn salt_perturbs_the_mapping() {
        let dir = JumpHashDirectory::new((0..1000).map(shard));
        let binpath = "C:/a/b".parse::<PathKey>().unwrap().encode();

        // With 1000 buckets, two different salts landing in the same bucket
        // for all of 50 keys would indicate salting is a no-op.
        let mut diverged = false;
        for i in 0..50 {
            let key = format!("C:/a/b{{k={i}}}")
                .parse::<PathKey>()
                .unwrap()
                .encode();
            if dir.shard_for(&key, b"salt-a") != dir.shard_for(&key, b"salt-b") {
                diverged = true;
                break;
            }
        }
        assert!(diverged, "salt had no effect on routing for {binpath:?}");
    }

    #[test]
    fn distribution_is_spread() {
        let dir = JumpHashDirectory::new((0..10).map(shard));

        let mut counts: HashMap<ShardChunkId, usize> = HashMap::new();
        for i in 0..1000 {
            let key = format!("D:/table{{row={i}}}")
                .parse::<PathKey>()
                .unwrap()
                .encode();
            *counts.entry(dir.shard_for(&key, b"salt").chunk).or_default() += 1;
        }

        // Every bucket should see a reasonable share of 1000 keys.
        assert_eq!(counts.len(), 10);
        for (chunk, n) in counts {
            assert!(n > 50, "chunk {chunk} starved with {n} keys");
        }
    }

    // Assignments must be a pure function of (shard set, salt, binpath):
    // persisted data becomes unreachable if they drift between instances or
    // process restarts.
    #[test]
    fn assignments_stable_across_instances() {
        let a = JumpHashDirectory::new((0..16).map(shard));
        let b = JumpHashDirectory::new((0..16).map(shard));

        for s in [
            "C:/a/b{k=1}",
            "C:/interface{name=eth0}/mtu",
            "D:/system/stats",
            "I:/rpc:restart{node=n1}",
        ] {
            let binpath = s.parse::<PathKey>().unwrap().encode();
            assert_eq!(
                a.shard_for(&binpath, b"fixture-salt"),
                b.shard_for(&binpath, b"fixture-salt"),
                "assignment drifted for {s}"
            );
        }
    }

    #[tokio::test]
    async fn directory_resolve_returns_single_entry() {
        let dir = JumpHashDirectory::new((0..10).map(shard));
        let binpath = "C:/a".parse::<PathKey>().unwrap().encode();

        let got = dir.resolve(&binpath, b"salt").await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], dir.shard_for(&binpath, b"salt"));
    }
}
