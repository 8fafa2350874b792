//! A call-recording [`ShardDirectory`] for tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use keybus_types::ShardDbInfo;
use parking_lot::Mutex;

use crate::{DirectoryError, ShardDirectory};

/// One recorded [`MockDirectory::resolve`] invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDirectoryCall {
    /// The binpath presented for resolution.
    pub binpath: Bytes,
    /// The salt presented for resolution.
    pub salt: Bytes,
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<MockDirectoryCall>,
    resolve_return: VecDeque<Result<Vec<ShardDbInfo>, DirectoryError>>,
}

/// A mock [`ShardDirectory`] recording every call and returning queued
/// results in order.
#[derive(Debug, Default)]
pub struct MockDirectory(Mutex<Inner>);

impl MockDirectory {
    /// Return the values specified in `ret` in sequence for calls to
    /// `resolve`, starting from the front.
    pub fn with_resolve_return(
        self,
        ret: impl Into<VecDeque<Result<Vec<ShardDbInfo>, DirectoryError>>>,
    ) -> Self {
        self.0.lock().resolve_return = ret.into();
        self
    }

    /// All calls recorded so far.
    pub fn calls(&self) -> Vec<MockDirectoryCall> {
        self.0.lock().calls.clone()
    }
}

#[async_trait]
impl ShardDirectory for MockDirectory {
    async fn resolve(
        &self,
        binpath: &[u8],
        salt: &[u8],
    ) -> Result<Vec<ShardDbInfo>, DirectoryError> {
        let mut guard = self.0.lock();
        guard.calls.push(MockDirectoryCall {
            binpath: Bytes::copy_from_slice(binpath),
            salt: Bytes::copy_from_slice(salt),
        });
        guard
            .resolve_return
            .pop_front()
            .expect("no mock directory value to return")
    }
}
