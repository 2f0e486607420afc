// Copyright 2026 refetch Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use refetch_common::error::Error;
use tokio::time::Instant;

use crate::key::QueryKey;

/// Data status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Never fetched.
    #[default]
    Idle,
    /// A fetch is in progress and no fetch has settled since it started.
    Loading,
    /// The last fetch succeeded.
    Success,
    /// The last fetch failed after all attempts.
    Error,
}

/// Fetch status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
    /// No fetch in flight.
    #[default]
    Idle,
    /// A fetch is in flight.
    Fetching,
}

/// The state of a single cache entry.
///
/// Entries are owned by the store. Observers receive immutable snapshots.
#[derive(Debug)]
pub struct CacheEntry<D> {
    pub(crate) key: QueryKey,
    pub(crate) data: Option<Arc<D>>,
    pub(crate) status: Status,
    pub(crate) error: Option<Error>,
    pub(crate) fetch_status: FetchStatus,
    pub(crate) updated_at: Option<Instant>,
    pub(crate) error_updated_at: Option<Instant>,
    pub(crate) failure_count: u32,
    pub(crate) failure_reason: Option<Error>,
    pub(crate) subscriber_count: usize,
    pub(crate) gc_scheduled: bool,
    pub(crate) invalidated: bool,
    pub(crate) version: u64,
}

impl<D> Clone for CacheEntry<D> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            fetch_status: self.fetch_status,
            updated_at: self.updated_at,
            error_updated_at: self.error_updated_at,
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            subscriber_count: self.subscriber_count,
            gc_scheduled: self.gc_scheduled,
            invalidated: self.invalidated,
            version: self.version,
        }
    }
}

impl<D> CacheEntry<D> {
    /// Create an idle entry without data or subscribers.
    pub fn new(key: QueryKey) -> Self {
        Self {
            key,
            data: None,
            status: Status::Idle,
            error: None,
            fetch_status: FetchStatus::Idle,
            updated_at: None,
            error_updated_at: None,
            failure_count: 0,
            failure_reason: None,
            subscriber_count: 0,
            gc_scheduled: false,
            invalidated: false,
            version: 0,
        }
    }

    /// The key of the entry.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The last successfully fetched data.
    pub fn data(&self) -> Option<&Arc<D>> {
        self.data.as_ref()
    }

    /// The data status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The error of the last fetch. Present iff the status is [`Status::Error`].
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// The fetch status.
    pub fn fetch_status(&self) -> FetchStatus {
        self.fetch_status
    }

    /// When data was last set. `None` if it never was.
    pub fn updated_at(&self) -> Option<Instant> {
        self.updated_at
    }

    /// When the last terminal fetch failure happened.
    pub fn error_updated_at(&self) -> Option<Instant> {
        self.error_updated_at
    }

    /// Count of failed attempts of the current or last fetch. Reset on success.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// The error of the last failed attempt.
    pub fn failure_reason(&self) -> Option<&Error> {
        self.failure_reason.as_ref()
    }

    /// Count of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    /// If a retention timer is pending. Set iff the entry has no subscriber.
    pub fn is_gc_scheduled(&self) -> bool {
        self.gc_scheduled
    }

    /// If the entry has been invalidated since its last successful fetch.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Monotonic counter bumped on every published change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// If a fetch is in flight.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// Set data as if fetched successfully at `now`. Clears the error and the invalidation mark.
    pub fn set_data(&mut self, data: Arc<D>, now: Instant) {
        self.data = Some(data);
        self.status = Status::Success;
        self.error = None;
        self.updated_at = Some(now);
        self.failure_count = 0;
        self.failure_reason = None;
        self.invalidated = false;
    }

    /// Fail the entry at `now`, keeping its data.
    pub fn set_error(&mut self, error: Error, now: Instant) {
        self.status = Status::Error;
        self.error_updated_at = Some(now);
        self.failure_reason = Some(error.clone());
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use refetch_common::error::ErrorKind;

    use super::*;
    use crate::query_key;

    #[test]
    fn test_new_entry() {
        let entry = CacheEntry::<u64>::new(query_key!["a"]);
        assert_eq!(entry.status(), Status::Idle);
        assert_eq!(entry.fetch_status(), FetchStatus::Idle);
        assert!(entry.data().is_none());
        assert!(entry.updated_at().is_none());
        assert_eq!(entry.subscriber_count(), 0);
    }

    #[test]
    fn test_error_keeps_data() {
        let mut entry = CacheEntry::<u64>::new(query_key!["a"]);
        let now = Instant::now();
        entry.set_data(Arc::new(1), now);
        entry.set_error(Error::new(ErrorKind::Network, "down"), now);
        assert_eq!(entry.status(), Status::Error);
        assert_eq!(entry.data().map(|d| **d), Some(1));
        assert_eq!(entry.error().map(|e| e.kind()), Some(ErrorKind::Network));

        entry.set_data(Arc::new(2), now);
        assert_eq!(entry.status(), Status::Success);
        assert!(entry.error().is_none());
        assert!(entry.failure_reason().is_none());
    }
}
