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

//! Freshness decisions and retention timers.

use std::time::Duration;

use refetch_common::spawn::SpawnHandle;
use tokio::time::Instant;

use crate::{entry::CacheEntry, options::QueryOptions};

/// If the entry data is stale for an observer with the given stale time.
///
/// Entries without data and invalidated entries are always stale. A stale time that overflows the clock, e.g.
/// `Duration::MAX`, means the data never goes stale on its own.
pub fn is_stale<D>(entry: &CacheEntry<D>, stale_time: Duration, now: Instant) -> bool {
    if entry.invalidated || entry.data.is_none() {
        return true;
    }
    match entry.updated_at.and_then(|at| at.checked_add(stale_time)) {
        Some(deadline) => now >= deadline,
        None => entry.updated_at.is_none(),
    }
}

/// If attaching an observer with the given options should start a fetch.
pub fn should_fetch_on_mount<D>(entry: &CacheEntry<D>, options: &QueryOptions, now: Instant) -> bool {
    if !options.enabled {
        return false;
    }
    if entry.data.is_none() {
        return true;
    }
    options.refetch_on_mount && is_stale(entry, options.stale_time, now)
}

/// The retention window of an entry touched by options with the given cache times.
pub fn retention(current: Duration, requested: Duration) -> Duration {
    current.max(requested)
}

/// A pending eviction of an unobserved entry.
///
/// Dropping the timer aborts the eviction task.
#[derive(Debug)]
pub(crate) struct GcTimer {
    pub(crate) token: u64,
    handle: SpawnHandle<()>,
}

impl GcTimer {
    pub(crate) fn new(token: u64, handle: SpawnHandle<()>) -> Self {
        Self { token, handle }
    }
}

impl Drop for GcTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::query_key;

    fn fetched(at: Instant) -> CacheEntry<u64> {
        let mut entry = CacheEntry::new(query_key!["a"]);
        entry.set_data(Arc::new(1), at);
        entry
    }

    #[test]
    fn test_stale_without_data() {
        let entry = CacheEntry::<u64>::new(query_key!["a"]);
        assert!(is_stale(&entry, Duration::MAX, Instant::now()));
    }

    #[test]
    fn test_stale_after_stale_time() {
        let now = Instant::now();
        let entry = fetched(now);

        assert!(is_stale(&entry, Duration::ZERO, now));
        assert!(!is_stale(&entry, Duration::from_secs(10), now + Duration::from_secs(9)));
        assert!(is_stale(&entry, Duration::from_secs(10), now + Duration::from_secs(10)));
        assert!(!is_stale(&entry, Duration::MAX, now + Duration::from_secs(1 << 20)));
    }

    #[test]
    fn test_invalidated_is_stale() {
        let now = Instant::now();
        let mut entry = fetched(now);
        entry.invalidated = true;
        assert!(is_stale(&entry, Duration::MAX, now));
    }

    #[test]
    fn test_fetch_on_mount() {
        let now = Instant::now();
        let empty = CacheEntry::<u64>::new(query_key!["a"]);
        let fresh = fetched(now);

        let options = QueryOptions::default();
        assert!(should_fetch_on_mount(&empty, &options, now));
        assert!(should_fetch_on_mount(&fresh, &options, now));
        assert!(!should_fetch_on_mount(&empty, &options.clone().with_enabled(false), now));
        assert!(!should_fetch_on_mount(&fresh, &options.clone().with_refetch_on_mount(false), now));
        assert!(should_fetch_on_mount(&empty, &options.clone().with_refetch_on_mount(false), now));
        assert!(!should_fetch_on_mount(
            &fresh,
            &options.with_stale_time(Duration::from_secs(60)),
            now
        ));
    }

    #[test]
    fn test_retention_is_max() {
        assert_eq!(
            retention(Duration::from_secs(300), Duration::from_secs(60)),
            Duration::from_secs(300)
        );
        assert_eq!(
            retention(Duration::from_secs(60), Duration::from_secs(300)),
            Duration::from_secs(300)
        );
    }
}
