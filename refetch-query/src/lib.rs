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

//! The query cache engine of refetch.
//!
//! Callers declare a cache key, a fetch function and options, and get a reactive handle on the cached entry. The
//! engine deduplicates concurrent fetches, serves stale data while revalidating, retries failed fetches with backoff
//! and evicts entries nobody observes.

mod client;
/// Cache entry state.
pub mod entry;
/// Fetch execution: deduplication, retry and settlement.
pub mod executor;
mod inflight;
/// Paged entries.
pub mod infinite;
/// Cache keys.
pub mod key;
/// Side-effecting operations.
pub mod mutation;
/// Reactive handles on cache entries.
pub mod observer;
/// Query and mutation options.
pub mod options;
pub mod policy;
/// The cache store.
pub mod store;

pub use crate::{
    client::{QueryClient, QueryClientBuilder},
    entry::{CacheEntry, FetchStatus, Status},
    executor::{fetcher, FetchHandle, FetchMode, FetchOptions, Fetcher},
    infinite::{
        page_fn, InfiniteQueryObserver, InfiniteQueryOptions, NextParamFn, Page, PageFn, PageParam, Pages,
    },
    key::{KeyFilter, QueryKey, Segment},
    mutation::{mutation_fn, Invalidate, Mutation, MutationFn, MutationState},
    observer::{query_fn, FetcherFactory, QueryObserver, QueryResult},
    options::{MutationOptions, QueryOptions, Retry, RetryDelay},
    store::{Refetcher, Store, StoreConfig, SubscriberInfo, SubscriptionId},
};
