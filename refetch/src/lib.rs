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

//! refetch - async query cache for Rust.
//!
//! Declare a cache key, a fetch function and options, and get a reactive handle on the cached data. refetch
//! deduplicates concurrent fetches, serves stale data while revalidating in the background, retries failures with
//! exponential backoff and evicts entries nobody observes.

pub use refetch_common as common;
pub use refetch_query as query;

/// Common re-exports.
pub mod prelude;

pub use prelude::*;
