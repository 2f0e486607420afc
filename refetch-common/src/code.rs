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

use std::fmt::Debug;

/// Data that can be held by the query cache.
///
/// The cache never clones or serializes the data it holds. Data is shared behind an [`std::sync::Arc`] between the
/// cache entry and all of its observers, so there is no `Clone` requirement.
pub trait Value: Send + Sync + Debug + 'static {}
impl<T> Value for T where T: Send + Sync + Debug + 'static {}
