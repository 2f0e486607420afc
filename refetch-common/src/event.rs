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

/// Reason for a cache entry to leave the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The entry has had no subscriber for longer than its retention window.
    Evict,
    /// The entry is removed explicitly.
    Remove,
    /// The store is cleared.
    Clear,
}

/// Trait for the customized event listener.
pub trait EventListener: Send + Sync + 'static {
    /// Associated key type.
    type Key;

    /// Called when a cache entry leaves the store with the reason.
    ///
    /// The listener is called out of the store critical section, after the entry has been dropped from the store.
    #[expect(unused_variables)]
    fn on_leave(&self, reason: Event, key: &Self::Key) {}
}
