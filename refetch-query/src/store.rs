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

use std::{borrow::Cow, fmt::Debug, sync::Arc, time::Duration};

use hashbrown::HashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use refetch_common::{
    code::Value,
    event::{Event, EventListener},
    metrics::Metrics,
    spawn::Spawner,
};
use tokio::{sync::watch, time::Instant};

use crate::{
    entry::CacheEntry,
    executor::{FetchMode, FetchOptions, Fetcher},
    inflight::InflightMap,
    key::{KeyFilter, QueryKey},
    options::QueryOptions,
    policy::{self, GcTimer},
};

/// Identifies one subscription of a store entry.
pub type SubscriptionId = u64;

/// What the store needs to know about a subscriber to make refetch decisions on its behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberInfo {
    /// Stale time of the subscriber.
    pub stale_time: Duration,
    /// If the subscriber refetches stale data on window focus.
    pub refetch_on_window_focus: bool,
    /// If the subscriber allows automatic fetches.
    pub enabled: bool,
}

impl From<&QueryOptions> for SubscriberInfo {
    fn from(options: &QueryOptions) -> Self {
        Self {
            stale_time: options.stale_time,
            refetch_on_window_focus: options.refetch_on_window_focus,
            enabled: options.enabled,
        }
    }
}

/// The fetch function and options registered for an entry, used to refetch it without a caller at hand
/// (invalidation, window focus).
pub struct Refetcher<D> {
    /// Fetch function.
    pub fetcher: Fetcher<D>,
    /// Fetch options.
    pub options: FetchOptions,
}

impl<D> Clone for Refetcher<D> {
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            options: self.options.clone(),
        }
    }
}

impl<D> Debug for Refetcher<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refetcher").field("options", &self.options).finish()
    }
}

pub(crate) struct Slot<D> {
    /// Distinguishes this entry from earlier entries of the same key that have left the store.
    pub(crate) epoch: u64,
    /// Holds the entry state. Every change is published through it under the store lock.
    pub(crate) tx: watch::Sender<CacheEntry<D>>,
    pub(crate) subscribers: HashMap<SubscriptionId, SubscriberInfo>,
    pub(crate) cache_time: Duration,
    pub(crate) gc: Option<GcTimer>,
    pub(crate) gc_seq: u64,
    pub(crate) refetcher: Option<Refetcher<D>>,
}

impl<D> Slot<D> {
    fn new(key: QueryKey, epoch: u64, cache_time: Duration) -> Self {
        let (tx, _) = watch::channel(CacheEntry::new(key));
        Self {
            epoch,
            tx,
            subscribers: HashMap::new(),
            cache_time,
            gc: None,
            gc_seq: 0,
            refetcher: None,
        }
    }

    pub(crate) fn publish(&self, f: impl FnOnce(&mut CacheEntry<D>)) {
        self.tx.send_modify(|entry| {
            f(entry);
            entry.version += 1;
        });
    }

    fn is_active(&self) -> bool {
        self.subscribers.values().any(|s| s.enabled)
    }
}

pub(crate) struct State<D> {
    pub(crate) slots: HashMap<QueryKey, Slot<D>>,
    pub(crate) inflights: InflightMap<D>,
    next_epoch: u64,
    next_subscription: u64,
}

impl<D> Default for State<D> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            inflights: InflightMap::default(),
            next_epoch: 0,
            next_subscription: 0,
        }
    }
}

/// Configuration of a [`Store`].
pub struct StoreConfig {
    /// Name of the store, used as the metrics label.
    pub name: Cow<'static, str>,
    /// Retention window for entries created without query options.
    pub default_cache_time: Duration,
    /// Shared metrics.
    pub metrics: Arc<Metrics>,
    /// Listener called when entries leave the store.
    pub event_listener: Option<Arc<dyn EventListener<Key = QueryKey>>>,
    /// Spawner of fetches and retention timers.
    pub spawner: Spawner,
}

pub(crate) struct StoreInner<D> {
    pub(crate) name: Cow<'static, str>,
    pub(crate) state: Mutex<State<D>>,
    default_cache_time: Duration,
    pub(crate) metrics: Arc<Metrics>,
    event_listener: Option<Arc<dyn EventListener<Key = QueryKey>>>,
    pub(crate) spawner: Spawner,
}

/// The cache store: one entry per key.
///
/// All entry mutations and subscriber count changes happen in one critical section per operation, and are
/// published to every subscriber through the entry's watch channel inside that critical section. Nobody can observe
/// a half-applied change.
///
/// Entries without subscribers are evicted after their retention window. Retention timers only hold a weak reference
/// to the store, dropping the last store handle drops all pending timers.
pub struct Store<D> {
    pub(crate) inner: Arc<StoreInner<D>>,
}

impl<D> Clone for Store<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D> Debug for Store<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("name", &self.inner.name).finish()
    }
}

impl<D> Store<D>
where
    D: Value,
{
    /// Create an empty store.
    pub fn new(config: StoreConfig) -> Self {
        let inner = StoreInner {
            name: config.name,
            state: Mutex::new(State::default()),
            default_cache_time: config.default_cache_time,
            metrics: config.metrics,
            event_listener: config.event_listener,
            spawner: config.spawner,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Name of the store.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawner of the store.
    pub fn spawner(&self) -> &Spawner {
        &self.inner.spawner
    }

    /// Snapshot of the entry of `key`. No side effects.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry<D>> {
        self.inner.state.lock().slots.get(key).map(|slot| slot.tx.borrow().clone())
    }

    /// A receiver of the changes of the entry of `key`.
    ///
    /// The receiver does not count as a subscriber. It is closed when the entry leaves the store.
    pub fn watch(&self, key: &QueryKey) -> Option<watch::Receiver<CacheEntry<D>>> {
        self.inner.state.lock().slots.get(key).map(|slot| slot.tx.subscribe())
    }

    /// Atomically apply `f` to the entry of `key`, creating an idle entry if absent. Returns the updated entry.
    ///
    /// A created entry has no subscriber, so its retention timer starts right away.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "refetch::query::store::upsert"))]
    pub fn upsert<F>(&self, key: &QueryKey, f: F) -> CacheEntry<D>
    where
        F: FnOnce(&mut CacheEntry<D>),
    {
        let mut state = self.inner.state.lock();
        let slot = self.slot_or_insert(&mut state, key, self.inner.default_cache_time);
        slot.publish(f);
        self.ensure_gc(key, slot);
        let entry = slot.tx.borrow().clone();
        entry
    }

    /// Subscribe to the entry of `key`, creating it if absent.
    ///
    /// Cancels any pending eviction of the entry. The retention window of the entry grows to `cache_time` if it is
    /// shorter. `refetcher`, if given, replaces the registered refetcher of the entry.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "refetch::query::store::subscribe"))]
    pub fn subscribe(
        &self,
        key: &QueryKey,
        info: SubscriberInfo,
        cache_time: Duration,
        refetcher: Option<Refetcher<D>>,
    ) -> (SubscriptionId, watch::Receiver<CacheEntry<D>>) {
        let mut state = self.inner.state.lock();
        state.next_subscription += 1;
        let id = state.next_subscription;

        let slot = self.slot_or_insert(&mut state, key, cache_time);
        slot.gc = None;
        slot.subscribers.insert(id, info);
        if let Some(refetcher) = refetcher {
            slot.refetcher = Some(refetcher);
        }
        let count = slot.subscribers.len();
        slot.publish(|entry| {
            entry.subscriber_count = count;
            entry.gc_scheduled = false;
        });
        let hit = slot.tx.borrow().data.is_some();
        let rx = slot.tx.subscribe();
        drop(state);

        match hit {
            true => self.inner.metrics.query_hit.increase(1),
            false => self.inner.metrics.query_miss.increase(1),
        }
        tracing::trace!("[store]: subscribe {key}, id: {id}, subscribers: {count}");

        (id, rx)
    }

    /// Drop the subscription `id` of the entry of `key`. The last subscriber leaving starts the retention timer.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "refetch::query::store::unsubscribe"))]
    pub fn unsubscribe(&self, key: &QueryKey, id: SubscriptionId) {
        let mut state = self.inner.state.lock();
        let Some(slot) = state.slots.get_mut(key) else {
            return;
        };
        if slot.subscribers.remove(&id).is_none() {
            return;
        }
        let count = slot.subscribers.len();
        slot.publish(|entry| entry.subscriber_count = count);
        self.ensure_gc(key, slot);
        drop(state);

        tracing::trace!("[store]: unsubscribe {key}, id: {id}, subscribers: {count}");
    }

    /// Remove the entry of `key`. Returns if the entry was present.
    ///
    /// A fetch in flight for the entry keeps running, its result is delivered to its waiters but not stored.
    pub fn remove(&self, key: &QueryKey) -> bool {
        let slot = self.inner.state.lock().slots.remove(key);
        match slot {
            Some(slot) => {
                self.leave(Event::Remove, key.clone(), slot);
                true
            }
            None => false,
        }
    }

    /// Remove every entry the filter selects. Returns the count of removed entries.
    pub fn remove_matching(&self, filter: &KeyFilter) -> usize {
        let removed = {
            let mut state = self.inner.state.lock();
            state.slots.extract_if(|key, _| filter.matches(key)).collect::<Vec<_>>()
        };
        let count = removed.len();
        for (key, slot) in removed {
            self.leave(Event::Remove, key, slot);
        }
        count
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let slots = std::mem::take(&mut self.inner.state.lock().slots);
        for (key, slot) in slots {
            self.leave(Event::Clear, key, slot);
        }
    }

    /// Keys of the entries the filter selects, in key order.
    pub fn keys(&self, filter: &KeyFilter) -> Vec<QueryKey> {
        let keys = self
            .inner
            .state
            .lock()
            .slots
            .keys()
            .filter(|key| filter.matches(key))
            .cloned()
            .collect_vec();
        keys.into_iter().sorted().collect()
    }

    /// Count of entries.
    pub fn len(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    /// If the store has no entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of entries with a fetch in flight.
    pub fn fetching(&self) -> usize {
        let state = self.inner.state.lock();
        state.slots.values().filter(|slot| slot.tx.borrow().is_fetching()).count()
    }

    /// Mark the entries the filter selects as stale.
    ///
    /// Entries with enabled subscribers and a registered refetcher are refetched in the background right away,
    /// replacing any fetch in flight. Returns the count of invalidated entries.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "refetch::query::store::invalidate"))]
    pub fn invalidate(&self, filter: &KeyFilter) -> usize {
        let mut refetches = vec![];
        let mut count = 0;
        {
            let state = self.inner.state.lock();
            for (key, slot) in state.slots.iter().filter(|(key, _)| filter.matches(key)) {
                slot.publish(|entry| entry.invalidated = true);
                count += 1;
                if let Some(refetcher) = slot.refetcher.as_ref().filter(|_| slot.is_active()) {
                    refetches.push((key.clone(), refetcher.clone()));
                }
            }
        }

        self.inner.metrics.query_invalidate.increase(count as _);
        tracing::debug!(
            "[store]: invalidate {count} entries with {filter:?}, refetch {} active entries",
            refetches.len()
        );

        for (key, refetcher) in refetches {
            let _ = self.fetch(&key, refetcher.fetcher, refetcher.options, FetchMode::Replace);
        }
        count
    }

    /// Refetch every entry the filter selects that has a registered refetcher, subscribed or not.
    ///
    /// Returns the count of started fetches.
    pub fn refetch(&self, filter: &KeyFilter, mode: FetchMode) -> usize {
        let refetches = self.refetchers(|key, _| filter.matches(key));
        let count = refetches.len();
        for (key, refetcher) in refetches {
            let _ = self.fetch(&key, refetcher.fetcher, refetcher.options, mode);
        }
        count
    }

    /// The window regained focus: refetch entries that are stale for any enabled subscriber that asks for it.
    ///
    /// Returns the count of started fetches.
    pub fn on_focus(&self) -> usize {
        let now = Instant::now();
        let refetches = self.refetchers(|_, slot| {
            let entry = slot.tx.borrow();
            slot.subscribers.values().any(|s| {
                s.enabled && s.refetch_on_window_focus && policy::is_stale(&entry, s.stale_time, now)
            })
        });
        let count = refetches.len();
        for (key, refetcher) in refetches {
            let _ = self.fetch(&key, refetcher.fetcher, refetcher.options, FetchMode::Dedupe);
        }
        count
    }

    fn refetchers(&self, mut pred: impl FnMut(&QueryKey, &Slot<D>) -> bool) -> Vec<(QueryKey, Refetcher<D>)> {
        let state = self.inner.state.lock();
        state
            .slots
            .iter()
            .filter(|(key, slot)| pred(key, slot))
            .filter_map(|(key, slot)| slot.refetcher.clone().map(|r| (key.clone(), r)))
            .collect()
    }

    /// Get the slot of `key`, creating it if absent. Grows the retention window of the slot to `cache_time`.
    ///
    /// The caller must call [`Store::ensure_gc`] if it leaves the slot without subscriber.
    pub(crate) fn slot_or_insert<'a>(
        &self,
        state: &'a mut State<D>,
        key: &QueryKey,
        cache_time: Duration,
    ) -> &'a mut Slot<D> {
        let State { slots, next_epoch, .. } = state;
        let slot = slots.entry(key.clone()).or_insert_with(|| {
            *next_epoch += 1;
            self.inner.metrics.query_entries.increase(1);
            Slot::new(key.clone(), *next_epoch, cache_time)
        });

        let retention = policy::retention(slot.cache_time, cache_time);
        if retention != slot.cache_time {
            slot.cache_time = retention;
            if slot.gc.is_some() {
                self.schedule_gc(key, slot);
            }
        }
        slot
    }

    pub(crate) fn ensure_gc(&self, key: &QueryKey, slot: &mut Slot<D>) {
        if slot.subscribers.is_empty() && slot.gc.is_none() {
            self.schedule_gc(key, slot);
        }
    }

    fn schedule_gc(&self, key: &QueryKey, slot: &mut Slot<D>) {
        slot.gc_seq += 1;
        let token = slot.gc_seq;
        let epoch = slot.epoch;
        let cache_time = slot.cache_time;
        let weak = Arc::downgrade(&self.inner);
        let key = key.clone();

        let handle = self.inner.spawner.spawn(async move {
            tokio::time::sleep(cache_time).await;
            if let Some(inner) = weak.upgrade() {
                Store { inner }.evict(&key, epoch, token);
            }
        });

        slot.gc = Some(GcTimer::new(token, handle));
        slot.publish(|entry| entry.gc_scheduled = true);
    }

    fn evict(&self, key: &QueryKey, epoch: u64, token: u64) {
        let slot = {
            let mut state = self.inner.state.lock();
            let evictable = state.slots.get(key).is_some_and(|slot| {
                slot.epoch == epoch
                    && slot.subscribers.is_empty()
                    && slot.gc.as_ref().is_some_and(|gc| gc.token == token)
            });
            if !evictable {
                return;
            }
            state.slots.remove(key)
        };
        if let Some(slot) = slot {
            self.leave(Event::Evict, key.clone(), slot);
        }
    }

    /// Bookkeeping for an entry that has left the store. Must be called out of the critical section.
    fn leave(&self, event: Event, key: QueryKey, slot: Slot<D>) {
        self.inner.metrics.query_entries.decrease(1);
        match event {
            Event::Evict => self.inner.metrics.query_evict.increase(1),
            Event::Remove | Event::Clear => self.inner.metrics.query_remove.increase(1),
        }
        tracing::debug!("[store]: entry {key} leaves the store, reason: {event:?}");
        if let Some(listener) = self.inner.event_listener.as_ref() {
            listener.on_leave(event, &key);
        }
        drop(slot);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{entry::Status, query_key};

    pub(crate) fn store<D: Value>() -> Store<D> {
        Store::new(StoreConfig {
            name: "test".into(),
            default_cache_time: Duration::from_secs(300),
            metrics: Arc::new(Metrics::noop()),
            event_listener: None,
            spawner: Spawner::current(),
        })
    }

    fn info() -> SubscriberInfo {
        SubscriberInfo::from(&QueryOptions::default())
    }

    #[derive(Debug, Default)]
    struct Recorder {
        events: Mutex<Vec<(Event, QueryKey)>>,
    }

    impl EventListener for Recorder {
        type Key = QueryKey;

        fn on_leave(&self, reason: Event, key: &QueryKey) {
            self.events.lock().push((reason, key.clone()));
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_upsert_and_get() {
        let store = store::<u64>();
        let key = query_key!["a"];
        assert!(store.get(&key).is_none());

        let entry = store.upsert(&key, |entry| entry.set_data(Arc::new(1), Instant::now()));
        assert_eq!(entry.status(), Status::Success);
        assert!(entry.is_gc_scheduled());

        let entry = store.get(&key).unwrap();
        assert_eq!(entry.data().map(|d| **d), Some(1));
        assert_eq!(store.len(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_distinct_keys_are_isolated() {
        let store = store::<u64>();
        let a = query_key!["posts", 1];
        let b = query_key!["posts", 2];

        store.upsert(&a, |entry| entry.set_data(Arc::new(1), Instant::now()));
        let (_, _rx) = store.subscribe(&b, info(), Duration::from_secs(300), None);

        let entry_a = store.get(&a).unwrap();
        let entry_b = store.get(&b).unwrap();
        assert_eq!(entry_a.subscriber_count(), 0);
        assert_eq!(entry_b.subscriber_count(), 1);
        assert!(entry_b.data().is_none());
        assert_eq!(entry_b.status(), Status::Idle);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_gc_timer_follows_subscribers() {
        let store = store::<u64>();
        let key = query_key!["a"];
        let cache_time = Duration::from_secs(60);

        let (id, rx) = store.subscribe(&key, info(), cache_time, None);
        assert!(!rx.borrow().is_gc_scheduled());
        assert_eq!(rx.borrow().subscriber_count(), 1);

        store.unsubscribe(&key, id);
        assert!(store.get(&key).unwrap().is_gc_scheduled());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(store.get(&key).is_some());

        // Resubscribing cancels the pending eviction.
        let (id, _rx) = store.subscribe(&key, info(), cache_time, None);
        assert!(!store.get(&key).unwrap().is_gc_scheduled());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(store.get(&key).is_some());

        store.unsubscribe(&key, id);
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(store.get(&key).is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get(&key).is_none());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_retention_is_max_cache_time() {
        let store = store::<u64>();
        let key = query_key!["a"];

        let (long, _) = store.subscribe(&key, info(), Duration::from_secs(600), None);
        let (short, _) = store.subscribe(&key, info(), Duration::from_secs(10), None);
        store.unsubscribe(&key, short);
        store.unsubscribe(&key, long);

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert!(store.get(&key).is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get(&key).is_none());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_events() {
        let recorder = Arc::new(Recorder::default());
        let store = Store::<u64>::new(StoreConfig {
            name: "test".into(),
            default_cache_time: Duration::from_secs(10),
            metrics: Arc::new(Metrics::noop()),
            event_listener: Some(recorder.clone()),
            spawner: Spawner::current(),
        });

        store.upsert(&query_key!["a"], |_| {});
        store.upsert(&query_key!["b"], |_| {});
        store.upsert(&query_key!["c", 1], |_| {});
        store.upsert(&query_key!["c", 2], |_| {});

        assert!(store.remove(&query_key!["a"]));
        assert!(!store.remove(&query_key!["a"]));
        assert_eq!(store.remove_matching(&KeyFilter::from(query_key!["c"])), 2);
        tokio::time::sleep(Duration::from_secs(11)).await;

        let mut events = recorder.events.lock().clone();
        events.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            events,
            vec![
                (Event::Remove, query_key!["a"]),
                (Event::Evict, query_key!["b"]),
                (Event::Remove, query_key!["c", 1]),
                (Event::Remove, query_key!["c", 2]),
            ]
        );
        assert!(store.is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_subscribers_see_changes() {
        let store = store::<u64>();
        let key = query_key!["a"];
        let (_, mut rx) = store.subscribe(&key, info(), Duration::from_secs(300), None);

        let seen = Arc::new(AtomicUsize::new(0));
        let task = {
            let seen = seen.clone();
            tokio::spawn(async move {
                rx.changed().await.unwrap();
                let entry = rx.borrow_and_update().clone();
                seen.store(entry.data().map(|d| **d as usize).unwrap_or(0), Ordering::SeqCst);
            })
        };

        store.upsert(&key, |entry| entry.set_data(Arc::new(7), Instant::now()));
        task.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_invalidate_marks_stale() {
        let store = store::<u64>();
        store.upsert(&query_key!["posts", 1], |entry| entry.set_data(Arc::new(1), Instant::now()));
        store.upsert(&query_key!["posts", 2], |entry| entry.set_data(Arc::new(2), Instant::now()));
        store.upsert(&query_key!["other"], |entry| entry.set_data(Arc::new(3), Instant::now()));

        assert_eq!(
            store.keys(&KeyFilter::from(query_key!["posts"])),
            vec![query_key!["posts", 1], query_key!["posts", 2]]
        );
        assert_eq!(store.invalidate(&KeyFilter::from(query_key!["posts"])), 2);
        assert!(store.get(&query_key!["posts", 1]).unwrap().is_invalidated());
        assert!(store.get(&query_key!["posts", 2]).unwrap().is_invalidated());
        assert!(!store.get(&query_key!["other"]).unwrap().is_invalidated());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_clear() {
        let store = store::<u64>();
        let key = query_key!["a"];
        let (_, mut rx) = store.subscribe(&key, info(), Duration::from_secs(300), None);
        store.upsert(&query_key!["b"], |_| {});
        store.clear();
        assert!(store.is_empty());
        assert!(rx.changed().await.is_err());
    }
}
