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

use std::{fmt::Debug, future::Future, sync::Arc, time::Duration};

use futures_util::FutureExt;
use refetch_common::{code::Value, error::Error, error::Result, spawn::SpawnHandle};
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    entry::{CacheEntry, FetchStatus, Status},
    executor::{FetchHandle, FetchMode, FetchOptions, Fetcher},
    key::QueryKey,
    options::QueryOptions,
    policy,
    store::{Refetcher, Store, SubscriberInfo, SubscriptionId},
};

/// Builds the fetcher of a key.
pub type FetcherFactory<D> = Arc<dyn Fn(&QueryKey) -> Fetcher<D> + Send + Sync>;

/// Wrap a query function, called with the key to fetch, as a [`FetcherFactory`].
pub fn query_fn<D, F, FU>(f: F) -> FetcherFactory<D>
where
    D: Value,
    F: Fn(QueryKey) -> FU + Send + Sync + 'static,
    FU: Future<Output = Result<D>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |key: &QueryKey| -> Fetcher<D> {
        let f = f.clone();
        let key = key.clone();
        Arc::new(move |_: Option<Arc<D>>| f(key.clone()).boxed())
    })
}

/// A snapshot of a query as seen by one observer.
#[derive(Debug)]
pub struct QueryResult<D> {
    /// The key the observer is bound to.
    pub key: QueryKey,
    /// The data, possibly from the previous key, see [`QueryResult::is_previous_data`].
    pub data: Option<Arc<D>>,
    /// The error of the last fetch. Present iff the status is [`Status::Error`].
    pub error: Option<Error>,
    /// Data status.
    pub status: Status,
    /// Fetch status.
    pub fetch_status: FetchStatus,
    /// If `data` belongs to the previous key of the observer.
    pub is_previous_data: bool,
    /// If the data is stale for the observer.
    pub is_stale: bool,
    /// Count of failed attempts of the current or last fetch.
    pub failure_count: u32,
    /// The error of the last failed attempt.
    pub failure_reason: Option<Error>,
    /// When the data was last set.
    pub updated_at: Option<Instant>,
}

impl<D> Clone for QueryResult<D> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            data: self.data.clone(),
            error: self.error.clone(),
            status: self.status,
            fetch_status: self.fetch_status,
            is_previous_data: self.is_previous_data,
            is_stale: self.is_stale,
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            updated_at: self.updated_at,
        }
    }
}

impl<D> QueryResult<D> {
    /// Loading without any data to show.
    pub fn is_loading(&self) -> bool {
        self.status == Status::Loading && self.data.is_none()
    }

    /// A fetch is in flight, with or without data to show.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// The last fetch failed.
    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    /// The last fetch succeeded.
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Never fetched.
    pub fn is_idle(&self) -> bool {
        self.status == Status::Idle
    }
}

struct Subscription<D> {
    id: SubscriptionId,
    rx: watch::Receiver<CacheEntry<D>>,
}

/// Binds a caller to the store entry of one key at a time.
///
/// The observer counts as a subscriber of its entry for as long as it lives, which keeps the entry from being
/// evicted. Creating the observer fetches the entry if it has no data, or if its data is stale and
/// [`QueryOptions::refetch_on_mount`] is set. Dropping it unsubscribes.
///
/// Removing or clearing the entry detaches the observer. Until the next [`QueryObserver::changed`],
/// [`QueryObserver::wait_for`] or refetch, [`QueryObserver::result`] keeps returning the last snapshot and the observer
/// does not hold a re-created entry of its key, which may then be evicted. Those calls subscribe again.
pub struct QueryObserver<D>
where
    D: Value,
{
    store: Store<D>,
    key: QueryKey,
    factory: FetcherFactory<D>,
    options: QueryOptions,
    subscription: Option<Subscription<D>>,
    previous: Option<Arc<D>>,
    interval: Option<SpawnHandle<()>>,
}

impl<D> Debug for QueryObserver<D>
where
    D: Value,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish()
    }
}

impl<D> QueryObserver<D>
where
    D: Value,
{
    /// Create an observer of `key` and subscribe to its entry.
    pub fn new(store: Store<D>, key: QueryKey, factory: FetcherFactory<D>, options: QueryOptions) -> Result<Self> {
        options.validate()?;
        let mut observer = Self {
            store,
            key,
            factory,
            options,
            subscription: None,
            previous: None,
            interval: None,
        };
        observer.attach();
        Ok(observer)
    }

    /// The key the observer is bound to.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The options of the observer.
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// The current result.
    pub fn result(&self) -> QueryResult<D> {
        let entry = match self.subscription.as_ref() {
            Some(subscription) => subscription.rx.borrow().clone(),
            None => CacheEntry::new(self.key.clone()),
        };

        let (data, is_previous_data) = match (entry.data.clone(), self.previous.as_ref()) {
            (Some(data), _) => (Some(data), false),
            (None, Some(previous)) if self.options.keep_previous_data && entry.status != Status::Error => {
                (Some(previous.clone()), true)
            }
            (None, _) => (None, false),
        };

        QueryResult {
            key: self.key.clone(),
            is_stale: policy::is_stale(&entry, self.options.stale_time, Instant::now()),
            status: if is_previous_data { Status::Success } else { entry.status },
            data,
            error: entry.error,
            fetch_status: entry.fetch_status,
            is_previous_data,
            failure_count: entry.failure_count,
            failure_reason: entry.failure_reason,
            updated_at: entry.updated_at,
        }
    }

    /// Wait for the next change of the entry.
    ///
    /// If the entry leaves the store, the observer subscribes to a fresh entry of its key, which counts as a change.
    pub async fn changed(&mut self) {
        if self.subscription().rx.changed().await.is_err() {
            self.subscription();
        }
    }

    /// Wait until the result satisfies `pred`.
    pub async fn wait_for<P>(&mut self, mut pred: P) -> QueryResult<D>
    where
        P: FnMut(&QueryResult<D>) -> bool,
    {
        loop {
            self.subscription();
            let result = self.result();
            if pred(&result) {
                return result;
            }
            self.changed().await;
        }
    }

    /// Fetch the entry, attaching to a fetch in flight. Runs even if the observer is disabled.
    pub async fn refetch(&mut self) -> Result<Arc<D>> {
        self.refetch_with(FetchMode::Dedupe).await
    }

    /// Fetch the entry with the given mode. Runs even if the observer is disabled.
    pub async fn refetch_with(&mut self, mode: FetchMode) -> Result<Arc<D>> {
        self.subscription();
        self.fetch(mode).await
    }

    /// Rebind the observer to another key.
    ///
    /// The old entry loses a subscriber. The data shown so far is kept as the previous data, which is served while
    /// the new entry has none if [`QueryOptions::keep_previous_data`] is set.
    pub fn set_key(&mut self, key: impl Into<QueryKey>) {
        let key = key.into();
        if key == self.key {
            return;
        }
        if let Some(data) = self.result().data {
            self.previous = Some(data);
        }
        self.detach();
        self.key = key;
        self.attach();
    }

    pub(crate) fn store(&self) -> &Store<D> {
        &self.store
    }

    pub(crate) fn fetch_options(&self) -> FetchOptions {
        FetchOptions::from(&self.options)
    }

    fn fetch(&self, mode: FetchMode) -> FetchHandle<D> {
        self.store
            .fetch(&self.key, (self.factory)(&self.key), self.fetch_options(), mode)
    }

    fn subscription(&mut self) -> &mut Subscription<D> {
        match self.subscription.take() {
            Some(subscription) if subscription.rx.has_changed().is_ok() => self.subscription.insert(subscription),
            _ => self.attach(),
        }
    }

    fn attach(&mut self) -> &mut Subscription<D> {
        let refetcher = Refetcher {
            fetcher: (self.factory)(&self.key),
            options: self.fetch_options(),
        };
        let (id, rx) = self.store.subscribe(
            &self.key,
            SubscriberInfo::from(&self.options),
            self.options.cache_time,
            Some(refetcher),
        );

        let fetch = policy::should_fetch_on_mount(&rx.borrow(), &self.options, Instant::now());
        if fetch {
            tracing::trace!("[observer]: fetch {} on mount", self.key);
            let _ = self.fetch(FetchMode::Dedupe);
        }
        self.start_interval();

        self.subscription.insert(Subscription { id, rx })
    }

    fn detach(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.store.unsubscribe(&self.key, subscription.id);
        }
        if let Some(interval) = self.interval.take() {
            interval.abort();
        }
    }

    fn start_interval(&mut self) {
        if let Some(interval) = self.interval.take() {
            interval.abort();
        }
        if !self.options.enabled {
            return;
        }
        let Some(period) = self.options.refetch_interval else {
            return;
        };

        let store = self.store.clone();
        let key = self.key.clone();
        let fetcher = (self.factory)(&key);
        let options = self.fetch_options();
        let handle = self.store.spawner().spawn(async move {
            refetch_periodically(store, key, fetcher, options, period).await;
        });
        self.interval = Some(handle);
    }
}

async fn refetch_periodically<D>(
    store: Store<D>,
    key: QueryKey,
    fetcher: Fetcher<D>,
    options: FetchOptions,
    period: Duration,
) where
    D: Value,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = store
            .fetch(&key, fetcher.clone(), options.clone(), FetchMode::Dedupe)
            .await
        {
            tracing::debug!("[observer]: interval refetch of {key} failed: {e}");
        }
    }
}

impl<D> Drop for QueryObserver<D>
where
    D: Value,
{
    fn drop(&mut self) {
        self.detach();
    }
}
