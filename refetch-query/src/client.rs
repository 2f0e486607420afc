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

use std::{borrow::Cow, fmt::Debug, future::Future, marker::PhantomData, sync::Arc};

use refetch_common::{
    code::Value,
    error::{Error, Result},
    event::EventListener,
    metrics::{registry::noop::NoopMetricsRegistry, BoxedRegistry, Metrics},
    spawn::Spawner,
};
use tokio::time::Instant;

use crate::{
    entry::CacheEntry,
    executor::{FetchMode, FetchOptions},
    infinite::{page_fn, refetch_all_factory, InfiniteQueryObserver, InfiniteQueryOptions, PageParam, Pages},
    key::{KeyFilter, QueryKey},
    mutation::{mutation_fn, Invalidate, Mutation},
    observer::{query_fn, QueryObserver},
    options::{MutationOptions, QueryOptions},
    policy,
    store::{Store, StoreConfig},
};

/// Builder of [`QueryClient`].
pub struct QueryClientBuilder<V = serde_json::Value> {
    name: Cow<'static, str>,
    default_options: QueryOptions,
    default_mutation_options: MutationOptions,
    registry: BoxedRegistry,
    event_listener: Option<Arc<dyn EventListener<Key = QueryKey>>>,
    spawner: Option<Spawner>,
    _marker: PhantomData<V>,
}

impl<V> Default for QueryClientBuilder<V> {
    fn default() -> Self {
        Self {
            name: "refetch".into(),
            default_options: QueryOptions::default(),
            default_mutation_options: MutationOptions::default(),
            registry: Box::new(NoopMetricsRegistry),
            event_listener: None,
            spawner: None,
            _marker: PhantomData,
        }
    }
}

impl<V> QueryClientBuilder<V>
where
    V: Value,
{
    /// Set the name of the client, used as the metrics label.
    ///
    /// The default value is `refetch`.
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the options of queries observed or fetched without explicit options.
    pub fn with_default_options(mut self, options: QueryOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Set the options of mutations created without explicit options.
    pub fn with_default_mutation_options(mut self, options: MutationOptions) -> Self {
        self.default_mutation_options = options;
        self
    }

    /// Set the metrics registry.
    ///
    /// The default value is a noop registry.
    pub fn with_metrics_registry(mut self, registry: BoxedRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the listener called when entries leave the cache.
    pub fn with_event_listener(mut self, event_listener: Arc<dyn EventListener<Key = QueryKey>>) -> Self {
        self.event_listener = Some(event_listener);
        self
    }

    /// Set the spawner of fetches and timers.
    ///
    /// The default value is the spawner of the runtime `build` is called in.
    pub fn with_spawner(mut self, spawner: Spawner) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<QueryClient<V>> {
        self.default_options.validate()?;
        self.default_mutation_options.validate()?;
        let spawner = self
            .spawner
            .or_else(Spawner::try_current)
            .ok_or_else(|| Error::config("spawner", "no spawner given and not in a tokio runtime"))?;
        let metrics = Arc::new(Metrics::new(self.name.clone(), self.registry.as_ref()));

        let config = |name: Cow<'static, str>| StoreConfig {
            name,
            default_cache_time: self.default_options.cache_time,
            metrics: metrics.clone(),
            event_listener: self.event_listener.clone(),
            spawner: spawner.clone(),
        };
        let queries = Store::new(config(self.name.clone()));
        let infinite = Store::new(config(format!("{}-infinite", self.name).into()));

        tracing::debug!("[client]: build query client {}", self.name);

        let inner = QueryClientInner {
            name: self.name,
            queries,
            infinite,
            default_options: self.default_options,
            default_mutation_options: self.default_mutation_options,
            metrics,
        };
        Ok(QueryClient { inner: Arc::new(inner) })
    }
}

struct QueryClientInner<V> {
    name: Cow<'static, str>,
    queries: Store<V>,
    infinite: Store<Pages<V>>,
    default_options: QueryOptions,
    default_mutation_options: MutationOptions,
    metrics: Arc<Metrics>,
}

/// The query cache engine.
///
/// The client owns one store for plain queries and one for infinite queries. It is cheap to clone, clones share the
/// same stores.
///
/// ```rust
/// # use refetch_query::{query_key, QueryClient};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = QueryClient::<String>::builder().build().unwrap();
/// let mut posts = client
///     .observe(query_key!["posts", 1], |key| async move { Ok(format!("posts of {key}")) })
///     .unwrap();
/// let result = posts.wait_for(|r| r.is_success()).await;
/// assert_eq!(result.data.as_deref().map(String::as_str), Some(r#"posts of ["posts",1]"#));
/// # }
/// ```
pub struct QueryClient<V = serde_json::Value> {
    inner: Arc<QueryClientInner<V>>,
}

impl<V> Clone for QueryClient<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Debug for QueryClient<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient").field("name", &self.inner.name).finish()
    }
}

impl<V> QueryClient<V>
where
    V: Value,
{
    /// Create a builder.
    pub fn builder() -> QueryClientBuilder<V> {
        QueryClientBuilder::default()
    }

    /// Name of the client.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Default query options.
    pub fn default_options(&self) -> &QueryOptions {
        &self.inner.default_options
    }

    /// The store of plain queries.
    pub fn queries(&self) -> &Store<V> {
        &self.inner.queries
    }

    /// The store of infinite queries.
    pub fn infinite(&self) -> &Store<Pages<V>> {
        &self.inner.infinite
    }

    /// Observe `key` with the default options. `f` is called with the key to fetch.
    pub fn observe<F, FU>(&self, key: impl Into<QueryKey>, f: F) -> Result<QueryObserver<V>>
    where
        F: Fn(QueryKey) -> FU + Send + Sync + 'static,
        FU: Future<Output = Result<V>> + Send + 'static,
    {
        self.observe_with(key, f, self.inner.default_options.clone())
    }

    /// Observe `key` with the given options.
    pub fn observe_with<F, FU>(&self, key: impl Into<QueryKey>, f: F, options: QueryOptions) -> Result<QueryObserver<V>>
    where
        F: Fn(QueryKey) -> FU + Send + Sync + 'static,
        FU: Future<Output = Result<V>> + Send + 'static,
    {
        QueryObserver::new(self.inner.queries.clone(), key.into(), query_fn(f), options)
    }

    /// Observe the paged entry of `key`. `f` is called with the key and the cursor of the page to fetch.
    pub fn observe_infinite<F, FU>(
        &self,
        key: impl Into<QueryKey>,
        f: F,
        options: InfiniteQueryOptions<V>,
    ) -> Result<InfiniteQueryObserver<V>>
    where
        F: Fn(QueryKey, PageParam) -> FU + Send + Sync + 'static,
        FU: Future<Output = Result<V>> + Send + 'static,
    {
        InfiniteQueryObserver::new(self.inner.infinite.clone(), key.into(), page_fn(f), options)
    }

    /// Get the data of `key`, fetching it if it is absent or stale for `options`.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "refetch::query::client::fetch_query"))]
    pub async fn fetch_query<F, FU>(&self, key: impl Into<QueryKey>, f: F, options: QueryOptions) -> Result<Arc<V>>
    where
        F: Fn(QueryKey) -> FU + Send + Sync + 'static,
        FU: Future<Output = Result<V>> + Send + 'static,
    {
        options.validate()?;
        let key = key.into();
        if let Some(data) = self.fresh(&self.inner.queries, &key, &options) {
            return Ok(data);
        }
        let fetcher = query_fn(f)(&key);
        self.inner
            .queries
            .fetch(&key, fetcher, FetchOptions::from(&options), FetchMode::Dedupe)
            .await
    }

    /// Populate the entry of `key` without subscribing to it. The entry is eligible for eviction right away.
    ///
    /// Fresh data is not refetched. Fetch errors are logged and dropped.
    pub async fn prefetch<F, FU>(&self, key: impl Into<QueryKey>, f: F)
    where
        F: Fn(QueryKey) -> FU + Send + Sync + 'static,
        FU: Future<Output = Result<V>> + Send + 'static,
    {
        self.prefetch_with(key, f, self.inner.default_options.clone()).await
    }

    /// Like [`QueryClient::prefetch`], with the given options.
    pub async fn prefetch_with<F, FU>(&self, key: impl Into<QueryKey>, f: F, options: QueryOptions)
    where
        F: Fn(QueryKey) -> FU + Send + Sync + 'static,
        FU: Future<Output = Result<V>> + Send + 'static,
    {
        let key = key.into();
        if let Err(e) = self.fetch_query(key.clone(), f, options).await {
            tracing::debug!("[client]: prefetch {key} failed: {e}");
        }
    }

    /// Populate the first page of the paged entry of `key` without subscribing to it.
    ///
    /// Fresh pages are not refetched. Stale pages are refetched all. Fetch errors are logged and dropped.
    pub async fn prefetch_infinite<F, FU>(&self, key: impl Into<QueryKey>, f: F, options: InfiniteQueryOptions<V>)
    where
        F: Fn(QueryKey, PageParam) -> FU + Send + Sync + 'static,
        FU: Future<Output = Result<V>> + Send + 'static,
    {
        let key = key.into();
        if let Err(e) = options.query.validate() {
            tracing::warn!("[client]: prefetch {key} with invalid options: {e}");
            return;
        }
        if self.fresh(&self.inner.infinite, &key, &options.query).is_some() {
            return;
        }
        let fetcher = refetch_all_factory(page_fn(f), &options)(&key);
        let res = self
            .inner
            .infinite
            .fetch(&key, fetcher, FetchOptions::from(&options.query), FetchMode::Dedupe)
            .await;
        if let Err(e) = res {
            tracing::debug!("[client]: prefetch {key} failed: {e}");
        }
    }

    fn fresh<D>(&self, store: &Store<D>, key: &QueryKey, options: &QueryOptions) -> Option<Arc<D>>
    where
        D: Value,
    {
        let entry = store.get(key)?;
        if policy::is_stale(&entry, options.stale_time, Instant::now()) {
            self.inner.metrics.query_miss.increase(1);
            return None;
        }
        self.inner.metrics.query_hit.increase(1);
        entry.data().cloned()
    }

    /// Snapshot of the entry of `key`.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry<V>> {
        self.inner.queries.get(key)
    }

    /// Snapshot of the paged entry of `key`.
    pub fn get_infinite(&self, key: &QueryKey) -> Option<CacheEntry<Pages<V>>> {
        self.inner.infinite.get(key)
    }

    /// Data of the entry of `key`.
    pub fn get_query_data(&self, key: &QueryKey) -> Option<Arc<V>> {
        self.inner.queries.get(key).and_then(|entry| entry.data().cloned())
    }

    /// Set the data of the entry of `key` as if it had just been fetched. Observers see the change right away.
    pub fn set_query_data(&self, key: impl Into<QueryKey>, data: V) -> Arc<V> {
        let data = Arc::new(data);
        self.inner
            .queries
            .upsert(&key.into(), |entry| entry.set_data(data.clone(), Instant::now()));
        data
    }

    /// Mark the entries the filter selects stale, in both stores. Observed entries are refetched in the background.
    ///
    /// Returns the count of invalidated entries.
    pub fn invalidate(&self, filter: impl Into<KeyFilter>) -> usize {
        let filter = filter.into();
        self.inner.queries.invalidate(&filter) + self.inner.infinite.invalidate(&filter)
    }

    /// Refetch the entries the filter selects, observed or not, replacing fetches in flight.
    ///
    /// Returns the count of started fetches.
    pub fn refetch(&self, filter: impl Into<KeyFilter>) -> usize {
        let filter = filter.into();
        self.inner.queries.refetch(&filter, FetchMode::Replace)
            + self.inner.infinite.refetch(&filter, FetchMode::Replace)
    }

    /// Remove the entries the filter selects. Returns the count of removed entries.
    pub fn remove(&self, filter: impl Into<KeyFilter>) -> usize {
        let filter = filter.into();
        self.inner.queries.remove_matching(&filter) + self.inner.infinite.remove_matching(&filter)
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.inner.queries.clear();
        self.inner.infinite.clear();
    }

    /// The window regained focus. Refetches the entries that are stale for an observer that asks for it.
    ///
    /// Returns the count of started fetches.
    pub fn on_focus(&self) -> usize {
        self.inner.queries.on_focus() + self.inner.infinite.on_focus()
    }

    /// Count of entries with a fetch in flight.
    pub fn is_fetching(&self) -> usize {
        self.inner.queries.fetching() + self.inner.infinite.fetching()
    }

    /// Create a mutation with the default mutation options.
    pub fn mutation<I, O, F, FU>(&self, f: F) -> Result<Mutation<I, O>>
    where
        I: Clone + Send + 'static,
        O: Value,
        F: Fn(I) -> FU + Send + Sync + 'static,
        FU: Future<Output = Result<O>> + Send + 'static,
    {
        self.mutation_with(f, self.inner.default_mutation_options.clone())
    }

    /// Create a mutation with the given options.
    pub fn mutation_with<I, O, F, FU>(&self, f: F, options: MutationOptions) -> Result<Mutation<I, O>>
    where
        I: Clone + Send + 'static,
        O: Value,
        F: Fn(I) -> FU + Send + Sync + 'static,
        FU: Future<Output = Result<O>> + Send + 'static,
    {
        let invalidators: Vec<Arc<dyn Invalidate>> = vec![
            Arc::new(self.inner.queries.clone()),
            Arc::new(self.inner.infinite.clone()),
        ];
        Mutation::new(mutation_fn(f), options, invalidators, self.inner.metrics.clone())
    }
}
