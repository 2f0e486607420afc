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

use std::{fmt::Debug, future::Future, sync::Arc};

use futures_util::{future::BoxFuture, FutureExt};
use refetch_common::{code::Value, error::Result};

use crate::{
    executor::{FetchMode, Fetcher},
    key::QueryKey,
    observer::{FetcherFactory, QueryObserver, QueryResult},
    options::QueryOptions,
    store::Store,
};

/// The cursor a page is fetched with. Opaque to the engine.
pub type PageParam = serde_json::Value;

/// Fetches one page of a key with a cursor.
pub type PageFn<V> = Arc<dyn Fn(QueryKey, PageParam) -> BoxFuture<'static, Result<V>> + Send + Sync>;

/// Extracts the cursor of the next page from a page. `None` means there is no next page.
pub type NextParamFn<V> = Arc<dyn Fn(&V) -> Option<PageParam> + Send + Sync>;

/// Wrap a closure as a [`PageFn`].
pub fn page_fn<V, F, FU>(f: F) -> PageFn<V>
where
    F: Fn(QueryKey, PageParam) -> FU + Send + Sync + 'static,
    FU: Future<Output = Result<V>> + Send + 'static,
{
    Arc::new(move |key, param| f(key, param).boxed())
}

/// A fetched page with the cursor it was fetched with.
#[derive(Debug)]
pub struct Page<V> {
    /// The cursor.
    pub param: PageParam,
    /// The page.
    pub data: Arc<V>,
}

impl<V> Clone for Page<V> {
    fn clone(&self) -> Self {
        Self {
            param: self.param.clone(),
            data: self.data.clone(),
        }
    }
}

/// Pages of an infinite query, in fetch order.
///
/// Pages are never reordered or deduplicated. Cloning only clones the cursors, page data is shared.
#[derive(Debug)]
pub struct Pages<V> {
    pages: Vec<Page<V>>,
    next_param: Option<PageParam>,
}

impl<V> Default for Pages<V> {
    fn default() -> Self {
        Self {
            pages: vec![],
            next_param: None,
        }
    }
}

impl<V> Clone for Pages<V> {
    fn clone(&self) -> Self {
        Self {
            pages: self.pages.clone(),
            next_param: self.next_param.clone(),
        }
    }
}

impl<V> Pages<V> {
    /// The pages.
    pub fn pages(&self) -> &[Page<V>] {
        &self.pages
    }

    /// Count of pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// If there is no page.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// The last page.
    pub fn last(&self) -> Option<&Page<V>> {
        self.pages.last()
    }

    /// Page data in order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<V>> + '_ {
        self.pages.iter().map(|page| &page.data)
    }

    /// Cursors of the pages in order.
    pub fn params(&self) -> impl Iterator<Item = &PageParam> + '_ {
        self.pages.iter().map(|page| &page.param)
    }

    /// Cursor of the next page, derived from the last page.
    pub fn next_param(&self) -> Option<&PageParam> {
        self.next_param.as_ref()
    }

    /// If there is a next page. `false` before the first page.
    pub fn has_next_page(&self) -> bool {
        self.next_param.is_some()
    }

    /// Append a page with the cursor derived from it.
    pub fn push(&mut self, page: Page<V>, next_param: Option<PageParam>) {
        self.pages.push(page);
        self.next_param = next_param;
    }
}

/// Options of an infinite query.
pub struct InfiniteQueryOptions<V> {
    /// Options of the underlying query.
    pub query: QueryOptions,
    /// Cursor of the first page.
    pub initial_param: PageParam,
    /// Derives the cursor of the next page.
    pub next_param: NextParamFn<V>,
}

impl<V> Clone for InfiniteQueryOptions<V> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            initial_param: self.initial_param.clone(),
            next_param: self.next_param.clone(),
        }
    }
}

impl<V> Debug for InfiniteQueryOptions<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfiniteQueryOptions")
            .field("query", &self.query)
            .field("initial_param", &self.initial_param)
            .finish()
    }
}

impl<V> InfiniteQueryOptions<V> {
    /// Create options with the next cursor extractor. The first page is fetched with a `null` cursor.
    pub fn new<F>(next_param: F) -> Self
    where
        F: Fn(&V) -> Option<PageParam> + Send + Sync + 'static,
    {
        Self {
            query: QueryOptions::default(),
            initial_param: PageParam::Null,
            next_param: Arc::new(next_param),
        }
    }

    /// Set the cursor of the first page.
    pub fn with_initial_param(mut self, initial_param: impl Into<PageParam>) -> Self {
        self.initial_param = initial_param.into();
        self
    }

    /// Set the options of the underlying query.
    pub fn with_query_options(mut self, query: QueryOptions) -> Self {
        self.query = query;
        self
    }
}

/// Builds fetchers that refetch every page.
///
/// Pages are fetched one after another from the initial cursor, each cursor derived from the freshly fetched page,
/// until the previous page count is reached or a cursor runs out. Without previous pages only the first page is
/// fetched.
pub(crate) fn refetch_all_factory<V>(page_fn: PageFn<V>, options: &InfiniteQueryOptions<V>) -> FetcherFactory<Pages<V>>
where
    V: Value,
{
    let initial_param = options.initial_param.clone();
    let next_param = options.next_param.clone();
    Arc::new(move |key: &QueryKey| -> Fetcher<Pages<V>> {
        let key = key.clone();
        let page_fn = page_fn.clone();
        let initial_param = initial_param.clone();
        let next_param = next_param.clone();
        Arc::new(move |previous: Option<Arc<Pages<V>>>| {
            let key = key.clone();
            let page_fn = page_fn.clone();
            let next_param = next_param.clone();
            let mut param = Some(initial_param.clone());
            async move {
                let target = previous.as_ref().map_or(0, |pages| pages.len()).max(1);
                let mut pages = Pages::default();
                while pages.len() < target {
                    let Some(current) = param.take() else {
                        break;
                    };
                    let data = page_fn(key.clone(), current.clone()).await?;
                    let next = next_param(&data);
                    param = next.clone();
                    pages.push(
                        Page {
                            param: current,
                            data: Arc::new(data),
                        },
                        next,
                    );
                }
                Ok(pages)
            }
            .boxed()
        })
    })
}

/// A fetcher that appends the next page to the pages held by the entry.
///
/// Without a next page the pages are returned unchanged. Without any page the first page is fetched.
fn next_page_fetcher<V>(key: QueryKey, page_fn: PageFn<V>, options: &InfiniteQueryOptions<V>) -> Fetcher<Pages<V>>
where
    V: Value,
{
    let initial_param = options.initial_param.clone();
    let next_param = options.next_param.clone();
    Arc::new(move |previous: Option<Arc<Pages<V>>>| {
        let key = key.clone();
        let page_fn = page_fn.clone();
        let next_param = next_param.clone();
        let initial_param = initial_param.clone();
        async move {
            let (mut pages, param) = match previous {
                Some(previous) => match previous.next_param.clone() {
                    Some(param) => (Pages::clone(&previous), param),
                    None => return Ok(Pages::clone(&previous)),
                },
                None => (Pages::default(), initial_param),
            };
            let data = page_fn(key, param.clone()).await?;
            let next = next_param(&data);
            pages.push(
                Page {
                    param,
                    data: Arc::new(data),
                },
                next,
            );
            Ok(pages)
        }
        .boxed()
    })
}

/// Observes a paged entry: an ordered sequence of pages under one key.
///
/// Refetching (on mount with stale data, invalidation, focus, interval or [`InfiniteQueryObserver::refetch`]) fetches
/// all pages again. [`InfiniteQueryObserver::fetch_next_page`] appends one page.
pub struct InfiniteQueryObserver<V>
where
    V: Value,
{
    inner: QueryObserver<Pages<V>>,
    page_fn: PageFn<V>,
    options: InfiniteQueryOptions<V>,
}

impl<V> Debug for InfiniteQueryObserver<V>
where
    V: Value,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfiniteQueryObserver")
            .field("inner", &self.inner)
            .finish()
    }
}

impl<V> InfiniteQueryObserver<V>
where
    V: Value,
{
    /// Create an observer of the paged entry of `key`.
    pub fn new(
        store: Store<Pages<V>>,
        key: QueryKey,
        page_fn: PageFn<V>,
        options: InfiniteQueryOptions<V>,
    ) -> Result<Self> {
        let factory = refetch_all_factory(page_fn.clone(), &options);
        let inner = QueryObserver::new(store, key, factory, options.query.clone())?;
        Ok(Self {
            inner,
            page_fn,
            options,
        })
    }

    /// The key the observer is bound to.
    pub fn key(&self) -> &QueryKey {
        self.inner.key()
    }

    /// The current result.
    pub fn result(&self) -> QueryResult<Pages<V>> {
        self.inner.result()
    }

    /// If the last page has a next cursor. `false` before the first page.
    pub fn has_next_page(&self) -> bool {
        let result = self.inner.result();
        !result.is_previous_data && result.data.is_some_and(|pages| pages.has_next_page())
    }

    /// Fetch and append the next page.
    ///
    /// Returns `None` without fetching if there is no next page. If a fetch is in flight for the entry, attaches to
    /// it instead.
    pub async fn fetch_next_page(&mut self) -> Result<Option<Arc<Pages<V>>>> {
        if !self.has_next_page() {
            return Ok(None);
        }
        let fetcher = next_page_fetcher(self.inner.key().clone(), self.page_fn.clone(), &self.options);
        let handle = self.inner.store().fetch_transient(
            self.inner.key(),
            fetcher,
            self.inner.fetch_options(),
            FetchMode::Dedupe,
        );
        handle.await.map(Some)
    }

    /// Refetch all pages.
    pub async fn refetch(&mut self) -> Result<Arc<Pages<V>>> {
        self.inner.refetch().await
    }

    /// Wait for the next change of the entry.
    pub async fn changed(&mut self) {
        self.inner.changed().await
    }

    /// Wait until the result satisfies `pred`.
    pub async fn wait_for<P>(&mut self, pred: P) -> QueryResult<Pages<V>>
    where
        P: FnMut(&QueryResult<Pages<V>>) -> bool,
    {
        self.inner.wait_for(pred).await
    }

    /// Rebind the observer to another key.
    pub fn set_key(&mut self, key: impl Into<QueryKey>) {
        self.inner.set_key(key)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU64, AtomicUsize, Ordering},
        time::Duration,
    };

    use serde_json::{json, Value as Json};

    use super::*;
    use crate::{query_key, store::tests::store};

    struct Api {
        last: AtomicU64,
        calls: AtomicUsize,
    }

    impl Api {
        fn new(last: u64) -> Arc<Self> {
            Arc::new(Self {
                last: AtomicU64::new(last),
                calls: AtomicUsize::new(0),
            })
        }

        fn page_fn(self: &Arc<Self>) -> PageFn<Json> {
            let api = self.clone();
            page_fn(move |_, param: PageParam| {
                let api = api.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    api.calls.fetch_add(1, Ordering::SeqCst);
                    let page = param.as_u64().unwrap_or(1);
                    let last = api.last.load(Ordering::SeqCst);
                    let next = if page < last { json!(page + 1) } else { Json::Null };
                    Ok(json!({ "page": page, "next": next }))
                }
            })
        }
    }

    fn options() -> InfiniteQueryOptions<Json> {
        InfiniteQueryOptions::new(|page: &Json| page.get("next").filter(|next| !next.is_null()).cloned())
            .with_initial_param(1)
    }

    fn params(pages: &Pages<Json>) -> Vec<u64> {
        pages.params().map(|p| p.as_u64().unwrap()).collect()
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_fetch_next_until_exhausted() {
        let api = Api::new(3);
        let mut observer =
            InfiniteQueryObserver::new(store(), query_key!["sw-people"], api.page_fn(), options()).unwrap();
        assert!(!observer.has_next_page());

        observer.wait_for(|r| r.is_success()).await;
        assert!(observer.has_next_page());

        let pages = observer.fetch_next_page().await.unwrap().unwrap();
        assert_eq!(params(&pages), vec![1, 2]);
        let pages = observer.fetch_next_page().await.unwrap().unwrap();
        assert_eq!(params(&pages), vec![1, 2, 3]);
        assert!(!pages.has_next_page());
        assert!(!observer.has_next_page());

        assert!(observer.fetch_next_page().await.unwrap().is_none());
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_refetch_reproduces_pages() {
        let api = Api::new(5);
        let mut observer =
            InfiniteQueryObserver::new(store(), query_key!["sw-species"], api.page_fn(), options()).unwrap();
        observer.wait_for(|r| r.is_success()).await;
        observer.fetch_next_page().await.unwrap();
        observer.fetch_next_page().await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);

        let pages = observer.refetch().await.unwrap();
        assert_eq!(params(&pages), vec![1, 2, 3]);
        assert!(pages.has_next_page());
        assert_eq!(api.calls.load(Ordering::SeqCst), 6);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_refetch_stops_when_cursor_runs_out() {
        let api = Api::new(5);
        let mut observer =
            InfiniteQueryObserver::new(store(), query_key!["sw-people"], api.page_fn(), options()).unwrap();
        observer.wait_for(|r| r.is_success()).await;
        for _ in 0..3 {
            observer.fetch_next_page().await.unwrap();
        }
        assert_eq!(observer.result().data.unwrap().len(), 4);

        api.last.store(2, Ordering::SeqCst);
        let pages = observer.refetch().await.unwrap();
        assert_eq!(params(&pages), vec![1, 2]);
        assert!(!observer.has_next_page());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_fetch_next_before_first_page() {
        let api = Api::new(5);
        let mut observer =
            InfiniteQueryObserver::new(store(), query_key!["sw-people"], api.page_fn(), options()).unwrap();
        // Nothing to append to yet.
        assert!(observer.fetch_next_page().await.unwrap().is_none());
        let pages = observer.wait_for(|r| r.is_success()).await.data.unwrap();
        assert_eq!(params(&pages), vec![1]);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }
}
