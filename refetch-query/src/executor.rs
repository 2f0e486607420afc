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

use std::{
    fmt::Debug,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};
use refetch_common::{
    code::Value,
    error::{Error, ErrorKind, Result},
};
use tokio::time::Instant;

use crate::{
    entry::{FetchStatus, Status},
    inflight::{Enqueue, Waiter},
    key::QueryKey,
    options::{QueryOptions, Retry, RetryDelay},
    store::{Refetcher, Store},
};

/// A fetch function bound to a key.
///
/// It receives the data currently held by the entry, if any, which lets paged fetchers know how many pages to
/// refetch.
pub type Fetcher<D> = Arc<dyn Fn(Option<Arc<D>>) -> BoxFuture<'static, Result<D>> + Send + Sync>;

/// Wrap a closure as a [`Fetcher`].
pub fn fetcher<D, F, FU>(f: F) -> Fetcher<D>
where
    F: Fn(Option<Arc<D>>) -> FU + Send + Sync + 'static,
    FU: Future<Output = Result<D>> + Send + 'static,
{
    Arc::new(move |previous| f(previous).boxed())
}

/// How a new fetch request treats a fetch in flight for the same entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Attach to the fetch in flight.
    #[default]
    Dedupe,
    /// Supersede the fetch in flight. Its waiters receive a cancelled error and its result is discarded.
    Replace,
}

/// Options of a single fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Retry policy.
    pub retry: Retry,
    /// Backoff between attempts.
    pub retry_delay: RetryDelay,
    /// Per-attempt timeout.
    pub timeout: Option<Duration>,
    /// Retention window requested for the entry.
    pub cache_time: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from(&QueryOptions::default())
    }
}

impl From<&QueryOptions> for FetchOptions {
    fn from(options: &QueryOptions) -> Self {
        Self {
            retry: options.retry,
            retry_delay: options.retry_delay,
            timeout: options.timeout,
            cache_time: options.cache_time,
        }
    }
}

/// Resolves to the result of the fetch a request led or attached to.
///
/// The fetch runs on its own task. Dropping the handle does not cancel it.
#[must_use]
pub struct FetchHandle<D> {
    waiter: Waiter<D>,
}

impl<D> Debug for FetchHandle<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchHandle").finish()
    }
}

impl<D> Future for FetchHandle<D> {
    type Output = Result<Arc<D>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.waiter).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::cancelled("fetch task dropped"))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Run one attempt. Timeouts and panics of the attempt become errors.
async fn attempt<T>(future: impl Future<Output = Result<T>>, timeout: Option<Duration>) -> Result<T> {
    let future = AssertUnwindSafe(future).catch_unwind();
    let res = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| Error::timeout(timeout))?,
        None => future.await,
    };
    res.unwrap_or_else(|_| Err(Error::new(ErrorKind::Join, "fetch function panicked")))
}

/// Call `f` until it succeeds, fails with a terminal error, or runs out of attempts, sleeping with backoff in
/// between.
///
/// `on_failure` is called with the failure count after each failure that is going to be retried. Returning `false`
/// stops retrying. Returns the last result with the count of failed attempts.
pub(crate) async fn retry<T, F>(
    mut f: F,
    retry: Retry,
    delay: RetryDelay,
    timeout: Option<Duration>,
    mut on_failure: impl FnMut(u32, &Error) -> bool,
) -> (Result<T>, u32)
where
    F: FnMut() -> BoxFuture<'static, Result<T>> + Send,
{
    let attempts = retry.attempts();
    let mut failures = 0;
    loop {
        let error = match attempt(async { f().await }, timeout).await {
            Ok(v) => return (Ok(v), failures),
            Err(e) => e,
        };
        failures += 1;
        if failures >= attempts || !error.is_retryable() || !on_failure(failures, &error) {
            return (Err(error), failures);
        }
        tokio::time::sleep(delay.delay(failures)).await;
    }
}

impl<D> Store<D>
where
    D: Value,
{
    /// Fetch the entry of `key`, creating it if absent, and register `fetcher` as its refetcher.
    ///
    /// If a fetch is in flight for the entry, [`FetchMode::Dedupe`] attaches to it and `fetcher` is not called.
    /// Otherwise the entry turns to loading, keeping its data, and a new fetch starts on its own task.
    pub fn fetch(&self, key: &QueryKey, fetcher: Fetcher<D>, options: FetchOptions, mode: FetchMode) -> FetchHandle<D> {
        self.fetch_inner(key, fetcher, options, mode, true)
    }

    /// Like [`Store::fetch`], without registering `fetcher` as the refetcher of the entry.
    pub fn fetch_transient(
        &self,
        key: &QueryKey,
        fetcher: Fetcher<D>,
        options: FetchOptions,
        mode: FetchMode,
    ) -> FetchHandle<D> {
        self.fetch_inner(key, fetcher, options, mode, false)
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "refetch::query::store::fetch"))]
    fn fetch_inner(
        &self,
        key: &QueryKey,
        fetcher: Fetcher<D>,
        options: FetchOptions,
        mode: FetchMode,
        register: bool,
    ) -> FetchHandle<D> {
        let mut state = self.inner.state.lock();

        let slot = self.slot_or_insert(&mut state, key, options.cache_time);
        self.ensure_gc(key, slot);
        if register {
            slot.refetcher = Some(Refetcher {
                fetcher: fetcher.clone(),
                options: options.clone(),
            });
        }
        let epoch = slot.epoch;
        let previous = slot.tx.borrow().data.clone();

        let (seq, waiter, superseded) = match state.inflights.enqueue(key, epoch, mode) {
            Enqueue::Attached(waiter) => {
                drop(state);
                self.inner.metrics.query_dedupe.increase(1);
                tracing::trace!("[executor]: attach to the fetch in flight of {key}");
                return FetchHandle { waiter };
            }
            Enqueue::Lead {
                seq,
                waiter,
                superseded,
            } => (seq, waiter, superseded),
        };

        if let Some(slot) = state.slots.get(key) {
            slot.publish(|entry| {
                entry.status = Status::Loading;
                entry.fetch_status = FetchStatus::Fetching;
                entry.error = None;
                entry.failure_count = 0;
                entry.failure_reason = None;
            });
        }
        drop(state);

        self.inner.metrics.query_fetch.increase(1);
        if !superseded.is_empty() {
            tracing::debug!(
                "[executor]: fetch {seq} of {key} supersedes the fetch in flight, cancel {} waiters",
                superseded.len()
            );
            self.inner.metrics.query_cancel.increase(superseded.len() as _);
            for notifier in superseded {
                let _ = notifier.send(Err(
                    Error::cancelled("superseded by a newer fetch").with_context("key", key)
                ));
            }
        }

        let store = self.clone();
        let key = key.clone();
        // Detached, the fetch outlives unsubscribing.
        let _ = self.inner.spawner.spawn(async move {
            store.run(key, seq, epoch, fetcher, previous, options).await;
        });

        FetchHandle { waiter }
    }

    async fn run(
        self,
        key: QueryKey,
        seq: u64,
        epoch: u64,
        fetcher: Fetcher<D>,
        previous: Option<Arc<D>>,
        options: FetchOptions,
    ) {
        let start = Instant::now();
        let (res, failures) = retry(
            || fetcher(previous.clone()),
            options.retry,
            options.retry_delay,
            options.timeout,
            |failures, error| self.report_failure(&key, seq, epoch, failures, error),
        )
        .await;
        self.settle(&key, seq, epoch, failures, res.map(Arc::new), start.elapsed());
    }

    /// Publish a failed attempt that will be retried. Returns `false` if the fetch has been superseded.
    fn report_failure(&self, key: &QueryKey, seq: u64, epoch: u64, failures: u32, error: &Error) -> bool {
        let state = self.inner.state.lock();
        if !state.inflights.is_current(key, seq) {
            return false;
        }
        if let Some(slot) = state.slots.get(key).filter(|slot| slot.epoch == epoch) {
            slot.publish(|entry| {
                entry.failure_count = failures;
                entry.failure_reason = Some(error.clone());
            });
        }
        drop(state);

        self.inner.metrics.query_retry.increase(1);
        tracing::debug!("[executor]: fetch {seq} of {key} failed {failures} times, retry: {error}");
        true
    }

    /// Store the result of fetch `seq` and hand it to the waiters.
    ///
    /// Only the latest fetch of a key may settle. The result of a fetch whose entry has left the store is handed to
    /// the waiters but not stored.
    fn settle(&self, key: &QueryKey, seq: u64, epoch: u64, failures: u32, res: Result<Arc<D>>, elapsed: Duration) {
        let mut state = self.inner.state.lock();

        let Some(notifiers) = state.inflights.take(key, seq) else {
            drop(state);
            self.inner.metrics.query_discard.increase(1);
            tracing::debug!("[executor]: discard the result of superseded fetch {seq} of {key}");
            return;
        };

        match state.slots.get(key).filter(|slot| slot.epoch == epoch) {
            Some(slot) => {
                let now = Instant::now();
                slot.publish(|entry| {
                    entry.fetch_status = FetchStatus::Idle;
                    match &res {
                        Ok(data) => entry.set_data(data.clone(), now),
                        Err(error) => {
                            entry.set_error(error.clone(), now);
                            entry.failure_count = failures;
                        }
                    }
                });
            }
            None => {
                self.inner.metrics.query_discard.increase(1);
                tracing::debug!("[executor]: entry of {key} left the store while fetching, discard fetch {seq}");
            }
        }
        drop(state);

        match &res {
            Ok(_) => {
                self.inner.metrics.query_success.increase(1);
                self.inner.metrics.query_success_duration.record(elapsed.as_secs_f64());
            }
            Err(error) => {
                self.inner.metrics.query_error.increase(1);
                self.inner.metrics.query_error_duration.record(elapsed.as_secs_f64());
                tracing::warn!("[executor]: fetch {seq} of {key} failed after {failures} attempts: {error}");
            }
        }

        for notifier in notifiers {
            let _ = notifier.send(res.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{query_key, store::tests::store};

    fn counting<F, FU>(count: &Arc<AtomicUsize>, f: F) -> Fetcher<u64>
    where
        F: Fn(usize) -> FU + Send + Sync + 'static,
        FU: Future<Output = Result<u64>> + Send + 'static,
    {
        let count = count.clone();
        fetcher(move |_| f(count.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn explode() -> Result<u64> {
        panic!("boom")
    }

    fn options(attempts: u32) -> FetchOptions {
        FetchOptions {
            retry: Retry::Attempts(attempts),
            ..Default::default()
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_fetch_success() {
        let store = store::<u64>();
        let key = query_key!["a"];
        let count = Arc::new(AtomicUsize::new(0));

        let handle = store.fetch(&key, counting(&count, |_| async { Ok(42) }), options(3), FetchMode::Dedupe);
        let entry = store.get(&key).unwrap();
        assert_eq!(entry.status(), Status::Loading);
        assert!(entry.is_fetching());

        assert_eq!(*handle.await.unwrap(), 42);
        let entry = store.get(&key).unwrap();
        assert_eq!(entry.status(), Status::Success);
        assert_eq!(entry.fetch_status(), FetchStatus::Idle);
        assert!(entry.updated_at().is_some());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_dedupe() {
        let store = store::<u64>();
        let key = query_key!["a"];
        let count = Arc::new(AtomicUsize::new(0));

        let slow = |n: usize| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, Error>(n as u64)
        };
        let h1 = store.fetch(&key, counting(&count, slow), options(3), FetchMode::Dedupe);
        let h2 = store.fetch(&key, counting(&count, slow), options(3), FetchMode::Dedupe);

        let (r1, r2) = tokio::join!(h1, h2);
        assert_eq!(*r1.unwrap(), 1);
        assert_eq!(*r2.unwrap(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_last_initiated_wins() {
        let store = store::<u64>();
        let key = query_key!["a"];

        // The first fetch is slower than the second one.
        let first = store.fetch(
            &key,
            fetcher(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(1)
            }),
            options(1),
            FetchMode::Dedupe,
        );
        let second = store.fetch(
            &key,
            fetcher(|_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(2)
            }),
            options(1),
            FetchMode::Replace,
        );

        assert_eq!(first.await.unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(*second.await.unwrap(), 2);

        tokio::time::sleep(Duration::from_secs(20)).await;
        let entry = store.get(&key).unwrap();
        assert_eq!(entry.data().map(|d| **d), Some(2));
        assert!(!entry.is_fetching());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_data_frozen_while_refetching() {
        let store = store::<u64>();
        let key = query_key!["a"];
        store.fetch(&key, fetcher(|_| async { Ok(1) }), options(1), FetchMode::Dedupe).await.unwrap();

        let handle = store.fetch(
            &key,
            fetcher(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(2)
            }),
            options(1),
            FetchMode::Dedupe,
        );
        tokio::time::sleep(Duration::from_secs(4)).await;
        let entry = store.get(&key).unwrap();
        assert_eq!(entry.status(), Status::Loading);
        assert_eq!(entry.data().map(|d| **d), Some(1));

        handle.await.unwrap();
        assert_eq!(store.get(&key).unwrap().data().map(|d| **d), Some(2));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_retry_exhaustion() {
        let store = store::<u64>();
        let key = query_key!["a"];
        let count = Arc::new(AtomicUsize::new(0));

        let start = Instant::now();
        let handle = store.fetch(
            &key,
            counting(&count, |n| async move { Err(Error::http(500).with_context("attempt", n)) }),
            options(3),
            FetchMode::Dedupe,
        );
        let err = handle.await.unwrap_err();
        assert_eq!(err.http_status(), Some(500));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4), "{elapsed:?}");

        let entry = store.get(&key).unwrap();
        assert_eq!(entry.status(), Status::Error);
        assert_eq!(entry.failure_count(), 3);
        assert_eq!(entry.error().and_then(|e| e.http_status()), Some(500));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_retry_then_success() {
        let store = store::<u64>();
        let key = query_key!["a"];
        let count = Arc::new(AtomicUsize::new(0));

        let handle = store.fetch(
            &key,
            counting(&count, |n| async move {
                match n {
                    1 => Err(Error::network(std::io::Error::other("reset"))),
                    n => Ok(n as u64),
                }
            }),
            options(3),
            FetchMode::Dedupe,
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        let entry = store.get(&key).unwrap();
        assert_eq!(entry.failure_count(), 1);
        assert_eq!(entry.status(), Status::Loading);

        assert_eq!(*handle.await.unwrap(), 2);
        let entry = store.get(&key).unwrap();
        assert_eq!(entry.failure_count(), 0);
        assert!(entry.failure_reason().is_none());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_terminal_error_is_not_retried() {
        let store = store::<u64>();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = store.fetch(
            &query_key!["a"],
            counting(&count, |_| async { Err(Error::new(ErrorKind::Parse, "bad json")) }),
            options(3),
            FetchMode::Dedupe,
        );
        assert_eq!(handle.await.unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_timeout_and_panic() {
        let store = store::<u64>();
        let timeout = FetchOptions {
            timeout: Some(Duration::from_secs(1)),
            ..options(1)
        };
        let err = store
            .fetch(
                &query_key!["slow"],
                fetcher(|_| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(1)
                }),
                timeout,
                FetchMode::Dedupe,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        // A panic is terminal, it is not attempted again.
        let count = Arc::new(AtomicUsize::new(0));
        let err = store
            .fetch(
                &query_key!["panic"],
                counting(&count, |_| explode()),
                options(3),
                FetchMode::Dedupe,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Join);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_removed_while_fetching() {
        let store = store::<u64>();
        let key = query_key!["a"];
        let handle = store.fetch(
            &key,
            fetcher(|_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(1)
            }),
            options(1),
            FetchMode::Dedupe,
        );
        assert!(store.remove(&key));

        // The waiter still gets the result, the store does not.
        assert_eq!(*handle.await.unwrap(), 1);
        assert!(store.get(&key).is_none());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_prefetched_entry_is_evicted() {
        let store = store::<u64>();
        let key = query_key!["posts", 2];
        let options = FetchOptions {
            cache_time: Duration::from_secs(60),
            ..options(1)
        };
        store.fetch(&key, fetcher(|_| async { Ok(2) }), options, FetchMode::Dedupe).await.unwrap();

        let entry = store.get(&key).unwrap();
        assert_eq!(entry.subscriber_count(), 0);
        assert!(entry.is_gc_scheduled());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(store.get(&key).is_none());
    }
}
