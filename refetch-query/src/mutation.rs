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
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures_util::{future::BoxFuture, FutureExt};
use refetch_common::{
    code::Value,
    error::{Error, Result},
    metrics::Metrics,
};
use tokio::{sync::watch, time::Instant};

use crate::{entry::Status, executor, key::KeyFilter, options::MutationOptions, store::Store};

/// A side-effecting operation, e.g. a remote update or delete.
pub type MutationFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O>> + Send + Sync>;

/// Wrap a closure as a [`MutationFn`].
pub fn mutation_fn<I, O, F, FU>(f: F) -> MutationFn<I, O>
where
    F: Fn(I) -> FU + Send + Sync + 'static,
    FU: Future<Output = Result<O>> + Send + 'static,
{
    Arc::new(move |input| f(input).boxed())
}

/// Marks cache entries stale after a successful mutation.
pub trait Invalidate: Send + Sync + 'static {
    /// Invalidate the entries the filter selects. Returns the count of invalidated entries.
    fn invalidate(&self, filter: &KeyFilter) -> usize;
}

impl<D> Invalidate for Store<D>
where
    D: Value,
{
    fn invalidate(&self, filter: &KeyFilter) -> usize {
        Store::invalidate(self, filter)
    }
}

/// State of a mutation. Never cached by key.
#[derive(Debug)]
pub struct MutationState<O> {
    /// Status of the last started mutation.
    pub status: Status,
    /// Result of the last successful mutation.
    pub data: Option<Arc<O>>,
    /// Error of the last failed mutation. Present iff the status is [`Status::Error`].
    pub error: Option<Error>,
    /// Count of failed attempts of the last started mutation.
    pub failure_count: u32,
    /// When the last mutation started.
    pub submitted_at: Option<Instant>,
}

impl<O> Default for MutationState<O> {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            data: None,
            error: None,
            failure_count: 0,
            submitted_at: None,
        }
    }
}

impl<O> Clone for MutationState<O> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            failure_count: self.failure_count,
            submitted_at: self.submitted_at,
        }
    }
}

impl<O> MutationState<O> {
    /// Never started, or reset.
    pub fn is_idle(&self) -> bool {
        self.status == Status::Idle
    }

    /// Running.
    pub fn is_loading(&self) -> bool {
        self.status == Status::Loading
    }

    /// The last mutation succeeded.
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// The last mutation failed.
    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Runs a side-effecting operation, tracks its status and invalidates related queries on success.
///
/// Mutations run on the task that awaits [`Mutation::mutate`]. The state reflects the last started mutation, a
/// slower earlier mutation never overwrites it.
pub struct Mutation<I, O> {
    f: MutationFn<I, O>,
    options: MutationOptions,
    invalidators: Vec<Arc<dyn Invalidate>>,
    metrics: Arc<Metrics>,

    tx: watch::Sender<MutationState<O>>,
    rx: watch::Receiver<MutationState<O>>,
    seq: AtomicU64,

    on_success: Option<Callback<O>>,
    on_error: Option<Callback<Error>>,
    on_settled: Option<Callback<Result<Arc<O>>>>,
}

impl<I, O> Debug for Mutation<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation").field("options", &self.options).finish()
    }
}

impl<I, O> Mutation<I, O>
where
    I: Clone + Send + 'static,
    O: Value,
{
    /// Create a mutation. `invalidators` are the stores the entries in [`MutationOptions::invalidates`] live in.
    pub fn new(
        f: MutationFn<I, O>,
        options: MutationOptions,
        invalidators: Vec<Arc<dyn Invalidate>>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        options.validate()?;
        let (tx, rx) = watch::channel(MutationState::default());
        Ok(Self {
            f,
            options,
            invalidators,
            metrics,
            tx,
            rx,
            seq: AtomicU64::new(0),
            on_success: None,
            on_error: None,
            on_settled: None,
        })
    }

    /// Called with the result of each successful mutation.
    pub fn with_on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&O) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Called with the error of each failed mutation.
    pub fn with_on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called with the result of each mutation.
    pub fn with_on_settled<F>(mut self, f: F) -> Self
    where
        F: Fn(&Result<Arc<O>>) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }

    /// Run the mutation.
    ///
    /// On success, every entry selected by [`MutationOptions::invalidates`] is invalidated, which refetches the
    /// observed ones in the background.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "refetch::query::mutation::mutate"))]
    pub async fn mutate(&self, input: I) -> Result<Arc<O>> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let start = Instant::now();
        self.tx.send_modify(|state| {
            state.status = Status::Loading;
            state.error = None;
            state.failure_count = 0;
            state.submitted_at = Some(start);
        });
        self.metrics.mutation_mutate.increase(1);

        let f = self.f.clone();
        let (res, failures) = executor::retry(
            move || f(input.clone()),
            self.options.retry,
            self.options.retry_delay,
            self.options.timeout,
            |failures, _| {
                if self.is_latest(seq) {
                    self.tx.send_modify(|state| state.failure_count = failures);
                }
                true
            },
        )
        .await;
        let res = res.map(Arc::new);

        self.metrics.mutation_duration.record(start.elapsed().as_secs_f64());
        match &res {
            Ok(data) => {
                self.metrics.mutation_success.increase(1);
                for filter in self.options.invalidates.iter() {
                    for invalidator in self.invalidators.iter() {
                        invalidator.invalidate(filter);
                    }
                }
                if let Some(f) = self.on_success.as_ref() {
                    f(data);
                }
            }
            Err(e) => {
                self.metrics.mutation_error.increase(1);
                tracing::warn!("[mutation]: mutation {seq} failed after {failures} attempts: {e}");
                if let Some(f) = self.on_error.as_ref() {
                    f(e);
                }
            }
        }
        if let Some(f) = self.on_settled.as_ref() {
            f(&res);
        }

        if self.is_latest(seq) {
            self.tx.send_modify(|state| {
                state.failure_count = failures;
                match &res {
                    Ok(data) => {
                        state.status = Status::Success;
                        state.data = Some(data.clone());
                    }
                    Err(e) => {
                        state.status = Status::Error;
                        state.error = Some(e.clone());
                    }
                }
            });
        } else {
            tracing::debug!("[mutation]: mutation {seq} settled after a newer one started, keep the newer state");
        }

        res
    }

    /// The current state.
    pub fn state(&self) -> MutationState<O> {
        self.rx.borrow().clone()
    }

    /// A receiver of the state changes.
    pub fn subscribe(&self) -> watch::Receiver<MutationState<O>> {
        self.tx.subscribe()
    }

    /// Wait for the next state change.
    pub async fn changed(&mut self) {
        // The sender lives as long as `self`.
        let _ = self.rx.changed().await;
    }

    /// Back to idle. A mutation still running no longer updates the state.
    pub fn reset(&self) {
        self.seq.fetch_add(1, Ordering::SeqCst);
        self.tx.send_replace(MutationState::default());
    }

    fn is_latest(&self, seq: u64) -> bool {
        self.seq.load(Ordering::SeqCst) == seq
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use parking_lot::Mutex;
    use refetch_common::error::ErrorKind;

    use super::*;
    use crate::{
        options::Retry,
        query_key,
        store::tests::store,
    };

    #[derive(Default)]
    struct Recorder {
        filters: Mutex<Vec<KeyFilter>>,
    }

    impl Invalidate for Recorder {
        fn invalidate(&self, filter: &KeyFilter) -> usize {
            self.filters.lock().push(filter.clone());
            1
        }
    }

    fn mutation(
        f: MutationFn<u64, u64>,
        options: MutationOptions,
        invalidator: Arc<dyn Invalidate>,
    ) -> Mutation<u64, u64> {
        Mutation::new(f, options, vec![invalidator], Arc::new(Metrics::noop())).unwrap()
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_success_invalidates() {
        let recorder = Arc::new(Recorder::default());
        let m = mutation(
            mutation_fn(|id: u64| async move { Ok(id * 10) }),
            MutationOptions::default().with_invalidates(query_key!["posts"]),
            recorder.clone(),
        );
        assert!(m.state().is_idle());

        assert_eq!(*m.mutate(1).await.unwrap(), 10);
        let state = m.state();
        assert!(state.is_success());
        assert_eq!(state.data.as_deref(), Some(&10));
        assert_eq!(*recorder.filters.lock(), vec![KeyFilter::Prefix(query_key!["posts"])]);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_error_is_not_retried_by_default() {
        let recorder = Arc::new(Recorder::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let m = {
            let calls = calls.clone();
            mutation(
                mutation_fn(move |_: u64| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<u64, _>(Error::http(500)) }
                }),
                MutationOptions::default().with_invalidates(query_key!["posts"]),
                recorder.clone(),
            )
        };

        let err = m.mutate(1).await.unwrap_err();
        assert_eq!(err.http_status(), Some(500));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let state = m.state();
        assert!(state.is_error());
        assert_eq!(state.error.map(|e| e.kind()), Some(ErrorKind::Http));
        assert!(recorder.filters.lock().is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let m = {
            let calls = calls.clone();
            mutation(
                mutation_fn(move |input: u64| {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        match n {
                            1 => Err(Error::timeout(Duration::from_secs(1))),
                            _ => Ok(input),
                        }
                    }
                }),
                MutationOptions::default().with_retry(Retry::Attempts(2)),
                Arc::new(Recorder::default()),
            )
        };
        assert_eq!(*m.mutate(7).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(m.state().failure_count, 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_latest_mutation_owns_state() {
        let m = Arc::new(mutation(
            mutation_fn(|delay: u64| async move {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                Ok(delay)
            }),
            MutationOptions::default(),
            Arc::new(Recorder::default()),
        ));

        let slow = tokio::spawn({
            let m = m.clone();
            async move { m.mutate(10).await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*m.mutate(1).await.unwrap(), 1);
        assert_eq!(*slow.await.unwrap().unwrap(), 10);

        let state = m.state();
        assert!(state.is_success());
        assert_eq!(state.data.as_deref(), Some(&1));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_callbacks_and_reset() {
        let settled = Arc::new(AtomicUsize::new(0));
        let succeeded = Arc::new(AtomicUsize::new(0));
        let m = mutation(
            mutation_fn(|input: u64| async move { Ok(input) }),
            MutationOptions::default(),
            Arc::new(Recorder::default()),
        )
        .with_on_success({
            let succeeded = succeeded.clone();
            move |_| {
                succeeded.fetch_add(1, Ordering::SeqCst);
            }
        })
        .with_on_settled({
            let settled = settled.clone();
            move |_| {
                settled.fetch_add(1, Ordering::SeqCst);
            }
        });

        m.mutate(1).await.unwrap();
        m.mutate(2).await.unwrap();
        assert_eq!(succeeded.load(Ordering::SeqCst), 2);
        assert_eq!(settled.load(Ordering::SeqCst), 2);

        m.reset();
        assert!(m.state().is_idle());
        assert!(m.state().data.is_none());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_invalidates_store() {
        let store = store::<u64>();
        store.upsert(&query_key!["posts", 1], |entry| entry.set_data(Arc::new(1), Instant::now()));
        store.upsert(&query_key!["postDetail", 1], |entry| entry.set_data(Arc::new(1), Instant::now()));

        let m = mutation(
            mutation_fn(|input: u64| async move { Ok(input) }),
            MutationOptions::default().with_invalidates(query_key!["posts"]),
            Arc::new(store.clone()),
        );
        m.mutate(1).await.unwrap();

        assert!(store.get(&query_key!["posts", 1]).unwrap().is_invalidated());
        assert!(!store.get(&query_key!["postDetail", 1]).unwrap().is_invalidated());
    }
}
