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

use std::borrow::Cow;

use super::{BoxedCounter, BoxedGauge, BoxedHistogram, RegistryOps};

/// Metrics of a query client.
///
/// The metrics are labeled with the client name, so multiple clients can share one registry.
#[derive(Debug)]
pub struct Metrics {
    /* query metrics */
    /// A fetch is skipped because the cached data is fresh.
    pub query_hit: BoxedCounter,
    /// The cached data is absent or stale and a fetch is requested.
    pub query_miss: BoxedCounter,
    /// A fetch is started.
    pub query_fetch: BoxedCounter,
    /// A fetch request attaches to the in-flight fetch of the same key.
    pub query_dedupe: BoxedCounter,
    /// A failed attempt is scheduled to be retried.
    pub query_retry: BoxedCounter,
    /// A fetch settles with data.
    pub query_success: BoxedCounter,
    /// A fetch settles with an error after exhausting retries.
    pub query_error: BoxedCounter,
    /// An in-flight fetch is superseded by a newer fetch of the same key.
    pub query_cancel: BoxedCounter,
    /// A settled result is dropped because its fetch was superseded or its entry is gone.
    pub query_discard: BoxedCounter,
    /// An entry is marked as invalidated.
    pub query_invalidate: BoxedCounter,
    /// An entry is garbage collected.
    pub query_evict: BoxedCounter,
    /// An entry is removed explicitly.
    pub query_remove: BoxedCounter,

    /// Count of entries held by the stores.
    pub query_entries: BoxedGauge,

    /// Duration of fetches settled with data, retries included.
    pub query_success_duration: BoxedHistogram,
    /// Duration of fetches settled with an error, retries included.
    pub query_error_duration: BoxedHistogram,

    /* mutation metrics */
    /// A mutation is started.
    pub mutation_mutate: BoxedCounter,
    /// A mutation settles with data.
    pub mutation_success: BoxedCounter,
    /// A mutation settles with an error.
    pub mutation_error: BoxedCounter,

    /// Duration of settled mutations.
    pub mutation_duration: BoxedHistogram,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new(name: impl Into<Cow<'static, str>>, registry: &dyn RegistryOps) -> Self {
        let name: Cow<'static, str> = name.into();
        let label = |op: &'static str| [name.clone(), Cow::Borrowed(op)];

        /* query metrics */

        let refetch_query_op_total = registry.register_counter_vec(
            "refetch_query_op_total".into(),
            "refetch query operations".into(),
            &["name", "op"],
        );
        let refetch_query_entries = registry.register_gauge_vec(
            "refetch_query_entries".into(),
            "refetch query cache entries".into(),
            &["name"],
        );
        let refetch_query_fetch_duration = registry.register_histogram_vec(
            "refetch_query_fetch_duration".into(),
            "refetch query fetch durations".into(),
            &["name", "op"],
        );

        let query_hit = refetch_query_op_total.counter(&label("hit"));
        let query_miss = refetch_query_op_total.counter(&label("miss"));
        let query_fetch = refetch_query_op_total.counter(&label("fetch"));
        let query_dedupe = refetch_query_op_total.counter(&label("dedupe"));
        let query_retry = refetch_query_op_total.counter(&label("retry"));
        let query_success = refetch_query_op_total.counter(&label("success"));
        let query_error = refetch_query_op_total.counter(&label("error"));
        let query_cancel = refetch_query_op_total.counter(&label("cancel"));
        let query_discard = refetch_query_op_total.counter(&label("discard"));
        let query_invalidate = refetch_query_op_total.counter(&label("invalidate"));
        let query_evict = refetch_query_op_total.counter(&label("evict"));
        let query_remove = refetch_query_op_total.counter(&label("remove"));

        let query_entries = refetch_query_entries.gauge(&[name.clone()]);

        let query_success_duration = refetch_query_fetch_duration.histogram(&label("success"));
        let query_error_duration = refetch_query_fetch_duration.histogram(&label("error"));

        /* mutation metrics */

        let refetch_mutation_op_total = registry.register_counter_vec(
            "refetch_mutation_op_total".into(),
            "refetch mutation operations".into(),
            &["name", "op"],
        );
        let refetch_mutation_duration = registry.register_histogram_vec(
            "refetch_mutation_duration".into(),
            "refetch mutation durations".into(),
            &["name"],
        );

        let mutation_mutate = refetch_mutation_op_total.counter(&label("mutate"));
        let mutation_success = refetch_mutation_op_total.counter(&label("success"));
        let mutation_error = refetch_mutation_op_total.counter(&label("error"));

        let mutation_duration = refetch_mutation_duration.histogram(&[name.clone()]);

        Self {
            query_hit,
            query_miss,
            query_fetch,
            query_dedupe,
            query_retry,
            query_success,
            query_error,
            query_cancel,
            query_discard,
            query_invalidate,
            query_evict,
            query_remove,
            query_entries,
            query_success_duration,
            query_error_duration,

            mutation_mutate,
            mutation_success,
            mutation_error,
            mutation_duration,
        }
    }

    /// Build noop metrics.
    ///
    /// Note: `noop` is only supposed to be called by other refetch components.
    #[doc(hidden)]
    pub fn noop() -> Self {
        use super::registry::noop::NoopMetricsRegistry;

        Self::new("test", &NoopMetricsRegistry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::registry::noop::NoopMetricsRegistry;

    fn case(registry: &dyn RegistryOps) {
        let _ = Metrics::new("test", registry);
    }

    #[test]
    fn test_metrics_noop() {
        case(&NoopMetricsRegistry);
    }

    #[cfg(feature = "prometheus")]
    #[test]
    fn test_metrics_prometheus() {
        use crate::metrics::registry::prometheus::PrometheusMetricsRegistry;

        let registry = PrometheusMetricsRegistry::new(prometheus::Registry::new());
        case(&registry);
        // Same name on the same registry must not conflict.
        case(&registry);
    }
}
