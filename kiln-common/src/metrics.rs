// Copyright 2026 kiln Project Authors
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

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};

/// Metrics of one artifact cache instance.
///
/// Every metric carries a `name` label with the cache name, so the four caches of a session can share one recorder.
#[derive(Clone)]
pub struct Metrics {
    /* lookup metrics */
    /// Lookups answered with an artifact built for the requested params.
    pub lookup_hit: Counter,
    /// Lookups answered with an artifact built for other params.
    pub lookup_stale: Counter,
    /// Lookups answered without any artifact.
    pub lookup_miss: Counter,
    /// Lookups that blocked on a stripe waiting for a newer generation.
    pub lookup_wait: Counter,

    /* node metrics */
    /// Nodes created in the slot table.
    pub node_insert: Counter,
    /// Nodes reclaimed by the evictor.
    pub node_evict: Counter,
    /// Nodes currently linked in the slot table.
    pub node_count: Gauge,

    /* request metrics */
    /// Build requests accepted by the request queue.
    pub request_enqueue: Counter,
    /// Build requests rejected because the queue stayed full until the deadline.
    pub request_reject: Counter,
    /// Submissions folded into a pending bucket by the wrap guard.
    pub submit_coalesce: Counter,

    /* build metrics */
    /// Finished builds whose result got published.
    pub build_publish: Counter,
    /// Builds abandoned in favor of a newer submission.
    pub build_discard: Counter,
    /// Builds that panicked and published an empty artifact instead.
    pub build_panic: Counter,
    /// Build duration in seconds.
    pub build_duration: Histogram,

    /* evictor metrics */
    /// Sweep duration in seconds.
    pub sweep_duration: Histogram,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}

impl Metrics {
    /// Register the metrics of the cache called `name` to the installed recorder.
    pub fn new(name: &str) -> Self {
        let lookup_hit = counter!("kiln_lookup_total", "name" => name.to_string(), "op" => "hit");
        let lookup_stale = counter!("kiln_lookup_total", "name" => name.to_string(), "op" => "stale");
        let lookup_miss = counter!("kiln_lookup_total", "name" => name.to_string(), "op" => "miss");
        let lookup_wait = counter!("kiln_lookup_total", "name" => name.to_string(), "op" => "wait");

        let node_insert = counter!("kiln_node_op_total", "name" => name.to_string(), "op" => "insert");
        let node_evict = counter!("kiln_node_op_total", "name" => name.to_string(), "op" => "evict");
        let node_count = gauge!("kiln_node_count", "name" => name.to_string());

        let request_enqueue = counter!("kiln_request_total", "name" => name.to_string(), "op" => "enqueue");
        let request_reject = counter!("kiln_request_total", "name" => name.to_string(), "op" => "reject");
        let submit_coalesce = counter!("kiln_request_total", "name" => name.to_string(), "op" => "coalesce");

        let build_publish = counter!("kiln_build_total", "name" => name.to_string(), "op" => "publish");
        let build_discard = counter!("kiln_build_total", "name" => name.to_string(), "op" => "discard");
        let build_panic = counter!("kiln_build_total", "name" => name.to_string(), "op" => "panic");
        let build_duration = histogram!("kiln_build_duration", "name" => name.to_string());

        let sweep_duration = histogram!("kiln_sweep_duration", "name" => name.to_string());

        Self {
            lookup_hit,
            lookup_stale,
            lookup_miss,
            lookup_wait,
            node_insert,
            node_evict,
            node_count,
            request_enqueue,
            request_reject,
            submit_coalesce,
            build_publish,
            build_discard,
            build_panic,
            build_duration,
            sweep_duration,
        }
    }

    /// Metrics that record nothing, for tests and embedders without a recorder.
    pub fn noop() -> Self {
        Self {
            lookup_hit: Counter::noop(),
            lookup_stale: Counter::noop(),
            lookup_miss: Counter::noop(),
            lookup_wait: Counter::noop(),
            node_insert: Counter::noop(),
            node_evict: Counter::noop(),
            node_count: Gauge::noop(),
            request_enqueue: Counter::noop(),
            request_reject: Counter::noop(),
            submit_coalesce: Counter::noop(),
            build_publish: Counter::noop(),
            build_discard: Counter::noop(),
            build_panic: Counter::noop(),
            build_duration: Histogram::noop(),
            sweep_duration: Histogram::noop(),
        }
    }
}
