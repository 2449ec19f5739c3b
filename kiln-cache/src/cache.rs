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

use std::{
    fmt::Debug,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use flume::Sender;
use kiln_common::{
    clock::Clock,
    hasher::{DefaultHashBuilder, HashBuilder},
    metrics::Metrics,
};

use crate::{
    config::{CacheConfig, Routing},
    domain::Domain,
    error::{Error, Result},
    evictor::Evictor,
    node::{CacheNode, Submission},
    queue::RequestQueue,
    scope::{Scope, Touch},
    table::SlotTable,
    worker::BuildWorker,
};

/// State shared between the cache handle and its background threads.
pub(crate) struct CacheInner<D, S>
where
    D: Domain,
    S: HashBuilder,
{
    pub(crate) domain: D,
    pub(crate) table: SlotTable<D>,
    pub(crate) clock: Clock,
    pub(crate) hash_builder: S,
    pub(crate) config: CacheConfig,
    pub(crate) metrics: Metrics,
    pub(crate) default_params_hash: u64,
}

impl<D, S> CacheInner<D, S>
where
    D: Domain,
    S: HashBuilder,
{
    /// Resolve and pin the node of `key`, creating it on a miss.
    ///
    /// The evictor never unlinks a pinned node, so submissions made through the returned touch always land on a
    /// linked node.
    pub(crate) fn touch(&self, key: &D::Key, hash: u64) -> Touch<D> {
        let (node, inserted) = self
            .table
            .get_or_insert(key, hash, self.clock.now_us(), self.clock.user_clock(), true);
        if inserted {
            self.metrics.node_insert.increment(1);
            self.metrics.node_count.increment(1.0);
        }
        Touch::new(node)
    }

    pub(crate) fn sweep(&self) -> usize {
        let start = Instant::now();
        let now_us = self.clock.now_us();
        let user_clock = self.clock.user_clock();
        let after_us = u64::try_from(self.config.evict_after.as_micros()).unwrap_or(u64::MAX);
        let after_user_clocks = self.config.evict_after_user_clocks;

        let garbage = self
            .table
            .sweep(|node| node.is_evictable(now_us, user_clock, after_us, after_user_clocks));
        let evicted = garbage.len();
        // Artifacts are released here, outside of every stripe lock.
        drop(garbage);

        if evicted > 0 {
            self.metrics.node_evict.increment(evicted as u64);
            self.metrics.node_count.decrement(evicted as f64);
            tracing::debug!(
                "[evictor]: {} evicted {} nodes, {} left",
                self.config.name,
                evicted,
                self.table.len()
            );
        }
        self.metrics.sweep_duration.record(start.elapsed());
        evicted
    }
}

/// A concurrent cache of artifacts built on background threads.
///
/// Foreground threads read through a [`Scope`]. A lookup whose key is missing, or whose params differ from those
/// of the last published build, submits the params and queues a build request. A pool of builder threads runs
/// [`Domain::build`] and publishes the result. An evictor thread reclaims nodes that are neither pinned nor
/// recently touched.
///
/// Dropping the cache closes the request queues and joins every background thread. Builds already running finish
/// first.
pub struct ArtifactCache<D, S = DefaultHashBuilder>
where
    D: Domain,
    S: HashBuilder,
{
    inner: Arc<CacheInner<D, S>>,
    queue: RequestQueue<D::Key>,
    builders: Vec<JoinHandle<()>>,
    evictor: Option<(Sender<()>, JoinHandle<()>)>,
}

impl<D, S> Debug for ArtifactCache<D, S>
where
    D: Domain,
    S: HashBuilder,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("name", &self.inner.config.name)
            .field("slots", &self.slots())
            .field("stripes", &self.stripes())
            .field("builders", &self.builders.len())
            .field("len", &self.len())
            .finish()
    }
}

impl<D, S> Drop for ArtifactCache<D, S>
where
    D: Domain,
    S: HashBuilder,
{
    fn drop(&mut self) {
        self.queue.close();
        let evictor = self.evictor.take().map(|(tx, handle)| {
            drop(tx);
            handle
        });
        for handle in self.builders.drain(..).chain(evictor) {
            let name = handle.thread().name().unwrap_or("kiln").to_string();
            if handle.join().is_err() {
                tracing::warn!("[cache]: thread {name} panicked");
            }
        }
        tracing::debug!("[cache]: {} shut down", self.inner.config.name);
    }
}

impl<D, S> ArtifactCache<D, S>
where
    D: Domain,
    S: HashBuilder,
{
    /// Open a scope to read artifacts through.
    ///
    /// Every node looked up through the scope stays pinned until the scope is closed or dropped.
    pub fn open_scope(&self) -> Scope<'_, D, S> {
        Scope::new(self)
    }

    /// Queue a build of `key` without waiting for the result.
    ///
    /// The build uses the newest params submitted for the key, or `Default` params if none were. Waits at most until
    /// `deadline_us` for room in the queue. Returns `false` if the queue stayed full.
    pub fn enqueue_build_request(&self, key: &D::Key, deadline_us: u64) -> bool {
        let hash = self.hash_key(key);
        let touch = self.inner.touch(key, hash);
        let node = touch.node();
        let gen = node.resubmit(self.inner.default_params_hash).gen();
        let enqueued = self.queue.enqueue(key.clone(), hash, deadline_us);
        if enqueued {
            node.mark_requested(gen);
            self.inner.metrics.request_enqueue.increment(1);
        } else {
            self.inner.metrics.request_reject.increment(1);
        }
        enqueued
    }

    /// Submit `params` for `key` and queue a build if they are neither published nor already requested.
    ///
    /// Useful to prefetch an artifact before it is looked up. Returns `false` if the queue stayed full until
    /// `deadline_us`.
    pub fn request(&self, key: &D::Key, params: &D::Params, deadline_us: u64) -> bool {
        let hash = self.hash_key(key);
        let params_hash = self.hash_params(params);
        let touch = self.inner.touch(key, hash);
        let node = touch.node();
        if node.published().is_some_and(|p| p.matches(params_hash, params)) {
            return true;
        }
        self.ensure_requested(node, params, params_hash, deadline_us)
    }

    /// Reclaim every evictable node now. Returns the number of nodes reclaimed.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Returns `true` if a node for `key` is linked in the slot table.
    pub fn contains(&self, key: &D::Key) -> bool {
        self.inner.table.get(key, self.hash_key(key)).is_some()
    }

    /// Nodes currently linked in the slot table.
    pub fn len(&self) -> usize {
        self.inner.table.len()
    }

    /// Returns `true` if no node is linked in the slot table.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock stripes.
    pub fn stripes(&self) -> usize {
        self.inner.table.stripes()
    }

    /// Hash slots.
    pub fn slots(&self) -> usize {
        self.inner.table.slots()
    }

    /// The clock pair driving deadlines and eviction.
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    /// Absolute deadline `timeout` from now, for [`Scope::lookup`] and the request methods.
    pub fn deadline_after(&self, timeout: Duration) -> u64 {
        self.inner.clock.deadline_after(timeout)
    }

    /// Metrics of the cache.
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Configuration the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The domain the cache builds artifacts with.
    pub fn domain(&self) -> &D {
        &self.inner.domain
    }

    pub(crate) fn inner(&self) -> &CacheInner<D, S> {
        &self.inner
    }

    pub(crate) fn hash_key(&self, key: &D::Key) -> u64 {
        self.inner.hash_builder.hash_one(key)
    }

    pub(crate) fn hash_params(&self, params: &D::Params) -> u64 {
        self.inner.hash_builder.hash_one(params)
    }

    /// Submit `params` to `node` and queue a build request for the resulting generation unless one is queued.
    pub(crate) fn ensure_requested(
        &self,
        node: &CacheNode<D>,
        params: &D::Params,
        params_hash: u64,
        deadline_us: u64,
    ) -> bool {
        let submission = node.submit(params, params_hash);
        if let Submission::Coalesced(gen) = submission {
            tracing::trace!("[cache]: coalesce submission of {:?} into gen {gen}", node.key());
            self.inner.metrics.submit_coalesce.increment(1);
        }
        let gen = submission.gen();
        if !node.needs_request(gen) {
            return true;
        }
        let enqueued = self.queue.enqueue(node.key().clone(), node.hash(), deadline_us);
        if enqueued {
            node.mark_requested(gen);
            self.inner.metrics.request_enqueue.increment(1);
        } else {
            self.inner.metrics.request_reject.increment(1);
        }
        enqueued
    }
}

/// Builder of [`ArtifactCache`].
pub struct ArtifactCacheBuilder<D, S = DefaultHashBuilder>
where
    D: Domain,
    S: HashBuilder,
{
    domain: D,
    config: CacheConfig,
    clock: Option<Clock>,
    metrics: Option<Metrics>,
    hash_builder: S,
}

impl<D> ArtifactCacheBuilder<D>
where
    D: Domain,
{
    /// Create a builder for a cache of `domain` with the default config.
    pub fn new(domain: D) -> Self {
        Self {
            domain,
            config: CacheConfig::default(),
            clock: None,
            metrics: None,
            hash_builder: DefaultHashBuilder::default(),
        }
    }
}

impl<D, S> ArtifactCacheBuilder<D, S>
where
    D: Domain,
    S: HashBuilder,
{
    /// Replace the whole config.
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the cache name, used in thread names, logs and metric labels.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the hash slot count.
    pub fn with_slots(mut self, slots: usize) -> Self {
        self.config.slots = slots;
        self
    }

    /// Set the lock stripe count. Clamped to the slot count.
    pub fn with_stripes(mut self, stripes: usize) -> Self {
        self.config.stripes = Some(stripes);
        self
    }

    /// Set the submission buckets per node.
    ///
    /// More buckets let more distinct params queue up behind a running build before submissions get coalesced.
    pub fn with_buckets(mut self, buckets: usize) -> Self {
        self.config.buckets = buckets;
        self
    }

    /// Set the builder thread count.
    pub fn with_builders(mut self, builders: usize) -> Self {
        self.config.builders = builders;
        self
    }

    /// Set how requests are spread over builders.
    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.config.routing = routing;
        self
    }

    /// Set the capacity of each request queue.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.config.queue_capacity = queue_capacity;
        self
    }

    /// Enable or disable the background evictor. [`ArtifactCache::sweep`] works either way.
    pub fn with_evictor(mut self, evictor: bool) -> Self {
        self.config.evictor = evictor;
        self
    }

    /// Set the pause between two evictor sweeps.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set how long and for how many user clock ticks a node must stay untouched before it may be evicted.
    pub fn with_eviction_threshold(mut self, after: Duration, after_user_clocks: u64) -> Self {
        self.config.evict_after = after;
        self.config.evict_after_user_clocks = after_user_clocks;
        self
    }

    /// Share a clock with other caches.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `metrics` instead of registering a new bundle under the cache name.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the hash builder for keys and params.
    pub fn with_hash_builder<OS>(self, hash_builder: OS) -> ArtifactCacheBuilder<D, OS>
    where
        OS: HashBuilder,
    {
        ArtifactCacheBuilder {
            domain: self.domain,
            config: self.config,
            clock: self.clock,
            metrics: self.metrics,
            hash_builder,
        }
    }

    /// Validate the config and spawn the background threads.
    pub fn build(self) -> Result<ArtifactCache<D, S>> {
        self.config.validate()?;

        let config = self.config;
        let clock = self.clock.unwrap_or_default();
        let metrics = self.metrics.unwrap_or_else(|| Metrics::new(&config.name));
        let default_params_hash = self.hash_builder.hash_one(D::Params::default());
        let table = SlotTable::new(config.slots, config.stripe_count(), config.buckets);
        let (queue, receivers) = RequestQueue::new(config.routing, config.builders, config.queue_capacity, clock.clone());

        let inner = Arc::new(CacheInner {
            domain: self.domain,
            table,
            clock,
            hash_builder: self.hash_builder,
            config,
            metrics,
            default_params_hash,
        });

        // On a spawn failure the partially built cache is dropped, which joins the threads spawned so far.
        let mut cache = ArtifactCache {
            inner,
            queue,
            builders: Vec::with_capacity(receivers.len()),
            evictor: None,
        };

        for (id, rx) in receivers.into_iter().enumerate() {
            let worker = BuildWorker {
                id,
                inner: cache.inner.clone(),
                rx,
            };
            let handle = spawn(format!("kiln-{}-builder-{id}", cache.inner.config.name), move || worker.run())?;
            cache.builders.push(handle);
        }

        if cache.inner.config.evictor {
            let (tx, rx) = flume::bounded(1);
            let evictor = Evictor {
                inner: cache.inner.clone(),
                interval: cache.inner.config.sweep_interval,
                shutdown: rx,
            };
            let handle = spawn(format!("kiln-{}-evictor", cache.inner.config.name), move || evictor.run())?;
            cache.evictor = Some((tx, handle));
        }

        tracing::debug!(
            "[cache]: {} built with {} slots, {} stripes, {} builders",
            cache.inner.config.name,
            cache.slots(),
            cache.stripes(),
            cache.builders.len()
        );
        Ok(cache)
    }
}

fn spawn(name: String, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| Error::Spawn { name, source })
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::{Duration, Instant},
    };

    use kiln_common::{clock::NEVER, hasher::ModHasher};
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;
    use crate::{
        scope::Pinned,
        test_utils::{Echo, EchoDomain},
    };

    fn builder(domain: EchoDomain) -> ArtifactCacheBuilder<EchoDomain, ModHasher> {
        ArtifactCacheBuilder::new(domain)
            .with_name("test")
            .with_slots(16)
            .with_stripes(4)
            .with_builders(2)
            .with_evictor(false)
            .with_metrics(Metrics::noop())
            .with_hash_builder(ModHasher::default())
    }

    fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        f()
    }

    fn echo(key: u64, params: &str) -> Echo {
        Echo {
            key,
            params: params.to_string(),
        }
    }

    #[test]
    fn test_send_sync_static() {
        fn is_send_sync_static<T: Send + Sync + 'static>() {}
        is_send_sync_static::<ArtifactCache<EchoDomain>>();
        is_send_sync_static::<ArtifactCache<EchoDomain, ModHasher>>();
    }

    #[test]
    fn test_invalid_config() {
        let res = builder(EchoDomain::new()).with_buckets(1).build();
        assert!(matches!(res, Err(Error::ConfigError(_))));
        let res = builder(EchoDomain::new()).with_queue_capacity(0).build();
        assert!(matches!(res, Err(Error::ConfigError(_))));
    }

    #[test_log::test]
    fn test_miss_then_ready() {
        let domain = EchoDomain::new();
        let cache = builder(domain.clone()).build().unwrap();
        assert_eq!(cache.slots(), 16);
        assert_eq!(cache.stripes(), 4);

        let scope = cache.open_scope();
        let lookup = scope.lookup(&1, &"a".to_string(), NEVER);
        assert!(!lookup.stale);
        assert_eq!(lookup.gen, 1);
        assert_eq!(**lookup.fresh().unwrap(), echo(1, "a"));
        assert_eq!(scope.touches(), 1);
        drop(lookup);
        scope.close();

        assert_eq!(domain.builds(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&1));
    }

    #[test_log::test]
    fn test_expired_deadline_returns_immediately() {
        let domain = EchoDomain::new();
        domain.gate().close();
        let cache = builder(domain.clone()).build().unwrap();

        {
            let scope = cache.open_scope();
            let start = Instant::now();
            let lookup = scope.lookup(&1, &"a".to_string(), cache.clock().now_us());
            assert!(start.elapsed() < Duration::from_millis(100));
            assert!(lookup.stale);
            assert!(lookup.artifact.is_none());
            assert_eq!(lookup.gen, 0);

            // A short deadline waits, then gives up.
            let start = Instant::now();
            let lookup = scope.lookup(&1, &"a".to_string(), cache.deadline_after(Duration::from_millis(20)));
            assert!(start.elapsed() >= Duration::from_millis(15));
            assert!(lookup.artifact.is_none());
        }

        domain.gate().open();
        let scope = cache.open_scope();
        let lookup = scope.lookup(&1, &"a".to_string(), NEVER);
        assert_eq!(*lookup.artifact.unwrap(), echo(1, "a"));
        assert_eq!(domain.builds(), 1);
    }

    #[test_log::test]
    fn test_idempotent_lookup() {
        let domain = EchoDomain::new();
        let cache = builder(domain.clone()).build().unwrap();

        {
            let scope = cache.open_scope();
            let first = scope.lookup(&3, &"a".to_string(), NEVER).artifact.unwrap();
            let second = scope.lookup(&3, &"a".to_string(), NEVER).artifact.unwrap();
            assert!(Pinned::ptr_eq(&first, &second));
        }

        let scope = cache.open_scope();
        let third = scope.lookup(&3, &"a".to_string(), 0).artifact.unwrap();
        assert_eq!(*third, echo(3, "a"));
        assert_eq!(domain.builds(), 1);
    }

    #[test_log::test]
    fn test_stale_until_rebuilt() {
        let domain = EchoDomain::new();
        let cache = builder(domain.clone()).build().unwrap();

        let scope = cache.open_scope();
        let a = scope.lookup(&1, &"a".to_string(), NEVER).artifact.unwrap();
        assert_eq!(*a, echo(1, "a"));

        domain.gate().close();
        let lookup = scope.lookup(&1, &"b".to_string(), cache.clock().now_us());
        assert!(lookup.stale);
        assert!(lookup.fresh().is_none());
        assert_eq!(lookup.gen, 1);
        assert_eq!(*lookup.artifact.unwrap(), echo(1, "a"));

        domain.gate().open();
        let lookup = scope.lookup(&1, &"b".to_string(), NEVER);
        assert!(!lookup.stale);
        assert_eq!(lookup.gen, 2);
        assert_eq!(*lookup.artifact.unwrap(), echo(1, "b"));

        // Pinned references keep the artifact they were issued for.
        assert_eq!(*a, echo(1, "a"));
        assert_eq!(domain.builds(), 2);
    }

    #[test_log::test]
    fn test_backpressure() {
        let domain = EchoDomain::new();
        domain.gate().close();
        let cache = builder(domain.clone())
            .with_builders(1)
            .with_queue_capacity(1)
            .build()
            .unwrap();

        // Occupy the only builder, then fill the queue.
        assert!(cache.request(&1, &"a".to_string(), NEVER));
        assert!(wait_until(Duration::from_secs(5), || domain.started() == 1));
        assert!(cache.request(&2, &"a".to_string(), NEVER));

        let start = Instant::now();
        assert!(!cache.enqueue_build_request(&3, cache.clock().now_us()));
        assert!(!cache.request(&4, &"a".to_string(), cache.clock().now_us()));
        assert!(start.elapsed() < Duration::from_millis(100));

        // Lookups still answer while the queue is full.
        {
            let scope = cache.open_scope();
            let lookup = scope.lookup(&4, &"a".to_string(), cache.clock().now_us());
            assert!(lookup.stale);
            assert!(lookup.artifact.is_none());
        }

        domain.gate().open();
        let scope = cache.open_scope();
        // The rejected request is retried by the lookup.
        assert_eq!(*scope.lookup(&4, &"a".to_string(), NEVER).artifact.unwrap(), echo(4, "a"));
        assert_eq!(*scope.lookup(&2, &"a".to_string(), NEVER).artifact.unwrap(), echo(2, "a"));
    }

    #[test_log::test]
    fn test_sweep_evicts_idle_nodes() {
        let domain = EchoDomain::new();
        let cache = builder(domain.clone())
            .with_eviction_threshold(Duration::ZERO, 0)
            .build()
            .unwrap();

        let scope = cache.open_scope();
        for key in 0..4 {
            scope.lookup(&key, &"a".to_string(), NEVER);
        }
        cache.clock().advance_user_clock();
        thread::sleep(Duration::from_millis(2));
        // Everything is pinned.
        assert_eq!(cache.sweep(), 0);
        scope.close();

        // Built but never touched after its build, and not built at all.
        assert!(cache.request(&10, &"a".to_string(), NEVER));
        assert!(wait_until(Duration::from_secs(5), || domain.builds() == 5));
        domain.gate().close();
        assert!(cache.request(&11, &"a".to_string(), NEVER));

        cache.clock().advance_user_clock();
        thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.sweep(), 5);
        assert_eq!(cache.len(), 1);
        assert!(!cache.contains(&0));
        assert!(cache.contains(&11));
        domain.gate().open();

        let scope = cache.open_scope();
        let lookup = scope.lookup(&0, &"a".to_string(), NEVER);
        assert_eq!(lookup.gen, 1);
        assert_eq!(*lookup.artifact.unwrap(), echo(0, "a"));
        assert_eq!(domain.log().iter().filter(|(k, _)| *k == 0).count(), 2);
    }

    #[test_log::test]
    fn test_leftover_request_of_evicted_node_is_dropped() {
        let domain = EchoDomain::new();
        let cache = builder(domain.clone())
            .with_builders(1)
            .with_eviction_threshold(Duration::ZERO, 0)
            .build()
            .unwrap();

        domain.gate().close();
        assert!(cache.request(&1, &"a".to_string(), NEVER));
        assert!(wait_until(Duration::from_secs(5), || domain.started() == 1));
        // The drain loop of key 1 builds "b" right after "a", so the request queued for "b" is left behind the slow
        // build of key 2.
        assert!(cache.request(&2, &"coop".to_string(), NEVER));
        assert!(cache.request(&1, &"b".to_string(), NEVER));
        domain.gate().open();
        assert!(wait_until(Duration::from_secs(5), || domain.started() == 3));
        assert_eq!(domain.log(), vec![(1, "a".to_string()), (1, "b".to_string())]);

        cache.clock().advance_user_clock();
        thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.sweep(), 1);
        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));

        // Release the slow build, then queue a marker behind the leftover request.
        assert!(cache.request(&2, &"y".to_string(), NEVER));
        assert!(cache.request(&3, &"z".to_string(), NEVER));
        assert!(wait_until(Duration::from_secs(5), || domain.log().contains(&(3, "z".to_string()))));

        assert!(!cache.contains(&1));
        assert_eq!(cache.len(), 2);
        let key1 = domain.log().into_iter().filter(|(k, _)| *k == 1).collect::<Vec<_>>();
        assert_eq!(key1, vec![(1, "a".to_string()), (1, "b".to_string())]);

        // Requests only pin while submitting.
        for key in [2, 3] {
            let node = cache.inner().table.get(&key, cache.hash_key(&key)).unwrap();
            assert_eq!(node.pins(), 0);
        }

        let scope = cache.open_scope();
        let lookup = scope.lookup(&1, &"b".to_string(), NEVER);
        assert_eq!(lookup.gen, 1);
        assert_eq!(*lookup.artifact.unwrap(), echo(1, "b"));
    }

    #[test_log::test]
    fn test_eviction_thresholds() {
        let domain = EchoDomain::new();
        let cache = builder(domain.clone())
            .with_eviction_threshold(Duration::ZERO, 3)
            .build()
            .unwrap();

        cache.open_scope().lookup(&1, &"a".to_string(), NEVER);
        thread::sleep(Duration::from_millis(2));
        cache.clock().advance_user_clock_by(3);
        assert_eq!(cache.sweep(), 0);
        cache.clock().advance_user_clock();
        assert_eq!(cache.sweep(), 1);
    }

    #[test_log::test]
    fn test_pinned_nodes_survive_concurrent_evictor() {
        let domain = EchoDomain::new();
        let cache = Arc::new(
            builder(domain.clone())
                .with_evictor(true)
                .with_sweep_interval(Duration::from_millis(1))
                .with_eviction_threshold(Duration::ZERO, 0)
                .build()
                .unwrap(),
        );

        let handles = (0..4u64)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(t);
                    for _ in 0..50 {
                        let scope = cache.open_scope();
                        let keys = (0..4).map(|_| rng.random_range(0..32u64)).collect::<Vec<_>>();
                        let artifacts = keys
                            .iter()
                            .map(|key| scope.lookup(key, &"a".to_string(), NEVER).artifact.unwrap())
                            .collect::<Vec<_>>();
                        cache.clock().advance_user_clock();
                        thread::sleep(Duration::from_micros(200));
                        for (key, artifact) in keys.iter().zip(artifacts.iter()) {
                            assert!(cache.contains(key));
                            assert_eq!(artifact.key, *key);
                        }
                        drop(artifacts);
                        scope.close();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        // Stale requests may still recreate nodes, so keep the user clock moving.
        assert!(wait_until(Duration::from_secs(5), || {
            cache.clock().advance_user_clock();
            cache.is_empty()
        }));
    }

    #[test_log::test]
    fn test_concurrent_lookups_build_once() {
        let domain = EchoDomain::new();
        domain.set_delay(Duration::from_millis(10));
        let cache = Arc::new(builder(domain.clone()).with_builders(4).build().unwrap());
        let barrier = Arc::new(Barrier::new(8));

        let handles = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let scope = cache.open_scope();
                    let lookup = scope.lookup(&7, &"x".to_string(), NEVER);
                    let echo = lookup.artifact.as_deref().cloned().unwrap();
                    (lookup.gen, echo)
                })
            })
            .collect::<Vec<_>>();
        let results = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();

        assert!(results.iter().all(|(gen, echo)| *gen == 1 && echo.params == "x"));
        assert_eq!(domain.builds(), 1);
    }

    #[test_log::test]
    fn test_supersession_converges_on_last_params() {
        let domain = EchoDomain::new();
        domain.set_delay(Duration::from_millis(20));
        let cache = builder(domain.clone()).build().unwrap();

        let scope = cache.open_scope();
        for params in ["a", "ab", "abc"] {
            scope.lookup(&1, &params.to_string(), 0);
        }
        let lookup = scope.lookup(&1, &"abc".to_string(), NEVER);
        assert!(!lookup.stale);
        assert_eq!(*lookup.artifact.unwrap(), echo(1, "abc"));

        let log = domain.log();
        assert!(log.len() <= 3);
        assert_eq!(log.last().unwrap(), &(1, "abc".to_string()));
    }

    #[test_log::test]
    fn test_generation_is_monotonic() {
        let domain = EchoDomain::new();
        let cache = Arc::new(builder(domain.clone()).build().unwrap());

        let reader = {
            let cache = cache.clone();
            thread::spawn(move || {
                let mut gens = vec![];
                let start = Instant::now();
                while start.elapsed() < Duration::from_millis(200) {
                    let scope = cache.open_scope();
                    gens.push(scope.lookup(&1, &"r".to_string(), 0).gen);
                }
                gens
            })
        };

        for i in 0..100 {
            cache.request(&1, &i.to_string(), NEVER);
            thread::sleep(Duration::from_micros(500));
        }

        let gens = reader.join().unwrap();
        assert!(gens.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test_log::test]
    fn test_panicking_build_publishes_default() {
        let domain = EchoDomain::new();
        let cache = builder(domain.clone()).build().unwrap();

        let scope = cache.open_scope();
        let lookup = scope.lookup(&1, &"panic".to_string(), NEVER);
        assert!(!lookup.stale);
        assert_eq!(*lookup.artifact.unwrap(), Echo::default());

        // The builder survives.
        let lookup = scope.lookup(&1, &"ok".to_string(), NEVER);
        assert_eq!(*lookup.artifact.unwrap(), echo(1, "ok"));
    }

    #[test_log::test]
    fn test_submissions_coalesce_behind_running_build() {
        let domain = EchoDomain::new();
        domain.gate().close();
        let cache = builder(domain.clone()).with_buckets(2).with_builders(1).build().unwrap();

        assert!(cache.request(&1, &"a".to_string(), NEVER));
        assert!(wait_until(Duration::from_secs(5), || domain.started() == 1));
        for params in ["b", "c", "d"] {
            assert!(cache.request(&1, &params.to_string(), NEVER));
        }
        domain.gate().open();

        let scope = cache.open_scope();
        let lookup = scope.lookup(&1, &"d".to_string(), NEVER);
        assert_eq!(lookup.gen, 2);
        assert_eq!(*lookup.artifact.unwrap(), echo(1, "d"));
        assert_eq!(domain.log(), vec![(1, "a".to_string()), (1, "d".to_string())]);
    }

    #[test_log::test]
    fn test_superseded_build_is_discarded() {
        let domain = EchoDomain::new();
        let cache = builder(domain.clone()).build().unwrap();

        assert!(cache.request(&1, &"coop".to_string(), NEVER));
        assert!(wait_until(Duration::from_secs(5), || domain.started() == 1));
        assert!(cache.request(&1, &"b".to_string(), NEVER));

        let scope = cache.open_scope();
        let lookup = scope.lookup(&1, &"b".to_string(), NEVER);
        assert_eq!(lookup.gen, 2);
        assert_eq!(*lookup.artifact.unwrap(), echo(1, "b"));

        // The abandoned build returned but never got published.
        assert_eq!(domain.builds(), 2);
        assert_eq!(*scope.peek(&1).unwrap(), echo(1, "b"));
    }

    #[test_log::test]
    fn test_enqueue_build_request_rebuilds() {
        let domain = EchoDomain::new();
        let cache = builder(domain.clone()).build().unwrap();

        // Without any submitted params the build uses the default ones.
        assert!(cache.enqueue_build_request(&5, NEVER));
        assert!(wait_until(Duration::from_secs(5), || domain.builds() == 1));
        assert_eq!(domain.log(), vec![(5, String::new())]);

        let scope = cache.open_scope();
        assert_eq!(scope.lookup(&5, &"x".to_string(), NEVER).gen, 2);
        assert!(cache.enqueue_build_request(&5, NEVER));
        assert!(wait_until(Duration::from_secs(5), || {
            let scope = cache.open_scope();
            let lookup = scope.lookup(&5, &"x".to_string(), 0);
            !lookup.stale && lookup.gen == 3
        }));
        assert_eq!(domain.log().last().unwrap(), &(5, "x".to_string()));
    }

    #[test_log::test]
    fn test_peek() {
        let domain = EchoDomain::new();
        let cache = builder(domain.clone()).build().unwrap();

        let scope = cache.open_scope();
        assert!(scope.peek(&1).is_none());
        assert!(!cache.contains(&1));

        scope.lookup(&1, &"a".to_string(), NEVER);
        let peeked = scope.peek(&1).unwrap();
        assert_eq!(*peeked, echo(1, "a"));
        assert_eq!(scope.touches(), 2);
    }

    #[test_log::test]
    fn test_affinity_routing() {
        let domain = EchoDomain::new();
        let cache = builder(domain.clone())
            .with_builders(3)
            .with_routing(Routing::Affinity)
            .build()
            .unwrap();

        for key in 0..32 {
            assert!(cache.request(&key, &"a".to_string(), NEVER));
        }
        let scope = cache.open_scope();
        for key in 0..32 {
            assert_eq!(*scope.lookup(&key, &"a".to_string(), NEVER).artifact.unwrap(), echo(key, "a"));
        }
        assert_eq!(domain.builds(), 32);
    }
}
