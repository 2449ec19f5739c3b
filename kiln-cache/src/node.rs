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
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use kiln_common::{strict_assert, strict_assert_eq};
use parking_lot::Mutex;

use crate::domain::Domain;

/// A build result as seen by readers.
///
/// Never mutated after publication. A rebuild swaps in a whole new [`Published`].
pub(crate) struct Published<D>
where
    D: Domain,
{
    pub(crate) gen: u64,
    pub(crate) params_hash: u64,
    pub(crate) params: D::Params,
    pub(crate) artifact: Arc<D::Artifact>,
}

impl<D> Published<D>
where
    D: Domain,
{
    pub(crate) fn matches(&self, params_hash: u64, params: &D::Params) -> bool {
        self.params_hash == params_hash && &self.params == params
    }
}

/// Outcome of handing params to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submission {
    /// The params opened a new generation in their own bucket.
    Fresh(u64),
    /// The same params are already pending under this generation.
    Pending(u64),
    /// The ring is full up to the bucket of the active build, so the params replaced those of the newest pending
    /// generation.
    Coalesced(u64),
}

impl Submission {
    pub(crate) fn gen(self) -> u64 {
        match self {
            Submission::Fresh(gen) | Submission::Pending(gen) | Submission::Coalesced(gen) => gen,
        }
    }
}

/// What a builder takes out of the ring before calling into the domain.
#[derive(Debug)]
pub(crate) struct Job<P> {
    pub(crate) gen: u64,
    pub(crate) params_hash: u64,
    pub(crate) params: P,
}

#[derive(Debug)]
struct Bucket<P> {
    gen: u64,
    params_hash: u64,
    params: Option<P>,
}

impl<P> Default for Bucket<P> {
    fn default() -> Self {
        Self {
            gen: 0,
            params_hash: 0,
            params: None,
        }
    }
}

/// Fixed ring of in-flight submissions, indexed by `gen % buckets`.
#[derive(Debug)]
struct SubmitRing<P> {
    buckets: Vec<Bucket<P>>,
    submit_gen: u64,
    /// Generation the active builder is reading, if any.
    building: Option<u64>,
    /// Newest generation a build request has been queued for.
    requested: u64,
}

impl<P> SubmitRing<P>
where
    P: Clone + Eq,
{
    fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets).map(|_| Bucket::default()).collect(),
            submit_gen: 0,
            building: None,
            requested: 0,
        }
    }

    fn bucket(&self, gen: u64) -> &Bucket<P> {
        &self.buckets[(gen % self.buckets.len() as u64) as usize]
    }

    fn bucket_mut(&mut self, gen: u64) -> &mut Bucket<P> {
        let len = self.buckets.len() as u64;
        &mut self.buckets[(gen % len) as usize]
    }

    fn push(&mut self, params: P, params_hash: u64) -> Submission {
        let next = self.submit_gen + 1;
        if let Some(building) = self.building {
            if next - building >= self.buckets.len() as u64 {
                // Rotating further would overwrite the bucket under the active build.
                let latest = self.submit_gen;
                strict_assert!(latest > building);
                let bucket = self.bucket_mut(latest);
                bucket.params_hash = params_hash;
                bucket.params = Some(params);
                return Submission::Coalesced(latest);
            }
        }
        *self.bucket_mut(next) = Bucket {
            gen: next,
            params_hash,
            params: Some(params),
        };
        self.submit_gen = next;
        Submission::Fresh(next)
    }
}

/// Per-key record of the artifact cache.
pub(crate) struct CacheNode<D>
where
    D: Domain,
{
    key: D::Key,
    hash: u64,

    pins: AtomicUsize,
    working: AtomicBool,

    last_touched_us: AtomicU64,
    last_touched_user_clock: AtomicU64,
    load_count: AtomicU64,

    gen: AtomicU64,
    submit_gen: AtomicU64,
    ring: Mutex<SubmitRing<D::Params>>,

    published: ArcSwapOption<Published<D>>,
}

impl<D> Debug for CacheNode<D>
where
    D: Domain,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("key", &self.key)
            .field("hash", &self.hash)
            .field("pins", &self.pins())
            .field("working", &self.is_working())
            .field("gen", &self.gen())
            .field("submit_gen", &self.submit_gen())
            .finish()
    }
}

impl<D> CacheNode<D>
where
    D: Domain,
{
    pub(crate) fn new(key: D::Key, hash: u64, buckets: usize, now_us: u64, user_clock: u64) -> Self {
        Self {
            key,
            hash,
            pins: AtomicUsize::new(0),
            working: AtomicBool::new(false),
            last_touched_us: AtomicU64::new(now_us),
            last_touched_user_clock: AtomicU64::new(user_clock),
            load_count: AtomicU64::new(0),
            gen: AtomicU64::new(0),
            submit_gen: AtomicU64::new(0),
            ring: Mutex::new(SubmitRing::new(buckets)),
            published: ArcSwapOption::empty(),
        }
    }

    pub(crate) fn key(&self) -> &D::Key {
        &self.key
    }

    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }

    pub(crate) fn pins(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    /// Pin the node and stamp both clocks.
    ///
    /// Callers hold the read lock of the node's stripe, which orders the pin before any eviction check.
    pub(crate) fn pin(&self, now_us: u64, user_clock: u64) -> usize {
        let old = self.pins.fetch_add(1, Ordering::SeqCst);
        self.last_touched_us.fetch_max(now_us, Ordering::Relaxed);
        self.last_touched_user_clock.fetch_max(user_clock, Ordering::Relaxed);
        tracing::trace!("[node]: pin node (hash: {}) pins: {} => {}", self.hash, old, old + 1);
        old + 1
    }

    pub(crate) fn unpin(&self) -> usize {
        let old = self.pins.fetch_sub(1, Ordering::SeqCst);
        strict_assert!(old > 0, "unbalanced unpin on node {:?}", self.key);
        tracing::trace!("[node]: unpin node (hash: {}) pins: {} => {}", self.hash, old, old - 1);
        old - 1
    }

    pub(crate) fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    /// Claim the node for a build. At most one builder holds the claim.
    ///
    /// The claim flag and `submit_gen` are sequentially consistent: a builder losing the claim after a submission
    /// and the holder releasing it and then checking [`CacheNode::has_pending`] cannot both miss each other.
    pub(crate) fn try_claim(&self) -> bool {
        self.working
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release_claim(&self) {
        let was = self.working.swap(false, Ordering::SeqCst);
        strict_assert!(was, "release of an unclaimed node {:?}", self.key);
    }

    pub(crate) fn gen(&self) -> u64 {
        self.gen.load(Ordering::Acquire)
    }

    pub(crate) fn submit_gen(&self) -> u64 {
        self.submit_gen.load(Ordering::Acquire)
    }

    pub(crate) fn submit_gen_ref(&self) -> &AtomicU64 {
        &self.submit_gen
    }

    pub(crate) fn load_count(&self) -> u64 {
        self.load_count.load(Ordering::Acquire)
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.submit_gen.load(Ordering::SeqCst) > self.gen.load(Ordering::SeqCst)
    }

    pub(crate) fn published(&self) -> Option<Arc<Published<D>>> {
        self.published.load_full()
    }

    /// Hand `params` to the node, opening a new generation unless the same params are already pending.
    pub(crate) fn submit(&self, params: &D::Params, params_hash: u64) -> Submission {
        let mut ring = self.ring.lock();
        let latest = ring.submit_gen;
        if latest > self.gen() {
            let bucket = ring.bucket(latest);
            if bucket.params_hash == params_hash && bucket.params.as_ref() == Some(params) {
                return Submission::Pending(latest);
            }
        }
        let submission = ring.push(params.clone(), params_hash);
        self.submit_gen.store(ring.submit_gen, Ordering::SeqCst);
        submission
    }

    /// Open a new generation with the newest submitted params, or with `Default` params if none were submitted.
    ///
    /// Does nothing if a submission is already pending.
    pub(crate) fn resubmit(&self, default_params_hash: u64) -> Submission {
        let mut ring = self.ring.lock();
        let latest = ring.submit_gen;
        if latest > self.gen() {
            return Submission::Pending(latest);
        }
        let bucket = ring.bucket(latest);
        let (params, params_hash) = match bucket.params.as_ref() {
            Some(params) if latest > 0 => (params.clone(), bucket.params_hash),
            _ => (D::Params::default(), default_params_hash),
        };
        let submission = ring.push(params, params_hash);
        self.submit_gen.store(ring.submit_gen, Ordering::SeqCst);
        submission
    }

    pub(crate) fn needs_request(&self, gen: u64) -> bool {
        self.ring.lock().requested < gen
    }

    pub(crate) fn mark_requested(&self, gen: u64) {
        let mut ring = self.ring.lock();
        ring.requested = ring.requested.max(gen);
    }

    /// Take the newest pending submission for building. Requires the claim.
    pub(crate) fn begin_build(&self) -> Option<Job<D::Params>> {
        strict_assert!(self.is_working());
        let mut ring = self.ring.lock();
        let latest = ring.submit_gen;
        if latest <= self.gen() {
            return None;
        }
        let bucket = ring.bucket(latest);
        strict_assert_eq!(bucket.gen, latest);
        let params = bucket.params.clone()?;
        let job = Job {
            gen: latest,
            params_hash: bucket.params_hash,
            params,
        };
        ring.building = Some(latest);
        Some(job)
    }

    pub(crate) fn end_build(&self) {
        self.ring.lock().building = None;
    }

    /// Make `published` visible to readers. Requires the write lock of the node's stripe.
    pub(crate) fn publish(&self, published: Published<D>) -> bool {
        let gen = published.gen;
        let current = self.gen();
        if gen < current {
            tracing::warn!(
                "[node]: drop out-of-order publication (hash: {}), gen: {} < {}",
                self.hash,
                gen,
                current
            );
            return false;
        }
        // Store the artifact before the generation so that a reader who sees the new generation sees the artifact.
        self.published.store(Some(Arc::new(published)));
        self.gen.store(gen, Ordering::Release);
        self.load_count.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub(crate) fn is_evictable(&self, now_us: u64, user_clock: u64, after_us: u64, after_user_clocks: u64) -> bool {
        self.pins() == 0
            && !self.is_working()
            && self.load_count() > 0
            && !self.has_pending()
            && now_us.saturating_sub(self.last_touched_us.load(Ordering::Relaxed)) > after_us
            && user_clock.saturating_sub(self.last_touched_user_clock.load(Ordering::Relaxed)) > after_user_clocks
    }
}
