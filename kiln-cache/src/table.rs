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
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::{domain::Domain, node::CacheNode};

/// One lock stripe: the buckets of every slot mapped onto it, the lock guarding them and the condvar readers park on
/// while waiting for a build.
pub(crate) struct Stripe<D>
where
    D: Domain,
{
    buckets: RwLock<Vec<Vec<Arc<CacheNode<D>>>>>,
    gate: Mutex<()>,
    published: Condvar,
}

impl<D> Stripe<D>
where
    D: Domain,
{
    fn new(buckets: usize) -> Self {
        Self {
            buckets: RwLock::new((0..buckets).map(|_| vec![]).collect()),
            gate: Mutex::new(()),
            published: Condvar::new(),
        }
    }
}

/// Hash-bucketed directory of cache nodes, spread over a fixed set of lock stripes.
///
/// `slot = hash % slots`, `stripe = slot % stripes`. A slot is a short unordered bucket scanned linearly.
pub(crate) struct SlotTable<D>
where
    D: Domain,
{
    stripes: Vec<Stripe<D>>,
    slots: usize,
    ring_buckets: usize,
    len: AtomicUsize,
}

impl<D> SlotTable<D>
where
    D: Domain,
{
    pub(crate) fn new(slots: usize, stripes: usize, ring_buckets: usize) -> Self {
        assert!(slots > 0);
        assert!(stripes > 0 && stripes <= slots);
        let stripes = (0..stripes)
            .map(|i| Stripe::new((slots - i).div_ceil(stripes)))
            .collect();
        Self {
            stripes,
            slots,
            ring_buckets,
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn slots(&self) -> usize {
        self.slots
    }

    pub(crate) fn stripes(&self) -> usize {
        self.stripes.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    fn locate(&self, hash: u64) -> (&Stripe<D>, usize) {
        let slot = (hash % self.slots as u64) as usize;
        let stripes = self.stripes.len();
        (&self.stripes[slot % stripes], slot / stripes)
    }

    fn scan<'a>(bucket: &'a [Arc<CacheNode<D>>], key: &D::Key, hash: u64) -> Option<&'a Arc<CacheNode<D>>> {
        bucket.iter().find(|node| node.hash() == hash && node.key() == key)
    }

    /// Find the node of `key` without creating it.
    pub(crate) fn get(&self, key: &D::Key, hash: u64) -> Option<Arc<CacheNode<D>>> {
        let (stripe, local) = self.locate(hash);
        let buckets = stripe.buckets.read();
        Self::scan(&buckets[local], key, hash).cloned()
    }

    /// Find and pin the node of `key` without creating it.
    pub(crate) fn get_pinned(&self, key: &D::Key, hash: u64, now_us: u64, user_clock: u64) -> Option<Arc<CacheNode<D>>> {
        let (stripe, local) = self.locate(hash);
        let buckets = stripe.buckets.read();
        let node = Self::scan(&buckets[local], key, hash)?;
        node.pin(now_us, user_clock);
        Some(node.clone())
    }

    /// Find the node of `key`, allocating it at the head of its bucket on a miss.
    ///
    /// With `pin` set, the node is pinned and stamped before the stripe lock is released. Returns the node and whether
    /// it was created by this call.
    pub(crate) fn get_or_insert(
        &self,
        key: &D::Key,
        hash: u64,
        now_us: u64,
        user_clock: u64,
        pin: bool,
    ) -> (Arc<CacheNode<D>>, bool) {
        let (stripe, local) = self.locate(hash);

        {
            let buckets = stripe.buckets.read();
            if let Some(node) = Self::scan(&buckets[local], key, hash) {
                if pin {
                    node.pin(now_us, user_clock);
                }
                return (node.clone(), false);
            }
        }

        let mut buckets = stripe.buckets.write();
        let bucket = &mut buckets[local];
        // Another thread may have inserted the key between the two locks.
        if let Some(node) = Self::scan(bucket, key, hash) {
            if pin {
                node.pin(now_us, user_clock);
            }
            return (node.clone(), false);
        }

        let node = Arc::new(CacheNode::new(key.clone(), hash, self.ring_buckets, now_us, user_clock));
        if pin {
            node.pin(now_us, user_clock);
        }
        bucket.insert(0, node.clone());
        self.len.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("[table]: insert node (hash: {hash}) into slot {}", hash % self.slots as u64);
        (node, true)
    }

    /// Run `f` under the write lock of the stripe owning `node`, then wake every reader parked on that stripe.
    pub(crate) fn with_write_lock<R>(&self, node: &CacheNode<D>, f: impl FnOnce() -> R) -> R {
        let (stripe, _) = self.locate(node.hash());
        let res = {
            let _guard = stripe.buckets.write();
            f()
        };
        let _gate = stripe.gate.lock();
        stripe.published.notify_all();
        res
    }

    /// Park on the stripe of `hash` until `done` holds or `until` passes. Returns the final value of `done`.
    pub(crate) fn wait(&self, hash: u64, until: Option<Instant>, done: impl Fn() -> bool) -> bool {
        let (stripe, _) = self.locate(hash);
        let mut gate = stripe.gate.lock();
        while !done() {
            match until {
                Some(until) => {
                    if stripe.published.wait_until(&mut gate, until).timed_out() {
                        return done();
                    }
                }
                None => stripe.published.wait(&mut gate),
            }
        }
        true
    }

    /// Unlink every node `evictable` accepts. Returns the unlinked nodes so they are dropped outside of any lock.
    pub(crate) fn sweep(&self, evictable: impl Fn(&CacheNode<D>) -> bool) -> Vec<Arc<CacheNode<D>>> {
        let mut garbage = vec![];
        for stripe in self.stripes.iter() {
            let any = stripe.buckets.read().iter().flatten().any(|node| evictable(node.as_ref()));
            if !any {
                continue;
            }

            let mut buckets = stripe.buckets.write();
            for bucket in buckets.iter_mut() {
                let mut i = 0;
                while i < bucket.len() {
                    // Pins are taken under the read lock, so the check is stable here.
                    if evictable(bucket[i].as_ref()) {
                        garbage.push(bucket.swap_remove(i));
                    } else {
                        i += 1;
                    }
                }
            }
        }
        self.len.fetch_sub(garbage.len(), Ordering::Relaxed);
        garbage
    }
}
