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

use std::{cell::RefCell, fmt::Debug, marker::PhantomData, ops::Deref, sync::Arc};

use kiln_common::hasher::{DefaultHashBuilder, HashBuilder};

use crate::{cache::ArtifactCache, domain::Domain, node::CacheNode};

/// A pin held on a node, released on drop.
pub(crate) struct Touch<D>
where
    D: Domain,
{
    node: Arc<CacheNode<D>>,
}

impl<D> Touch<D>
where
    D: Domain,
{
    /// Take over a pin already taken on `node`.
    pub(crate) fn new(node: Arc<CacheNode<D>>) -> Self {
        Self { node }
    }

    pub(crate) fn node(&self) -> &Arc<CacheNode<D>> {
        &self.node
    }
}

impl<D> Drop for Touch<D>
where
    D: Domain,
{
    fn drop(&mut self) {
        self.node.unpin();
    }
}

/// A read-only reference to an artifact that cannot outlive the [`Scope`] it was looked up in.
///
/// The artifact is the one published when the lookup ran. A later rebuild never changes what an issued [`Pinned`]
/// points to.
pub struct Pinned<'s, A> {
    artifact: Arc<A>,
    _scope: PhantomData<&'s ()>,
}

impl<A> Pinned<'_, A> {
    fn new(artifact: Arc<A>) -> Self {
        Self {
            artifact,
            _scope: PhantomData,
        }
    }

    /// Returns `true` if both references point to the same published artifact.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.artifact, &other.artifact)
    }
}

impl<A> Clone for Pinned<'_, A> {
    fn clone(&self) -> Self {
        Self::new(self.artifact.clone())
    }
}

impl<A> Deref for Pinned<'_, A> {
    type Target = A;

    fn deref(&self) -> &Self::Target {
        &self.artifact
    }
}

impl<A> Debug for Pinned<'_, A>
where
    A: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pinned").field(&self.artifact).finish()
    }
}

/// Result of [`Scope::lookup`].
#[derive(Debug)]
pub struct Lookup<'s, A> {
    /// The newest published artifact of the key, if any.
    pub artifact: Option<Pinned<'s, A>>,
    /// `true` if `artifact` was not built for the requested params, or if there is no artifact yet.
    pub stale: bool,
    /// Submission generation `artifact` was built for. `0` without an artifact.
    pub gen: u64,
}

impl<'s, A> Lookup<'s, A> {
    /// The artifact, only if it was built for the requested params.
    pub fn fresh(&self) -> Option<&Pinned<'s, A>> {
        if self.stale {
            None
        } else {
            self.artifact.as_ref()
        }
    }
}

/// A read session on an [`ArtifactCache`], usually one per rendered frame.
///
/// Every node the scope looks up stays pinned, and so is never evicted, until the scope is closed or dropped.
/// Scopes are meant to live on one thread and to be short.
pub struct Scope<'c, D, S = DefaultHashBuilder>
where
    D: Domain,
    S: HashBuilder,
{
    cache: &'c ArtifactCache<D, S>,
    touches: RefCell<Vec<Touch<D>>>,
}

impl<D, S> Debug for Scope<'_, D, S>
where
    D: Domain,
    S: HashBuilder,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("cache", &self.cache.config().name)
            .field("touches", &self.touches.borrow().len())
            .finish()
    }
}

impl<'c, D, S> Scope<'c, D, S>
where
    D: Domain,
    S: HashBuilder,
{
    pub(crate) fn new(cache: &'c ArtifactCache<D, S>) -> Self {
        Self {
            cache,
            touches: RefCell::new(vec![]),
        }
    }

    /// Look up the artifact of `key` built with `params`.
    ///
    /// If the published artifact was built for other params, or there is none, the params are submitted and a build
    /// is requested. The call then waits for a build until `deadline_us` passes. With an expired deadline it returns
    /// right away, with the previous artifact marked stale.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "kiln::cache::scope::lookup"))]
    pub fn lookup(&self, key: &D::Key, params: &D::Params, deadline_us: u64) -> Lookup<'_, D::Artifact> {
        let cache = self.cache;
        let inner = cache.inner();
        let hash = cache.hash_key(key);
        let params_hash = cache.hash_params(params);
        let node = self.touch(key, hash);

        let mut waited = false;
        loop {
            // Read the generation before the artifact, so that a publication in between is not missed by the wait.
            let seen = node.gen();
            let published = node.published();

            if let Some(published) = published.as_ref().filter(|p| p.matches(params_hash, params)) {
                inner.metrics.lookup_hit.increment(1);
                return Lookup {
                    artifact: Some(Pinned::new(published.artifact.clone())),
                    stale: false,
                    gen: published.gen,
                };
            }

            cache.ensure_requested(&node, params, params_hash, deadline_us);

            if inner.clock.is_expired(deadline_us) {
                return match published {
                    Some(published) => {
                        inner.metrics.lookup_stale.increment(1);
                        Lookup {
                            artifact: Some(Pinned::new(published.artifact.clone())),
                            stale: true,
                            gen: published.gen,
                        }
                    }
                    None => {
                        inner.metrics.lookup_miss.increment(1);
                        Lookup {
                            artifact: None,
                            stale: true,
                            gen: 0,
                        }
                    }
                };
            }

            if !waited {
                inner.metrics.lookup_wait.increment(1);
                waited = true;
            }
            inner
                .table
                .wait(hash, inner.clock.instant_of(deadline_us), || node.gen() != seen);
        }
    }

    /// The newest published artifact of `key`, whatever params it was built for.
    ///
    /// Never requests a build and never creates a node.
    pub fn peek(&self, key: &D::Key) -> Option<Pinned<'_, D::Artifact>> {
        let inner = self.cache.inner();
        let hash = self.cache.hash_key(key);
        let node = inner
            .table
            .get_pinned(key, hash, inner.clock.now_us(), inner.clock.user_clock())?;
        self.touches.borrow_mut().push(Touch::new(node.clone()));
        node.published().map(|p| Pinned::new(p.artifact.clone()))
    }

    /// Pins held by the scope.
    pub fn touches(&self) -> usize {
        self.touches.borrow().len()
    }

    /// Release every pin held by the scope.
    pub fn close(self) {}

    fn touch(&self, key: &D::Key, hash: u64) -> Arc<CacheNode<D>> {
        let touch = self.cache.inner().touch(key, hash);
        let node = touch.node().clone();
        self.touches.borrow_mut().push(touch);
        node
    }
}
