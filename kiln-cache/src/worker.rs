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
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};

use flume::Receiver;
use kiln_common::hasher::HashBuilder;

use crate::{
    cache::CacheInner,
    domain::{BuildContext, Domain},
    node::{CacheNode, Published},
    queue::Request,
};

/// A builder thread: drains build requests and publishes artifacts.
pub(crate) struct BuildWorker<D, S>
where
    D: Domain,
    S: HashBuilder,
{
    pub(crate) id: usize,
    pub(crate) inner: Arc<CacheInner<D, S>>,
    pub(crate) rx: Receiver<Request<D::Key>>,
}

impl<D, S> BuildWorker<D, S>
where
    D: Domain,
    S: HashBuilder,
{
    /// Run until every sender of the queue is dropped.
    pub(crate) fn run(self) {
        tracing::debug!("[builder]: {} builder {} started", self.inner.config.name, self.id);
        while let Ok(request) = self.rx.recv() {
            self.handle(request);
        }
        tracing::debug!("[builder]: {} builder {} exits", self.inner.config.name, self.id);
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "kiln::cache::builder::handle"))]
    fn handle(&self, request: Request<D::Key>) {
        let inner = &self.inner;
        // Nodes with pending submissions are never evicted, so a request whose node is gone has nothing left to build.
        let Some(node) = inner.table.get(&request.key, request.hash) else {
            tracing::trace!("[builder]: drop request of evicted {:?}", request.key);
            return;
        };

        loop {
            if !node.try_claim() {
                // The holder's drain loop picks up every pending submission.
                return;
            }
            self.drain(&node);
            node.release_claim();
            // A submission may have landed between the last drain and the release.
            if !node.has_pending() {
                return;
            }
        }
    }

    fn drain(&self, node: &CacheNode<D>) {
        let inner = &self.inner;
        while let Some(job) = node.begin_build() {
            let ctx = BuildContext::new(job.gen, node.submit_gen_ref(), &inner.clock);
            let start = Instant::now();
            let res = panic::catch_unwind(AssertUnwindSafe(|| inner.domain.build(node.key(), &job.params, &ctx)));
            node.end_build();
            inner.metrics.build_duration.record(start.elapsed());

            let artifact = match res {
                Ok(_) if ctx.is_abandoned() => {
                    tracing::debug!(
                        "[builder]: discard superseded build of {:?} (gen: {}, latest: {})",
                        node.key(),
                        job.gen,
                        node.submit_gen()
                    );
                    inner.metrics.build_discard.increment(1);
                    continue;
                }
                Ok(artifact) => artifact,
                Err(_) => {
                    tracing::warn!(
                        "[builder]: build of {:?} with {:?} panicked, publish an empty artifact",
                        node.key(),
                        job.params
                    );
                    inner.metrics.build_panic.increment(1);
                    D::Artifact::default()
                }
            };

            let published = Published {
                gen: job.gen,
                params_hash: job.params_hash,
                params: job.params,
                artifact: Arc::new(artifact),
            };
            if inner.table.with_write_lock(node, || node.publish(published)) {
                inner.metrics.build_publish.increment(1);
                tracing::trace!("[builder]: publish {:?} at gen {}", node.key(), job.gen);
            }
        }
    }
}
