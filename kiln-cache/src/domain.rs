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
    cell::Cell,
    fmt::Debug,
    hash::Hash,
    sync::atomic::{AtomicU64, Ordering},
};

use kiln_common::clock::Clock;

/// A use case plugged into the generic artifact cache.
///
/// The engine never looks inside keys, params or artifacts. It hashes keys to find nodes, compares params to decide
/// staleness and hands both to [`Domain::build`] on a builder thread.
pub trait Domain: Send + Sync + 'static {
    /// Identity of a cache node.
    type Key: Hash + Eq + Clone + Debug + Send + Sync + 'static;
    /// Inputs of a build besides the key.
    ///
    /// A node whose last published params differ from the requested ones is stale. `Default` params are used when
    /// a rebuild is requested for a key that never received params.
    type Params: Hash + Eq + Clone + Default + Debug + Send + Sync + 'static;
    /// The computed value.
    ///
    /// `Default` is the terminal empty artifact published when a build panics.
    type Artifact: Default + Send + Sync + 'static;

    /// Compute the artifact for `key` with `params`.
    ///
    /// Runs on a builder thread and may block on I/O or on other caches. Failures must be expressed in the returned
    /// artifact. Long builds should poll [`BuildContext::is_superseded`] and return early once it reports `true`.
    fn build(&self, key: &Self::Key, params: &Self::Params, ctx: &BuildContext<'_>) -> Self::Artifact;
}

/// Per-build view handed to [`Domain::build`].
#[derive(Debug)]
pub struct BuildContext<'a> {
    gen: u64,
    latest: &'a AtomicU64,
    clock: &'a Clock,
    abandoned: Cell<bool>,
}

impl<'a> BuildContext<'a> {
    pub(crate) fn new(gen: u64, latest: &'a AtomicU64, clock: &'a Clock) -> Self {
        Self {
            gen,
            latest,
            clock,
            abandoned: Cell::new(false),
        }
    }

    /// Submission generation this build is producing.
    pub fn generation(&self) -> u64 {
        self.gen
    }

    /// Returns `true` if a newer submission arrived for the key since this build started.
    ///
    /// Once this returns `true` the build counts as abandoned: whatever it returns is discarded and the newer
    /// submission is built instead.
    pub fn is_superseded(&self) -> bool {
        let superseded = self.latest.load(Ordering::Acquire) > self.gen;
        if superseded {
            self.abandoned.set(true);
        }
        superseded
    }

    /// The clock of the cache running this build.
    pub fn clock(&self) -> &Clock {
        self.clock
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.get()
    }
}
