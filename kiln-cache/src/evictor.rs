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

use std::{sync::Arc, time::Duration};

use flume::{Receiver, RecvTimeoutError};
use kiln_common::hasher::HashBuilder;

use crate::{cache::CacheInner, domain::Domain};

/// The evictor thread: sweeps the slot table on a fixed interval until shut down.
pub(crate) struct Evictor<D, S>
where
    D: Domain,
    S: HashBuilder,
{
    pub(crate) inner: Arc<CacheInner<D, S>>,
    pub(crate) interval: Duration,
    /// Never receives a message. Disconnection is the shutdown signal.
    pub(crate) shutdown: Receiver<()>,
}

impl<D, S> Evictor<D, S>
where
    D: Domain,
    S: HashBuilder,
{
    pub(crate) fn run(self) {
        tracing::debug!("[evictor]: {} evictor started", self.inner.config.name);
        loop {
            match self.shutdown.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {
                    self.inner.sweep();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("[evictor]: {} evictor exits", self.inner.config.name);
    }
}
