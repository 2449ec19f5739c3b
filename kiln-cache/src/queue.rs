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

use flume::{Receiver, Sender, TrySendError};
use kiln_common::clock::Clock;

use crate::config::Routing;

/// A build request: the key to build and its precomputed hash.
#[derive(Debug)]
pub(crate) struct Request<K> {
    pub(crate) hash: u64,
    pub(crate) key: K,
}

/// Bounded foreground-to-background request channel(s).
#[derive(Debug)]
pub(crate) struct RequestQueue<K> {
    senders: Vec<Sender<Request<K>>>,
    clock: Clock,
}

impl<K> RequestQueue<K> {
    /// Create the queue and one receiver per builder.
    pub(crate) fn new(routing: Routing, builders: usize, capacity: usize, clock: Clock) -> (Self, Vec<Receiver<Request<K>>>) {
        let (senders, receivers) = match routing {
            Routing::Shared => {
                let (tx, rx) = flume::bounded(capacity);
                (vec![tx], vec![rx; builders])
            }
            Routing::Affinity => (0..builders).map(|_| flume::bounded(capacity)).unzip(),
        };
        (Self { senders, clock }, receivers)
    }

    /// Queue a request, waiting at most until `deadline_us` for room.
    ///
    /// Returns `false` if the queue stayed full until the deadline, or if it is closed.
    pub(crate) fn enqueue(&self, key: K, hash: u64, deadline_us: u64) -> bool {
        let Some(sender) = self.senders.get((hash % self.senders.len().max(1) as u64) as usize) else {
            return false;
        };
        let request = Request { hash, key };
        match sender.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(_)) => false,
            Err(TrySendError::Full(request)) => {
                if self.clock.is_expired(deadline_us) {
                    return false;
                }
                match self.clock.instant_of(deadline_us) {
                    Some(deadline) => sender.send_deadline(request, deadline).is_ok(),
                    None => sender.send(request).is_ok(),
                }
            }
        }
    }

    /// Drop every sender. Builders drain what is left and exit.
    pub(crate) fn close(&mut self) {
        self.senders.clear();
    }
}
