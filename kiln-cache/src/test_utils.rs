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

//! Utilities for testing.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::domain::{BuildContext, Domain};

/// Artifact of [`EchoDomain`]: the inputs it was built from.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Echo {
    pub key: u64,
    pub params: String,
}

/// A latch builds park on while it is closed.
#[derive(Debug)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            open: Mutex::new(true),
            cv: Condvar::new(),
        }
    }
}

impl Gate {
    pub fn close(&self) {
        *self.open.lock() = false;
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }

    fn pass(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
    }
}

#[derive(Debug, Default)]
struct EchoState {
    started: AtomicUsize,
    builds: AtomicUsize,
    delay_us: AtomicU64,
    log: Mutex<Vec<(u64, String)>>,
    gate: Gate,
}

/// A domain that echoes its key and params back as the artifact.
///
/// - params `"panic"` make the build panic.
/// - params starting with `"coop"` spin until the build is superseded, for at most 5s.
#[derive(Debug, Default, Clone)]
pub struct EchoDomain {
    state: Arc<EchoState>,
}

impl EchoDomain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds entered, including unfinished ones.
    pub fn started(&self) -> usize {
        self.state.started.load(Ordering::Acquire)
    }

    /// Builds that returned.
    pub fn builds(&self) -> usize {
        self.state.builds.load(Ordering::Acquire)
    }

    /// `(key, params)` of every build that returned, in completion order.
    pub fn log(&self) -> Vec<(u64, String)> {
        self.state.log.lock().clone()
    }

    pub fn gate(&self) -> &Gate {
        &self.state.gate
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.delay_us.store(delay.as_micros() as u64, Ordering::Release);
    }
}

impl Domain for EchoDomain {
    type Key = u64;
    type Params = String;
    type Artifact = Echo;

    fn build(&self, key: &u64, params: &String, ctx: &BuildContext<'_>) -> Echo {
        self.state.started.fetch_add(1, Ordering::AcqRel);
        self.state.gate.pass();

        let delay = self.state.delay_us.load(Ordering::Acquire);
        if delay > 0 {
            thread::sleep(Duration::from_micros(delay));
        }
        if params == "panic" {
            panic!("echo build panicked on purpose");
        }
        if params.starts_with("coop") {
            let start = Instant::now();
            while !ctx.is_superseded() && start.elapsed() < Duration::from_secs(5) {
                thread::sleep(Duration::from_millis(1));
            }
        }

        self.state.log.lock().push((*key, params.clone()));
        self.state.builds.fetch_add(1, Ordering::AcqRel);
        Echo {
            key: *key,
            params: params.clone(),
        }
    }
}
