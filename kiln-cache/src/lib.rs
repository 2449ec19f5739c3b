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

//! A concurrent artifact cache.
//!
//! Artifacts are expensive values derived from a key and a set of params: parsed debug info, disassembly, search
//! results. Foreground threads look them up through short-lived [`Scope`]s and never build. Builder threads compute
//! them from queued requests. Readers decide staleness by comparing their params with those of the last published
//! build, and may wait for a fresher one up to an explicit deadline.
//!
//! ```ignore
//! let cache = ArtifactCacheBuilder::new(domain).with_name("disasm").build()?;
//!
//! let scope = cache.open_scope();
//! let lookup = scope.lookup(&key, &params, cache.deadline_after(Duration::from_millis(2)));
//! if let Some(artifact) = lookup.artifact.as_deref() {
//!     render(artifact, lookup.stale);
//! }
//! scope.close();
//! ```

mod cache;
mod config;
mod domain;
mod error;
mod evictor;
mod node;
mod queue;
mod scope;
mod table;
mod worker;

#[cfg(test)]
mod test_utils;

mod prelude;
pub use prelude::*;
