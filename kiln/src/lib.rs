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

//! The artifact caches of the kiln debugger.
//!
//! Each module plugs one use case into the generic [`kiln_cache::ArtifactCache`]:
//!
//! - [`debug_info`]: parsed symbols of module files.
//! - [`disasm`]: disassembly of content-addressed code ranges.
//! - [`search`]: fuzzy search results of a search view.
//! - [`pointer_graph`]: pointer graphs chased from a root address.
//!
//! The collaborators that actually parse, decode and read memory are traits implemented by the embedder. Caches of
//! one session usually share a [`Clock`](kiln_common::clock::Clock) through
//! [`ArtifactCacheBuilder::with_clock`](kiln_cache::ArtifactCacheBuilder::with_clock), so that one user clock tick
//! per frame ages all of them.

pub mod debug_info;
pub mod disasm;
pub mod pointer_graph;
pub mod search;

/// Re-exports of the engine and of every adapter.
pub mod prelude;
