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

pub use kiln_cache::{
    ArtifactCache, ArtifactCacheBuilder, BuildContext, CacheConfig, Clock, Domain, Error, Lookup, Metrics, Pinned,
    Result, Routing, Scope, NEVER,
};

pub use crate::{
    debug_info::{DebugInfo, DebugInfoCache, DebugInfoDomain, DebugInfoKey, DebugInfoParser, LoadStatus, Symbol},
    disasm::{
        Arch, ContentHash, ContentSource, DisasmCache, DisasmDomain, DisasmLine, DisasmParams, DisasmStatus,
        Disassembler, Disassembly, Instruction, SyntaxFlags,
    },
    pointer_graph::{GraphKey, GraphNode, GraphParams, MemoryReader, PointerGraph, PointerGraphCache, PointerGraphDomain},
    search::{
        SearchCache, SearchCorpus, SearchDomain, SearchKey, SearchMatch, SearchParams, SearchResults, SearchStatus,
        SearchTarget,
    },
};
