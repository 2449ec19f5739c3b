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

//! Graphs of pointers chased breadth-first from a root address.

use std::{collections::VecDeque, time::Duration};

use bytes::{Buf, Bytes};
use hashbrown::HashMap;
use kiln_cache::{ArtifactCache, ArtifactCacheBuilder, BuildContext, CacheConfig, Domain};

/// Reads target memory.
pub trait MemoryReader: Send + Sync + 'static {
    /// Read `len` bytes at `addr` in address space `space`. May return fewer bytes at the end of a mapping.
    fn read(&self, space: u64, addr: u64, len: usize) -> anyhow::Result<Bytes>;
}

/// Identity of a pointer graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphKey {
    /// Address space, e.g. a process id.
    pub space: u64,
    /// Address the graph starts from.
    pub root: u64,
}

/// Inputs of a pointer graph besides the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphParams {
    /// Pointer hops from the root. The root is at depth `0`.
    pub max_depth: u32,
    /// Nodes in the graph, root included.
    pub max_nodes: u32,
    /// Pointer width in bytes, between 1 and 8.
    pub pointer_size: u8,
    /// Bumped whenever target memory may have changed, e.g. on every stop of the target.
    pub epoch: u64,
}

impl Default for GraphParams {
    fn default() -> Self {
        Self {
            max_depth: 4,
            max_nodes: 256,
            pointer_size: 8,
            epoch: 0,
        }
    }
}

/// A memory cell of a pointer graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphNode {
    /// Address of the cell.
    pub addr: u64,
    /// Pointer hops from the root.
    pub depth: u32,
    /// Pointer stored in the cell. `None` if the cell is unreadable.
    pub value: Option<u64>,
}

/// Pointer graph.
#[derive(Debug, Default)]
pub struct PointerGraph {
    nodes: Vec<GraphNode>,
    edges: Vec<(usize, usize)>,
    index: HashMap<u64, usize>,
    truncated: bool,
}

impl PointerGraph {
    /// Nodes in breadth-first order. The root comes first.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// `(from, to)` node indices.
    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    /// The root node, if the graph was built.
    pub fn root(&self) -> Option<&GraphNode> {
        self.nodes.first()
    }

    /// The node of the cell at `addr`.
    pub fn node_at(&self, addr: u64) -> Option<&GraphNode> {
        self.index.get(&addr).map(|&i| &self.nodes[i])
    }

    /// Indices of the nodes `node` points to.
    pub fn successors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges.iter().filter(move |(from, _)| *from == node).map(|(_, to)| *to)
    }

    /// Returns `true` if `max_nodes` cut the graph short.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    fn add(&mut self, addr: u64, depth: u32) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(GraphNode {
            addr,
            depth,
            value: None,
        });
        self.index.insert(addr, idx);
        idx
    }
}

/// Builds [`PointerGraph`]s with a [`MemoryReader`].
#[derive(Debug)]
pub struct PointerGraphDomain<M> {
    reader: M,
}

impl<M> PointerGraphDomain<M>
where
    M: MemoryReader,
{
    /// Create a domain reading memory with `reader`.
    pub fn new(reader: M) -> Self {
        Self { reader }
    }

    /// The memory reader.
    pub fn reader(&self) -> &M {
        &self.reader
    }

    fn read_pointer(&self, space: u64, addr: u64, size: usize) -> Option<u64> {
        match self.reader.read(space, addr, size) {
            Ok(mut bytes) if bytes.len() >= size => Some(bytes.get_uint_le(size)),
            Ok(_) => None,
            Err(e) => {
                tracing::trace!("[pointer_graph]: cannot read {space}:{addr:#x}: {e}");
                None
            }
        }
    }
}

impl<M> Domain for PointerGraphDomain<M>
where
    M: MemoryReader,
{
    type Key = GraphKey;
    type Params = GraphParams;
    type Artifact = PointerGraph;

    fn build(&self, key: &GraphKey, params: &GraphParams, ctx: &BuildContext<'_>) -> PointerGraph {
        let size = params.pointer_size.clamp(1, 8) as usize;
        let max_nodes = params.max_nodes.max(1) as usize;

        let mut graph = PointerGraph::default();
        let mut queue = VecDeque::new();
        queue.push_back(graph.add(key.root, 0));

        while let Some(idx) = queue.pop_front() {
            if ctx.is_superseded() {
                break;
            }
            let GraphNode { addr, depth, .. } = graph.nodes[idx];
            let Some(value) = self.read_pointer(key.space, addr, size) else {
                // Unreadable cells stay leaves.
                continue;
            };
            graph.nodes[idx].value = Some(value);
            if value == 0 || depth >= params.max_depth {
                continue;
            }

            let visited = graph.index.get(&value).copied();
            let to = match visited {
                Some(to) => to,
                None if graph.nodes.len() >= max_nodes => {
                    graph.truncated = true;
                    continue;
                }
                None => {
                    let to = graph.add(value, depth + 1);
                    queue.push_back(to);
                    to
                }
            };
            graph.edges.push((idx, to));
        }

        tracing::trace!(
            "[pointer_graph]: {}:{:#x} has {} nodes, {} edges, truncated: {}",
            key.space,
            key.root,
            graph.nodes.len(),
            graph.edges.len(),
            graph.truncated
        );
        graph
    }
}

/// A pointer graph cache.
pub type PointerGraphCache<M> = ArtifactCache<PointerGraphDomain<M>>;

/// Config of pointer graph caches.
///
/// Artifacts are only valid for one stop of the target, so they age out fast.
pub fn default_config() -> CacheConfig {
    CacheConfig {
        name: "pointer_graph".to_string(),
        slots: 256,
        builders: 1,
        queue_capacity: 128,
        evict_after: Duration::from_secs(5),
        evict_after_user_clocks: 60,
        ..Default::default()
    }
}

/// Builder of a pointer graph cache.
pub fn builder<M>(reader: M) -> ArtifactCacheBuilder<PointerGraphDomain<M>>
where
    M: MemoryReader,
{
    ArtifactCacheBuilder::new(PointerGraphDomain::new(reader)).with_config(default_config())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = GraphParams::default();
        assert_eq!(params.pointer_size, 8);
        assert!(params.max_nodes > 0);
        default_config().validate().unwrap();
    }

    #[test]
    fn test_successors() {
        let mut graph = PointerGraph::default();
        let a = graph.add(0x10, 0);
        let b = graph.add(0x20, 1);
        let c = graph.add(0x30, 1);
        graph.edges = vec![(a, b), (a, c), (b, c)];

        assert_eq!(graph.successors(a).collect::<Vec<_>>(), vec![b, c]);
        assert_eq!(graph.successors(c).count(), 0);
        assert_eq!(graph.node_at(0x20).unwrap().depth, 1);
        assert_eq!(graph.root().unwrap().addr, 0x10);
    }
}
