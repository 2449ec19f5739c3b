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

//! Pointer graph cache over fake target memory.

use bytes::Bytes;
use hashbrown::HashMap;
use kiln::{pointer_graph, prelude::*};
use parking_lot::RwLock;

const SPACE: u64 = 1;

#[derive(Debug, Default)]
struct FakeMemory {
    cells: RwLock<HashMap<u64, u64>>,
}

impl FakeMemory {
    fn with(cells: &[(u64, u64)]) -> Self {
        Self {
            cells: RwLock::new(cells.iter().copied().collect()),
        }
    }
}

impl MemoryReader for FakeMemory {
    fn read(&self, space: u64, addr: u64, len: usize) -> anyhow::Result<Bytes> {
        anyhow::ensure!(space == SPACE, "unknown address space {space}");
        let Some(value) = self.cells.read().get(&addr).copied() else {
            anyhow::bail!("{addr:#x} is not mapped");
        };
        Ok(Bytes::copy_from_slice(&value.to_le_bytes()[..len.min(8)]))
    }
}

fn cache(memory: FakeMemory) -> PointerGraphCache<FakeMemory> {
    pointer_graph::builder(memory)
        .with_evictor(false)
        .with_metrics(Metrics::noop())
        .build()
        .unwrap()
}

fn key(root: u64) -> GraphKey {
    GraphKey { space: SPACE, root }
}

#[test_log::test]
fn test_chase_list() {
    let cache = cache(FakeMemory::with(&[(0x100, 0x200), (0x200, 0x300), (0x300, 0)]));
    let scope = cache.open_scope();
    let graph = scope.lookup(&key(0x100), &GraphParams::default(), NEVER).artifact.unwrap();

    let addrs = graph.nodes().iter().map(|n| n.addr).collect::<Vec<_>>();
    assert_eq!(addrs, vec![0x100, 0x200, 0x300]);
    assert_eq!(graph.edges(), &[(0, 1), (1, 2)]);
    assert_eq!(graph.node_at(0x300).unwrap().value, Some(0));
    assert_eq!(graph.node_at(0x300).unwrap().depth, 2);
    assert!(!graph.is_truncated());
}

#[test_log::test]
fn test_cycles_and_unreadable_cells() {
    let cache = cache(FakeMemory::with(&[(0x100, 0x200), (0x200, 0x100), (0x400, 0xdead)]));
    let scope = cache.open_scope();

    let cycle = scope.lookup(&key(0x100), &GraphParams::default(), NEVER).artifact.unwrap();
    assert_eq!(cycle.nodes().len(), 2);
    assert_eq!(cycle.edges(), &[(0, 1), (1, 0)]);
    assert_eq!(cycle.successors(1).collect::<Vec<_>>(), vec![0]);

    let dangling = scope.lookup(&key(0x400), &GraphParams::default(), NEVER).artifact.unwrap();
    assert_eq!(dangling.nodes().len(), 2);
    assert_eq!(dangling.node_at(0xdead).unwrap().value, None);

    let unmapped = scope.lookup(&key(0x999), &GraphParams::default(), NEVER).artifact.unwrap();
    assert_eq!(unmapped.nodes().len(), 1);
    assert_eq!(unmapped.root().unwrap().value, None);

    let foreign = scope
        .lookup(&GraphKey { space: 7, root: 0x100 }, &GraphParams::default(), NEVER)
        .artifact
        .unwrap();
    assert_eq!(foreign.root().unwrap().value, None);
}

#[test_log::test]
fn test_limits() {
    let chain = (1..=10u64).map(|i| (i * 0x10, (i + 1) * 0x10)).collect::<Vec<_>>();
    let cache = cache(FakeMemory::with(&chain));
    let scope = cache.open_scope();

    let shallow = GraphParams {
        max_depth: 3,
        ..Default::default()
    };
    let graph = scope.lookup(&key(0x10), &shallow, NEVER).artifact.unwrap();
    assert_eq!(graph.nodes().len(), 4);
    assert_eq!(graph.nodes()[3].depth, 3);
    assert_eq!(graph.nodes()[3].value, Some(0x50));
    assert!(!graph.is_truncated());

    let small = GraphParams {
        max_depth: 100,
        max_nodes: 3,
        ..Default::default()
    };
    let graph = scope.lookup(&key(0x10), &small, NEVER).artifact.unwrap();
    assert_eq!(graph.nodes().len(), 3);
    assert!(graph.is_truncated());
}

#[test_log::test]
fn test_pointer_size() {
    let cache = cache(FakeMemory::with(&[(0x100, 0xffff_ffff_0000_0200), (0x200, 0)]));
    let scope = cache.open_scope();

    let narrow = GraphParams {
        pointer_size: 4,
        ..Default::default()
    };
    let graph = scope.lookup(&key(0x100), &narrow, NEVER).artifact.unwrap();
    assert_eq!(graph.root().unwrap().value, Some(0x200));
    assert_eq!(graph.nodes().len(), 2);

    let wide = scope.lookup(&key(0x100), &GraphParams::default(), NEVER).artifact.unwrap();
    assert_eq!(wide.root().unwrap().value, Some(0xffff_ffff_0000_0200));
}

#[test_log::test]
fn test_epoch_rebuilds() {
    let cache = cache(FakeMemory::with(&[(0x100, 0x200)]));
    let scope = cache.open_scope();
    let first = scope.lookup(&key(0x100), &GraphParams::default(), NEVER).artifact.unwrap();
    assert_eq!(first.root().unwrap().value, Some(0x200));

    // The target ran: memory changed, but the cache only notices through the epoch.
    cache.domain().reader().cells.write().insert(0x100, 0x300);
    let same = scope.lookup(&key(0x100), &GraphParams::default(), NEVER);
    assert!(!same.stale);
    assert_eq!(same.artifact.unwrap().root().unwrap().value, Some(0x200));

    let next = GraphParams {
        epoch: 1,
        ..Default::default()
    };
    let lookup = scope.lookup(&key(0x100), &next, NEVER);
    assert_eq!(lookup.gen, 2);
    assert_eq!(lookup.artifact.unwrap().root().unwrap().value, Some(0x300));
}
