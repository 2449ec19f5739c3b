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

//! Parsed debug info, keyed by file path and minimum acceptable timestamp.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use hashbrown::HashMap;
use kiln_cache::{ArtifactCache, ArtifactCacheBuilder, BuildContext, CacheConfig, Domain};

/// A symbol of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name.
    pub name: String,
    /// Start address, relative to the module base.
    pub addr: u64,
    /// Size in bytes. `0` if unknown.
    pub size: u64,
}

/// Parses module files into symbols.
pub trait DebugInfoParser: Send + Sync + 'static {
    /// Parse the content of the file at `path`.
    fn parse(&self, path: &Path, data: &[u8]) -> anyhow::Result<Vec<Symbol>>;
}

/// Identity of a debug info artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebugInfoKey {
    /// Path of the module file.
    pub path: PathBuf,
    /// Files modified before this timestamp, in microseconds since the unix epoch, are rejected as outdated.
    pub min_timestamp_us: u64,
}

impl DebugInfoKey {
    /// Key of `path`, accepting any file version.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            min_timestamp_us: 0,
        }
    }

    /// Reject files modified before `min_timestamp_us`.
    pub fn with_min_timestamp_us(mut self, min_timestamp_us: u64) -> Self {
        self.min_timestamp_us = min_timestamp_us;
        self
    }
}

/// Outcome of loading debug info.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LoadStatus {
    /// The file could not be read.
    #[default]
    Unavailable,
    /// The file is older than the key accepts.
    Outdated,
    /// The parser rejected the file.
    Malformed(String),
    /// Symbols are loaded.
    Loaded,
}

/// Debug info of one module file.
#[derive(Debug, Default)]
pub struct DebugInfo {
    status: LoadStatus,
    timestamp_us: u64,
    symbols: Vec<Symbol>,
    by_name: HashMap<String, usize>,
    max_size: u64,
}

impl DebugInfo {
    fn failed(status: LoadStatus, timestamp_us: u64) -> Self {
        Self {
            status,
            timestamp_us,
            ..Default::default()
        }
    }

    fn loaded(mut symbols: Vec<Symbol>, timestamp_us: u64) -> Self {
        symbols.sort_by(|a, b| a.addr.cmp(&b.addr).then_with(|| a.name.cmp(&b.name)));
        let mut by_name = HashMap::with_capacity(symbols.len());
        for (i, symbol) in symbols.iter().enumerate() {
            // The lowest address wins for duplicated names.
            by_name.entry(symbol.name.clone()).or_insert(i);
        }
        let max_size = symbols.iter().map(|s| s.size).max().unwrap_or(0);
        Self {
            status: LoadStatus::Loaded,
            timestamp_us,
            symbols,
            by_name,
            max_size,
        }
    }

    /// Load status.
    pub fn status(&self) -> &LoadStatus {
        &self.status
    }

    /// Modification time of the loaded file, in microseconds since the unix epoch. `0` if it could not be read.
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Symbols, sorted by address.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// The symbol covering `addr`.
    ///
    /// A symbol of unknown size only covers its start address.
    pub fn symbol_at(&self, addr: u64) -> Option<&Symbol> {
        let idx = self.symbols.partition_point(|s| s.addr <= addr);
        // Nested symbols: the closest start that covers `addr` wins. No symbol further back than the largest size
        // can cover it.
        self.symbols[..idx]
            .iter()
            .rev()
            .take_while(|s| addr - s.addr <= self.max_size)
            .find(|s| addr == s.addr || addr - s.addr < s.size)
    }

    /// The symbol called `name`.
    pub fn symbol_by_name(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|&i| &self.symbols[i])
    }
}

/// Loads [`DebugInfo`] from module files.
#[derive(Debug)]
pub struct DebugInfoDomain<P> {
    parser: P,
}

impl<P> DebugInfoDomain<P>
where
    P: DebugInfoParser,
{
    /// Create a domain parsing files with `parser`.
    pub fn new(parser: P) -> Self {
        Self { parser }
    }

    /// The parser.
    pub fn parser(&self) -> &P {
        &self.parser
    }
}

impl<P> Domain for DebugInfoDomain<P>
where
    P: DebugInfoParser,
{
    type Key = DebugInfoKey;
    type Params = ();
    type Artifact = DebugInfo;

    fn build(&self, key: &DebugInfoKey, _: &(), _: &BuildContext<'_>) -> DebugInfo {
        let timestamp_us = match std::fs::metadata(&key.path).and_then(|m| m.modified()) {
            Ok(modified) => unix_us(modified),
            Err(e) => {
                tracing::debug!("[debug_info]: cannot stat {:?}: {e}", key.path);
                return DebugInfo::failed(LoadStatus::Unavailable, 0);
            }
        };
        if timestamp_us < key.min_timestamp_us {
            tracing::debug!(
                "[debug_info]: {:?} is outdated, modified at {timestamp_us}us < {}us",
                key.path,
                key.min_timestamp_us
            );
            return DebugInfo::failed(LoadStatus::Outdated, timestamp_us);
        }

        let data = match std::fs::read(&key.path) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!("[debug_info]: cannot read {:?}: {e}", key.path);
                return DebugInfo::failed(LoadStatus::Unavailable, timestamp_us);
            }
        };
        match self.parser.parse(&key.path, &data) {
            Ok(symbols) => {
                tracing::debug!("[debug_info]: loaded {} symbols from {:?}", symbols.len(), key.path);
                DebugInfo::loaded(symbols, timestamp_us)
            }
            Err(e) => {
                tracing::warn!("[debug_info]: failed to parse {:?}: {e:#}", key.path);
                DebugInfo::failed(LoadStatus::Malformed(format!("{e:#}")), timestamp_us)
            }
        }
    }
}

/// Microseconds since the unix epoch. Times before the epoch map to `0`.
pub fn unix_us(time: SystemTime) -> u64 {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    u64::try_from(since.as_micros()).unwrap_or(u64::MAX)
}

/// A debug info cache.
pub type DebugInfoCache<P> = ArtifactCache<DebugInfoDomain<P>>;

/// Config of debug info caches.
///
/// Few, large artifacts that are slow to build and referenced for the whole session.
pub fn default_config() -> CacheConfig {
    CacheConfig {
        name: "debug_info".to_string(),
        slots: 256,
        builders: 2,
        queue_capacity: 256,
        evict_after: Duration::from_secs(60),
        evict_after_user_clocks: 600,
        ..Default::default()
    }
}

/// Builder of a debug info cache parsing files with `parser`.
pub fn builder<P>(parser: P) -> ArtifactCacheBuilder<DebugInfoDomain<P>>
where
    P: DebugInfoParser,
{
    ArtifactCacheBuilder::new(DebugInfoDomain::new(parser)).with_config(default_config())
}
