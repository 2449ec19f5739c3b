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

//! Fuzzy search over symbol, type and file names.

use std::{cmp::Reverse, sync::Arc, time::Duration};

use itertools::Itertools;
use kiln_cache::{ArtifactCache, ArtifactCacheBuilder, BuildContext, CacheConfig, Domain};

/// Candidates scored between two supersession checks.
const CHECK_INTERVAL: usize = 1024;

const MATCH_SCORE: u32 = 1;
const CONTIGUOUS_BONUS: u32 = 4;
const BOUNDARY_BONUS: u32 = 8;
const PREFIX_BONUS: u32 = 16;

/// Identity of a search view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchKey(pub u64);

/// Corpus a search runs over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SearchTarget {
    /// Function and global symbols.
    #[default]
    Symbols,
    /// Type names.
    Types,
    /// Source file paths.
    Files,
}

/// Inputs of a search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SearchParams {
    /// Corpus to search.
    pub target: SearchTarget,
    /// Whitespace-separated needles. Every needle must match.
    pub query: String,
}

impl SearchParams {
    /// Search `target` for `query`.
    pub fn new(target: SearchTarget, query: impl Into<String>) -> Self {
        Self {
            target,
            query: query.into(),
        }
    }
}

/// Provides candidate strings to search.
pub trait SearchCorpus: Send + Sync + 'static {
    /// Every candidate of `target`. Indices into the returned slice identify matches.
    fn candidates(&self, target: SearchTarget) -> anyhow::Result<Arc<[String]>>;
}

/// A candidate that matched every needle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    /// Index of the candidate in its corpus.
    pub index: usize,
    /// Higher is better.
    pub score: u32,
    /// Byte offsets of the matched characters.
    pub positions: Vec<usize>,
}

/// Outcome of a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SearchStatus {
    /// Not searched.
    #[default]
    Empty,
    /// The corpus could not be loaded.
    Unavailable(String),
    /// Every candidate was scored.
    Done,
}

/// Results of a search, best match first.
#[derive(Debug, Default)]
pub struct SearchResults {
    status: SearchStatus,
    params: SearchParams,
    candidates: Option<Arc<[String]>>,
    matches: Vec<SearchMatch>,
}

impl SearchResults {
    /// Outcome.
    pub fn status(&self) -> &SearchStatus {
        &self.status
    }

    /// The query these results answer.
    pub fn query(&self) -> &str {
        &self.params.query
    }

    /// The corpus these results were taken from.
    pub fn target(&self) -> SearchTarget {
        self.params.target
    }

    /// Matches, best first.
    pub fn matches(&self) -> &[SearchMatch] {
        &self.matches
    }

    /// Text of `m`.
    pub fn text(&self, m: &SearchMatch) -> Option<&str> {
        self.candidates.as_ref()?.get(m.index).map(String::as_str)
    }

    /// Matched candidates, best first.
    pub fn texts(&self) -> impl Iterator<Item = &str> + '_ {
        self.matches.iter().filter_map(|m| self.text(m))
    }
}

/// Scores `haystack` against every needle.
///
/// Matching is ASCII case-insensitive: every needle must appear in the haystack as a subsequence. Matches at the
/// start of the haystack, at word boundaries and in contiguous runs score higher.
pub fn fuzzy_match(needles: &[&str], haystack: &str) -> Option<SearchMatch> {
    let bytes = haystack.as_bytes();
    let mut score = 0;
    let mut positions = vec![];
    for needle in needles {
        score += match_needle(needle.as_bytes(), bytes, &mut positions)?;
    }
    positions.sort_unstable();
    positions.dedup();
    Some(SearchMatch {
        index: 0,
        score,
        positions,
    })
}

fn match_needle(needle: &[u8], haystack: &[u8], positions: &mut Vec<usize>) -> Option<u32> {
    // Prefer a contiguous occurrence, then fall back to a greedy subsequence.
    if let Some(start) = find_ignore_case(haystack, needle) {
        positions.extend(start..start + needle.len());
        let run = needle.len() as u32;
        let score = run * MATCH_SCORE + run.saturating_sub(1) * CONTIGUOUS_BONUS + bonus(haystack, start);
        return Some(score);
    }

    let mut score = 0;
    let mut from = 0;
    let mut last = None;
    for &c in needle {
        let pos = from + haystack[from..].iter().position(|h| h.eq_ignore_ascii_case(&c))?;
        score += MATCH_SCORE + bonus(haystack, pos);
        if last.is_some_and(|last| last + 1 == pos) {
            score += CONTIGUOUS_BONUS;
        }
        positions.push(pos);
        last = Some(pos);
        from = pos + 1;
    }
    Some(score)
}

fn find_ignore_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

fn bonus(haystack: &[u8], pos: usize) -> u32 {
    if pos == 0 {
        return PREFIX_BONUS;
    }
    let (prev, cur) = (haystack[pos - 1], haystack[pos]);
    let boundary = matches!(prev, b'_' | b':' | b'/' | b'\\' | b'.' | b' ' | b'-' | b'<')
        || (prev.is_ascii_lowercase() && cur.is_ascii_uppercase());
    if boundary {
        BOUNDARY_BONUS
    } else {
        0
    }
}

/// Runs fuzzy searches over a [`SearchCorpus`].
#[derive(Debug)]
pub struct SearchDomain<C> {
    corpus: C,
}

impl<C> SearchDomain<C>
where
    C: SearchCorpus,
{
    /// Create a domain searching `corpus`.
    pub fn new(corpus: C) -> Self {
        Self { corpus }
    }

    /// The corpus.
    pub fn corpus(&self) -> &C {
        &self.corpus
    }
}

impl<C> Domain for SearchDomain<C>
where
    C: SearchCorpus,
{
    type Key = SearchKey;
    type Params = SearchParams;
    type Artifact = SearchResults;

    fn build(&self, key: &SearchKey, params: &SearchParams, ctx: &BuildContext<'_>) -> SearchResults {
        let candidates = match self.corpus.candidates(params.target) {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!("[search]: cannot load {:?} candidates: {e:#}", params.target);
                return SearchResults {
                    status: SearchStatus::Unavailable(format!("{e:#}")),
                    params: params.clone(),
                    ..Default::default()
                };
            }
        };

        let needles = params.query.split_whitespace().collect_vec();
        let mut matches = vec![];
        for (index, candidate) in candidates.iter().enumerate() {
            if index % CHECK_INTERVAL == 0 && ctx.is_superseded() {
                tracing::debug!("[search]: abandon search {key:?} for {:?} at {index}", params.query);
                return SearchResults {
                    params: params.clone(),
                    ..Default::default()
                };
            }
            if let Some(mut m) = fuzzy_match(&needles, candidate) {
                m.index = index;
                matches.push(m);
            }
        }
        matches.sort_by_key(|m| (Reverse(m.score), candidates[m.index].len(), m.index));

        tracing::trace!(
            "[search]: {key:?} matched {} of {} candidates for {:?}",
            matches.len(),
            candidates.len(),
            params.query
        );
        SearchResults {
            status: SearchStatus::Done,
            params: params.clone(),
            candidates: Some(candidates),
            matches,
        }
    }
}

/// A search result cache.
pub type SearchCache<C> = ArtifactCache<SearchDomain<C>>;

/// Config of search caches.
///
/// One node per open search view. Builds are superseded on every keystroke, so there are more buckets to queue
/// distinct queries behind a running search.
pub fn default_config() -> CacheConfig {
    CacheConfig {
        name: "search".to_string(),
        slots: 64,
        buckets: 4,
        builders: 2,
        queue_capacity: 256,
        evict_after: Duration::from_secs(30),
        evict_after_user_clocks: 300,
        ..Default::default()
    }
}

/// Builder of a search cache.
pub fn builder<C>(corpus: C) -> ArtifactCacheBuilder<SearchDomain<C>>
where
    C: SearchCorpus,
{
    ArtifactCacheBuilder::new(SearchDomain::new(corpus)).with_config(default_config())
}
