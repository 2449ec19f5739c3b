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

//! Disassembly of code ranges, keyed by the content hash of their bytes.

use std::{fmt::Display, time::Duration};

use bitflags::bitflags;
use bytes::Bytes;
use itertools::Itertools;
use kiln_cache::{ArtifactCache, ArtifactCacheBuilder, BuildContext, CacheConfig, Domain};
use kiln_common::hasher::content_hash;

/// Instructions decoded between two supersession checks.
const CHECK_INTERVAL: usize = 256;

/// 128-bit identity of a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub u128);

impl ContentHash {
    /// Hash `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(content_hash(data))
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Content-addressed byte store.
pub trait ContentSource: Send + Sync + 'static {
    /// Bytes whose [`ContentHash`] is `hash`.
    fn fetch(&self, hash: ContentHash) -> anyhow::Result<Bytes>;
}

/// Instruction set architecture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Arch {
    /// x86-64.
    #[default]
    X64,
    /// 32-bit x86.
    X86,
    /// AArch64.
    Arm64,
}

bitflags! {
    /// Rendering options of a disassembly.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyntaxFlags: u32 {
        /// Prefix every line with its address.
        const ADDRESSES = 1 << 0;
        /// Show the encoded bytes of every instruction.
        const CODE_BYTES = 1 << 1;
        /// AT&T instead of Intel syntax, for x86.
        const ATT = 1 << 2;
        /// Lowercase mnemonics and registers.
        const LOWERCASE = 1 << 3;
    }
}

impl Default for SyntaxFlags {
    fn default() -> Self {
        Self::ADDRESSES | Self::LOWERCASE
    }
}

/// Inputs of a disassembly besides the bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DisasmParams {
    /// Architecture to decode for.
    pub arch: Arch,
    /// Virtual address of the first byte.
    pub base_vaddr: u64,
    /// Rendering options.
    pub syntax: SyntaxFlags,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Encoded length in bytes.
    pub size: usize,
    /// Mnemonic and operands.
    pub text: String,
}

/// Decodes machine code.
pub trait Disassembler: Send + Sync + 'static {
    /// Decode the instruction at the start of `code`, located at `addr`. `None` if the bytes are no valid
    /// instruction.
    fn decode(&self, arch: Arch, syntax: SyntaxFlags, addr: u64, code: &[u8]) -> Option<Instruction>;
}

/// A rendered line of a disassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisasmLine {
    /// Address of the instruction.
    pub addr: u64,
    /// Encoded length in bytes.
    pub size: u64,
    /// Rendered text.
    pub text: String,
}

/// Outcome of a disassembly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DisasmStatus {
    /// Nothing decoded.
    #[default]
    Empty,
    /// The bytes could not be fetched.
    Unavailable(String),
    /// Every byte is decoded.
    Done,
}

/// Disassembly of a code range.
#[derive(Debug, Default)]
pub struct Disassembly {
    status: DisasmStatus,
    lines: Vec<DisasmLine>,
}

impl Disassembly {
    /// Outcome.
    pub fn status(&self) -> &DisasmStatus {
        &self.status
    }

    /// Lines, by ascending address.
    pub fn lines(&self) -> &[DisasmLine] {
        &self.lines
    }

    /// Index of the line whose instruction covers `addr`.
    pub fn line_for_addr(&self, addr: u64) -> Option<usize> {
        let idx = self.lines.partition_point(|line| line.addr <= addr).checked_sub(1)?;
        let line = &self.lines[idx];
        (addr - line.addr < line.size).then_some(idx)
    }
}

/// Disassembles content fetched from a [`ContentSource`] with a [`Disassembler`].
#[derive(Debug)]
pub struct DisasmDomain<S, D> {
    source: S,
    disassembler: D,
}

impl<S, D> DisasmDomain<S, D>
where
    S: ContentSource,
    D: Disassembler,
{
    /// Create a domain.
    pub fn new(source: S, disassembler: D) -> Self {
        Self { source, disassembler }
    }

    /// The content source.
    pub fn source(&self) -> &S {
        &self.source
    }

    fn render(&self, params: &DisasmParams, addr: u64, code: &[u8], text: &str) -> String {
        let mut line = String::new();
        if params.syntax.contains(SyntaxFlags::ADDRESSES) {
            line.push_str(&format!("{addr:016x}  "));
        }
        if params.syntax.contains(SyntaxFlags::CODE_BYTES) {
            line.push_str(&format!("{:<24}", code.iter().map(|b| format!("{b:02x}")).join(" ")));
        }
        line.push_str(text);
        line
    }
}

impl<S, D> Domain for DisasmDomain<S, D>
where
    S: ContentSource,
    D: Disassembler,
{
    type Key = ContentHash;
    type Params = DisasmParams;
    type Artifact = Disassembly;

    fn build(&self, key: &ContentHash, params: &DisasmParams, ctx: &BuildContext<'_>) -> Disassembly {
        let bytes = match self.source.fetch(*key) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("[disasm]: cannot fetch content {key}: {e:#}");
                return Disassembly {
                    status: DisasmStatus::Unavailable(format!("{e:#}")),
                    lines: vec![],
                };
            }
        };

        let mut lines = vec![];
        let mut offset = 0;
        while offset < bytes.len() {
            if lines.len() % CHECK_INTERVAL == 0 && ctx.is_superseded() {
                tracing::debug!("[disasm]: stop disassembling {key} at offset {offset}, superseded");
                return Disassembly {
                    status: DisasmStatus::Empty,
                    lines,
                };
            }

            let addr = params.base_vaddr.wrapping_add(offset as u64);
            let code = &bytes[offset..];
            let (size, text) = match self.disassembler.decode(params.arch, params.syntax, addr, code) {
                Some(inst) if inst.size > 0 && inst.size <= code.len() => (inst.size, inst.text),
                // Undecodable bytes take one line each.
                _ => (1, format!(".byte 0x{:02x}  (bad)", code[0])),
            };
            let text = if params.syntax.contains(SyntaxFlags::LOWERCASE) {
                text.to_lowercase()
            } else {
                text
            };
            lines.push(DisasmLine {
                addr,
                size: size as u64,
                text: self.render(params, addr, &code[..size], &text),
            });
            offset += size;
        }

        tracing::trace!("[disasm]: disassembled {key} into {} lines", lines.len());
        let status = if lines.is_empty() {
            DisasmStatus::Empty
        } else {
            DisasmStatus::Done
        };
        Disassembly { status, lines }
    }
}

/// A disassembly cache.
pub type DisasmCache<S, D> = ArtifactCache<DisasmDomain<S, D>>;

/// Config of disassembly caches.
///
/// Many small artifacts, rebuilt whenever the view scrolls to new code, and dropped soon after.
pub fn default_config() -> CacheConfig {
    CacheConfig {
        name: "disasm".to_string(),
        slots: 1024,
        queue_capacity: 1024,
        evict_after: Duration::from_secs(5),
        evict_after_user_clocks: 120,
        ..Default::default()
    }
}

/// Builder of a disassembly cache.
pub fn builder<S, D>(source: S, disassembler: D) -> ArtifactCacheBuilder<DisasmDomain<S, D>>
where
    S: ContentSource,
    D: Disassembler,
{
    ArtifactCacheBuilder::new(DisasmDomain::new(source, disassembler)).with_config(default_config())
}
