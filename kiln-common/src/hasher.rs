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

use std::hash::{BuildHasher, Hasher};

use twox_hash::XxHash3_128;

/// The hash builder trait every cache is generic over.
pub trait HashBuilder: BuildHasher + Send + Sync + 'static {}
impl<T> HashBuilder for T where T: BuildHasher + Send + Sync + 'static {}

/// Default hash builder for keys and params.
pub type DefaultHashBuilder = ahash::RandomState;

/// Hash `data` into a 128-bit content identity.
///
/// Content hashes key artifacts derived from raw bytes, e.g. disassembly of a code range. They must be stable across
/// processes, so they never go through the seeded [`DefaultHashBuilder`].
pub fn content_hash(data: &[u8]) -> u128 {
    XxHash3_128::oneshot(data)
}

/// A hasher that folds the big-endian bytes of its input into a `u64`.
///
/// Hashing a `u64` yields the integer itself, which lets tests decide which slot and stripe a key lands in.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModHasher {
    state: u64,
}

impl Hasher for ModHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.state = (self.state << 8) + *byte as u64;
        }
    }

    fn write_u8(&mut self, i: u8) {
        self.write(&[i])
    }

    fn write_u16(&mut self, i: u16) {
        self.write(&i.to_be_bytes())
    }

    fn write_u32(&mut self, i: u32) {
        self.write(&i.to_be_bytes())
    }

    fn write_u64(&mut self, i: u64) {
        self.write(&i.to_be_bytes())
    }

    fn write_usize(&mut self, i: usize) {
        self.write(&i.to_be_bytes())
    }
}

impl BuildHasher for ModHasher {
    type Hasher = Self;

    fn build_hasher(&self) -> Self::Hasher {
        Self::default()
    }
}
