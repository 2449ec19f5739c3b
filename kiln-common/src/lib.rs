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

//! Shared components and utils for kiln.

/// Assertion helpers that harden under the `strict_assertions` feature.
pub mod assert;
/// The clock pair that drives deadlines and eviction aging.
pub mod clock;
/// Hashing helpers.
pub mod hasher;
/// Metrics bundle shared by every cache instance.
pub mod metrics;
