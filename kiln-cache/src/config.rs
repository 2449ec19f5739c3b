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

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How build requests are spread over builder threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    /// One queue drained by all builders.
    #[default]
    Shared,
    /// One queue per builder. Requests for a key always land on the same builder.
    Affinity,
}

/// Configuration of an artifact cache.
///
/// Usually filled through [`crate::ArtifactCacheBuilder`]. The struct is serde-friendly so embedders can keep cache
/// tuning in their settings files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache name, used in thread names, logs and metric labels.
    pub name: String,
    /// Hash slots in the slot table.
    pub slots: usize,
    /// Lock stripes. `None` means `min(slots, available parallelism)`.
    pub stripes: Option<usize>,
    /// Submission buckets per node. Must be at least 2.
    pub buckets: usize,
    /// Builder threads.
    pub builders: usize,
    /// Request routing.
    pub routing: Routing,
    /// Capacity of each request queue, in requests.
    pub queue_capacity: usize,
    /// Run a background evictor.
    pub evictor: bool,
    /// Pause between two evictor sweeps.
    pub sweep_interval: Duration,
    /// Minimum wall time since the last touch before a node may be evicted.
    pub evict_after: Duration,
    /// Minimum user clock ticks since the last touch before a node may be evicted.
    pub evict_after_user_clocks: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "kiln".to_string(),
            slots: 1024,
            stripes: None,
            buckets: 3,
            builders: default_builders(),
            routing: Routing::Shared,
            queue_capacity: 1024,
            evictor: true,
            sweep_interval: Duration::from_secs(1),
            evict_after: Duration::from_secs(10),
            evict_after_user_clocks: 10,
        }
    }
}

impl CacheConfig {
    /// Reject configs the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.slots == 0 {
            return Err(Error::config("slots must be greater than zero"));
        }
        if self.stripes == Some(0) {
            return Err(Error::config("stripes must be greater than zero"));
        }
        if self.buckets < 2 {
            return Err(Error::config(format!(
                "buckets must be at least 2, given: {}",
                self.buckets
            )));
        }
        if self.builders == 0 {
            return Err(Error::config("builders must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::config("queue capacity must be greater than zero"));
        }
        if self.evictor && self.sweep_interval.is_zero() {
            return Err(Error::config("sweep interval must be non-zero when the evictor is enabled"));
        }
        Ok(())
    }

    /// Stripe count after resolving the default.
    ///
    /// Never exceeds the slot count, since a stripe without slots would only cost a lock.
    pub fn stripe_count(&self) -> usize {
        self.stripes.unwrap_or_else(available_parallelism).clamp(1, self.slots.max(1))
    }
}

/// Builder threads sized off the CPU count, between 1 and 4.
pub fn default_builders() -> usize {
    (available_parallelism() / 2).clamp(1, 4)
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert!((1..=4).contains(&config.builders));
        assert!(config.stripe_count() <= config.slots);
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let cases = [
            CacheConfig {
                slots: 0,
                ..Default::default()
            },
            CacheConfig {
                stripes: Some(0),
                ..Default::default()
            },
            CacheConfig {
                buckets: 1,
                ..Default::default()
            },
            CacheConfig {
                builders: 0,
                ..Default::default()
            },
            CacheConfig {
                queue_capacity: 0,
                ..Default::default()
            },
            CacheConfig {
                sweep_interval: Duration::ZERO,
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn test_stripe_count_never_exceeds_slots() {
        let config = CacheConfig {
            slots: 2,
            stripes: Some(16),
            ..Default::default()
        };
        assert_eq!(config.stripe_count(), 2);
    }

    #[test]
    fn test_config_from_json() {
        let config: CacheConfig =
            serde_json::from_str(r#"{ "name": "dasm", "slots": 256, "routing": "affinity", "buckets": 4 }"#).unwrap();
        assert_eq!(config.name, "dasm");
        assert_eq!(config.slots, 256);
        assert_eq!(config.routing, Routing::Affinity);
        assert_eq!(config.buckets, 4);
        assert_eq!(config.queue_capacity, CacheConfig::default().queue_capacity);
    }
}
