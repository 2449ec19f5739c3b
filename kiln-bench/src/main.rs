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

//! A frame-driven bench tool for kiln artifact caches.
//!
//! Frame threads emulate a debugger UI: every frame opens a scope, looks up a batch of keys under a per-frame
//! deadline, prefetches a few more and closes the scope. Builds run on a synthetic domain that sleeps.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use hdrhistogram::Histogram;
use kiln_cache::{ArtifactCache, ArtifactCacheBuilder, BuildContext, Clock, Domain, Metrics, Routing};
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Frame threads.
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// (s)
    #[arg(long, default_value_t = 10)]
    time: u64,

    /// Distinct keys.
    #[arg(long, default_value_t = 10_000)]
    keys: u64,

    /// Keys of the hot set, taken from the start of the key range.
    #[arg(long, default_value_t = 256)]
    hot_keys: u64,

    /// Share of lookups that go to the hot set, between 0 and 1. The rest is uniform over all keys.
    #[arg(long, default_value_t = 0.9)]
    hot_ratio: f64,

    /// Lookups per frame.
    #[arg(long, default_value_t = 64)]
    frame_lookups: usize,

    /// Prefetch requests per frame.
    #[arg(long, default_value_t = 8)]
    frame_prefetches: usize,

    /// Lookup deadline of a frame. (us)
    #[arg(long, default_value_t = 2_000)]
    frame_budget: u64,

    /// Pause between two frames. (ms)
    #[arg(long, default_value_t = 16)]
    frame_interval: u64,

    /// Time a synthetic build takes. (us)
    #[arg(long, default_value_t = 500)]
    build_time: u64,

    /// Change the lookup params every this many frames. `0` never changes them.
    #[arg(long, default_value_t = 0)]
    param_period: u64,

    /// Payload size of a synthetic artifact. (B)
    #[arg(long, default_value_t = 4096)]
    artifact_size: usize,

    /// Hash slots.
    #[arg(long, default_value_t = 1024)]
    slots: usize,

    /// Lock stripes. Defaults to the CPU count.
    #[arg(long)]
    stripes: Option<usize>,

    /// Submission buckets per node.
    #[arg(long, default_value_t = 3)]
    buckets: usize,

    /// Builder threads.
    #[arg(long, default_value_t = 4)]
    builders: usize,

    /// Route requests to builders by key hash.
    #[arg(long, default_value_t = false)]
    affinity: bool,

    /// Capacity of each request queue.
    #[arg(long, default_value_t = 1024)]
    queue_capacity: usize,

    /// Pause between two evictor sweeps. (ms)
    #[arg(long, default_value_t = 100)]
    sweep_interval: u64,

    /// Wall time a node must stay untouched before eviction. (ms)
    #[arg(long, default_value_t = 1_000)]
    evict_after: u64,

    /// Frames a node must stay untouched before eviction.
    #[arg(long, default_value_t = 60)]
    evict_after_frames: u64,
}

/// Artifact of [`SyntheticDomain`].
#[derive(Debug, Default)]
struct Synthetic {
    key: u64,
    version: u64,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct SyntheticDomain {
    build_time: Duration,
    artifact_size: usize,
    builds: AtomicU64,
    abandons: AtomicU64,
}

impl Domain for SyntheticDomain {
    type Key = u64;
    type Params = u64;
    type Artifact = Synthetic;

    fn build(&self, key: &u64, version: &u64, ctx: &BuildContext<'_>) -> Synthetic {
        let start = Instant::now();
        while start.elapsed() < self.build_time {
            if ctx.is_superseded() {
                self.abandons.fetch_add(1, Ordering::Relaxed);
                return Synthetic::default();
            }
            thread::sleep(Duration::from_micros(100).min(self.build_time));
        }
        self.builds.fetch_add(1, Ordering::Relaxed);
        Synthetic {
            key: *key,
            version: *version,
            payload: vec![*key as u8; self.artifact_size],
        }
    }
}

#[derive(Debug)]
struct Report {
    latency: Histogram<u64>,
    frames: u64,
    hits: u64,
    stales: u64,
    misses: u64,
    prefetches: u64,
    rejects: u64,
}

impl Report {
    fn new() -> Self {
        Self {
            // 1us ..= 60s
            latency: Histogram::new_with_bounds(1, 60_000_000, 3).unwrap(),
            frames: 0,
            hits: 0,
            stales: 0,
            misses: 0,
            prefetches: 0,
            rejects: 0,
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        let us = (latency.as_micros() as u64).max(1);
        if let Err(e) = self.latency.record(us) {
            tracing::error!("[bench]: latency record error: {:?}, value: {}us", e, us);
        }
    }

    fn merge(&mut self, other: &Report) {
        if let Err(e) = self.latency.add(&other.latency) {
            tracing::error!("[bench]: latency merge error: {:?}", e);
        }
        self.frames += other.frames;
        self.hits += other.hits;
        self.stales += other.stales;
        self.misses += other.misses;
        self.prefetches += other.prefetches;
        self.rejects += other.rejects;
    }
}

fn frames(id: usize, args: &Args, cache: &ArtifactCache<SyntheticDomain>, stop: Instant) -> Report {
    let mut rng = SmallRng::seed_from_u64(id as u64);
    let mut report = Report::new();
    let clock = cache.clock();

    let pick = |rng: &mut SmallRng| {
        if rng.random_bool(args.hot_ratio.clamp(0.0, 1.0)) {
            rng.random_range(0..args.hot_keys.clamp(1, args.keys))
        } else {
            rng.random_range(0..args.keys)
        }
    };

    let mut frame = 0;
    while Instant::now() < stop {
        let start = Instant::now();
        let version = match args.param_period {
            0 => 0,
            period => frame / period,
        };

        let scope = cache.open_scope();
        let deadline = cache.deadline_after(Duration::from_micros(args.frame_budget));
        for _ in 0..args.frame_lookups {
            let key = pick(&mut rng);
            let lookup_start = Instant::now();
            let lookup = scope.lookup(&key, &version, deadline);
            report.record_latency(lookup_start.elapsed());
            match (lookup.stale, lookup.artifact.as_ref()) {
                (false, Some(artifact)) => {
                    debug_assert_eq!(artifact.key, key);
                    debug_assert_eq!(artifact.version, version);
                    debug_assert_eq!(artifact.payload.len(), args.artifact_size);
                    report.hits += 1;
                }
                (_, Some(_)) => report.stales += 1,
                (_, None) => report.misses += 1,
            }
        }
        scope.close();

        for _ in 0..args.frame_prefetches {
            let key = pick(&mut rng);
            report.prefetches += 1;
            if !cache.request(&key, &version, clock.now_us()) {
                report.rejects += 1;
            }
        }

        if id == 0 {
            clock.advance_user_clock();
        }
        frame += 1;
        report.frames += 1;

        let elapsed = start.elapsed();
        let interval = Duration::from_millis(args.frame_interval);
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
    tracing::debug!(
        "[bench]: frame thread {id} finished {} frames, {} rejected prefetches",
        report.frames,
        report.rejects
    );
    report
}

fn print_report(args: &Args, report: &Report, cache: &ArtifactCache<SyntheticDomain>, elapsed: Duration) {
    let lookups = report.hits + report.stales + report.misses;
    let pct = |n: u64| if lookups == 0 { 0.0 } else { n as f64 * 100.0 / lookups as f64 };
    let domain = cache.domain();

    println!();
    println!("Total:");
    println!("elapsed: {:.3}s", elapsed.as_secs_f64());
    println!("frames: {} ({:.1}/s)", report.frames, report.frames as f64 / elapsed.as_secs_f64());
    println!("lookups: {lookups}");
    println!("  fresh: {} ({:.2}%)", report.hits, pct(report.hits));
    println!("  stale: {} ({:.2}%)", report.stales, pct(report.stales));
    println!("  empty: {} ({:.2}%)", report.misses, pct(report.misses));
    println!("prefetches: {}, rejected: {}", report.prefetches, report.rejects);
    println!(
        "builds: {}, abandoned: {}",
        domain.builds.load(Ordering::Relaxed),
        domain.abandons.load(Ordering::Relaxed)
    );
    println!("nodes: {} (keys: {})", cache.len(), args.keys);
    println!("lookup latency:");
    for q in [0.5, 0.9, 0.99, 0.999, 0.9999] {
        println!("  p{:<7} {}us", q * 100.0, report.latency.value_at_quantile(q));
    }
    println!("  pmax    {}us", report.latency.max());
}

#[cfg(not(feature = "tracing"))]
fn init_logger() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_thread_names(true).with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();
}

#[cfg(feature = "tracing")]
fn init_logger() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_names(true)
                .with_line_number(true)
                .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE),
        )
        .with(EnvFilter::from_default_env())
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logger();

    #[cfg(feature = "deadlock")]
    {
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_secs(1));
            let deadlocks = parking_lot::deadlock::check_deadlock();
            if deadlocks.is_empty() {
                continue;
            }

            println!("{} deadlocks detected", deadlocks.len());
            for (i, threads) in deadlocks.iter().enumerate() {
                println!("Deadlock #{}", i);
                for t in threads {
                    println!("Thread Id {:#?}", t.thread_id());
                    println!("{:#?}", t.backtrace());
                }
            }
            panic!()
        });
    }

    let args = Args::parse();
    println!("{:#?}", args);
    anyhow::ensure!(args.keys > 0, "\"--keys\" value must be greater than 0");
    anyhow::ensure!(args.threads > 0, "\"--threads\" value must be greater than 0");

    let domain = SyntheticDomain {
        build_time: Duration::from_micros(args.build_time),
        artifact_size: args.artifact_size,
        builds: AtomicU64::new(0),
        abandons: AtomicU64::new(0),
    };
    let mut builder = ArtifactCacheBuilder::new(domain)
        .with_name("bench")
        .with_clock(Clock::new())
        .with_metrics(Metrics::noop())
        .with_slots(args.slots)
        .with_buckets(args.buckets)
        .with_builders(args.builders)
        .with_routing(if args.affinity { Routing::Affinity } else { Routing::Shared })
        .with_queue_capacity(args.queue_capacity)
        .with_sweep_interval(Duration::from_millis(args.sweep_interval))
        .with_eviction_threshold(Duration::from_millis(args.evict_after), args.evict_after_frames);
    if let Some(stripes) = args.stripes {
        builder = builder.with_stripes(stripes);
    }
    let cache = Arc::new(builder.build()?);

    let total = Arc::new(Mutex::new(Report::new()));
    let start = Instant::now();
    let stop = start + Duration::from_secs(args.time);

    let handles = (0..args.threads)
        .map(|id| {
            let args = args.clone();
            let cache = cache.clone();
            let total = total.clone();
            thread::Builder::new()
                .name(format!("kiln-bench-frame-{id}"))
                .spawn(move || {
                    let report = frames(id, &args, &cache, stop);
                    total.lock().merge(&report);
                })
        })
        .collect::<std::io::Result<Vec<_>>>()?;
    for handle in handles {
        if handle.join().is_err() {
            anyhow::bail!("frame thread panicked");
        }
    }

    print_report(&args, &total.lock(), &cache, start.elapsed());
    Ok(())
}
