// Copyright 2024-2026 CloudControl Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config CLI subcommands: show, defaults, validate.
//!
//! These commands read configuration directly from environment variables;
//! no service is started.

use crate::config::{self, EffectiveConfig};

/// Print effective config as key-value pairs to stdout.
pub fn run_show() {
    let cfg = config::load().effective_config();
    print_config(&cfg);
}

/// Print default config values (no env overrides) to stdout.
pub fn run_defaults() {
    println!("CLOUDCTL_WORKER_THREADS=0");
    println!("CLOUDCTL_WORKER_QUEUE=10000");
    println!("CLOUDCTL_WORKER_TIMEOUT_MS=10000");
    println!("CLOUDCTL_POOL_MAX_SIZE=1200");
    println!("CLOUDCTL_POOL_MIN_IDLE=10");
    println!("CLOUDCTL_POOL_MAX_IDLE_SECS=600");
    println!("CLOUDCTL_POOL_CLEANUP_SECS=120");
    println!("CLOUDCTL_CACHE_MAX_ENTRIES=500");
    println!("CLOUDCTL_CACHE_TTL_MS=300");
    println!("CLOUDCTL_BATCH_SIZE=10");
    println!("CLOUDCTL_BATCH_FLUSH_MS=50");
    println!("CLOUDCTL_CHANNEL_MAX=1200");
    println!("CLOUDCTL_CHANNEL_IDLE_SECS=120");
    println!("CLOUDCTL_STREAM_MIN_INTERVAL_MS=30");
    println!("CLOUDCTL_STREAM_DEFAULT_INTERVAL_MS=50");
    println!("CLOUDCTL_SHUTDOWN_TIMEOUT=30");
}

/// Validate configuration for obvious misconfigurations.
///
/// Returns 0 if valid, 1 if any warnings are found.
pub fn run_validate() -> i32 {
    let cfg = config::load().effective_config();
    let warnings = validate(&cfg);
    for warning in &warnings {
        eprintln!("WARNING: {warning}");
    }

    if warnings.is_empty() {
        println!("Configuration is valid.");
        0
    } else {
        1
    }
}

fn validate(cfg: &EffectiveConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if cfg.channel_max > cfg.pool_max_size {
        warnings.push(format!(
            "CLOUDCTL_CHANNEL_MAX ({}) > CLOUDCTL_POOL_MAX_SIZE ({}); channels will churn connections",
            cfg.channel_max, cfg.pool_max_size
        ));
    }

    if cfg.pool_max_idle_secs < cfg.channel_idle_secs {
        warnings.push(format!(
            "CLOUDCTL_POOL_MAX_IDLE_SECS ({}) < CLOUDCTL_CHANNEL_IDLE_SECS ({})",
            cfg.pool_max_idle_secs, cfg.channel_idle_secs
        ));
    }

    if cfg.worker_timeout_ms == 0 {
        warnings.push(
            "CLOUDCTL_WORKER_TIMEOUT_MS is 0; a hung device call blocks its caller indefinitely"
                .to_string(),
        );
    }

    if cfg.cache_ttl_ms >= cfg.stream_default_interval_ms * 10 {
        warnings.push(format!(
            "CLOUDCTL_CACHE_TTL_MS ({}) is far above the stream interval ({} ms); viewers will see stale frames",
            cfg.cache_ttl_ms, cfg.stream_default_interval_ms
        ));
    }

    warnings
}

fn print_config(cfg: &EffectiveConfig) {
    println!("CLOUDCTL_WORKER_THREADS={}", cfg.worker_threads);
    println!("CLOUDCTL_WORKER_QUEUE={}", cfg.worker_queue);
    println!("CLOUDCTL_WORKER_TIMEOUT_MS={}", cfg.worker_timeout_ms);
    println!("CLOUDCTL_POOL_MAX_SIZE={}", cfg.pool_max_size);
    println!("CLOUDCTL_POOL_MIN_IDLE={}", cfg.pool_min_idle);
    println!("CLOUDCTL_POOL_MAX_IDLE_SECS={}", cfg.pool_max_idle_secs);
    println!("CLOUDCTL_POOL_CLEANUP_SECS={}", cfg.pool_cleanup_secs);
    println!("CLOUDCTL_CACHE_MAX_ENTRIES={}", cfg.cache_max_entries);
    println!("CLOUDCTL_CACHE_TTL_MS={}", cfg.cache_ttl_ms);
    println!("CLOUDCTL_BATCH_SIZE={}", cfg.batch_size);
    println!("CLOUDCTL_BATCH_FLUSH_MS={}", cfg.batch_flush_ms);
    println!("CLOUDCTL_CHANNEL_MAX={}", cfg.channel_max);
    println!("CLOUDCTL_CHANNEL_IDLE_SECS={}", cfg.channel_idle_secs);
    println!("CLOUDCTL_STREAM_MIN_INTERVAL_MS={}", cfg.stream_min_interval_ms);
    println!("CLOUDCTL_STREAM_DEFAULT_INTERVAL_MS={}", cfg.stream_default_interval_ms);
    println!("CLOUDCTL_SHUTDOWN_TIMEOUT={}", cfg.shutdown_timeout_secs);
}
