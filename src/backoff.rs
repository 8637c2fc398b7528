// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Failure-count based retry delays.

use rand::Rng;
use std::time::Duration;

/// Upper bound for any computed delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Relative jitter applied around the exponential base
const JITTER: f64 = 0.2;

/// Wait duration after `failures` consecutive failures.
///
/// Zero for no failures, otherwise `2^(failures-1)` seconds with ±20% uniform
/// jitter, capped at [`MAX_BACKOFF`].
pub fn backoff(failures: i64) -> Duration {
    if failures <= 0 {
        return Duration::ZERO;
    }

    // 2^9 = 512s is already past the cap even with -20% jitter
    if failures > 9 {
        return MAX_BACKOFF;
    }

    let base = 2f64.powi((failures - 1) as i32);
    let factor = rand::thread_rng().gen_range((1.0 - JITTER)..=(1.0 + JITTER));

    Duration::from_secs_f64(base * factor).min(MAX_BACKOFF)
}
