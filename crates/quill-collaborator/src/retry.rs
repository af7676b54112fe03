use std::sync::atomic::{AtomicU64, Ordering};

pub const BASE_BACKOFF_MS: u64 = 200;

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Deterministic exponential backoff with a capped shift.
pub fn next_backoff_ms(attempt: usize) -> u64 {
    let shift = attempt.min(6);
    BASE_BACKOFF_MS.saturating_mul(1_u64 << shift)
}

pub fn next_backoff_ms_with_jitter(attempt: usize, jitter_enabled: bool) -> u64 {
    backoff_delay_ms(BASE_BACKOFF_MS, attempt, jitter_enabled)
}

/// Exponential backoff from an arbitrary base, optionally jittered.
pub fn backoff_delay_ms(base_backoff_ms: u64, attempt: usize, jitter_enabled: bool) -> u64 {
    let shift = attempt.min(6);
    let base = base_backoff_ms.saturating_mul(1_u64 << shift);
    if !jitter_enabled || base <= 1 {
        return base;
    }

    // Bounded jitter in [50%, 100%] of the deterministic backoff.
    let low = base / 2;
    let width = base.saturating_sub(low);
    let seed = JITTER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17) ^ 0xA24B_AED4_963E_E407;
    let jitter = if width == 0 {
        0
    } else {
        mixed % width.saturating_add(1)
    };
    low.saturating_add(jitter)
}
