//! Wrap-aware arithmetic on sensor timestamps.
//!
//! Event timestamps are a 24-bit counter that wraps. A numerically smaller
//! raw value can be logically later, so nothing in this crate subtracts raw
//! timestamps directly; everything goes through these helpers.

use crate::event::EventRef;

/// Width of the sensor timestamp counter.
pub const TIMESTAMP_BITS: u32 = 24;
/// Number of distinct timestamp values before the counter wraps.
pub const TIMESTAMP_PERIOD: u32 = 1 << TIMESTAMP_BITS;
pub const TIMESTAMP_MASK: u32 = TIMESTAMP_PERIOD - 1;

/// Ticks elapsed from `earlier` to `later`, modulo the counter period.
#[inline]
pub fn elapsed(later: u32, earlier: u32) -> u32 {
    later.wrapping_sub(earlier) & TIMESTAMP_MASK
}

/// True if `a` is logically after `b`.
///
/// Two stamps are ordered by the shorter way round the counter: `a` is later
/// when it lies less than half a period ahead of `b`.
#[inline]
pub fn is_later(a: u32, b: u32) -> bool {
    let d = elapsed(a, b);
    d != 0 && d < TIMESTAMP_PERIOD / 2
}

/// Sort `events` newest first relative to `now`.
///
/// Cache queries return events in row-major order; callers that need
/// chronological order sort explicitly with this.
pub fn sort_by_recency(events: &mut [EventRef], now: u32) {
    events.sort_by_key(|e| elapsed(now, e.timestamp));
}
