//! Tick budgets and bounded polling.
//!
//! Neither link blocks indefinitely: every wait is a busy-wait on a
//! non-blocking poll, sleeping one tick between attempts with an
//! `embedded_hal::delay::DelayNs` provider, and gives up once its tick budget
//! is spent.
//!
//! Contains:
//! - [`ticks_for_ms`] / [`const_ticks_for_ms`]: convert a timeout to a tick budget
//! - [`TickBudget`]: a budget plus tick length, as carried in link configs
//! - [`poll_with_budget`]: the bounded polling loop (see `delay.rs`)
//!
//! | Tick length | Budget | Timeout |
//! |-------------|--------|---------|
//! |       1 ms  |  1000  |   1 s   |
//! |      10 ms  |   100  |   1 s   |
//! |      10 ms  |  1000  |  10 s   |

mod delay;
pub use delay::*;

/// 1,000 microseconds = 1 millisecond
pub const MICROSECONDS_PER_MILLISECOND: u32 = 1_000;

/// Computes how many ticks of `tick_us` cover `timeout_ms`.
///
/// # Arguments
/// - `timeout_ms`: timeout in milliseconds
/// - `tick_us`: tick length in microseconds; `0` is treated as 1 µs
///
/// # Returns
/// - Number of ticks, rounded up so the budget never undershoots the timeout
pub fn ticks_for_ms(timeout_ms: u32, tick_us: u32) -> u32 {
    const_ticks_for_ms(timeout_ms, tick_us)
}

/// Compile-time variant of [`ticks_for_ms`].
pub const fn const_ticks_for_ms(timeout_ms: u32, tick_us: u32) -> u32 {
    let tick_us = if tick_us == 0 { 1 } else { tick_us as u64 };
    let timeout_us = timeout_ms as u64 * MICROSECONDS_PER_MILLISECOND as u64;
    let ticks = timeout_us.div_ceil(tick_us);
    if ticks > u32::MAX as u64 {
        u32::MAX
    } else {
        ticks as u32
    }
}

/// A number of ticks of a fixed length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct TickBudget {
    /// Number of ticks to wait before giving up.
    pub ticks: u32,
    /// Length of one tick in microseconds.
    pub tick_us: u32,
}

impl TickBudget {
    /// A budget of `ticks` ticks of `tick_us` microseconds.
    pub const fn new(ticks: u32, tick_us: u32) -> Self {
        Self { ticks, tick_us }
    }

    /// A budget covering `timeout_ms`, polled every `poll_ms`.
    pub const fn from_ms(timeout_ms: u32, poll_ms: u32) -> Self {
        let tick_us = poll_ms.saturating_mul(MICROSECONDS_PER_MILLISECOND);
        Self {
            ticks: const_ticks_for_ms(timeout_ms, tick_us),
            tick_us,
        }
    }
}
