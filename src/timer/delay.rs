use embedded_hal::delay::DelayNs;

use super::TickBudget;

/// Runs `poll` until it yields a value, fails, or the budget runs out.
///
/// `poll` is attempted once up front and then once after every tick, so a
/// budget of `n` ticks gives `n + 1` attempts and sleeps at most `n` ticks.
///
/// # Arguments
/// - `delay`: A delay provider implementing `DelayNs`, typically from the HAL.
/// - `budget`: How many ticks to wait, and how long a tick is.
/// - `poll`: A non-blocking operation returning [`nb::Error::WouldBlock`] while not ready.
///
/// # Returns
/// - `Ok(Some(value))` once `poll` succeeds
/// - `Ok(None)` if the budget was exhausted
/// - `Err(e)` as soon as `poll` reports an error
///
/// # Example
/// ```rust
/// # use embedded_hal_mock::eh1::delay::NoopDelay;
/// use satcomms::timer::{poll_with_budget, TickBudget};
///
/// let mut delay = NoopDelay::new();
/// let mut attempts = 0;
/// let result: Result<Option<u8>, ()> = poll_with_budget(&mut delay, TickBudget::new(3, 1_000), || {
///     attempts += 1;
///     if attempts == 2 { Ok(7) } else { Err(nb::Error::WouldBlock) }
/// });
/// assert_eq!(result, Ok(Some(7)));
/// ```
pub fn poll_with_budget<D, T, E, F>(delay: &mut D, budget: TickBudget, mut poll: F) -> Result<Option<T>, E>
where
    D: DelayNs,
    F: FnMut() -> nb::Result<T, E>,
{
    let mut elapsed: u32 = 0;
    loop {
        match poll() {
            Ok(value) => return Ok(Some(value)),
            Err(nb::Error::Other(e)) => return Err(e),
            Err(nb::Error::WouldBlock) => {
                if elapsed >= budget.ticks {
                    return Ok(None);
                }
                delay.delay_us(budget.tick_us);
                elapsed += 1;
            }
        }
    }
}
