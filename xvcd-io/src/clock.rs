//! FTDI MPSSE clock divisor arithmetic.
//!
//! The MPSSE clocks at `CLOCK_HZ / (2 * (divisor + 1))`. We invert that to
//! find the smallest divisor whose resulting rate does not exceed the rate
//! XVC asked for, then report back the rate we actually settled on so the
//! caller can tell the client the truth.

/// Base MPSSE clock, fixed by the FT2232/FT232H family.
pub const CLOCK_HZ: u32 = 60_000_000;

/// Highest divisor the hardware register can hold (`divisor` is 16-bit).
const MAX_DIVISOR: u32 = 65536;

/// Picks a clock divisor for a requested TCK frequency and returns
/// `(divisor, actual_hz)`. `divisor` is clamped to `1..=65536`; a
/// requested frequency at or above `CLOCK_HZ / 2` yields the minimum
/// divisor of 1, and anything at or below `CLOCK_HZ / (2 * 65536)`
/// yields the maximum.
pub fn divisor_for_frequency(freq_hz: u32) -> (u16, u32) {
    let freq_hz = freq_hz.max(1);
    let half_clock = CLOCK_HZ / 2;
    let divisor = half_clock.div_ceil(freq_hz).clamp(1, MAX_DIVISOR);
    let actual_hz = half_clock / divisor;
    // The register stores divisor - 1 as a 16-bit value.
    (((divisor - 1) & 0xffff) as u16, actual_hz)
}
