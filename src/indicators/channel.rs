use crate::models::Bar;

/// Highest high and lowest low over a window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channel {
    pub upper: f64,
    pub lower: f64,
}

/// Donchian channel of the `period` bars before the last one
///
/// The newest bar is excluded so a close can be compared against the range
/// it broke out of.
pub fn donchian_channel(bars: &[Bar], period: usize) -> Option<Channel> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let window = &bars[bars.len() - 1 - period..bars.len() - 1];
    let upper = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let lower = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);

    Some(Channel { upper, lower })
}
