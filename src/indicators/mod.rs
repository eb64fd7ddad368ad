// Technical indicators used by the bundled strategies
// All functions take closed bars/prices oldest first and return None on insufficient data

pub mod atr;
pub mod channel;
pub mod moving_average;

pub use atr::calculate_atr;
pub use channel::{donchian_channel, Channel};
pub use moving_average::{calculate_sma, sma_series};
