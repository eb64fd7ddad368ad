// Risk management module
pub mod limits;
pub mod sizer;

pub use limits::{AccountSnapshot, LimitTrip, RiskLimits, TradingGate};
pub use sizer::{round_price, step_precision, RiskSizer};
