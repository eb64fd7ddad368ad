use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{BotError, Result};
use crate::models::InstrumentMetadata;

/// Converts a stop distance into an order volume bounded by account risk
///
/// `volume = risk_fraction * balance / (ticks * tick_value)`, floored to the
/// instrument's volume step. Arithmetic is done in `Decimal` so the same
/// inputs always floor to the same step.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskSizer;

impl RiskSizer {
    pub fn size(
        &self,
        meta: &InstrumentMetadata,
        entry_price: f64,
        stop_loss: f64,
        risk_fraction: f64,
        account_balance: f64,
    ) -> Result<f64> {
        let tick_size = positive("tick_size", meta.tick_size)?;
        let tick_value = positive("tick_value", meta.tick_value)?;
        let step = positive("volume_step", meta.volume_step)?;
        let entry = decimal("entry_price", entry_price)?;
        let stop = decimal("stop_loss", stop_loss)?;
        let risk = positive("risk_fraction", risk_fraction)?;
        let balance = positive("account_balance", account_balance)?;

        let distance = checked("entry - stop", entry.checked_sub(stop))?.abs();
        if distance.is_zero() {
            return Err(BotError::Sizing(
                "entry equals stop loss, distance is zero".into(),
            ));
        }

        let ticks = checked("stop distance in ticks", distance.checked_div(tick_size))?;
        let risk_amount = checked("risk amount", risk.checked_mul(balance))?;
        let tick_risk = checked("risk per lot", ticks.checked_mul(tick_value))?;
        let raw = checked("raw volume", risk_amount.checked_div(tick_risk))?;

        let steps = checked("volume steps", raw.checked_div(step))?.floor();
        let volume = checked("volume", steps.checked_mul(step))?.round_dp(step_precision(step));
        if volume.is_zero() {
            return Err(BotError::Sizing(format!(
                "volume {} floors to zero at step {}",
                raw.round_dp(8),
                step
            )));
        }

        volume
            .to_f64()
            .ok_or_else(|| BotError::Sizing(format!("volume {} not representable", volume)))
    }
}

/// Decimal places of a step or tick size, e.g. 0.010 -> 2
pub fn step_precision(step: Decimal) -> u32 {
    step.normalize().scale()
}

/// Round a price to the decimal places of the instrument tick size
pub fn round_price(price: f64, tick_size: f64) -> f64 {
    let (Some(p), Some(t)) = (Decimal::from_f64(price), Decimal::from_f64(tick_size)) else {
        return price;
    };
    p.round_dp_with_strategy(step_precision(t), RoundingStrategy::MidpointAwayFromZero)
        .to_f64()
        .unwrap_or(price)
}

fn decimal(name: &str, value: f64) -> Result<Decimal> {
    if !value.is_finite() {
        return Err(BotError::Sizing(format!("{} is not finite: {}", name, value)));
    }
    Decimal::from_f64(value)
        .ok_or_else(|| BotError::Sizing(format!("{} out of range: {}", name, value)))
}

fn checked(what: &str, value: Option<Decimal>) -> Result<Decimal> {
    value.ok_or_else(|| BotError::Sizing(format!("{} overflows the decimal range", what)))
}

fn positive(name: &str, value: f64) -> Result<Decimal> {
    let d = decimal(name, value)?;
    if d <= Decimal::ZERO {
        return Err(BotError::Sizing(format!("{} must be positive, got {}", name, value)));
    }
    Ok(d)
}
