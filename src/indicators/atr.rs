/// Average True Range (ATR) with Wilder's smoothing
///
/// True Range is the greatest of high - low, |high - previous close| and
/// |low - previous close|.
use crate::models::Bar;

fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .map(|w| {
            let (prev, bar) = (&w[0], &w[1]);
            (bar.high - bar.low)
                .max((bar.high - prev.close).abs())
                .max((bar.low - prev.close).abs())
        })
        .collect()
}

/// Current ATR, or None with fewer than `period + 1` bars
pub fn calculate_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let ranges = true_ranges(bars);
    let first = ranges[..period].iter().sum::<f64>() / period as f64;

    Some(
        ranges[period..]
            .iter()
            .fold(first, |atr, tr| (atr * (period as f64 - 1.0) + tr) / period as f64),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars(prices: &[(f64, f64, f64, f64)]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Bar {
                timestamp: start + Duration::minutes(5 * i as i64),
                open,
                high,
                low,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn test_constant_range() {
        let data = vec![(100.0, 101.0, 99.0, 100.0); 15];
        let atr = calculate_atr(&bars(&data), 14).unwrap();
        assert!((atr - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_gap_widens_true_range() {
        // Second bar gaps up: |high - prev close| dominates
        let data = vec![(100.0, 101.0, 99.0, 100.0), (110.0, 111.0, 109.0, 110.0)];
        let atr = calculate_atr(&bars(&data), 1).unwrap();
        assert!((atr - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_data() {
        let data = vec![(100.0, 101.0, 99.0, 100.0); 2];
        assert!(calculate_atr(&bars(&data), 14).is_none());
    }
}
