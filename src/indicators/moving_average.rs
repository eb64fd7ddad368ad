/// Calculate Simple Moving Average (SMA) of the last `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// SMA at every index from `period - 1` onwards
pub fn sma_series(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }

    prices
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0];
        assert_eq!(calculate_sma(&prices, 5), Some(104.0));
        assert_eq!(calculate_sma(&prices, 2), Some(107.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        let prices = vec![100.0, 102.0];
        assert!(calculate_sma(&prices, 5).is_none());
        assert!(calculate_sma(&prices, 0).is_none());
    }

    #[test]
    fn test_sma_series_aligns_with_last_value() {
        let prices = vec![1.0, 2.0, 3.0, 4.0];
        let series = sma_series(&prices, 2);
        assert_eq!(series, vec![1.5, 2.5, 3.5]);
        assert_eq!(series.last().copied(), calculate_sma(&prices, 2));
    }
}
