// Moving-average helpers used by the bundled strategies

/// Simple moving average of the last `period` values
pub fn calculate_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let sum: f64 = values.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// SMA for the last value and the one before it, as (previous, current)
pub fn sma_pair(values: &[f64], period: usize) -> Option<(f64, f64)> {
    if values.len() < period + 1 {
        return None;
    }
    let previous = calculate_sma(&values[..values.len() - 1], period)?;
    let current = calculate_sma(values, period)?;
    Some((previous, current))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let values = vec![100.0, 102.0, 104.0, 106.0, 108.0];
        assert_eq!(calculate_sma(&values, 5), Some(104.0));
        assert_eq!(calculate_sma(&values, 2), Some(107.0));
        assert_eq!(calculate_sma(&values, 0), None);
    }

    #[test]
    fn test_sma_insufficient_data() {
        assert!(calculate_sma(&[100.0, 102.0], 5).is_none());
    }

    #[test]
    fn test_sma_pair() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(sma_pair(&values, 2), Some((2.5, 3.5)));
        assert_eq!(sma_pair(&values, 4), None);
    }
}
