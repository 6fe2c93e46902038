use super::Strategy;
use crate::indicators::sma_pair;
use crate::models::{Candle, SignalSet};
use crate::Result;

/// Moving-average crossover strategy
///
/// Enters when the fast SMA of closes crosses above the slow SMA and exits
/// on the opposite cross.
#[derive(Debug, Clone)]
pub struct SmaCrossStrategy {
    pub fast_period: usize,
    pub slow_period: usize,
}

impl SmaCrossStrategy {
    pub fn new(fast_period: usize, slow_period: usize) -> Self {
        Self {
            fast_period,
            slow_period,
        }
    }
}

impl Default for SmaCrossStrategy {
    fn default() -> Self {
        Self::new(5, 20)
    }
}

impl Strategy for SmaCrossStrategy {
    fn name(&self) -> &str {
        "SmaCrossStrategy"
    }

    fn startup_candle_count(&self) -> usize {
        self.slow_period + 1
    }

    fn signal(&self, pair: &str, window: &[Candle]) -> Result<SignalSet> {
        let closes: Vec<f64> = window.iter().map(|c| c.close).collect();

        let (Some((fast_prev, fast)), Some((slow_prev, slow))) = (
            sma_pair(&closes, self.fast_period),
            sma_pair(&closes, self.slow_period),
        ) else {
            return Ok(SignalSet::default());
        };

        if fast_prev <= slow_prev && fast > slow {
            tracing::debug!("{}: fast SMA crossed above slow ({:.6} > {:.6})", pair, fast, slow);
            return Ok(SignalSet::entry(Some("sma_cross_up")));
        }

        if fast_prev >= slow_prev && fast < slow {
            tracing::debug!("{}: fast SMA crossed below slow ({:.6} < {:.6})", pair, fast, slow);
            return Ok(SignalSet::exit(Some("sma_cross_down")));
        }

        Ok(SignalSet::default())
    }
}
