//! Market regime classification
//!
//! `classify` is a pure function of an indicator snapshot; the stateful
//! `RegimeFilter` wraps it only to add emergency hysteresis so one calm bar
//! after a crash does not flap the engine straight back into a grid.

use serde::{Deserialize, Serialize};

use crate::config::RegimeConfig;
use crate::indicators::IndicatorSnapshot;

/// Market regime for a single bar; derived, never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegimeLabel {
    StrongUptrend,
    Uptrend,
    WeakUptrend,
    Range,
    WeakDowntrend,
    Downtrend,
    StrongDowntrend,
    Emergency,
}

impl RegimeLabel {
    pub fn is_uptrend(self) -> bool {
        matches!(
            self,
            RegimeLabel::StrongUptrend | RegimeLabel::Uptrend | RegimeLabel::WeakUptrend
        )
    }

    pub fn is_downtrend(self) -> bool {
        matches!(
            self,
            RegimeLabel::StrongDowntrend | RegimeLabel::Downtrend | RegimeLabel::WeakDowntrend
        )
    }
}

impl std::fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegimeLabel::StrongUptrend => "strong_uptrend",
            RegimeLabel::Uptrend => "uptrend",
            RegimeLabel::WeakUptrend => "weak_uptrend",
            RegimeLabel::Range => "range",
            RegimeLabel::WeakDowntrend => "weak_downtrend",
            RegimeLabel::Downtrend => "downtrend",
            RegimeLabel::StrongDowntrend => "strong_downtrend",
            RegimeLabel::Emergency => "emergency",
        };
        write!(f, "{s}")
    }
}

/// Classify one bar. First match wins; anything ambiguous lands on Range.
pub fn classify(snap: &IndicatorSnapshot, config: &RegimeConfig) -> RegimeLabel {
    // During warm-up there is nothing trustworthy to act on
    if !snap.ready {
        return RegimeLabel::Range;
    }

    // 1. Emergency: outsized bar-over-bar gap
    if snap.gap_pct >= config.emergency_gap_pct {
        return RegimeLabel::Emergency;
    }

    let slope = snap.ema_slope;
    let aligned_up = snap.ema_short > snap.ema_long;
    let aligned_down = snap.ema_short < snap.ema_long;

    // 2. Strong trend: steep slope, trending ADX, EMAs stacked the same way
    if slope >= config.strong_slope && snap.adx > config.adx_threshold && aligned_up {
        return RegimeLabel::StrongUptrend;
    }
    if slope <= -config.strong_slope && snap.adx > config.adx_threshold && aligned_down {
        return RegimeLabel::StrongDowntrend;
    }

    // 3. Ordinary trend: meaningful slope with moderate ADX
    if slope >= config.trend_slope && snap.adx > config.adx_moderate {
        return RegimeLabel::Uptrend;
    }
    if slope <= -config.trend_slope && snap.adx > config.adx_moderate {
        return RegimeLabel::Downtrend;
    }

    // 4. Weak trend: direction present, strength absent
    if slope >= config.weak_slope && snap.adx <= config.adx_threshold {
        return RegimeLabel::WeakUptrend;
    }
    if slope <= -config.weak_slope && snap.adx <= config.adx_threshold {
        return RegimeLabel::WeakDowntrend;
    }

    // 5. Quiet market with no directional slope
    if snap.atr_pct < config.range_atr_pct && slope.abs() < config.weak_slope {
        return RegimeLabel::Range;
    }

    // Ties and leftovers default to Range (conservative)
    RegimeLabel::Range
}

/// Emergency hysteresis around the pure classifier.
///
/// Once Emergency is observed the filter keeps reporting it until
/// `emergency_recovery_bars` consecutive calm bars have passed.
#[derive(Debug, Clone)]
pub struct RegimeFilter {
    config: RegimeConfig,
    in_emergency: bool,
    calm_streak: usize,
}

impl RegimeFilter {
    pub fn new(config: RegimeConfig) -> Self {
        Self {
            config,
            in_emergency: false,
            calm_streak: 0,
        }
    }

    pub fn observe(&mut self, snap: &IndicatorSnapshot) -> RegimeLabel {
        let raw = classify(snap, &self.config);

        if raw == RegimeLabel::Emergency {
            self.in_emergency = true;
            self.calm_streak = 0;
            return RegimeLabel::Emergency;
        }

        if self.in_emergency {
            self.calm_streak += 1;
            if self.calm_streak < self.config.emergency_recovery_bars {
                return RegimeLabel::Emergency;
            }
            self.in_emergency = false;
            self.calm_streak = 0;
        }

        raw
    }

    pub fn in_emergency(&self) -> bool {
        self.in_emergency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            datetime: Utc::now(),
            close: 100.0,
            ema_short: 100.0,
            ema_long: 100.0,
            ema_slope: 0.0,
            atr: 2.0,
            atr_pct: 2.0,
            atr_is_fallback: false,
            adx: 10.0,
            plus_di: 20.0,
            minus_di: 20.0,
            sar: 98.0,
            sar_trend_up: true,
            sar_flipped: false,
            donchian_high: 105.0,
            donchian_low: 95.0,
            range_high: 106.0,
            range_low: 94.0,
            vwap: 100.0,
            gap_pct: 0.0,
            ready: true,
        }
    }

    #[test]
    fn classify_is_deterministic() {
        let config = RegimeConfig::default();
        let snap = snapshot();
        let first = classify(&snap, &config);
        for _ in 0..10 {
            assert_eq!(classify(&snap, &config), first);
        }
    }

    #[test]
    fn warmup_bars_classify_as_range() {
        let config = RegimeConfig::default();
        let mut snap = snapshot();
        snap.ready = false;
        snap.ema_slope = 0.05;
        snap.adx = 60.0;
        assert_eq!(classify(&snap, &config), RegimeLabel::Range);
    }

    #[test]
    fn large_gap_wins_over_everything() {
        let config = RegimeConfig::default();
        let mut snap = snapshot();
        snap.gap_pct = 0.2;
        snap.ema_slope = 0.05;
        snap.adx = 60.0;
        snap.ema_short = 110.0;
        assert_eq!(classify(&snap, &config), RegimeLabel::Emergency);
    }

    #[test]
    fn strong_uptrend_requires_alignment() {
        let config = RegimeConfig::default();
        let mut snap = snapshot();
        snap.ema_slope = config.strong_slope * 2.0;
        snap.adx = config.adx_threshold + 10.0;
        snap.ema_short = 101.0;
        snap.ema_long = 100.0;
        assert_eq!(classify(&snap, &config), RegimeLabel::StrongUptrend);

        // Same slope but EMAs inverted: downgraded to ordinary uptrend
        snap.ema_short = 99.0;
        assert_eq!(classify(&snap, &config), RegimeLabel::Uptrend);
    }

    #[test]
    fn symmetric_downtrend_labels() {
        let config = RegimeConfig::default();
        let mut snap = snapshot();
        snap.ema_slope = -config.strong_slope * 2.0;
        snap.adx = config.adx_threshold + 5.0;
        snap.ema_short = 99.0;
        snap.ema_long = 100.0;
        assert_eq!(classify(&snap, &config), RegimeLabel::StrongDowntrend);

        snap.ema_slope = -config.weak_slope * 1.5;
        snap.adx = 10.0;
        assert_eq!(classify(&snap, &config), RegimeLabel::WeakDowntrend);
    }

    #[test]
    fn flat_quiet_market_is_range() {
        let config = RegimeConfig::default();
        let snap = snapshot();
        assert_eq!(classify(&snap, &config), RegimeLabel::Range);
    }

    #[test]
    fn emergency_recovery_needs_consecutive_calm_bars() {
        let config = RegimeConfig {
            emergency_recovery_bars: 3,
            ..Default::default()
        };
        let mut filter = RegimeFilter::new(config);

        let mut crash = snapshot();
        crash.gap_pct = 0.2;
        assert_eq!(filter.observe(&crash), RegimeLabel::Emergency);

        let calm = snapshot();
        // Two calm bars are not enough
        assert_eq!(filter.observe(&calm), RegimeLabel::Emergency);
        assert_eq!(filter.observe(&calm), RegimeLabel::Emergency);
        // Third calm bar releases the latch
        assert_eq!(filter.observe(&calm), RegimeLabel::Range);
        assert!(!filter.in_emergency());
    }

    #[test]
    fn renewed_gap_resets_the_calm_streak() {
        let config = RegimeConfig {
            emergency_recovery_bars: 2,
            ..Default::default()
        };
        let mut filter = RegimeFilter::new(config);

        let mut crash = snapshot();
        crash.gap_pct = 0.2;
        let calm = snapshot();

        filter.observe(&crash);
        filter.observe(&calm);
        // Another crash restarts the countdown
        assert_eq!(filter.observe(&crash), RegimeLabel::Emergency);
        assert_eq!(filter.observe(&calm), RegimeLabel::Emergency);
        assert_eq!(filter.observe(&calm), RegimeLabel::Range);
    }
}
