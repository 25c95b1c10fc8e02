//! Incremental technical indicators
//!
//! One `IndicatorEngine` per symbol consumes bars in order and keeps every
//! indicator as running state, so each update is O(1) — nothing is ever
//! recomputed over the full history. Before the warm-up window has elapsed
//! the snapshot is flagged not-ready and downstream consumers treat the bar
//! as range/no-data.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::config::IndicatorConfig;
use crate::Candle;

/// Point-in-time view of every indicator after a bar update
#[derive(Debug, Clone, Copy)]
pub struct IndicatorSnapshot {
    pub datetime: DateTime<Utc>,
    pub close: f64,
    pub ema_short: f64,
    pub ema_long: f64,
    /// Average fractional change of the short EMA per bar over the lookback
    pub ema_slope: f64,
    pub atr: f64,
    /// ATR as a percentage of close
    pub atr_pct: f64,
    /// True when the ATR fallback substitution kicked in
    pub atr_is_fallback: bool,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub sar: f64,
    pub sar_trend_up: bool,
    /// SAR reversed direction on this bar
    pub sar_flipped: bool,
    /// Channel over the lookback window *excluding* the current bar, so a
    /// close beyond it is a breakout rather than a tautology
    pub donchian_high: f64,
    pub donchian_low: f64,
    /// Wider channel used by the grid strategy for its trading range
    pub range_high: f64,
    pub range_low: f64,
    pub vwap: f64,
    /// |close - prev_close| / prev_close
    pub gap_pct: f64,
    /// All warm-up requirements satisfied
    pub ready: bool,
}

impl IndicatorSnapshot {
    fn empty(datetime: DateTime<Utc>, close: f64) -> Self {
        Self {
            datetime,
            close,
            ema_short: close,
            ema_long: close,
            ema_slope: 0.0,
            atr: 0.0,
            atr_pct: 0.0,
            atr_is_fallback: false,
            adx: 0.0,
            plus_di: 0.0,
            minus_di: 0.0,
            sar: close,
            sar_trend_up: true,
            sar_flipped: false,
            donchian_high: close,
            donchian_low: close,
            range_high: close,
            range_low: close,
            vwap: close,
            gap_pct: 0.0,
            ready: false,
        }
    }
}

// ============================================================================
// EMA
// ============================================================================

/// Exponential moving average, seeded with the SMA of the first `period` bars
#[derive(Debug, Clone)]
struct Ema {
    period: usize,
    k: f64,
    value: Option<f64>,
    seed_sum: f64,
    seed_count: usize,
}

impl Ema {
    fn new(period: usize) -> Self {
        Self {
            period,
            k: 2.0 / (period as f64 + 1.0),
            value: None,
            seed_sum: 0.0,
            seed_count: 0,
        }
    }

    fn update(&mut self, x: f64) -> Option<f64> {
        match self.value {
            Some(prev) => {
                let next = prev + self.k * (x - prev);
                self.value = Some(next);
                self.value
            }
            None => {
                self.seed_sum += x;
                self.seed_count += 1;
                if self.seed_count >= self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
                self.value
            }
        }
    }
}

// ============================================================================
// ATR (Wilder smoothing)
// ============================================================================

#[derive(Debug, Clone)]
struct WilderAtr {
    period: usize,
    seed_sum: f64,
    seed_count: usize,
    value: Option<f64>,
}

impl WilderAtr {
    fn new(period: usize) -> Self {
        Self {
            period,
            seed_sum: 0.0,
            seed_count: 0,
            value: None,
        }
    }

    fn update(&mut self, tr: f64) -> Option<f64> {
        match self.value {
            Some(prev) => {
                // atr_t = atr_{t-1} + (tr - atr_{t-1}) / period
                let next = prev + (tr - prev) / self.period as f64;
                self.value = Some(next);
                self.value
            }
            None => {
                self.seed_sum += tr;
                self.seed_count += 1;
                if self.seed_count >= self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
                self.value
            }
        }
    }
}

fn true_range(candle: &Candle, prev_close: Option<f64>) -> f64 {
    match prev_close {
        Some(pc) => {
            let hl = candle.high - candle.low;
            let hc = (candle.high - pc).abs();
            let lc = (candle.low - pc).abs();
            hl.max(hc).max(lc)
        }
        None => candle.high - candle.low,
    }
}

// ============================================================================
// ADX (directional movement index, Wilder smoothing throughout)
// ============================================================================

#[derive(Debug, Clone)]
struct Adx {
    period: usize,
    smoothed_plus_dm: WilderAtr,
    smoothed_minus_dm: WilderAtr,
    smoothed_tr: WilderAtr,
    adx_smoother: WilderAtr,
    plus_di: f64,
    minus_di: f64,
    value: f64,
}

impl Adx {
    fn new(period: usize) -> Self {
        Self {
            period,
            smoothed_plus_dm: WilderAtr::new(period),
            smoothed_minus_dm: WilderAtr::new(period),
            smoothed_tr: WilderAtr::new(period),
            adx_smoother: WilderAtr::new(period),
            plus_di: 0.0,
            minus_di: 0.0,
            value: 0.0,
        }
    }

    /// Returns 0 while there is not enough history, never errors
    fn update(&mut self, candle: &Candle, prev: &Candle) {
        let up_move = candle.high - prev.high;
        let down_move = prev.low - candle.low;

        let plus_dm = if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        };
        let minus_dm = if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        };
        let tr = true_range(candle, Some(prev.close));

        let sp = self.smoothed_plus_dm.update(plus_dm);
        let sm = self.smoothed_minus_dm.update(minus_dm);
        let st = self.smoothed_tr.update(tr);

        let (Some(sp), Some(sm), Some(st)) = (sp, sm, st) else {
            return;
        };
        if st <= 0.0 {
            return;
        }

        self.plus_di = sp / st * 100.0;
        self.minus_di = sm / st * 100.0;

        let di_sum = self.plus_di + self.minus_di;
        let dx = if di_sum > 0.0 {
            (self.plus_di - self.minus_di).abs() / di_sum * 100.0
        } else {
            0.0
        };

        if let Some(adx) = self.adx_smoother.update(dx) {
            self.value = adx;
        }
    }

    fn warmup_bars(&self) -> usize {
        self.period * 2
    }
}

// ============================================================================
// Parabolic SAR
// ============================================================================

/// Incremental stop-and-reverse state machine.
///
/// Owned by the symbol's engine, never shared: running two symbols through
/// one SAR instance would leak trend state between them.
#[derive(Debug, Clone)]
struct ParabolicSar {
    af_start: f64,
    af_step: f64,
    af_max: f64,
    trend_up: bool,
    sar: f64,
    extreme: f64,
    af: f64,
    prev_low: f64,
    prev_high: f64,
    prev2_low: f64,
    prev2_high: f64,
    initialized: bool,
}

impl ParabolicSar {
    fn new(af_start: f64, af_step: f64, af_max: f64) -> Self {
        Self {
            af_start,
            af_step,
            af_max,
            trend_up: true,
            sar: 0.0,
            extreme: 0.0,
            af: af_start,
            prev_low: 0.0,
            prev_high: 0.0,
            prev2_low: 0.0,
            prev2_high: 0.0,
            initialized: false,
        }
    }

    /// Returns (sar, trend_up, flipped)
    fn update(&mut self, candle: &Candle, prev: Option<&Candle>) -> (f64, bool, bool) {
        let Some(prev) = prev else {
            self.prev_low = candle.low;
            self.prev_high = candle.high;
            self.prev2_low = candle.low;
            self.prev2_high = candle.high;
            return (candle.low, true, false);
        };

        if !self.initialized {
            self.trend_up = candle.close >= prev.close;
            if self.trend_up {
                self.sar = prev.low.min(candle.low);
                self.extreme = candle.high;
            } else {
                self.sar = prev.high.max(candle.high);
                self.extreme = candle.low;
            }
            self.af = self.af_start;
            self.prev2_low = self.prev_low;
            self.prev2_high = self.prev_high;
            self.prev_low = candle.low;
            self.prev_high = candle.high;
            self.initialized = true;
            return (self.sar, self.trend_up, false);
        }

        let mut next = self.sar + self.af * (self.extreme - self.sar);

        // SAR never enters the range of the previous two bars; the current
        // bar stays out of the clamp so it can cross and trigger the flip
        if self.trend_up {
            next = next.min(self.prev_low).min(self.prev2_low);
        } else {
            next = next.max(self.prev_high).max(self.prev2_high);
        }

        let mut flipped = false;
        if self.trend_up {
            if candle.low < next {
                // Flip to downtrend; acceleration restarts from scratch
                flipped = true;
                self.trend_up = false;
                next = self.extreme;
                self.extreme = candle.low;
                self.af = self.af_start;
            } else if candle.high > self.extreme {
                self.extreme = candle.high;
                self.af = (self.af + self.af_step).min(self.af_max);
            }
        } else if candle.high > next {
            flipped = true;
            self.trend_up = true;
            next = self.extreme;
            self.extreme = candle.high;
            self.af = self.af_start;
        } else if candle.low < self.extreme {
            self.extreme = candle.low;
            self.af = (self.af + self.af_step).min(self.af_max);
        }

        self.sar = next;
        self.prev2_low = self.prev_low;
        self.prev2_high = self.prev_high;
        self.prev_low = candle.low;
        self.prev_high = candle.high;
        (self.sar, self.trend_up, flipped)
    }
}

// ============================================================================
// Donchian channel (monotonic deques, O(1) amortized)
// ============================================================================

#[derive(Debug, Clone)]
struct Donchian {
    period: usize,
    // (bar index, value); front holds the current extreme
    max_deque: VecDeque<(u64, f64)>,
    min_deque: VecDeque<(u64, f64)>,
    next_idx: u64,
}

impl Donchian {
    fn new(period: usize) -> Self {
        Self {
            period,
            max_deque: VecDeque::new(),
            min_deque: VecDeque::new(),
            next_idx: 0,
        }
    }

    /// Channel over the last `period` pushed bars, None until full
    fn channel(&self) -> Option<(f64, f64)> {
        if self.next_idx < self.period as u64 {
            return None;
        }
        match (self.max_deque.front(), self.min_deque.front()) {
            (Some(&(_, hi)), Some(&(_, lo))) => Some((hi, lo)),
            _ => None,
        }
    }

    fn push(&mut self, high: f64, low: f64) {
        let idx = self.next_idx;
        self.next_idx += 1;

        while self.max_deque.back().is_some_and(|&(_, v)| v <= high) {
            self.max_deque.pop_back();
        }
        self.max_deque.push_back((idx, high));

        while self.min_deque.back().is_some_and(|&(_, v)| v >= low) {
            self.min_deque.pop_back();
        }
        self.min_deque.push_back((idx, low));

        let cutoff = idx.saturating_sub(self.period as u64 - 1);
        while self.max_deque.front().is_some_and(|&(i, _)| i < cutoff) {
            self.max_deque.pop_front();
        }
        while self.min_deque.front().is_some_and(|&(i, _)| i < cutoff) {
            self.min_deque.pop_front();
        }
    }
}

// ============================================================================
// Rolling VWAP
// ============================================================================

#[derive(Debug, Clone)]
struct RollingVwap {
    window: usize,
    entries: VecDeque<(f64, f64)>, // (tp * volume, volume)
    pv_sum: f64,
    vol_sum: f64,
}

impl RollingVwap {
    fn new(window: usize) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
            pv_sum: 0.0,
            vol_sum: 0.0,
        }
    }

    fn update(&mut self, candle: &Candle) -> f64 {
        let pv = candle.typical_price() * candle.volume;
        self.entries.push_back((pv, candle.volume));
        self.pv_sum += pv;
        self.vol_sum += candle.volume;

        while self.entries.len() > self.window {
            if let Some((old_pv, old_vol)) = self.entries.pop_front() {
                self.pv_sum -= old_pv;
                self.vol_sum -= old_vol;
            }
        }

        if self.vol_sum > 0.0 {
            self.pv_sum / self.vol_sum
        } else {
            candle.typical_price()
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Per-symbol incremental indicator state.
///
/// Created at engine start, updated exactly once per incoming bar, never
/// reset except by constructing a fresh engine.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    config: IndicatorConfig,
    ema_short: Ema,
    ema_long: Ema,
    atr: WilderAtr,
    adx: Adx,
    sar: ParabolicSar,
    donchian: Donchian,
    range_channel: Donchian,
    vwap: RollingVwap,
    ema_history: VecDeque<f64>,
    prev_candle: Option<Candle>,
    bars_seen: usize,
}

impl IndicatorEngine {
    pub fn new(config: &IndicatorConfig, range_period: usize) -> Self {
        Self {
            ema_short: Ema::new(config.ema_short_period),
            ema_long: Ema::new(config.ema_long_period),
            atr: WilderAtr::new(config.atr_period),
            adx: Adx::new(config.adx_period),
            sar: ParabolicSar::new(config.sar_af_start, config.sar_af_step, config.sar_af_max),
            donchian: Donchian::new(config.donchian_period),
            range_channel: Donchian::new(range_period),
            vwap: RollingVwap::new(config.vwap_window),
            ema_history: VecDeque::with_capacity(config.slope_lookback + 1),
            prev_candle: None,
            bars_seen: 0,
            config: config.clone(),
        }
    }

    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }

    pub fn is_ready(&self) -> bool {
        self.bars_seen >= self.warmup_bars()
    }

    fn warmup_bars(&self) -> usize {
        self.config
            .warmup_bars()
            .max(self.adx.warmup_bars() + self.config.warmup_margin)
    }

    /// Consume one bar and produce a snapshot. O(1) amortized.
    pub fn update(&mut self, candle: &Candle) -> IndicatorSnapshot {
        self.bars_seen += 1;
        let mut snap = IndicatorSnapshot::empty(candle.datetime, candle.close);

        // Channels are read before the current bar is pushed so breakouts
        // compare against strictly older history.
        if let Some((hi, lo)) = self.donchian.channel() {
            snap.donchian_high = hi;
            snap.donchian_low = lo;
        }
        if let Some((hi, lo)) = self.range_channel.channel() {
            snap.range_high = hi;
            snap.range_low = lo;
        }
        self.donchian.push(candle.high, candle.low);
        self.range_channel.push(candle.high, candle.low);

        let prev_close = self.prev_candle.as_ref().map(|c| c.close);
        snap.gap_pct = match prev_close {
            Some(pc) if pc > 0.0 => ((candle.close - pc) / pc).abs(),
            _ => 0.0,
        };

        if let Some(v) = self.ema_short.update(candle.close) {
            snap.ema_short = v;
        }
        if let Some(v) = self.ema_long.update(candle.close) {
            snap.ema_long = v;
        }

        // Slope from the short EMA ring buffer
        if self.ema_short.value.is_some() {
            self.ema_history.push_back(snap.ema_short);
            while self.ema_history.len() > self.config.slope_lookback + 1 {
                self.ema_history.pop_front();
            }
            if self.ema_history.len() > 1 {
                let oldest = self.ema_history.front().copied().unwrap_or(snap.ema_short);
                if oldest > 0.0 {
                    let span = (self.ema_history.len() - 1) as f64;
                    snap.ema_slope = (snap.ema_short / oldest - 1.0) / span;
                }
            }
        }

        let tr = true_range(candle, prev_close);
        if let Some(atr) = self.atr.update(tr) {
            snap.atr = atr;
        }
        // Degenerate ATR would zero out every downstream risk division, so a
        // configured fraction of price stands in. Documented approximation.
        if snap.atr < candle.close * self.config.min_atr_fraction {
            snap.atr = candle.close * self.config.default_atr_pct;
            snap.atr_is_fallback = true;
        }
        if candle.close > 0.0 {
            snap.atr_pct = snap.atr / candle.close * 100.0;
        }

        if let Some(prev) = &self.prev_candle {
            self.adx.update(candle, prev);
        }
        snap.adx = self.adx.value;
        snap.plus_di = self.adx.plus_di;
        snap.minus_di = self.adx.minus_di;

        let (sar, trend_up, flipped) = self.sar.update(candle, self.prev_candle.as_ref());
        snap.sar = sar;
        snap.sar_trend_up = trend_up;
        snap.sar_flipped = flipped;

        snap.vwap = self.vwap.update(candle);

        snap.ready = self.is_ready();
        self.prev_candle = Some(candle.clone());
        snap
    }
}
