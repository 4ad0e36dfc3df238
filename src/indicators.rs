use serde::Serialize;

use crate::types::Candle;

pub const MIN_CANDLES: usize = 50;

const RSI_PERIOD: usize = 14;
const ATR_PERIOD: usize = 14;
const ADX_PERIOD: usize = 14;
const BB_PERIOD: usize = 20;
const BB_STD_MULT: f64 = 2.0;
const VOLUME_PERIOD: usize = 20;
const MS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub hist: f64,
    pub hist_prev: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Adx {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PivotPoints {
    pub pp: f64,
    pub r1: f64,
    pub r2: f64,
    pub r3: f64,
    pub s1: f64,
    pub s2: f64,
    pub s3: f64,
}

impl PivotPoints {
    pub fn levels(&self) -> [(&'static str, f64); 7] {
        [
            ("PP", self.pp),
            ("R1", self.r1),
            ("R2", self.r2),
            ("R3", self.r3),
            ("S1", self.s1),
            ("S2", self.s2),
            ("S3", self.s3),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TpCandidate {
    pub tp: f64,
    pub source: String,
    pub rr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TpLevels {
    pub current_price: f64,
    pub atr: f64,
    pub long_tp_candidates: Vec<TpCandidate>,
    pub short_tp_candidates: Vec<TpCandidate>,
}

/// Latest indicator values for one timeframe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSummary {
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub ema_50: Option<f64>,
    pub ema_200: Option<f64>,
    pub sma_20: Option<f64>,
    pub rsi: Option<f64>,
    pub macd: Option<Macd>,
    pub bollinger: Option<BollingerBands>,
    pub atr: Option<f64>,
    pub adx: Option<Adx>,
    pub obv: Option<f64>,
    pub obv_sma: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub vwap: Option<f64>,
    pub vwap_bias_pct: Option<f64>,
    pub cvd: Option<f64>,
    pub cvd_sma: Option<f64>,
    pub cvd_trend: Option<&'static str>,
    pub recent_candles: Vec<Candle>,
}

// ── Moving averages ───────────────────────────────────────────────────────────

/// EMA seeded with the first value (alpha = 2 / (period + 1)).
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    if period == 0 {
        return out;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    for (i, v) in values.iter().enumerate() {
        let next = if i == 0 { *v } else { alpha * v + (1.0 - alpha) * out[i - 1] };
        out.push(next);
    }
    out
}

pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

// ── Oscillators ───────────────────────────────────────────────────────────────

/// RSI from simple averages of the last `period` gains and losses.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let start = closes.len() - period;
    let (mut gain, mut loss) = (0.0, 0.0);
    for i in start..closes.len() {
        let delta = closes[i] - closes[i - 1];
        if delta > 0.0 {
            gain += delta;
        } else {
            loss -= delta;
        }
    }
    if loss == 0.0 {
        return Some(if gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = (gain / period as f64) / (loss / period as f64);
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// MACD (12, 26, 9).
pub fn macd(closes: &[f64]) -> Option<Macd> {
    if closes.len() < 26 {
        return None;
    }
    let fast = ema(closes, 12);
    let slow = ema(closes, 26);
    let line: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();
    let signal = ema(&line, 9);
    let n = line.len();
    let hist = line[n - 1] - signal[n - 1];
    let hist_prev = line[n - 2] - signal[n - 2];
    Some(Macd { macd: line[n - 1], signal: signal[n - 1], hist, hist_prev })
}

/// Bollinger bands with sample standard deviation.
pub fn bollinger(closes: &[f64], period: usize, mult: f64) -> Option<BollingerBands> {
    if period < 2 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    let var = window.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / (period - 1) as f64;
    let std = var.sqrt();
    Some(BollingerBands { upper: middle + mult * std, middle, lower: middle - mult * std })
}

// ── Volatility / trend strength ───────────────────────────────────────────────

fn true_range(curr: &Candle, prev: &Candle) -> f64 {
    (curr.high - curr.low)
        .max((curr.high - prev.close).abs())
        .max((curr.low - prev.close).abs())
}

/// Simple average of the last `period` true ranges; 0.0 with too little data.
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < period + 1 {
        return 0.0;
    }
    let start = candles.len() - period - 1;
    let mut tr_sum = 0.0;
    for i in (start + 1)..candles.len() {
        tr_sum += true_range(&candles[i], &candles[i - 1]);
    }
    tr_sum / period as f64
}

/// ADX with +DI / −DI over rolling sums of `period` bars.
pub fn adx(candles: &[Candle], period: usize) -> Option<Adx> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }
    let n = candles.len();
    let mut tr = vec![0.0; n];
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];
    for i in 1..n {
        let up = candles[i].high - candles[i - 1].high;
        let down = candles[i - 1].low - candles[i].low;
        tr[i] = true_range(&candles[i], &candles[i - 1]);
        plus_dm[i] = if up > down && up > 0.0 { up } else { 0.0 };
        minus_dm[i] = if down > up && down > 0.0 { down } else { 0.0 };
    }

    let di_at = |end: usize| -> Option<(f64, f64)> {
        let range = end + 1 - period..=end;
        let str_sum: f64 = tr[range.clone()].iter().sum();
        if str_sum <= 0.0 {
            return None;
        }
        let p: f64 = plus_dm[range.clone()].iter().sum();
        let m: f64 = minus_dm[range].iter().sum();
        Some((100.0 * p / str_sum, 100.0 * m / str_sum))
    };

    let mut dx = Vec::with_capacity(period);
    for end in (n - period)..n {
        let (p, m) = di_at(end)?;
        dx.push(if p + m > 0.0 { 100.0 * (p - m).abs() / (p + m) } else { 0.0 });
    }
    let (plus_di, minus_di) = di_at(n - 1)?;
    Some(Adx { adx: dx.iter().sum::<f64>() / period as f64, plus_di, minus_di })
}

// ── Volume ────────────────────────────────────────────────────────────────────

pub fn obv(candles: &[Candle]) -> Vec<f64> {
    let mut out = Vec::with_capacity(candles.len());
    for (i, c) in candles.iter().enumerate() {
        let prev = if i == 0 { 0.0 } else { out[i - 1] };
        let next = if i == 0 {
            0.0
        } else if c.close > candles[i - 1].close {
            prev + c.volume
        } else if c.close < candles[i - 1].close {
            prev - c.volume
        } else {
            prev
        };
        out.push(next);
    }
    out
}

/// Cumulative volume delta: bullish candles add volume, bearish subtract.
pub fn cvd(candles: &[Candle]) -> Vec<f64> {
    let mut acc = 0.0;
    candles
        .iter()
        .map(|c| {
            acc += if c.close >= c.open { c.volume } else { -c.volume };
            acc
        })
        .collect()
}

pub fn volume_ratio(candles: &[Candle], period: usize) -> Option<f64> {
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let avg = sma(&volumes, period)?;
    let last = *volumes.last()?;
    (avg > 0.0).then(|| last / avg)
}

/// VWAP anchored to the UTC day of the last candle.
pub fn vwap(candles: &[Candle]) -> Option<f64> {
    let last = candles.last()?;
    let day = last.timestamp.div_euclid(MS_PER_DAY);
    let (mut pv, mut vol) = (0.0, 0.0);
    for c in candles.iter().rev().take_while(|c| c.timestamp.div_euclid(MS_PER_DAY) == day) {
        let typical = (c.high + c.low + c.close) / 3.0;
        pv += typical * c.volume;
        vol += c.volume;
    }
    (vol > 0.0).then(|| pv / vol)
}

// ── Levels ────────────────────────────────────────────────────────────────────

/// Classic pivots from the previous completed daily candle.
pub fn pivot_points(daily: &[Candle]) -> Option<PivotPoints> {
    if daily.len() < 2 {
        return None;
    }
    let prev = &daily[daily.len() - 2];
    let (h, l, c) = (prev.high, prev.low, prev.close);
    let pp = (h + l + c) / 3.0;
    Some(PivotPoints {
        pp: round4(pp),
        r1: round4(2.0 * pp - l),
        r2: round4(pp + (h - l)),
        r3: round4(h + 2.0 * (pp - l)),
        s1: round4(2.0 * pp - h),
        s2: round4(pp - (h - l)),
        s3: round4(l - 2.0 * (h - pp)),
    })
}

/// Take-profit candidates from structure: pivots, swing points, bands,
/// ATR multiples and VWAP. Nearest first, levels within 0.5% merged.
pub fn tp_levels(
    candles: &[Candle],
    pivots: Option<&PivotPoints>,
    bb: Option<&BollingerBands>,
    vwap: Option<f64>,
    atr: f64,
) -> Option<TpLevels> {
    let price = candles.last()?.close;
    if atr <= 0.0 || price <= 0.0 {
        return None;
    }
    let mut above: Vec<(f64, String)> = Vec::new();
    let mut below: Vec<(f64, String)> = Vec::new();

    if let Some(p) = pivots {
        for (name, level) in p.levels() {
            if level > price {
                above.push((level, format!("Pivot {}", name)));
            } else if level < price && level > 0.0 {
                below.push((level, format!("Pivot {}", name)));
            }
        }
    }

    let recent = &candles[candles.len().saturating_sub(50)..];
    for i in 2..recent.len().saturating_sub(2) {
        let h = recent[i].high;
        if h > recent[i - 1].high && h > recent[i + 1].high && h > price * 1.003 {
            above.push((round2(h), "Swing High".into()));
        }
        let l = recent[i].low;
        if l < recent[i - 1].low && l < recent[i + 1].low && l < price * 0.997 {
            below.push((round2(l), "Swing Low".into()));
        }
    }

    if let Some(b) = bb {
        if b.upper > price {
            above.push((round2(b.upper), "BB Upper".into()));
        }
        if b.lower < price {
            below.push((round2(b.lower), "BB Lower".into()));
        }
    }

    for (mult, label) in [(1.5, "1.5xATR"), (2.5, "2.5xATR"), (4.0, "4xATR")] {
        above.push((round2(price + mult * atr), label.into()));
        below.push((round2(price - mult * atr), label.into()));
    }

    if let Some(v) = vwap.filter(|v| *v > 0.0) {
        if v > price * 1.003 {
            above.push((round2(v), "VWAP".into()));
        } else if v < price * 0.997 {
            below.push((round2(v), "VWAP".into()));
        }
    }

    above.sort_by(|a, b| a.0.total_cmp(&b.0));
    below.sort_by(|a, b| b.0.total_cmp(&a.0));
    let risk_unit = atr * 0.8;

    let to_candidates = |levels: Vec<(f64, String)>, long: bool| -> Vec<TpCandidate> {
        dedup_levels(levels)
            .into_iter()
            .take(5)
            .map(|(tp, source)| {
                let dist = if long { tp - price } else { price - tp };
                TpCandidate { tp, source, rr: round2(dist / risk_unit) }
            })
            .collect()
    };

    Some(TpLevels {
        current_price: round2(price),
        atr: round2(atr),
        long_tp_candidates: to_candidates(above, true),
        short_tp_candidates: to_candidates(below, false),
    })
}

fn dedup_levels(levels: Vec<(f64, String)>) -> Vec<(f64, String)> {
    let mut out: Vec<(f64, String)> = Vec::new();
    for (level, source) in levels {
        match out.last() {
            Some((prev, _)) if (level - prev).abs() / prev <= 0.005 => {}
            _ => out.push((level, source)),
        }
    }
    out
}

// ── Summary ───────────────────────────────────────────────────────────────────

/// Latest values for one timeframe; `None` below [`MIN_CANDLES`].
pub fn summarize(candles: &[Candle]) -> Option<IndicatorSummary> {
    if candles.len() < MIN_CANDLES {
        return None;
    }
    let last = candles.last()?;
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let obv_series = obv(candles);
    let cvd_series = cvd(candles);
    let vwap_val = vwap(candles);
    let atr_val = atr(candles, ATR_PERIOD);

    let cvd_trend = if cvd_series.len() >= 5 {
        let now = cvd_series[cvd_series.len() - 1];
        let before = cvd_series[cvd_series.len() - 5];
        Some(if now > before { "rising" } else { "falling" })
    } else {
        None
    };

    Some(IndicatorSummary {
        price: round4(last.close),
        open: round4(last.open),
        high: round4(last.high),
        low: round4(last.low),
        volume: round4(last.volume),
        ema_50: ema(&closes, 50).last().copied().map(round4),
        // An EMA-200 over fewer than 200 bars is still mostly its seed.
        ema_200: (closes.len() >= 200).then(|| ema(&closes, 200)).and_then(|e| e.last().copied()).map(round4),
        sma_20: sma(&closes, 20).map(round4),
        rsi: rsi(&closes, RSI_PERIOD).map(round4),
        macd: macd(&closes),
        bollinger: bollinger(&closes, BB_PERIOD, BB_STD_MULT),
        atr: (atr_val > 0.0).then_some(round4(atr_val)),
        adx: adx(candles, ADX_PERIOD),
        obv: obv_series.last().copied(),
        obv_sma: sma(&obv_series, 20).map(round4),
        volume_ratio: volume_ratio(candles, VOLUME_PERIOD).map(round4),
        vwap: vwap_val.map(round4),
        vwap_bias_pct: vwap_val.map(|v| round4((last.close - v) / v * 100.0)),
        cvd: cvd_series.last().copied(),
        cvd_sma: sma(&cvd_series, 20).map(round4),
        cvd_trend,
        recent_candles: candles[candles.len().saturating_sub(5)..].to_vec(),
    })
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn round4(v: f64) -> f64 {
    (v * 1e4).round() / 1e4
}
