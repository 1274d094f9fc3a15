/// Independent indicator recomputation for the audit gate.
///
/// Values are computed from the close series alone. Warmup positions where
/// the window is not yet full yield `None` and are excluded from audit
/// comparison. Rolling standard deviation uses the sample estimator
/// (ddof = 1) to match the reference backtesting stack.
use crate::config::spec::IndicatorSpec;

pub fn recompute(spec: &IndicatorSpec, closes: &[f64]) -> Vec<Option<f64>> {
    match spec {
        IndicatorSpec::Sma { period, .. } => sma(closes, *period),
        IndicatorSpec::RollingStd { period, .. } => rolling_std(closes, *period),
        IndicatorSpec::BollingerUpper { period, width, .. } => band(closes, *period, *width),
        IndicatorSpec::BollingerLower { period, width, .. } => band(closes, *period, -*width),
        IndicatorSpec::Ema { period, .. } => ema(closes, *period),
    }
}

fn sma(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    windowed(closes, period, |w| w.iter().sum::<f64>() / w.len() as f64)
}

fn rolling_std(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    windowed(closes, period, sample_std)
}

fn band(closes: &[f64], period: usize, signed_width: f64) -> Vec<Option<f64>> {
    windowed(closes, period, |w| {
        let mean = w.iter().sum::<f64>() / w.len() as f64;
        mean + signed_width * sample_std(w)
    })
}

/// EMA seeded with the SMA of the first full window, then the usual
/// recursive smoothing with alpha = 2 / (period + 1).
fn ema(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut value = closes[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(value);
    for i in period..closes.len() {
        value = alpha * closes[i] + (1.0 - alpha) * value;
        out[i] = Some(value);
    }
    out
}

fn windowed(closes: &[f64], period: usize, f: impl Fn(&[f64]) -> f64) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 {
        return out;
    }
    for i in (period - 1)..closes.len() {
        out[i] = Some(f(&closes[i + 1 - period..=i]));
    }
    out
}

fn sample_std(window: &[f64]) -> f64 {
    if window.len() < 2 {
        return 0.0;
    }
    let mean = window.iter().sum::<f64>() / window.len() as f64;
    let var = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (window.len() - 1) as f64;
    var.sqrt()
}
