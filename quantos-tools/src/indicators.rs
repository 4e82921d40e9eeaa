//! Technical indicator math over close-price series.
//!
//! All functions return `None` until the series is long enough for the
//! indicator's warm-up window.

/// Simple moving average of the trailing `period` values.
pub fn sma(series: &[f64], period: usize) -> Option<f64> {
    if period == 0 || series.len() < period {
        return None;
    }
    let window = &series[series.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Exponential moving average seeded with an SMA over the first window.
pub fn ema(series: &[f64], period: usize) -> Option<f64> {
    if period == 0 || series.len() < period {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut value = series[..period].iter().sum::<f64>() / period as f64;
    for price in &series[period..] {
        value = alpha * price + (1.0 - alpha) * value;
    }
    Some(value)
}

/// Relative Strength Index with Wilder smoothing.
pub fn rsi(series: &[f64], period: usize) -> Option<f64> {
    if period == 0 || series.len() < period + 1 {
        return None;
    }
    let mut gains = 0.0;
    let mut losses = 0.0;
    for pair in series[..period + 1].windows(2) {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;

    for pair in series[period..].windows(2) {
        let delta = pair[1] - pair[0];
        let (gain, loss) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdOutput {
    pub macd_line: f64,
    pub signal_line: f64,
    pub histogram: f64,
}

/// MACD over the series; the standard configuration is (12, 26, 9).
pub fn macd(series: &[f64], fast: usize, slow: usize, signal: usize) -> Option<MacdOutput> {
    if fast == 0 || slow == 0 || signal == 0 || fast >= slow {
        return None;
    }
    if series.len() < slow + signal {
        return None;
    }

    let mut macd_series = Vec::with_capacity(series.len() - slow + 1);
    for end in slow..=series.len() {
        let window = &series[..end];
        let fast_ema = ema(window, fast)?;
        let slow_ema = ema(window, slow)?;
        macd_series.push(fast_ema - slow_ema);
    }

    let macd_line = *macd_series.last()?;
    let signal_line = ema(&macd_series, signal)?;
    Some(MacdOutput {
        macd_line,
        signal_line,
        histogram: macd_line - signal_line,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: f64, step: f64, len: usize) -> Vec<f64> {
        (0..len).map(|i| start + step * i as f64).collect()
    }

    #[test]
    fn sma_averages_trailing_window() {
        let series = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma(&series, 3), Some(4.0));
        assert_eq!(sma(&series, 6), None);
    }

    #[test]
    fn rsi_saturates_on_monotonic_series() {
        let rising = ramp(100.0, 1.0, 30);
        let value = rsi(&rising, 14).unwrap();
        assert!((value - 100.0).abs() < 1e-9);

        let falling = ramp(100.0, -1.0, 30);
        let value = rsi(&falling, 14).unwrap();
        assert!(value < 1.0);
    }

    #[test]
    fn rsi_is_balanced_on_alternating_series() {
        let mut series = Vec::new();
        for i in 0..40 {
            series.push(if i % 2 == 0 { 100.0 } else { 101.0 });
        }
        let value = rsi(&series, 14).unwrap();
        assert!(value > 40.0 && value < 60.0, "rsi was {value}");
    }

    #[test]
    fn rsi_needs_warmup() {
        assert_eq!(rsi(&[1.0, 2.0], 14), None);
    }

    #[test]
    fn macd_sign_tracks_trend() {
        let rising = ramp(100.0, 0.5, 60);
        let out = macd(&rising, 12, 26, 9).unwrap();
        assert!(out.macd_line > 0.0);

        let falling = ramp(100.0, -0.5, 60);
        let out = macd(&falling, 12, 26, 9).unwrap();
        assert!(out.macd_line < 0.0);
    }

    #[test]
    fn ema_tracks_recent_jump_more_closely_than_sma() {
        let mut series = ramp(100.0, 0.0, 20);
        series.extend(ramp(110.0, 0.0, 5));
        let ema_v = ema(&series, 10).unwrap();
        let sma_v = sma(&series, 10).unwrap();
        assert!(ema_v > sma_v);
    }
}
