//! Display rules shared by the quote card, metrics panels and ticker.

/// `$150.00`; non-finite values render as `N/A`.
pub fn format_price(value: f64) -> String {
    if !value.is_finite() {
        return "N/A".to_string();
    }
    format!("${value:.2}")
}

/// Signed delta with two decimals: `+1.23`, `-1.23`, `+0.00`.
///
/// The sign comes from the float itself (`value >= 0.0`), so `-0.0` is
/// rendered as `+0.00`.
pub fn format_change(value: f64) -> String {
    if !value.is_finite() {
        return "N/A".to_string();
    }
    let sign = if value >= 0.0 { '+' } else { '-' };
    format!("{sign}{:.2}", value.abs())
}

/// Signed percentage: `+1.23%`.
pub fn format_percent(value: f64) -> String {
    if !value.is_finite() {
        return "N/A".to_string();
    }
    format!("{}%", format_change(value))
}

/// Position of `current` inside the day's `[low, high]` range, in percent.
///
/// Clamped to `[0, 100]`. A collapsed or inverted range, or any non-finite
/// input, yields the midpoint `50.0`.
pub fn day_range_position(current: f64, low: f64, high: f64) -> f64 {
    let span = high - low;
    if !current.is_finite() || !low.is_finite() || !high.is_finite() || span <= 0.0 {
        return 50.0;
    }
    ((current - low) / span * 100.0).clamp(0.0, 100.0)
}

/// Split a provider metric key into words.
///
/// `52WeekHigh` -> `52 Week High`, `peBasicExclExtraTTM` ->
/// `pe Basic Excl Extra TTM`, `EPSGrowth5Y` -> `EPS Growth 5 Y`.
pub fn format_metric_name(key: &str) -> String {
    let chars: Vec<char> = key.chars().filter(|c| !c.is_whitespace()).collect();
    let mut out = String::with_capacity(chars.len() + 8);

    for (i, &c) in chars.iter().enumerate() {
        if i > 0 {
            let prev = chars[i - 1];
            let next = chars.get(i + 1).copied();
            let boundary = (c.is_uppercase() && (prev.is_lowercase() || prev.is_ascii_digit()))
                || (c.is_uppercase()
                    && prev.is_uppercase()
                    && next.is_some_and(|n| n.is_lowercase()))
                || (c.is_ascii_digit() && !prev.is_ascii_digit())
                || (!c.is_ascii_digit() && prev.is_ascii_digit());
            if boundary {
                out.push(' ');
            }
        }
        out.push(c);
    }

    out
}

/// Numeric metric value: above 1000 rendered as billions (`$2.9B`), otherwise
/// two decimals.
pub fn format_metric_value(value: f64) -> String {
    if !value.is_finite() {
        return "N/A".to_string();
    }
    if value > 1000.0 {
        format!("${:.1}B", value / 1000.0)
    } else {
        format!("{value:.2}")
    }
}
