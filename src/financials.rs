//! Grouping of Finnhub basic-financials metrics into dashboard panels.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::format::{format_metric_name, format_metric_value};
use crate::providers::finnhub::{BasicFinancials, MetricValue, SeriesPoint};

const KEY_METRICS: &[&str] = &[
    "10DayAverageTradingVolume",
    "13WeekPriceReturnDaily",
    "26WeekPriceReturnDaily",
    "52WeekHigh",
    "52WeekLow",
    "52WeekPriceReturnDaily",
    "5DayPriceReturnDaily",
];

const PERFORMANCE_METRICS: &[&str] = &[
    "assetTurnoverAnnual",
    "assetTurnoverTTM",
    "bookValuePerShareAnnual",
    "bookValuePerShareQuarterly",
    "bookValueShareGrowth5Y",
    "capexCagr5Y",
];

/// Annual series charted on the performance panel.
const PERFORMANCE_SERIES: &[&str] = &["eps", "revenuePerShare", "freeCashFlowPerShare"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEntry {
    pub key: String,
    pub name: String,
    pub value: MetricValue,
    pub display: String,
    pub description: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FinancialsView {
    pub symbol: Option<String>,
    pub key_metrics: Vec<MetricEntry>,
    pub performance: Vec<MetricEntry>,
    pub ratios: Vec<MetricEntry>,
    pub valuation: Vec<MetricEntry>,
    pub annual_series: BTreeMap<String, Vec<SeriesPoint>>,
}

/// Split the metric map into panels.
///
/// Key and performance panels follow fixed key lists (in list order, missing
/// keys skipped). Ratios are keys containing `Ratio` or `Margin`; valuation
/// is keys containing `PE`, `Price` or `EV`. A key may land in several
/// panels. Null metrics are skipped everywhere.
pub fn categorize(financials: &BasicFinancials) -> FinancialsView {
    let present = |key: &str| -> Option<MetricEntry> {
        financials
            .metric
            .get(key)
            .and_then(Option::as_ref)
            .map(|value| entry(key, value))
    };
    let matching = |needles: &[&str]| -> Vec<MetricEntry> {
        financials
            .metric
            .iter()
            .filter(|(key, _)| needles.iter().any(|n| key.contains(n)))
            .filter_map(|(key, value)| value.as_ref().map(|v| entry(key, v)))
            .collect()
    };

    FinancialsView {
        symbol: financials.symbol.clone(),
        key_metrics: KEY_METRICS.iter().filter_map(|&k| present(k)).collect(),
        performance: PERFORMANCE_METRICS.iter().filter_map(|&k| present(k)).collect(),
        ratios: matching(&["Ratio", "Margin"]),
        valuation: matching(&["PE", "Price", "EV"]),
        annual_series: performance_series(financials),
    }
}

/// Annual points for the charted performance series, oldest first.
pub fn performance_series(financials: &BasicFinancials) -> BTreeMap<String, Vec<SeriesPoint>> {
    PERFORMANCE_SERIES
        .iter()
        .filter_map(|key| {
            financials.series.annual.get(*key).map(|points| {
                let mut points = points.clone();
                points.sort_by(|a, b| a.period.cmp(&b.period));
                (key.to_string(), points)
            })
        })
        .collect()
}

fn entry(key: &str, value: &MetricValue) -> MetricEntry {
    let display = match value {
        MetricValue::Number(n) => format_metric_value(*n),
        MetricValue::Text(t) => t.clone(),
    };
    MetricEntry {
        key: key.to_string(),
        name: format_metric_name(key),
        value: value.clone(),
        display,
        description: describe_metric(key),
    }
}

/// Tooltip text for a metric key.
pub fn describe_metric(key: &str) -> &'static str {
    match key {
        "10DayAverageTradingVolume" => "Average trading volume over the last 10 days",
        "13WeekPriceReturnDaily" => "13-week price return percentage",
        "26WeekPriceReturnDaily" => "26-week price return percentage",
        "52WeekHigh" => "Highest price in the last 52 weeks",
        "52WeekLow" => "Lowest price in the last 52 weeks",
        "52WeekPriceReturnDaily" => "52-week price return percentage",
        "5DayPriceReturnDaily" => "5-day price return percentage",
        "assetTurnoverAnnual" => "Annual asset turnover ratio",
        "assetTurnoverTTM" => "Trailing twelve months asset turnover",
        "bookValuePerShareAnnual" => "Annual book value per share",
        "bookValuePerShareQuarterly" => "Quarterly book value per share",
        "bookValueShareGrowth5Y" => "5-year book value per share growth rate",
        "capexCagr5Y" => "5-year capital expenditure compound annual growth rate",
        "eps" => "Earnings per share indicates company profitability per outstanding share",
        "peRatio" => "Price-to-Earnings ratio shows how much investors pay for each dollar of earnings",
        "debtToEquity" => "Indicates relative proportion of shareholders' equity and debt used to finance assets",
        "currentRatio" => "Measures company's ability to pay short-term obligations",
        "returnOnEquity" => "Measures profitability relative to shareholders' equity",
        _ => "Key financial metric indicating company performance",
    }
}
