use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceHistoryStats {
    pub min_price: i64,
    pub max_price: i64,
    pub avg_price: f64,
    pub total_deals: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceHistoryEntry {
    pub price: i64,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default, alias = "date")]
    pub ts: Option<DateTime<Utc>>,
}

/// Past sightings of a product, newest first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceHistory {
    pub stats: PriceHistoryStats,
    #[serde(default)]
    pub history: Vec<PriceHistoryEntry>,
}

impl PriceHistory {
    /// A single sighting is not a history worth charting.
    pub fn has_enough_history(&self) -> bool {
        self.stats.total_deals >= 2
    }

    /// Entries in chronological order, skipping ones without a usable date.
    pub fn chronological(&self) -> impl Iterator<Item = &PriceHistoryEntry> {
        self.history.iter().rev().filter(|entry| entry.ts.is_some())
    }
}

/// Outcome of a price history lookup. A product the backend has never seen is
/// not an error.
#[derive(Clone, Debug, PartialEq)]
pub enum PriceHistoryLookup {
    Found(PriceHistory),
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PriceLevel {
    Great,
    Good,
    Average,
    Above,
    High,
}

impl PriceLevel {
    pub fn label(&self) -> &'static str {
        match self {
            PriceLevel::Great => "Ótimo preço!",
            PriceLevel::Good => "Bom preço",
            PriceLevel::Average => "Preço na média",
            PriceLevel::Above => "Acima da média",
            PriceLevel::High => "Preço alto",
        }
    }

    fn trend(&self) -> Option<PriceTrend> {
        match self {
            PriceLevel::Great | PriceLevel::Good => Some(PriceTrend::Down),
            PriceLevel::Average => None,
            PriceLevel::Above | PriceLevel::High => Some(PriceTrend::Up),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PriceTrend {
    Down,
    Up,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PriceIndicator {
    pub level: PriceLevel,
    pub trend: Option<PriceTrend>,
    /// Where the price sits between the historical min (0.0) and max (1.0).
    pub position: f64,
}

impl PriceIndicator {
    fn new(level: PriceLevel, position: f64) -> Self {
        Self {
            level,
            trend: level.trend(),
            position,
        }
    }
}

/// Classify `price_in_cents` against the product's price history.
pub fn price_indicator(price_in_cents: i64, stats: &PriceHistoryStats) -> Option<PriceIndicator> {
    let min = stats.min_price;
    let max = stats.max_price;
    if min <= 0 || max <= 0 {
        return None;
    }

    let range = max - min;
    if range <= 0 {
        return Some(PriceIndicator::new(PriceLevel::Average, 0.5));
    }

    let price = price_in_cents as f64;
    let (min, max) = (min as f64, max as f64);
    let position = ((price - min) / range as f64).clamp(0.0, 1.0);
    let pct_above_min = (price - min) / min;
    let pct_below_max = (max - price) / max;

    let level = if pct_above_min <= 0.02 {
        PriceLevel::Great
    } else if pct_below_max <= 0.02 {
        PriceLevel::High
    } else if position <= 0.15 {
        PriceLevel::Great
    } else if position <= 0.4 {
        PriceLevel::Good
    } else if position <= 0.6 {
        PriceLevel::Average
    } else if position <= 0.85 {
        PriceLevel::Above
    } else {
        PriceLevel::High
    };

    Some(PriceIndicator::new(level, position))
}

/// Render centavos as Brazilian reais, e.g. `R$ 1.234,56`.
pub fn format_price_brl(price_in_cents: i64) -> String {
    let sign = if price_in_cents < 0 { "-" } else { "" };
    let cents = price_in_cents.unsigned_abs();
    let reais = (cents / 100).to_string();

    let mut grouped = String::with_capacity(reais.len() + reais.len() / 3);
    for (i, digit) in reais.chars().enumerate() {
        if i > 0 && (reais.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(digit);
    }

    format!("{sign}R$ {grouped},{:02}", cents % 100)
}
