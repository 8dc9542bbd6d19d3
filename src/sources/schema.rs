//! Validation helpers shared by the provider wire schemas
//!
//! Providers disagree on whether money is a JSON string or number. Amounts are
//! parsed from their textual form so no value passes through `f64`.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Text(String),
    Number(serde_json::Number),
}

fn parse_amount(raw: RawAmount) -> Result<Decimal, String> {
    let text = match raw {
        RawAmount::Text(s) => s,
        RawAmount::Number(n) => n.to_string(),
    };
    let cleaned: String = text.trim().chars().filter(|c| *c != ',').collect();
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .map_err(|e| format!("invalid amount '{}': {}", text, e))
}

pub fn decimal<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
    let raw = RawAmount::deserialize(deserializer)?;
    parse_amount(raw).map_err(serde::de::Error::custom)
}

pub fn optional_decimal<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Decimal>, D::Error> {
    let raw = Option::<RawAmount>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(RawAmount::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(raw) => parse_amount(raw).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Lenient amount parse for report cells that may hold labels or blanks
pub fn cell_amount(value: &str) -> Option<Decimal> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    parse_amount(RawAmount::Text(trimmed.to_string())).ok()
}
