pub mod mailbox;
pub mod router;
pub mod webhook;

use std::str::FromStr as _;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized alert as produced by an ingestion transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub kind: String,
    pub raw_payload: Value,
    pub received_at: DateTime<Utc>,
}

impl TradeSignal {
    /// Builds a signal from an alert body. `kind` comes from the `kind`
    /// field, else from `action`.
    pub fn from_payload(payload: Value, received_at: DateTime<Utc>) -> Self {
        let kind = ["kind", "action"]
            .iter()
            .find_map(|field| payload.get(*field).and_then(Value::as_str))
            .unwrap_or_default()
            .trim()
            .to_string();
        Self {
            kind,
            raw_payload: payload,
            received_at,
        }
    }

    pub fn subject(&self) -> Option<&str> {
        self.raw_payload.get("subject").and_then(Value::as_str)
    }

    /// `amount` as a decimal; JSON numbers go through their textual form.
    pub fn amount(&self) -> Result<Option<Decimal>, String> {
        let parsed = match self.raw_payload.get("amount") {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::String(s)) => Decimal::from_str(s.trim()),
            Some(Value::Number(n)) => {
                let text = n.to_string();
                Decimal::from_str(&text).or_else(|_| Decimal::from_scientific(&text))
            }
            Some(other) => return Err(format!("amount must be a number or string, got {other}")),
        };
        parsed
            .map(Some)
            .map_err(|e| format!("invalid amount: {e}"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalRules {
    /// Extra `kind` values meaning buy, e.g. `buy_eth`.
    pub buy_aliases: Vec<String>,
    pub sell_aliases: Vec<String>,
    /// When set, a payload carrying a different `subject` is ignored.
    pub trigger_subject: Option<String>,
}

impl SignalRules {
    pub fn accepts_subject(&self, subject: &str) -> bool {
        self.trigger_subject
            .as_deref()
            .is_none_or(|expected| subject.trim() == expected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Recognized(SignalClass),
    Unrecognized(String),
}

/// Precedence: subject gate, then exact `buy`/`sell`, then aliases.
pub fn classify(signal: &TradeSignal, rules: &SignalRules) -> Classification {
    if let Some(subject) = signal.subject()
        && !rules.accepts_subject(subject)
    {
        return Classification::Unrecognized(format!("subject {subject:?} is not a trigger"));
    }

    let kind = signal.kind.to_ascii_lowercase();
    match kind.as_str() {
        "buy" => return Classification::Recognized(SignalClass::Buy),
        "sell" => return Classification::Recognized(SignalClass::Sell),
        _ => {}
    }

    let matches = |aliases: &[String]| aliases.iter().any(|a| a.eq_ignore_ascii_case(&kind));
    if matches(&rules.buy_aliases) {
        return Classification::Recognized(SignalClass::Buy);
    }
    if matches(&rules.sell_aliases) {
        return Classification::Recognized(SignalClass::Sell);
    }

    if kind.is_empty() {
        Classification::Unrecognized("signal carries no kind or action".to_string())
    } else {
        Classification::Unrecognized(format!("unknown signal kind {:?}", signal.kind))
    }
}
