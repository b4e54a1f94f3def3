//! Typed view over upstream transaction events.
//!
//! Upstream messages are Bitquery-style Solana transaction documents:
//! `Block.Timestamp`, `Transaction.{Signer,Signature,Result.Success}` and a
//! `BalanceUpdates` list. Only the fields the match engine reads are typed;
//! the raw document is kept so enrichment receives it unchanged.

use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("event does not match the expected shape: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("required field {0} is missing or empty")]
    MissingField(&'static str),
}

/// Unit of numeric block timestamps as delivered upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    #[default]
    Seconds,
    Milliseconds,
}

impl TimestampUnit {
    /// Number of units per second.
    pub fn per_second(self) -> f64 {
        match self {
            TimestampUnit::Seconds => 1.0,
            TimestampUnit::Milliseconds => 1000.0,
        }
    }

    fn to_millis(self, value: f64) -> Option<i64> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let ms = match self {
            TimestampUnit::Seconds => value * 1000.0,
            TimestampUnit::Milliseconds => value,
        };
        Some(ms.round() as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawTransaction {
    #[serde(default)]
    signer: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEvent {
    #[serde(default)]
    transaction: Option<RawTransaction>,
}

/// A decoded transaction event plus the raw document it came from.
///
/// Only signer and signature are required. Block time, the result flag and
/// balance-update owners are read leniently: a value of the wrong type is
/// treated as absent instead of rejecting the event.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    /// Block time normalized to milliseconds since the epoch.
    pub block_time_ms: Option<i64>,
    pub signer: String,
    pub signature: String,
    pub success: Option<bool>,
    pub raw: Arc<Value>,
}

impl TransactionEvent {
    pub fn from_value(raw: Value, unit: TimestampUnit) -> Result<Self, EventError> {
        let parsed = RawEvent::deserialize(&raw)?;
        let tx = parsed.transaction.unwrap_or_default();

        let signer = tx
            .signer
            .filter(|s| !s.is_empty())
            .ok_or(EventError::MissingField("Transaction.Signer"))?;
        let signature = tx
            .signature
            .filter(|s| !s.is_empty())
            .ok_or(EventError::MissingField("Transaction.Signature"))?;

        let block_time_ms = peek_block_time_ms(&raw, unit);
        let success = raw
            .pointer("/Transaction/Result/Success")
            .and_then(Value::as_bool);

        Ok(Self {
            block_time_ms,
            signer,
            signature,
            success,
            raw: Arc::new(raw),
        })
    }

    /// True only when the event carries an explicit failure flag.
    pub fn is_failed(&self) -> bool {
        self.success == Some(false)
    }

    fn balance_updates(&self) -> &[Value] {
        self.raw
            .get("BalanceUpdates")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of entries in `BalanceUpdates`.
    pub fn balance_update_count(&self) -> usize {
        self.balance_updates().len()
    }

    /// Token-account owners named by the balance updates. Entries without a
    /// string owner are skipped.
    pub fn token_owners(&self) -> impl Iterator<Item = &str> + '_ {
        self.balance_updates().iter().filter_map(|entry| {
            entry
                .pointer("/BalanceUpdate/Account/Token/Owner")
                .and_then(Value::as_str)
        })
    }
}

fn normalize_timestamp(ts: &RawTimestamp, unit: TimestampUnit) -> Option<i64> {
    match ts {
        RawTimestamp::Number(n) => unit.to_millis(*n),
        RawTimestamp::Text(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<f64>() {
                return unit.to_millis(n);
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis())
        }
    }
}

/// Best-effort block time for an event that failed to decode, used only for ordering.
pub fn peek_block_time_ms(raw: &Value, unit: TimestampUnit) -> Option<i64> {
    let ts = raw.get("Block")?.get("Timestamp")?;
    let parsed = RawTimestamp::deserialize(ts).ok()?;
    normalize_timestamp(&parsed, unit)
}

/// Split an upstream message into individual event documents.
///
/// Messages are either a JSON array of events or a single event object.
pub fn split_message(message: Value) -> Vec<Value> {
    match message {
        Value::Array(items) => items,
        other => vec![other],
    }
}
