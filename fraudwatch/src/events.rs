// fraudwatch/src/events.rs
//
// Domain types flowing through fraudwatch.
//
//   RawTransaction  - wire record exactly as received (loose typing)
//   Transaction     - validated, immutable once built
//   Decision        - scoring outcome (probability + label + fail-safe reason)
//   ProcessedRecord - what the persistence sink receives
//   Notification    - what the notification sink receives

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EventError;

// ── Wire format ───────────────────────────────────────────────────────────────

/// Card numbers, SSNs and unix times show up both quoted and bare depending
/// on the producer.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s)  => s.trim().to_string(),
            Self::Int(i)   => i.to_string(),
            Self::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e18 { format!("{}", *f as i64) }
                else { f.to_string() }
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Text(s)  => s.trim().parse().ok(),
            Self::Int(i)   => Some(*i as f64),
            Self::Float(f) => Some(*f),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTransaction {
    pub trans_num:  Option<Scalar>,
    pub cc_num:     Option<Scalar>,
    pub ssn:        Option<Scalar>,
    pub acct_num:   Option<Scalar>,
    pub merchant:   Option<String>,
    pub category:   Option<String>,
    pub amt:        Option<Scalar>,
    pub city:       Option<String>,
    pub state:      Option<String>,
    pub city_pop:   Option<Scalar>,
    pub lat:        Option<Scalar>,
    pub long:       Option<Scalar>,
    pub merch_lat:  Option<Scalar>,
    pub merch_long: Option<Scalar>,
    pub trans_date: Option<String>,
    pub trans_time: Option<String>,
    pub unix_time:  Option<Scalar>,
    pub dob:        Option<String>,
    pub gender:     Option<String>,
}

// ── Validated transaction ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Great-circle distance in kilometres.
    pub fn haversine_km(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * a.clamp(0.0, 1.0).sqrt().asin() * EARTH_RADIUS_KM
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub trans_num:         String,
    pub card_id:           String,
    pub user_id:           String,
    pub account_id:        Option<String>,
    pub merchant:          String,
    pub category:          String,
    pub amount:            f64,
    pub city:              Option<String>,
    pub state:             Option<String>,
    pub city_pop:          Option<f64>,
    pub location:          Option<GeoPoint>,
    pub merchant_location: Option<GeoPoint>,
    pub timestamp:         DateTime<Utc>,
    pub dob:               Option<NaiveDate>,
    pub gender:            Option<String>,
}

impl Transaction {
    /// Parse one JSON record off the wire.
    pub fn from_json(line: &str) -> Result<Self, EventError> {
        let raw: RawTransaction = serde_json::from_str(line)
            .map_err(|e| EventError::Malformed(format!("invalid json: {e}")))?;
        Self::try_from(raw)
    }
}

fn required(field: &'static str, v: Option<&Scalar>) -> Result<String, EventError> {
    match v.map(Scalar::as_text) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(EventError::Malformed(format!("missing {field}"))),
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn geo(lat: Option<&Scalar>, lon: Option<&Scalar>) -> Option<GeoPoint> {
    let lat = lat.and_then(Scalar::as_f64)?;
    let lon = lon.and_then(Scalar::as_f64)?;
    (lat.is_finite() && lon.is_finite()).then_some(GeoPoint { lat, lon })
}

fn compose_timestamp(raw: &RawTransaction) -> Result<DateTime<Utc>, EventError> {
    if let (Some(d), Some(t)) = (raw.trans_date.as_deref(), raw.trans_time.as_deref()) {
        let date = NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d")
            .map_err(|e| EventError::Malformed(format!("trans_date {d:?}: {e}")))?;
        let time = NaiveTime::parse_from_str(t.trim(), "%H:%M:%S")
            .map_err(|e| EventError::Malformed(format!("trans_time {t:?}: {e}")))?;
        return Ok(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)));
    }
    raw.unix_time.as_ref()
        .and_then(Scalar::as_f64)
        .filter(|s| s.is_finite())
        .and_then(|s| Utc.timestamp_opt(s as i64, 0).single())
        .ok_or_else(|| EventError::Malformed("no trans_date/trans_time or unix_time".into()))
}

impl TryFrom<RawTransaction> for Transaction {
    type Error = EventError;

    fn try_from(raw: RawTransaction) -> Result<Self, Self::Error> {
        let trans_num = required("trans_num", raw.trans_num.as_ref())?;
        let card_id   = required("cc_num", raw.cc_num.as_ref())?;
        let user_id   = required("ssn", raw.ssn.as_ref())?;
        let merchant  = non_empty(raw.merchant.clone())
            .ok_or_else(|| EventError::Malformed("missing merchant".into()))?;

        let amount = raw.amt.as_ref()
            .and_then(Scalar::as_f64)
            .ok_or_else(|| EventError::Malformed("missing amt".into()))?;
        if !amount.is_finite() || amount < 0.0 {
            return Err(EventError::Malformed(format!("invalid amt {amount}")));
        }

        let timestamp = compose_timestamp(&raw)?;
        let dob = raw.dob.as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok());

        Ok(Self {
            trans_num,
            card_id,
            user_id,
            account_id:        raw.acct_num.as_ref().map(Scalar::as_text).filter(|s| !s.is_empty()),
            merchant,
            category:          non_empty(raw.category).unwrap_or_else(|| "unknown".into()),
            amount,
            city:              non_empty(raw.city),
            state:             non_empty(raw.state),
            city_pop:          raw.city_pop.as_ref().and_then(Scalar::as_f64).filter(|p| p.is_finite()),
            location:          geo(raw.lat.as_ref(), raw.long.as_ref()),
            merchant_location: geo(raw.merch_lat.as_ref(), raw.merch_long.as_ref()),
            timestamp,
            dob,
            gender:            non_empty(raw.gender),
        })
    }
}

// ── Decisions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    Legit,
    Fraud,
}

impl Label {
    pub fn as_flag(self) -> u8 {
        match self {
            Self::Legit => 0,
            Self::Fraud => 1,
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_flag())
    }
}

/// Why a decision fell back to label 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailSafeReason {
    ModelUnavailable,
    ScoringFailure,
    Timeout,
}

impl std::fmt::Display for FailSafeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelUnavailable => write!(f, "model_unavailable"),
            Self::ScoringFailure   => write!(f, "scoring_failure"),
            Self::Timeout          => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub probability: f64,
    pub label:       Label,
    pub fail_safe:   Option<FailSafeReason>,
}

impl Decision {
    pub fn fail_safe(reason: FailSafeReason) -> Self {
        Self { probability: 0.0, label: Label::Legit, fail_safe: Some(reason) }
    }

    pub fn is_fail_safe(&self) -> bool { self.fail_safe.is_some() }
}

// ── Outbound records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub transaction:  Transaction,
    pub decision:     Decision,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedRecord {
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub trans_num:  String,
    pub flag_value: u8,
}

// ── Per-event lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Received,
    FeaturesComputed,
    Scored,
    Notified,
    Persisted,
    StateCommitted,
}
