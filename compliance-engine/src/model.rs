use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::{
    error::{EngineError, EngineResult},
    money,
};

/// A closed billing period `[start, end)`, always held in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    #[serde(serialize_with = "time::serde::rfc3339::serialize", deserialize_with = "utc_rfc3339")]
    pub start: OffsetDateTime,
    #[serde(serialize_with = "time::serde::rfc3339::serialize", deserialize_with = "utc_rfc3339")]
    pub end: OffsetDateTime,
}

fn utc_rfc3339<'de, D: Deserializer<'de>>(d: D) -> Result<OffsetDateTime, D::Error> {
    time::serde::rfc3339::deserialize(d).map(|ts| ts.to_offset(UtcOffset::UTC))
}

impl BillingPeriod {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> EngineResult<Self> {
        if start >= end {
            return Err(EngineError::InvalidRequest(format!(
                "period start {start} must be before end {end}"
            )));
        }
        Ok(Self {
            start: start.to_offset(UtcOffset::UTC),
            end: end.to_offset(UtcOffset::UTC),
        })
    }

    /// Stable identifier built from the unix bounds.
    pub fn id(&self) -> String {
        format!("{}-{}", self.start.unix_timestamp(), self.end.unix_timestamp())
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn total_hours(&self) -> Decimal {
        money::hours(self.duration())
    }

    /// Intersection with `[start, end)`; an open `end` extends to the period end.
    pub fn clip(
        &self,
        start: OffsetDateTime,
        end: Option<OffsetDateTime>,
    ) -> Option<(OffsetDateTime, OffsetDateTime)> {
        let lo = start.max(self.start);
        let hi = end.map_or(self.end, |e| e.min(self.end));
        (lo < hi).then_some((lo, hi))
    }

    pub fn overlap_hours(&self, start: OffsetDateTime, end: Option<OffsetDateTime>) -> Decimal {
        self.clip(start, end)
            .map_or(Decimal::ZERO, |(lo, hi)| money::hours(hi - lo))
    }

    pub fn covers(&self, other: &BillingPeriod) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {})", self.start, self.end)
    }
}

/// Incremental blake3 identifier builder.
///
/// Every field is length-prefixed so adjacent strings cannot collide.
pub struct IdHasher(blake3::Hasher);

impl IdHasher {
    pub fn new(domain: &str) -> Self {
        let mut h = Self(blake3::Hasher::new());
        h.str(domain);
        h
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        let len = s.len() as u32;
        self.0.update(&len.to_le_bytes());
        self.0.update(s.as_bytes());
        self
    }

    pub fn opt_str(&mut self, s: Option<&str>) -> &mut Self {
        match s {
            Some(v) => {
                self.0.update(&[1]);
                self.str(v)
            }
            None => {
                self.0.update(&[0]);
                self
            }
        }
    }

    pub fn ts(&mut self, ts: OffsetDateTime) -> &mut Self {
        self.0.update(&ts.unix_timestamp_nanos().to_le_bytes());
        self
    }

    pub fn finish(&self) -> String {
        self.0.finalize().to_hex().to_string()
    }
}

/// Key that at most one RuleResult and one DefaultEvent may carry.
pub fn idempotency_key(contract_id: &str, clause_id: &str, period: &BillingPeriod) -> String {
    IdHasher::new("evaluation")
        .str(contract_id)
        .str(clause_id)
        .ts(period.start)
        .ts(period.end)
        .finish()
}

/// blake3 over the JSON encoding of a value. Callers keep maps ordered.
pub fn digest_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}
