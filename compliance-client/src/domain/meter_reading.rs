use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingUnit {
    /// Energy delivered over one metering interval.
    Kwh,
    /// Average demand over one metering interval.
    Kw,
    /// Plane-of-array insolation over one interval (pyranometer).
    KwhPerM2,
}

impl ReadingUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kwh => "kwh",
            Self::Kw => "kw",
            Self::KwhPerM2 => "kwh_per_m2",
        }
    }
}

impl fmt::Display for ReadingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadingUnit {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kwh" => Ok(Self::Kwh),
            "kw" => Ok(Self::Kw),
            "kwh_per_m2" | "kwh/m2" => Ok(Self::KwhPerM2),
            other => Err(DomainError::UnknownUnit(other.to_string())),
        }
    }
}

/// One interval reading as appended by the metering-ingestion collaborator.
///
/// Readings are immutable facts; the engine never rewrites them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterReading {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub meter_id: String,
    pub value: Decimal,
    pub unit: ReadingUnit,
    #[serde(default)]
    pub quality_flag: Option<String>,
    #[serde(default)]
    pub source_system: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_parses_aliases_case_insensitively() {
        assert_eq!("KWH".parse::<ReadingUnit>().unwrap(), ReadingUnit::Kwh);
        assert_eq!("kwh/m2".parse::<ReadingUnit>().unwrap(), ReadingUnit::KwhPerM2);
        assert!(matches!("mwh".parse::<ReadingUnit>(), Err(DomainError::UnknownUnit(_))));
    }
}
