use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::DomainError;

/// Kind of an externally verified grid or weather fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    GridOutage,
    GridCurtailment,
    ForceMajeure,
    BuyerCurtailment,
    Weather,
    ScheduledMaintenance,
}

impl RecordKind {
    pub const ALL: [RecordKind; 6] = [
        Self::GridOutage,
        Self::GridCurtailment,
        Self::ForceMajeure,
        Self::BuyerCurtailment,
        Self::Weather,
        Self::ScheduledMaintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GridOutage => "grid_outage",
            Self::GridCurtailment => "grid_curtailment",
            Self::ForceMajeure => "force_majeure",
            Self::BuyerCurtailment => "buyer_curtailment",
            Self::Weather => "weather",
            Self::ScheduledMaintenance => "scheduled_maintenance",
        }
    }

    /// True for records that instruct the plant to reduce output.
    pub fn is_curtailment_instruction(&self) -> bool {
        matches!(self, Self::GridCurtailment | Self::BuyerCurtailment)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == needle)
            .ok_or(DomainError::UnknownRecordKind(needle))
    }
}

/// Grid-operator or weather/force-majeure record used to evidence excusal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub id: String,
    pub kind: RecordKind,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    /// `None` means the record applies to every meter on the site.
    #[serde(default)]
    pub meter_id: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
}

impl ExternalRecord {
    pub fn applies_to(&self, meter_id: &str) -> bool {
        self.meter_id.as_deref().map_or(true, |m| m == meter_id)
    }

    /// Half-open overlap test against `[start, end)`.
    pub fn overlaps(&self, start: OffsetDateTime, end: OffsetDateTime) -> bool {
        self.start < end && start < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn record(meter_id: Option<&str>) -> ExternalRecord {
        ExternalRecord {
            id: "rec-1".to_string(),
            kind: RecordKind::GridOutage,
            start: datetime!(2024-06-03 10:00:00 UTC),
            end: datetime!(2024-06-03 12:00:00 UTC),
            meter_id: meter_id.map(str::to_string),
            reference: None,
        }
    }

    #[test]
    fn site_wide_record_applies_to_any_meter() {
        assert!(record(None).applies_to("m-1"));
        assert!(record(Some("m-2")).applies_to("m-2"));
        assert!(!record(Some("m-2")).applies_to("m-1"));
    }

    #[test]
    fn overlap_is_half_open() {
        let r = record(None);
        assert!(!r.overlaps(datetime!(2024-06-03 12:00:00 UTC), datetime!(2024-06-03 13:00:00 UTC)));
        assert!(r.overlaps(datetime!(2024-06-03 11:59:00 UTC), datetime!(2024-06-03 13:00:00 UTC)));
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in RecordKind::ALL {
            assert_eq!(kind.as_str().parse::<RecordKind>().unwrap(), kind);
        }
    }
}
