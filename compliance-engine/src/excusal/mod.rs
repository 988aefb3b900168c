//! Intersects detected Events with verified external records.

use std::collections::{BTreeMap, BTreeSet};

use compliance_client::domain::{ExternalRecord, RecordKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    detect::{Event, EventClass},
    model::BillingPeriod,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcusedPeriod {
    pub event_id: String,
    pub record_id: String,
    pub meter_id: String,
    pub classification: EventClass,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub reason: RecordKind,
}

/// Whether a record of `kind` can explain an event of `class`.
pub fn compatible(class: EventClass, kind: RecordKind) -> bool {
    use RecordKind::*;
    match class {
        EventClass::Curtailment => matches!(kind, GridCurtailment | BuyerCurtailment | GridOutage),
        EventClass::Outage | EventClass::Degradation => {
            matches!(kind, GridOutage | ForceMajeure | Weather | ScheduledMaintenance)
        }
    }
}

pub fn resolve(
    events: &[Event],
    records: &[ExternalRecord],
    excusable: &BTreeSet<RecordKind>,
) -> Vec<ExcusedPeriod> {
    let mut candidates = Vec::new();
    for event in events {
        // Open events are never excused.
        let Some(event_end) = event.end else { continue };
        for r in records {
            if !excusable.contains(&r.kind)
                || !r.applies_to(&event.meter_id)
                || !compatible(event.classification, r.kind)
                || !r.overlaps(event.start, event_end)
            {
                continue;
            }
            candidates.push(ExcusedPeriod {
                event_id: event.id.clone(),
                record_id: r.id.clone(),
                meter_id: event.meter_id.clone(),
                classification: event.classification,
                start: event.start.max(r.start),
                end: event_end.min(r.end),
                reason: r.kind,
            });
        }
    }

    candidates.sort_by(|a, b| {
        (a.meter_id.as_str(), a.start, a.record_id.as_str()).cmp(&(b.meter_id.as_str(), b.start, b.record_id.as_str()))
    });

    let mut covered: BTreeMap<String, OffsetDateTime> = BTreeMap::new();
    let mut out: Vec<ExcusedPeriod> = Vec::with_capacity(candidates.len());
    for mut c in candidates {
        if let Some(&until) = covered.get(&c.meter_id) {
            if c.end <= until {
                continue;
            }
            c.start = c.start.max(until);
        }
        covered.insert(c.meter_id.clone(), c.end);
        out.push(c);
    }
    out
}

/// Hours of the given classes excused within `period` on `meter_id`.
pub fn excused_hours(
    periods: &[ExcusedPeriod],
    period: &BillingPeriod,
    meter_id: &str,
    classes: &[EventClass],
) -> Decimal {
    periods
        .iter()
        .filter(|p| p.meter_id == meter_id && classes.contains(&p.classification))
        .map(|p| period.overlap_hours(p.start, Some(p.end)))
        .sum()
}
