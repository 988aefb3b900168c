use std::collections::BTreeMap;

use compliance_client::domain::MeterReading;
use rust_decimal::Decimal;
use time::{Duration, OffsetDateTime};

/// One populated interval slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalValue {
    pub slot: i64,
    pub start: OffsetDateTime,
    pub value: Decimal,
}

/// Readings of one meter bucketed into fixed slots over `[start, end)`.
///
/// Slot `n` covers `[start + n·interval, start + (n+1)·interval)`. When two
/// readings land in the same slot the earliest (then smallest) one wins and the
/// other is counted as a duplicate.
#[derive(Debug, Clone)]
pub struct IntervalSeries {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub interval: Duration,
    pub values: Vec<IntervalValue>,
    pub duplicates: u32,
}

impl IntervalSeries {
    pub fn from_readings(
        meter_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
        interval: Duration,
        readings: &[MeterReading],
    ) -> Self {
        let mut ordered: Vec<&MeterReading> = readings
            .iter()
            .filter(|r| r.meter_id == meter_id && r.ts >= start && r.ts < end)
            .collect();
        ordered.sort_by(|a, b| a.ts.cmp(&b.ts).then(a.value.cmp(&b.value)));

        let step = interval.whole_nanoseconds().max(1);
        let mut slots: BTreeMap<i64, IntervalValue> = BTreeMap::new();
        let mut duplicates = 0u32;
        for r in ordered {
            let slot = ((r.ts - start).whole_nanoseconds() / step) as i64;
            if slots.contains_key(&slot) {
                duplicates += 1;
                continue;
            }
            slots.insert(
                slot,
                IntervalValue {
                    slot,
                    start: start + interval * slot as i32,
                    value: r.value,
                },
            );
        }

        Self {
            start,
            end,
            interval,
            values: slots.into_values().collect(),
            duplicates,
        }
    }

    /// Number of slots in the window, counting a trailing partial slot.
    pub fn expected_slots(&self) -> u32 {
        let total = (self.end - self.start).whole_nanoseconds();
        let step = self.interval.whole_nanoseconds().max(1);
        ((total + step - 1) / step) as u32
    }

    /// Start and end of a slot, the end clipped to the window.
    pub fn slot_bounds(&self, slot: i64) -> (OffsetDateTime, OffsetDateTime) {
        let lo = self.start + self.interval * slot as i32;
        let hi = (lo + self.interval).min(self.end);
        (lo, hi)
    }

    pub fn sum(&self) -> Decimal {
        self.values.iter().map(|v| v.value).sum()
    }
}
