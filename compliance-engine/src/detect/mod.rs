//! Event detection over a meter's interval series.
//!
//! Each populated slot is classified; consecutive slots of the same abnormal
//! class form a run, and runs at least `min_duration_minutes` long become
//! Events. A run that is still active when the data ends yields an open Event.

use compliance_client::domain::{ExternalRecord, MeterReading};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{
    aggregate::{IntervalSeries, IntervalValue},
    config::{AggregationConfig, DetectionConfig, MeterKind, MeterProfile, OpenEventPolicy},
    error::{EngineError, EngineResult},
    model::{BillingPeriod, IdHasher},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    Outage,
    Curtailment,
    Degradation,
}

impl EventClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outage => "outage",
            Self::Curtailment => "curtailment",
            Self::Degradation => "degradation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Detector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub meter_id: String,
    pub classification: EventClass,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    /// `None` while the condition has not been seen to clear.
    #[serde(with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
    pub severity: Severity,
    pub source: EventSource,
    #[serde(default)]
    pub time_boxed: bool,
}

impl Event {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    pub fn overlaps(&self, period: &BillingPeriod) -> bool {
        period.clip(self.start, self.end).is_some()
    }
}

pub struct DetectionInput<'a> {
    pub profile: &'a MeterProfile,
    pub readings: &'a [MeterReading],
    /// External records; only curtailment instructions for this meter are used.
    pub records: &'a [ExternalRecord],
    pub window_start: OffsetDateTime,
    pub window_end: OffsetDateTime,
}

struct Run {
    class: EventClass,
    first_slot: i64,
    last_slot: i64,
    ratio_sum: Decimal,
    ratio_samples: u32,
}

fn classify(
    v: &IntervalValue,
    slot_end: OffsetDateTime,
    input: &DetectionInput<'_>,
    cfg: &DetectionConfig,
) -> Option<EventClass> {
    let profile = input.profile;
    if !profile.operating_window.contains(v.start) {
        return None;
    }
    let expected = profile.expected_interval_kwh;

    let instructed = input.records.iter().any(|r| {
        r.kind.is_curtailment_instruction() && r.applies_to(&profile.meter_id) && r.overlaps(v.start, slot_end)
    });
    if instructed && expected.map_or(true, |e| v.value < e) {
        return Some(EventClass::Curtailment);
    }
    if v.value <= cfg.near_zero_kwh {
        return Some(EventClass::Outage);
    }
    match expected {
        Some(e) if v.value < e * cfg.degradation_ratio => Some(EventClass::Degradation),
        _ => None,
    }
}

fn severity(run: &Run, duration: Duration) -> Severity {
    match run.class {
        EventClass::Outage if duration >= Duration::hours(24) => Severity::Critical,
        EventClass::Outage if duration >= Duration::hours(4) => Severity::High,
        EventClass::Outage => Severity::Medium,
        EventClass::Curtailment => Severity::Low,
        EventClass::Degradation => {
            let mean = if run.ratio_samples == 0 {
                Decimal::ONE
            } else {
                run.ratio_sum / Decimal::from(run.ratio_samples)
            };
            if mean < Decimal::new(5, 1) {
                Severity::High
            } else if mean < Decimal::new(7, 1) {
                Severity::Medium
            } else {
                Severity::Low
            }
        }
    }
}

fn event_id(meter_id: &str, class: EventClass, start: OffsetDateTime) -> String {
    IdHasher::new("event")
        .str(meter_id)
        .str(class.as_str())
        .ts(start)
        .finish()
}

pub fn detect(input: DetectionInput<'_>, aggregation: &AggregationConfig, cfg: &DetectionConfig) -> Vec<Event> {
    let profile = input.profile;
    if profile.kind != MeterKind::Generation {
        return Vec::new();
    }

    let series = IntervalSeries::from_readings(
        &profile.meter_id,
        input.window_start,
        input.window_end,
        aggregation.interval(),
        input.readings,
    );
    let min_duration = Duration::minutes(i64::from(cfg.min_duration_minutes));
    let max_gap = i64::from(cfg.max_gap_intervals);

    let mut events = Vec::new();
    let mut current: Option<Run> = None;

    let close = |run: Run, open: bool, events: &mut Vec<Event>| {
        let (start, _) = series.slot_bounds(run.first_slot);
        let (_, last_end) = series.slot_bounds(run.last_slot);
        let duration = last_end - start;
        if duration < min_duration {
            if open {
                tracing::debug!(
                    meter_id = %profile.meter_id,
                    class = run.class.as_str(),
                    "trailing condition shorter than minimum duration ignored"
                );
            }
            return;
        }
        events.push(Event {
            id: event_id(&profile.meter_id, run.class, start),
            meter_id: profile.meter_id.clone(),
            classification: run.class,
            start,
            end: (!open).then_some(last_end),
            severity: severity(&run, duration),
            source: EventSource::Detector,
            time_boxed: false,
        });
    };

    for v in &series.values {
        let (_, slot_end) = series.slot_bounds(v.slot);
        let cond = classify(v, slot_end, &input, cfg);

        if let Some(run) = current.as_mut() {
            let gap = v.slot - run.last_slot - 1;
            if cond == Some(run.class) && gap <= max_gap {
                run.last_slot = v.slot;
                if let Some(e) = profile.expected_interval_kwh.filter(|e| !e.is_zero()) {
                    run.ratio_sum += v.value / e;
                    run.ratio_samples += 1;
                }
                continue;
            }
        }
        if let Some(run) = current.take() {
            close(run, false, &mut events);
        }
        if let Some(class) = cond {
            let mut run = Run {
                class,
                first_slot: v.slot,
                last_slot: v.slot,
                ratio_sum: Decimal::ZERO,
                ratio_samples: 0,
            };
            if let Some(e) = profile.expected_interval_kwh.filter(|e| !e.is_zero()) {
                run.ratio_sum = v.value / e;
                run.ratio_samples = 1;
            }
            current = Some(run);
        }
    }
    if let Some(run) = current.take() {
        close(run, true, &mut events);
    }

    metrics::counter!("events_detected_total").increment(events.len() as u64);
    events
}

/// Keeps the events overlapping `period` and applies the open-event policy.
pub fn events_for_period(
    events: Vec<Event>,
    period: &BillingPeriod,
    policy: OpenEventPolicy,
    contract_id: &str,
) -> EngineResult<Vec<Event>> {
    let mut kept = Vec::with_capacity(events.len());
    for mut e in events.into_iter().filter(|e| e.overlaps(period)) {
        if e.is_open() {
            match policy {
                OpenEventPolicy::Block => {
                    return Err(EngineError::data_unavailable(
                        contract_id,
                        period.id(),
                        None,
                        format!(
                            "{} event {} on meter {} is still open at period end",
                            e.classification.as_str(),
                            e.id,
                            e.meter_id
                        ),
                    ));
                }
                OpenEventPolicy::TimeBox => {
                    e.end = Some(period.end);
                    e.time_boxed = true;
                }
            }
        }
        kept.push(e);
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HourWindow;
    use crate::testutil::{generation_meter, hourly_readings, record};
    use compliance_client::domain::RecordKind;
    use time::macros::datetime;

    fn hourly() -> AggregationConfig {
        AggregationConfig {
            interval_minutes: 60,
            ..AggregationConfig::default()
        }
    }

    fn solar_meter() -> MeterProfile {
        MeterProfile {
            expected_interval_kwh: Some(Decimal::from(100)),
            operating_window: HourWindow { start_hour: 6, end_hour: 18 },
            ..generation_meter("m-1")
        }
    }

    fn run_detect(values: &[i64], records: &[ExternalRecord]) -> Vec<Event> {
        let start = datetime!(2024-06-03 00:00:00 UTC);
        let readings = hourly_readings("m-1", start, values);
        let profile = solar_meter();
        detect(
            DetectionInput {
                profile: &profile,
                readings: &readings,
                records,
                window_start: start,
                window_end: start + Duration::hours(values.len() as i64),
            },
            &hourly(),
            &DetectionConfig::default(),
        )
    }

    fn day(overrides: &[(usize, i64)]) -> Vec<i64> {
        let mut v: Vec<i64> = (0..24).map(|h| if (6..18).contains(&h) { 100 } else { 0 }).collect();
        for &(h, value) in overrides {
            v[h] = value;
        }
        v
    }

    #[test]
    fn zero_output_in_operating_window_opens_and_closes_outage() {
        let events = run_detect(&day(&[(9, 0), (10, 0), (11, 0)]), &[]);
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.classification, EventClass::Outage);
        assert_eq!(e.start, datetime!(2024-06-03 09:00:00 UTC));
        assert_eq!(e.end, Some(datetime!(2024-06-03 12:00:00 UTC)));
        assert_eq!(e.severity, Severity::Medium);
    }

    #[test]
    fn night_time_zero_is_not_an_outage() {
        assert!(run_detect(&day(&[]), &[]).is_empty());
    }

    #[test]
    fn single_noisy_sample_below_min_duration_is_ignored() {
        let start = datetime!(2024-06-03 00:00:00 UTC);
        let quarter = AggregationConfig::default();
        let mut readings = Vec::new();
        for q in 0..96i64 {
            let ts = start + Duration::minutes(15 * q);
            let h = q / 4;
            let value = if q == 40 || !(6..18).contains(&h) { 0 } else { 25 };
            readings.push(crate::testutil::reading("m-1", ts, value));
        }
        let profile = solar_meter();
        let events = detect(
            DetectionInput {
                profile: &profile,
                readings: &readings,
                records: &[],
                window_start: start,
                window_end: start + Duration::hours(24),
            },
            &quarter,
            &DetectionConfig {
                degradation_ratio: Decimal::ZERO,
                ..DetectionConfig::default()
            },
        );
        assert!(events.is_empty(), "{events:?}");
    }

    #[test]
    fn instructed_reduction_is_curtailment() {
        let rec = record(
            "rec-1",
            RecordKind::BuyerCurtailment,
            datetime!(2024-06-03 12:00:00 UTC),
            datetime!(2024-06-03 14:00:00 UTC),
        );
        let events = run_detect(&day(&[(12, 20), (13, 0)]), &[rec]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].classification, EventClass::Curtailment);
        assert_eq!(events[0].severity, Severity::Low);
    }

    #[test]
    fn sustained_low_output_is_degradation() {
        let events = run_detect(&day(&[(8, 40), (9, 45), (10, 40)]), &[]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].classification, EventClass::Degradation);
        assert_eq!(events[0].severity, Severity::High);
    }

    #[test]
    fn single_missing_slot_does_not_split_an_outage() {
        let start = datetime!(2024-06-03 00:00:00 UTC);
        let mut readings = hourly_readings("m-1", start, &day(&[(9, 0), (10, 0), (11, 0), (12, 0)]));
        readings.retain(|r| r.ts != datetime!(2024-06-03 10:00:00 UTC));
        let profile = solar_meter();
        let events = detect(
            DetectionInput {
                profile: &profile,
                readings: &readings,
                records: &[],
                window_start: start,
                window_end: start + Duration::hours(24),
            },
            &hourly(),
            &DetectionConfig::default(),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].end, Some(datetime!(2024-06-03 13:00:00 UTC)));
    }

    #[test]
    fn condition_running_into_end_of_data_stays_open() {
        let values: Vec<i64> = day(&[])[..16].iter().copied().chain([0, 0]).collect();
        let events = run_detect(&values, &[]);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_open());
    }

    #[test]
    fn mixed_conditions_produce_disjoint_events() {
        let rec = record(
            "rec-1",
            RecordKind::GridCurtailment,
            datetime!(2024-06-03 14:00:00 UTC),
            datetime!(2024-06-03 16:00:00 UTC),
        );
        let events = run_detect(&day(&[(8, 0), (9, 0), (10, 30), (11, 30), (14, 10), (15, 10)]), &[rec]);
        let classes: Vec<_> = events.iter().map(|e| e.classification).collect();
        assert_eq!(classes, vec![EventClass::Outage, EventClass::Degradation, EventClass::Curtailment]);
        for pair in events.windows(2) {
            assert!(pair[0].end.unwrap() <= pair[1].start);
        }
    }

    #[test]
    fn open_event_blocks_or_is_time_boxed_by_policy() {
        let period = BillingPeriod::new(datetime!(2024-06-03 00:00:00 UTC), datetime!(2024-06-04 00:00:00 UTC)).unwrap();
        let open = Event {
            id: "e-1".to_string(),
            meter_id: "m-1".to_string(),
            classification: EventClass::Outage,
            start: datetime!(2024-06-03 20:00:00 UTC),
            end: None,
            severity: Severity::Medium,
            source: EventSource::Detector,
            time_boxed: false,
        };
        let blocked = events_for_period(vec![open.clone()], &period, OpenEventPolicy::Block, "c-1");
        assert!(matches!(blocked, Err(EngineError::DataUnavailable { .. })));

        let boxed = events_for_period(vec![open], &period, OpenEventPolicy::TimeBox, "c-1").unwrap();
        assert_eq!(boxed[0].end, Some(period.end));
        assert!(boxed[0].time_boxed);
    }

    #[test]
    fn events_outside_period_are_dropped() {
        let period = BillingPeriod::new(datetime!(2024-06-03 00:00:00 UTC), datetime!(2024-06-04 00:00:00 UTC)).unwrap();
        let later = Event {
            id: "e-2".to_string(),
            meter_id: "m-1".to_string(),
            classification: EventClass::Outage,
            start: datetime!(2024-06-04 01:00:00 UTC),
            end: None,
            severity: Severity::Medium,
            source: EventSource::Detector,
            time_boxed: false,
        };
        assert!(events_for_period(vec![later], &period, OpenEventPolicy::Block, "c-1").unwrap().is_empty());
    }
}
