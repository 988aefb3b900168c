use compliance_client::domain::{ExternalRecord, MarketPrice, MeterReading, ReadingUnit};
use time::{macros::datetime, OffsetDateTime};

use crate::pipeline::{Envelope, PipelineError, Transform};

const MIN_TS: OffsetDateTime = datetime!(2000-01-01 00:00:00 UTC);
const MAX_TS: OffsetDateTime = datetime!(2100-01-01 00:00:00 UTC);

fn reject<T>(env: &Envelope<T>, reason: &str) -> PipelineError {
    PipelineError::Rejected {
        origin: env.origin.clone(),
        reason: reason.to_string(),
    }
}

fn in_range(ts: OffsetDateTime) -> bool {
    MIN_TS <= ts && ts <= MAX_TS
}

/// Pure validation of a `MeterReading`.
///
/// Rules:
/// - meter_id must be non-empty.
/// - energy and insolation must be non-negative (demand may be negative on export).
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01].
pub fn validate_reading(env: Envelope<MeterReading>) -> Result<Envelope<MeterReading>, PipelineError> {
    let r = &env.payload;
    if r.meter_id.is_empty() {
        return Err(reject(&env, "meter_id must be non-empty"));
    }
    if matches!(r.unit, ReadingUnit::Kwh | ReadingUnit::KwhPerM2) && r.value.is_sign_negative() && !r.value.is_zero() {
        return Err(reject(&env, "interval energy must be non-negative"));
    }
    if !in_range(r.ts) {
        return Err(reject(&env, "timestamp out of allowed range"));
    }
    Ok(env)
}

/// Pure validation of an `ExternalRecord`: non-empty id, `start < end`, sane timestamps.
pub fn validate_external_record(env: Envelope<ExternalRecord>) -> Result<Envelope<ExternalRecord>, PipelineError> {
    let r = &env.payload;
    if r.id.trim().is_empty() {
        return Err(reject(&env, "record id must be non-empty"));
    }
    if r.start >= r.end {
        return Err(reject(&env, "record start must be before end"));
    }
    if !in_range(r.start) || !in_range(r.end) {
        return Err(reject(&env, "timestamp out of allowed range"));
    }
    Ok(env)
}

pub fn validate_market_price(env: Envelope<MarketPrice>) -> Result<Envelope<MarketPrice>, PipelineError> {
    if env.payload.market.trim().is_empty() {
        return Err(reject(&env, "market must be non-empty"));
    }
    if !in_range(env.payload.ts) {
        return Err(reject(&env, "timestamp out of allowed range"));
    }
    Ok(env)
}

#[derive(Clone, Default)]
pub struct ReadingValidation;

#[async_trait::async_trait]
impl Transform<MeterReading, MeterReading> for ReadingValidation {
    async fn apply(&self, input: Envelope<MeterReading>) -> Result<Envelope<MeterReading>, PipelineError> {
        match validate_reading(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_meter_readings_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct ExternalRecordValidation;

#[async_trait::async_trait]
impl Transform<ExternalRecord, ExternalRecord> for ExternalRecordValidation {
    async fn apply(&self, input: Envelope<ExternalRecord>) -> Result<Envelope<ExternalRecord>, PipelineError> {
        match validate_external_record(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_external_records_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MarketPriceValidation;

#[async_trait::async_trait]
impl Transform<MarketPrice, MarketPrice> for MarketPriceValidation {
    async fn apply(&self, input: Envelope<MarketPrice>) -> Result<Envelope<MarketPrice>, PipelineError> {
        match validate_market_price(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_market_prices_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}
