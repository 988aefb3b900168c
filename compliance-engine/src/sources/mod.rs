pub mod external_records_ndjson;
pub mod market_prices_csv;
pub mod meter_readings_csv;

pub use external_records_ndjson::ExternalRecordNdjsonSource;
pub use market_prices_csv::MarketPriceCsvSource;
pub use meter_readings_csv::MeterReadingCsvSource;
