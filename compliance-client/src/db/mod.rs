pub mod meter_reading_queries;
pub mod reference_data_queries;

pub use meter_reading_queries::load_readings;
pub use reference_data_queries::{load_external_records, load_market_prices};
