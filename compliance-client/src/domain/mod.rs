pub mod external_record;
pub mod market_price;
pub mod meter_reading;

pub use external_record::{ExternalRecord, RecordKind};
pub use market_price::MarketPrice;
pub use meter_reading::{MeterReading, ReadingUnit};

/// Raised when a collaborator hands us a code we do not recognise.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("unknown reading unit '{0}'")]
    UnknownUnit(String),
    #[error("unknown external record kind '{0}'")]
    UnknownRecordKind(String),
}
