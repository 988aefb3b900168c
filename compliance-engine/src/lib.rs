pub mod aggregate;
pub mod batch;
pub mod cli;
pub mod config;
pub mod contract;
pub mod defaults;
pub mod detect;
pub mod engine;
pub mod error;
pub mod excusal;
pub mod fixtures;
pub mod formulas;
pub mod invoice;
pub mod metrics_server;
pub mod model;
pub mod money;
pub mod observability;
pub mod pipeline;
pub mod rules;
pub mod sinks;
pub mod sources;
pub mod store;
pub mod transform;

#[cfg(test)]
mod testutil;

pub use engine::{ComplianceEngine, EvaluationOutcome};
pub use error::{EngineError, EngineResult};
pub use pipeline::{Envelope, Pipeline};
