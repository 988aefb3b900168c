use std::{collections::BTreeMap, fs, time::Duration};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Weekday};

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_connections() -> u32 {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

/// Hours of the day, UTC, as `[start_hour, end_hour)`. Equal bounds mean the
/// whole day; `start_hour > end_hour` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct HourWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl HourWindow {
    pub const ALL_DAY: HourWindow = HourWindow {
        start_hour: 0,
        end_hour: 0,
    };

    fn all_day() -> Self {
        Self::ALL_DAY
    }

    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        let h = ts.hour();
        match self.start_hour.cmp(&self.end_hour) {
            std::cmp::Ordering::Equal => true,
            std::cmp::Ordering::Less => self.start_hour <= h && h < self.end_hour,
            std::cmp::Ordering::Greater => h >= self.start_hour || h < self.end_hour,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeakWindow {
    #[serde(flatten)]
    pub hours: HourWindow,
    #[serde(default)]
    pub weekdays_only: bool,
}

impl PeakWindow {
    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        if self.weekdays_only && matches!(ts.weekday(), Weekday::Saturday | Weekday::Sunday) {
            return false;
        }
        self.hours.contains(ts)
    }
}

impl Default for PeakWindow {
    fn default() -> Self {
        Self {
            hours: HourWindow {
                start_hour: 7,
                end_hour: 22,
            },
            weekdays_only: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterKind {
    /// Revenue or plant-output meter; "operating" means output above threshold.
    Generation,
    /// Pyranometer; "operating" means the sensor reported.
    Irradiance,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MeterProfile {
    pub meter_id: String,
    pub kind: MeterKind,
    #[serde(default)]
    pub operating_threshold: Decimal,
    /// Typical output per interval while operating; enables degradation detection.
    #[serde(default)]
    pub expected_interval_kwh: Option<Decimal>,
    /// Hours in which the plant is expected to produce (daylight for solar).
    #[serde(default = "HourWindow::all_day")]
    pub operating_window: HourWindow,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub interval_minutes: u32,
    /// Largest tolerated share of missing intervals, in percent.
    pub coverage_tolerance_pct: Decimal,
    pub peak_window: PeakWindow,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            coverage_tolerance_pct: Decimal::from(2),
            peak_window: PeakWindow::default(),
        }
    }
}

impl AggregationConfig {
    pub fn interval(&self) -> time::Duration {
        time::Duration::minutes(i64::from(self.interval_minutes.max(1)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenEventPolicy {
    /// An event still open at period end blocks evaluation of that period.
    Block,
    /// Open events are closed at period end and flagged as time-boxed.
    TimeBox,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub min_duration_minutes: u32,
    pub near_zero_kwh: Decimal,
    pub degradation_ratio: Decimal,
    pub max_gap_intervals: u32,
    pub lookahead_minutes: u32,
    pub open_event_policy: OpenEventPolicy,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_duration_minutes: 60,
            near_zero_kwh: Decimal::ZERO,
            degradation_ratio: Decimal::new(8, 1),
            max_gap_intervals: 1,
            lookahead_minutes: 120,
            open_event_policy: OpenEventPolicy::Block,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Penalty amounts at or above this are material.
    pub materiality_threshold: Decimal,
    /// Absolute per-line variance tolerated without a finding.
    pub line_tolerance: Decimal,
    /// Minimum token similarity (0..1) for description fallback matching.
    pub similarity_threshold: Decimal,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            materiality_threshold: Decimal::from(1000),
            line_tolerance: Decimal::ONE,
            similarity_threshold: Decimal::new(5, 1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub read_timeout_ms: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self { read_timeout_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub workers: usize,
    pub contracts: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            contracts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub meters: Vec<MeterProfile>,
    pub metrics: Option<MetricsConfig>,
}

/// The subset of configuration the engine itself consumes.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub aggregation: AggregationConfig,
    pub detection: DetectionConfig,
    pub reconciliation: ReconciliationConfig,
    pub meters: BTreeMap<String, MeterProfile>,
    pub read_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            aggregation: AggregationConfig::default(),
            detection: DetectionConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            meters: BTreeMap::new(),
            read_timeout: Duration::from_millis(EvaluationConfig::default().read_timeout_ms),
        }
    }
}

impl EngineSettings {
    pub fn with_meter(mut self, profile: MeterProfile) -> Self {
        self.meters.insert(profile.meter_id.clone(), profile);
        self
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("COMPLIANCE_CONFIG").unwrap_or_else(|_| "compliance-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config {path}: {e}"))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        if cfg.aggregation.interval_minutes == 0 {
            anyhow::bail!("aggregation.interval_minutes must be positive");
        }
        let mut seen = std::collections::BTreeSet::new();
        for m in &cfg.meters {
            if !seen.insert(m.meter_id.as_str()) {
                anyhow::bail!("meter '{}' is configured twice", m.meter_id);
            }
        }
        Ok(cfg)
    }

    pub fn database(&self) -> anyhow::Result<&DatabaseConfig> {
        self.database
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("missing [database] section in configuration"))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            aggregation: self.aggregation.clone(),
            detection: self.detection.clone(),
            reconciliation: self.reconciliation.clone(),
            meters: self
                .meters
                .iter()
                .map(|m| (m.meter_id.clone(), m.clone()))
                .collect(),
            read_timeout: Duration::from_millis(self.evaluation.read_timeout_ms),
        }
    }
}
