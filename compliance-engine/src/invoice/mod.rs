//! Expected invoices and reconciliation against received ones.

mod expected;
mod reconcile;

pub use expected::build_expected_invoice;
pub use reconcile::{reconcile, similarity};

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::BillingPeriod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineType {
    Energy,
    LiquidatedDamages,
    ShortfallPayment,
    Adjustment,
    Other,
}

impl LineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Energy => "energy",
            Self::LiquidatedDamages => "liquidated_damages",
            Self::ShortfallPayment => "shortfall_payment",
            Self::Adjustment => "adjustment",
            Self::Other => "other",
        }
    }

    pub fn is_penalty(&self) -> bool {
        matches!(self, Self::LiquidatedDamages | Self::ShortfallPayment)
    }
}

impl fmt::Display for LineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub line_type: LineType,
    pub description: String,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub unit_price: Option<Decimal>,
    /// Signed; penalties and credits are negative.
    pub amount: Decimal,
    #[serde(default)]
    pub clause_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedInvoice {
    pub id: String,
    pub contract_id: String,
    pub period: BillingPeriod,
    pub currency: String,
    pub lines: Vec<InvoiceLine>,
    pub total: Decimal,
}

/// Invoice as issued by the counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedInvoice {
    pub id: String,
    pub contract_id: String,
    pub period: BillingPeriod,
    pub currency: String,
    #[serde(default)]
    pub invoice_number: Option<String>,
    pub lines: Vec<InvoiceLine>,
    /// Total printed on the invoice header.
    pub stated_total: Decimal,
}

impl ReceivedInvoice {
    pub fn line_total(&self) -> Decimal {
        self.lines.iter().map(|l| l.amount).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchBasis {
    Clause,
    LineType,
    Description,
}

/// One row of the comparison. Unmatched lines have one side empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineVariance {
    pub line_type: LineType,
    pub description: String,
    pub expected_index: Option<usize>,
    pub received_index: Option<usize>,
    pub expected_amount: Option<Decimal>,
    pub received_amount: Option<Decimal>,
    /// received − expected, a missing side counting as zero.
    pub variance: Decimal,
    pub basis: Option<MatchBasis>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    UnmatchedExpectedLine,
    UnmatchedReceivedLine,
    AmbiguousMatch,
    MissingMaterialPenalty,
    LineVarianceExceedsTolerance,
    CurrencyMismatch,
    HeaderTotalMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub kind: FindingKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceComparison {
    pub id: String,
    pub expected_invoice_id: String,
    pub received_invoice_id: String,
    pub contract_id: String,
    pub period: BillingPeriod,
    pub expected_total: Decimal,
    pub received_total: Decimal,
    pub header_variance: Decimal,
    pub lines: Vec<LineVariance>,
    pub unmatched_expected: Vec<usize>,
    pub unmatched_received: Vec<usize>,
    pub findings: Vec<ReviewFinding>,
    pub review_required: bool,
}

impl InvoiceComparison {
    pub fn has_finding(&self, kind: FindingKind) -> bool {
        self.findings.iter().any(|f| f.kind == kind)
    }
}
