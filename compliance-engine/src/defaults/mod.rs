//! Default-event lifecycle.
//!
//! ```text
//!   breach ──► Open ──cure──► Cured  (terminal)
//!                 └──waive─► Waived (terminal)
//! ```
//!
//! Status is the only mutable part of a DefaultEvent. Persisted transitions
//! are compare-and-set on the previous status, so two racing cures cannot
//! both win.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{
    contract::GuaranteeClause,
    error::EngineError,
    model::BillingPeriod,
    money,
    rules::RuleResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultStatus {
    Open,
    Cured,
    Waived,
}

impl DefaultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Cured => "cured",
            Self::Waived => "waived",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cured | Self::Waived)
    }
}

impl fmt::Display for DefaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultAction {
    Cure { at: OffsetDateTime },
    Waive { justification: String },
}

impl DefaultAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cure { .. } => "cured",
            Self::Waive { .. } => "waived",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("default event {id} is {from} and cannot be {action}")]
    Terminal {
        id: String,
        from: DefaultStatus,
        action: &'static str,
    },

    #[error("cure time {at} is before the end of period ending {period_end}")]
    CureBeforePeriodEnd {
        at: OffsetDateTime,
        period_end: OffsetDateTime,
    },

    #[error("a waiver needs a non-empty justification")]
    MissingJustification,
}

impl From<TransitionError> for EngineError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Terminal { id, from, action } => EngineError::InvalidTransition {
                id,
                from: from.to_string(),
                action,
            },
            other => EngineError::InvalidRequest(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultEvent {
    /// Idempotency key of (contract, clause, period).
    pub id: String,
    pub contract_id: String,
    pub clause_id: String,
    pub period: BillingPeriod,
    pub rule_result_ids: Vec<String>,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub cure_deadline: OffsetDateTime,
    pub status: DefaultStatus,
    pub accrued_penalty: Decimal,
    pub penalty_cap: Option<Decimal>,
    pub final_penalty: Option<Decimal>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cured_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub cured_after_deadline: bool,
    #[serde(default)]
    pub waiver_justification: Option<String>,
}

impl DefaultEvent {
    /// Opens a default for a breaching result; `None` when there is no breach.
    pub fn from_breach(result: &RuleResult, clause: &GuaranteeClause) -> Option<Self> {
        if !result.breach {
            return None;
        }
        Some(Self {
            id: result.id.clone(),
            contract_id: result.contract_id.clone(),
            clause_id: result.clause_id.clone(),
            period: result.period,
            rule_result_ids: vec![result.id.clone()],
            description: format!(
                "{} guarantee {} breached in {}: {}% against {}%",
                result.guarantee_type.as_str(),
                result.clause_id,
                result.period,
                money::canonical(result.computed_value.round_dp(4)),
                money::canonical(result.threshold),
            ),
            cure_deadline: result.period.end + Duration::days(i64::from(clause.cure_period_days)),
            status: DefaultStatus::Open,
            accrued_penalty: result.penalty_amount,
            penalty_cap: clause.penalty_cap,
            final_penalty: None,
            cured_at: None,
            cured_after_deadline: false,
            waiver_justification: None,
        })
    }

    pub fn apply(&mut self, action: DefaultAction) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id.clone(),
                from: self.status,
                action: action.name(),
            });
        }
        match action {
            DefaultAction::Cure { at } => {
                if at < self.period.end {
                    return Err(TransitionError::CureBeforePeriodEnd {
                        at,
                        period_end: self.period.end,
                    });
                }
                let (capped, _) = money::apply_cap(self.accrued_penalty, self.penalty_cap);
                self.final_penalty = Some(money::round_money(capped));
                self.cured_at = Some(at);
                self.cured_after_deadline = at > self.cure_deadline;
                self.status = DefaultStatus::Cured;
            }
            DefaultAction::Waive { justification } => {
                let justification = justification.trim();
                if justification.is_empty() {
                    return Err(TransitionError::MissingJustification);
                }
                self.waiver_justification = Some(justification.to_string());
                self.status = DefaultStatus::Waived;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{GuaranteeTerms, GuaranteeType};
    use crate::rules::CalculationTrace;
    use crate::testutil::dec;
    use std::collections::BTreeSet;
    use time::macros::datetime;

    fn june() -> BillingPeriod {
        BillingPeriod::new(datetime!(2024-06-01 00:00:00 UTC), datetime!(2024-07-01 00:00:00 UTC)).unwrap()
    }

    fn clause() -> GuaranteeClause {
        GuaranteeClause {
            contract_id: "c-1".to_string(),
            clause_id: "AV-1".to_string(),
            version: 1,
            guarantee_type: GuaranteeType::Availability,
            threshold_pct: dec("95"),
            window_start: datetime!(2024-01-01 00:00:00 UTC),
            window_end: datetime!(2025-01-01 00:00:00 UTC),
            meter_id: "plant-1".to_string(),
            penalty_cap: Some(dec("150000")),
            excusable_kinds: BTreeSet::new(),
            cure_period_days: 30,
            terms: GuaranteeTerms::Availability {
                penalty_rate: dec("50000"),
            },
        }
    }

    fn result(breach: bool) -> RuleResult {
        RuleResult {
            id: "key-1".to_string(),
            contract_id: "c-1".to_string(),
            clause_id: "AV-1".to_string(),
            clause_version: 1,
            guarantee_type: GuaranteeType::Availability,
            period: june(),
            breach,
            computed_value: dec("91.5"),
            threshold: dec("95"),
            shortfall: dec("3.5"),
            penalty_amount: dec("175000.00"),
            penalty_capped: false,
            excused: false,
            trace: CalculationTrace::new("availability"),
            digest: String::new(),
        }
    }

    fn open() -> DefaultEvent {
        DefaultEvent::from_breach(&result(true), &clause()).unwrap()
    }

    #[test]
    fn only_breaches_open_defaults() {
        assert!(DefaultEvent::from_breach(&result(false), &clause()).is_none());
        let d = open();
        assert_eq!(d.status, DefaultStatus::Open);
        assert_eq!(d.rule_result_ids, vec!["key-1".to_string()]);
        assert_eq!(d.cure_deadline, datetime!(2024-07-31 00:00:00 UTC));
    }

    #[test]
    fn cure_finalizes_capped_penalty() {
        let mut d = open();
        d.apply(DefaultAction::Cure {
            at: datetime!(2024-07-15 00:00:00 UTC),
        })
        .unwrap();
        assert_eq!(d.status, DefaultStatus::Cured);
        assert_eq!(d.final_penalty, Some(dec("150000.00")));
        assert!(!d.cured_after_deadline);
    }

    #[test]
    fn late_cure_is_flagged() {
        let mut d = open();
        d.apply(DefaultAction::Cure {
            at: datetime!(2024-08-02 00:00:00 UTC),
        })
        .unwrap();
        assert!(d.cured_after_deadline);
    }

    #[test]
    fn cure_inside_the_period_is_refused() {
        let mut d = open();
        let err = d
            .apply(DefaultAction::Cure {
                at: datetime!(2024-06-20 00:00:00 UTC),
            })
            .unwrap_err();
        assert!(matches!(err, TransitionError::CureBeforePeriodEnd { .. }));
        assert_eq!(d.status, DefaultStatus::Open);
    }

    #[test]
    fn waive_keeps_penalties_and_needs_justification() {
        let mut d = open();
        assert_eq!(
            d.apply(DefaultAction::Waive {
                justification: "   ".to_string()
            }),
            Err(TransitionError::MissingJustification)
        );
        d.apply(DefaultAction::Waive {
            justification: "buyer agreed in settlement".to_string(),
        })
        .unwrap();
        assert_eq!(d.status, DefaultStatus::Waived);
        assert_eq!(d.final_penalty, None);
        assert_eq!(d.accrued_penalty, dec("175000.00"));
    }

    #[test]
    fn terminal_states_refuse_further_actions() {
        let mut d = open();
        d.apply(DefaultAction::Waive {
            justification: "settled".to_string(),
        })
        .unwrap();
        let err = d
            .apply(DefaultAction::Cure {
                at: datetime!(2024-07-15 00:00:00 UTC),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Terminal {
                from: DefaultStatus::Waived,
                action: "cured",
                ..
            }
        ));
        assert!(matches!(EngineError::from(err), EngineError::InvalidTransition { .. }));
    }
}
