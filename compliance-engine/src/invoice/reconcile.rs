use std::collections::BTreeSet;

use rust_decimal::Decimal;

use super::{
    ExpectedInvoice, FindingKind, InvoiceComparison, InvoiceLine, LineVariance, MatchBasis, ReceivedInvoice,
    ReviewFinding,
};
use crate::{config::ReconciliationConfig, model::IdHasher};

fn tokens(s: &str) -> BTreeSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Token Jaccard similarity of two descriptions, 0..=1.
pub fn similarity(a: &str, b: &str) -> Decimal {
    let (a, b) = (tokens(a), tokens(b));
    let union = a.union(&b).count();
    if union == 0 {
        return Decimal::ZERO;
    }
    Decimal::from(a.intersection(&b).count()) / Decimal::from(union)
}

struct Matcher<'a> {
    expected: &'a [InvoiceLine],
    received: &'a [InvoiceLine],
    pairs: Vec<(usize, usize, MatchBasis)>,
    taken_expected: BTreeSet<usize>,
    taken_received: BTreeSet<usize>,
    ambiguous_expected: BTreeSet<usize>,
    findings: Vec<ReviewFinding>,
    threshold: Decimal,
}

impl<'a> Matcher<'a> {
    fn pair(&mut self, e: usize, r: usize, basis: MatchBasis) {
        self.taken_expected.insert(e);
        self.taken_received.insert(r);
        self.pairs.push((e, r, basis));
    }

    fn open_received(&self, pred: impl Fn(&InvoiceLine) -> bool) -> Vec<usize> {
        (0..self.received.len())
            .filter(|i| !self.taken_received.contains(i) && pred(&self.received[*i]))
            .collect()
    }

    /// Unique best candidate by description, at or above the threshold.
    fn best_by_description(&self, e: usize, candidates: &[usize]) -> Result<Option<usize>, Vec<usize>> {
        let desc = &self.expected[e].description;
        let mut scored: Vec<(Decimal, usize)> = candidates
            .iter()
            .map(|r| (similarity(desc, &self.received[*r].description), *r))
            .filter(|(score, _)| *score >= self.threshold)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        match scored.as_slice() {
            [] => Ok(None),
            [(_, only)] => Ok(Some(*only)),
            [(top, first), (second, _), ..] if top > second => Ok(Some(*first)),
            [(top, _), ..] => Err(scored.iter().filter(|(s, _)| s == top).map(|(_, r)| *r).collect()),
        }
    }

    fn ambiguous(&mut self, e: usize, candidates: &[usize]) {
        if !self.ambiguous_expected.insert(e) {
            return;
        }
        let line = &self.expected[e];
        self.findings.push(ReviewFinding {
            kind: FindingKind::AmbiguousMatch,
            message: format!(
                "expected {} line '{}' matches received lines {:?} equally well",
                line.line_type, line.description, candidates
            ),
        });
    }

    /// Same type and same clause reference.
    fn by_clause(&mut self) {
        for e in 0..self.expected.len() {
            let line = &self.expected[e];
            let Some(clause) = line.clause_id.as_deref() else { continue };
            let candidates =
                self.open_received(|r| r.line_type == line.line_type && r.clause_id.as_deref() == Some(clause));
            match candidates.as_slice() {
                [] => {}
                [only] => self.pair(e, *only, MatchBasis::Clause),
                many => match self.best_by_description(e, many) {
                    Ok(Some(r)) => self.pair(e, r, MatchBasis::Clause),
                    Ok(None) => self.ambiguous(e, many),
                    Err(tied) => self.ambiguous(e, &tied),
                },
            }
        }
    }

    /// Same type, when that type leaves exactly one line on each side, or
    /// description similarity singles one out.
    fn by_type(&mut self) {
        for e in 0..self.expected.len() {
            if self.taken_expected.contains(&e) {
                continue;
            }
            let line_type = self.expected[e].line_type;
            let candidates = self.open_received(|r| r.line_type == line_type);
            if candidates.is_empty() {
                continue;
            }
            let rivals = (0..self.expected.len())
                .filter(|i| !self.taken_expected.contains(i) && self.expected[*i].line_type == line_type)
                .count();
            if rivals == 1 && candidates.len() == 1 {
                self.pair(e, candidates[0], MatchBasis::LineType);
                continue;
            }
            match self.best_by_description(e, &candidates) {
                Ok(Some(r)) => self.pair(e, r, MatchBasis::Description),
                Ok(None) => self.ambiguous(e, &candidates),
                Err(tied) => self.ambiguous(e, &tied),
            }
        }
    }

    /// Cross-type fallback on description alone.
    fn by_description(&mut self) {
        for e in 0..self.expected.len() {
            if self.taken_expected.contains(&e) || self.ambiguous_expected.contains(&e) {
                continue;
            }
            let candidates = self.open_received(|_| true);
            match self.best_by_description(e, &candidates) {
                Ok(Some(r)) => self.pair(e, r, MatchBasis::Description),
                Ok(None) => {}
                Err(tied) => self.ambiguous(e, &tied),
            }
        }
    }
}

pub fn reconcile(
    expected: &ExpectedInvoice,
    received: &ReceivedInvoice,
    policy: &ReconciliationConfig,
) -> InvoiceComparison {
    let mut m = Matcher {
        expected: &expected.lines,
        received: &received.lines,
        pairs: Vec::new(),
        taken_expected: BTreeSet::new(),
        taken_received: BTreeSet::new(),
        ambiguous_expected: BTreeSet::new(),
        findings: Vec::new(),
        threshold: policy.similarity_threshold,
    };
    m.by_clause();
    m.by_type();
    m.by_description();

    let mut findings = std::mem::take(&mut m.findings);
    let mut lines = Vec::new();
    let mut unmatched_expected = Vec::new();

    let material = |line: &InvoiceLine| line.line_type.is_penalty() && line.amount.abs() >= policy.materiality_threshold;

    for (i, e) in expected.lines.iter().enumerate() {
        match m.pairs.iter().find(|(ei, _, _)| *ei == i) {
            Some(&(_, ri, basis)) => {
                let r = &received.lines[ri];
                let variance = r.amount - e.amount;
                if variance.abs() > policy.line_tolerance {
                    findings.push(ReviewFinding {
                        kind: FindingKind::LineVarianceExceedsTolerance,
                        message: format!("{} line '{}' differs by {}", e.line_type, e.description, variance),
                    });
                }
                if material(e) && r.amount.is_zero() {
                    findings.push(ReviewFinding {
                        kind: FindingKind::MissingMaterialPenalty,
                        message: format!("penalty '{}' of {} billed as zero", e.description, e.amount),
                    });
                }
                lines.push(LineVariance {
                    line_type: e.line_type,
                    description: e.description.clone(),
                    expected_index: Some(i),
                    received_index: Some(ri),
                    expected_amount: Some(e.amount),
                    received_amount: Some(r.amount),
                    variance,
                    basis: Some(basis),
                });
            }
            None => {
                unmatched_expected.push(i);
                findings.push(ReviewFinding {
                    kind: FindingKind::UnmatchedExpectedLine,
                    message: format!("expected {} line '{}' ({}) not on received invoice", e.line_type, e.description, e.amount),
                });
                if material(e) {
                    findings.push(ReviewFinding {
                        kind: FindingKind::MissingMaterialPenalty,
                        message: format!("material penalty '{}' of {} is absent", e.description, e.amount),
                    });
                }
                lines.push(LineVariance {
                    line_type: e.line_type,
                    description: e.description.clone(),
                    expected_index: Some(i),
                    received_index: None,
                    expected_amount: Some(e.amount),
                    received_amount: None,
                    variance: -e.amount,
                    basis: None,
                });
            }
        }
    }

    let unmatched_received: Vec<usize> = (0..received.lines.len())
        .filter(|i| !m.taken_received.contains(i))
        .collect();
    for &i in &unmatched_received {
        let r = &received.lines[i];
        findings.push(ReviewFinding {
            kind: FindingKind::UnmatchedReceivedLine,
            message: format!("received {} line '{}' ({}) has no expected counterpart", r.line_type, r.description, r.amount),
        });
        lines.push(LineVariance {
            line_type: r.line_type,
            description: r.description.clone(),
            expected_index: None,
            received_index: Some(i),
            expected_amount: None,
            received_amount: Some(r.amount),
            variance: r.amount,
            basis: None,
        });
    }

    if !expected.currency.eq_ignore_ascii_case(received.currency.trim()) {
        findings.push(ReviewFinding {
            kind: FindingKind::CurrencyMismatch,
            message: format!("expected {}, received {}", expected.currency, received.currency),
        });
    }
    let line_total = received.line_total();
    if line_total != received.stated_total {
        findings.push(ReviewFinding {
            kind: FindingKind::HeaderTotalMismatch,
            message: format!("stated total {} but lines sum to {}", received.stated_total, line_total),
        });
    }

    let review_required = !findings.is_empty();
    if review_required {
        metrics::counter!("reconciliations_review_required_total").increment(1);
    }

    InvoiceComparison {
        id: IdHasher::new("invoice_comparison")
            .str(&expected.id)
            .str(&received.id)
            .finish(),
        expected_invoice_id: expected.id.clone(),
        received_invoice_id: received.id.clone(),
        contract_id: expected.contract_id.clone(),
        period: expected.period,
        expected_total: expected.total,
        received_total: received.stated_total,
        header_variance: received.stated_total - expected.total,
        lines,
        unmatched_expected,
        unmatched_received,
        findings,
        review_required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{fixtures::tariff_doc, GuaranteeType, Tariff};
    use crate::formulas::FormulaRegistry;
    use crate::invoice::{build_expected_invoice, LineType};
    use crate::model::BillingPeriod;
    use crate::testutil::{breach_result, dec};
    use time::macros::datetime;

    fn june() -> BillingPeriod {
        BillingPeriod::new(datetime!(2024-06-01 00:00:00 UTC), datetime!(2024-07-01 00:00:00 UTC)).unwrap()
    }

    fn expected() -> ExpectedInvoice {
        let tariff = Tariff::from_doc(&tariff_doc(), &FormulaRegistry::with_builtin()).unwrap();
        let ld = breach_result("AV-1", GuaranteeType::Availability, june(), dec("175000.00"));
        build_expected_invoice("c-1", &june(), &tariff, dec("4850000"), &[ld]).unwrap()
    }

    fn line(line_type: LineType, description: &str, amount: &str) -> InvoiceLine {
        InvoiceLine {
            line_type,
            description: description.to_string(),
            quantity: None,
            unit_price: None,
            amount: dec(amount),
            clause_id: None,
        }
    }

    fn received(lines: Vec<InvoiceLine>, stated_total: &str) -> ReceivedInvoice {
        ReceivedInvoice {
            id: "inv-2024-06".to_string(),
            contract_id: "c-1".to_string(),
            period: june(),
            currency: "usd".to_string(),
            invoice_number: Some("INV-0042".to_string()),
            lines,
            stated_total: dec(stated_total),
        }
    }

    #[test]
    fn expected_invoice_nets_energy_and_liquidated_damages() {
        let inv = expected();
        assert_eq!(inv.lines.len(), 2);
        assert_eq!(inv.lines[0].amount, dec("218250.00"));
        assert_eq!(inv.lines[1].line_type, LineType::LiquidatedDamages);
        assert_eq!(inv.lines[1].amount, dec("-175000.00"));
        assert_eq!(inv.total, dec("43250.00"));
        assert_eq!(inv.currency, "USD");
    }

    #[test]
    fn matching_invoice_needs_no_review() {
        let rec = received(
            vec![
                line(LineType::Energy, "Energy June 2024", "218250.00"),
                line(LineType::LiquidatedDamages, "LD availability shortfall", "-175000.00"),
            ],
            "43250.00",
        );
        let cmp = reconcile(&expected(), &rec, &ReconciliationConfig::default());
        assert!(!cmp.review_required, "{:?}", cmp.findings);
        assert_eq!(cmp.header_variance, Decimal::ZERO);
        assert!(cmp.lines.iter().all(|l| l.variance.is_zero()));
    }

    #[test]
    fn omitted_liquidated_damages_are_flagged() {
        let rec = received(vec![line(LineType::Energy, "Energy June 2024", "218250.00")], "218250.00");
        let cmp = reconcile(&expected(), &rec, &ReconciliationConfig::default());
        assert!(cmp.review_required);
        assert!(cmp.has_finding(FindingKind::MissingMaterialPenalty));
        assert_eq!(cmp.unmatched_expected, vec![1]);
        assert_eq!(cmp.header_variance, dec("175000.00"));
    }

    #[test]
    fn offsetting_lines_are_flagged_despite_matching_total() {
        // Penalty netted into the energy line: header agrees, lines do not.
        let rec = received(vec![line(LineType::Energy, "Energy June 2024", "43250.00")], "43250.00");
        let cmp = reconcile(&expected(), &rec, &ReconciliationConfig::default());
        assert_eq!(cmp.header_variance, Decimal::ZERO);
        assert!(cmp.review_required);
        assert!(cmp.has_finding(FindingKind::LineVarianceExceedsTolerance));
        assert!(cmp.has_finding(FindingKind::MissingMaterialPenalty));
    }

    #[test]
    fn description_fallback_matches_mistyped_line() {
        let rec = received(
            vec![
                line(LineType::Energy, "Energy June 2024", "218250.00"),
                line(LineType::Other, "Liquidated damages availability clause AV-1", "-175000.00"),
            ],
            "43250.00",
        );
        let cmp = reconcile(&expected(), &rec, &ReconciliationConfig::default());
        let ld = &cmp.lines[1];
        assert_eq!(ld.basis, Some(MatchBasis::Description));
        assert!(ld.variance.is_zero());
        assert!(!cmp.review_required, "{:?}", cmp.findings);
    }

    #[test]
    fn equally_similar_candidates_are_ambiguous() {
        let mut exp = expected();
        exp.lines.push(line(LineType::Adjustment, "meter fee", "-10"));
        exp.total -= dec("10");
        let rec = received(
            vec![
                line(LineType::Energy, "Energy June 2024", "218250.00"),
                line(LineType::LiquidatedDamages, "LD", "-175000.00"),
                line(LineType::Adjustment, "meter fee north", "-10"),
                line(LineType::Adjustment, "meter fee south", "-10"),
            ],
            "43230.00",
        );
        let cmp = reconcile(&exp, &rec, &ReconciliationConfig::default());
        assert!(cmp.has_finding(FindingKind::AmbiguousMatch));
        assert_eq!(cmp.unmatched_received, vec![2, 3]);
    }

    #[test]
    fn stated_total_must_equal_line_sum() {
        let rec = received(
            vec![
                line(LineType::Energy, "Energy", "218250.00"),
                line(LineType::LiquidatedDamages, "LD", "-175000.00"),
            ],
            "218250.00",
        );
        let cmp = reconcile(&expected(), &rec, &ReconciliationConfig::default());
        assert!(cmp.has_finding(FindingKind::HeaderTotalMismatch));
    }

    #[test]
    fn similarity_is_token_jaccard() {
        assert_eq!(similarity("Energy June", "june energy"), Decimal::ONE);
        assert_eq!(similarity("a b", "b c"), dec("1") / dec("3"));
        assert_eq!(similarity("", ""), Decimal::ZERO);
    }
}
