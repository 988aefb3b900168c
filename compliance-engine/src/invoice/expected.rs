use rust_decimal::Decimal;

use super::{ExpectedInvoice, InvoiceLine, LineType};
use crate::{
    contract::{GuaranteeType, Tariff},
    formulas::FormulaError,
    model::{BillingPeriod, IdHasher},
    money,
    rules::RuleResult,
};

/// Energy at the escalated tariff rate, plus a negative line per priced breach.
pub fn build_expected_invoice(
    contract_id: &str,
    period: &BillingPeriod,
    tariff: &Tariff,
    delivered_kwh: Decimal,
    results: &[RuleResult],
) -> Result<ExpectedInvoice, FormulaError> {
    let rate = tariff.rate_for(period)?;
    let mut lines = vec![InvoiceLine {
        line_type: LineType::Energy,
        description: format!("Energy delivered, {}", tariff.escalation.type_code()),
        quantity: Some(delivered_kwh),
        unit_price: Some(rate),
        amount: money::round_money(delivered_kwh * rate),
        clause_id: None,
    }];

    let mut breaches: Vec<&RuleResult> = results
        .iter()
        .filter(|r| r.breach && !r.penalty_amount.is_zero())
        .collect();
    breaches.sort_by(|a, b| a.clause_id.cmp(&b.clause_id));
    for r in breaches {
        let (line_type, label) = match r.guarantee_type {
            GuaranteeType::Availability => (LineType::LiquidatedDamages, "Liquidated damages, availability"),
            GuaranteeType::CapacityFactor => (LineType::LiquidatedDamages, "Liquidated damages, capacity factor"),
            GuaranteeType::Performance => (LineType::ShortfallPayment, "Shortfall payment, performance"),
        };
        lines.push(InvoiceLine {
            line_type,
            description: format!("{label} clause {}", r.clause_id),
            quantity: None,
            unit_price: None,
            amount: -r.penalty_amount,
            clause_id: Some(r.clause_id.clone()),
        });
    }

    let total = lines.iter().map(|l| l.amount).sum();
    Ok(ExpectedInvoice {
        id: IdHasher::new("expected_invoice")
            .str(contract_id)
            .ts(period.start)
            .ts(period.end)
            .finish(),
        contract_id: contract_id.to_string(),
        period: *period,
        currency: tariff.currency.clone(),
        lines,
        total,
    })
}
