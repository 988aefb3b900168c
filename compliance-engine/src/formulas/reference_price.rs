//! Grid reference price models.

use std::sync::Arc;

use compliance_client::domain::MarketPrice;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{
    missing, parse_params, require_non_negative, wrong_inputs, Calculator, FormulaDomain, FormulaError,
    FormulaInputs, FormulaParams, InputKind, ValidateParams,
};

#[derive(Debug, Clone)]
pub struct ReferencePriceInputs<'a> {
    /// Market prices inside the billing period, if loaded.
    pub prices: Option<&'a [MarketPrice]>,
    pub peak_energy: Decimal,
    pub off_peak_energy: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedPriceParams {
    pub price_per_kwh: Decimal,
}

impl ValidateParams for FixedPriceParams {
    fn validate(&self) -> Result<(), String> {
        require_non_negative("price_per_kwh", self.price_per_kwh)
    }
}

fn one() -> Decimal {
    Decimal::ONE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketAverageParams {
    pub market: String,
    #[serde(default = "one")]
    pub multiplier: Decimal,
    #[serde(default)]
    pub adder: Decimal,
    #[serde(default)]
    pub floor: Option<Decimal>,
    #[serde(default)]
    pub cap: Option<Decimal>,
}

impl ValidateParams for MarketAverageParams {
    fn validate(&self) -> Result<(), String> {
        if self.market.trim().is_empty() {
            return Err("market must not be empty".to_string());
        }
        require_non_negative("multiplier", self.multiplier)?;
        if let (Some(floor), Some(cap)) = (self.floor, self.cap) {
            if floor > cap {
                return Err(format!("floor {floor} exceeds cap {cap}"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeakOffPeakParams {
    pub peak_price: Decimal,
    pub off_peak_price: Decimal,
}

impl ValidateParams for PeakOffPeakParams {
    fn validate(&self) -> Result<(), String> {
        require_non_negative("peak_price", self.peak_price)?;
        require_non_negative("off_peak_price", self.off_peak_price)
    }
}

pub struct FixedPrice;

impl Calculator for FixedPrice {
    fn type_code(&self) -> &'static str {
        "GRP_FIXED"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::GridReferencePrice
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::GrpFixed)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::GrpFixed(p), FormulaInputs::ReferencePrice(_)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        Ok(p.price_per_kwh)
    }
}

/// Mean market price × multiplier + adder, bounded by floor and cap.
pub struct MarketAverage;

impl Calculator for MarketAverage {
    fn type_code(&self) -> &'static str {
        "GRP_MARKET_AVERAGE"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::GridReferencePrice
    }

    fn required_inputs(&self) -> &'static [InputKind] {
        &[InputKind::MarketPrices]
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::GrpMarketAverage)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::GrpMarketAverage(p), FormulaInputs::ReferencePrice(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        let prices: Vec<Decimal> = i
            .prices
            .unwrap_or_default()
            .iter()
            .filter(|mp| mp.market == p.market)
            .map(|mp| mp.price_per_kwh)
            .collect();
        if prices.is_empty() {
            return Err(missing(self.type_code(), InputKind::MarketPrices));
        }
        let mean = prices.iter().sum::<Decimal>() / Decimal::from(prices.len());
        let mut price = mean * p.multiplier + p.adder;
        if let Some(floor) = p.floor {
            price = price.max(floor);
        }
        if let Some(cap) = p.cap {
            price = price.min(cap);
        }
        Ok(price)
    }
}

/// Energy-weighted blend of a peak and an off-peak price.
pub struct PeakOffPeak;

impl Calculator for PeakOffPeak {
    fn type_code(&self) -> &'static str {
        "GRP_PEAK_OFFPEAK"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::GridReferencePrice
    }

    fn required_inputs(&self) -> &'static [InputKind] {
        &[InputKind::EnergySplit]
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::GrpPeakOffPeak)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::GrpPeakOffPeak(p), FormulaInputs::ReferencePrice(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        let total = i.peak_energy + i.off_peak_energy;
        if total.is_zero() {
            // No production to weight by: plain average of the two prices.
            return Ok((p.peak_price + p.off_peak_price) / Decimal::TWO);
        }
        Ok((i.peak_energy * p.peak_price + i.off_peak_energy * p.off_peak_price) / total)
    }
}

pub(crate) fn calculators() -> Vec<Arc<dyn Calculator>> {
    vec![Arc::new(FixedPrice), Arc::new(MarketAverage), Arc::new(PeakOffPeak)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{dec, price};
    use serde_json::json;
    use time::macros::datetime;

    fn inputs(prices: Option<&[MarketPrice]>) -> FormulaInputs<'_> {
        FormulaInputs::ReferencePrice(ReferencePriceInputs {
            prices,
            peak_energy: dec("300"),
            off_peak_energy: dec("100"),
        })
    }

    #[test]
    fn market_average_applies_multiplier_adder_and_cap() {
        let calc = MarketAverage;
        let params = calc
            .parse_params(&json!({"market": "ERCOT-N", "multiplier": "1.1", "adder": "0.01", "cap": "0.08"}))
            .unwrap();
        let prices = [
            price("ERCOT-N", datetime!(2024-06-01 00:00:00 UTC), 4),
            price("ERCOT-N", datetime!(2024-06-01 01:00:00 UTC), 6),
            price("ERCOT-S", datetime!(2024-06-01 01:00:00 UTC), 90),
        ];
        // mean 0.05 × 1.1 + 0.01
        assert_eq!(calc.compute(&params, &inputs(Some(&prices))).unwrap(), dec("0.065"));

        let spiky = [price("ERCOT-N", datetime!(2024-06-01 00:00:00 UTC), 20)];
        assert_eq!(calc.compute(&params, &inputs(Some(&spiky))).unwrap(), dec("0.08"));
    }

    #[test]
    fn market_average_without_prices_is_a_data_error() {
        let calc = MarketAverage;
        let params = calc.parse_params(&json!({"market": "ERCOT-N"})).unwrap();
        assert!(calc.compute(&params, &inputs(Some(&[]))).unwrap_err().is_data_error());
    }

    #[test]
    fn peak_off_peak_weights_by_energy() {
        let calc = PeakOffPeak;
        let params = calc
            .parse_params(&json!({"peak_price": "0.08", "off_peak_price": "0.04"}))
            .unwrap();
        assert_eq!(calc.compute(&params, &inputs(None)).unwrap(), dec("0.07"));
    }

    #[test]
    fn inverted_floor_and_cap_are_rejected() {
        let err = MarketAverage
            .parse_params(&json!({"market": "X", "floor": "0.1", "cap": "0.05"}))
            .unwrap_err();
        assert!(matches!(err, FormulaError::InvalidParams { .. }));
    }
}
