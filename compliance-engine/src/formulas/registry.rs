use std::{collections::BTreeMap, fmt, sync::Arc};

use rust_decimal::Decimal;

use super::{
    available_energy, escalation, reference_price, shortfall, Calculator, FormulaDomain, FormulaError,
    FormulaInputs, FormulaParams, FormulaRef, InputKind,
};

/// Type code → calculator table.
///
/// Read-only once built; shared across evaluations behind an `Arc`.
#[derive(Clone, Default)]
pub struct FormulaRegistry {
    calculators: BTreeMap<&'static str, Arc<dyn Calculator>>,
}

impl FormulaRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding every built-in calculator.
    ///
    /// A clashing built-in type code is a programming error: debug builds
    /// panic, release builds log it and keep the first registration.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        for calc in builtin_calculators() {
            let res = registry.register(calc);
            debug_assert!(res.is_ok(), "built-in formula registration failed: {res:?}");
            if let Err(e) = res {
                tracing::error!(error = %e, "built-in formula registration failed");
            }
        }
        registry
    }

    /// Builds a registry from `calculators`, failing on the first clashing type code.
    pub fn from_calculators<I>(calculators: I) -> Result<Self, FormulaError>
    where
        I: IntoIterator<Item = Arc<dyn Calculator>>,
    {
        let mut registry = Self::empty();
        for calc in calculators {
            registry.register(calc)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, calculator: Arc<dyn Calculator>) -> Result<(), FormulaError> {
        let code = calculator.type_code();
        if self.calculators.contains_key(code) {
            return Err(FormulaError::DuplicateRegistration(code.to_string()));
        }
        self.calculators.insert(code, calculator);
        Ok(())
    }

    pub fn type_codes(&self) -> impl Iterator<Item = (&'static str, FormulaDomain)> + '_ {
        self.calculators.iter().map(|(code, c)| (*code, c.domain()))
    }

    /// Parses and validates `formula` for use in `domain`.
    pub fn resolve(&self, domain: FormulaDomain, formula: &FormulaRef) -> Result<ResolvedFormula, FormulaError> {
        let calculator = self
            .calculators
            .get(formula.type_code.as_str())
            .ok_or_else(|| FormulaError::UnknownTypeCode(formula.type_code.clone()))?;
        if calculator.domain() != domain {
            return Err(FormulaError::DomainMismatch {
                type_code: formula.type_code.clone(),
                expected: domain,
                actual: calculator.domain(),
            });
        }
        let params = calculator.parse_params(&formula.params)?;
        Ok(ResolvedFormula {
            calculator: Arc::clone(calculator),
            params,
        })
    }

    /// Fails on the first referenced type code that is not registered for its domain.
    pub fn check_coverage<'a, I>(&self, refs: I) -> Result<(), FormulaError>
    where
        I: IntoIterator<Item = (FormulaDomain, &'a str)>,
    {
        for (domain, code) in refs {
            match self.calculators.get(code) {
                None => return Err(FormulaError::UnknownTypeCode(code.to_string())),
                Some(c) if c.domain() != domain => {
                    return Err(FormulaError::DomainMismatch {
                        type_code: code.to_string(),
                        expected: domain,
                        actual: c.domain(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn builtin_calculators() -> Vec<Arc<dyn Calculator>> {
    available_energy::calculators()
        .into_iter()
        .chain(reference_price::calculators())
        .chain(escalation::calculators())
        .chain(shortfall::calculators())
        .collect()
}

impl fmt::Debug for FormulaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.calculators.keys()).finish()
    }
}

/// A calculator bound to its validated params.
#[derive(Clone)]
pub struct ResolvedFormula {
    calculator: Arc<dyn Calculator>,
    params: FormulaParams,
}

impl ResolvedFormula {
    pub fn type_code(&self) -> &'static str {
        self.calculator.type_code()
    }

    pub fn domain(&self) -> FormulaDomain {
        self.calculator.domain()
    }

    pub fn params(&self) -> &FormulaParams {
        &self.params
    }

    pub fn required_inputs(&self) -> &'static [InputKind] {
        self.calculator.required_inputs()
    }

    pub fn requires(&self, input: InputKind) -> bool {
        self.required_inputs().contains(&input)
    }

    pub fn compute(&self, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        self.calculator.compute(&self.params, inputs)
    }
}

impl fmt::Debug for ResolvedFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedFormula")
            .field("type_code", &self.type_code())
            .field("params", &self.params)
            .finish()
    }
}

impl PartialEq for ResolvedFormula {
    fn eq(&self, other: &Self) -> bool {
        self.type_code() == other.type_code() && self.params == other.params
    }
}
