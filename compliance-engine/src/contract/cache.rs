use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::RwLock;

use super::{ConfigVersions, ContractConfig};
use crate::{
    config::EngineSettings,
    error::{EngineError, EngineResult},
    formulas::FormulaRegistry,
    store::{with_timeout, EvaluationStore},
};

/// Read-through cache of validated contract configuration.
///
/// Each lookup fetches the current document versions; a cached entry is
/// served only while its versions still match.
pub struct ConfigCache {
    registry: Arc<FormulaRegistry>,
    settings: Arc<EngineSettings>,
    entries: RwLock<HashMap<String, Arc<ContractConfig>>>,
}

impl ConfigCache {
    pub fn new(registry: Arc<FormulaRegistry>, settings: Arc<EngineSettings>) -> Self {
        Self {
            registry,
            settings,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        store: &dyn EvaluationStore,
        contract_id: &str,
        read_timeout: Duration,
    ) -> EngineResult<Arc<ContractConfig>> {
        let versions = with_timeout(read_timeout, "config versions", store.config_versions(contract_id)).await?;
        if versions.clauses.is_empty() && versions.tariff.is_none() {
            return Err(EngineError::NotFound {
                kind: "contract",
                id: contract_id.to_string(),
            });
        }

        if let Some(hit) = self.entries.read().await.get(contract_id) {
            if hit.versions == versions {
                metrics::counter!("config_cache_hits_total").increment(1);
                return Ok(Arc::clone(hit));
            }
        }
        metrics::counter!("config_cache_misses_total").increment(1);

        let guarantees =
            with_timeout(read_timeout, "guarantee configs", store.load_guarantee_configs(contract_id)).await?;
        let tariff = with_timeout(read_timeout, "tariff config", store.load_tariff_config(contract_id)).await?;

        // Versions of what was actually loaded, in case a document changed in between.
        let loaded = ConfigVersions {
            clauses: guarantees.iter().map(|d| (d.clause_id.clone(), d.version)).collect(),
            tariff: tariff.as_ref().map(|t| t.version),
        };
        let config = Arc::new(ContractConfig::from_docs(
            contract_id,
            loaded,
            &guarantees,
            tariff.as_ref(),
            &self.registry,
            &self.settings,
        )?);

        tracing::info!(
            contract_id = %contract_id,
            clauses = config.clauses.len(),
            "contract configuration loaded"
        );
        self.entries
            .write()
            .await
            .insert(contract_id.to_string(), Arc::clone(&config));
        Ok(config)
    }

    /// Checks every type code the stored documents reference against the
    /// registry before loading the contract. Run once per contract at startup.
    pub async fn preflight(
        &self,
        store: &dyn EvaluationStore,
        contract_id: &str,
        read_timeout: Duration,
    ) -> EngineResult<Arc<ContractConfig>> {
        let guarantees =
            with_timeout(read_timeout, "guarantee configs", store.load_guarantee_configs(contract_id)).await?;
        for doc in &guarantees {
            self.registry
                .check_coverage(doc.formula_refs())
                .map_err(|e| EngineError::config(&doc.clause_id, "formulas", e.to_string()))?;
        }
        if let Some(tariff) = with_timeout(read_timeout, "tariff config", store.load_tariff_config(contract_id)).await? {
            self.registry
                .check_coverage(tariff.formula_refs())
                .map_err(|e| EngineError::config(format!("tariff:{contract_id}"), "escalation", e.to_string()))?;
        }
        self.get(store, contract_id, read_timeout).await
    }

    pub async fn invalidate(&self, contract_id: &str) {
        self.entries.write().await.remove(contract_id);
    }
}
