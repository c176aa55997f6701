//! The execution engine: evaluation, scheduling, trigger handling, chain
//! activation, verification, order submission, expiry and boot recovery.

pub mod activation;
pub mod evaluator;
pub mod expiry;
pub mod orchestrator;
pub mod recovery;
pub mod scheduler;
pub mod submitter;
pub mod verifier;

use std::sync::{Arc, RwLock};

use crate::config::AppConfig;
use crate::error::{Result, SentraError};
use crate::gateway::{GatewayClient, GatewayProbe};
use crate::marketdata::MarketDataCache;
use crate::rules::{RulesConfig, RulesSnapshot};
use crate::store::SentraStore;

/// Shared handles every engine component works through. The rules snapshot
/// is read-copy-updated: each run pins the Arc it starts with.
pub struct EngineContext {
    pub store: SentraStore,
    pub cache: Arc<MarketDataCache>,
    pub gateway: Arc<dyn GatewayClient>,
    pub probe: Option<GatewayProbe>,
    pub config: AppConfig,
    rules: RwLock<RulesSnapshot>,
}

impl EngineContext {
    pub fn new(
        store: SentraStore,
        cache: Arc<MarketDataCache>,
        gateway: Arc<dyn GatewayClient>,
        probe: Option<GatewayProbe>,
        config: AppConfig,
        rules: RulesSnapshot,
    ) -> Self {
        Self {
            store,
            cache,
            gateway,
            probe,
            config,
            rules: RwLock::new(rules),
        }
    }

    /// Pin the current rules snapshot for one run.
    pub fn rules_snapshot(&self) -> RulesSnapshot {
        self.rules
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|_| Arc::new(RulesConfig::default()))
    }

    /// Swap in a freshly-loaded rules snapshot; in-flight runs keep the
    /// snapshot they pinned.
    pub fn reload_rules(&self, snapshot: RulesSnapshot) -> Result<()> {
        let mut guard = self
            .rules
            .write()
            .map_err(|_| SentraError::Internal("rules snapshot lock poisoned".to_string()))?;
        *guard = snapshot;
        Ok(())
    }

    /// Whether the gateway endpoint looks usable right now.
    pub async fn gateway_available(&self) -> bool {
        match &self.probe {
            Some(probe) => probe.is_reachable().await,
            None => self.gateway.health_check().await.is_ok(),
        }
    }

    pub fn gateway_timeout(&self) -> u64 {
        self.config.ib_gateway.timeout_seconds
    }
}
