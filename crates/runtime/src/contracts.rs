//! Contract registry
//!
//! Contract execution modules are looked up by the contract's name. The
//! registry is filled at startup; block application resolves each call
//! through it and never loads code dynamically.

use std::collections::BTreeMap;
use std::sync::Arc;

use pchain_types::{ContractCall, ContractError};

use crate::ledger_store::{LedgerRead, LedgerState};

/// Everything a contract function learns about the call besides its params
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Address of the contract being called
    pub address: String,
    /// Code of the calling transaction
    pub transaction_code: String,
    /// Timestamp of the calling transaction
    pub timestamp: i64,
}

/// Pluggable contract execution module
pub trait ContractRuntime: Send + Sync {
    /// Run `function` against the ledger. `params` carries the caller supplied
    /// parameters plus `function_caller`, the signing wallets.
    fn call(
        &self,
        ctx: &CallContext,
        function: &str,
        params: &serde_json::Value,
        ledger: &mut LedgerState,
    ) -> Result<(), ContractError>;

    /// Read-only pre-check run during validation. Modules without one accept
    /// every call.
    fn validate(&self, _call: &ContractCall, _ledger: &dyn LedgerRead) -> Result<(), ContractError> {
        Ok(())
    }
}

/// Contract name -> execution module
#[derive(Clone, Default)]
pub struct ContractRegistry {
    runtimes: BTreeMap<String, Arc<dyn ContractRuntime>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, runtime: Arc<dyn ContractRuntime>) {
        let name = name.into();
        tracing::debug!("Registering contract module: {}", name);
        self.runtimes.insert(name, runtime);
    }

    /// Builder-style variant of [`ContractRegistry::register`]
    pub fn with(mut self, name: impl Into<String>, runtime: Arc<dyn ContractRuntime>) -> Self {
        self.register(name, runtime);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ContractRuntime>, ContractError> {
        self.runtimes
            .get(name)
            .cloned()
            .ok_or_else(|| ContractError::NotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.runtimes.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.runtimes.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ContractRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractRegistry")
            .field("modules", &self.names())
            .finish()
    }
}
