use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::arn::NormalizedIdentity;
use crate::config::AuthenticatorConfig;
use crate::config::BackendMode;
use crate::error::Error;
use crate::error::Result;
use crate::inventory_cache::HttpInventoryClient;
use crate::inventory_cache::InventoryCache;
use crate::inventory_cache::InventoryClient;
use crate::mapper::crd::CrdBackend;
use crate::mapper::crd::MappingSource;
use crate::mapper::file::MountedFileBackend;
use crate::mapper::inventory::InventoryBackend;
use crate::mapper::AuthResult;
use crate::mapper::Backend;

/// Result of running an identity through the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(AuthResult),
    /// Valid identity with no mapping in any backend
    Unauthenticated,
}

impl AuthOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthOutcome::Authenticated(_))
    }
}

/// Ordered backends; the first match wins
pub struct MapperChain {
    backends: Vec<Backend>,
    fall_through_on_unavailable: bool,
}

impl MapperChain {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends,
            fall_through_on_unavailable: false,
        }
    }

    /// When a backend cannot determine an answer, continue with the next one instead
    /// of failing the lookup
    pub fn with_fall_through_on_unavailable(mut self, enabled: bool) -> Self {
        self.fall_through_on_unavailable = enabled;
        self
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(Backend::name).collect()
    }

    /// Start every backend in order. Any failure aborts startup.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        for backend in &self.backends {
            info!(backend = backend.name(), "Starting mapper");
            backend.start(cancel.child_token()).await.map_err(|e| match e {
                Error::StartupFailed { .. } => e,
                other => Error::startup(backend.name(), other.to_string()),
            })?;
        }
        Ok(())
    }

    pub async fn authenticate(&self, identity: &NormalizedIdentity) -> Result<AuthOutcome> {
        for backend in &self.backends {
            match backend.lookup(identity).await {
                Ok(Some(result)) => {
                    debug!(backend = backend.name(), username = %result.username, "Identity mapped");
                    return Ok(AuthOutcome::Authenticated(result));
                }
                Ok(None) => continue,
                Err(e) if self.fall_through_on_unavailable => {
                    warn!(backend = backend.name(), error = %e, "Mapper unavailable, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(arn = %identity.arn, "No mapping matched");
        Ok(AuthOutcome::Unauthenticated)
    }
}

/// External collaborators needed by some backends
#[derive(Default, Clone)]
pub struct ChainDependencies {
    /// Required when the `crd` backend is enabled
    pub mapping_source: Option<Arc<dyn MappingSource>>,
    /// Overrides the HTTP inventory client built from configuration
    pub inventory_client: Option<Arc<dyn InventoryClient>>,
}

/// Build the configured chain of backends
pub fn build_chain(config: &AuthenticatorConfig, deps: ChainDependencies) -> Result<MapperChain> {
    config.validate()?;

    let mut backends = Vec::with_capacity(config.backend_modes.len());
    for mode in &config.backend_modes {
        let backend: Backend = match mode {
            BackendMode::MountedFile => MountedFileBackend::from_config(&config.mounted_file)?.into(),
            BackendMode::Crd => {
                let source = deps.mapping_source.clone().ok_or_else(|| {
                    Error::config("crd backend enabled without a mapping source")
                })?;
                CrdBackend::new(source, &config.crd).into()
            }
            BackendMode::Inventory => {
                let client: Arc<dyn InventoryClient> = match &deps.inventory_client {
                    Some(client) => Arc::clone(client),
                    None => {
                        let endpoint = config.inventory.endpoint.clone().ok_or_else(|| {
                            Error::config("inventory backend enabled without an endpoint")
                        })?;
                        Arc::new(HttpInventoryClient::new(endpoint, reqwest::Client::new()))
                    }
                };
                let cache = InventoryCache::from_config(client, &config.inventory)?;
                InventoryBackend::from_mappings(&config.inventory.mappings, cache)?
                    .with_sweep_interval(config.inventory.sweep_interval)
                    .into()
            }
        };
        backends.push(backend);
    }

    Ok(MapperChain::new(backends)
        .with_fall_through_on_unavailable(config.fall_through_on_unavailable))
}
