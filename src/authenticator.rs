use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::arn::normalize;
use crate::chain::build_chain;
use crate::chain::AuthOutcome;
use crate::chain::ChainDependencies;
use crate::chain::MapperChain;
use crate::config::AuthenticatorConfig;
use crate::error::Result;
use crate::resolver::IdentityResolver;
use crate::token;
use crate::validator::Validator;

/// Trait for bearer token authentication
#[async_trait]
pub trait Authenticate {
    /// Authenticate `token` as of `now`.
    ///
    /// `Ok(AuthOutcome::Unauthenticated)` means the caller is a valid principal with no
    /// mapping. Errors carry an [`ErrorClass`](crate::ErrorClass) telling rejected tokens
    /// apart from unavailable dependencies.
    async fn authenticate(&self, token: &str, now: DateTime<Utc>) -> Result<AuthOutcome>;
}

/// Token verification and identity mapping pipeline
pub struct Authenticator {
    validator: Validator,
    resolver: IdentityResolver,
    chain: MapperChain,
}

impl Authenticator {
    pub fn new(validator: Validator, resolver: IdentityResolver, chain: MapperChain) -> Self {
        Self {
            validator,
            resolver,
            chain,
        }
    }

    /// Build the validator, resolver and mapper chain described by `config`
    pub fn from_config(config: &AuthenticatorConfig, deps: ChainDependencies) -> Result<Self> {
        let chain = build_chain(config, deps)?;
        Ok(Self::new(
            Validator::from_config(config),
            IdentityResolver::from_config(config)?,
            chain,
        ))
    }

    /// Start every mapping backend. Fails closed if any backend cannot start.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        self.chain.start(cancel).await
    }

    pub fn chain(&self) -> &MapperChain {
        &self.chain
    }
}

#[async_trait]
impl Authenticate for Authenticator {
    async fn authenticate(&self, token: &str, now: DateTime<Utc>) -> Result<AuthOutcome> {
        let descriptor = token::decode(token)?;
        let request = self.validator.validate(descriptor, now)?;
        let identity = self.resolver.resolve(&request).await?;
        let normalized = normalize(&identity)?;

        debug!(arn = %normalized.arn, kind = ?normalized.kind, "Resolved caller identity");
        self.chain.authenticate(&normalized).await
    }
}
