use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::arn::NormalizedIdentity;
use crate::arn::PrincipalKind;
use crate::error::Error;
use crate::error::InventoryError;
use crate::error::Result;
use crate::inventory_cache::InventoryCache;
use crate::mapper::rule::MappingFile;
use crate::mapper::rule::RuleSet;
use crate::mapper::AuthResult;

pub const NAME: &str = "inventory";

static INSTANCE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^i-([0-9a-f]{8}|[0-9a-f]{17})$").expect("valid regex"));

/// Whether a session name is a compute instance identifier
pub fn is_instance_id(session_name: &str) -> bool {
    INSTANCE_ID.is_match(session_name)
}

/// Backend for instance-profile sessions, rendering rules with inventory data
pub struct InventoryBackend {
    rules: RuleSet,
    cache: InventoryCache,
    sweep_interval: Option<Duration>,
}

impl InventoryBackend {
    pub fn new(rules: RuleSet, cache: InventoryCache) -> Self {
        Self {
            rules,
            cache,
            sweep_interval: None,
        }
    }

    pub fn from_mappings(file: &MappingFile, cache: InventoryCache) -> Result<Self> {
        Ok(Self::new(RuleSet::compile(file)?, cache))
    }

    /// Periodically evict expired cache entries once started
    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn cache(&self) -> &InventoryCache {
        &self.cache
    }

    pub fn start(&self, cancel: CancellationToken) -> Result<()> {
        if let Some(interval) = self.sweep_interval {
            info!(backend = NAME, ?interval, "Starting inventory cache sweeper");
            self.cache.spawn_sweeper(interval, cancel);
        }
        Ok(())
    }

    pub async fn lookup(&self, identity: &NormalizedIdentity) -> Result<Option<AuthResult>> {
        if identity.kind != PrincipalKind::AssumedRole {
            return Ok(None);
        }
        let Some(instance_id) = identity.session_name.as_deref().filter(|s| is_instance_id(s))
        else {
            return Ok(None);
        };
        let Some(matched) = self.rules.find(identity) else {
            return Ok(None);
        };

        let tag = if matched.needs_inventory_tag() {
            match self.cache.get_tag(instance_id).await {
                Ok(tag) => Some(tag),
                Err(InventoryError::NotFound(_)) => {
                    debug!(backend = NAME, instance_id, "Instance not found in inventory");
                    return Ok(None);
                }
                Err(InventoryError::Upstream(reason)) => {
                    return Err(Error::mapping_unavailable(NAME, reason));
                }
            }
        } else {
            None
        };

        let result = matched.render(identity, tag.as_deref());
        debug!(backend = NAME, arn = %identity.arn, matched = result.is_some(), "Lookup");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_instance_ids() {
        assert!(is_instance_id("i-0123abcd"));
        assert!(is_instance_id("i-0123456789abcdef0"));
        assert!(!is_instance_id("i-0123456789abcdef"));
        assert!(!is_instance_id("alice"));
        assert!(!is_instance_id("i-0123ABCD"));
    }
}
