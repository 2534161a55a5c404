use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::error::Result;
use crate::mapper::rule::MappingFile;

const DEFAULT_CLOCK_SKEW_SECS: u64 = 60;
const DEFAULT_IDENTITY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_INITIAL_SYNC_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WATCH_BACKOFF_INITIAL_MS: u64 = 500;
const DEFAULT_WATCH_BACKOFF_MAX_SECS: u64 = 30;
const DEFAULT_INVENTORY_QPS: u32 = 15;
const DEFAULT_INVENTORY_BURST: u32 = 5;
const DEFAULT_INVENTORY_TTL_SECS: u64 = 15 * 60;
const DEFAULT_INVENTORY_MAX_WAIT_MS: u64 = 2000;

/// Mapping backend kinds, in the order they are queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendMode {
    /// Rules from a mounted mapping file, immutable after startup
    MountedFile,
    /// Rules mirrored from `IAMIdentityMapping` cluster resources
    Crd,
    /// Rules resolved against the compute inventory
    Inventory,
}

/// Configuration for the authenticator and its mapping backends
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorConfig {
    /// Cluster the tokens must be issued for
    pub(crate) cluster_id: String,
    /// Region of the identity service; adds its regional endpoint to the allowed hosts
    #[serde(default)]
    pub(crate) region: Option<String>,
    /// Additional identity service hosts to accept
    #[serde(default)]
    pub(crate) extra_hosts: Vec<String>,
    /// Accepted distance between the token timestamp and the verification time
    #[serde(default = "default_clock_skew", with = "seconds")]
    pub(crate) clock_skew: Duration,
    /// Bound on the identity service round trip
    #[serde(default = "default_identity_timeout", with = "seconds")]
    pub(crate) identity_timeout: Duration,
    /// Send identity requests here instead of the host in the token
    #[serde(default)]
    pub(crate) identity_endpoint: Option<String>,
    /// Ordered list of mapping backends; the first match wins
    #[serde(default = "default_backend_modes")]
    pub(crate) backend_modes: Vec<BackendMode>,
    /// Continue with the next backend when one cannot determine an answer
    #[serde(default)]
    pub(crate) fall_through_on_unavailable: bool,
    #[serde(default)]
    pub(crate) mounted_file: MountedFileConfig,
    #[serde(default)]
    pub(crate) crd: CrdConfig,
    #[serde(default)]
    pub(crate) inventory: InventoryConfig,
}

/// Source of the mounted-file backend's rules
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountedFileConfig {
    /// YAML mapping file
    #[serde(default)]
    pub(crate) path: Option<PathBuf>,
    /// Inline mappings, used when no path is set
    #[serde(flatten)]
    pub(crate) inline: MappingFile,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdConfig {
    /// How long startup waits for the first complete listing
    #[serde(default = "default_initial_sync_timeout", with = "seconds")]
    pub(crate) initial_sync_timeout: Duration,
    #[serde(default = "default_watch_backoff_initial", with = "millis")]
    pub(crate) watch_backoff_initial: Duration,
    #[serde(default = "default_watch_backoff_max", with = "seconds")]
    pub(crate) watch_backoff_max: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryConfig {
    /// Base URL of the inventory lookup service
    #[serde(default)]
    pub(crate) endpoint: Option<String>,
    /// Steady rate of inventory queries per second
    #[serde(default = "default_inventory_qps")]
    pub(crate) qps: u32,
    /// Queries allowed in a burst above the steady rate
    #[serde(default = "default_inventory_burst")]
    pub(crate) burst: u32,
    /// Lifetime of a cached inventory entry
    #[serde(default = "default_inventory_ttl", with = "seconds")]
    pub(crate) cache_ttl: Duration,
    /// Longest a lookup waits for a rate-limit permit before failing
    #[serde(default = "default_inventory_max_wait", with = "millis")]
    pub(crate) max_wait: Duration,
    /// Evict expired entries in the background at this interval
    #[serde(default, with = "optional_seconds")]
    pub(crate) sweep_interval: Option<Duration>,
    #[serde(flatten)]
    pub(crate) mappings: MappingFile,
}

impl CrdConfig {
    pub fn new(
        initial_sync_timeout: Duration,
        watch_backoff_initial: Duration,
        watch_backoff_max: Duration,
    ) -> Self {
        Self {
            initial_sync_timeout,
            watch_backoff_initial,
            watch_backoff_max,
        }
    }
}

impl Default for CrdConfig {
    fn default() -> Self {
        Self {
            initial_sync_timeout: default_initial_sync_timeout(),
            watch_backoff_initial: default_watch_backoff_initial(),
            watch_backoff_max: default_watch_backoff_max(),
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            qps: default_inventory_qps(),
            burst: default_inventory_burst(),
            cache_ttl: default_inventory_ttl(),
            max_wait: default_inventory_max_wait(),
            sweep_interval: None,
            mappings: MappingFile::default(),
        }
    }
}

impl AuthenticatorConfig {
    /// Create a configuration for the given cluster with the mounted-file backend only
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            region: None,
            extra_hosts: Vec::new(),
            clock_skew: default_clock_skew(),
            identity_timeout: default_identity_timeout(),
            identity_endpoint: None,
            backend_modes: default_backend_modes(),
            fall_through_on_unavailable: false,
            mounted_file: MountedFileConfig::default(),
            crd: CrdConfig::default(),
            inventory: InventoryConfig::default(),
        }
    }

    /// Load a configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot produce a working authenticator
    pub fn validate(&self) -> Result<()> {
        if self.cluster_id.trim().is_empty() {
            return Err(Error::config("cluster ID must not be empty"));
        }
        if self.backend_modes.is_empty() {
            return Err(Error::config("at least one backend mode must be enabled"));
        }
        for (i, mode) in self.backend_modes.iter().enumerate() {
            if self.backend_modes[..i].contains(mode) {
                return Err(Error::config(format!("backend mode {mode:?} listed twice")));
            }
        }
        if self.inventory.qps == 0 || self.inventory.burst == 0 {
            return Err(Error::config("inventory qps and burst must be positive"));
        }
        if self.clock_skew.is_zero() {
            return Err(Error::config("clock skew must be positive"));
        }
        if chrono::Duration::from_std(self.clock_skew).is_err() {
            return Err(Error::config(format!(
                "clock skew of {}s is out of range",
                self.clock_skew.as_secs()
            )));
        }
        Ok(())
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn backend_modes(&self) -> &[BackendMode] {
        &self.backend_modes
    }

    /// Set the identity service region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Accept an additional identity service host
    pub fn with_extra_host(mut self, host: impl Into<String>) -> Self {
        self.extra_hosts.push(host.into());
        self
    }

    /// Set the clock-skew window
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// Set the identity service request timeout
    pub fn with_identity_timeout(mut self, timeout: Duration) -> Self {
        self.identity_timeout = timeout;
        self
    }

    /// Route identity requests to a fixed endpoint, keeping the signed Host header
    pub fn with_identity_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.identity_endpoint = Some(endpoint.into());
        self
    }

    /// Set the ordered backend list
    pub fn with_backend_modes(mut self, modes: Vec<BackendMode>) -> Self {
        self.backend_modes = modes;
        self
    }

    /// Let the chain skip a backend that cannot determine an answer
    pub fn with_fall_through_on_unavailable(mut self, enabled: bool) -> Self {
        self.fall_through_on_unavailable = enabled;
        self
    }

    /// Load mounted-file rules from a YAML file
    pub fn with_mapping_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounted_file.path = Some(path.into());
        self
    }

    /// Use inline mounted-file rules
    pub fn with_mappings(mut self, mappings: MappingFile) -> Self {
        self.mounted_file.inline = mappings;
        self
    }

    pub fn with_crd_initial_sync_timeout(mut self, timeout: Duration) -> Self {
        self.crd.initial_sync_timeout = timeout;
        self
    }

    pub fn with_crd_watch_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.crd.watch_backoff_initial = initial;
        self.crd.watch_backoff_max = max;
        self
    }

    /// Set the inventory service base URL
    pub fn with_inventory_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.inventory.endpoint = Some(endpoint.into());
        self
    }

    /// Set the inventory token bucket
    pub fn with_inventory_rate_limit(mut self, qps: u32, burst: u32) -> Self {
        self.inventory.qps = qps;
        self.inventory.burst = burst;
        self
    }

    pub fn with_inventory_cache_ttl(mut self, ttl: Duration) -> Self {
        self.inventory.cache_ttl = ttl;
        self
    }

    pub fn with_inventory_max_wait(mut self, max_wait: Duration) -> Self {
        self.inventory.max_wait = max_wait;
        self
    }

    pub fn with_inventory_sweep_interval(mut self, interval: Duration) -> Self {
        self.inventory.sweep_interval = Some(interval);
        self
    }

    /// Rules consulted by the inventory backend
    pub fn with_inventory_mappings(mut self, mappings: MappingFile) -> Self {
        self.inventory.mappings = mappings;
        self
    }
}

fn default_clock_skew() -> Duration {
    Duration::from_secs(DEFAULT_CLOCK_SKEW_SECS)
}

fn default_identity_timeout() -> Duration {
    Duration::from_secs(DEFAULT_IDENTITY_TIMEOUT_SECS)
}

fn default_backend_modes() -> Vec<BackendMode> {
    vec![BackendMode::MountedFile]
}

fn default_initial_sync_timeout() -> Duration {
    Duration::from_secs(DEFAULT_INITIAL_SYNC_TIMEOUT_SECS)
}

fn default_watch_backoff_initial() -> Duration {
    Duration::from_millis(DEFAULT_WATCH_BACKOFF_INITIAL_MS)
}

fn default_watch_backoff_max() -> Duration {
    Duration::from_secs(DEFAULT_WATCH_BACKOFF_MAX_SECS)
}

fn default_inventory_qps() -> u32 {
    DEFAULT_INVENTORY_QPS
}

fn default_inventory_burst() -> u32 {
    DEFAULT_INVENTORY_BURST
}

fn default_inventory_ttl() -> Duration {
    Duration::from_secs(DEFAULT_INVENTORY_TTL_SECS)
}

fn default_inventory_max_wait() -> Duration {
    Duration::from_millis(DEFAULT_INVENTORY_MAX_WAIT_MS)
}

mod seconds {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod optional_seconds {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|secs| secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_config_applies_defaults() {
        let config = AuthenticatorConfig::from_yaml_str(
            r#"
clusterId: prod
region: eu-west-1
backendModes: [crd, mountedFile]
"#,
        )
        .unwrap();

        assert_eq!(config.cluster_id(), "prod");
        assert_eq!(
            config.backend_modes(),
            &[BackendMode::Crd, BackendMode::MountedFile]
        );
        assert_eq!(config.clock_skew, Duration::from_secs(60));
        assert_eq!(config.inventory.qps, 15);
        assert_eq!(config.inventory.burst, 5);
        assert!(!config.fall_through_on_unavailable);
    }

    #[test]
    fn yaml_config_reads_inline_mappings() {
        let config = AuthenticatorConfig::from_yaml_str(
            r#"
clusterId: prod
mountedFile:
  mappings:
    - arn: arn:aws:iam::111122223333:role/Admin
      username: admin
      groups: ["system:masters"]
  accounts: ["444455556666"]
inventory:
  qps: 3
  burst: 1
  cacheTtl: 60
  maxWait: 250
"#,
        )
        .unwrap();

        assert_eq!(config.mounted_file.inline.mappings.len(), 1);
        assert_eq!(config.mounted_file.inline.accounts, vec!["444455556666"]);
        assert_eq!(config.inventory.qps, 3);
        assert_eq!(config.inventory.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.inventory.max_wait, Duration::from_millis(250));
    }

    #[test]
    fn empty_cluster_id_is_rejected() {
        let result = AuthenticatorConfig::from_yaml_str("clusterId: ''");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn duplicate_backend_modes_are_rejected() {
        let config = AuthenticatorConfig::new("prod")
            .with_backend_modes(vec![BackendMode::Crd, BackendMode::Crd]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn unrepresentable_clock_skew_is_rejected() {
        let config = AuthenticatorConfig::new("prod").with_clock_skew(Duration::from_secs(u64::MAX));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let result = AuthenticatorConfig::from_yaml_str(
            "clusterId: prod\nclockSkew: 18446744073709551615\n",
        );
        assert!(matches!(result, Err(Error::Config(_))));

        let config = AuthenticatorConfig::new("prod").with_clock_skew(Duration::from_secs(900));
        assert!(config.validate().is_ok());
    }
}
