use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::arn::NormalizedIdentity;
use crate::config::MountedFileConfig;
use crate::error::Error;
use crate::error::Result;
use crate::mapper::rule::MappingFile;
use crate::mapper::rule::RuleSet;
use crate::mapper::AuthResult;

pub const NAME: &str = "mountedFile";

/// Backend over a rule set fixed at startup
#[derive(Debug, Clone)]
pub struct MountedFileBackend {
    rules: RuleSet,
}

impl MountedFileBackend {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// Compile static mappings. Rules that need inventory data are rejected.
    pub fn from_mappings(file: &MappingFile) -> Result<Self> {
        let rules = RuleSet::compile(file)?;
        if let Some(rule) = rules.rules().iter().find(|r| r.needs_inventory_tag()) {
            return Err(Error::config(format!(
                "mapping for {} uses {{{{EC2PrivateDNSName}}}}, which only the inventory backend can render",
                rule.source()
            )));
        }
        Ok(Self::new(rules))
    }

    /// Load and compile a YAML mapping file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = MappingFile::from_yaml_file(path)
            .map_err(|e| Error::startup(NAME, format!("{}: {e}", path.display())))?;
        Self::from_mappings(&file)
            .map_err(|e| Error::startup(NAME, format!("{}: {e}", path.display())))
    }

    pub fn from_config(config: &MountedFileConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::load(path),
            None => Self::from_mappings(&config.inline),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn start(&self, _cancel: CancellationToken) -> Result<()> {
        if self.rules.is_empty() {
            warn!(backend = NAME, "Mounted mapping file defines no mappings");
        }
        Ok(())
    }

    pub fn lookup(&self, identity: &NormalizedIdentity) -> Option<AuthResult> {
        let matched = self.rules.find(identity)?;
        let result = matched.render(identity, None);
        if result.is_none() {
            warn!(
                backend = NAME,
                arn = %identity.arn,
                "Matched mapping references values this principal does not have"
            );
        }
        debug!(backend = NAME, arn = %identity.arn, matched = result.is_some(), "Lookup");
        result
    }
}
