//! Mapping backends
//!
//! Each backend answers one question: does this normalized identity match one of my
//! rules, and if so which Kubernetes user and groups does it become?
//!
//! - [`file::MountedFileBackend`]: rules loaded once at startup
//! - [`crd::CrdBackend`]: rules mirrored from `IAMIdentityMapping` resources
//! - [`inventory::InventoryBackend`]: rules rendered with inventory data for instance sessions
//!
//! The set is closed: [`Backend`] is an enum so every dispatch is checked exhaustively.
//! `lookup` returns `Ok(None)` for "no match" and `Err` only when the backend could not
//! determine an answer.

pub mod crd;
pub mod file;
pub mod inventory;
pub mod rule;

use tokio_util::sync::CancellationToken;

use crate::arn::NormalizedIdentity;
use crate::error::Result;

/// Kubernetes-facing identity produced by a mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub username: String,
    pub groups: Vec<String>,
}

/// One configured mapping backend
pub enum Backend {
    MountedFile(file::MountedFileBackend),
    Crd(crd::CrdBackend),
    Inventory(inventory::InventoryBackend),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::MountedFile(_) => file::NAME,
            Backend::Crd(_) => crd::NAME,
            Backend::Inventory(_) => inventory::NAME,
        }
    }

    /// Start the backend's refresh lifecycle. Background work stops when `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        match self {
            Backend::MountedFile(b) => b.start(cancel),
            Backend::Crd(b) => b.start(cancel).await,
            Backend::Inventory(b) => b.start(cancel),
        }
    }

    pub async fn lookup(&self, identity: &NormalizedIdentity) -> Result<Option<AuthResult>> {
        match self {
            Backend::MountedFile(b) => Ok(b.lookup(identity)),
            Backend::Crd(b) => Ok(b.lookup(identity)),
            Backend::Inventory(b) => b.lookup(identity).await,
        }
    }
}

impl From<file::MountedFileBackend> for Backend {
    fn from(backend: file::MountedFileBackend) -> Self {
        Backend::MountedFile(backend)
    }
}

impl From<crd::CrdBackend> for Backend {
    fn from(backend: crd::CrdBackend) -> Self {
        Backend::Crd(backend)
    }
}

impl From<inventory::InventoryBackend> for Backend {
    fn from(backend: inventory::InventoryBackend) -> Self {
        Backend::Inventory(backend)
    }
}
