//! Mappings mirrored from `IAMIdentityMapping` resources
//!
//! ```yaml
//! apiVersion: iamauthenticator.k8s.aws/v1alpha1
//! kind: IAMIdentityMapping
//! metadata:
//!   name: developers
//! spec:
//!   arn: arn:aws:iam::111122223333:role/Developers
//!   username: "dev:{{SessionName}}"
//!   groups:
//!     - developers
//! ```
//!
//! A background task owns the mirrored collection and publishes complete snapshots
//! through an [`ArcSwap`]. Lookups read one snapshot; they never see a half-applied
//! update. When the watch fails the last snapshot stays in place while the task
//! re-opens the watch with backoff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::arn::NormalizedIdentity;
use crate::config::CrdConfig;
use crate::error::Error;
use crate::error::Result;
use crate::mapper::rule::MappingEntry;
use crate::mapper::rule::MappingRule;
use crate::mapper::rule::RuleSet;
use crate::mapper::AuthResult;
use crate::retry::Backoff;
use crate::retry::BackoffConfig;

pub const NAME: &str = "crd";

/// Maps one IAM principal pattern to a Kubernetes user and groups
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "iamauthenticator.k8s.aws",
    version = "v1alpha1",
    kind = "IAMIdentityMapping",
    plural = "iamidentitymappings",
    printcolumn = r#"{"name":"ARN","type":"string","jsonPath":".spec.arn"}"#,
    printcolumn = r#"{"name":"Username","type":"string","jsonPath":".spec.username"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IAMIdentityMappingSpec {
    pub arn: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// Mapping resource identified by name
#[derive(Debug, Clone, PartialEq)]
pub struct NamedMapping {
    pub name: String,
    pub entry: MappingEntry,
}

/// Change notification from a mapping store
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A full listing begins; following upserts replace the whole collection
    Restart,
    Upsert(NamedMapping),
    Remove(String),
    /// The full listing is complete
    Ready,
}

/// List/watch access to the externally managed mapping collection
pub trait MappingSource: Send + Sync + 'static {
    /// Open a watch. The stream starts with a full listing (`Restart`, upserts, `Ready`).
    fn watch(&self) -> BoxStream<'static, Result<SourceEvent>>;
}

/// [`MappingSource`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeMappingSource {
    api: Api<IAMIdentityMapping>,
}

impl KubeMappingSource {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    /// Connect using the in-cluster or local kubeconfig
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::startup(NAME, format!("failed to create kube client: {e}")))?;
        Ok(Self::new(client))
    }
}

impl MappingSource for KubeMappingSource {
    fn watch(&self) -> BoxStream<'static, Result<SourceEvent>> {
        watcher::watcher(self.api.clone(), watcher::Config::default())
            .map(|event| match event {
                Ok(Event::Init) => Ok(SourceEvent::Restart),
                Ok(Event::InitApply(mapping)) | Ok(Event::Apply(mapping)) => {
                    Ok(SourceEvent::Upsert(NamedMapping {
                        name: mapping.name_any(),
                        entry: MappingEntry {
                            arn: mapping.spec.arn,
                            username: mapping.spec.username,
                            groups: mapping.spec.groups,
                        },
                    }))
                }
                Ok(Event::Delete(mapping)) => Ok(SourceEvent::Remove(mapping.name_any())),
                Ok(Event::InitDone) => Ok(SourceEvent::Ready),
                Err(e) => Err(Error::UpstreamUnavailable(format!("mapping watch failed: {e}"))),
            })
            .boxed()
    }
}

/// Backend serving lookups from the latest mirrored snapshot
pub struct CrdBackend {
    source: Arc<dyn MappingSource>,
    snapshot: Arc<ArcSwap<RuleSet>>,
    initial_sync_timeout: Duration,
    backoff: BackoffConfig,
}

impl CrdBackend {
    pub fn new(source: Arc<dyn MappingSource>, config: &CrdConfig) -> Self {
        Self {
            source,
            snapshot: Arc::new(ArcSwap::from_pointee(RuleSet::default())),
            initial_sync_timeout: config.initial_sync_timeout,
            backoff: BackoffConfig::new(config.watch_backoff_initial, config.watch_backoff_max),
        }
    }

    /// Current rule snapshot
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.snapshot.load_full()
    }

    /// Spawn the watch loop and wait for the first complete listing
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let (synced_tx, synced_rx) = oneshot::channel();
        let task = WatchTask {
            source: Arc::clone(&self.source),
            snapshot: Arc::clone(&self.snapshot),
            backoff: Backoff::new(self.backoff.clone()),
            cancel: cancel.clone(),
            synced: Some(synced_tx),
        };
        tokio::spawn(task.run());

        let err = match tokio::time::timeout(self.initial_sync_timeout, synced_rx).await {
            Ok(Ok(())) => {
                info!(backend = NAME, rules = self.snapshot.load().len(), "Initial mapping sync complete");
                return Ok(());
            }
            Ok(Err(_)) => Error::startup(NAME, "watch stopped before the initial sync"),
            Err(_) => Error::startup(
                NAME,
                format!(
                    "no complete mapping listing within {:?}",
                    self.initial_sync_timeout
                ),
            ),
        };
        cancel.cancel();
        Err(err)
    }

    pub fn lookup(&self, identity: &NormalizedIdentity) -> Option<AuthResult> {
        let rules = self.snapshot.load();
        let result = rules.find(identity)?.render(identity, None);
        debug!(backend = NAME, arn = %identity.arn, matched = result.is_some(), "Lookup");
        result
    }
}

struct WatchTask {
    source: Arc<dyn MappingSource>,
    snapshot: Arc<ArcSwap<RuleSet>>,
    backoff: Backoff,
    cancel: CancellationToken,
    synced: Option<oneshot::Sender<()>>,
}

impl WatchTask {
    async fn run(mut self) {
        // Collection as last published, keyed by resource name.
        let mut current: BTreeMap<String, MappingEntry> = BTreeMap::new();

        loop {
            let mut stream = self.source.watch();
            // Buffer of a listing in progress; published only once complete.
            let mut pending: Option<BTreeMap<String, MappingEntry>> = None;

            loop {
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!(backend = NAME, "Mapping watch stopped");
                        return;
                    }
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(SourceEvent::Restart)) => {
                        pending = Some(BTreeMap::new());
                    }
                    Some(Ok(SourceEvent::Upsert(mapping))) => match pending.as_mut() {
                        Some(buffer) => {
                            buffer.insert(mapping.name, mapping.entry);
                        }
                        None => {
                            current.insert(mapping.name, mapping.entry);
                            self.publish(&current);
                        }
                    },
                    Some(Ok(SourceEvent::Remove(name))) => match pending.as_mut() {
                        Some(buffer) => {
                            buffer.remove(&name);
                        }
                        None => {
                            if current.remove(&name).is_some() {
                                self.publish(&current);
                            }
                        }
                    },
                    Some(Ok(SourceEvent::Ready)) => {
                        if let Some(listing) = pending.take() {
                            current = listing;
                        }
                        self.publish(&current);
                        self.backoff.reset();
                        if let Some(synced) = self.synced.take() {
                            let _ = synced.send(());
                        }
                    }
                    Some(Err(e)) => {
                        warn!(backend = NAME, error = %e, "Mapping watch failed, keeping last snapshot");
                        break;
                    }
                    None => {
                        warn!(backend = NAME, "Mapping watch ended, keeping last snapshot");
                        break;
                    }
                }
            }

            let delay = self.backoff.next_delay();
            warn!(
                backend = NAME,
                attempt = self.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Re-opening mapping watch"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(backend = NAME, "Mapping watch stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Compile `collection` and swap it in as one snapshot
    fn publish(&self, collection: &BTreeMap<String, MappingEntry>) {
        let mut rules = Vec::with_capacity(collection.len());
        for (name, entry) in collection {
            match MappingRule::compile(entry) {
                Ok(rule) if rule.needs_inventory_tag() => warn!(
                    backend = NAME,
                    mapping = %name,
                    "Skipping mapping that uses EC2PrivateDNSName outside the inventory backend"
                ),
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(backend = NAME, mapping = %name, error = %e, "Skipping invalid mapping"),
            }
        }
        debug!(backend = NAME, rules = rules.len(), "Publishing mapping snapshot");
        self.snapshot.store(Arc::new(RuleSet::new(rules, Vec::new())));
    }
}
