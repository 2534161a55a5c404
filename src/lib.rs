//! # iam-authenticator
//!
//! Kubernetes webhook token authentication backed by AWS IAM.
//!
//! A client proves its IAM identity by presigning an STS `GetCallerIdentity` request
//! and handing it over as a bearer token. This crate checks the token, forwards the
//! signed request unchanged to STS, and maps the returned principal to a Kubernetes
//! username and groups through an ordered chain of mapping backends.
//!
//! ## Features
//!
//! - Token decoding with strict validation (host allow-list, action, clock skew,
//!   signed cluster ID header) before any network call
//! - Signature-preserving forwarding to the identity service with a bounded timeout
//! - Principal ARN classification (root, IAM user, assumed role, federated user)
//! - Mapping backends: mounted file, `IAMIdentityMapping` resources, compute inventory
//! - Rate-limited, deduplicated inventory lookups with TTL caching
//!
//! ## Example
//!
//! ```rust,no_run
//! use iam_authenticator::{Authenticate, AuthOutcome, Authenticator, AuthenticatorConfig};
//! use iam_authenticator::{ChainDependencies, MappingEntry, MappingFile};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AuthenticatorConfig::new("prod")
//!         .with_region("eu-west-1")
//!         .with_mappings(MappingFile {
//!             mappings: vec![MappingEntry::new(
//!                 "arn:aws:sts::111122223333:assumed-role/Developers/{{SessionName}}",
//!                 "{{SessionName}}",
//!                 &["developers"],
//!             )],
//!             accounts: vec![],
//!         });
//!
//!     let authenticator = Authenticator::from_config(&config, ChainDependencies::default())?;
//!     authenticator.start(CancellationToken::new()).await?;
//!
//!     let token = "k8s-aws-v1.R0VUIGh0dHBzOi8v...";
//!     match authenticator.authenticate(token, chrono::Utc::now()).await {
//!         Ok(AuthOutcome::Authenticated(user)) => println!("{} {:?}", user.username, user.groups),
//!         Ok(AuthOutcome::Unauthenticated) => println!("no mapping"),
//!         Err(e) => println!("rejected ({:?}): {e}", e.class()),
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod arn;
mod authenticator;
mod chain;
mod config;
mod error;
mod inventory_cache;
pub mod mapper;
mod resolver;
mod retry;
pub mod token;
mod validator;

// Re-exports for public API
pub use arn::normalize;
pub use arn::NormalizedIdentity;
pub use arn::PrincipalKind;
pub use authenticator::Authenticate;
pub use authenticator::Authenticator;
pub use chain::build_chain;
pub use chain::AuthOutcome;
pub use chain::ChainDependencies;
pub use chain::MapperChain;
pub use config::AuthenticatorConfig;
pub use config::BackendMode;
pub use config::CrdConfig;
pub use config::InventoryConfig;
pub use config::MountedFileConfig;
pub use error::Error;
pub use error::ErrorClass;
pub use error::InventoryError;
pub use error::Result;
pub use inventory_cache::HttpInventoryClient;
pub use inventory_cache::InventoryCache;
pub use inventory_cache::InventoryClient;
pub use mapper::rule::MappingEntry;
pub use mapper::rule::MappingFile;
pub use mapper::AuthResult;
pub use mapper::Backend;
pub use resolver::Identity;
pub use resolver::IdentityResolver;
pub use token::TokenDescriptor;
pub use validator::ValidatedRequest;
pub use validator::Validator;
