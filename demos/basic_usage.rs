use std::sync::Arc;
use std::time::Duration;

use iam_authenticator::mapper::crd::KubeMappingSource;
use iam_authenticator::Authenticate;
use iam_authenticator::AuthOutcome;
use iam_authenticator::Authenticator;
use iam_authenticator::AuthenticatorConfig;
use iam_authenticator::BackendMode;
use iam_authenticator::ChainDependencies;
use iam_authenticator::MappingEntry;
use iam_authenticator::MappingFile;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

async fn report(authenticator: &Authenticator, token: &str) {
    match authenticator.authenticate(token, chrono::Utc::now()).await {
        Ok(AuthOutcome::Authenticated(user)) => {
            println!("✓ Token authenticated");
            println!("  Username: {}", user.username);
            println!("  Groups: {:?}", user.groups);
        }
        Ok(AuthOutcome::Unauthenticated) => {
            println!("✗ Valid identity without a mapping");
        }
        Err(e) => {
            eprintln!("✗ Authentication failed ({:?}): {}", e.class(), e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cancel = CancellationToken::new();

    // Placeholder; produce a real token with a presigned GetCallerIdentity request.
    let token = "k8s-aws-v1.R0VUIGh0dHBzOi8vc3RzLmFtYXpvbmF3cy5jb20vP0FjdGlvbj1HZXRDYWxsZXJJZGVudGl0eQ";

    // Example 1: Inline mappings
    println!("=== Example 1: Inline Mappings ===");
    let config = AuthenticatorConfig::new("prod")
        .with_region("eu-west-1")
        .with_mappings(MappingFile {
            mappings: vec![MappingEntry::new(
                "arn:aws:iam::111122223333:role/Developers",
                "dev:{{SessionName}}",
                &["developers"],
            )],
            accounts: vec!["444455556666".to_string()],
        });

    let authenticator = Authenticator::from_config(&config, ChainDependencies::default())?;
    authenticator.start(cancel.child_token()).await?;
    report(&authenticator, token).await;

    println!();

    // Example 2: Configuration file
    println!("=== Example 2: Configuration File ===");
    match AuthenticatorConfig::from_yaml_file("authenticator.yaml") {
        Ok(config) => {
            let authenticator = Authenticator::from_config(&config, ChainDependencies::default())?;
            authenticator.start(cancel.child_token()).await?;
            report(&authenticator, token).await;
        }
        Err(e) => eprintln!("✗ Could not load authenticator.yaml: {}", e),
    }

    println!();

    // Example 3: Static mappings first, then IAMIdentityMapping resources
    println!("=== Example 3: Mapping Resources ===");
    let source = KubeMappingSource::try_default().await?;
    let config = AuthenticatorConfig::new("prod")
        .with_backend_modes(vec![BackendMode::MountedFile, BackendMode::Crd])
        .with_mapping_file("/etc/iam-authenticator/mappings.yaml")
        .with_crd_initial_sync_timeout(Duration::from_secs(10));
    let deps = ChainDependencies {
        mapping_source: Some(Arc::new(source)),
        inventory_client: None,
    };

    let authenticator = Authenticator::from_config(&config, deps)?;
    authenticator.start(cancel.child_token()).await?;
    report(&authenticator, token).await;

    cancel.cancel();
    Ok(())
}
