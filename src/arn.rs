//! Principal ARN normalization
//!
//! The identity service reports the caller as one of four principal shapes:
//!
//! | Kind          | ARN                                                     |
//! |---------------|---------------------------------------------------------|
//! | root          | `arn:aws:iam::111122223333:root`                        |
//! | IAM user      | `arn:aws:iam::111122223333:user/[path/]alice`           |
//! | assumed role  | `arn:aws:sts::111122223333:assumed-role/Role/session`   |
//! | federated     | `arn:aws:sts::111122223333:federated-user/alice`        |
//!
//! [`normalize`] classifies the principal, extracts the session name and produces the
//! canonical ARN used for display and the `accounts` fallback mapping. Assumed-role
//! principals canonicalize to the IAM role they were assumed from.

use crate::error::Error;
use crate::error::Result;
use crate::resolver::Identity;

/// Structural kind of a principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrincipalKind {
    Root,
    User,
    AssumedRole,
    Federated,
}

/// Identity classified by principal kind. Derived only through [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIdentity {
    pub kind: PrincipalKind,
    /// ARN partition, e.g. `aws` or `aws-cn`
    pub partition: String,
    pub account_id: String,
    /// Role name for assumed roles, user name (with path) for IAM users, federated user name
    pub name: Option<String>,
    /// Session name of an assumed role or federated user
    pub session_name: Option<String>,
    /// ARN with session-specific parts removed
    pub canonical_arn: String,
    /// ARN as reported by the identity service
    pub arn: String,
    pub user_id: String,
    pub access_key_id: Option<String>,
}

/// Classify a resolved identity.
///
/// Deterministic: the same identity always yields the same result. Fails with
/// [`Error::UnrecognizedPrincipal`] for shapes outside the four kinds or when the ARN's
/// account differs from the reported account.
pub fn normalize(identity: &Identity) -> Result<NormalizedIdentity> {
    let arn = identity.arn.as_str();
    let unrecognized = || Error::UnrecognizedPrincipal(arn.to_string());

    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    if parts.len() != 6 || parts[0] != "arn" || !parts[3].is_empty() {
        return Err(unrecognized());
    }
    let (partition, service, account, resource) = (parts[1], parts[2], parts[4], parts[5]);

    if partition.is_empty() || account.is_empty() || account != identity.account {
        return Err(unrecognized());
    }

    let (kind, name, session_name, canonical_arn) = match service {
        "iam" if resource == "root" => (PrincipalKind::Root, None, None, arn.to_string()),
        "iam" => {
            let user = resource.strip_prefix("user/").ok_or_else(unrecognized)?;
            if user.is_empty() || user.split('/').any(str::is_empty) {
                return Err(unrecognized());
            }
            (
                PrincipalKind::User,
                Some(user.to_string()),
                None,
                arn.to_string(),
            )
        }
        "sts" => {
            if let Some(rest) = resource.strip_prefix("assumed-role/") {
                let (role, session) = rest.split_once('/').ok_or_else(unrecognized)?;
                if role.is_empty() || session.is_empty() || session.contains('/') {
                    return Err(unrecognized());
                }
                (
                    PrincipalKind::AssumedRole,
                    Some(role.to_string()),
                    Some(session.to_string()),
                    format!("arn:{partition}:iam::{account}:role/{role}"),
                )
            } else if let Some(user) = resource.strip_prefix("federated-user/") {
                if user.is_empty() || user.contains('/') {
                    return Err(unrecognized());
                }
                (
                    PrincipalKind::Federated,
                    Some(user.to_string()),
                    Some(user.to_string()),
                    arn.to_string(),
                )
            } else {
                return Err(unrecognized());
            }
        }
        _ => return Err(unrecognized()),
    };

    Ok(NormalizedIdentity {
        kind,
        partition: partition.to_string(),
        account_id: account.to_string(),
        name,
        session_name,
        canonical_arn,
        arn: arn.to_string(),
        user_id: identity.user_id.clone(),
        access_key_id: identity.access_key_id.clone(),
    })
}
