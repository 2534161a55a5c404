//! Mapping rules shared by every backend
//!
//! A rule pairs an ARN pattern with a username template and group templates:
//!
//! ```yaml
//! mappings:
//!   - arn: arn:aws:sts::111122223333:assumed-role/Developers/{{SessionName}}
//!     username: "{{SessionName}}"
//!     groups: [developers]
//!   - arn: arn:aws:iam::*:role/NodeInstanceRole
//!     username: "system:node:{{EC2PrivateDNSName}}"
//!     groups: [system:bootstrappers, system:nodes]
//! accounts: ["444455556666"]
//! ```
//!
//! Rules are evaluated in order and the first matching pattern wins. Principals of a
//! listed account that no rule matched map to their canonical ARN with no groups.
//! `{{EC2PrivateDNSName}}` is only rendered by the inventory backend; the other
//! backends refuse rules that use it.

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::arn::NormalizedIdentity;
use crate::arn::PrincipalKind;
use crate::error::Error;
use crate::error::Result;
use crate::mapper::AuthResult;

const SESSION_WILDCARD: &str = "{{SessionName}}";
const ACCOUNT_WILDCARD: &str = "{{AccountID}}";

/// Mapping entries as written in a mapping file or resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingFile {
    #[serde(default)]
    pub mappings: Vec<MappingEntry>,
    #[serde(default)]
    pub accounts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEntry {
    pub arn: String,
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl MappingEntry {
    pub fn new(arn: impl Into<String>, username: impl Into<String>, groups: &[&str]) -> Self {
        Self {
            arn: arn.into(),
            username: username.into(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }
}

impl MappingFile {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Any,
    Exact(String),
}

impl Segment {
    fn parse(raw: &str, wildcard: &str) -> Self {
        if raw == "*" || raw == wildcard {
            Segment::Any
        } else {
            Segment::Exact(raw.to_string())
        }
    }

    fn matches(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (Segment::Any, Some(_)) => true,
            (Segment::Exact(expected), Some(value)) => expected == value,
            (_, None) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PrincipalPattern {
    Root,
    User(String),
    Role { name: String, session: Segment },
    Federated(Segment),
}

/// Compiled principal ARN pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArnPattern {
    partition: String,
    account: Segment,
    principal: PrincipalPattern,
}

impl ArnPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |why: &str| Error::config(format!("invalid ARN pattern {raw}: {why}"));

        let parts: Vec<&str> = raw.trim().splitn(6, ':').collect();
        if parts.len() != 6 || parts[0] != "arn" || !parts[3].is_empty() {
            return Err(invalid("expected arn:<partition>:<service>::<account>:<resource>"));
        }
        let (partition, service, account, resource) = (parts[1], parts[2], parts[4], parts[5]);
        if partition.is_empty() || account.is_empty() {
            return Err(invalid("partition and account are required"));
        }

        let principal = match service {
            "iam" if resource == "root" => PrincipalPattern::Root,
            "iam" => {
                if let Some(role) = resource.strip_prefix("role/") {
                    // Assumed-role ARNs drop the role path, so only the name is compared.
                    let name = role.rsplit('/').next().unwrap_or_default();
                    if name.is_empty() {
                        return Err(invalid("empty role name"));
                    }
                    PrincipalPattern::Role {
                        name: name.to_string(),
                        session: Segment::Any,
                    }
                } else if let Some(user) = resource.strip_prefix("user/") {
                    if user.is_empty() {
                        return Err(invalid("empty user name"));
                    }
                    PrincipalPattern::User(user.to_string())
                } else {
                    return Err(invalid("unsupported iam resource"));
                }
            }
            "sts" => {
                if let Some(rest) = resource.strip_prefix("assumed-role/") {
                    let (role, session) = rest
                        .split_once('/')
                        .ok_or_else(|| invalid("assumed-role needs a session segment"))?;
                    if role.is_empty() || session.is_empty() || session.contains('/') {
                        return Err(invalid("malformed assumed-role resource"));
                    }
                    PrincipalPattern::Role {
                        name: role.to_string(),
                        session: Segment::parse(session, SESSION_WILDCARD),
                    }
                } else if let Some(user) = resource.strip_prefix("federated-user/") {
                    if user.is_empty() || user.contains('/') {
                        return Err(invalid("malformed federated-user resource"));
                    }
                    PrincipalPattern::Federated(Segment::parse(user, SESSION_WILDCARD))
                } else {
                    return Err(invalid("unsupported sts resource"));
                }
            }
            _ => return Err(invalid("service must be iam or sts")),
        };

        Ok(Self {
            partition: partition.to_string(),
            account: Segment::parse(account, ACCOUNT_WILDCARD),
            principal,
        })
    }

    pub fn matches(&self, identity: &NormalizedIdentity) -> bool {
        if self.partition != identity.partition
            || !self.account.matches(Some(identity.account_id.as_str()))
        {
            return false;
        }

        match (&self.principal, identity.kind) {
            (PrincipalPattern::Root, PrincipalKind::Root) => true,
            (PrincipalPattern::User(name), PrincipalKind::User) => identity
                .name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(name)),
            (PrincipalPattern::Role { name, session }, PrincipalKind::AssumedRole) => {
                identity
                    .name
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
                    && session.matches(identity.session_name.as_deref())
            }
            (PrincipalPattern::Federated(user), PrincipalKind::Federated) => {
                user.matches(identity.session_name.as_deref())
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variable {
    AccountId,
    SessionName,
    SessionNameRaw,
    AccessKeyId,
    Ec2PrivateDnsName,
}

impl Variable {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "AccountID" => Some(Variable::AccountId),
            "SessionName" => Some(Variable::SessionName),
            "SessionNameRaw" => Some(Variable::SessionNameRaw),
            "AccessKeyID" => Some(Variable::AccessKeyId),
            "EC2PrivateDNSName" => Some(Variable::Ec2PrivateDnsName),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Var(Variable),
}

/// Username or group template with `{{Variable}}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut rest = raw;
        while let Some(start) = rest.find("{{") {
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| Error::config(format!("unterminated placeholder in {raw}")))?;
            let name = after[..end].trim();
            let var = Variable::parse(name).ok_or_else(|| {
                Error::config(format!("unknown template variable {name} in {raw}"))
            })?;
            parts.push(Part::Var(var));
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Self { parts })
    }

    fn uses(&self, var: Variable) -> bool {
        self.parts.iter().any(|p| *p == Part::Var(var))
    }

    /// Render against an identity. `None` when a referenced value is unavailable.
    pub fn render(&self, identity: &NormalizedIdentity, tag: Option<&str>) -> Option<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Var(Variable::AccountId) => out.push_str(&identity.account_id),
                Part::Var(Variable::SessionName) => {
                    out.push_str(&identity.session_name.as_deref()?.replace('@', "-"))
                }
                Part::Var(Variable::SessionNameRaw) => {
                    out.push_str(identity.session_name.as_deref()?)
                }
                Part::Var(Variable::AccessKeyId) => {
                    out.push_str(identity.access_key_id.as_deref()?)
                }
                Part::Var(Variable::Ec2PrivateDnsName) => out.push_str(tag?),
            }
        }
        Some(out)
    }
}

/// One compiled mapping rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRule {
    source: String,
    pattern: ArnPattern,
    username: Template,
    groups: Vec<Template>,
}

impl MappingRule {
    pub fn compile(entry: &MappingEntry) -> Result<Self> {
        if entry.username.trim().is_empty() {
            return Err(Error::config(format!("mapping for {} has no username", entry.arn)));
        }
        Ok(Self {
            source: entry.arn.clone(),
            pattern: ArnPattern::parse(&entry.arn)?,
            username: Template::parse(&entry.username)?,
            groups: entry
                .groups
                .iter()
                .map(|g| Template::parse(g))
                .collect::<Result<_>>()?,
        })
    }

    /// Pattern this rule was compiled from
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, identity: &NormalizedIdentity) -> bool {
        self.pattern.matches(identity)
    }

    /// Whether rendering needs the inventory-attached private DNS name
    pub fn needs_inventory_tag(&self) -> bool {
        self.username.uses(Variable::Ec2PrivateDnsName)
            || self.groups.iter().any(|g| g.uses(Variable::Ec2PrivateDnsName))
    }

    pub fn render(&self, identity: &NormalizedIdentity, tag: Option<&str>) -> Option<AuthResult> {
        let username = self.username.render(identity, tag)?;
        let groups = self
            .groups
            .iter()
            .map(|g| g.render(identity, tag))
            .collect::<Option<Vec<_>>>()?;
        Some(AuthResult { username, groups })
    }
}

/// Outcome of searching a rule set
#[derive(Debug, Clone, Copy)]
pub enum RuleMatch<'a> {
    Rule(&'a MappingRule),
    /// Matched only through the `accounts` list
    Account,
}

impl RuleMatch<'_> {
    pub fn needs_inventory_tag(&self) -> bool {
        match self {
            RuleMatch::Rule(rule) => rule.needs_inventory_tag(),
            RuleMatch::Account => false,
        }
    }

    pub fn render(&self, identity: &NormalizedIdentity, tag: Option<&str>) -> Option<AuthResult> {
        match self {
            RuleMatch::Rule(rule) => rule.render(identity, tag),
            RuleMatch::Account => Some(AuthResult {
                username: identity.canonical_arn.clone(),
                groups: Vec::new(),
            }),
        }
    }
}

/// Ordered, immutable set of compiled rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<MappingRule>,
    accounts: Vec<String>,
}

impl RuleSet {
    pub fn new(rules: Vec<MappingRule>, accounts: Vec<String>) -> Self {
        Self { rules, accounts }
    }

    pub fn compile(file: &MappingFile) -> Result<Self> {
        let rules = file
            .mappings
            .iter()
            .map(MappingRule::compile)
            .collect::<Result<Vec<_>>>()?;
        for account in &file.accounts {
            if account.is_empty() || !account.chars().all(|c| c.is_ascii_digit()) {
                return Err(Error::config(format!("invalid account ID {account}")));
            }
        }
        Ok(Self::new(rules, file.accounts.clone()))
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.accounts.is_empty()
    }

    /// First rule whose pattern matches, falling back to the account list
    pub fn find(&self, identity: &NormalizedIdentity) -> Option<RuleMatch<'_>> {
        if let Some(rule) = self.rules.iter().find(|r| r.matches(identity)) {
            return Some(RuleMatch::Rule(rule));
        }
        if self.accounts.iter().any(|a| *a == identity.account_id) {
            return Some(RuleMatch::Account);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arn::normalize;
    use crate::resolver::Identity;

    fn identity(arn: &str) -> NormalizedIdentity {
        normalize(&Identity {
            account: "111122223333".to_string(),
            arn: arn.to_string(),
            user_id: "AIDAEXAMPLE".to_string(),
            access_key_id: Some("ASIAEXAMPLE".to_string()),
        })
        .unwrap()
    }

    fn rule(arn: &str, username: &str, groups: &[&str]) -> MappingRule {
        MappingRule::compile(&MappingEntry::new(arn, username, groups)).unwrap()
    }

    #[test]
    fn session_wildcard_substitutes_session_name() {
        let r = rule(
            "arn:aws:sts::111122223333:assumed-role/Developers/{{SessionName}}",
            "{{SessionName}}",
            &["developers"],
        );
        let id = identity("arn:aws:sts::111122223333:assumed-role/Developers/alice");
        assert!(r.matches(&id));
        let result = r.render(&id, None).unwrap();
        assert_eq!(result.username, "alice");
        assert_eq!(result.groups, vec!["developers"]);
    }

    #[test]
    fn session_name_replaces_at_sign() {
        let r = rule(
            "arn:aws:iam::111122223333:role/Developers",
            "dev:{{SessionName}}:{{SessionNameRaw}}",
            &[],
        );
        let id = identity("arn:aws:sts::111122223333:assumed-role/Developers/alice@example.com");
        let result = r.render(&id, None).unwrap();
        assert_eq!(result.username, "dev:alice-example.com:alice@example.com");
    }

    #[test]
    fn role_pattern_ignores_path_and_case() {
        let r = rule("arn:aws:iam::111122223333:role/teams/developers", "dev", &[]);
        assert!(r.matches(&identity(
            "arn:aws:sts::111122223333:assumed-role/Developers/bob"
        )));
    }

    #[test]
    fn exact_session_does_not_match_other_sessions() {
        let r = rule(
            "arn:aws:sts::111122223333:assumed-role/Developers/alice",
            "alice",
            &[],
        );
        assert!(!r.matches(&identity(
            "arn:aws:sts::111122223333:assumed-role/Developers/mallory"
        )));
    }

    #[test]
    fn account_wildcard_matches_any_account() {
        let r = rule("arn:aws:iam::*:user/ops/alice", "alice", &[]);
        assert!(r.matches(&identity("arn:aws:iam::111122223333:user/ops/alice")));
        assert!(!r.matches(&identity("arn:aws:iam::111122223333:user/alice")));
    }

    #[test]
    fn kinds_do_not_cross_match() {
        let r = rule("arn:aws:iam::111122223333:root", "root", &[]);
        assert!(r.matches(&identity("arn:aws:iam::111122223333:root")));
        assert!(!r.matches(&identity("arn:aws:iam::111122223333:user/root")));
    }

    #[test]
    fn unknown_template_variable_is_rejected() {
        let result = MappingRule::compile(&MappingEntry::new(
            "arn:aws:iam::111122223333:root",
            "{{Nope}}",
            &[],
        ));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn inventory_tag_is_required_when_referenced() {
        let r = rule(
            "arn:aws:iam::111122223333:role/Nodes",
            "system:node:{{EC2PrivateDNSName}}",
            &["system:nodes"],
        );
        let id = identity("arn:aws:sts::111122223333:assumed-role/Nodes/i-0123456789abcdef0");
        assert!(r.needs_inventory_tag());
        assert!(r.render(&id, None).is_none());
        assert_eq!(
            r.render(&id, Some("ip-10-0-0-1.ec2.internal")).unwrap().username,
            "system:node:ip-10-0-0-1.ec2.internal"
        );
    }

    #[test]
    fn accounts_list_is_a_fallback() {
        let set = RuleSet::compile(&MappingFile {
            mappings: vec![MappingEntry::new(
                "arn:aws:iam::111122223333:user/alice",
                "alice",
                &["admins"],
            )],
            accounts: vec!["111122223333".to_string()],
        })
        .unwrap();

        let alice = identity("arn:aws:iam::111122223333:user/alice");
        let bob = identity("arn:aws:iam::111122223333:user/bob");

        let hit = set.find(&alice).unwrap().render(&alice, None).unwrap();
        assert_eq!(hit.username, "alice");

        let fallback = set.find(&bob).unwrap().render(&bob, None).unwrap();
        assert_eq!(fallback.username, "arn:aws:iam::111122223333:user/bob");
        assert!(fallback.groups.is_empty());
    }
}
