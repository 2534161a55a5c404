//! Static validation of a decoded presigned request
//!
//! Everything here runs before any network call. A token that reaches the identity
//! service has:
//! 1. the `GET` method,
//! 2. an allowed identity-service host,
//! 3. the `GetCallerIdentity` action,
//! 4. a signing timestamp within the clock-skew window,
//! 5. a signed cluster ID header that names this cluster.
//!
//! The first violated check is reported.

use std::collections::HashSet;
use std::time::Duration;

use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;

use crate::config::AuthenticatorConfig;
use crate::error::Error;
use crate::error::Result;
use crate::token::TokenDescriptor;
use crate::token::CLUSTER_ID_HEADER;

const EXPECTED_METHOD: &str = "GET";
const EXPECTED_ACTION: &str = "GetCallerIdentity";
const GLOBAL_HOST: &str = "sts.amazonaws.com";
const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const MAX_EXPIRES_SECS: i64 = 15 * 60;

const PARAM_ACTION: &str = "Action";
const PARAM_CREDENTIAL: &str = "X-Amz-Credential";
const PARAM_DATE: &str = "X-Amz-Date";
const PARAM_EXPIRES: &str = "X-Amz-Expires";
const PARAM_SIGNATURE: &str = "X-Amz-Signature";
const PARAM_SIGNED_HEADERS: &str = "X-Amz-SignedHeaders";

const ALLOWED_PARAMS: [&str; 9] = [
    "action",
    "version",
    "x-amz-algorithm",
    "x-amz-credential",
    "x-amz-date",
    "x-amz-expires",
    "x-amz-security-token",
    "x-amz-signature",
    "x-amz-signedheaders",
];

/// A presigned request that passed every static check.
///
/// Only [`Validator::validate`] creates one. The descriptor inside is never modified.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    descriptor: TokenDescriptor,
    signed_at: DateTime<Utc>,
    validated_at: DateTime<Utc>,
    access_key_id: Option<String>,
}

impl ValidatedRequest {
    pub fn descriptor(&self) -> &TokenDescriptor {
        &self.descriptor
    }

    pub fn signed_at(&self) -> DateTime<Utc> {
        self.signed_at
    }

    pub fn validated_at(&self) -> DateTime<Utc> {
        self.validated_at
    }

    /// Access key ID from the credential scope
    pub fn access_key_id(&self) -> Option<&str> {
        self.access_key_id.as_deref()
    }
}

/// Validator bound to one cluster ID and host allow-list
#[derive(Debug, Clone)]
pub struct Validator {
    cluster_id: String,
    allowed_hosts: HashSet<String>,
    clock_skew: chrono::Duration,
}

impl Validator {
    /// A `clock_skew` beyond what a timestamp difference can express saturates to
    /// an unbounded window; [`AuthenticatorConfig::validate`] refuses such values.
    pub fn new(
        cluster_id: impl Into<String>,
        region: Option<&str>,
        extra_hosts: &[String],
        clock_skew: Duration,
    ) -> Self {
        let mut allowed_hosts = HashSet::new();
        allowed_hosts.insert(GLOBAL_HOST.to_string());
        if let Some(region) = region {
            let suffix = if region.starts_with("cn-") {
                "amazonaws.com.cn"
            } else {
                "amazonaws.com"
            };
            allowed_hosts.insert(format!("sts.{}.{suffix}", region.to_ascii_lowercase()));
        }
        allowed_hosts.extend(extra_hosts.iter().map(|h| h.to_ascii_lowercase()));

        Self {
            cluster_id: cluster_id.into(),
            allowed_hosts,
            clock_skew: chrono::Duration::from_std(clock_skew).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn from_config(config: &AuthenticatorConfig) -> Self {
        Self::new(
            config.cluster_id.clone(),
            config.region.as_deref(),
            &config.extra_hosts,
            config.clock_skew,
        )
    }

    /// Check a decoded token against this cluster at time `now`
    pub fn validate(
        &self,
        descriptor: TokenDescriptor,
        now: DateTime<Utc>,
    ) -> Result<ValidatedRequest> {
        if descriptor.method() != EXPECTED_METHOD {
            return Err(Error::UnexpectedMethod(descriptor.method().to_string()));
        }

        self.check_host(descriptor.host())?;
        if descriptor.path() != "/" {
            return Err(Error::malformed(format!(
                "unexpected path {}",
                descriptor.path()
            )));
        }

        let params = QueryParams::parse(descriptor.query())?;
        match params.get(PARAM_ACTION) {
            Some(EXPECTED_ACTION) => {}
            Some(other) => return Err(Error::UnexpectedAction(other.to_string())),
            None => return Err(Error::UnexpectedAction(String::new())),
        }

        let credential = params
            .get(PARAM_CREDENTIAL)
            .ok_or(Error::MissingParameter(PARAM_CREDENTIAL))?;
        params
            .get(PARAM_SIGNATURE)
            .filter(|s| !s.is_empty())
            .ok_or(Error::MissingParameter(PARAM_SIGNATURE))?;
        let signed_headers = params
            .get(PARAM_SIGNED_HEADERS)
            .ok_or(Error::MissingParameter(PARAM_SIGNED_HEADERS))?;

        let signed_at = self.check_timestamp(&params, now)?;
        self.check_cluster_header(&descriptor, signed_headers)?;

        let access_key_id = credential
            .split('/')
            .next()
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        Ok(ValidatedRequest {
            descriptor,
            signed_at,
            validated_at: now,
            access_key_id,
        })
    }

    fn check_host(&self, host: &str) -> Result<()> {
        if host.contains('@') || host.contains(':') {
            return Err(Error::InvalidHost(host.to_string()));
        }
        if !self.allowed_hosts.contains(&host.to_ascii_lowercase()) {
            return Err(Error::InvalidHost(host.to_string()));
        }
        Ok(())
    }

    fn check_timestamp(&self, params: &QueryParams, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let raw = params
            .get(PARAM_DATE)
            .ok_or(Error::MissingParameter(PARAM_DATE))?;
        let signed_at = NaiveDateTime::parse_from_str(raw, AMZ_DATE_FORMAT)
            .map_err(|_| Error::malformed(format!("invalid {PARAM_DATE}: {raw}")))?
            .and_utc();

        let drift = now.signed_duration_since(signed_at);
        if drift > self.clock_skew || drift < -self.clock_skew {
            return Err(Error::ExpiredSignature(signed_at.timestamp()));
        }

        if let Some(raw) = params.get(PARAM_EXPIRES) {
            let expires: i64 = raw
                .parse()
                .map_err(|_| Error::malformed(format!("invalid {PARAM_EXPIRES}: {raw}")))?;
            if !(0..=MAX_EXPIRES_SECS).contains(&expires) {
                return Err(Error::malformed(format!("{PARAM_EXPIRES} out of range: {raw}")));
            }
            if now > signed_at + chrono::Duration::seconds(expires) {
                return Err(Error::ExpiredSignature(signed_at.timestamp()));
            }
        }

        Ok(signed_at)
    }

    fn check_cluster_header(&self, descriptor: &TokenDescriptor, signed_headers: &str) -> Result<()> {
        let value = descriptor
            .header(CLUSTER_ID_HEADER)
            .ok_or(Error::MissingClusterHeader)?;
        if value != self.cluster_id {
            return Err(Error::ClusterMismatch(value.to_string()));
        }
        let signed = signed_headers
            .split(';')
            .any(|h| h.eq_ignore_ascii_case(CLUSTER_ID_HEADER));
        if !signed {
            return Err(Error::ClusterHeaderNotSigned);
        }
        Ok(())
    }
}

/// Decoded view of the raw query string. Used only for inspection; the raw query
/// is what gets forwarded.
struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    fn parse(raw: &str) -> Result<Self> {
        if let Some(c) = raw.chars().find(|c| !is_query_safe(*c)) {
            return Err(Error::malformed(format!(
                "query contains character {c:?} that is not URL-safe"
            )));
        }

        let mut pairs: Vec<(String, String)> = Vec::new();
        for (name, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            let lower = name.to_ascii_lowercase();
            if !ALLOWED_PARAMS.contains(&lower.as_str()) {
                return Err(Error::malformed(format!("query parameter {name} is not allowed")));
            }
            if pairs.iter().any(|(n, _)| n.eq_ignore_ascii_case(&name)) {
                return Err(Error::malformed(format!("query parameter {name} is repeated")));
            }
            pairs.push((name.into_owned(), value.into_owned()));
        }
        Ok(Self { pairs })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn is_query_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._~%&=+/;:*!$(),@".contains(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_rejects_unknown_parameters() {
        let result = QueryParams::parse("Action=GetCallerIdentity&Extra=1");
        assert!(matches!(result, Err(Error::MalformedToken(_))));
    }

    #[test]
    fn query_rejects_repeated_parameters() {
        let result = QueryParams::parse("Action=GetCallerIdentity&action=AssumeRole");
        assert!(matches!(result, Err(Error::MalformedToken(_))));
    }

    #[test]
    fn query_rejects_unsafe_characters() {
        for query in [
            "Action=Get Caller",
            "Action=GetCallerIdentity&Version=2011'06'15",
            "Action=GetCallerIdentity&Version=<2011>",
            "Action=GetCallerIdentity&Version=\"2011\"",
        ] {
            let result = QueryParams::parse(query);
            assert!(matches!(result, Err(Error::MalformedToken(_))), "{query}");
        }
        assert!(QueryParams::parse("Action=GetCallerIdentity&Version=2011-06-15").is_ok());
    }

    #[test]
    fn query_decodes_percent_encoding() {
        let params = QueryParams::parse("X-Amz-SignedHeaders=host%3Bx-k8s-aws-id").unwrap();
        assert_eq!(params.get("x-amz-signedheaders"), Some("host;x-k8s-aws-id"));
    }

    #[test]
    fn regional_hosts_follow_partition() {
        let v = Validator::new("prod", Some("cn-north-1"), &[], Duration::from_secs(60));
        assert!(v.check_host("sts.cn-north-1.amazonaws.com.cn").is_ok());
        assert!(v.check_host("STS.AMAZONAWS.COM").is_ok());
        assert!(v.check_host("sts.cn-north-1.amazonaws.com").is_err());
        assert!(v.check_host("sts.amazonaws.com:443").is_err());
        assert!(v.check_host("user@sts.amazonaws.com").is_err());
    }
}
