use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use reqwest::header::ACCEPT;
use reqwest::header::HOST;
use reqwest::Client;
use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

use crate::config::AuthenticatorConfig;
use crate::error::identity_body_error;
use crate::error::identity_request_error;
use crate::error::Error;
use crate::error::Result;
use crate::validator::ValidatedRequest;

/// Authoritative caller identity reported by the identity service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub account: String,
    pub arn: String,
    /// Caller-unique identifier, e.g. `AROAEXAMPLE:session`
    pub user_id: String,
    /// Access key that signed the request, taken from its credential scope
    pub access_key_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentityEnvelope {
    get_caller_identity_response: Option<CallerIdentityResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentityResponse {
    get_caller_identity_result: Option<CallerIdentityResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentityResult {
    account: Option<String>,
    arn: Option<String>,
    user_id: Option<String>,
}

/// Executes validated presigned requests against the identity service.
///
/// Requests are forwarded once, never retried, and bounded by the client timeout.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    client: Client,
    endpoint: Option<String>,
}

impl IdentityResolver {
    /// Create a resolver whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::config(format!("failed to build identity client: {e}")))?;
        Ok(Self {
            client,
            endpoint: None,
        })
    }

    pub fn from_config(config: &AuthenticatorConfig) -> Result<Self> {
        let resolver = Self::new(config.identity_timeout)?;
        Ok(match &config.identity_endpoint {
            Some(endpoint) => resolver.with_endpoint(endpoint.clone()),
            None => resolver,
        })
    }

    /// Use a custom HTTP client
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Send requests to `endpoint` instead of the token's host. The signed `Host`
    /// header is still sent unchanged.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    /// Forward the signed request and parse the caller identity
    pub async fn resolve(&self, request: &ValidatedRequest) -> Result<Identity> {
        let descriptor = request.descriptor();
        let base = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://{}", descriptor.host()),
        };
        let url = if descriptor.query().is_empty() {
            format!("{base}{}", descriptor.path())
        } else {
            format!("{base}{}?{}", descriptor.path(), descriptor.query())
        };

        let mut headers = HeaderMap::new();
        for (name, value) in descriptor.headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::malformed(format!("invalid header name {name}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::malformed(format!("invalid value for header {name}")))?;
            headers.insert(name, value);
        }
        if self.endpoint.is_some() {
            let host = HeaderValue::from_str(descriptor.host())
                .map_err(|_| Error::InvalidHost(descriptor.host().to_string()))?;
            headers.insert(HOST, host);
        }
        // Signed Accept headers are forwarded unchanged.
        headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("application/json"));

        let method = Method::from_bytes(descriptor.method().as_bytes())
            .map_err(|_| Error::UnexpectedMethod(descriptor.method().to_string()))?;

        debug!(host = %descriptor.host(), "Forwarding presigned request to identity service");
        let response = self
            .client
            .request(method, &url)
            .headers(headers)
            .send()
            .await
            .map_err(identity_request_error)?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "Identity service rejected presigned request");
            return Err(Error::UpstreamRejected(status.as_u16()));
        }

        let body = response.bytes().await.map_err(identity_body_error)?;
        let mut identity = parse_identity(&body)?;
        identity.access_key_id = request.access_key_id().map(str::to_string);
        Ok(identity)
    }
}

fn parse_identity(body: &[u8]) -> Result<Identity> {
    let envelope: CallerIdentityEnvelope = serde_json::from_slice(body)
        .map_err(|e| Error::MalformedResponse(format!("invalid JSON: {e}")))?;

    let result = envelope
        .get_caller_identity_response
        .and_then(|r| r.get_caller_identity_result)
        .ok_or_else(|| Error::MalformedResponse("missing GetCallerIdentityResult".into()))?;

    let field = |value: Option<String>, name: &str| {
        value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::MalformedResponse(format!("missing {name}")))
    };

    Ok(Identity {
        account: field(result.account, "Account")?,
        arn: field(result.arn, "Arn")?,
        user_id: field(result.user_id, "UserId")?,
        access_key_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_caller_identity_envelope() {
        let body = br#"{"GetCallerIdentityResponse":{"GetCallerIdentityResult":{
            "Account":"111122223333",
            "Arn":"arn:aws:sts::111122223333:assumed-role/Developers/alice",
            "UserId":"AROAEXAMPLE:alice"},
            "ResponseMetadata":{"RequestId":"abc"}}}"#;
        let identity = parse_identity(body).unwrap();
        assert_eq!(identity.account, "111122223333");
        assert_eq!(identity.user_id, "AROAEXAMPLE:alice");
    }

    #[test]
    fn missing_fields_are_malformed() {
        let body = br#"{"GetCallerIdentityResponse":{"GetCallerIdentityResult":{
            "Account":"111122223333","UserId":"AROAEXAMPLE:alice"}}}"#;
        assert!(matches!(
            parse_identity(body),
            Err(Error::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_identity(b"<xml/>"),
            Err(Error::MalformedResponse(_))
        ));
    }
}
