//! Bearer token codec
//!
//! A token is the literal prefix `k8s-aws-v1.` followed by the unpadded base64url
//! encoding of a presigned request:
//!
//! ```text
//! GET https://sts.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15&X-Amz-...
//! x-k8s-aws-id: my-cluster
//! ```
//!
//! The first line is the request line; each following line is one header.
//! The query string is kept exactly as it appeared in the token.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::Error;
use crate::error::Result;

/// Literal prefix identifying the token scheme and version.
pub const TOKEN_PREFIX: &str = "k8s-aws-v1.";

/// Header carrying the cluster the token was issued for.
pub const CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";

const HTTPS_SCHEME: &str = "https://";

/// Decoded form of a bearer token.
///
/// Every field is part of the signed material and is never rewritten after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDescriptor {
    method: String,
    host: String,
    path: String,
    query: String,
    headers: Vec<(String, String)>,
}

impl TokenDescriptor {
    /// Build a descriptor from a presigned URL and the headers that were signed with it.
    ///
    /// Header names are lowercased; duplicate names are rejected.
    pub fn from_presigned_url<I, K, V>(method: &str, url: &str, headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        if method.is_empty() || method.contains(char::is_whitespace) {
            return Err(Error::malformed("invalid request method"));
        }

        let (host, path, query) = split_url(url)?;

        let mut descriptor = Self {
            method: method.to_string(),
            host,
            path,
            query,
            headers: Vec::new(),
        };
        for (name, value) in headers {
            descriptor.push_header(name.as_ref(), value.as_ref())?;
        }

        Ok(descriptor)
    }

    fn push_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() || !name.chars().all(is_token_char) {
            return Err(Error::malformed(format!("invalid header name {name:?}")));
        }
        if value.contains('\n') || value.contains('\r') {
            return Err(Error::malformed(format!("header {name} spans lines")));
        }
        if self.header(&name).is_some() {
            return Err(Error::malformed(format!("duplicate header {name}")));
        }
        self.headers.push((name, value.trim().to_string()));
        Ok(())
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Host including any port or userinfo exactly as written in the token.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string without the leading `?`.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Headers in token order, names lowercased.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Look up a header value by its case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The presigned URL this descriptor was built from.
    pub fn url(&self) -> String {
        if self.query.is_empty() {
            format!("{HTTPS_SCHEME}{}{}", self.host, self.path)
        } else {
            format!("{HTTPS_SCHEME}{}{}?{}", self.host, self.path, self.query)
        }
    }
}

/// Decode a bearer token into its presigned request descriptor.
pub fn decode(token: &str) -> Result<TokenDescriptor> {
    let payload = token
        .strip_prefix(TOKEN_PREFIX)
        .ok_or_else(|| Error::malformed("missing k8s-aws-v1 prefix"))?;

    if payload.contains('=') {
        return Err(Error::malformed("padding is not permitted"));
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::malformed(format!("invalid base64url payload: {e}")))?;
    let text =
        String::from_utf8(bytes).map_err(|_| Error::malformed("payload is not valid UTF-8"))?;

    let mut lines = text.split('\n');
    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::malformed("missing request line"))?;
    let (method, url) = request_line
        .split_once(' ')
        .ok_or_else(|| Error::malformed("request line must be '<METHOD> <URL>'"))?;

    let mut descriptor = TokenDescriptor::from_presigned_url(method, url, Vec::<(&str, &str)>::new())?;
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::malformed("header line must be 'name: value'"))?;
        descriptor.push_header(name, value)?;
    }

    Ok(descriptor)
}

/// Encode a descriptor into a bearer token. Used by token-issuing tooling.
pub fn encode(descriptor: &TokenDescriptor) -> String {
    let mut text = format!("{} {}", descriptor.method, descriptor.url());
    for (name, value) in &descriptor.headers {
        text.push('\n');
        text.push_str(name);
        text.push_str(": ");
        text.push_str(value);
    }
    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(text.as_bytes()))
}

/// Characters allowed in an HTTP header field name (RFC 9110 `tchar`).
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

/// Split an absolute https URL into host, path and raw query.
fn split_url(url: &str) -> Result<(String, String, String)> {
    let rest = url
        .strip_prefix(HTTPS_SCHEME)
        .ok_or_else(|| Error::malformed("presigned URL must use https"))?;

    if rest.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::malformed("presigned URL contains whitespace"));
    }
    if rest.contains('#') {
        return Err(Error::malformed("presigned URL must not carry a fragment"));
    }

    let (before_query, query) = match rest.split_once('?') {
        Some((b, q)) => (b, q),
        None => (rest, ""),
    };
    let (host, path) = match before_query.find('/') {
        Some(idx) => before_query.split_at(idx),
        None => (before_query, "/"),
    };

    if host.is_empty() {
        return Err(Error::malformed("presigned URL has no host"));
    }

    Ok((host.to_string(), path.to_string(), query.to_string()))
}
