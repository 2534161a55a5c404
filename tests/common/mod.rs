#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use iam_authenticator::mapper::crd::MappingSource;
use iam_authenticator::mapper::crd::NamedMapping;
use iam_authenticator::mapper::crd::SourceEvent;
use iam_authenticator::token;
use iam_authenticator::Identity;
use iam_authenticator::InventoryClient;
use iam_authenticator::InventoryError;
use iam_authenticator::MappingEntry;
use iam_authenticator::NormalizedIdentity;
use iam_authenticator::TokenDescriptor;
use mockito::Matcher;
use mockito::Mock;
use mockito::ServerGuard;
use serde_json::json;
use tokio::sync::mpsc;

pub const ACCOUNT: &str = "111122223333";
pub const CLUSTER_ID: &str = "prod";
pub const SIGNATURE: &str = "f1e2d3c4b5a69788796a5b4c3d2e1f00aabbccddeeff00112233445566778899";

/// Builder for presigned `GetCallerIdentity` tokens
pub struct TestToken {
    pub method: String,
    pub host: String,
    pub action: String,
    pub cluster_id: Option<String>,
    pub signed_headers: String,
    pub signed_at: DateTime<Utc>,
    pub expires: u32,
    pub signature: String,
}

impl TestToken {
    /// Token for this cluster signed just now
    pub fn valid() -> Self {
        Self {
            method: "GET".to_string(),
            host: "sts.amazonaws.com".to_string(),
            action: "GetCallerIdentity".to_string(),
            cluster_id: Some(CLUSTER_ID.to_string()),
            signed_headers: "host;x-k8s-aws-id".to_string(),
            signed_at: Utc::now(),
            expires: 60,
            signature: SIGNATURE.to_string(),
        }
    }

    pub fn cluster(mut self, cluster_id: &str) -> Self {
        self.cluster_id = Some(cluster_id.to_string());
        self
    }

    pub fn without_cluster(mut self) -> Self {
        self.cluster_id = None;
        self
    }

    pub fn signed_at(mut self, signed_at: DateTime<Utc>) -> Self {
        self.signed_at = signed_at;
        self
    }

    pub fn signature(mut self, signature: &str) -> Self {
        self.signature = signature.to_string();
        self
    }

    pub fn query(&self) -> String {
        format!(
            "Action={}&Version=2011-06-15&X-Amz-Algorithm=AWS4-HMAC-SHA256\
             &X-Amz-Credential=ASIAEXAMPLEKEY%2F{}%2Fus-east-1%2Fsts%2Faws4_request\
             &X-Amz-Date={}&X-Amz-Expires={}&X-Amz-SignedHeaders={}&X-Amz-Signature={}",
            self.action,
            self.signed_at.format("%Y%m%d"),
            self.signed_at.format("%Y%m%dT%H%M%SZ"),
            self.expires,
            self.signed_headers.replace(';', "%3B"),
            self.signature,
        )
    }

    pub fn descriptor(&self) -> TokenDescriptor {
        let url = format!("https://{}/?{}", self.host, self.query());
        let headers: Vec<(&str, &str)> = self
            .cluster_id
            .as_deref()
            .map(|id| vec![("x-k8s-aws-id", id)])
            .unwrap_or_default();
        TokenDescriptor::from_presigned_url(&self.method, &url, headers)
            .expect("Failed to build descriptor")
    }

    pub fn encode(&self) -> String {
        token::encode(&self.descriptor())
    }
}

/// Identity service response body for `arn`
pub fn caller_identity_body(arn: &str, user_id: &str) -> String {
    json!({
        "GetCallerIdentityResponse": {
            "GetCallerIdentityResult": {
                "Account": ACCOUNT,
                "Arn": arn,
                "UserId": user_id,
            },
            "ResponseMetadata": {
                "RequestId": "01234567-89ab-cdef-0123-456789abcdef",
            },
        }
    })
    .to_string()
}

/// Mock identity service answering presigned requests signed with [`SIGNATURE`]
pub async fn setup_mock_sts(arn: &str, expected_calls: usize) -> (ServerGuard, Mock) {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("Action".into(), "GetCallerIdentity".into()),
            Matcher::UrlEncoded("X-Amz-Signature".into(), SIGNATURE.into()),
        ]))
        .match_header("x-k8s-aws-id", CLUSTER_ID)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(caller_identity_body(arn, "AROAEXAMPLEID:session"))
        .expect(expected_calls)
        .create_async()
        .await;

    (server, mock)
}

/// Normalized identity for an assumed-role session
pub fn assumed_role(role: &str, session: &str) -> NormalizedIdentity {
    iam_authenticator::normalize(&Identity {
        account: ACCOUNT.to_string(),
        arn: format!("arn:aws:sts::{ACCOUNT}:assumed-role/{role}/{session}"),
        user_id: format!("AROAEXAMPLEID:{session}"),
        access_key_id: Some("ASIAEXAMPLEKEY".to_string()),
    })
    .expect("Failed to normalize assumed role")
}

/// Normalized identity for an IAM user
pub fn iam_user(name: &str) -> NormalizedIdentity {
    iam_authenticator::normalize(&Identity {
        account: ACCOUNT.to_string(),
        arn: format!("arn:aws:iam::{ACCOUNT}:user/{name}"),
        user_id: "AIDAEXAMPLEID".to_string(),
        access_key_id: None,
    })
    .expect("Failed to normalize IAM user")
}

pub fn upsert(name: &str, arn: &str, username: &str, groups: &[&str]) -> SourceEvent {
    SourceEvent::Upsert(NamedMapping {
        name: name.to_string(),
        entry: MappingEntry::new(arn, username, groups),
    })
}

type EventSender = mpsc::UnboundedSender<iam_authenticator::Result<SourceEvent>>;
type EventReceiver = mpsc::UnboundedReceiver<iam_authenticator::Result<SourceEvent>>;

/// Mapping source fed from test code.
///
/// Each call to `watch` consumes the next prepared stream; once none are left the
/// watch stays open without events.
#[derive(Default)]
pub struct ChannelSource {
    streams: Mutex<VecDeque<EventReceiver>>,
    watches: AtomicU32,
}

impl ChannelSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Prepare the stream returned by the next `watch` call
    pub fn next_stream(&self) -> EventSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    pub fn watch_count(&self) -> u32 {
        self.watches.load(Ordering::SeqCst)
    }
}

impl MappingSource for ChannelSource {
    fn watch(&self) -> BoxStream<'static, iam_authenticator::Result<SourceEvent>> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        match self.streams.lock().unwrap().pop_front() {
            Some(rx) => futures::stream::unfold(rx, |mut rx| async move {
                let event = rx.recv().await?;
                Some((event, rx))
            })
            .boxed(),
            None => futures::stream::pending().boxed(),
        }
    }
}

/// Inventory client with canned answers that counts its queries
pub struct CountingInventory {
    pub calls: AtomicU32,
    pub delay: Duration,
    pub fail: bool,
}

impl CountingInventory {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay,
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
            fail: true,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InventoryClient for CountingInventory {
    async fn private_dns_name(&self, instance_id: &str) -> Result<String, InventoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(InventoryError::Upstream("inventory offline".to_string()));
        }
        if instance_id.starts_with("i-dead") {
            return Err(InventoryError::NotFound(instance_id.to_string()));
        }
        Ok(format!("ip-10-0-0-1.{instance_id}.compute.internal"))
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
