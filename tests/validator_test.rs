mod common;

use std::time::Duration;

use chrono::Utc;
use iam_authenticator::token;
use iam_authenticator::{Error, Validator};

use common::{TestToken, CLUSTER_ID};

fn validator() -> Validator {
    Validator::new(CLUSTER_ID, Some("eu-west-1"), &[], Duration::from_secs(60))
}

#[test]
fn decoded_token_validates() {
    let now = Utc::now();
    let encoded = TestToken::valid().signed_at(now).encode();

    let descriptor = token::decode(&encoded).unwrap();
    assert_eq!(descriptor.header("X-K8S-AWS-ID"), Some(CLUSTER_ID));

    let request = validator().validate(descriptor.clone(), now).unwrap();
    assert_eq!(request.descriptor(), &descriptor);
    assert_eq!(request.access_key_id(), Some("ASIAEXAMPLEKEY"));
    assert_eq!(request.validated_at(), now);
    assert_eq!(request.signed_at().timestamp(), now.timestamp());
}

#[test]
fn raw_query_survives_decoding() {
    let token = TestToken::valid();
    let descriptor = token::decode(&token.encode()).unwrap();

    assert_eq!(descriptor.query(), token.query());
    assert!(descriptor.query().contains("X-Amz-SignedHeaders=host%3Bx-k8s-aws-id"));
}

#[test]
fn timestamp_must_fall_inside_skew_window() {
    let now = Utc::now();
    let validate = |offset: i64| {
        let descriptor = TestToken::valid()
            .signed_at(now - chrono::Duration::seconds(offset))
            .descriptor();
        validator().validate(descriptor, now)
    };

    assert!(validate(30).is_ok());
    assert!(matches!(validate(120), Err(Error::ExpiredSignature(_))));
    assert!(matches!(validate(-120), Err(Error::ExpiredSignature(_))));
}

#[test]
fn expired_presign_window_is_rejected() {
    let now = Utc::now();
    let mut token = TestToken::valid().signed_at(now - chrono::Duration::seconds(45));
    token.expires = 30;

    let result = validator().validate(token.descriptor(), now);
    assert!(matches!(result, Err(Error::ExpiredSignature(_))));
}

#[test]
fn regional_and_extra_hosts_are_accepted() {
    let now = Utc::now();
    let validator = Validator::new(
        CLUSTER_ID,
        Some("eu-west-1"),
        &["sts.internal.example".to_string()],
        Duration::from_secs(60),
    );

    for host in ["sts.amazonaws.com", "sts.eu-west-1.amazonaws.com", "sts.internal.example"] {
        let mut token = TestToken::valid().signed_at(now);
        token.host = host.to_string();
        assert!(validator.validate(token.descriptor(), now).is_ok(), "{host}");
    }

    for host in [
        "sts.us-east-2.amazonaws.com",
        "sts.amazonaws.com:8443",
        "user@sts.amazonaws.com",
        "sts.amazonaws.com.cn",
    ] {
        let mut token = TestToken::valid().signed_at(now);
        token.host = host.to_string();
        let result = validator.validate(token.descriptor(), now);
        assert!(matches!(result, Err(Error::InvalidHost(_))), "{host}");
    }
}

#[test]
fn cluster_checks_run_in_order() {
    let now = Utc::now();

    let result = validator().validate(TestToken::valid().without_cluster().descriptor(), now);
    assert!(matches!(result, Err(Error::MissingClusterHeader)));

    let result = validator().validate(TestToken::valid().cluster("staging").descriptor(), now);
    assert!(matches!(result, Err(Error::ClusterMismatch(_))));

    let mut unsigned = TestToken::valid();
    unsigned.signed_headers = "host".to_string();
    let result = validator().validate(unsigned.descriptor(), now);
    assert!(matches!(result, Err(Error::ClusterHeaderNotSigned)));
}

#[test]
fn non_get_method_is_rejected() {
    let mut token = TestToken::valid();
    token.method = "POST".to_string();

    let result = validator().validate(token.descriptor(), Utc::now());
    assert!(matches!(result, Err(Error::UnexpectedMethod(_))));
}

#[test]
fn padded_tokens_are_rejected() {
    let encoded = format!("{}=", TestToken::valid().encode());
    assert!(matches!(token::decode(&encoded), Err(Error::MalformedToken(_))));
}

#[test]
fn encoded_tokens_decode_to_the_same_descriptor() {
    let now = Utc::now();
    for token in [
        TestToken::valid().signed_at(now),
        TestToken::valid().without_cluster(),
        TestToken::valid().cluster("cluster:with:colons"),
    ] {
        let descriptor = token.descriptor();
        let decoded = token::decode(&token::encode(&descriptor)).unwrap();
        assert_eq!(decoded, descriptor);
        assert_eq!(decoded.url(), descriptor.url());
    }
}

#[test]
fn oversized_skew_widens_the_window() {
    let now = Utc::now();
    let validator = Validator::new(CLUSTER_ID, None, &[], Duration::from_secs(u64::MAX));

    let mut token = TestToken::valid().signed_at(now - chrono::Duration::minutes(10));
    token.expires = 900;
    assert!(validator.validate(token.descriptor(), now).is_ok());

    let mut token = TestToken::valid().signed_at(now + chrono::Duration::days(3650));
    token.expires = 900;
    assert!(validator.validate(token.descriptor(), now).is_ok());
}
