//! Unit tests for error display and retry classification.

use std::time::Duration;

use agent_conduit::errors::ErrorClass;
use agent_conduit::rpc::rpc_error;
use agent_conduit::wire::message::RpcErrorObject;
use agent_conduit::AppError;
use serde_json::json;

#[test]
fn display_prefixes_variant() {
    assert_eq!(
        AppError::TransportClosed("agent exited".into()).to_string(),
        "transport closed: agent exited"
    );
    assert_eq!(
        AppError::Rpc {
            code: -32601,
            message: "method not found".into(),
            data: None
        }
        .to_string(),
        "rpc: method not found (code -32601)"
    );
    assert_eq!(
        AppError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(2))
        }
        .to_string(),
        "rate limited: slow down (retry after 2s)"
    );
}

#[test]
fn classification() {
    assert_eq!(
        AppError::Timeout("t".into()).class(),
        ErrorClass::Retryable
    );
    assert_eq!(
        AppError::TransportClosed("c".into()).class(),
        ErrorClass::Retryable
    );
    assert_eq!(AppError::Config("c".into()).class(), ErrorClass::Fatal);
    assert_eq!(AppError::Cancelled("c".into()).class(), ErrorClass::Fatal);
    assert_eq!(
        AppError::RateLimited {
            message: "m".into(),
            retry_after: None
        }
        .class(),
        ErrorClass::RateLimited
    );
    assert_eq!(
        rpc_error(RpcErrorObject::new(-32603, "internal")).class(),
        ErrorClass::Retryable
    );
    assert_eq!(
        rpc_error(RpcErrorObject::new(-32602, "bad params")).class(),
        ErrorClass::Fatal
    );
}

#[test]
fn rate_limit_detected_from_error_data() {
    let err = rpc_error(RpcErrorObject {
        code: -32001,
        message: "request failed".into(),
        data: Some(json!({"codexErrorInfo": "usageLimitExceeded", "retryAfterSeconds": 7})),
    });
    match err {
        AppError::RateLimited { retry_after, .. } => {
            assert_eq!(retry_after, Some(Duration::from_secs(7)));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn conversions() {
    let io: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
    assert!(matches!(io, AppError::Io(_)));
    assert_eq!(io.class(), ErrorClass::Retryable);

    let json_err = serde_json::from_str::<serde_json::Value>("{").expect_err("bad json");
    assert!(matches!(AppError::from(json_err), AppError::Decode(_)));

    assert!(AppError::TransportClosed("x".into()).is_transport_closed());
    assert!(!AppError::Timeout("x".into()).is_transport_closed());
}
