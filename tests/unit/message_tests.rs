//! Unit tests for message classification and envelope encoding.

use agent_conduit::wire::message::{ProtocolRevision, RequestId, RpcErrorObject, RpcMessage};
use agent_conduit::AppError;
use serde_json::json;

#[test]
fn ids_may_be_integers_or_strings() {
    let int: RequestId = serde_json::from_value(json!(7)).expect("int id");
    let text: RequestId = serde_json::from_value(json!("srv-1")).expect("string id");
    assert_eq!(int, RequestId::Int(7));
    assert_eq!(text, RequestId::Str("srv-1".into()));
    assert_eq!(serde_json::to_value(&text).expect("encode"), json!("srv-1"));
}

#[test]
fn classify_distinguishes_all_three_shapes() {
    let request = RpcMessage::classify(json!({"id": "a", "method": "m", "params": {"x": 1}}))
        .expect("request");
    assert!(matches!(request, RpcMessage::Request { ref method, .. } if method == "m"));

    let notification =
        RpcMessage::classify(json!({"method": "turn/started", "params": {}})).expect("note");
    assert!(matches!(notification, RpcMessage::Notification { .. }));

    let response = RpcMessage::classify(json!({"id": 3, "result": {"ok": true}})).expect("resp");
    assert!(matches!(
        response,
        RpcMessage::Response { id: RequestId::Int(3), outcome: Ok(_) }
    ));

    let error = RpcMessage::classify(json!({"id": 4, "error": {"code": -32601, "message": "nope"}}))
        .expect("error response");
    match error {
        RpcMessage::Response {
            outcome: Err(err), ..
        } => assert_eq!(err.code, -32601),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn classify_rejects_wrong_shapes() {
    assert!(matches!(
        RpcMessage::classify(json!([1, 2])),
        Err(AppError::Protocol(_))
    ));
    assert!(matches!(
        RpcMessage::classify(json!({"id": 1})),
        Err(AppError::Protocol(_))
    ));
    assert!(matches!(
        RpcMessage::classify(json!({"id": {"nested": true}, "result": 1})),
        Err(AppError::Protocol(_))
    ));
}

#[test]
fn envelope_fields_come_from_the_revision() {
    let bare = ProtocolRevision::default();
    let msg = bare.request(&RequestId::Int(1), "initialize", None);
    assert!(msg.get("jsonrpc").is_none());

    let v2: ProtocolRevision =
        serde_json::from_value(json!({"jsonrpc": "2.0"})).expect("revision");
    let msg = v2.error_response(
        &RequestId::Str("s".into()),
        &RpcErrorObject::new(-32601, "method not found"),
    );
    assert_eq!(msg["jsonrpc"], "2.0");
    assert_eq!(msg["id"], "s");
    assert_eq!(msg["error"]["code"], -32601);
}
