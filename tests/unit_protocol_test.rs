use nexus::core::protocol::{Envelope, RETCODE_NO_TARGET, RETCODE_TIMEOUT, failed_response};
use serde_json::json;

#[tokio::test]
async fn test_parse_rejects_invalid_json() {
    let err = Envelope::parse("not json").unwrap_err();
    assert!(format!("{err}").contains("invalid JSON"));
}

#[tokio::test]
async fn test_parse_rejects_non_object() {
    let err = Envelope::parse("[1, 2, 3]").unwrap_err();
    assert!(format!("{err}").contains("JSON object"));
}

#[tokio::test]
async fn test_event_fields() {
    let env = Envelope::parse(
        r#"{"post_type":"message","message_type":"group","self_id":100,"user_id":200,"group_id":300}"#,
    )
    .unwrap();
    assert_eq!(env.post_type(), Some("message"));
    assert_eq!(env.message_type(), Some("group"));
    assert_eq!(env.self_id().as_deref(), Some("100"));
    assert_eq!(env.user_id().as_deref(), Some("200"));
    assert_eq!(env.group_id().as_deref(), Some("300"));
    assert!(!env.is_api_request());
    assert!(!env.is_api_response());
}

#[tokio::test]
async fn test_id_normalization_preserves_large_numbers() {
    // Ids can exceed 2^53 and must not be rounded through a float.
    let env = Envelope::parse(r#"{"self_id":9223372036854775807}"#).unwrap();
    assert_eq!(env.self_id().as_deref(), Some("9223372036854775807"));

    let env = Envelope::parse(r#"{"self_id":"abc-123"}"#).unwrap();
    assert_eq!(env.self_id().as_deref(), Some("abc-123"));
}

#[tokio::test]
async fn test_api_request_detection() {
    let env = Envelope::parse(r#"{"action":"send_msg","params":{},"echo":"tok1"}"#).unwrap();
    assert!(env.is_api_request());
    assert!(!env.is_api_response());
    assert_eq!(env.action(), Some("send_msg"));
    assert_eq!(env.echo().as_deref(), Some("tok1"));
}

#[tokio::test]
async fn test_api_response_detection() {
    let env = Envelope::parse(r#"{"status":"ok","retcode":0,"echo":"tok1"}"#).unwrap();
    assert!(env.is_api_response());
    assert!(!env.is_api_request());

    // An event that happens to carry an echo field is still an event.
    let env = Envelope::parse(r#"{"post_type":"message","echo":"tok1"}"#).unwrap();
    assert!(!env.is_api_response());
}

#[tokio::test]
async fn test_numeric_echo_token() {
    let env = Envelope::parse(r#"{"status":"ok","echo":42}"#).unwrap();
    assert_eq!(env.echo().as_deref(), Some("42"));
}

#[tokio::test]
async fn test_round_trip_preserves_unknown_fields() {
    let raw = r#"{"post_type":"message","platform_blob":{"x":[1,2,3]}}"#;
    let env = Envelope::parse(raw).unwrap();
    let reparsed: serde_json::Value = serde_json::from_str(&env.to_frame()).unwrap();
    assert_eq!(reparsed["platform_blob"]["x"], json!([1, 2, 3]));
}

#[tokio::test]
async fn test_failed_response_shape() {
    let frame = failed_response("tok9", RETCODE_NO_TARGET, "no live bot").to_frame();
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["status"], "failed");
    assert_eq!(value["retcode"], 1404);
    assert_eq!(value["echo"], "tok9");

    let frame = failed_response("tok9", RETCODE_TIMEOUT, "timed out").to_frame();
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["retcode"], 1408);
}

#[tokio::test]
async fn test_meta_control_frame() {
    let env = Envelope::parse(r#"{"meta":"register","capabilities":{"skills":["echo"]}}"#).unwrap();
    assert_eq!(env.meta(), Some("register"));
}
