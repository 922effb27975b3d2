use crate::types::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use serde_json::Value;

/// Result of classifying one inbound JSON-RPC frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Response(JsonRpcResponse),
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Malformed(Value),
}

/// Classifies a raw JSON value per the rules in §4.1: a response carries an
/// `id` and either `result` or `error`; a request carries `method` and `id`;
/// a notification carries `method` and no `id`; anything else is malformed.
pub fn classify(value: Value) -> Frame {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return Frame::Malformed(value),
    };

    let has_id = obj.contains_key("id");
    let has_method = obj.contains_key("method");
    let has_result_or_error = obj.contains_key("result") || obj.contains_key("error");

    if has_id && has_result_or_error && !has_method {
        match serde_json::from_value::<JsonRpcResponse>(value.clone()) {
            Ok(resp) => return Frame::Response(resp),
            Err(_) => return Frame::Malformed(value),
        }
    }

    if has_method && has_id {
        return match serde_json::from_value::<JsonRpcRequest>(value.clone()) {
            Ok(req) => Frame::Request(req),
            Err(_) => Frame::Malformed(value),
        };
    }

    if has_method && !has_id {
        return match serde_json::from_value::<JsonRpcNotification>(value.clone()) {
            Ok(note) => Frame::Notification(note),
            Err(_) => Frame::Malformed(value),
        };
    }

    Frame::Malformed(value)
}

pub fn encode(value: &impl serde::Serialize) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

pub fn decode(text: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn make_request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: Value::from(id),
        method: method.to_string(),
        params,
    }
}

pub fn make_notification(method: &str, params: Value) -> JsonRpcNotification {
    JsonRpcNotification {
        jsonrpc: "2.0".to_string(),
        method: method.to_string(),
        params,
    }
}

pub fn make_ok_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: Some(result),
        error: None,
    }
}

pub fn make_error_response(id: Value, code: i64, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.into(),
            data: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::error_code;
    use serde_json::json;

    #[test]
    fn classifies_response() {
        let v = json!({"jsonrpc":"2.0","id":1,"result":{"status":"ok"}});
        matches!(classify(v), Frame::Response(_));
    }

    #[test]
    fn classifies_request() {
        let v = json!({"jsonrpc":"2.0","id":1,"method":"runner/register","params":{}});
        match classify(v) {
            Frame::Request(r) => assert_eq!(r.method, "runner/register"),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn classifies_notification() {
        let v = json!({"jsonrpc":"2.0","method":"runner/heartbeat","params":{}});
        match classify(v) {
            Frame::Notification(n) => assert_eq!(n.method, "runner/heartbeat"),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn classifies_malformed() {
        let v = json!({"foo": "bar"});
        matches!(classify(v), Frame::Malformed(_));
    }

    #[test]
    fn encode_decode_round_trip() {
        let resp = make_error_response(Value::from(5), error_code::AUTH_FAILED, "bad token");
        let text = encode(&resp).unwrap();
        let back: Value = decode(&text).unwrap();
        match classify(back) {
            Frame::Response(r) => {
                assert_eq!(r.error.unwrap().code, error_code::AUTH_FAILED);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }
}
