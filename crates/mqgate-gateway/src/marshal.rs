//! Default reply body: `{"Trace": ..., "Result": ..., "Error": ...}`.

use bytes::Bytes;
use mqgate_core::TraceId;
use serde_json::{Value, json};

use crate::hooks::ResultMarshaler;

/// JSON result marshaler.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonResultMarshaler;

impl ResultMarshaler for JsonResultMarshaler {
    fn marshal(
        &self,
        trace_id: &TraceId,
        result: Option<&Value>,
        error: &str,
    ) -> Result<Bytes, String> {
        let body = json!({
            "Trace": trace_id.as_str(),
            "Result": result.cloned().unwrap_or(Value::Null),
            "Error": error,
        });
        serde_json::to_vec(&body)
            .map(Bytes::from)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_has_empty_error() {
        let trace = TraceId::from("t-1");
        let bytes = JsonResultMarshaler
            .marshal(&trace, Some(&json!({"pong": 1})), "")
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"Trace": "t-1", "Result": {"pong": 1}, "Error": ""}));
    }

    #[test]
    fn failure_has_null_result() {
        let trace = TraceId::from("t-2");
        let bytes = JsonResultMarshaler.marshal(&trace, None, "boom").unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["Result"], Value::Null);
        assert_eq!(value["Error"], "boom");
    }
}
