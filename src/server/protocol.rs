//! RPC Protocol Types
//!
//! Defines the JSON frames exchanged over the WebSocket and the typed
//! parameter/result payloads for each method. Every frame is a single
//! JSON object on a text message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::filter::Filter;
use crate::types::Symbol;

/// Default preview page size for `materializeSymbol`.
pub const DEFAULT_PAGE_SIZE: u64 = 1000;

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Client → server method invocation.
    #[serde(rename_all = "camelCase")]
    Request {
        /// Echoed back verbatim on the matching response.
        request_id: Value,
        method: String,
        #[serde(default)]
        params: Value,
    },

    /// Server → client completion of one request.
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },

    /// Server → client asynchronous notification.
    Event { event: String, data: Value },
}

impl Frame {
    pub fn response_ok(request_id: Value, result: Value) -> Self {
        Frame::Response {
            request_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn response_err(request_id: Value, error: RpcError) -> Self {
        Frame::Response {
            request_id,
            result: None,
            error: Some(error),
        }
    }
}

/// Encode a frame as a single-line JSON text message.
pub fn encode_frame(frame: &Frame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|e| {
        format!(
            r#"{{"type":"response","requestId":null,"error":{{"code":"transientEngine","message":"frame encoding failed: {e}"}}}}"#
        )
    })
}

/// Decode a text message into a frame.
pub fn decode_frame(raw: &str) -> Result<Frame, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Error classification surfaced on response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    InvalidInput,
    NotFound,
    NotMaterialized,
    TransientEngine,
    FatalEngine,
    Cancelled,
}

/// Error payload of a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

// ============ Method parameters ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDocumentParams {
    pub document_id: String,
    pub source: String,
    #[serde(default)]
    pub force_reload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseDocumentParams {
    pub document_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializeSymbolParams {
    pub document_id: String,
    pub symbol_name: String,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

fn default_page_size() -> u64 {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelMaterializationParams {
    pub document_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteQueryParams {
    pub document_id: String,
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDomainValuesParams {
    pub document_id: String,
    pub symbol: String,
    pub dim_index: u32,
    /// Column name → selected labels; restricts the reported domain.
    #[serde(default)]
    pub dimension_filters: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFilterOptionsParams {
    pub document_id: String,
    pub symbol_name: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

// ============ Method results ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub pong: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenDocumentResult {
    pub symbols: Vec<Symbol>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResult {
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterializeStatus {
    /// Preview rows only; the full table is being built in the background.
    Preview,
    /// The symbol is already cached as a table.
    Materialized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializeSymbolResult {
    pub table_name: Option<String>,
    pub columns: Vec<String>,
    pub total_row_count: u64,
    pub status: MaterializeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_rows: Option<Vec<serde_json::Map<String, Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_row_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteQueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, Value>>,
    pub row_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDomainValuesResult {
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFilterOptionsResult {
    /// Column name → feasible values, in dimension-column order.
    pub filter_options: serde_json::Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_round_trips() {
        let raw = r#"{"type":"request","requestId":7,"method":"ping","params":{}}"#;
        let frame = decode_frame(raw).unwrap();
        match &frame {
            Frame::Request {
                request_id, method, ..
            } => {
                assert_eq!(request_id, &json!(7));
                assert_eq!(method, "ping");
            }
            _ => panic!("expected request frame"),
        }
        let encoded = encode_frame(&frame);
        assert_eq!(decode_frame(&encoded).unwrap(), frame);
    }

    #[test]
    fn request_params_default_to_null() {
        let frame = decode_frame(r#"{"type":"request","requestId":"a","method":"ping"}"#).unwrap();
        match frame {
            Frame::Request { params, .. } => assert!(params.is_null()),
            _ => panic!("expected request frame"),
        }
    }

    #[test]
    fn response_omits_absent_fields() {
        let frame = Frame::response_ok(json!(1), json!({"pong": true}));
        let encoded = encode_frame(&frame);
        assert!(!encoded.contains("error"));
        assert!(encoded.contains(r#""requestId":1"#));

        let frame = Frame::response_err(
            json!(2),
            RpcError {
                code: ErrorCode::NotFound,
                message: "document not open".to_string(),
            },
        );
        let encoded = encode_frame(&frame);
        assert!(!encoded.contains("result"));
        assert!(encoded.contains(r#""code":"notFound""#));
    }

    #[test]
    fn event_frame_shape() {
        let frame = Frame::Event {
            event: "materializationProgress".to_string(),
            data: json!({"documentId":"d1"}),
        };
        let encoded = encode_frame(&frame);
        assert!(encoded.contains(r#""type":"event""#));
        assert!(encoded.contains(r#""event":"materializationProgress""#));
    }

    #[test]
    fn page_size_defaults_to_1000() {
        let params: MaterializeSymbolParams =
            serde_json::from_value(json!({"documentId":"d1","symbolName":"x"})).unwrap();
        assert_eq!(params.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn error_codes_serialize_camel_case() {
        assert_eq!(
            serde_json::to_value(ErrorCode::NotMaterialized).unwrap(),
            json!("notMaterialized")
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::FatalEngine).unwrap(),
            json!("fatalEngine")
        );
    }

    #[test]
    fn materialize_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(MaterializeStatus::Preview).unwrap(),
            json!("preview")
        );
    }
}
