//! Wire client for the lifecycle ledger node
//!
//! MessagePack request/response envelopes over the persistent connection:
//! `{id, type: "request", data: <binary op>}` out,
//! `{id, type: "response"|"error", data}` back. The inner op carries an op
//! name and an rmp-serde payload.

use async_trait::async_trait;
use rmpv::Value;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::backend::{LedgerBackend, SubmitOutcome};
use super::connection::LedgerConnection;
use super::types::{LedgerStage, StagePayload, StageRef};
use crate::types::{Result, TraceError};

/// Production ledger backend speaking the ledger node wire protocol
pub struct LedgerClient {
    connection: LedgerConnection,
    request_timeout_ms: u64,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct SubmitStageRequest<'a> {
    tag: &'a str,
    index: u32,
    payload: &'a StagePayload,
    idempotency_key: &'a str,
}

#[derive(Deserialize)]
struct SubmitStageResponse {
    /// "accepted" | "duplicate" | "index_occupied" | "closed"
    status: String,
    stage_ref: Option<StageRef>,
}

#[derive(Serialize)]
struct TagRequest<'a> {
    tag: &'a str,
}

impl LedgerClient {
    /// Connect to the ledger node
    pub async fn connect(ledger_url: &str, request_timeout_ms: u64) -> Result<Self> {
        let connection = LedgerConnection::connect(ledger_url).await?;
        Ok(Self {
            connection,
            request_timeout_ms,
            next_id: AtomicU64::new(1),
        })
    }

    /// Check if the underlying connection is alive
    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// Send one typed op and decode the typed response
    async fn call<I: Serialize, O: DeserializeOwned>(&self, op: &str, input: &I) -> Result<O> {
        let payload = rmp_serde::to_vec_named(input)
            .map_err(|e| TraceError::Internal(format!("Failed to serialize {} op: {}", op, e)))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = build_request_envelope(id, op, &payload);

        debug!(op, id, "sending ledger op ({} bytes)", envelope.len());

        let response = self
            .connection
            .request(id, envelope, self.request_timeout_ms)
            .await?;
        let inner = parse_response(&response)?;

        rmp_serde::from_slice(&inner)
            .map_err(|e| TraceError::Internal(format!("Failed to decode {} response: {}", op, e)))
    }
}

#[async_trait]
impl LedgerBackend for LedgerClient {
    async fn submit_stage(
        &self,
        tag: &str,
        index: u32,
        payload: &StagePayload,
        idempotency_key: &str,
    ) -> Result<SubmitOutcome> {
        let response: SubmitStageResponse = self
            .call(
                "submit_stage",
                &SubmitStageRequest {
                    tag,
                    index,
                    payload,
                    idempotency_key,
                },
            )
            .await?;

        match (response.status.as_str(), response.stage_ref) {
            ("accepted", Some(stage_ref)) => Ok(SubmitOutcome::Accepted(stage_ref)),
            ("duplicate", Some(stage_ref)) => Ok(SubmitOutcome::Duplicate(stage_ref)),
            ("index_occupied", _) => Ok(SubmitOutcome::IndexOccupied),
            ("closed", _) => Ok(SubmitOutcome::Closed),
            (other, _) => Err(TraceError::Internal(format!(
                "Unknown submit_stage status: {}",
                other
            ))),
        }
    }

    async fn stages(&self, tag: &str) -> Result<Vec<LedgerStage>> {
        self.call("get_stages", &TagRequest { tag }).await
    }

    async fn tags(&self) -> Result<Vec<String>> {
        // No arguments; the node expects an empty map
        #[derive(Serialize)]
        struct Empty {}
        self.call("list_tags", &Empty {}).await
    }
}

/// Build the request envelope around one op
fn build_request_envelope(id: u64, op: &str, payload: &[u8]) -> Vec<u8> {
    let inner = Value::Map(vec![
        (Value::String("op".into()), Value::String(op.into())),
        (
            Value::String("payload".into()),
            Value::Binary(payload.to_vec()),
        ),
    ]);

    let mut inner_buf = Vec::new();
    rmpv::encode::write_value(&mut inner_buf, &inner).expect("Failed to encode ledger op");

    let envelope = Value::Map(vec![
        (Value::String("id".into()), Value::Integer(id.into())),
        (
            Value::String("type".into()),
            Value::String("request".into()),
        ),
        (Value::String("data".into()), Value::Binary(inner_buf)),
    ]);

    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &envelope).expect("Failed to encode envelope");
    buf
}

/// Parse a response envelope, extracting the inner result bytes
fn parse_response(data: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| TraceError::LedgerUnavailable(format!("Failed to decode response: {}", e)))?;

    let Value::Map(ref map) = value else {
        return Err(TraceError::LedgerUnavailable(
            "Unexpected ledger response format".into(),
        ));
    };

    if let Some(response_type) = get_string_field(map, "type") {
        if response_type == "error" {
            let message = get_string_field(map, "message")
                .unwrap_or_else(|| "Unknown ledger error".to_string());
            return Err(TraceError::LedgerUnavailable(format!(
                "Ledger error: {}",
                message
            )));
        }
    }

    if let Some(Value::Binary(inner)) = get_field(map, "data") {
        return Ok(inner.clone());
    }

    Err(TraceError::LedgerUnavailable(
        "Unexpected ledger response format".into(),
    ))
}

/// Get a string field from a MessagePack map
fn get_string_field(map: &[(Value, Value)], key: &str) -> Option<String> {
    for (k, v) in map {
        if let Value::String(k_str) = k {
            if k_str.as_str() == Some(key) {
                if let Value::String(v_str) = v {
                    return v_str.as_str().map(|s| s.to_string());
                }
            }
        }
    }
    None
}

/// Get a field from a MessagePack map
fn get_field<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    for (k, v) in map {
        if let Value::String(k_str) = k {
            if k_str.as_str() == Some(key) {
                return Some(v);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_envelope() {
        let payload = rmp_serde::to_vec_named(&TagRequest { tag: "T1" }).unwrap();
        let envelope = build_request_envelope(42, "get_stages", &payload);

        let mut cursor = Cursor::new(&envelope);
        let decoded = rmpv::decode::read_value(&mut cursor).unwrap();

        let Value::Map(map) = decoded else {
            panic!("Expected map");
        };
        assert!(matches!(get_field(&map, "id"), Some(Value::Integer(_))));
        assert_eq!(get_string_field(&map, "type").as_deref(), Some("request"));

        // The inner op round-trips
        let Some(Value::Binary(inner)) = get_field(&map, "data") else {
            panic!("Expected binary data");
        };
        let mut inner_cursor = Cursor::new(inner.as_slice());
        let inner_value = rmpv::decode::read_value(&mut inner_cursor).unwrap();
        let Value::Map(inner_map) = inner_value else {
            panic!("Expected inner map");
        };
        assert_eq!(get_string_field(&inner_map, "op").as_deref(), Some("get_stages"));
    }

    #[test]
    fn test_parse_response_ok() {
        let inner = rmp_serde::to_vec_named(&vec!["T1".to_string()]).unwrap();
        let envelope = Value::Map(vec![
            (Value::String("id".into()), Value::Integer(1.into())),
            (
                Value::String("type".into()),
                Value::String("response".into()),
            ),
            (Value::String("data".into()), Value::Binary(inner.clone())),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &envelope).unwrap();

        let parsed = parse_response(&buf).unwrap();
        assert_eq!(parsed, inner);
    }

    #[test]
    fn test_parse_response_error() {
        let envelope = Value::Map(vec![
            (Value::String("id".into()), Value::Integer(1.into())),
            (Value::String("type".into()), Value::String("error".into())),
            (
                Value::String("message".into()),
                Value::String("node draining".into()),
            ),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &envelope).unwrap();

        let err = parse_response(&buf).unwrap_err();
        assert!(matches!(err, TraceError::LedgerUnavailable(_)));
    }
}
