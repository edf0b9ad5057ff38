//! The response capture store.
//!
//! A dispatched task is fire-and-forget, so callers that want the result
//! later poll this key/value side channel instead. One record per
//! dispatch, keyed by a generated id; the callee writes it, pollers read
//! it, and the table's TTL mechanism reaps it. No transactions, no
//! secondary indices; ids are generated per-dispatch so concurrent writers
//! to one key are not expected, and last-writer-wins if it happens anyway.
//!
//! The DynamoDB implementation is the real one. The in-memory
//! implementation backs the local execution mode and the tests, the same
//! way the bridge itself runs applications locally without a gateway.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::BridgeError;
use serde_json::Value;

/// How long captured responses live, in seconds.
pub const CAPTURE_TTL_SECONDS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureStatus {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "error")]
    Error,
}

/// One captured task result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub id: String,
    pub async_status: CaptureStatus,
    pub async_response: Value,
    /// Expiry as epoch seconds; enforced by the store.
    pub ttl: u64,
}

#[async_trait]
pub trait CaptureStore: Send + Sync {
    async fn put(
        &self,
        id: &str,
        status: CaptureStatus,
        payload: &Value,
        ttl_seconds: u64,
    ) -> Result<(), BridgeError>;

    /// `None` means "not yet executed, expired, or capture never
    /// configured" — callers cannot distinguish these without their own
    /// timeout policy.
    async fn get(&self, id: &str) -> Result<Option<CapturedResponse>, BridgeError>;
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// DynamoDB-backed store. The table's partition key is `id` (string) and
/// its TTL attribute is `ttl`.
pub struct DynamoCaptureStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoCaptureStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table: impl Into<String>) -> Self {
        DynamoCaptureStore {
            client,
            table: table.into(),
        }
    }
}

#[async_trait]
impl CaptureStore for DynamoCaptureStore {
    async fn put(
        &self,
        id: &str,
        status: CaptureStatus,
        payload: &Value,
        ttl_seconds: u64,
    ) -> Result<(), BridgeError> {
        let record = CapturedResponse {
            id: id.to_owned(),
            async_status: status,
            async_response: payload.clone(),
            ttl: now_epoch() + ttl_seconds,
        };

        let item = serde_dynamo::to_item(&record)
            .map_err(|e| BridgeError::Capture(e.to_string()))?;

        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| BridgeError::Capture(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<CapturedResponse>, BridgeError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(
                "id",
                aws_sdk_dynamodb::types::AttributeValue::S(id.to_owned()),
            )
            .send()
            .await
            .map_err(|e| BridgeError::Capture(e.to_string()))?;

        let Some(item) = result.item else {
            return Ok(None);
        };

        let record: CapturedResponse =
            serde_dynamo::from_item(item).map_err(|e| BridgeError::Capture(e.to_string()))?;

        // DynamoDB's TTL reaper lags; don't serve records past their expiry.
        if record.ttl <= now_epoch() {
            return Ok(None);
        }

        Ok(Some(record))
    }
}

/// In-memory store for the local execution mode and tests.
#[derive(Default)]
pub struct MemoryCaptureStore {
    records: Mutex<HashMap<String, CapturedResponse>>,
}

impl MemoryCaptureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CaptureStore for MemoryCaptureStore {
    async fn put(
        &self,
        id: &str,
        status: CaptureStatus,
        payload: &Value,
        ttl_seconds: u64,
    ) -> Result<(), BridgeError> {
        let record = CapturedResponse {
            id: id.to_owned(),
            async_status: status,
            async_response: payload.clone(),
            ttl: now_epoch() + ttl_seconds,
        };
        self.records
            .lock()
            .expect("capture store lock poisoned")
            .insert(id.to_owned(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<CapturedResponse>, BridgeError> {
        let records = self.records.lock().expect("capture store lock poisoned");
        Ok(records
            .get(id)
            .filter(|r| r.ttl > now_epoch())
            .cloned())
    }
}
