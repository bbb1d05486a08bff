//! Input records.
//!
//! A record is opaque to the engine: it is posted verbatim as the request
//! body. The only fields the engine reads are the correlation ids `memberId`
//! and `requestId`, which must be present on every record of a batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One immutable input record of a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Value);

impl Record {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The batch-correlation id, when present.
    pub fn member_id(&self) -> Option<&str> {
        self.0.get("memberId").and_then(Value::as_str)
    }

    /// The trace-correlation id, when present.
    pub fn request_id(&self) -> Option<&str> {
        self.0.get("requestId").and_then(Value::as_str)
    }

    /// The verbatim JSON body posted to the remote API.
    pub fn payload(&self) -> &Value {
        &self.0
    }
}

/// A batch that failed validation, with the offending record indices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordValidationError {
    /// Indices of records missing `memberId`.
    pub missing_member_id: Vec<usize>,
    /// Indices of records missing `requestId`.
    pub missing_request_id: Vec<usize>,
    /// True when the batch itself was empty.
    pub empty_batch: bool,
}

impl std::fmt::Display for RecordValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.empty_batch {
            return write!(f, "batch contains no records");
        }
        write!(
            f,
            "invalid records: missing memberId at {:?}, missing requestId at {:?}",
            self.missing_member_id, self.missing_request_id
        )
    }
}

/// Validates a batch: non-empty, and every record carries both correlation ids.
pub fn validate_batch(records: &[Record]) -> Result<(), RecordValidationError> {
    if records.is_empty() {
        return Err(RecordValidationError {
            missing_member_id: Vec::new(),
            missing_request_id: Vec::new(),
            empty_batch: true,
        });
    }
    let mut missing_member_id = Vec::new();
    let mut missing_request_id = Vec::new();
    for (index, record) in records.iter().enumerate() {
        if record.member_id().map_or(true, str::is_empty) {
            missing_member_id.push(index);
        }
        if record.request_id().map_or(true, str::is_empty) {
            missing_request_id.push(index);
        }
    }
    if missing_member_id.is_empty() && missing_request_id.is_empty() {
        Ok(())
    } else {
        Err(RecordValidationError {
            missing_member_id,
            missing_request_id,
            empty_batch: false,
        })
    }
}
