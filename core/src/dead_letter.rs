//! Dead-letter path for order messages that exhausted redelivery.

use crate::order_store::OrderStoreError;
use crate::types::OrderMessage;
use chrono::{DateTime, Utc};
use std::future::Future;

/// Status of a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterStatus {
    /// Waiting for investigation/reprocessing
    Pending,
    /// Being reprocessed by an operator
    Processing,
    /// Successfully reprocessed
    Resolved,
    /// Permanently given up
    Discarded,
}

impl DeadLetterStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse from the database string.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::InvalidValue`] for unknown strings.
    pub fn parse(s: &str) -> Result<Self, OrderStoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(OrderStoreError::InvalidValue(format!(
                "Invalid dead letter status: {s}"
            ))),
        }
    }
}

/// A message that failed processing on every allowed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// The failed message, with the attempt counter of its last delivery
    pub message: OrderMessage,
    /// Error from the last attempt
    pub error: String,
    /// Number of deliveries that failed
    pub attempts: u32,
    /// When the message was dead-lettered
    pub failed_at: DateTime<Utc>,
}

/// A record on the order topic that could not be decoded.
///
/// The raw bytes are kept so an operator can inspect or replay them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndecodableRecord {
    /// Partition of the record
    pub partition: i32,
    /// Offset of the record
    pub offset: i64,
    /// The raw payload
    pub payload: Vec<u8>,
    /// Decoder error
    pub error: String,
    /// When the record was set aside
    pub received_at: DateTime<Utc>,
}

/// Destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    /// Record a dead letter for manual remediation. Returns the entry id.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] if the letter cannot be stored.
    fn record(
        &self,
        letter: &DeadLetter,
    ) -> impl Future<Output = Result<i64, OrderStoreError>> + Send;

    /// Keep an undecodable record for an operator. Returns the entry id.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] if the record cannot be stored.
    fn record_undecodable(
        &self,
        record: &UndecodableRecord,
    ) -> impl Future<Output = Result<i64, OrderStoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in &[
            DeadLetterStatus::Pending,
            DeadLetterStatus::Processing,
            DeadLetterStatus::Resolved,
            DeadLetterStatus::Discarded,
        ] {
            assert_eq!(DeadLetterStatus::parse(status.as_str()), Ok(*status));
        }
    }

    #[test]
    fn status_invalid() {
        assert!(DeadLetterStatus::parse("invalid").is_err());
    }
}
