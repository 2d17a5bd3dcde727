//! Typed task payloads
//!
//! Every payload carries a `dataType` discriminant so the JSON column can be
//! decoded back into the right variant without consulting the task type.

use serde::{Deserialize, Serialize};

/// Payload stored alongside a task
///
/// # Example
///
/// ```
/// use shelfsync_task_queue::TaskPayload;
///
/// let payload = TaskPayload::ProductTrigger { full_sync: true };
/// let json = serde_json::to_value(&payload).unwrap();
/// assert_eq!(json["dataType"], "productTrigger");
/// assert_eq!(json["fullSync"], true);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "dataType",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum TaskPayload {
    /// Start a bulk product export upstream
    ProductTrigger {
        /// Whether every product should be resent, not only changed ones
        full_sync: bool,
    },

    /// Consume the result of a finished bulk product export
    ProductSync {
        /// Upstream bulk operation reference
        bulk_operation_id: String,
        full_sync: bool,
    },

    /// Sync a handful of products by id (webhook driven)
    ProductIds { product_ids: Vec<String> },

    /// Start a bulk collection export upstream
    CollectionTrigger { full_sync: bool },

    /// Consume the result of a finished bulk collection export
    CollectionSync {
        bulk_operation_id: String,
        full_sync: bool,
    },

    /// Resync store locations
    LocationSync,

    /// Process a single order
    OrderProcessing { order_id: String },

    /// Non-production task that echoes its message into the task log
    Debug {
        message: String,
        /// Make the processor fail on purpose
        #[serde(default)]
        fail: bool,
    },
}

impl TaskPayload {
    /// The `dataType` discriminant as stored in JSON
    pub fn data_type(&self) -> &'static str {
        match self {
            Self::ProductTrigger { .. } => "productTrigger",
            Self::ProductSync { .. } => "productSync",
            Self::ProductIds { .. } => "productIds",
            Self::CollectionTrigger { .. } => "collectionTrigger",
            Self::CollectionSync { .. } => "collectionSync",
            Self::LocationSync => "locationSync",
            Self::OrderProcessing { .. } => "orderProcessing",
            Self::Debug { .. } => "debug",
        }
    }
}
