//! Reliability primitives for task execution
//!
//! This module provides:
//! - [`RetryPolicy`] - retry counting against a queue's maximum
//! - [`SyncErrorCode`] / [`classify_upstream_fault`] - recognising upstream faults
//! - [`TenantNotifier`] - where recognised faults are reported

mod faults;
mod retry;

pub use faults::{classify_upstream_fault, LoggingTenantNotifier, SyncErrorCode, TenantNotifier};
pub use retry::{RetryDecision, RetryPolicy};
