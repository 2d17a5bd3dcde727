//! Upstream fault recognition
//!
//! Some processor errors say more than "try again": the tenant's upstream
//! credentials were revoked, the store hit its API quota, or the store no
//! longer exists. Those still go through the normal retry bookkeeping, but
//! the owning tenant is also flagged so the problem is visible outside the
//! task queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Sync error code attached to a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncErrorCode {
    /// Credentials rejected or access revoked
    Unauthorized,

    /// Store frozen or plan lapsed
    PaymentRequired,

    /// Upstream throttling or quota exhaustion
    QuotaExceeded,

    /// Store or resource no longer exists
    NotFound,
}

impl std::fmt::Display for SyncErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "UNAUTHORIZED"),
            Self::PaymentRequired => write!(f, "PAYMENT_REQUIRED"),
            Self::QuotaExceeded => write!(f, "QUOTA_EXCEEDED"),
            Self::NotFound => write!(f, "NOT_FOUND"),
        }
    }
}

/// (code, status tokens, phrases), checked in order
const SIGNATURES: &[(SyncErrorCode, &[&str], &[&str])] = &[
    (
        SyncErrorCode::Unauthorized,
        &["401", "403"],
        &[
            "unauthorized",
            "forbidden",
            "access denied",
            "invalid api key",
            "access token",
        ],
    ),
    (
        SyncErrorCode::PaymentRequired,
        &["402"],
        &["payment required", "shop is frozen"],
    ),
    (
        SyncErrorCode::QuotaExceeded,
        &["429"],
        &["throttled", "too many requests", "rate limit", "quota"],
    ),
    (
        SyncErrorCode::NotFound,
        &["404"],
        &["not found", "unavailable shop"],
    ),
];

/// Classify an error message as an upstream fault
///
/// Status codes only match as standalone tokens so ids that happen to
/// contain "404" are not mistaken for a missing store.
///
/// # Example
///
/// ```
/// use shelfsync_task_queue::reliability::{classify_upstream_fault, SyncErrorCode};
///
/// assert_eq!(
///     classify_upstream_fault("upstream returned 429 Too Many Requests"),
///     Some(SyncErrorCode::QuotaExceeded)
/// );
/// assert_eq!(classify_upstream_fault("product 14040 has no title"), None);
/// ```
pub fn classify_upstream_fault(message: &str) -> Option<SyncErrorCode> {
    let lowered = message.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    SIGNATURES
        .iter()
        .find(|(_, codes, phrases)| {
            codes.iter().any(|code| tokens.contains(code))
                || phrases.iter().any(|phrase| lowered.contains(phrase))
        })
        .map(|(code, _, _)| *code)
}

/// Receives tenant-level sync errors
///
/// Called off the execution path; failures are logged and otherwise ignored.
#[async_trait]
pub trait TenantNotifier: Send + Sync + 'static {
    /// Flag `organization_id` with `code`
    async fn flag_sync_error(
        &self,
        organization_id: &str,
        code: SyncErrorCode,
        message: &str,
    ) -> anyhow::Result<()>;
}

/// Notifier that only writes a warning to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTenantNotifier;

#[async_trait]
impl TenantNotifier for LoggingTenantNotifier {
    async fn flag_sync_error(
        &self,
        organization_id: &str,
        code: SyncErrorCode,
        message: &str,
    ) -> anyhow::Result<()> {
        warn!(%organization_id, %code, %message, "Tenant sync error");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            classify_upstream_fault("HTTP 401 from upstream"),
            Some(SyncErrorCode::Unauthorized)
        );
        assert_eq!(
            classify_upstream_fault("request failed with status 402"),
            Some(SyncErrorCode::PaymentRequired)
        );
        assert_eq!(
            classify_upstream_fault("status: 404"),
            Some(SyncErrorCode::NotFound)
        );
    }

    #[test]
    fn test_phrases_are_case_insensitive() {
        assert_eq!(
            classify_upstream_fault("[API] Invalid API key or access token (unrecognized login)"),
            Some(SyncErrorCode::Unauthorized)
        );
        assert_eq!(
            classify_upstream_fault("Throttled: cost exceeds available"),
            Some(SyncErrorCode::QuotaExceeded)
        );
        assert_eq!(
            classify_upstream_fault("Unavailable Shop"),
            Some(SyncErrorCode::NotFound)
        );
    }

    #[test]
    fn test_ordinary_errors_are_not_faults() {
        assert_eq!(classify_upstream_fault("connection reset by peer"), None);
        assert_eq!(classify_upstream_fault("order 4011 missing line items"), None);
        assert_eq!(classify_upstream_fault(""), None);
    }

    #[tokio::test]
    async fn test_logging_notifier_accepts_everything() {
        let notifier = LoggingTenantNotifier;
        notifier
            .flag_sync_error("org-1", SyncErrorCode::NotFound, "gone")
            .await
            .unwrap();
    }
}
