//! Admission gate trait for abstracting the quota engine from its callers.

use async_trait::async_trait;

use super::engine::{QuotaLimits, QuotaRecord};
use crate::error::Result;

/// Trait for admission decisions.
///
/// The gRPC service and the reset scheduler depend on this trait rather than
/// on [`QuotaEngine`](super::QuotaEngine) directly.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    /// Decide whether a request of `request_bytes` from `token` may proceed.
    ///
    /// `Ok(false)` means the request is over quota; an error means no
    /// decision could be made.
    async fn evaluate(&self, token: &str, request_bytes: u64) -> Result<bool>;

    /// Start a new quota cycle for every token.
    async fn reset_cycle(&self) -> Result<()>;

    /// Set the total quotas for a token.
    async fn provision(&self, token: &str, limits: QuotaLimits) -> Result<()>;

    /// Read a token's quotas and counters.
    async fn usage(&self, token: &str) -> Result<QuotaRecord>;
}
