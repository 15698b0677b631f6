use async_trait::async_trait;
use warden_core::WardenResult;

/// A specialist executor reached through a uniform interface.
///
/// Implementations wrap whatever actually does the work (a model-serving
/// backend, a tool process, a remote service). Errors should be reported as
/// [`warden_core::WardenError::TransientExecution`] when a retry may succeed
/// and [`warden_core::WardenError::Execution`] otherwise.
#[async_trait]
pub trait SpecialistAgent: Send + Sync {
    /// Perform one unit of work for `capability`.
    async fn execute(
        &self,
        capability: &str,
        payload: &serde_json::Value,
    ) -> WardenResult<serde_json::Value>;
}
