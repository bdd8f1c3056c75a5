use async_trait::async_trait;

use crate::error::Result;

/// Host-level metrics for the `MonitorStream` RPC payload. This is
/// in-scope functionality, so it is backed by a real trait rather than
/// stubbed — system metrics collection itself is the out-of-scope
/// collaborator, this is just the seam the core reads it through.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMetrics {
    pub cpu_percent: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self) -> Result<HostMetrics>;
}
