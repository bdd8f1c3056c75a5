use crate::error::{OrchError, OrchResult};

/// Ask the OS for a free ephemeral TCP port by binding to port 0, reading
/// back the assigned port, then releasing it. There's an inherent TOCTOU
/// race (nothing stops another process taking the port before the RDP
/// connection is actually made) but it mirrors the source behaviour exactly
/// and is good enough in practice given the guacamole connection is created
/// moments later on the same host.
pub async fn allocate_rdp_port() -> OrchResult<u16> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| OrchError::Internal(format!("allocate rdp port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| OrchError::Internal(format!("read bound rdp port: {e}")))?
        .port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_nonzero_port() {
        let port = allocate_rdp_port().await.expect("allocation should succeed");
        assert!(port > 0);
    }

    #[tokio::test]
    async fn repeated_allocations_are_usually_distinct() {
        let a = allocate_rdp_port().await.expect("a");
        let b = allocate_rdp_port().await.expect("b");
        // Not a hard guarantee (the OS could reuse immediately), but in
        // practice ephemeral allocation cycles through the port range.
        assert!(a > 0 && b > 0);
    }
}
