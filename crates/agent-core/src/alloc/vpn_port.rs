use rand::Rng;
use tokio::net::TcpStream;
use tokio::time::Duration;

use crate::error::{OrchError, OrchResult};

const RANGE_START: u16 = 5000;
const RANGE_END: u16 = 6000; // exclusive
const MAX_ATTEMPTS: u32 = 64;
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Uniform-random port in `[5000, 6000)`, rejected and retried if a TCP
/// connect probe succeeds (meaning something is already listening there).
/// `ResourceExhausted` after `MAX_ATTEMPTS` failed probes — a bounded
/// approximation of "every port in the range is occupied", since
/// exhaustively checking a thousand ports serially on every allocation
/// would itself be the bottleneck this allocator exists to avoid.
pub async fn allocate_vpn_port() -> OrchResult<u16> {
    for _ in 0..MAX_ATTEMPTS {
        let candidate = random_port_in_range();
        if !probe_in_use(candidate).await {
            return Ok(candidate);
        }
    }
    Err(OrchError::ResourceExhausted(
        "no free VPN endpoint port in [5000, 6000)".into(),
    ))
}

fn random_port_in_range() -> u16 {
    rand::thread_rng().gen_range(RANGE_START..RANGE_END)
}

async fn probe_in_use(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_port_stays_in_range() {
        for _ in 0..1000 {
            let p = random_port_in_range();
            assert!((RANGE_START..RANGE_END).contains(&p));
        }
    }

    #[tokio::test]
    async fn unused_port_is_not_in_use() {
        // Extremely unlikely anything is bound to this fixed candidate
        // in a sandboxed test run.
        assert!(!probe_in_use(5999).await);
    }
}
