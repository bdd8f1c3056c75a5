use std::collections::VecDeque;

use crate::error::{OrchError, OrchResult};

/// Process-wide pool of lab container-network `/24`s, independent of the
/// per-environment VPN peer-octet pool (that pool only allocates VPN *peer*
/// addresses; each lab's own bridge/VPN-attached container subnet is a
/// separate private range, conventionally `10.50.<n>.0/24`).
pub struct LabSubnetPool {
    free: VecDeque<u8>,
    base: (u8, u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabSubnet {
    base: (u8, u8),
    third: u8,
}

impl LabSubnet {
    /// Rebuild a subnet handle from its parts, for resuming state across a
    /// restart — the pool itself is not persisted, only the subnet each lab
    /// was holding, so this never touches `LabSubnetPool`'s free list.
    pub fn from_parts(base: (u8, u8), third: u8) -> Self {
        Self { base, third }
    }

    /// Parse a `/24` CIDR of the shape produced by [`LabSubnet::cidr`].
    pub fn parse(cidr: &str) -> Option<Self> {
        let addr = cidr.split('/').next()?;
        let mut parts = addr.split('.');
        let a: u8 = parts.next()?.parse().ok()?;
        let b: u8 = parts.next()?.parse().ok()?;
        let c: u8 = parts.next()?.parse().ok()?;
        Some(Self {
            base: (a, b),
            third: c,
        })
    }

    /// The subnet's third octet, e.g. for threading through to
    /// [`LabSubnetPool::reserve`] when rebuilding the pool across a restart.
    pub fn third(&self) -> u8 {
        self.third
    }

    pub fn cidr(&self) -> String {
        format!("{}.{}.{}.0/24", self.base.0, self.base.1, self.third)
    }

    pub fn host(&self, octet: u8) -> String {
        format!("{}.{}.{}.{octet}", self.base.0, self.base.1, self.third)
    }

    /// DNS container's preferred address lives on `.3`.
    pub fn dns_ip(&self) -> String {
        self.host(3)
    }

    /// DHCP container lives on `.2`.
    pub fn dhcp_ip(&self) -> String {
        self.host(2)
    }
}

impl LabSubnetPool {
    pub fn new(base: (u8, u8)) -> Self {
        Self {
            free: (0..=255u8).collect(),
            base,
        }
    }

    pub fn allocate(&mut self) -> OrchResult<LabSubnet> {
        let third = self
            .free
            .pop_front()
            .ok_or_else(|| OrchError::ResourceExhausted("lab subnet pool exhausted".into()))?;
        Ok(LabSubnet {
            base: self.base,
            third,
        })
    }

    pub fn release(&mut self, subnet: LabSubnet) {
        self.free.push_back(subnet.third);
    }

    /// Remove an already-allocated third octet from the free list, for
    /// rebuilding this pool from labs resumed out of a persisted snapshot.
    pub fn reserve(&mut self, third: u8) {
        self.free.retain(|t| *t != third);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_and_dhcp_ips_use_reserved_octets() {
        let mut pool = LabSubnetPool::new((10, 50));
        let subnet = pool.allocate().unwrap();
        assert!(subnet.dns_ip().ends_with(".3"));
        assert!(subnet.dhcp_ip().ends_with(".2"));
    }

    #[test]
    fn cidr_formats_as_slash_24() {
        let mut pool = LabSubnetPool::new((10, 50));
        let subnet = pool.allocate().unwrap();
        assert!(subnet.cidr().ends_with(".0/24"));
    }
}
