//! DHCP server: a per-lab sidecar container built from the lab's subnet,
//! hot-replaceable on `RefreshDHCP`.

use agent_collab::ContainerSpec;

use crate::alloc::LabSubnet;

const DHCP_IMAGE: &str = "networkboot/dhcpd:1.2.0";

/// Render the `dhcpd.conf` subnet stanza for a lab. Host range excludes the
/// DHCP (`.2`) and DNS (`.3`) reserved octets.
pub fn render_config(subnet: &LabSubnet) -> String {
    format!(
        "subnet {} netmask 255.255.255.0 {{\n  range {} {};\n  option routers {};\n}}\n",
        subnet.cidr().trim_end_matches("/24"),
        subnet.host(4),
        subnet.host(254),
        subnet.dhcp_ip(),
    )
}

pub fn dhcp_container_spec(lab_tag: &str, subnet: &LabSubnet) -> ContainerSpec {
    ContainerSpec {
        image: DHCP_IMAGE.into(),
        name: format!("{lab_tag}-dhcp"),
        env: vec![("DHCPD_CONF".into(), render_config(subnet))],
        labels: vec![("role".into(), "dhcp".into())],
        mounts: Vec::new(),
        dns_aliases: Vec::new(),
        run_as: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::LabSubnetPool;

    #[test]
    fn config_excludes_reserved_octets() {
        let mut pool = LabSubnetPool::new((10, 50));
        let subnet = pool.allocate().unwrap();
        let config = render_config(&subnet);
        assert!(config.contains(&subnet.host(4)));
        assert!(!config.contains(&format!("range {}", subnet.host(2))));
    }
}
