//! DNS server: a per-lab sidecar container, hot-replaceable, rebuilt from
//! the union of every exercise's DNS records.

use agent_collab::ContainerSpec;

const DNS_IMAGE: &str = "coredns/coredns:1.6.1";

/// Render the zone file contents for a lab's DNS records. Pure function,
/// exhaustively unit-testable; the container spec just mounts/embeds it.
pub fn render_zone(records: &[(String, String)]) -> String {
    records
        .iter()
        .map(|(name, ip)| format!("{name} IN A {ip}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the container spec for a lab's DNS sidecar. The zone content is
/// passed as an env var so the fake/real driver can mount or template it.
pub fn dns_container_spec(lab_tag: &str, records: &[(String, String)]) -> ContainerSpec {
    ContainerSpec {
        image: DNS_IMAGE.into(),
        name: format!("{lab_tag}-dns"),
        env: vec![("ZONE".into(), render_zone(records))],
        labels: vec![("role".into(), "dns".into())],
        mounts: Vec::new(),
        dns_aliases: Vec::new(),
        run_as: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_lists_one_line_per_record() {
        let zone = render_zone(&[
            ("a.local".into(), "10.0.0.10".into()),
            ("b.local".into(), "10.0.0.11".into()),
        ]);
        assert_eq!(zone.lines().count(), 2);
        assert!(zone.contains("a.local IN A 10.0.0.10"));
    }

    #[test]
    fn empty_records_yields_empty_zone() {
        assert_eq!(render_zone(&[]), "");
    }
}
