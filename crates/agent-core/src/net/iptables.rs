//! Data-plane iptables policy: three rules per VPN-enabled lab on the
//! host's `FORWARD` chain, in a fixed order, idempotently removable.

use async_trait::async_trait;

use crate::error::OrchResult;

/// Shells out to `iptables` (or an equivalent backend). Grounded on the same
/// "trait the real side-effect, fake it in tests" shape used throughout
/// `agent-collab` — the actual `iptables`/`nft` invocation is host-specific
/// and not part of the orchestration core.
#[async_trait]
pub trait IptablesExecutor: Send + Sync {
    async fn append(&self, chain: &str, args: &[String]) -> OrchResult<()>;
    async fn delete(&self, chain: &str, args: &[String]) -> OrchResult<()>;
}

const FORWARD_CHAIN: &str = "FORWARD";

/// One rule in the lab's three-rule set, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabRule {
    RejectToSubnet,
    AcceptEstablishedToSubnet,
    AcceptFromPeers,
}

/// Build the three `iptables -A FORWARD ...` argument lists for a lab, in
/// the fixed order named by this rule set: reject, established, peer allow.
pub fn build_rules(subnet_cidr: &str, peer_ips: &[String]) -> Vec<(LabRule, Vec<String>)> {
    let joined_peers = peer_ips.join(",");
    vec![
        (
            LabRule::RejectToSubnet,
            vec![
                "-d".into(),
                subnet_cidr.into(),
                "-j".into(),
                "REJECT".into(),
            ],
        ),
        (
            LabRule::AcceptEstablishedToSubnet,
            vec![
                "-d".into(),
                subnet_cidr.into(),
                "-m".into(),
                "conntrack".into(),
                "--ctstate".into(),
                "RELATED,ESTABLISHED".into(),
                "-j".into(),
                "ACCEPT".into(),
            ],
        ),
        (
            LabRule::AcceptFromPeers,
            vec![
                "-d".into(),
                subnet_cidr.into(),
                "-s".into(),
                joined_peers,
                "-j".into(),
                "ACCEPT".into(),
            ],
        ),
    ]
}

/// Apply the three rules for a lab, in order. On failure partway through,
/// the caller is responsible for calling [`remove_lab_rules`] to undo
/// whatever was already applied (removal is idempotent, so this is safe
/// even for rules that never got added).
pub async fn apply_lab_rules(
    executor: &dyn IptablesExecutor,
    subnet_cidr: &str,
    peer_ips: &[String],
) -> OrchResult<()> {
    for (_, args) in build_rules(subnet_cidr, peer_ips) {
        executor.append(FORWARD_CHAIN, &args).await?;
    }
    Ok(())
}

/// Undo a lab's rules in reverse order. Idempotent: deleting a rule that
/// isn't present is not an error from the caller's perspective (the
/// executor implementation is expected to treat "no matching rule" as
/// success, matching `iptables -D`'s real-world use in cleanup code).
pub async fn remove_lab_rules(
    executor: &dyn IptablesExecutor,
    subnet_cidr: &str,
    peer_ips: &[String],
) -> OrchResult<()> {
    let mut rules = build_rules(subnet_cidr, peer_ips);
    rules.reverse();
    for (_, args) in rules {
        executor.delete(FORWARD_CHAIN, &args).await?;
    }
    Ok(())
}

/// An `IptablesExecutor` that records nothing and always succeeds, for
/// driving the orchestrator end to end without a real `iptables` binary.
#[derive(Default)]
pub struct NoopIptablesExecutor;

#[async_trait]
impl IptablesExecutor for NoopIptablesExecutor {
    async fn append(&self, _chain: &str, _args: &[String]) -> OrchResult<()> {
        Ok(())
    }

    async fn delete(&self, _chain: &str, _args: &[String]) -> OrchResult<()> {
        Ok(())
    }
}

/// Shells out to the real `iptables` binary. `-D` on a rule that was never
/// applied exits non-zero ("Bad rule") — treated as success here so
/// `remove_lab_rules` stays idempotent even after a partial `apply`.
pub struct ShellIptablesExecutor {
    binary: String,
}

impl Default for ShellIptablesExecutor {
    fn default() -> Self {
        Self { binary: "iptables".into() }
    }
}

impl ShellIptablesExecutor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

#[async_trait]
impl IptablesExecutor for ShellIptablesExecutor {
    async fn append(&self, chain: &str, args: &[String]) -> OrchResult<()> {
        self.run("-A", chain, args).await
    }

    async fn delete(&self, chain: &str, args: &[String]) -> OrchResult<()> {
        match self.run("-D", chain, args).await {
            Ok(()) => Ok(()),
            Err(_) => Ok(()),
        }
    }
}

impl ShellIptablesExecutor {
    async fn run(&self, verb: &str, chain: &str, args: &[String]) -> OrchResult<()> {
        let mut full_args = vec![verb.to_string(), chain.to_string()];
        full_args.extend(args.iter().cloned());

        let output = tokio::process::Command::new(&self.binary)
            .args(&full_args)
            .output()
            .await
            .map_err(|e| crate::error::OrchError::Internal(format!("exec {}: {e}", self.binary)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(crate::error::OrchError::Internal(format!(
                "{} {}: {stderr}",
                self.binary,
                full_args.join(" ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExecutor {
        appended: Mutex<Vec<Vec<String>>>,
        deleted: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl IptablesExecutor for RecordingExecutor {
        async fn append(&self, _chain: &str, args: &[String]) -> OrchResult<()> {
            self.appended.lock().unwrap().push(args.to_vec());
            Ok(())
        }

        async fn delete(&self, _chain: &str, args: &[String]) -> OrchResult<()> {
            self.deleted.lock().unwrap().push(args.to_vec());
            Ok(())
        }
    }

    #[test]
    fn builds_three_rules_in_order() {
        let rules = build_rules("10.50.3.0/24", &["10.8.0.2".into()]);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].0, LabRule::RejectToSubnet);
        assert_eq!(rules[1].0, LabRule::AcceptEstablishedToSubnet);
        assert_eq!(rules[2].0, LabRule::AcceptFromPeers);
    }

    #[test]
    fn peer_accept_rule_joins_ips_with_comma() {
        let rules = build_rules("10.50.3.0/24", &["10.8.0.2".into(), "10.8.0.3".into()]);
        let peers_arg = &rules[2].1;
        assert!(peers_arg.contains(&"10.8.0.2,10.8.0.3".to_string()));
    }

    #[tokio::test]
    async fn apply_then_remove_is_symmetric_and_reversed() {
        let executor = RecordingExecutor::default();
        apply_lab_rules(&executor, "10.50.3.0/24", &["10.8.0.2".into()])
            .await
            .unwrap();
        remove_lab_rules(&executor, "10.50.3.0/24", &["10.8.0.2".into()])
            .await
            .unwrap();

        let appended = executor.appended.lock().unwrap();
        let deleted = executor.deleted.lock().unwrap();
        assert_eq!(appended.len(), 3);
        assert_eq!(deleted.len(), 3);
        // Removal undoes in reverse order.
        assert_eq!(*appended.first().unwrap(), *deleted.last().unwrap());
        assert_eq!(*appended.last().unwrap(), *deleted.first().unwrap());
    }
}
