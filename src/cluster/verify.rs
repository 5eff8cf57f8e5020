// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use log::{debug, info, warn};

use super::{kubectl, line_is_ready, KMSG_LINK};
use crate::config::{Container, Topology};
use crate::container::Pct;

const LOG: &str = "kubernetes";

const UNREACHABLE_TAINT: &str = "node.kubernetes.io/unreachable";

/// Names of the nodes that carry the unreachable taint, given one `<name>\t<taints>` line per
/// node.
pub fn unreachable_nodes(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter(|line| line.contains(UNREACHABLE_TAINT))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Count the Ready nodes in `kubectl get nodes --no-headers`, and name the ones that are not.
pub fn count_ready(listing: &str) -> (usize, Vec<String>) {
    let mut ready = 0;
    let mut not_ready = Vec::new();
    for line in listing.lines().filter(|l| !l.trim().is_empty()) {
        if line_is_ready(line) {
            ready += 1;
        } else if line.contains("NotReady") || line.contains("Unknown") {
            if let Some(name) = line.split_whitespace().next() {
                not_ready.push(name.to_string());
            }
        }
    }
    (ready, not_ready)
}

struct Verifier<'a> {
    pct: &'a Pct<'a>,
    topology: &'a Topology,
    control: &'a Container,
    members: Vec<&'a Container>,
}

impl<'a> Verifier<'a> {
    async fn on_control(&self, command: &str) -> String {
        self.pct
            .exec(self.control.id, command, None)
            .await
            .output
    }

    /// Wait for every member to be Ready. Returns whether they all were in time.
    async fn wait_ready(&self) -> bool {
        let expected = self.members.len();
        info!(target: LOG, "Checking that all {expected} nodes are Ready...");
        let listing = kubectl("get nodes --no-headers 2>&1");
        let mut waited = Duration::ZERO;
        let limit = Duration::from_secs(120);
        let interval = Duration::from_secs(5);
        loop {
            let output = self.on_control(&listing).await;
            let (ready, not_ready) = count_ready(&output);
            if ready >= expected {
                info!(target: LOG, "All {ready} nodes are Ready");
                return true;
            }
            if !not_ready.is_empty() {
                debug!(target: LOG, "Nodes not ready: {}", not_ready.join(", "));
            }
            if waited >= limit {
                warn!(
                    target: LOG,
                    "Only {ready}/{expected} nodes Ready after {}s (not ready: {})",
                    limit.as_secs(),
                    not_ready.join(", ")
                );
                return false;
            }
            tokio::time::sleep(interval).await;
            waited += interval;
        }
    }

    /// Find the unit behind a node name, by hostname or unit name, then by the node's address.
    async fn unit_for_node(&self, node: &str) -> Option<&'a Container> {
        if let Some(unit) = self
            .members
            .iter()
            .find(|c| c.hostname == node || c.name == node)
        {
            return Some(*unit);
        }
        let address = self
            .on_control(&kubectl(&format!(
                "get node {node} -o jsonpath='{{.status.addresses[?(@.type==\"InternalIP\")].address}}' 2>&1"
            )))
            .await;
        let address = address.trim();
        self.members
            .iter()
            .find(|c| c.ip_address.to_string() == address)
            .copied()
    }

    async fn restart_agent(&self, unit: &Container) {
        let restart = if self.topology.is_cluster_control(unit.id) {
            format!("{KMSG_LINK} && systemctl restart k3s 2>&1")
        } else {
            format!(
                "{KMSG_LINK} && systemctl restart k3s-agent 2>&1 || systemctl restart k3s 2>&1"
            )
        };
        self.pct.exec(unit.id, &restart, None).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    /// Remove the unreachable taint from every node that carries it, restarting the node's
    /// agent. Returns how many nodes were repaired.
    async fn clear_unreachable(&self) -> usize {
        let listing = self
            .on_control(&kubectl(
                "get nodes -o jsonpath='{range .items[*]}{.metadata.name}{\"\\t\"}{.spec.taints}{\"\\n\"}{end}' 2>&1",
            ))
            .await;
        let nodes = unreachable_nodes(&listing);
        for node in nodes.iter() {
            warn!(target: LOG, "Node {node} is tainted unreachable, repairing...");
            for effect in ["NoSchedule", "NoExecute"] {
                self.on_control(&kubectl(&format!(
                    "taint nodes {node} {UNREACHABLE_TAINT}:{effect}- 2>&1"
                )))
                .await;
            }
            match self.unit_for_node(node).await {
                Some(unit) => self.restart_agent(unit).await,
                None => warn!(target: LOG, "No unit found for node {node}, taint removed only"),
            }
        }
        nodes.len()
    }

    /// Make sure every member has a kernel log device, restarting its agent when one had to be
    /// created.
    async fn ensure_kmsg(&self) {
        for unit in self.members.iter() {
            let probe = self
                .pct
                .exec(unit.id, "test -e /dev/kmsg && echo exists || echo missing", None)
                .await;
            if probe.output.trim() == "exists" {
                continue;
            }
            warn!(target: LOG, "/dev/kmsg missing on {} ({}), creating...", unit.hostname, unit.id);
            let fix = self
                .pct
                .exec(
                    unit.id,
                    &format!("{KMSG_LINK} && test -e /dev/kmsg && echo created || echo failed"),
                    None,
                )
                .await;
            if fix.contains("created") {
                self.restart_agent(unit).await;
            } else {
                warn!(target: LOG, "Could not create /dev/kmsg on {}", unit.hostname);
            }
        }
    }

    /// Best effort check of the management UI. Never fails verification.
    async fn check_rancher(&self) {
        if self.topology.services.rancher.is_none() {
            return;
        }
        let service = self
            .on_control(&kubectl("get svc rancher -n cattle-system 2>&1"))
            .await;
        if service.contains("NotFound") || service.contains("not found") {
            warn!(target: LOG, "Rancher service not found");
            return;
        }
        let ip = self
            .on_control(&kubectl(
                "get svc rancher -n cattle-system -o jsonpath='{.spec.clusterIP}' 2>&1",
            ))
            .await;
        let ip = ip.trim();
        if ip.is_empty() {
            warn!(target: LOG, "Rancher service has no cluster address");
            return;
        }
        let probe = format!("curl -k -s --max-time 5 https://{ip}:443 2>&1 | head -1");
        for attempt in 1..=10 {
            let reply = self.on_control(&probe).await;
            if ["apiRoot", "collection", "rancher"]
                .iter()
                .any(|marker| reply.contains(marker))
            {
                info!(target: LOG, "Rancher is responding at {ip}");
                return;
            }
            debug!(target: LOG, "Rancher not responding yet (attempt {attempt}/10)");
            if attempt < 10 {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        }
        warn!(target: LOG, "Rancher did not respond, it may still be starting");
    }
}

/// Check the health of the cluster, repairing what can be repaired in place: unreachable taints
/// and missing kernel log devices. A healthy cluster is left untouched.
///
/// Returns true when there is no cluster to verify.
pub async fn verify_cluster(pct: &Pct<'_>, topology: &Topology) -> bool {
    if topology.kubernetes.is_none() {
        return true;
    }
    let Some(control) = topology.cluster_control() else {
        warn!(target: LOG, "No control node to verify the cluster from");
        return false;
    };
    let verifier = Verifier {
        pct,
        topology,
        control,
        members: topology.cluster_members(),
    };

    let mut ready = verifier.wait_ready().await;
    if verifier.clear_unreachable().await > 0 {
        tokio::time::sleep(Duration::from_secs(15)).await;
        ready = verifier.wait_ready().await;
    }
    verifier.ensure_kmsg().await;
    verifier.check_rancher().await;
    ready
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_tainted_nodes_are_unreachable() {
        let listing = "k3s-control\t[{\"effect\":\"NoSchedule\",\"key\":\"node-role.kubernetes.io/control-plane\"}]\n\
                       k3s-worker-1\t[{\"effect\":\"NoSchedule\",\"key\":\"node.kubernetes.io/unreachable\"}]\n\
                       k3s-worker-2\t";
        assert_eq!(unreachable_nodes(listing), vec!["k3s-worker-1".to_string()]);
        assert!(unreachable_nodes("k3s-control\t\nk3s-worker-1\t").is_empty());
    }

    #[test]
    fn ready_count_names_the_stragglers() {
        let listing = "k3s-control    Ready      control-plane,master   5m    v1.30.4+k3s1\n\
                       k3s-worker-1   NotReady   <none>                 1m    v1.30.4+k3s1\n\
                       k3s-worker-2   Ready      <none>                 1m    v1.30.4+k3s1";
        let (ready, not_ready) = count_ready(listing);
        assert_eq!(ready, 2);
        assert_eq!(not_ready, vec!["k3s-worker-1".to_string()]);
    }

    #[test]
    fn unknown_counts_as_not_ready() {
        let listing = "k3s-control    Ready     control-plane,master   1h   v1.30.4+k3s1\n\
                       k3s-worker-1   Unknown   <none>                 1h   v1.30.4+k3s1\n";
        let (ready, not_ready) = count_ready(listing);
        assert_eq!(ready, 1);
        assert_eq!(not_ready, vec!["k3s-worker-1".to_string()]);
    }
}
