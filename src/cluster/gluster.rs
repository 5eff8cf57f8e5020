// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Replicated GlusterFS storage: server installation on the configured nodes, peering, the
//! volume itself, and mounts on the storage nodes and on every cluster member.

use std::time::Duration;

use log::{debug, error, info, warn};

use crate::actions::{is_active, write_file};
use crate::config::{Container, Glusterfs, Topology};
use crate::container::Pct;
use crate::remote::{Execution, Executor};

const LOG: &str = "gluster";

const PROXY_FILE: &str = "/etc/apt/apt.conf.d/01proxy";

/// Repoint the apt sources of a unit created from an end-of-life release at a live one.
pub const SOURCES_FIX: &str = "sed -i 's/oracular/plucky/g' /etc/apt/sources.list 2>/dev/null || true; \
if ! grep -q '^deb.*plucky.*main' /etc/apt/sources.list 2>/dev/null; then \
echo 'deb http://archive.ubuntu.com/ubuntu plucky main universe multiverse' > /etc/apt/sources.list; \
echo 'deb http://archive.ubuntu.com/ubuntu plucky-updates main universe multiverse' >> /etc/apt/sources.list; \
echo 'deb http://security.ubuntu.com/ubuntu plucky-security main universe multiverse' >> /etc/apt/sources.list; \
fi";

const FIND_GLUSTER: &str = "dpkg -L glusterfs-client 2>/dev/null | grep -E '/bin/gluster$|/sbin/gluster$' | head -1 \
|| command -v gluster 2>/dev/null \
|| (test -x /usr/sbin/gluster && echo /usr/sbin/gluster) \
|| echo gluster";

/// apt reported that a repository or the proxy could not be reached.
fn fetch_failed(exec: &Execution) -> bool {
    exec.contains("Failed to fetch") || exec.contains("Unable to connect")
}

/// Count the peers `gluster peer status` reports as connected.
pub fn connected_peers(status: &str) -> usize {
    status.matches("Peer in Cluster (Connected)").count()
}

/// The mount table line that mounts `volume` from `server` at `mount_point`.
pub fn fstab_entry(server: &str, volume: &str, mount_point: &str) -> String {
    format!("{server}:/{volume} {mount_point} glusterfs defaults,_netdev 0 0")
}

/// `gluster volume create` with one brick per node.
pub fn volume_create(gluster: &str, settings: &Glusterfs, nodes: &[&Container]) -> String {
    let bricks: Vec<String> = nodes
        .iter()
        .map(|n| format!("{}:{}", n.ip_address, settings.brick_path))
        .collect();
    format!(
        "{gluster} volume create {} replica {} {} force 2>&1",
        settings.volume_name,
        settings.replica_count,
        bricks.join(" ")
    )
}

struct Storage<'a> {
    pct: &'a Pct<'a>,
    topology: &'a Topology,
    settings: &'a Glusterfs,
    nodes: Vec<&'a Container>,
}

impl<'a> Storage<'a> {
    fn manager(&self) -> &'a Container {
        self.nodes[0]
    }

    fn peers(&self) -> &[&'a Container] {
        &self.nodes[1..]
    }

    async fn exec(&self, unit: &Container, command: &str, timeout: Option<Duration>) -> Execution {
        self.pct.exec(unit.id, command, timeout).await
    }

    /// Refresh the package lists of `unit`, through the apt cache first and directly when the
    /// cache cannot be reached.
    async fn apt_update(&self, unit: &Container) -> bool {
        let proxy = self.topology.apt_cache().map(|cache| {
            format!(
                "Acquire::http::Proxy \"http://{}:{}\";\n",
                cache.ip_address,
                self.topology.apt_cache_port()
            )
        });
        for attempt in 1..=2 {
            let route = match (&proxy, attempt) {
                (Some(proxy), 1) => write_file(PROXY_FILE, proxy),
                _ => format!("rm -f {PROXY_FILE}"),
            };
            self.exec(unit, &route, None).await;
            let update = self
                .exec(
                    unit,
                    "DEBIAN_FRONTEND=noninteractive apt-get update 2>&1",
                    Some(Duration::from_secs(600)),
                )
                .await;
            if update.succeeded() && !fetch_failed(&update) {
                return true;
            }
            if attempt == 1 && fetch_failed(&update) {
                warn!(target: LOG, "apt update failed on {}, retrying without the proxy", unit.hostname);
                continue;
            }
            error!(target: LOG, "apt update failed on {}: {}", unit.hostname, update.tail(300));
            return false;
        }
        false
    }

    async fn install(&self, unit: &Container, packages: &str) -> bool {
        let install = self
            .exec(
                unit,
                &format!("DEBIAN_FRONTEND=noninteractive apt-get install -y {packages} 2>&1"),
                Some(Duration::from_secs(300)),
            )
            .await;
        if !install.succeeded() {
            error!(target: LOG, "Failed to install {packages} on {}: {}", unit.hostname, install.tail(300));
        }
        install.succeeded()
    }

    async fn prepare_server(&self, unit: &Container) -> bool {
        info!(target: LOG, "Installing GlusterFS server on {}...", unit.hostname);
        self.exec(unit, SOURCES_FIX, None).await;
        if !self.apt_update(unit).await || !self.install(unit, "glusterfs-server glusterfs-client").await {
            return false;
        }
        let found = self
            .exec(unit, "command -v gluster >/dev/null 2>&1 && echo installed || echo missing", None)
            .await;
        if found.output.trim() != "installed" {
            error!(target: LOG, "gluster command not found on {} after installation", unit.hostname);
            return false;
        }
        self.exec(unit, "systemctl enable glusterd 2>&1", None).await;
        self.exec(unit, "systemctl start glusterd 2>&1", Some(Duration::from_secs(30)))
            .await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        let active = self.exec(unit, "systemctl is-active glusterd 2>&1", None).await;
        if !is_active(&active.output) {
            error!(target: LOG, "glusterd is not running on {}", unit.hostname);
            return false;
        }
        true
    }

    async fn prepare_bricks(&self) -> bool {
        let brick = &self.settings.brick_path;
        for unit in self.nodes.iter() {
            let exec = self
                .exec(unit, &format!("mkdir -p {brick} && chmod 755 {brick}"), None)
                .await;
            if !exec.succeeded() {
                error!(target: LOG, "Failed to create brick {brick} on {}: {}", unit.hostname, exec.tail(200));
                return false;
            }
        }
        true
    }

    async fn gluster_command(&self) -> String {
        let found = self.exec(self.manager(), FIND_GLUSTER, None).await;
        match found.output.lines().map(str::trim).find(|l| !l.is_empty()) {
            Some(path) => path.to_string(),
            None => "gluster".to_string(),
        }
    }

    async fn probe_peers(&self, gluster: &str) {
        let manager = self.manager();
        for peer in self.peers().iter() {
            info!(target: LOG, "Probing peer {} from {}...", peer.hostname, manager.hostname);
            let probe = self
                .exec(
                    manager,
                    &format!(
                        "{gluster} peer probe {} 2>&1 || {gluster} peer probe {} 2>&1",
                        peer.hostname, peer.ip_address
                    ),
                    None,
                )
                .await;
            if !probe.succeeded() && !probe.contains("already") {
                warn!(target: LOG, "Peer probe had issues for {}: {}", peer.hostname, probe.tail(200));
            }
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    async fn wait_for_peers(&self, gluster: &str) -> bool {
        let expected = self.peers().len();
        let command = format!("{gluster} peer status 2>&1");
        for attempt in 1..=10 {
            let status = self.exec(self.manager(), &command, None).await;
            let connected = connected_peers(&status.output);
            if connected >= expected {
                info!(target: LOG, "All {connected} peers connected");
                return true;
            }
            debug!(target: LOG, "Waiting for peers to connect... ({attempt}/10)");
            if attempt < 10 {
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
        false
    }

    async fn ensure_volume(&self, gluster: &str) -> bool {
        let manager = self.manager();
        let name = &self.settings.volume_name;
        let exists = self
            .exec(
                manager,
                &format!("{gluster} volume info {name} >/dev/null 2>&1 && echo yes || echo no"),
                None,
            )
            .await;
        if exists.output.trim() == "yes" {
            info!(target: LOG, "Volume '{name}' already exists");
            return true;
        }

        info!(target: LOG, "Creating GlusterFS volume '{name}'...");
        let create = self
            .exec(manager, &volume_create(gluster, self.settings, &self.nodes), None)
            .await;
        let reply = create.output.to_lowercase();
        if !reply.contains("created") && !reply.contains("success") {
            error!(target: LOG, "Volume creation failed: {}", create.tail(500));
            return false;
        }
        let start = self
            .exec(manager, &format!("{gluster} volume start {name} 2>&1"), None)
            .await;
        info!(target: LOG, "{}", start.output);
        let status = self
            .exec(manager, &format!("{gluster} volume status {name} 2>&1"), None)
            .await;
        debug!(target: LOG, "{}", status.output);
        true
    }

    /// Mount the volume on `unit` and record the mount in its fstab.
    async fn mount(&self, unit: &Container, timeout: Option<Duration>) -> bool {
        let manager = self.manager();
        let volume = &self.settings.volume_name;
        let mount_point = &self.settings.mount_point;

        let mkdir = self.exec(unit, &format!("mkdir -p {mount_point}"), None).await;
        if !mkdir.succeeded() {
            error!(target: LOG, "Failed to create mount point on {}: {}", unit.hostname, mkdir.tail(300));
            return false;
        }
        let entry = fstab_entry(&manager.hostname, volume, mount_point);
        let fstab = self
            .exec(
                unit,
                &format!("grep -q '{mount_point}' /etc/fstab || echo '{entry}' >> /etc/fstab"),
                None,
            )
            .await;
        if !fstab.succeeded() {
            warn!(target: LOG, "fstab update had issues on {}: {}", unit.hostname, fstab.tail(200));
        }
        let mount = self
            .exec(
                unit,
                &format!(
                    "/usr/sbin/mount.glusterfs {host}:/{volume} {mount_point} 2>&1 || \
                     /usr/sbin/mount.glusterfs {ip}:/{volume} {mount_point} 2>&1",
                    host = manager.hostname,
                    ip = manager.ip_address
                ),
                timeout,
            )
            .await;
        if !mount.succeeded() && !mount.output.to_lowercase().contains("already mounted") {
            error!(target: LOG, "Failed to mount GlusterFS on {}: {}", unit.hostname, mount.tail(300));
            return false;
        }

        let verify = self
            .exec(
                unit,
                &format!(
                    "mount | grep -q '{mount_point}' && mount | grep '{mount_point}' | grep -q gluster \
                     && echo mounted || echo not_mounted"
                ),
                None,
            )
            .await;
        if verify.output.trim() == "mounted" {
            info!(target: LOG, "{}: volume mounted at {mount_point}", unit.hostname);
            true
        } else {
            error!(target: LOG, "{}: volume not mounted at {mount_point}", unit.hostname);
            false
        }
    }

    async fn ensure_client(&self, unit: &Container) -> bool {
        let probe = self
            .exec(
                unit,
                "test -x /usr/sbin/mount.glusterfs && echo installed || echo not_installed",
                None,
            )
            .await;
        if probe.output.trim() == "installed" {
            debug!(target: LOG, "glusterfs-client already installed on {}", unit.hostname);
            return true;
        }
        info!(target: LOG, "Installing glusterfs-client on {}...", unit.hostname);
        self.exec(unit, SOURCES_FIX, None).await;
        self.apt_update(unit).await && self.install(unit, "glusterfs-client").await
    }

    /// Mount the volume on every cluster member that is not a storage node.
    async fn mount_clients(&self) -> bool {
        let clients: Vec<&Container> = self
            .topology
            .cluster_members()
            .into_iter()
            .filter(|c| !self.nodes.iter().any(|n| n.id == c.id))
            .collect();
        if clients.is_empty() {
            debug!(target: LOG, "No cluster members need a GlusterFS client mount");
            return true;
        }

        let mut failed = Vec::new();
        for unit in clients.iter() {
            if !self.ensure_client(unit).await {
                failed.push(unit.hostname.as_str());
                continue;
            }
            self.exec(unit, "systemctl daemon-reload 2>&1", None).await;
            if !self.mount(unit, Some(Duration::from_secs(30))).await {
                failed.push(unit.hostname.as_str());
            }
        }
        if !failed.is_empty() {
            error!(target: LOG, "Failed to mount GlusterFS on {} node(s): {}", failed.len(), failed.join(", "));
            return false;
        }
        true
    }
}

/// Set up the configured GlusterFS volume. Returns true when no storage is configured.
pub async fn setup_glusterfs(pct: &Pct<'_>, topology: &Topology) -> bool {
    let Some(settings) = topology.glusterfs.as_ref() else {
        info!(target: LOG, "GlusterFS not configured, skipping");
        return true;
    };
    let nodes: Vec<&Container> = topology
        .containers
        .iter()
        .filter(|c| settings.cluster_nodes.contains(&c.id))
        .collect();
    if nodes.len() < 2 {
        error!(target: LOG, "GlusterFS needs at least 2 nodes, {} configured", nodes.len());
        return false;
    }
    let storage = Storage {
        pct,
        topology,
        settings,
        nodes,
    };

    for unit in storage.nodes.iter() {
        if !storage.prepare_server(unit).await {
            return false;
        }
    }
    tokio::time::sleep(Duration::from_secs(topology.waits.glusterfs_setup)).await;

    if !storage.prepare_bricks().await {
        return false;
    }
    let gluster = storage.gluster_command().await;
    debug!(target: LOG, "Using gluster command '{gluster}'");
    storage.probe_peers(&gluster).await;
    if !storage.wait_for_peers(&gluster).await {
        warn!(target: LOG, "Not all peers connected, continuing with volume creation");
    }
    if !storage.ensure_volume(&gluster).await {
        return false;
    }
    for unit in storage.nodes.iter() {
        if !storage.mount(unit, None).await {
            return false;
        }
    }
    if !storage.mount_clients().await {
        return false;
    }

    info!(
        target: LOG,
        "GlusterFS volume '{}' ready: {} bricks at {}, mounted at {} (manager {})",
        settings.volume_name,
        storage.nodes.len(),
        settings.brick_path,
        settings.mount_point,
        storage.manager().hostname
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_connected_peers_only() {
        let status = "Number of Peers: 2\n\n\
                      Hostname: gluster-2\nState: Peer in Cluster (Connected)\n\n\
                      Hostname: gluster-3\nState: Peer in Cluster (Disconnected)";
        assert_eq!(connected_peers(status), 1);
    }

    #[test]
    fn fstab_mounts_after_network() {
        assert_eq!(
            fstab_entry("gluster-1", "data", "/mnt/data"),
            "gluster-1:/data /mnt/data glusterfs defaults,_netdev 0 0"
        );
    }
}
