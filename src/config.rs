// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeMap, fmt, net::Ipv4Addr, str::FromStr, time::Duration};

use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};

/// Config, along with its children, is the model for an environment as written in the `enva`
/// topology file. The file is deserialized into a Config object and then resolved into a
/// `Topology` for one named environment.
///
/// The file model is intentionally different from the resolved model: ids in the file are
/// relative to the environment's `id_base`, and addresses are only octets inside the
/// environment's network. Since they are decoupled, the file format can stay terse while the rest
/// of the program only ever sees absolute ids and full addresses.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_apt_cache_ct")]
    pub apt_cache_ct: String,
    #[serde(default)]
    pub environments: BTreeMap<String, Environment>,
    pub lxc: Lxc,
    #[serde(default)]
    pub ssh: Ssh,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub ct: Vec<Unit>,
    #[serde(default)]
    pub templates: Vec<Unit>,
    pub kubernetes: Option<Kubernetes>,
    #[serde(default)]
    pub services: Services,
    pub glusterfs: Option<Glusterfs>,
    #[serde(default)]
    pub template_config: TemplateConfig,
    #[serde(default)]
    pub waits: Waits,
    pub backup: Option<Backup>,
}

fn default_apt_cache_ct() -> String {
    "apt-cache".to_string()
}

/// Per-environment overrides. Anything left unset falls back to the top-level value.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Environment {
    pub id_base: Option<u32>,
    pub network: Option<String>,
    pub lxc_host: Option<String>,
    pub dns_server: Option<String>,
    /// DNS domain of the environment's service records.
    pub domain: Option<String>,
    pub postgres_host: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Lxc {
    pub host: Option<String>,
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default = "default_template_dir")]
    pub template_dir: String,
    #[serde(default = "default_gateway_octet")]
    pub gateway_octet: u8,
}

fn default_storage() -> String {
    "local-lvm".to_string()
}

fn default_bridge() -> String {
    "vmbr0".to_string()
}

fn default_template_dir() -> String {
    "/var/lib/vz/template/cache".to_string()
}

fn default_gateway_octet() -> u8 {
    1
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Ssh {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_true")]
    pub batch_mode: bool,
    #[serde(default = "default_exec_timeout")]
    pub default_exec_timeout: u64,
}

impl Default for Ssh {
    fn default() -> Self {
        Ssh {
            user: default_ssh_user(),
            connect_timeout: default_connect_timeout(),
            batch_mode: true,
            default_exec_timeout: default_exec_timeout(),
        }
    }
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_exec_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub name: String,
    pub password: Option<String>,
    #[serde(default = "default_sudo_group")]
    pub sudo_group: String,
}

fn default_sudo_group() -> String {
    "sudo".to_string()
}

/// A compute unit (or template unit) as written in the topology file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Unit {
    pub name: String,
    pub id: u32,
    pub ip: u8,
    pub hostname: Option<String>,
    pub template: Option<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default = "default_true")]
    pub nested: bool,
    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub params: toml::Table,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resources {
    #[serde(default = "default_memory")]
    pub memory: u32,
    #[serde(default = "default_memory")]
    pub swap: u32,
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_rootfs_size")]
    pub rootfs_size: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Resources {
            memory: default_memory(),
            swap: default_memory(),
            cores: default_cores(),
            rootfs_size: default_rootfs_size(),
        }
    }
}

fn default_memory() -> u32 {
    2048
}

fn default_cores() -> u32 {
    4
}

fn default_rootfs_size() -> u32 {
    20
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Kubernetes {
    #[serde(default)]
    pub control: Vec<u32>,
    #[serde(default)]
    pub workers: Vec<u32>,
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Services {
    #[serde(default)]
    pub apt_cache: AptCache,
    pub postgresql: Option<Postgresql>,
    pub haproxy: Option<Haproxy>,
    pub rancher: Option<Rancher>,
    #[serde(default)]
    pub dns: Dns,
    pub certa: Option<Certa>,
    pub cockroachdb: Option<Cockroachdb>,
    pub github_runner: Option<GithubRunner>,
}

impl Services {
    /// DNS host names of the services published through the load balancer, in a fixed order.
    pub fn published_names(&self) -> Vec<&str> {
        [
            self.apt_cache.name.as_deref(),
            self.postgresql.as_ref().and_then(|s| s.name.as_deref()),
            self.haproxy.as_ref().and_then(|s| s.name.as_deref()),
            self.rancher.as_ref().and_then(|s| s.name.as_deref()),
            self.cockroachdb.as_ref().and_then(|s| s.name.as_deref()),
            self.certa.as_ref().and_then(|s| s.name.as_deref()),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AptCache {
    #[serde(default = "default_apt_cache_port")]
    pub port: u16,
    pub name: Option<String>,
}

impl Default for AptCache {
    fn default() -> Self {
        AptCache {
            port: default_apt_cache_port(),
            name: None,
        }
    }
}

fn default_apt_cache_port() -> u16 {
    3142
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Postgresql {
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    #[serde(default = "default_postgres")]
    pub username: String,
    #[serde(default = "default_postgres")]
    pub password: String,
    #[serde(default = "default_postgres")]
    pub database: String,
    pub name: Option<String>,
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres() -> String {
    "postgres".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Haproxy {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_stats_port")]
    pub stats_port: u16,
    pub name: Option<String>,
}

fn default_http_port() -> u16 {
    80
}

fn default_stats_port() -> u16 {
    8404
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Rancher {
    #[serde(default = "default_rancher_image")]
    pub image: String,
    #[serde(default = "default_rancher_port")]
    pub port: u16,
    pub name: Option<String>,
}

fn default_rancher_image() -> String {
    "rancher/rancher:latest".to_string()
}

fn default_rancher_port() -> u16 {
    30443
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Dns {
    #[serde(default = "default_dns_port")]
    pub port: u16,
}

impl Default for Dns {
    fn default() -> Self {
        Dns {
            port: default_dns_port(),
        }
    }
}

fn default_dns_port() -> u16 {
    53
}

/// The certificate authority web application, run as a cluster workload.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Certa {
    #[serde(default = "default_certa_image")]
    pub image: String,
    #[serde(default = "default_certa_port")]
    pub port: u16,
    #[serde(default = "default_certa")]
    pub namespace: String,
    #[serde(default = "default_one")]
    pub replicas: u32,
    pub database_host: Option<String>,
    pub database_port: Option<u16>,
    #[serde(default = "default_certa")]
    pub database_name: String,
    pub database_user: Option<String>,
    pub database_password: Option<String>,
    pub name: Option<String>,
}

fn default_certa_image() -> String {
    "judyandiealvarez/certa:latest".to_string()
}

fn default_certa_port() -> u16 {
    30080
}

fn default_certa() -> String {
    "certa".to_string()
}

fn default_one() -> u32 {
    1
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Cockroachdb {
    #[serde(default = "default_cockroach_version")]
    pub version: String,
    #[serde(default = "default_cockroach_nodes")]
    pub nodes: u32,
    #[serde(default = "default_cockroach_storage")]
    pub storage: String,
    #[serde(default = "default_cockroach_password")]
    pub password: String,
    #[serde(default = "default_cockroach_sql_port")]
    pub sql_port: u16,
    #[serde(default = "default_cockroach_http_port")]
    pub http_port: u16,
    #[serde(default = "default_cockroach_grpc_port")]
    pub grpc_port: u16,
    pub name: Option<String>,
}

fn default_cockroach_version() -> String {
    "v25.2.4".to_string()
}

fn default_cockroach_nodes() -> u32 {
    3
}

fn default_cockroach_storage() -> String {
    "10Gi".to_string()
}

fn default_cockroach_password() -> String {
    "root123".to_string()
}

fn default_cockroach_sql_port() -> u16 {
    32657
}

fn default_cockroach_http_port() -> u16 {
    30080
}

fn default_cockroach_grpc_port() -> u16 {
    32658
}

/// Self-hosted CI runners, managed by the actions runner controller.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GithubRunner {
    /// Falls back to the `ENVA_GITHUB_TOKEN` environment variable.
    pub token: Option<String>,
    pub organization: Option<String>,
    #[serde(default = "default_one")]
    pub replicas: u32,
    #[serde(default = "default_runner_label")]
    pub label: String,
    #[serde(default = "default_runner_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_runner_namespace")]
    pub namespace: String,
    pub group: Option<String>,
}

fn default_runner_label() -> String {
    "self-hosted".to_string()
}

fn default_runner_prefix() -> String {
    "k3s-runner".to_string()
}

fn default_runner_namespace() -> String {
    "actions-runner-system".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Glusterfs {
    #[serde(default = "default_volume_name")]
    pub volume_name: String,
    #[serde(default = "default_brick_path")]
    pub brick_path: String,
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
    #[serde(default = "default_replica_count")]
    pub replica_count: u32,
    #[serde(default)]
    pub cluster_nodes: Vec<u32>,
}

fn default_volume_name() -> String {
    "swarm-storage".to_string()
}

fn default_brick_path() -> String {
    "/gluster/brick".to_string()
}

fn default_mount_point() -> String {
    "/mnt/gluster".to_string()
}

fn default_replica_count() -> u32 {
    2
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TemplateConfig {
    /// Base template archives, in order of preference. The last one is downloaded when none of
    /// them is present on the control host.
    #[serde(default)]
    pub base: Vec<String>,
    /// Archive names kept when template archives are cleaned up.
    #[serde(default)]
    pub preserve: Vec<String>,
}

/// Poll bounds and settle delays, in seconds unless noted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Waits {
    #[serde(default = "default_ready_attempts")]
    pub container_ready_max_attempts: u32,
    #[serde(default = "default_ready_sleep")]
    pub container_ready_sleep: u64,
    #[serde(default = "default_glusterfs_setup")]
    pub glusterfs_setup: u64,
    #[serde(default = "default_port_sweep_settle")]
    pub port_sweep_settle: u64,
}

impl Default for Waits {
    fn default() -> Self {
        Waits {
            container_ready_max_attempts: default_ready_attempts(),
            container_ready_sleep: default_ready_sleep(),
            glusterfs_setup: default_glusterfs_setup(),
            port_sweep_settle: default_port_sweep_settle(),
        }
    }
}

fn default_ready_attempts() -> u32 {
    200
}

fn default_ready_sleep() -> u64 {
    3
}

fn default_glusterfs_setup() -> u64 {
    10
}

fn default_port_sweep_settle() -> u64 {
    5
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Backup {
    pub container_id: u32,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default)]
    pub items: Vec<BackupItem>,
}

fn default_backup_dir() -> String {
    "/backup".to_string()
}

fn default_name_prefix() -> String {
    "backup".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackupItem {
    pub name: String,
    pub source_container_id: u32,
    pub source_path: String,
    pub archive_base: Option<String>,
    pub archive_path: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String, std::io::Error),
    Parse(toml::de::Error),
    UnknownEnvironment(String, Vec<String>),
    MissingLxcHost,
    InvalidNetwork(String),
    AddressOutOfNetwork(String, u8),
    IdOutOfRange(String, u32),
    DuplicateId(u32),
    DanglingId(&'static str, u32),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "could not read config file \"{path}\": {e}"),
            ConfigError::Parse(e) => write!(f, "could not parse config file: {e}"),
            ConfigError::UnknownEnvironment(name, known) => write!(
                f,
                "environment '{name}' not found in config (available: {})",
                known.join(", ")
            ),
            ConfigError::MissingLxcHost => write!(f, "no LXC host configured"),
            ConfigError::InvalidNetwork(net) => write!(f, "invalid network '{net}'"),
            ConfigError::AddressOutOfNetwork(name, octet) => {
                write!(f, "address .{octet} of '{name}' is outside the network")
            }
            ConfigError::IdOutOfRange(name, id) => {
                write!(f, "container id {id} of '{name}' overflows the environment's id_base")
            }
            ConfigError::DuplicateId(id) => write!(f, "container id {id} is declared twice"),
            ConfigError::DanglingId(section, id) => {
                write!(f, "{section} references container id {id}, which is not declared")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A compute unit with absolute id and resolved address.
#[derive(Debug, Clone)]
pub struct Container {
    pub name: String,
    pub id: u32,
    pub ip_address: Ipv4Addr,
    pub hostname: String,
    pub template: Option<String>,
    pub resources: Resources,
    pub privileged: bool,
    pub nested: bool,
    pub autostart: bool,
    pub actions: Vec<String>,
    pub params: toml::Table,
}

impl Container {
    /// Look up an integer parameter from the unit's free-form `params` table.
    pub fn param_u16(&self, key: &str) -> Option<u16> {
        self.params
            .get(key)
            .and_then(|v| v.as_integer())
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// Where one environment publishes its service records.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsZone {
    pub environment: String,
    pub domain: String,
    pub network: Ipv4Cidr,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterTopology {
    pub control: Vec<u32>,
    pub workers: Vec<u32>,
    pub actions: Vec<String>,
}

/// Topology is the resolved, immutable view of one environment: every id is absolute, every
/// address is computed, and every cross reference has been checked.
#[derive(Debug, Clone)]
pub struct Topology {
    pub environment: String,
    pub lxc_host: String,
    pub lxc: Lxc,
    pub ssh: Ssh,
    pub network: Ipv4Cidr,
    pub gateway: Ipv4Addr,
    pub dns_server: Option<String>,
    pub postgres_host: Option<String>,
    /// Every environment of the file that has a domain and a network.
    pub dns_zones: Vec<DnsZone>,
    pub users: Vec<User>,
    pub apt_cache_ct: String,
    pub containers: Vec<Container>,
    pub templates: Vec<Container>,
    pub kubernetes: Option<ClusterTopology>,
    pub services: Services,
    pub glusterfs: Option<Glusterfs>,
    pub template_config: TemplateConfig,
    pub waits: Waits,
    pub backup: Option<Backup>,
}

impl Topology {
    /// Read the topology file at `path` and resolve it for `environment`.
    pub fn load(path: &str, environment: &str) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_string(), e))?;
        Self::parse(&contents, environment)
    }

    pub fn parse(contents: &str, environment: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents).map_err(ConfigError::Parse)?;
        Self::resolve(config, environment)
    }

    /// Resolve a raw `Config` for one environment, backfilling computed fields.
    pub fn resolve(config: Config, environment: &str) -> Result<Self, ConfigError> {
        let env = if config.environments.is_empty() {
            Environment::default()
        } else {
            match config.environments.get(environment) {
                Some(env) => env.clone(),
                None => {
                    return Err(ConfigError::UnknownEnvironment(
                        environment.to_string(),
                        config.environments.keys().cloned().collect(),
                    ))
                }
            }
        };

        let id_base = env.id_base.unwrap_or(3000);
        let network_str = env
            .network
            .clone()
            .unwrap_or_else(|| "10.11.3.0/24".to_string());
        let network = Ipv4Cidr::from_str(&network_str)
            .map_err(|_| ConfigError::InvalidNetwork(network_str.clone()))?;
        let lxc_host = env
            .lxc_host
            .clone()
            .or_else(|| config.lxc.host.clone())
            .ok_or(ConfigError::MissingLxcHost)?;

        let gateway = address_in(&network, config.lxc.gateway_octet)
            .ok_or_else(|| ConfigError::InvalidNetwork(network_str.clone()))?;

        let offset = |what: &str, id: u32| -> Result<u32, ConfigError> {
            id.checked_add(id_base)
                .ok_or_else(|| ConfigError::IdOutOfRange(what.to_string(), id))
        };

        let resolve_unit = |unit: &Unit| -> Result<Container, ConfigError> {
            let ip_address = address_in(&network, unit.ip)
                .ok_or_else(|| ConfigError::AddressOutOfNetwork(unit.name.clone(), unit.ip))?;
            Ok(Container {
                name: unit.name.clone(),
                id: offset(&unit.name, unit.id)?,
                ip_address,
                hostname: unit.hostname.clone().unwrap_or_else(|| unit.name.clone()),
                template: unit.template.clone(),
                resources: unit.resources.clone(),
                privileged: unit.privileged,
                nested: unit.nested,
                autostart: unit.autostart,
                actions: unit.actions.clone(),
                params: unit.params.clone(),
            })
        };

        let containers = config
            .ct
            .iter()
            .map(resolve_unit)
            .collect::<Result<Vec<_>, _>>()?;
        let templates = config
            .templates
            .iter()
            .map(resolve_unit)
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = std::collections::HashSet::new();
        for unit in containers.iter().chain(templates.iter()) {
            if !seen.insert(unit.id) {
                return Err(ConfigError::DuplicateId(unit.id));
            }
        }

        let offset_all = |what: &str, ids: &[u32]| -> Result<Vec<u32>, ConfigError> {
            ids.iter().map(|id| offset(what, *id)).collect()
        };
        let kubernetes = match config.kubernetes.as_ref() {
            Some(k) => Some(ClusterTopology {
                control: offset_all("kubernetes", &k.control)?,
                workers: offset_all("kubernetes", &k.workers)?,
                actions: k.actions.clone(),
            }),
            None => None,
        };
        let glusterfs = match config.glusterfs.clone() {
            Some(mut g) => {
                g.cluster_nodes = offset_all("glusterfs", &g.cluster_nodes)?;
                Some(g)
            }
            None => None,
        };
        let backup = match config.backup.clone() {
            Some(mut b) => {
                b.container_id = offset("backup", b.container_id)?;
                for item in b.items.iter_mut() {
                    item.source_container_id = offset(&item.name, item.source_container_id)?;
                }
                Some(b)
            }
            None => None,
        };

        let dns_zones = config
            .environments
            .iter()
            .filter_map(|(name, env)| {
                let domain = env.domain.as_ref().filter(|d| !d.is_empty())?;
                let network = Ipv4Cidr::from_str(env.network.as_deref()?).ok()?;
                Some(DnsZone {
                    environment: name.clone(),
                    domain: domain.clone(),
                    network,
                })
            })
            .collect();

        let topology = Topology {
            environment: environment.to_string(),
            lxc_host,
            lxc: config.lxc,
            ssh: config.ssh,
            network,
            gateway,
            dns_server: env.dns_server,
            postgres_host: env.postgres_host,
            dns_zones,
            users: config.users,
            apt_cache_ct: config.apt_cache_ct,
            containers,
            templates,
            kubernetes,
            services: config.services,
            glusterfs,
            template_config: config.template_config,
            waits: config.waits,
            backup,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Check that every id referenced outside the unit lists names a declared unit.
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(k8s) = &self.kubernetes {
            for id in k8s.control.iter().chain(k8s.workers.iter()) {
                if self.container(*id).is_none() {
                    return Err(ConfigError::DanglingId("kubernetes", *id));
                }
            }
        }
        if let Some(gluster) = &self.glusterfs {
            for id in gluster.cluster_nodes.iter() {
                if self.container(*id).is_none() {
                    return Err(ConfigError::DanglingId("glusterfs", *id));
                }
            }
        }
        if let Some(backup) = &self.backup {
            if self.container(backup.container_id).is_none() {
                return Err(ConfigError::DanglingId("backup", backup.container_id));
            }
            for item in backup.items.iter() {
                if self.container(item.source_container_id).is_none() {
                    return Err(ConfigError::DanglingId("backup", item.source_container_id));
                }
            }
        }
        Ok(())
    }

    pub fn container(&self, id: u32) -> Option<&Container> {
        self.containers.iter().find(|c| c.id == id)
    }

    pub fn container_named(&self, name: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Find a unit by id among both compute and template units.
    pub fn unit(&self, id: u32) -> Option<&Container> {
        self.containers
            .iter()
            .chain(self.templates.iter())
            .find(|c| c.id == id)
    }

    pub fn apt_cache(&self) -> Option<&Container> {
        self.container_named(&self.apt_cache_ct)
    }

    pub fn apt_cache_port(&self) -> u16 {
        self.services.apt_cache.port
    }

    /// The user that owns interactive access to every unit: the first configured user, or root.
    pub fn default_user(&self) -> &str {
        match self.users.first() {
            Some(user) => &user.name,
            None => "root",
        }
    }

    /// The `user@host` destination of the control host.
    pub fn lxc_destination(&self) -> String {
        format!("{}@{}", self.ssh.user, self.lxc_host)
    }

    pub fn is_cluster_member(&self, id: u32) -> bool {
        match &self.kubernetes {
            Some(k8s) => k8s.control.contains(&id) || k8s.workers.contains(&id),
            None => false,
        }
    }

    pub fn is_cluster_control(&self, id: u32) -> bool {
        match &self.kubernetes {
            Some(k8s) => k8s.control.contains(&id),
            None => false,
        }
    }

    pub fn cluster_control(&self) -> Option<&Container> {
        let k8s = self.kubernetes.as_ref()?;
        self.containers.iter().find(|c| k8s.control.contains(&c.id))
    }

    pub fn cluster_workers(&self) -> Vec<&Container> {
        match &self.kubernetes {
            Some(k8s) => self
                .containers
                .iter()
                .filter(|c| k8s.workers.contains(&c.id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Cluster members in declared unit order.
    pub fn cluster_members(&self) -> Vec<&Container> {
        self.containers
            .iter()
            .filter(|c| self.is_cluster_member(c.id))
            .collect()
    }

    pub fn cluster_actions(&self) -> &[String] {
        match &self.kubernetes {
            Some(k8s) => &k8s.actions,
            None => &[],
        }
    }

    pub fn prefix_length(&self) -> u8 {
        self.network.network_length()
    }

    /// The host part of `unit`'s address within this environment's network.
    pub fn host_octet(&self, unit: &Container) -> Option<u8> {
        let host = u32::from(unit.ip_address).checked_sub(u32::from(self.network.first_address()))?;
        u8::try_from(host).ok()
    }

    pub fn container_ready_sleep(&self) -> Duration {
        Duration::from_secs(self.waits.container_ready_sleep)
    }
}

/// Compute the address with host part `octet` inside `network`.
pub fn address_in(network: &Ipv4Cidr, octet: u8) -> Option<Ipv4Addr> {
    let addr = Ipv4Addr::from(u32::from(network.first_address()).checked_add(u32::from(octet))?);
    if network.contains(&addr) {
        Some(addr)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
        [environments.dev]
        id_base = 4000
        network = "10.20.0.0/24"

        [environments.prod]
        network = "10.30.0.0/24"
        lxc_host = "pve-prod"

        [lxc]
        host = "pve-dev"

        [[users]]
        name = "jaime"
        password = "secret"

        [[ct]]
        name = "apt-cache"
        id = 1
        ip = 10

        [[ct]]
        name = "k3s-control"
        id = 11
        ip = 11

        [[ct]]
        name = "k3s-worker-1"
        id = 12
        ip = 12
        resources = { memory = 8192 }

        [kubernetes]
        control = [11]
        workers = [12]
    "#;

    #[test]
    fn resolves_ids_and_addresses() {
        let topology = Topology::parse(BASIC, "dev").unwrap();
        let worker = topology.container(4012).unwrap();
        assert_eq!(worker.ip_address, Ipv4Addr::new(10, 20, 0, 12));
        assert_eq!(worker.hostname, "k3s-worker-1");
        assert_eq!(worker.resources.memory, 8192);
        assert_eq!(worker.resources.cores, 4);
        assert_eq!(topology.gateway, Ipv4Addr::new(10, 20, 0, 1));
        assert_eq!(topology.lxc_host, "pve-dev");
        assert_eq!(topology.default_user(), "jaime");
        assert_eq!(topology.cluster_control().unwrap().id, 4011);
        assert!(topology.is_cluster_member(4012));
        assert!(!topology.is_cluster_member(4001));
    }

    #[test]
    fn environment_overrides_host_and_defaults_id_base() {
        let topology = Topology::parse(BASIC, "prod").unwrap();
        assert_eq!(topology.lxc_host, "pve-prod");
        assert!(topology.container(3011).is_some());
        assert_eq!(topology.lxc_destination(), "root@pve-prod");
    }

    #[test]
    fn unknown_environment_is_rejected() {
        let err = Topology::parse(BASIC, "staging").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEnvironment(_, _)));
        assert!(err.to_string().contains("dev, prod"));
    }

    #[test]
    fn dangling_cluster_id_is_rejected() {
        let contents = BASIC.replace("workers = [12]", "workers = [12, 13]");
        let err = Topology::parse(&contents, "dev").unwrap_err();
        assert!(matches!(err, ConfigError::DanglingId("kubernetes", 4013)));
    }

    #[test]
    fn id_base_overflow_is_rejected() {
        let contents = BASIC.replace("id_base = 4000", "id_base = 4294967290");
        let err = Topology::parse(&contents, "dev").unwrap_err();
        assert!(matches!(err, ConfigError::IdOutOfRange(ref name, 11) if name == "k3s-control"));
    }

    #[test]
    fn address_outside_a_small_network_is_rejected() {
        let contents = BASIC
            .replace("network = \"10.20.0.0/24\"", "network = \"10.20.0.0/28\"")
            .replace("ip = 12", "ip = 40");
        let err = Topology::parse(&contents, "dev").unwrap_err();
        assert!(matches!(err, ConfigError::AddressOutOfNetwork(ref name, 40) if name == "k3s-worker-1"));
    }

    #[test]
    fn dangling_backup_source_is_rejected() {
        let contents = format!(
            "{BASIC}\n[backup]\ncontainer_id = 1\nbackup_dir = \"/backup\"\n\n\
             [[backup.items]]\nname = \"token\"\nsource_container_id = 13\nsource_path = \"/etc/token\"\n"
        );
        let err = Topology::parse(&contents, "dev").unwrap_err();
        assert!(matches!(err, ConfigError::DanglingId("backup", 4013)));
    }
}
