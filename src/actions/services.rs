// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Service installation and configuration: HAProxy, PostgreSQL, Docker and GlusterFS.

use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use log::{error, info, warn};

use super::system::AptInstall;
use super::{is_active, log_failure, missing, write_file, Action, ActionParams, Script, ScriptStep};
use crate::config::{Container, Topology};
use crate::remote::Executor;

const HAPROXY_CFG: &str = "/etc/haproxy/haproxy.cfg";
const HAPROXY_PEM: &str = "/etc/haproxy/haproxy.pem";

pub fn haproxy_install<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(AptInstall::new(
        "haproxy installation",
        "install_haproxy",
        p.apt,
        vec!["haproxy".to_string()],
    ))
}

/// Listening ports of the load balancer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HaproxyPorts {
    pub http: u16,
    pub https: u16,
    pub stats: u16,
}

impl HaproxyPorts {
    /// Ports from the unit's parameters, falling back to the service settings and then to the
    /// usual defaults.
    pub fn of(unit: Option<&Container>, topology: &Topology) -> Self {
        let service = topology.services.haproxy.as_ref();
        let param = |key: &str| unit.and_then(|u| u.param_u16(key));
        HaproxyPorts {
            http: param("http_port")
                .or(service.map(|s| s.http_port))
                .unwrap_or(80),
            https: param("https_port").unwrap_or(443),
            stats: param("stats_port")
                .or(service.map(|s| s.stats_port))
                .unwrap_or(8404),
        }
    }
}

/// Render the HAProxy configuration for this environment.
///
/// HTTP and HTTPS traffic is balanced over the cluster workers. When the environment runs a
/// `pgsql` unit and declares the PostgreSQL service, PostgreSQL is passed through in TCP mode.
pub fn haproxy_config(topology: &Topology, ports: HaproxyPorts, tls: bool) -> String {
    let mut frontends = vec![
        format!("frontend http-in\n    bind *:{}\n    default_backend nodes", ports.http),
        if tls {
            format!(
                "frontend https-in\n    bind *:{} ssl crt {HAPROXY_PEM}\n    mode http\n    default_backend nodes",
                ports.https
            )
        } else {
            format!(
                "frontend https-in\n    bind *:{}\n    mode tcp\n    default_backend nodes",
                ports.https
            )
        },
    ];

    let workers = topology.cluster_workers();
    let servers = if workers.is_empty() {
        "    server dummy 127.0.0.1:80 check".to_string()
    } else {
        workers
            .iter()
            .map(|w| format!("    server {} {}:80 check", w.name, w.ip_address))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let mut backends = vec![format!("backend nodes\n    balance roundrobin\n{servers}")];

    if let (Some(pg), Some(unit)) = (
        topology.services.postgresql.as_ref(),
        topology.container_named("pgsql"),
    ) {
        frontends.push(format!(
            "frontend postgres-in\n    bind *:{}\n    mode tcp\n    default_backend backend_postgres",
            pg.port
        ));
        backends.push(format!(
            "backend backend_postgres\n    mode tcp\n    server pgsql {}:{} check",
            unit.ip_address, pg.port
        ));
    }

    format!(
        "global\n    log /dev/log local0\n    log /dev/log local1 notice\n    maxconn 2048\n    daemon\n\
         defaults\n    log     global\n    mode    http\n    option  httplog\n    option  dontlognull\n    \
         timeout connect 5s\n    timeout client  50s\n    timeout server  50s\n\
         {}\n\n{}\n\n\
         listen stats\n    bind *:{}\n    mode http\n    stats enable\n    stats uri /\n    stats refresh 10s\n",
        frontends.join("\n\n"),
        backends.join("\n\n"),
        ports.stats
    )
}

struct HaproxyConfigure<'a> {
    shell: Option<&'a dyn Executor>,
    topology: &'a Topology,
    ports: HaproxyPorts,
}

const HAPROXY: &str = "configure_haproxy";

impl HaproxyConfigure<'_> {
    async fn certificate(&self, shell: &dyn Executor) -> bool {
        let check = shell
            .run(&format!("test -f {HAPROXY_PEM} && echo exists || echo missing"))
            .await;
        if check.output.trim() == "exists" {
            info!(target: HAPROXY, "SSL certificate exists at {HAPROXY_PEM}");
            return true;
        }
        info!(target: HAPROXY, "Generating self-signed SSL certificate...");
        let generate = shell
            .run(&format!(
                "cd /tmp && openssl req -x509 -newkey rsa:2048 -keyout haproxy.key -out haproxy.crt -days 365 -nodes -subj \"/CN=*\" >/dev/null 2>&1 \
                 && cat haproxy.key haproxy.crt > {HAPROXY_PEM} && chmod 644 {HAPROXY_PEM} && rm -f haproxy.key haproxy.crt"
            ))
            .await;
        if !generate.succeeded() {
            warn!(target: HAPROXY, "Failed to generate SSL certificate, HTTPS stays in TCP mode: {}", generate.tail(200));
            return false;
        }
        true
    }

    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(HAPROXY, "Shell")) else {
            return false;
        };
        let tls = self.certificate(shell).await;
        let config = haproxy_config(self.topology, self.ports, tls);
        let exec = shell.run(&write_file(HAPROXY_CFG, &config)).await;
        if !exec.succeeded() {
            log_failure(HAPROXY, "write haproxy configuration", &exec);
            return false;
        }
        let reload = shell
            .run("systemctl reload haproxy 2>&1 || systemctl restart haproxy 2>&1")
            .await;
        if !reload.succeeded() {
            warn!(target: HAPROXY, "Failed to reload HAProxy: {}", reload.tail(200));
        }
        true
    }
}

impl Action for HaproxyConfigure<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "haproxy configuration".to_string()
    }
}

pub fn haproxy_configure<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(HaproxyConfigure {
        shell: p.shell,
        topology: p.topology,
        ports: HaproxyPorts::of(p.unit, p.topology),
    })
}

pub fn haproxy_systemd<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(Script::new(
        "haproxy systemd override",
        "configure_haproxy_systemd",
        p.shell,
        vec![
            ScriptStep::new(
                "write haproxy systemd override",
                write_file(
                    "/etc/systemd/system/haproxy.service.d/override.conf",
                    "[Service]\nType=notify\nPrivateNetwork=no\nProtectSystem=no\nProtectHome=no\n\
                     ExecStart=\nExecStart=/usr/sbin/haproxy -Ws -f $CONFIG -p $PIDFILE $EXTRAOPTS\n",
                ),
            ),
            ScriptStep::new("reload systemd", "systemctl daemon-reload"),
        ],
    ))
}

struct HaproxyEnable<'a> {
    shell: Option<&'a dyn Executor>,
}

const HAPROXY_ENABLE: &str = "enable_haproxy_service";

impl HaproxyEnable<'_> {
    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(HAPROXY_ENABLE, "Shell")) else {
            return false;
        };
        let validate = shell.run(&format!("haproxy -c -f {HAPROXY_CFG} 2>&1")).await;
        if validate.contains("Fatal errors found") || validate.contains("[ALERT]") {
            error!(target: HAPROXY_ENABLE, "HAProxy configuration is invalid: {}", validate.output);
            return false;
        }

        let restart = shell.run("systemctl restart haproxy").await;
        if !restart.succeeded() {
            let status = shell
                .run("systemctl status haproxy --no-pager -l 2>&1 | head -20")
                .await;
            warn!(target: HAPROXY_ENABLE, "HAProxy restart failed: {}", status.output);
            let active = shell.run("systemctl is-active haproxy").await;
            if !is_active(&active.output) {
                error!(target: HAPROXY_ENABLE, "HAProxy is not running");
                return false;
            }
        }

        let enable = shell.run("systemctl enable haproxy").await;
        if !enable.succeeded() {
            log_failure(HAPROXY_ENABLE, "enable haproxy", &enable);
            return false;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        let active = shell.run("systemctl is-active haproxy").await;
        if !is_active(&active.output) {
            error!(target: HAPROXY_ENABLE, "HAProxy is not active: {}", active.output);
            return false;
        }
        true
    }
}

impl Action for HaproxyEnable<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "haproxy service enablement".to_string()
    }
}

pub fn haproxy_enable<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(HaproxyEnable { shell: p.shell })
}

/// PostgreSQL settings for one unit, from its parameters and the service settings.
#[derive(Debug, Clone, PartialEq)]
struct Postgres {
    version: String,
    port: u16,
    password: String,
}

impl Postgres {
    fn of(unit: Option<&Container>, topology: &Topology) -> Self {
        let service = topology.services.postgresql.as_ref();
        Postgres {
            version: unit
                .and_then(|u| u.param_str("version"))
                .unwrap_or("17")
                .to_string(),
            port: unit
                .and_then(|u| u.param_u16("port"))
                .or(service.map(|s| s.port))
                .unwrap_or(5432),
            password: unit
                .and_then(|u| u.param_str("password"))
                .map(str::to_string)
                .or(service.map(|s| s.password.clone()))
                .unwrap_or_else(|| "postgres".to_string()),
        }
    }

    fn service(&self) -> String {
        format!("postgresql@{}-main", self.version)
    }

    fn conf_dir(&self) -> String {
        format!("/etc/postgresql/{}/main", self.version)
    }
}

pub fn postgres_install<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    let pg = Postgres::of(p.unit, p.topology);
    Box::new(AptInstall::new(
        "postgresql installation",
        "install_postgresql",
        p.apt,
        vec![format!("postgresql-{}", pg.version), "postgresql-contrib".to_string()],
    ))
}

struct PostgresService<'a> {
    shell: Option<&'a dyn Executor>,
    pg: Postgres,
}

const PG_SERVICE: &str = "configure_postgres_service";

impl PostgresService<'_> {
    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(PG_SERVICE, "Shell")) else {
            return false;
        };
        let service = self.pg.service();
        let enable = shell.run(&format!("systemctl enable {service}")).await;
        if !enable.succeeded() {
            log_failure(PG_SERVICE, "enable postgresql", &enable);
            return false;
        }
        let start = shell.run(&format!("systemctl start {service}")).await;
        if !start.succeeded() {
            log_failure(PG_SERVICE, "start postgresql", &start);
            return false;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        let active = shell.run(&format!("systemctl is-active {service}")).await;
        if !is_active(&active.output) {
            error!(target: PG_SERVICE, "{service} is not active: {}", active.output);
            return false;
        }
        let listening = shell
            .run(&format!(
                "ss -tlnp | grep :{} | grep -v '127.0.0.1' || echo not_listening",
                self.pg.port
            ))
            .await;
        if listening.contains("not_listening") {
            warn!(target: PG_SERVICE, "PostgreSQL is not listening on external interfaces yet");
        }
        true
    }
}

impl Action for PostgresService<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "postgresql service configuration".to_string()
    }
}

pub fn postgres_service<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(PostgresService {
        shell: p.shell,
        pg: Postgres::of(p.unit, p.topology),
    })
}

struct PostgresFiles<'a> {
    shell: Option<&'a dyn Executor>,
    pg: Postgres,
    network: String,
}

const PG_FILES: &str = "configure_postgres_files";

impl PostgresFiles<'_> {
    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(PG_FILES, "Shell")) else {
            return false;
        };
        let dir = self.pg.conf_dir();
        let conf = format!("{dir}/postgresql.conf");
        let steps = [
            (
                "remove listen_addresses",
                format!("sed -i '/^#*listen_addresses.*/d' {conf}"),
            ),
            (
                "set listen_addresses",
                format!(
                    "if grep -q '^# CONNECTIONS AND AUTHENTICATION' {conf}; then \
                     awk '{{print}} /^# CONNECTIONS AND AUTHENTICATION/ {{print \"listen_addresses = '\"'\"'*'\"'\"'\"}}' {conf} > {conf}.tmp && mv {conf}.tmp {conf}; \
                     else echo \"listen_addresses = '*'\" >> {conf}; fi"
                ),
            ),
            (
                "set port",
                format!("sed -i -E 's/^#?port.*/port = {}/' {conf}", self.pg.port),
            ),
            (
                "write pg_hba.conf",
                write_file(
                    &format!("{dir}/pg_hba.conf"),
                    &format!("local all all peer\nhost all all {} md5\n", self.network),
                ),
            ),
            ("restart postgresql", format!("systemctl restart {}", self.pg.service())),
        ];
        for (what, command) in steps.iter() {
            let exec = shell.run(command).await;
            if !exec.succeeded() {
                log_failure(PG_FILES, what, &exec);
                return false;
            }
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        let listening = shell
            .run(&format!("ss -tlnp | grep -q ':{} '", self.pg.port))
            .await;
        if !listening.succeeded() {
            error!(target: PG_FILES, "PostgreSQL is not listening on port {}", self.pg.port);
            return false;
        }
        true
    }
}

impl Action for PostgresFiles<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "postgresql files configuration".to_string()
    }
}

pub fn postgres_files<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(PostgresFiles {
        shell: p.shell,
        pg: Postgres::of(p.unit, p.topology),
        network: p.topology.network.to_string(),
    })
}

pub fn postgres_password<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    let pg = Postgres::of(p.unit, p.topology);
    Box::new(Script::new(
        "postgresql password setup",
        "setup_postgres_password",
        p.shell,
        vec![ScriptStep::new(
            "set postgres password",
            format!(
                "sudo -n -u postgres psql -c \"ALTER USER postgres WITH PASSWORD '{}';\"",
                pg.password.replace('\'', "''")
            ),
        )],
    ))
}

struct DockerInstall<'a> {
    shell: Option<&'a dyn Executor>,
}

const DOCKER: &str = "install_docker";

impl DockerInstall<'_> {
    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(DOCKER, "Shell")) else {
            return false;
        };
        let script = shell
            .run_for(
                "curl -fsSL https://get.docker.com -o /tmp/get-docker.sh && sh /tmp/get-docker.sh 2>&1",
                Duration::from_secs(300),
            )
            .await;
        if !script.succeeded() || script.contains("Unable to locate package") {
            warn!(target: DOCKER, "Docker install script failed, falling back to docker.io");
            let fallback = shell
                .run_for(
                    "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y docker.io 2>&1",
                    Duration::from_secs(600),
                )
                .await;
            if !fallback.succeeded() {
                log_failure(DOCKER, "docker.io installation", &fallback);
                return false;
            }
        }
        let version = shell.run("docker --version 2>&1").await;
        if !version.succeeded() || !version.contains("Docker") {
            error!(target: DOCKER, "Docker not available after installation: {}", version.output);
            return false;
        }
        info!(target: DOCKER, "{}", version.output);
        true
    }
}

impl Action for DockerInstall<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "docker installation".to_string()
    }
}

pub fn docker_install<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(DockerInstall { shell: p.shell })
}

struct DockerStart<'a> {
    shell: Option<&'a dyn Executor>,
}

const DOCKER_START: &str = "start_docker_service";

impl DockerStart<'_> {
    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(DOCKER_START, "Shell")) else {
            return false;
        };
        if is_active(&shell.run("systemctl is-active docker").await.output) {
            return true;
        }
        shell
            .run("systemctl enable docker.socket && systemctl start docker.socket")
            .await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        shell.run("systemctl enable docker").await;
        shell.run("docker version || true").await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        if is_active(&shell.run("systemctl is-active docker").await.output) {
            return true;
        }
        let status = shell
            .run("systemctl status docker --no-pager -l 2>&1 | head -20")
            .await;
        let journal = shell.run("journalctl -u docker --no-pager -n 20 2>&1").await;
        error!(
            target: DOCKER_START,
            "Docker is not active\nstatus: {}\njournal: {}",
            status.output,
            journal.output
        );
        false
    }
}

impl Action for DockerStart<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "docker service start".to_string()
    }
}

pub fn docker_start<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(DockerStart { shell: p.shell })
}

/// Let unprivileged processes bind low ports. Never fails the step.
pub fn docker_sysctl<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(Script::new(
        "docker sysctl configuration",
        "configure_docker_sysctl",
        p.shell,
        vec![ScriptStep::new(
            "unprivileged port start",
            "sysctl -w net.ipv4.ip_unprivileged_port_start=0 2>/dev/null || true; \
             echo 'net.ipv4.ip_unprivileged_port_start=0' >> /etc/sysctl.conf 2>/dev/null || true",
        )
        .tolerant()],
    ))
}

pub fn dotnet_install<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(AptInstall::new(
        "dotnet installation",
        "install_dotnet",
        p.apt,
        vec!["dotnet-sdk-8.0".to_string()],
    ))
}

pub fn glusterfs_install<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(
        Script::new(
            "glusterfs server installation",
            "install_glusterfs",
            p.shell,
            vec![
                ScriptStep::new("apt update", "DEBIAN_FRONTEND=noninteractive apt-get update"),
                ScriptStep::new(
                    "install glusterfs",
                    "DEBIAN_FRONTEND=noninteractive apt-get install -y glusterfs-server glusterfs-client",
                ),
                ScriptStep::new(
                    "start glusterd",
                    "systemctl enable glusterd && systemctl start glusterd",
                ),
            ],
        )
        .timeout(Duration::from_secs(600)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::topology;

    #[test]
    fn haproxy_balances_over_workers() {
        let topology = topology("cluster.toml", "dev");
        let ports = HaproxyPorts::of(topology.container_named("haproxy"), &topology);
        assert_eq!(ports.stats, 8404);
        let config = haproxy_config(&topology, ports, true);
        assert!(config.contains("server k3s-worker-1 10.20.0.12:80 check"));
        assert!(config.contains("ssl crt /etc/haproxy/haproxy.pem"));
        assert!(config.contains("listen stats\n    bind *:8404"));
        assert!(!config.contains("server dummy"));
    }

    #[test]
    fn haproxy_without_workers_uses_placeholder() {
        let topology = topology("scenario_a.toml", "dev");
        let ports = HaproxyPorts::of(None, &topology);
        let config = haproxy_config(&topology, ports, false);
        assert!(config.contains("server dummy 127.0.0.1:80 check"));
        assert!(config.contains("bind *:443\n    mode tcp"));
    }

    #[test]
    fn postgres_settings_prefer_unit_params() {
        let topology = topology("cluster.toml", "dev");
        let pg = Postgres::of(topology.container_named("pgsql"), &topology);
        assert_eq!(pg.version, "16");
        assert_eq!(pg.port, 5432);
        assert_eq!(pg.service(), "postgresql@16-main");
    }
}
