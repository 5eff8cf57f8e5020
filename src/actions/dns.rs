// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The DNS service unit: the `sins` server package, its systemd unit, start-up, and the records
//! that publish each service under the environment domains.

use std::net::Ipv4Addr;
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use log::{error, info, warn};

use super::{is_active, log_failure, missing, write_file, Action, ActionParams};
use crate::apt::Apt;
use crate::config::{address_in, Container, Topology};
use crate::container::Pct;
use crate::remote::Executor;

/// Name of the unit that runs the DNS server.
pub const DNS_UNIT: &str = "dns";

const REPOSITORY: &str = "deb [trusted=yes] https://judyalvarez@apt.fury.io/judyalvarez /";
const SERVICE_FILE: &str = "/etc/systemd/system/sins.service";
const APPSETTINGS: [&str; 3] = [
    "/etc/sins/appsettings.json",
    "/opt/sins/appsettings.json",
    "/opt/sins/app/appsettings.json",
];
const PSQL_CLIENT: &str = "command -v psql >/dev/null 2>&1 || apt-get install -y postgresql-client";

/// Database and listening settings of the DNS unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsSettings {
    pub postgres_host: String,
    pub postgres_port: u16,
    pub postgres_db: String,
    pub postgres_user: String,
    pub postgres_password: String,
    pub dns_port: u16,
    pub web_port: u16,
}

impl DnsSettings {
    /// Settings from the unit's parameters. The database host comes from the environment first,
    /// then the unit, then the environment's `pgsql` unit.
    pub fn of(unit: Option<&Container>, topology: &Topology) -> Self {
        let param = |key: &str| unit.and_then(|u| u.param_str(key)).map(str::to_string);
        let port = |key: &str| unit.and_then(|u| u.param_u16(key));
        let postgres_host = topology
            .postgres_host
            .clone()
            .or_else(|| param("postgres_host"))
            .or_else(|| {
                topology
                    .container_named("pgsql")
                    .map(|pg| pg.ip_address.to_string())
            })
            .unwrap_or_else(|| "localhost".to_string());
        DnsSettings {
            postgres_host,
            postgres_port: port("postgres_port").unwrap_or(5432),
            postgres_db: param("postgres_db").unwrap_or_else(|| "dns_server".to_string()),
            postgres_user: param("postgres_user").unwrap_or_else(|| "postgres".to_string()),
            postgres_password: param("postgres_password").unwrap_or_else(|| "postgres".to_string()),
            dns_port: port("dns_port").unwrap_or(topology.services.dns.port),
            web_port: port("web_port").unwrap_or(80),
        }
    }

    /// `psql` against the DNS database server, connected to `database`.
    fn psql(&self, database: &str) -> String {
        format!(
            "PGPASSWORD={} psql -h {} -p {} -U {} -d {database}",
            self.postgres_password, self.postgres_host, self.postgres_port, self.postgres_user
        )
    }

    /// Create the DNS database unless it already exists.
    pub fn create_database(&self) -> String {
        let admin = self.psql("postgres");
        format!(
            "{admin} -tc \"SELECT 1 FROM pg_database WHERE datname = '{db}'\" | grep -q 1 || {admin} -c \"CREATE DATABASE {db};\"",
            db = self.postgres_db
        )
    }

    /// The server's `appsettings.json`.
    pub fn appsettings(&self, jwt_key: &str) -> Result<String, serde_json::Error> {
        let settings = serde_json::json!({
            "ConnectionStrings": {
                "DefaultConnection": format!(
                    "Host={};Port={};Database={};Username={};Password={}",
                    self.postgres_host,
                    self.postgres_port,
                    self.postgres_db,
                    self.postgres_user,
                    self.postgres_password
                ),
            },
            "DnsSettings": { "Port": self.dns_port },
            "WebSettings": { "Port": self.web_port },
            "Jwt": {
                "Key": jwt_key,
                "Issuer": "SiNS-DNS-Server",
                "Audience": "SiNS-DNS-Client",
                "ExpirationMinutes": 1440,
            },
        });
        serde_json::to_string_pretty(&settings)
    }
}

struct DnsInstall<'a> {
    shell: Option<&'a dyn Executor>,
    apt: Option<&'a Apt<'a>>,
    settings: DnsSettings,
}

const INSTALL: &str = "install_sins_dns";

impl DnsInstall<'_> {
    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(INSTALL, "Shell")) else {
            return false;
        };
        let Some(apt) = self.apt.or_else(|| missing(INSTALL, "APT session")) else {
            return false;
        };

        info!(target: INSTALL, "Adding the sins APT repository...");
        let source = shell
            .run_for(
                &format!("echo '{REPOSITORY}' | tee /etc/apt/sources.list.d/fury.list"),
                Duration::from_secs(30),
            )
            .await;
        if !source.succeeded() {
            log_failure(INSTALL, "add sins repository", &source);
            return false;
        }
        let update = apt.update().await;
        if !update.succeeded() {
            log_failure(INSTALL, "apt update", &update);
            return false;
        }
        let install = apt.install(&["sins"]).await;
        if !install.succeeded() {
            log_failure(INSTALL, "sins installation", &install);
            return false;
        }
        let verify = shell
            .run("command -v sins >/dev/null 2>&1 && echo installed || echo not_installed")
            .await;
        if verify.output.trim() != "installed" {
            error!(target: INSTALL, "sins package was not installed correctly");
            return false;
        }

        info!(target: INSTALL, "Ensuring database '{}' exists...", self.settings.postgres_db);
        shell.run_for(PSQL_CLIENT, Duration::from_secs(60)).await;
        let database = shell
            .run_for(&self.settings.create_database(), Duration::from_secs(30))
            .await;
        if !database.succeeded() {
            warn!(target: INSTALL, "Could not verify or create the DNS database: {}", database.tail(100));
        }

        let key = shell
            .run("head -c 32 /dev/urandom | base64 | tr '+/' '-_'")
            .await;
        let key = key.output.trim();
        if key.is_empty() {
            error!(target: INSTALL, "Could not generate a JWT signing key");
            return false;
        }
        let appsettings = match self.settings.appsettings(key) {
            Ok(appsettings) => appsettings,
            Err(e) => {
                error!(target: INSTALL, "Could not render appsettings.json: {e}");
                return false;
            }
        };

        let mut written = false;
        for path in APPSETTINGS.iter() {
            let exec = shell.run(&write_file(path, &appsettings)).await;
            if exec.succeeded() {
                info!(target: INSTALL, "appsettings.json written to {path}");
                written = true;
            } else {
                warn!(target: INSTALL, "Failed to write {path}: {}", exec.tail(100));
            }
        }
        if !written {
            error!(target: INSTALL, "Failed to write appsettings.json to any location");
        }
        written
    }
}

impl Action for DnsInstall<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "sins dns installation".to_string()
    }
}

pub fn install<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(DnsInstall {
        shell: p.shell,
        apt: p.apt,
        settings: DnsSettings::of(p.unit, p.topology),
    })
}

/// Working directory and start command for the server found at `binary`.
pub fn service_exec(binary: &str) -> (String, String) {
    let parent = match binary.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => "/usr/bin".to_string(),
    };
    if binary.ends_with(".dll") {
        (parent, format!("/usr/bin/dotnet {binary}"))
    } else if binary == "/opt/sins/sins" {
        ("/opt/sins".to_string(), binary.to_string())
    } else {
        (parent, binary.to_string())
    }
}

pub fn service_unit(working_dir: &str, exec_start: &str, web_port: u16) -> String {
    format!(
        "[Unit]\nDescription=SiNS DNS Server\nAfter=network.target\n\n\
         [Service]\nType=simple\nUser=root\nWorkingDirectory={working_dir}\n\
         Environment=ASPNETCORE_URLS=http://0.0.0.0:{web_port}\n\
         Environment=ASPNETCORE_ENVIRONMENT=Production\n\
         ExecStart={exec_start}\nRestart=always\nRestartSec=10\nTimeoutStartSec=300\n\n\
         [Install]\nWantedBy=multi-user.target\n"
    )
}

/// A packaged unit file still needs rewriting: wrong web port, `Type=notify`, or no start
/// timeout.
pub fn unit_needs_update(unit: &str, web_port: u16) -> bool {
    let port_set = unit.contains(&format!("ASPNETCORE_URLS=http://+:{web_port}"))
        || unit.contains(&format!("ASPNETCORE_URLS=http://0.0.0.0:{web_port}"));
    !port_set || unit.contains("Type=notify") || !unit.contains("TimeoutStartSec")
}

struct DnsServiceConfigure<'a> {
    shell: Option<&'a dyn Executor>,
    web_port: u16,
}

const CONFIGURE: &str = "configure_sins_service";

impl DnsServiceConfigure<'_> {
    /// Patch the unit file shipped with the package in place.
    async fn update_packaged(&self, shell: &dyn Executor) -> bool {
        let existing = shell.run(&format!("cat {SERVICE_FILE}")).await;
        if !unit_needs_update(&existing.output, self.web_port) {
            info!(target: CONFIGURE, "sins unit file already has the right web port and timeout");
            shell.run("systemctl daemon-reload || true").await;
            return true;
        }
        let update = shell
            .run(&format!(
                "sed -i 's|^Type=notify|Type=simple|' {SERVICE_FILE} && \
                 sed -i 's|Environment=ASPNETCORE_URLS=.*|Environment=ASPNETCORE_URLS=http://0.0.0.0:{}|' {SERVICE_FILE} && \
                 (grep -q '^TimeoutStartSec=' {SERVICE_FILE} || sed -i '/^\\[Service\\]/a TimeoutStartSec=300' {SERVICE_FILE}) && \
                 sed -i 's|^TimeoutStartSec=.*|TimeoutStartSec=300|' {SERVICE_FILE}",
                self.web_port
            ))
            .await;
        if update.succeeded() {
            shell.run("systemctl daemon-reload || true").await;
            return true;
        }
        warn!(target: CONFIGURE, "Failed to update the packaged unit file, writing a new one");
        false
    }

    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(CONFIGURE, "Shell")) else {
            return false;
        };
        let exists = shell
            .run(&format!("test -f {SERVICE_FILE} && echo exists || echo missing"))
            .await;
        if exists.output.trim() == "exists" && self.update_packaged(shell).await {
            return true;
        }

        let binary = shell
            .run("test -f /opt/sins/sins && echo /opt/sins/sins || (which sins || find /usr /opt -name 'sins.dll' -o -name 'sins' -type f | head -1)")
            .await;
        let binary = binary.output.trim();
        if binary.is_empty() {
            error!(target: CONFIGURE, "Could not find the sins binary");
            return false;
        }
        let (working_dir, exec_start) = service_exec(binary);
        let unit = service_unit(&working_dir, &exec_start, self.web_port);
        let exec = shell
            .run(&format!(
                "systemctl stop sins || true; {} && systemctl daemon-reload",
                write_file(SERVICE_FILE, &unit)
            ))
            .await;
        if !exec.succeeded() {
            log_failure(CONFIGURE, "write sins unit file", &exec);
            return false;
        }
        true
    }
}

impl Action for DnsServiceConfigure<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "sins dns service configuration".to_string()
    }
}

pub fn configure_service<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(DnsServiceConfigure {
        shell: p.shell,
        web_port: DnsSettings::of(p.unit, p.topology).web_port,
    })
}

/// `ss -tulnp` shows the DNS server bound to `port`.
pub fn server_listening(output: &str, port: u16) -> bool {
    let bound = format!(":{port} ");
    output
        .lines()
        .any(|line| line.contains(&bound) && (line.contains("sins") || line.contains("dotnet")))
}

struct DnsEnable<'a> {
    shell: Option<&'a dyn Executor>,
    port: u16,
}

const ENABLE: &str = "enable_sins_service";

impl DnsEnable<'_> {
    async fn listening(&self, shell: &dyn Executor) -> bool {
        server_listening(&shell.run("ss -tulnp").await.output, self.port)
    }

    /// The server keeps restarting because its database is not reachable yet. systemd retries
    /// on its own, so this is not a failure of the step.
    async fn waiting_for_database(&self, shell: &dyn Executor) -> bool {
        let status = shell.run("systemctl status sins --no-pager").await;
        if !status.contains("auto-restart") {
            return false;
        }
        let journal = shell
            .run("journalctl -u sins.service -n 20 --no-pager | grep -i 'postgres\\|connection refused' || true")
            .await
            .output
            .to_lowercase();
        if journal.contains("postgres") || journal.contains("connection refused") {
            warn!(target: ENABLE, "sins is restarting until its database is reachable, systemd keeps retrying");
            return true;
        }
        false
    }

    async fn free_port(&self, shell: &dyn Executor) {
        let usage = shell
            .run(&format!("ss -tulnp | grep ':{} ' || echo port_free", self.port))
            .await;
        if usage.contains("port_free") {
            return;
        }
        info!(target: ENABLE, "Port {} is in use: {}", self.port, usage.output);
        if is_active(&shell.run("systemctl is-active systemd-resolved").await.output) {
            info!(target: ENABLE, "Stopping systemd-resolved...");
            shell
                .run("systemctl stop systemd-resolved && systemctl disable systemd-resolved")
                .await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        shell
            .run(&format!("fuser -k {port}/udp {port}/tcp || true", port = self.port))
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    async fn diagnose(&self, shell: &dyn Executor) {
        let status = shell.run("systemctl status sins --no-pager").await;
        let journal = shell.run("journalctl -u sins.service -n 50 --no-pager").await;
        error!(target: ENABLE, "sins status:\n{}", status.output);
        error!(target: ENABLE, "sins journal:\n{}", journal.output);
    }

    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(ENABLE, "Shell")) else {
            return false;
        };
        self.free_port(shell).await;

        shell.run("systemctl enable sins").await;
        let start = shell.run("systemctl start sins").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        if !start.succeeded() {
            if self.waiting_for_database(shell).await {
                return true;
            }
            log_failure(ENABLE, "start sins", &start);
            self.diagnose(shell).await;
            return false;
        }

        if !is_active(&shell.run("systemctl is-active sins").await.output) {
            if self.waiting_for_database(shell).await {
                return true;
            }
            error!(target: ENABLE, "sins DNS server is not running");
            self.diagnose(shell).await;
            return false;
        }
        if self.listening(shell).await {
            info!(target: ENABLE, "sins DNS server is listening on port {}", self.port);
            return true;
        }
        if self.waiting_for_database(shell).await {
            return true;
        }

        warn!(target: ENABLE, "sins is active but not listening on port {}, restarting", self.port);
        self.free_port(shell).await;
        shell.run("systemctl restart sins").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        if self.listening(shell).await {
            info!(target: ENABLE, "sins DNS server is listening on port {} after restart", self.port);
            return true;
        }
        self.diagnose(shell).await;
        false
    }
}

impl Action for DnsEnable<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "sins dns service enablement".to_string()
    }
}

pub fn enable_service<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(DnsEnable {
        shell: p.shell,
        port: DnsSettings::of(p.unit, p.topology).dns_port,
    })
}

/// One `A` record.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsRecord {
    pub fqdn: String,
    pub ip: Ipv4Addr,
}

/// The records of every published service in every environment with a domain. Each one points
/// at the load balancer's address in that environment's network.
pub fn dns_records(topology: &Topology) -> Vec<DnsRecord> {
    let Some(octet) = topology
        .container_named("haproxy")
        .and_then(|unit| topology.host_octet(unit))
    else {
        return Vec::new();
    };
    let names = topology.services.published_names();
    let mut records = Vec::new();
    for zone in topology.dns_zones.iter() {
        let Some(ip) = address_in(&zone.network, octet) else {
            warn!(target: RECORDS, "Load balancer address is outside {}, skipping", zone.environment);
            continue;
        };
        for name in names.iter() {
            records.push(DnsRecord {
                fqdn: format!("{name}.{}", zone.domain),
                ip,
            });
        }
    }
    records
}

/// Insert or refresh one record in the server's table.
pub fn upsert_sql(record: &DnsRecord) -> String {
    format!(
        "INSERT INTO \"DnsRecords\" (\"Name\", \"Type\", \"Value\", \"Ttl\", \"CreatedAt\", \"UpdatedAt\")\n\
         VALUES ('{}', 'A', '{}', 3600, NOW(), NOW())\n\
         ON CONFLICT (\"Name\", \"Type\")\n\
         DO UPDATE SET \"Value\" = EXCLUDED.\"Value\", \"Ttl\" = EXCLUDED.\"Ttl\", \"UpdatedAt\" = NOW();\n",
        record.fqdn.replace('\'', "''"),
        record.ip
    )
}

struct DnsRecords<'a> {
    pct: Option<&'a Pct<'a>>,
    topology: &'a Topology,
}

const RECORDS: &str = "configure_dns_records";
const RECORD_SQL: &str = "/tmp/add_dns_record.sql";

impl DnsRecords<'_> {
    async fn run(&self) -> bool {
        let Some(pct) = self.pct.or_else(|| missing(RECORDS, "pct adapter")) else {
            return false;
        };
        let Some(unit) = self.topology.container_named(DNS_UNIT) else {
            error!(target: RECORDS, "DNS container not found");
            return false;
        };
        let settings = DnsSettings::of(Some(unit), self.topology);
        info!(target: RECORDS, "Using database host {} for DNS records", settings.postgres_host);
        let shell = pct.unit(unit.id);
        shell.run_for(PSQL_CLIENT, Duration::from_secs(60)).await;

        let records = dns_records(self.topology);
        if records.is_empty() {
            warn!(target: RECORDS, "No DNS records to add");
        }
        for record in records.iter() {
            info!(target: RECORDS, "Adding DNS record: {} -> {}", record.fqdn, record.ip);
            let exec = shell
                .run_for(
                    &format!(
                        "{} && {} -f {RECORD_SQL}",
                        write_file(RECORD_SQL, &upsert_sql(record)),
                        settings.psql(&settings.postgres_db)
                    ),
                    Duration::from_secs(60),
                )
                .await;
            if !exec.succeeded() {
                warn!(target: RECORDS, "Failed to add DNS record for {}: {}", record.fqdn, exec.tail(200));
            }
        }
        true
    }
}

impl Action for DnsRecords<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "configure dns records".to_string()
    }
}

pub fn configure_records<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(DnsRecords {
        pct: p.pct,
        topology: p.topology,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dll_builds_run_under_dotnet() {
        assert_eq!(
            service_exec("/usr/lib/sins/sins.dll"),
            ("/usr/lib/sins".to_string(), "/usr/bin/dotnet /usr/lib/sins/sins.dll".to_string())
        );
        assert_eq!(
            service_exec("/opt/sins/sins"),
            ("/opt/sins".to_string(), "/opt/sins/sins".to_string())
        );
        assert_eq!(
            service_exec("/usr/bin/sins"),
            ("/usr/bin".to_string(), "/usr/bin/sins".to_string())
        );
    }

    #[test]
    fn packaged_unit_is_rewritten_when_notify() {
        let good = service_unit("/opt/sins", "/opt/sins/sins", 80);
        assert!(!unit_needs_update(&good, 80));
        assert!(unit_needs_update(&good, 8080));
        assert!(unit_needs_update(&good.replace("Type=simple", "Type=notify"), 80));
    }

    #[test]
    fn listening_needs_the_server_process() {
        let ss = "udp   UNCONN 0 0 0.0.0.0:53 0.0.0.0:* users:((\"sins\",pid=812,fd=9))";
        assert!(server_listening(ss, 53));
        assert!(!server_listening("udp UNCONN 0 0 127.0.0.53:53 0.0.0.0:* users:((\"systemd-resolve\",pid=1))", 53));
        assert!(!server_listening(ss, 5353));
    }

    #[test]
    fn quotes_in_names_are_escaped() {
        let sql = upsert_sql(&DnsRecord {
            fqdn: "o'brien.lab".to_string(),
            ip: Ipv4Addr::new(10, 20, 0, 15),
        });
        assert!(sql.contains("VALUES ('o''brien.lab', 'A', '10.20.0.15', 3600"));
        assert!(sql.contains("ON CONFLICT (\"Name\", \"Type\")"));
    }
}
