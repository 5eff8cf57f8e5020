// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use enva_lib::{
        actions::{
            dns::{self, DnsRecord, DnsSettings},
            workloads::{self, CertaPlan},
            ActionParams, Registry,
        },
        container::Pct,
        remote::Execution,
        test_env::*,
    };

    #[test]
    fn published_names_point_at_the_load_balancer_in_every_zone() {
        let topology = topology("dns.toml", "dev");
        let records = dns::dns_records(&topology);
        let lb_dev = Ipv4Addr::new(10, 20, 0, 15);
        let lb_prod = Ipv4Addr::new(10, 30, 0, 15);
        let fqdns: Vec<&str> = records.iter().map(|r| r.fqdn.as_str()).collect();
        assert_eq!(
            fqdns,
            vec![
                "apt.dev.lab",
                "pgsql.dev.lab",
                "lb.dev.lab",
                "certa.dev.lab",
                "apt.prod.lab",
                "pgsql.prod.lab",
                "lb.prod.lab",
                "certa.prod.lab",
            ]
        );
        assert_eq!(records[0], DnsRecord { fqdn: "apt.dev.lab".to_string(), ip: lb_dev });
        assert_eq!(records[7].ip, lb_prod);
    }

    #[test]
    fn no_load_balancer_means_no_records() {
        let topology = topology("scenario_a.toml", "dev");
        assert!(dns::dns_records(&topology).is_empty());
    }

    #[test]
    fn database_defaults_to_the_pgsql_unit() {
        let topology = topology("dns.toml", "dev");
        let settings = DnsSettings::of(topology.container_named(dns::DNS_UNIT), &topology);
        assert_eq!(settings.postgres_host, "10.20.0.16");
        assert_eq!(settings.postgres_db, "dns_server");
        assert_eq!(settings.dns_port, topology.services.dns.port);
    }

    #[tokio::test(start_paused = true)]
    async fn records_are_written_through_the_dns_unit() {
        let topology = topology("dns.toml", "dev");
        let host = ScriptedExecutor::new();
        let pct = Pct::new(&host);
        let mut params = ActionParams::bare(&topology);
        params.pct = Some(&pct);
        let action = Registry::builtin().resolve("configure dns records", params).unwrap();
        assert_eq!(action.describe(), "configure dns records");
        assert!(action.execute().await);
        assert_eq!(host.count("ct:4017 mkdir -p /tmp && echo "), 8);
        assert_eq!(host.count("psql -h 10.20.0.16 -p 5432 -U postgres -d dns_server -f /tmp/add_dns_record.sql"), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_records_do_not_fail_the_step() {
        let topology = topology("dns.toml", "dev");
        let host = ScriptedExecutor::new().on("add_dns_record.sql", Execution::failure("connection refused", 2));
        let pct = Pct::new(&host);
        let mut params = ActionParams::bare(&topology);
        params.pct = Some(&pct);
        assert!(dns::configure_records(params).execute().await);
    }

    #[test]
    fn certa_port_stays_in_the_nodeport_range() {
        let topology = topology("dns.toml", "dev");
        let certa = topology.services.certa.as_ref().unwrap();
        let plan = CertaPlan::of(certa, &topology);
        assert_eq!(plan.port, 30080);
        assert_eq!(plan.database_user, "postgres");
        assert_eq!(plan.database_password, "secret");
        assert_eq!(plan.connection_string(), "Host=postgres;Database=certa;Username=postgres;Password=secret;Port=5432");
        assert!(plan.service().contains("nodePort: 30080"));
    }

    #[tokio::test(start_paused = true)]
    async fn certa_waits_for_its_pods() {
        let topology = topology("dns.toml", "dev");
        let shell = ScriptedExecutor::new().on("status.conditions", Execution::success("True"));
        let mut params = ActionParams::bare(&topology);
        params.shell = Some(&shell);
        assert!(workloads::install_certa(params).execute().await);
        assert!(shell.ran("create secret generic certa-db-secret"));
        assert!(shell.ran("apply -f /tmp/certa-deployment.yaml"));
        assert!(shell.ran("apply -f /tmp/certa-service.yaml"));
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_workloads_are_skipped() {
        let topology = topology("scenario_a.toml", "dev");
        let shell = ScriptedExecutor::new();
        let registry = Registry::builtin();
        for name in ["install certa", "install cockroachdb", "install github runner"] {
            let mut params = ActionParams::bare(&topology);
            params.shell = Some(&shell);
            assert!(registry.resolve(name, params).unwrap().execute().await, "{name}");
        }
        assert!(shell.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn runners_need_an_organization() {
        let topology = topology("dns.toml", "dev");
        let shell = ScriptedExecutor::new();
        let mut params = ActionParams::bare(&topology);
        params.shell = Some(&shell);
        assert!(!workloads::install_github_runner(params).execute().await);
        assert!(shell.commands().is_empty());
    }

    #[test]
    fn dns_and_workload_actions_are_registered() {
        let registry = Registry::builtin();
        for name in [
            "sins dns installation",
            "sins dns service configuration",
            "sins dns service enablement",
            "configure dns records",
            "install certa",
            "install cockroachdb",
            "install github runner",
            "dotnet installation",
        ] {
            assert!(registry.contains(name), "{name}");
        }
    }
}
