// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Workloads deployed onto the k3s cluster through its control unit: the certa certificate
//! authority, a CockroachDB cluster, and self-hosted CI runners.
//!
//! Each one is skipped, successfully, when its service section is absent from the topology.

use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use log::{error, info, warn};

use super::{log_failure, missing, poll, write_file, Action, ActionParams};
use crate::cluster::kubectl;
use crate::config::{Certa, Cockroachdb, GithubRunner, Topology};
use crate::remote::Executor;

const HELM_PATH: &str = "export PATH=/usr/local/bin:$PATH && export KUBECONFIG=/etc/rancher/k3s/k3s.yaml";

/// Create `namespace` unless it exists.
pub fn ensure_namespace(namespace: &str) -> String {
    format!(
        "{} | {}",
        kubectl(&format!("create namespace {namespace} --dry-run=client -o yaml")),
        kubectl("apply -f -")
    )
}

/// Write `manifest` to `path` on the control unit, apply it, and remove it.
pub fn apply_manifest(path: &str, manifest: &str) -> String {
    format!(
        "{} && {} && rm -f {path}",
        write_file(path, manifest),
        kubectl(&format!("apply -f {path}"))
    )
}

/// How many pods a `{.status.conditions[?(@.type=="Ready")].status}` listing reports Ready.
pub fn ready_count(output: &str) -> usize {
    output.matches("True").count()
}

/// Install Helm on the control unit unless it is already there.
async fn ensure_helm(target: &str, shell: &dyn Executor) -> bool {
    let check = format!("{HELM_PATH} && command -v helm >/dev/null 2>&1 && echo installed || echo not_installed");
    if shell.run(&check).await.output.trim() == "installed" {
        return true;
    }
    info!(target: target, "Installing Helm...");
    let script = shell
        .run_for(
            &format!(
                "set -e && {HELM_PATH} && curl -fsSL https://raw.githubusercontent.com/helm/helm/main/scripts/get-helm-3 -o /tmp/get-helm-3.sh \
                 && chmod +x /tmp/get-helm-3.sh && /tmp/get-helm-3.sh && rm -f /tmp/get-helm-3.sh"
            ),
            Duration::from_secs(180),
        )
        .await;
    if !script.succeeded() {
        warn!(target: target, "Helm install script failed, downloading the release directly: {}", script.tail(200));
        let direct = shell
            .run_for(
                &format!(
                    "set -e && {HELM_PATH} && HELM_VERSION=$(curl -s https://api.github.com/repos/helm/helm/releases/latest | grep '\"tag_name\":' | sed -E 's/.*\"([^\"]+)\".*/\\1/') \
                     && curl -fsSL https://get.helm.sh/helm-${{HELM_VERSION}}-linux-amd64.tar.gz -o /tmp/helm.tar.gz && tar -xzf /tmp/helm.tar.gz -C /tmp \
                     && mv /tmp/linux-amd64/helm /usr/local/bin/helm && chmod +x /usr/local/bin/helm && rm -rf /tmp/helm.tar.gz /tmp/linux-amd64"
                ),
                Duration::from_secs(180),
            )
            .await;
        if !direct.succeeded() {
            log_failure(target, "Helm installation", &direct);
            return false;
        }
    }
    let binary = shell
        .run("test -f /usr/local/bin/helm && echo installed || echo not_installed")
        .await;
    if binary.output.trim() != "installed" {
        error!(target: target, "Helm binary not found after installation");
        return false;
    }
    true
}

/// Resolved certa settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CertaPlan {
    pub image: String,
    pub port: u16,
    pub namespace: String,
    pub replicas: u32,
    pub database_host: String,
    pub database_port: u16,
    pub database_name: String,
    pub database_user: String,
    pub database_password: String,
}

impl CertaPlan {
    /// Settings from the certa section, falling back to the PostgreSQL service for the
    /// database. A port outside the NodePort range is replaced with the default.
    pub fn of(certa: &Certa, topology: &Topology) -> Self {
        let pg = topology.services.postgresql.as_ref();
        let port = if (30000..=32767).contains(&certa.port) {
            certa.port
        } else {
            warn!(target: CERTA, "Port {} is not in the NodePort range (30000-32767), using 30080", certa.port);
            30080
        };
        CertaPlan {
            image: certa.image.clone(),
            port,
            namespace: certa.namespace.clone(),
            replicas: certa.replicas,
            database_host: certa
                .database_host
                .clone()
                .or_else(|| pg.and(topology.postgres_host.clone()))
                .unwrap_or_else(|| "postgres".to_string()),
            database_port: certa
                .database_port
                .or(pg.map(|s| s.port))
                .unwrap_or(5432),
            database_name: certa.database_name.clone(),
            database_user: certa
                .database_user
                .clone()
                .or_else(|| pg.map(|s| s.username.clone()))
                .unwrap_or_else(|| "certa".to_string()),
            database_password: certa
                .database_password
                .clone()
                .or_else(|| pg.map(|s| s.password.clone()))
                .unwrap_or_else(|| "certa123".to_string()),
        }
    }

    pub fn connection_string(&self) -> String {
        format!(
            "Host={};Database={};Username={};Password={};Port={}",
            self.database_host,
            self.database_name,
            self.database_user,
            self.database_password,
            self.database_port
        )
    }

    pub fn deployment(&self) -> String {
        let env = ["ConnectionStrings__DefaultConnection", "ASPNETCORE_ENVIRONMENT", "ASPNETCORE_URLS"]
            .iter()
            .map(|key| {
                format!(
                    "        - name: {key}\n          valueFrom:\n            configMapKeyRef:\n              name: certa-config\n              key: {key}\n"
                )
            })
            .collect::<String>();
        format!(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: certa\n  namespace: {ns}\n\
             spec:\n  replicas: {replicas}\n  selector:\n    matchLabels:\n      app: certa\n  template:\n    metadata:\n      labels:\n        app: certa\n\
             \x20   spec:\n      containers:\n      - name: certa\n        image: {image}\n        ports:\n        - containerPort: 8080\n          name: http\n        env:\n{env}\
             \x20       resources:\n          requests:\n            cpu: \"250m\"\n            memory: \"512Mi\"\n          limits:\n            cpu: \"1\"\n            memory: \"1Gi\"\n\
             \x20       livenessProbe:\n          httpGet:\n            path: /\n            port: 8080\n          initialDelaySeconds: 30\n          periodSeconds: 10\n\
             \x20       readinessProbe:\n          httpGet:\n            path: /\n            port: 8080\n          initialDelaySeconds: 10\n          periodSeconds: 5\n",
            ns = self.namespace,
            replicas = self.replicas,
            image = self.image,
        )
    }

    pub fn service(&self) -> String {
        format!(
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: certa\n  namespace: {}\nspec:\n  type: NodePort\n  selector:\n    app: certa\n\
             \x20 ports:\n  - name: http\n    port: 8080\n    targetPort: 8080\n    nodePort: {}\n    protocol: TCP\n",
            self.namespace, self.port
        )
    }
}

struct InstallCerta<'a> {
    shell: Option<&'a dyn Executor>,
    plan: Option<CertaPlan>,
}

const CERTA: &str = "install_certa";

impl InstallCerta<'_> {
    async fn run(&self) -> bool {
        let Some(plan) = self.plan.as_ref() else {
            info!(target: CERTA, "CertA not configured, skipping installation");
            return true;
        };
        let Some(shell) = self.shell.or_else(|| missing(CERTA, "Shell")) else {
            return false;
        };
        let ns = &plan.namespace;
        let steps = [
            ("create namespace", ensure_namespace(ns)),
            (
                "create database secret",
                format!(
                    "{} && {}",
                    kubectl(&format!("delete secret certa-db-secret -n {ns} --ignore-not-found")),
                    kubectl(&format!(
                        "create secret generic certa-db-secret --from-literal=username={} --from-literal=password={} --from-literal=database={} -n {ns}",
                        plan.database_user, plan.database_password, plan.database_name
                    ))
                ),
            ),
            (
                "create configmap",
                format!(
                    "{} && {}",
                    kubectl(&format!("delete configmap certa-config -n {ns} --ignore-not-found")),
                    kubectl(&format!(
                        "create configmap certa-config --from-literal=ConnectionStrings__DefaultConnection=\"{}\" \
                         --from-literal=ASPNETCORE_ENVIRONMENT=Production --from-literal=ASPNETCORE_URLS=http://+:8080 -n {ns}",
                        plan.connection_string()
                    ))
                ),
            ),
            (
                "create deployment",
                apply_manifest("/tmp/certa-deployment.yaml", &plan.deployment()),
            ),
            (
                "create service",
                apply_manifest("/tmp/certa-service.yaml", &plan.service()),
            ),
        ];
        for (what, command) in steps.iter() {
            info!(target: CERTA, "CertA: {what}...");
            let exec = shell.run_for(command, Duration::from_secs(60)).await;
            if !exec.succeeded() {
                log_failure(CERTA, what, &exec);
                return false;
            }
        }

        let pods = kubectl(&format!(
            "get pods -n {ns} -l app=certa --field-selector=status.phase=Running -o jsonpath='{{.items[*].status.conditions[?(@.type==\"Ready\")].status}}'"
        ));
        let pods = pods.as_str();
        let replicas = plan.replicas as usize;
        let ready = poll(Duration::from_secs(300), Duration::from_secs(10), move || async move {
            ready_count(&shell.run(pods).await.output) >= replicas
        })
        .await;
        if !ready {
            let status = shell
                .run(&kubectl(&format!("get pods -n {ns} -l app=certa -o wide")))
                .await;
            error!(target: CERTA, "CertA not ready after 300 seconds: {}", status.output);
            return false;
        }
        info!(target: CERTA, "CertA is reachable at NodePort {} on any cluster node", plan.port);
        true
    }
}

impl Action for InstallCerta<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "install certa".to_string()
    }
}

pub fn install_certa<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(InstallCerta {
        shell: p.shell,
        plan: p
            .topology
            .services
            .certa
            .as_ref()
            .map(|certa| CertaPlan::of(certa, p.topology)),
    })
}

const OPERATOR: &str = "https://raw.githubusercontent.com/cockroachdb/cockroach-operator/master/install";

pub fn cockroach_cluster(db: &Cockroachdb) -> String {
    format!(
        "apiVersion: crdb.cockroachlabs.com/v1alpha1\nkind: CrdbCluster\nmetadata:\n  name: cockroachdb\nspec:\n  dataStore:\n    pvc:\n      spec:\n\
         \x20       accessModes:\n          - ReadWriteOnce\n        resources:\n          requests:\n            storage: \"{}\"\n        volumeMode: Filesystem\n\
         \x20 resources:\n    requests:\n      cpu: 500m\n      memory: 2Gi\n    limits:\n      cpu: 2\n      memory: 8Gi\n\
         \x20 tlsEnabled: true\n  image:\n    name: cockroachdb/cockroach:{}\n  nodes: {}\n",
        db.storage, db.version, db.nodes
    )
}

pub fn cockroach_nodeports(db: &Cockroachdb) -> String {
    let ports = [("sql", 26257, db.sql_port), ("http", 8080, db.http_port), ("grpc", 26258, db.grpc_port)]
        .iter()
        .map(|(name, port, node_port)| {
            format!("  - name: {name}\n    port: {port}\n    targetPort: {port}\n    nodePort: {node_port}\n    protocol: TCP\n")
        })
        .collect::<String>();
    format!(
        "apiVersion: v1\nkind: Service\nmetadata:\n  name: cockroachdb-external\n  labels:\n    app.kubernetes.io/instance: cockroachdb\n\
         spec:\n  type: NodePort\n  selector:\n    app.kubernetes.io/component: database\n    app.kubernetes.io/instance: cockroachdb\n\
         \x20   app.kubernetes.io/name: cockroachdb\n  ports:\n{ports}"
    )
}

struct InstallCockroachdb<'a> {
    shell: Option<&'a dyn Executor>,
    db: Option<&'a Cockroachdb>,
}

const COCKROACH: &str = "install_cockroachdb";

impl InstallCockroachdb<'_> {
    async fn operator(&self, shell: &dyn Executor) -> bool {
        for part in ["crds", "operator"] {
            let exec = shell
                .run_for(
                    &kubectl(&format!("apply -f {OPERATOR}/{part}.yaml")),
                    Duration::from_secs(120),
                )
                .await;
            if !exec.succeeded() {
                log_failure(COCKROACH, &format!("operator {part} installation"), &exec);
                return false;
            }
        }

        let phase = kubectl("get pods -n cockroach-operator-system -o jsonpath='{.items[0].status.phase}' 2>&1");
        let ready = kubectl(
            "get pods -n cockroach-operator-system -o jsonpath='{.items[0].status.conditions[?(@.type==\"Ready\")].status}' 2>&1",
        );
        let (phase, ready) = (phase.as_str(), ready.as_str());
        let operator_ready = poll(Duration::from_secs(120), Duration::from_secs(5), move || async move {
            shell.run(phase).await.contains("Running") && shell.run(ready).await.contains("True")
        })
        .await;
        if !operator_ready {
            let pods = shell
                .run(&kubectl("get pods -n cockroach-operator-system -o wide 2>&1"))
                .await;
            error!(target: COCKROACH, "CockroachDB operator not ready after 120 seconds: {}", pods.output);
            return false;
        }

        let webhook = kubectl(
            "get endpoints cockroach-operator-webhook-service -n cockroach-operator-system -o jsonpath='{.subsets[0].addresses[0].ip}' 2>&1",
        );
        let webhook = webhook.as_str();
        let webhook_ready = poll(Duration::from_secs(60), Duration::from_secs(5), move || async move {
            !shell.run(webhook).await.output.trim().is_empty()
        })
        .await;
        if !webhook_ready {
            warn!(target: COCKROACH, "Operator webhook has no endpoint yet, continuing");
        }
        true
    }

    async fn create_cluster(&self, shell: &dyn Executor, db: &Cockroachdb) -> bool {
        let apply = apply_manifest("/tmp/crdb-cluster.yaml", &cockroach_cluster(db));
        for attempt in 1..=3 {
            let exec = shell.run_for(&apply, Duration::from_secs(60)).await;
            if exec.succeeded() {
                return true;
            }
            if attempt == 3 {
                log_failure(COCKROACH, "CockroachDB cluster creation", &exec);
                return false;
            }
            warn!(target: COCKROACH, "Cluster creation failed (attempt {attempt}/3), retrying in 10 seconds...");
            if exec.output.to_lowercase().contains("webhook") {
                warn!(target: COCKROACH, "The operator webhook is not answering yet");
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        false
    }

    async fn run(&self) -> bool {
        let Some(db) = self.db else {
            info!(target: COCKROACH, "CockroachDB not configured, skipping installation");
            return true;
        };
        let Some(shell) = self.shell.or_else(|| missing(COCKROACH, "Shell")) else {
            return false;
        };
        if !self.operator(shell).await || !self.create_cluster(shell, db).await {
            return false;
        }

        let status = kubectl("get crdbcluster cockroachdb -o jsonpath='{.status.clusterStatus}' 2>&1");
        let pods = kubectl(
            "get pods -l app.kubernetes.io/instance=cockroachdb -o jsonpath='{.items[*].status.phase}' 2>&1",
        );
        let (status, pods) = (status.as_str(), pods.as_str());
        let nodes = db.nodes as usize;
        let cluster_ready = poll(Duration::from_secs(300), Duration::from_secs(10), move || async move {
            shell.run(status).await.contains("Finished")
                || shell.run(pods).await.output.matches("Running").count() == nodes
        })
        .await;
        if !cluster_ready {
            warn!(target: COCKROACH, "CockroachDB cluster not ready after 300 seconds, continuing");
        }

        let password = shell
            .run_for(
                &kubectl(&format!(
                    "exec cockroachdb-0 -- ./cockroach sql --certs-dir=/cockroach/cockroach-certs --host=cockroachdb-public \
                     -e \"ALTER USER root WITH PASSWORD '{}';\" 2>&1",
                    db.password.replace('\'', "''")
                )),
                Duration::from_secs(60),
            )
            .await;
        if !password.succeeded() {
            warn!(target: COCKROACH, "Failed to set root password: {}", password.tail(200));
        }

        let service = shell
            .run_for(
                &apply_manifest("/tmp/crdb-external.yaml", &cockroach_nodeports(db)),
                Duration::from_secs(60),
            )
            .await;
        if service.succeeded() {
            info!(
                target: COCKROACH,
                "CockroachDB NodePorts: SQL {}, HTTP {}, gRPC {}",
                db.sql_port,
                db.http_port,
                db.grpc_port
            );
        } else {
            warn!(target: COCKROACH, "Failed to create NodePort service: {}", service.tail(200));
        }
        true
    }
}

impl Action for InstallCockroachdb<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "install cockroachdb".to_string()
    }
}

pub fn install_cockroachdb<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(InstallCockroachdb {
        shell: p.shell,
        db: p.topology.services.cockroachdb.as_ref(),
    })
}

pub fn runner_deployment_name(runner: &GithubRunner) -> String {
    format!("{}-deployment", runner.name_prefix)
}

pub fn runner_deployment(runner: &GithubRunner, organization: &str) -> String {
    let group = match runner.group.as_deref() {
        Some(group) if !group.is_empty() => format!("      group: {group}\n"),
        _ => String::new(),
    };
    format!(
        "apiVersion: actions.summerwind.dev/v1alpha1\nkind: RunnerDeployment\nmetadata:\n  name: {}\n  namespace: {}\n\
         spec:\n  replicas: {}\n  template:\n    spec:\n      organization: {organization}\n{group}\
         \x20     labels:\n        - {}\n      dockerdWithinRunnerContainer: true\n      dockerEnabled: true\n\
         \x20     image: summerwind/actions-runner-dind:latest\n      resources:\n        requests:\n          cpu: \"250m\"\n          memory: \"256Mi\"\n\
         \x20       limits:\n          cpu: \"1\"\n          memory: \"768Mi\"\n",
        runner_deployment_name(runner),
        runner.namespace,
        runner.replicas,
        runner.label
    )
}

struct InstallGithubRunner<'a> {
    shell: Option<&'a dyn Executor>,
    runner: Option<&'a GithubRunner>,
}

const RUNNER: &str = "install_github_runner";
const SERVING_CERT: &str = "actions-runner-controller-serving-cert";

impl InstallGithubRunner<'_> {
    fn token(runner: &GithubRunner) -> Option<String> {
        runner
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var("ENVA_GITHUB_TOKEN").ok())
            .filter(|t| !t.is_empty())
    }

    /// The controller's webhook needs a serving certificate. cert-manager issues one when it is
    /// installed; otherwise a self-signed one is created.
    async fn serving_cert(&self, shell: &dyn Executor, ns: &str) -> bool {
        let check = kubectl(&format!(
            "get secret {SERVING_CERT} -n {ns} >/dev/null 2>&1 && echo exists || echo missing"
        ));
        let check = check.as_str();
        if shell.run(check).await.output.trim() == "exists" {
            return true;
        }
        let cert_manager = shell
            .run(&kubectl(
                "get crd certificates.cert-manager.io >/dev/null 2>&1 && echo exists || echo missing",
            ))
            .await;
        if cert_manager.output.trim() == "exists" {
            info!(target: RUNNER, "cert-manager detected, waiting for it to issue the webhook certificate...");
            let issued = poll(Duration::from_secs(120), Duration::from_secs(5), move || async move {
                shell.run(check).await.output.trim() == "exists"
            })
            .await;
            if issued {
                return true;
            }
        }

        info!(target: RUNNER, "Creating a self-signed webhook certificate...");
        let openssl = shell
            .run_for(
                "command -v openssl >/dev/null 2>&1 || (apt-get update && apt-get install -y openssl)",
                Duration::from_secs(120),
            )
            .await;
        if !openssl.succeeded() {
            log_failure(RUNNER, "openssl installation", &openssl);
            return false;
        }
        let create = shell
            .run_for(
                &format!(
                    "set -e && openssl genrsa -out /tmp/cert.key 2048 && \
                     openssl req -new -x509 -key /tmp/cert.key -out /tmp/cert.crt -days 365 -subj \"/CN=actions-runner-controller-webhook-service.{ns}.svc\" && \
                     {} && rm -f /tmp/cert.key /tmp/cert.crt",
                    kubectl(&format!(
                        "create secret tls {SERVING_CERT} --cert=/tmp/cert.crt --key=/tmp/cert.key -n {ns}"
                    ))
                ),
                Duration::from_secs(60),
            )
            .await;
        if !create.succeeded() {
            log_failure(RUNNER, "webhook certificate creation", &create);
            return false;
        }
        let patch = |kind: &str| {
            kubectl(&format!(
                "patch {kind}webhookconfiguration actions-runner-controller-{kind}-webhook-configuration --type='json' \
                 -p=\"[{{\\\"op\\\": \\\"replace\\\", \\\"path\\\": \\\"/webhooks/0/clientConfig/caBundle\\\", \\\"value\\\":\\\"$CA_BUNDLE\\\"}}]\" 2>&1 || true"
            ))
        };
        let ca_bundle = shell
            .run(&format!(
                "CA_BUNDLE=$({}) && {} && {}",
                kubectl(&format!(
                    "get secret {SERVING_CERT} -n {ns} -o jsonpath='{{.data.tls\\.crt}}'"
                )),
                patch("validating"),
                patch("mutating")
            ))
            .await;
        if !ca_bundle.succeeded() {
            warn!(target: RUNNER, "Could not update the webhook CA bundle: {}", ca_bundle.tail(200));
        }
        true
    }

    /// Scale back down when the controller left more runner pods than requested, deleting the
    /// oldest ones.
    async fn trim_runners(&self, shell: &dyn Executor, runner: &GithubRunner) {
        let ns = &runner.namespace;
        let name = runner_deployment_name(runner);
        let listing = shell
            .run(&kubectl(&format!(
                "get pods -n {ns} -l runner-deployment-name={name} --no-headers --sort-by=.metadata.creationTimestamp 2>&1"
            )))
            .await;
        let pods: Vec<&str> = listing
            .output
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .collect();
        let replicas = runner.replicas as usize;
        if pods.len() <= replicas {
            return;
        }
        warn!(target: RUNNER, "Found {} runner pods, want {replicas}", pods.len());
        shell
            .run(&kubectl(&format!(
                "patch runnerdeployment {name} -n {ns} --type=merge -p '{{\"spec\":{{\"replicas\":{replicas}}}}}' 2>&1"
            )))
            .await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        for pod in pods[..pods.len() - replicas].iter() {
            shell
                .run(&kubectl(&format!("delete pod {pod} -n {ns} 2>&1")))
                .await;
        }
    }

    async fn run(&self) -> bool {
        let Some(runner) = self.runner else {
            info!(target: RUNNER, "GitHub runner not configured, skipping installation");
            return true;
        };
        let Some(token) = Self::token(runner) else {
            error!(target: RUNNER, "GitHub token not configured (check config or ENVA_GITHUB_TOKEN)");
            return false;
        };
        let Some(organization) = runner.organization.as_deref().filter(|o| !o.is_empty()) else {
            error!(target: RUNNER, "GitHub organization not configured");
            return false;
        };
        let Some(shell) = self.shell.or_else(|| missing(RUNNER, "Shell")) else {
            return false;
        };
        if !ensure_helm(RUNNER, shell).await {
            return false;
        }
        let ns = &runner.namespace;

        let namespace = shell.run_for(&ensure_namespace(ns), Duration::from_secs(30)).await;
        if !namespace.succeeded() && !namespace.contains("already exists") {
            log_failure(RUNNER, "create namespace", &namespace);
            return false;
        }

        let repo = format!(
            "{HELM_PATH} && helm repo add actions-runner-controller https://actions-runner-controller.github.io/actions-runner-controller && helm repo update"
        );
        let mut added = false;
        for attempt in 1..=3 {
            let exec = shell.run_for(&repo, Duration::from_secs(120)).await;
            if exec.succeeded() {
                added = true;
                break;
            }
            warn!(target: RUNNER, "Helm repo add failed (attempt {attempt}/3): {}", exec.tail(200));
            if attempt < 3 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
        if !added {
            return false;
        }

        let secret = shell
            .run_for(
                &format!(
                    "{} && {}",
                    kubectl(&format!("delete secret controller-manager -n {ns} --ignore-not-found")),
                    kubectl(&format!(
                        "create secret generic controller-manager --from-literal=github_token={token} -n {ns}"
                    ))
                ),
                Duration::from_secs(30),
            )
            .await;
        if !secret.succeeded() {
            log_failure(RUNNER, "create authenticator secret", &secret);
            return false;
        }

        info!(target: RUNNER, "Installing the actions runner controller...");
        let install = shell
            .run_for(
                &format!(
                    "{HELM_PATH} && helm upgrade --install actions-runner-controller actions-runner-controller/actions-runner-controller \
                     --namespace {ns} --set syncPeriod=1m --set authSecret.create=false --set authSecret.name=controller-manager --timeout 5m"
                ),
                Duration::from_secs(300),
            )
            .await;
        if !install.succeeded() {
            log_failure(RUNNER, "actions runner controller installation", &install);
            return false;
        }
        if !self.serving_cert(shell, ns).await {
            return false;
        }

        let controller = kubectl(&format!(
            "get pods -n {ns} -l app.kubernetes.io/name=actions-runner-controller --field-selector=status.phase=Running \
             -o jsonpath='{{.items[*].status.conditions[?(@.type==\"Ready\")].status}}' 2>&1"
        ));
        let controller = controller.as_str();
        let controller_ready = poll(Duration::from_secs(600), Duration::from_secs(5), move || async move {
            ready_count(&shell.run(controller).await.output) >= 1
        })
        .await;
        if !controller_ready {
            let pods = shell
                .run(&kubectl(&format!(
                    "get pods -n {ns} -l app.kubernetes.io/name=actions-runner-controller -o wide 2>&1"
                )))
                .await;
            error!(target: RUNNER, "Actions runner controller not ready after 600 seconds: {}", pods.output);
            return false;
        }

        let deployment = shell
            .run_for(
                &apply_manifest(
                    "/tmp/runner-deployment.yaml",
                    &runner_deployment(runner, organization),
                ),
                Duration::from_secs(60),
            )
            .await;
        if !deployment.succeeded() {
            log_failure(RUNNER, "create RunnerDeployment", &deployment);
            return false;
        }

        let runners = kubectl(&format!(
            "get pods -n {ns} -l runner-deployment-name={} --field-selector=status.phase=Running \
             -o jsonpath='{{.items[*].status.conditions[?(@.type==\"Ready\")].status}}' 2>&1",
            runner_deployment_name(runner)
        ));
        let runners = runners.as_str();
        let replicas = runner.replicas as usize;
        let runners_ready = poll(Duration::from_secs(300), Duration::from_secs(10), move || async move {
            ready_count(&shell.run(runners).await.output) >= replicas
        })
        .await;
        if !runners_ready {
            error!(target: RUNNER, "GitHub runners did not become ready within 300 seconds");
            return false;
        }
        self.trim_runners(shell, runner).await;
        info!(
            target: RUNNER,
            "RunnerDeployment {ns}/{} ready with {replicas} replicas, label {}",
            runner_deployment_name(runner),
            runner.label
        );
        true
    }
}

impl Action for InstallGithubRunner<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "install github runner".to_string()
    }
}

pub fn install_github_runner<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(InstallGithubRunner {
        shell: p.shell,
        runner: p.topology.services.github_runner.as_ref(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> GithubRunner {
        toml::from_str("organization = \"lab-org\"\ngroup = \"lab\"").unwrap()
    }

    #[test]
    fn manifests_apply_from_a_scratch_file() {
        let command = apply_manifest("/tmp/x.yaml", "kind: Service\n");
        assert!(command.ends_with("k3s kubectl apply -f /tmp/x.yaml && rm -f /tmp/x.yaml"));
        assert!(command.starts_with("mkdir -p /tmp && echo "));
    }

    #[test]
    fn runner_group_is_optional() {
        let mut runner = runner();
        let manifest = runner_deployment(&runner, "lab-org");
        assert!(manifest.contains("  name: k3s-runner-deployment\n  namespace: actions-runner-system\n"));
        assert!(manifest.contains("      organization: lab-org\n      group: lab\n      labels:\n        - self-hosted\n"));
        runner.group = None;
        assert!(!runner_deployment(&runner, "lab-org").contains("group:"));
    }

    #[test]
    fn cockroach_ports_map_to_nodeports() {
        let db: Cockroachdb = toml::from_str("").unwrap();
        let service = cockroach_nodeports(&db);
        assert!(service.contains("  - name: sql\n    port: 26257\n    targetPort: 26257\n    nodePort: 32657\n"));
        assert!(service.contains("nodePort: 32658"));
        assert!(cockroach_cluster(&db).contains("name: cockroachdb/cockroach:v25.2.4\n  nodes: 3\n"));
    }

    #[test]
    fn ready_pods_are_counted() {
        assert_eq!(ready_count("True True False"), 2);
        assert_eq!(ready_count(""), 0);
    }
}
