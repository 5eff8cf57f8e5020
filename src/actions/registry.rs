// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::BTreeMap;
use std::fmt;

use super::{apt_cache, dns, kubernetes, services, system, workloads, Action, ActionParams};

/// Builds an action from its parameters.
pub type ActionFactory = Box<dyn for<'a> Fn(ActionParams<'a>) -> Box<dyn Action + 'a>>;

/// Box a constructor as an `ActionFactory`.
pub fn factory<F>(f: F) -> ActionFactory
where
    F: for<'a> Fn(ActionParams<'a>) -> Box<dyn Action + 'a> + 'static,
{
    Box::new(f)
}

/// Canonical form of an action name: lowercase, with each run of spaces, underscores and dashes
/// turned into a single dash.
pub fn normalize(name: &str) -> String {
    name.split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnknownAction {
    pub name: String,
    pub available: Vec<String>,
}

impl fmt::Display for UnknownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "action '{}' not found. Available actions: {}",
            self.name,
            self.available.join(", ")
        )
    }
}

impl std::error::Error for UnknownAction {}

/// Maps declared action names to constructors.
///
/// Names are normalized on registration and on lookup, so `SSH service enablement`,
/// `ssh_service_enablement` and `ssh-service-enablement` all resolve to the same action.
pub struct Registry {
    factories: BTreeMap<String, ActionFactory>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    pub fn empty() -> Self {
        Registry {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: ActionFactory) {
        self.factories.insert(normalize(name), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&normalize(name))
    }

    /// Construct the action registered as `name`.
    pub fn resolve<'a>(
        &self,
        name: &str,
        params: ActionParams<'a>,
    ) -> Result<Box<dyn Action + 'a>, UnknownAction> {
        match self.factories.get(&normalize(name)) {
            Some(factory) => Ok(factory(params)),
            None => Err(UnknownAction {
                name: name.to_string(),
                available: self.names(),
            }),
        }
    }

    /// Registered names, in canonical form, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// A registry holding the full action catalog.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();

        registry.register("cloud-init wait", factory(system::cloud_init_wait));
        registry.register("apparmor parser stub", factory(system::apparmor_parser_stub));
        registry.register("disable automatic apt units", factory(system::disable_apt_units));
        registry.register("systemd sysctl override", factory(system::sysctl_override));
        registry.register("system upgrade", factory(system::system_upgrade));
        registry.register("apt sources fix", factory(system::fix_apt_sources));
        registry.register("base tools installation", factory(system::base_tools));
        registry.register("openssh-server installation", factory(system::openssh_server));
        registry.register("SSH service enablement", factory(system::ssh_service));
        registry.register("disable systemd resolved", factory(system::disable_resolved));
        registry.register("lxc sysctl access configuration", factory(system::lxc_sysctl_access));
        registry.register("template cleanup", factory(system::template_cleanup));
        registry.register("template archive creation", factory(system::template_archive));

        registry.register("apt-cacher-ng installation", factory(apt_cache::install));
        registry.register("apt-cacher-ng port configuration", factory(apt_cache::configure_port));
        registry.register("apt-cacher-ng service enablement", factory(apt_cache::enable_service));
        registry.register("wait apt-cache ready", factory(apt_cache::wait_ready));
        registry.register("apt cache proxy configuration", factory(apt_cache::configure_proxy));

        registry.register("haproxy installation", factory(services::haproxy_install));
        registry.register("haproxy configuration", factory(services::haproxy_configure));
        registry.register("haproxy systemd override", factory(services::haproxy_systemd));
        registry.register("haproxy service enablement", factory(services::haproxy_enable));
        registry.register("postgresql installation", factory(services::postgres_install));
        registry.register("postgresql service configuration", factory(services::postgres_service));
        registry.register("postgresql files configuration", factory(services::postgres_files));
        registry.register("postgresql password setup", factory(services::postgres_password));
        registry.register("docker installation", factory(services::docker_install));
        registry.register("docker service start", factory(services::docker_start));
        registry.register("docker sysctl configuration", factory(services::docker_sysctl));
        registry.register("glusterfs server installation", factory(services::glusterfs_install));
        registry.register("dotnet installation", factory(services::dotnet_install));

        registry.register("sins dns installation", factory(dns::install));
        registry.register("sins dns service configuration", factory(dns::configure_service));
        registry.register("sins dns service enablement", factory(dns::enable_service));
        registry.register("configure dns records", factory(dns::configure_records));

        registry.register("k3s installation", factory(kubernetes::install_k3s));
        registry.register("install k3s node watcher", factory(kubernetes::install_node_watcher));
        registry.register("setup kubernetes", factory(kubernetes::setup_kubernetes));
        registry.register("install certa", factory(workloads::install_certa));
        registry.register("install cockroachdb", factory(workloads::install_cockroachdb));
        registry.register("install github runner", factory(workloads::install_github_runner));

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_folds_case_and_separators() {
        assert_eq!(normalize("SSH service enablement"), "ssh-service-enablement");
        assert_eq!(normalize(" base_tools installation "), "base-tools-installation");
        assert_eq!(normalize("apt-cacher-ng installation"), "apt-cacher-ng-installation");
    }

    #[test]
    fn separator_runs_collapse_to_one_dash() {
        assert_eq!(normalize("sins  dns installation"), "sins-dns-installation");
        assert_eq!(normalize("install - certa"), "install-certa");
        assert_eq!(normalize("docker__service start"), normalize("docker service start"));
    }
}
