// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use enva_lib::{
        actions::{registry::factory, Action, ActionParams, Registry, Script, ScriptStep},
        remote::Execution,
        test_env::*,
    };

    fn motd<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
        Box::new(Script::new(
            "message of the day",
            "motd",
            p.shell,
            vec![ScriptStep::new("write motd", "echo lab > /etc/motd")],
        ))
    }

    #[test]
    fn catalog_answers_to_any_spelling() {
        let registry = Registry::builtin();
        assert!(registry.contains("SSH service enablement"));
        assert!(registry.contains("ssh_service_enablement"));
        assert!(registry.contains("k3s installation"));
        assert!(!registry.contains("k3s uninstallation"));
    }

    #[test]
    fn unknown_names_list_what_is_available() {
        let topology = topology("scenario_a.toml", "dev");
        let registry = Registry::builtin();
        let err = registry
            .resolve("k3s uninstallation", ActionParams::bare(&topology))
            .err()
            .unwrap();
        assert_eq!(err.name, "k3s uninstallation");
        assert_eq!(err.available, registry.names());
        assert!(err.to_string().contains("setup-kubernetes"));
    }

    #[tokio::test(start_paused = true)]
    async fn registered_actions_run_in_their_unit() {
        let topology = topology("scenario_a.toml", "dev");
        let mut registry = Registry::empty();
        registry.register("Message of the day", factory(motd));

        let shell = ScriptedExecutor::new();
        let mut params = ActionParams::bare(&topology);
        params.shell = Some(&shell);
        let action = registry.resolve("message_of_the_day", params).unwrap();
        assert_eq!(action.describe(), "message of the day");
        assert!(action.execute().await);
        assert_eq!(shell.commands(), vec!["echo lab > /etc/motd".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn actions_without_a_shell_fail() {
        let topology = topology("scenario_a.toml", "dev");
        let action = motd(ActionParams::bare(&topology));
        assert!(!action.execute().await);
    }

    #[tokio::test(start_paused = true)]
    async fn script_failure_is_reported() {
        let topology = topology("scenario_a.toml", "dev");
        let shell = ScriptedExecutor::new().on("motd", Execution::failure("read-only", 1));
        let mut params = ActionParams::bare(&topology);
        params.shell = Some(&shell);
        assert!(!motd(params).execute().await);
    }
}
