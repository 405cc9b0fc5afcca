use crate::config::ServicesConfig;
use crate::identity::IdentityResolver;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::process::Command;

const POSTGRES_KEY: &str = "postgres";
const ODOO_KEY: &str = "odoo";
const INSTANCE_PREFIX: &str = "postgresql@";
const INSTANCE_KEY_MARKER: &str = "_postgresql_";

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

pub trait CommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, io::Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, io::Error> {
        let output = Command::new(program).args(args).output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            _ => None,
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            Self::Start => "started",
            Self::Stop => "stopped",
            Self::Restart => "restarted",
        }
    }
}

/// Outcome of a privileged command (service control or group enrolment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub status: String,
    pub message: String,
    pub error: Option<String>,
}

impl ActionResult {
    fn ok(status: &str, message: String) -> Self {
        Self {
            success: true,
            status: status.to_string(),
            message,
            error: None,
        }
    }

    fn failed(message: String, error: String) -> Self {
        Self {
            success: false,
            status: "error".to_string(),
            message,
            error: Some(error),
        }
    }
}

/// Extract `inactive` from a line like `Active: inactive (dead) since ...`.
fn parse_active_line(status_output: &str) -> Option<String> {
    status_output.lines().find_map(|line| {
        let (_, rest) = line.split_once("Active:")?;
        let state = rest.split_whitespace().next()?;
        let state = state.trim_matches(|ch| ch == '(' || ch == ')');
        (!state.is_empty()).then(|| state.to_string())
    })
}

fn parse_instance_units(list_output: &str) -> Vec<String> {
    list_output
        .lines()
        .filter_map(|line| {
            // list-units may prefix failed units with a bullet column.
            line.split_whitespace()
                .find(|token| token.starts_with(INSTANCE_PREFIX))
        })
        .map(|unit| unit.trim_end_matches(".service").to_string())
        .collect()
}

pub fn instance_key(instance: &str) -> String {
    format!("{POSTGRES_KEY}_{}", instance.replace('@', "_"))
}

/// Unit names are passed as argv, never through a shell; this only keeps option-looking
/// or path-like keys out of systemctl.
fn valid_unit_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '@' | '-' | '_' | '.' | ':'))
}

fn valid_account_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '$'))
}

pub struct ServiceController<'a, R: CommandRunner> {
    runner: &'a R,
    services: &'a ServicesConfig,
    use_sudo: bool,
}

impl<'a, R: CommandRunner> ServiceController<'a, R> {
    /// `use_sudo` should already account for the effective uid.
    pub fn new(runner: &'a R, services: &'a ServicesConfig, use_sudo: bool) -> Self {
        Self {
            runner,
            services,
            use_sudo,
        }
    }

    fn privileged(&self, program: &str, args: &[&str]) -> Result<CommandOutput, io::Error> {
        if self.use_sudo {
            let mut argv = vec!["-n".to_string(), program.to_string()];
            argv.extend(args.iter().map(|arg| arg.to_string()));
            self.runner.run("sudo", &argv)
        } else {
            let argv: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
            self.runner.run(program, &argv)
        }
    }

    pub fn service_status(&self, service_name: &str) -> String {
        let is_active = match self
            .runner
            .run("systemctl", &["is-active".to_string(), service_name.to_string()])
        {
            Ok(output) => output.stdout_text(),
            Err(err) => {
                tracing::warn!(service = service_name, error = %err, "systemctl is-active failed");
                return "error".to_string();
            }
        };
        if is_active == "active" {
            return is_active;
        }
        let detailed = self
            .runner
            .run("systemctl", &["status".to_string(), service_name.to_string()])
            .ok()
            .and_then(|output| parse_active_line(&String::from_utf8_lossy(&output.stdout)));
        let status = detailed.unwrap_or(if is_active.is_empty() {
            "unknown".to_string()
        } else {
            is_active
        });
        tracing::debug!(service = service_name, status = %status, "service status");
        status
    }

    pub fn detect_postgres_instances(&self) -> Vec<String> {
        let args = [
            "list-units".to_string(),
            format!("{INSTANCE_PREFIX}*"),
            "--no-legend".to_string(),
        ];
        match self.runner.run("systemctl", &args) {
            Ok(output) => parse_instance_units(&String::from_utf8_lossy(&output.stdout)),
            Err(err) => {
                tracing::warn!(error = %err, "postgresql instance detection failed");
                Vec::new()
            }
        }
    }

    /// Configured instances first, then auto-detected ones not already listed.
    pub fn postgres_instances(&self) -> Vec<String> {
        let mut instances = self.services.postgres.instances.clone();
        if self.services.postgres.auto_detect {
            for detected in self.detect_postgres_instances() {
                if !instances.contains(&detected) {
                    instances.push(detected);
                }
            }
        }
        instances
    }

    pub fn all_statuses(&self) -> BTreeMap<String, String> {
        let mut result = BTreeMap::new();
        result.insert(
            ODOO_KEY.to_string(),
            self.service_status(&self.services.odoo.service_name),
        );
        result.insert(
            POSTGRES_KEY.to_string(),
            self.service_status(&self.services.postgres.service_name),
        );
        for instance in self.postgres_instances() {
            let status = self.service_status(&instance);
            result.insert(instance_key(&instance), status);
        }
        result
    }

    pub fn service_name_for_key(&self, key: &str) -> String {
        if let Some((_, cluster)) = key.split_once(INSTANCE_KEY_MARKER) {
            if !cluster.is_empty() {
                return format!("{INSTANCE_PREFIX}{cluster}");
            }
        }
        match key.split('_').next().unwrap_or(key) {
            ODOO_KEY => self.services.odoo.service_name.clone(),
            POSTGRES_KEY => self.services.postgres.service_name.clone(),
            _ => key.to_string(),
        }
    }

    pub fn control(&self, key: &str, action: ServiceAction) -> ActionResult {
        let service_name = self.service_name_for_key(key);
        if !valid_unit_name(&service_name) {
            return ActionResult::failed(
                format!("cannot {} '{key}'", action.as_str()),
                format!("invalid service name '{service_name}'"),
            );
        }
        tracing::info!(key, service = %service_name, action = action.as_str(), "service control");
        match self.privileged("systemctl", &[action.as_str(), &service_name]) {
            Ok(output) if output.success() => ActionResult::ok(
                action.past_tense(),
                format!("service {key} ({service_name}) {}", action.past_tense()),
            ),
            Ok(output) => {
                let stderr = output.stderr_text();
                tracing::error!(key, service = %service_name, stderr = %stderr, "service control failed");
                ActionResult::failed(
                    format!("failed to {} {key} ({service_name})", action.as_str()),
                    if stderr.is_empty() {
                        format!("systemctl exited with status {}", output.status_code)
                    } else {
                        stderr
                    },
                )
            }
            Err(err) => ActionResult::failed(
                format!("failed to {} {key} ({service_name})", action.as_str()),
                format!("failed to run systemctl: {err}"),
            ),
        }
    }

    pub fn add_user_to_group(
        &self,
        identity: &dyn IdentityResolver,
        username: &str,
        group: &str,
    ) -> ActionResult {
        if !valid_account_name(username) {
            return ActionResult::failed(
                format!("cannot add '{username}' to {group}"),
                format!("invalid username '{username}'"),
            );
        }
        if identity.uid_of(username).is_none() {
            return ActionResult::failed(
                format!("cannot add '{username}' to {group}"),
                format!("user '{username}' does not exist"),
            );
        }
        let membership = identity.members_of(group);
        if !membership.exists {
            return ActionResult::failed(
                format!("cannot add '{username}' to {group}"),
                membership
                    .warning
                    .unwrap_or_else(|| format!("group '{group}' does not exist")),
            );
        }
        if membership.contains(username) {
            return ActionResult::ok(
                "already_in_group",
                format!("user {username} is already in group {group}"),
            );
        }
        tracing::info!(username, group, "adding user to group");
        match self.privileged("usermod", &["-a", "-G", group, username]) {
            Ok(output) if output.success() => ActionResult::ok(
                "success",
                format!("user {username} added to group {group}; a new login session is required"),
            ),
            Ok(output) => ActionResult::failed(
                format!("failed to add {username} to group {group}"),
                output.stderr_text(),
            ),
            Err(err) => ActionResult::failed(
                format!("failed to add {username} to group {group}"),
                format!("failed to run usermod: {err}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::FakeIdentity;
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct RecordedCall {
        program: String,
        args: Vec<String>,
    }

    /// Answers by the first matching argv prefix; unmatched calls succeed with no output.
    #[derive(Default)]
    struct MockRunner {
        calls: RefCell<Vec<RecordedCall>>,
        responses: Vec<(Vec<&'static str>, CommandOutput)>,
        fail_spawn: bool,
    }

    impl MockRunner {
        fn respond(mut self, argv: &[&'static str], code: i32, stdout: &str, stderr: &str) -> Self {
            self.responses.push((
                argv.to_vec(),
                CommandOutput {
                    status_code: code,
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: stderr.as_bytes().to_vec(),
                },
            ));
            self
        }

        fn calls(&self) -> Vec<RecordedCall> {
            self.calls.borrow().clone()
        }
    }

    impl CommandRunner for MockRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, io::Error> {
            self.calls.borrow_mut().push(RecordedCall {
                program: program.to_string(),
                args: args.to_vec(),
            });
            if self.fail_spawn {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            let mut argv = vec![program.to_string()];
            argv.extend(args.iter().cloned());
            for (prefix, output) in &self.responses {
                if argv.len() >= prefix.len()
                    && prefix.iter().zip(argv.iter()).all(|(want, got)| want == got)
                {
                    return Ok(output.clone());
                }
            }
            Ok(CommandOutput {
                status_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    fn services() -> ServicesConfig {
        ServicesConfig::default()
    }

    #[test]
    fn active_service_skips_detailed_status() {
        let runner = MockRunner::default().respond(&["systemctl", "is-active", "odoo"], 0, "active\n", "");
        let cfg = services();
        let controller = ServiceController::new(&runner, &cfg, false);
        assert_eq!(controller.service_status("odoo"), "active");
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn inactive_service_reads_active_line() {
        let runner = MockRunner::default()
            .respond(&["systemctl", "is-active"], 3, "inactive\n", "")
            .respond(
                &["systemctl", "status"],
                3,
                "● odoo.service - Odoo\n     Loaded: loaded\n     Active: failed (Result: exit-code) since Mon\n",
                "",
            );
        let cfg = services();
        let controller = ServiceController::new(&runner, &cfg, false);
        assert_eq!(controller.service_status("odoo"), "failed");
    }

    #[test]
    fn spawn_failure_is_error_status() {
        let runner = MockRunner {
            fail_spawn: true,
            ..MockRunner::default()
        };
        let cfg = services();
        let controller = ServiceController::new(&runner, &cfg, false);
        assert_eq!(controller.service_status("odoo"), "error");
        assert!(controller.detect_postgres_instances().is_empty());
    }

    #[test]
    fn all_statuses_includes_detected_instances() {
        let runner = MockRunner::default()
            .respond(
                &["systemctl", "list-units"],
                0,
                "postgresql@14-main.service loaded active running PostgreSQL Cluster 14-main\n\u{25cf} postgresql@15-test.service loaded failed failed PostgreSQL Cluster 15-test\n",
                "",
            )
            .respond(&["systemctl", "is-active"], 0, "active\n", "");
        let mut cfg = services();
        cfg.postgres.instances = vec!["postgresql@14-main".to_string()];
        let controller = ServiceController::new(&runner, &cfg, false);
        assert_eq!(
            controller.postgres_instances(),
            vec!["postgresql@14-main", "postgresql@15-test"]
        );
        let statuses = controller.all_statuses();
        let keys: Vec<&str> = statuses.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "odoo",
                "postgres",
                "postgres_postgresql_14-main",
                "postgres_postgresql_15-test"
            ]
        );
    }

    #[test]
    fn service_names_resolve_from_keys() {
        let runner = MockRunner::default();
        let mut cfg = services();
        cfg.odoo.service_name = "odoo17".to_string();
        let controller = ServiceController::new(&runner, &cfg, false);
        assert_eq!(
            controller.service_name_for_key("postgres_postgresql_14-main"),
            "postgresql@14-main"
        );
        assert_eq!(controller.service_name_for_key("odoo"), "odoo17");
        assert_eq!(controller.service_name_for_key("postgres"), "postgresql");
        assert_eq!(controller.service_name_for_key("redis"), "redis");
    }

    #[test]
    fn control_uses_sudo_when_requested() {
        let runner = MockRunner::default();
        let cfg = services();
        let controller = ServiceController::new(&runner, &cfg, true);
        let result = controller.control("postgres_postgresql_14-main", ServiceAction::Restart);
        assert!(result.success);
        assert_eq!(result.status, "restarted");
        assert_eq!(
            runner.calls(),
            vec![RecordedCall {
                program: "sudo".to_string(),
                args: vec![
                    "-n".to_string(),
                    "systemctl".to_string(),
                    "restart".to_string(),
                    "postgresql@14-main".to_string()
                ],
            }]
        );
    }

    #[test]
    fn control_failure_carries_stderr() {
        let runner = MockRunner::default().respond(
            &["systemctl", "stop"],
            1,
            "",
            "Failed to stop odoo.service: Access denied\n",
        );
        let cfg = services();
        let controller = ServiceController::new(&runner, &cfg, false);
        let result = controller.control("odoo", ServiceAction::Stop);
        assert!(!result.success);
        assert_eq!(result.status, "error");
        assert_eq!(
            result.error.as_deref(),
            Some("Failed to stop odoo.service: Access denied")
        );
    }

    #[test]
    fn control_rejects_option_like_keys() {
        let runner = MockRunner::default();
        let cfg = services();
        let controller = ServiceController::new(&runner, &cfg, false);
        let result = controller.control("--force", ServiceAction::Start);
        assert!(!result.success);
        assert!(runner.calls().is_empty());
    }

    fn identity_with_odoo_group(members: &[&str]) -> FakeIdentity {
        let mut identity = FakeIdentity::default();
        identity.users.insert(1000, "alice".to_string());
        identity.users.insert(1001, "bob".to_string());
        identity.groups.insert(118, "odoo".to_string());
        identity.members.insert(
            "odoo".to_string(),
            members.iter().map(|name| name.to_string()).collect::<BTreeSet<_>>(),
        );
        identity
    }

    #[test]
    fn add_to_group_runs_usermod() {
        let runner = MockRunner::default();
        let cfg = services();
        let controller = ServiceController::new(&runner, &cfg, false);
        let identity = identity_with_odoo_group(&["bob"]);
        let result = controller.add_user_to_group(&identity, "alice", "odoo");
        assert!(result.success);
        assert_eq!(result.status, "success");
        assert_eq!(runner.calls()[0].program, "usermod");
        assert_eq!(runner.calls()[0].args, vec!["-a", "-G", "odoo", "alice"]);
    }

    #[test]
    fn add_to_group_is_noop_for_members() {
        let runner = MockRunner::default();
        let cfg = services();
        let controller = ServiceController::new(&runner, &cfg, true);
        let identity = identity_with_odoo_group(&["bob"]);
        let result = controller.add_user_to_group(&identity, "bob", "odoo");
        assert!(result.success);
        assert_eq!(result.status, "already_in_group");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn add_to_group_rejects_unknown_user_and_group() {
        let runner = MockRunner::default();
        let cfg = services();
        let controller = ServiceController::new(&runner, &cfg, false);
        let identity = identity_with_odoo_group(&[]);
        let unknown_user = controller.add_user_to_group(&identity, "mallory", "odoo");
        assert!(!unknown_user.success);
        assert!(unknown_user.error.unwrap().contains("does not exist"));
        let unknown_group = controller.add_user_to_group(&identity, "alice", "erp");
        assert!(!unknown_group.success);
        assert!(runner.calls().is_empty());
    }
}
