#[cfg(not(unix))]
compile_error!("odmon requires a unix host: the addon permission model is POSIX-only");

mod config;
mod identity;
mod permissions;
mod resources;
mod server;
mod services;

use clap::{Parser, Subcommand};
use config::{
    config_dir_from_path, load_config_or_default, read_addon_paths, read_config,
    resolve_config_path, Config, DEFAULT_CONFIG_YAML,
};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use identity::{human_users, read_uid_min, IdentityResolver, SystemIdentity};
use permissions::{format_mode, DirectoryVerdict, FixResult, PermissionEngine, VerdictStatus};
use serde::Serialize;
use serde_json::json;
use server::ServerPaths;
use services::{ActionResult, ServiceAction, ServiceController, SystemCommandRunner};
use std::fs;
use std::io;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "odmon", version, about = "Odoo development server monitor")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    /// Tracing filter, e.g. `debug` or `odmon=trace`. Overrides `logging.level`.
    #[arg(long = "log-level", global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Service states and host resources.
    Status,
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },
    Resources,
    /// Addon directories and their permission state.
    Modules {
        #[command(subcommand)]
        command: ModulesCommand,
    },
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
    Group {
        #[command(subcommand)]
        command: GroupCommand,
    },
    Doctor {
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    Paths,
    /// Background dashboard server.
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Subcommand, Debug)]
enum ServiceCommand {
    Status,
    Start { key: String },
    Stop { key: String },
    Restart { key: String },
}

#[derive(Subcommand, Debug)]
enum ModulesCommand {
    List,
    Check {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    Fix {
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum UsersCommand {
    List,
    AddToGroup {
        username: String,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum GroupCommand {
    Members {
        #[arg(long)]
        group: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    Up,
    Down,
    Status,
    #[command(hide = true)]
    Serve,
}

#[derive(Debug, Error)]
pub enum OdmonError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

impl Context {
    fn server_paths(&self) -> ServerPaths {
        ServerPaths::under(&config_dir_from_path(&self.config_path))
    }
}

fn main() -> Result<(), OdmonError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);
    init_tracing(&ctx, cli.log_level.as_deref());

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Status => handle_status(&ctx),
        Commands::Service { command } => handle_service(&ctx, command),
        Commands::Resources => output(&ctx, serde_json::to_value(resources::sample_resources())?),
        Commands::Modules { command } => handle_modules(&ctx, command),
        Commands::Users { command } => handle_users(&ctx, command),
        Commands::Group { command } => handle_group(&ctx, command),
        Commands::Doctor { strict } => handle_doctor(&ctx, strict),
        Commands::Paths => handle_paths(&ctx),
        Commands::Server { command } => handle_server(&ctx, command),
    };

    if let Err(err) = result {
        tracing::debug!(error = %err, "command failed");
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    }
}

/// `--log-level` wins over `logging.level`; an unreadable config falls back to `info`
/// so the command itself can report the config error.
fn init_tracing(ctx: &Context, cli_level: Option<&str>) {
    let logging = load_config_or_default(&ctx.config_path)
        .map(|cfg| cfg.logging)
        .unwrap_or_default();
    let level = cli_level
        .map(str::to_string)
        .filter(|level| !level.trim().is_empty())
        .unwrap_or(logging.level);
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_file = config::expand_path(logging.file.trim());
    if !log_file.is_empty() {
        let opened = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file);
        match opened {
            Ok(file) => {
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .try_init();
                return;
            }
            Err(err) => eprintln!("cannot open log file {log_file}: {err}; logging to stderr"),
        }
    }
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn ensure_parent(path: &Path) -> Result<(), OdmonError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn load_config(ctx: &Context) -> Result<Config, OdmonError> {
    load_config_or_default(&ctx.config_path)
}

/// Mutating commands ask first. Without a terminal (or with `--json`) the caller must
/// have passed `--yes`.
fn confirm_mutation(ctx: &Context, yes: bool, prompt: String) -> Result<bool, OdmonError> {
    if yes {
        return Ok(true);
    }
    if ctx.json || !io::stdin().is_terminal() {
        return Err(OdmonError::Config(
            "refusing to change the system without --yes in non-interactive mode".to_string(),
        ));
    }
    let theme = ColorfulTheme::default();
    Ok(Confirm::with_theme(&theme)
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), OdmonError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            tracing::info!(path = %ctx.config_path.display(), "wrote default config");
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let cfg = read_config(&ctx.config_path)?;
            let warnings = cfg.policy_warnings(&SystemIdentity::default());
            for warning in &warnings {
                tracing::warn!(warning = %warning, "permission policy");
            }
            output(
                ctx,
                json!({"path": ctx.config_path, "valid": true, "warnings": warnings}),
            )
        }
        ConfigCommand::Show => {
            let cfg = load_config(ctx)?;
            output(
                ctx,
                json!({
                    "path": ctx.config_path,
                    "exists": ctx.config_path.exists(),
                    "config": cfg,
                }),
            )
        }
    }
}

fn handle_status(ctx: &Context) -> Result<(), OdmonError> {
    let cfg = load_config(ctx)?;
    let runner = SystemCommandRunner;
    let controller = ServiceController::new(&runner, &cfg.services, cfg.elevate_with_sudo());
    output(
        ctx,
        json!({
            "services": controller.all_statuses(),
            "resources": resources::sample_resources(),
        }),
    )
}

fn action_outcome(ctx: &Context, result: ActionResult) -> Result<(), OdmonError> {
    if result.success {
        return output(ctx, serde_json::to_value(&result)?);
    }
    let message = match &result.error {
        Some(error) if !error.is_empty() => format!("{}: {}", result.message, error),
        _ => result.message.clone(),
    };
    fail_with_result(ctx, serde_json::to_value(&result)?, message)
}

fn handle_service(ctx: &Context, command: ServiceCommand) -> Result<(), OdmonError> {
    let cfg = load_config(ctx)?;
    let runner = SystemCommandRunner;
    let controller = ServiceController::new(&runner, &cfg.services, cfg.elevate_with_sudo());
    let (key, action) = match command {
        ServiceCommand::Status => {
            return output(ctx, serde_json::to_value(controller.all_statuses())?);
        }
        ServiceCommand::Start { key } => (key, ServiceAction::Start),
        ServiceCommand::Stop { key } => (key, ServiceAction::Stop),
        ServiceCommand::Restart { key } => (key, ServiceAction::Restart),
    };
    action_outcome(ctx, controller.control(&key, action))
}

fn verdict_line(verdict: &DirectoryVerdict) -> String {
    let mut line = format!("[{}] {}", verdict.status.as_str(), verdict.path);
    if let Some(details) = &verdict.details {
        line.push_str(&format!(
            " owner={}:{} mode={} checked={} inconsistent={}",
            details.owner,
            details.group,
            details.mode,
            details.files_checked,
            details.inconsistent_total
        ));
        for file in &details.inconsistent_files {
            line.push_str(&format!("\n  {file}"));
        }
        if details.inconsistent_total > details.inconsistent_files.len() {
            line.push_str(&format!(
                "\n  ... and {} more",
                details.inconsistent_total - details.inconsistent_files.len()
            ));
        }
    }
    if let Some(error) = &verdict.error {
        line.push_str(&format!("\n  error: {error}"));
    }
    line
}

fn fix_line(result: &FixResult) -> String {
    let mut line = format!(
        "[{}] {} fixed={} failed={}",
        result.status.as_str(),
        result.path,
        result.fixed_count,
        result.failed_count
    );
    for failure in &result.failures {
        line.push_str(&format!(
            "\n  {} {}: {}",
            failure.operation, failure.path, failure.message
        ));
    }
    for remaining in &result.remaining_inconsistent_files {
        line.push_str(&format!("\n  still inconsistent: {remaining}"));
    }
    line
}

fn handle_modules(ctx: &Context, command: ModulesCommand) -> Result<(), OdmonError> {
    let cfg = load_config(ctx)?;
    let policy = cfg.permissions.policy()?;
    match command {
        ModulesCommand::List => {
            let addons = read_addon_paths(&cfg)?;
            let paths: Vec<serde_json::Value> = addons
                .paths
                .iter()
                .map(|path| json!({"path": path, "exists": path.is_dir()}))
                .collect();
            output(
                ctx,
                json!({
                    "config_file": addons.config_file,
                    "paths": paths,
                    "warning": addons.warning,
                }),
            )
        }
        ModulesCommand::Check { path } => {
            let engine = PermissionEngine::system();
            for warning in policy.policy_warnings(engine.identity()) {
                tracing::warn!(warning = %warning, "permission policy");
            }
            if let Some(path) = path {
                let verdict = engine.inspect(&path, &policy);
                if verdict.status == VerdictStatus::NotFound {
                    return Err(OdmonError::NotFound(format!(
                        "directory does not exist: {}",
                        path.display()
                    )));
                }
                return output_lines(ctx, serde_json::to_value(&verdict)?, vec![verdict_line(&verdict)]);
            }
            let addons = read_addon_paths(&cfg)?;
            let verdicts = engine.inspect_all(&addons.paths, &policy);
            let lines = verdicts.iter().map(verdict_line).collect();
            output_lines(
                ctx,
                json!({
                    "config_file": addons.config_file,
                    "modules": verdicts,
                    "warning": addons.warning,
                }),
                lines,
            )
        }
        ModulesCommand::Fix { path, yes } => {
            if !path.is_dir() {
                return Err(OdmonError::NotFound(format!(
                    "directory not found: {}",
                    path.display()
                )));
            }
            let prompt = format!(
                "Set ownership {}:{} and modes {}/{} under {}?",
                policy.owner,
                policy.group,
                format_mode(policy.dir_mode),
                format_mode(policy.file_mode),
                path.display()
            );
            if !confirm_mutation(ctx, yes, prompt)? {
                return output(ctx, json!({"path": path, "aborted": true}));
            }
            let engine = PermissionEngine::system();
            let result = engine.repair(&path, &policy);
            let line = fix_line(&result);
            if result.success {
                return output_lines(ctx, serde_json::to_value(&result)?, vec![line]);
            }
            if !ctx.json {
                println!("{line}");
            }
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| format!("repair of {} incomplete", path.display()));
            fail_with_result(ctx, serde_json::to_value(&result)?, message)
        }
    }
}

fn handle_users(ctx: &Context, command: UsersCommand) -> Result<(), OdmonError> {
    let cfg = load_config(ctx)?;
    let policy = cfg.permissions.policy()?;
    let identity = SystemIdentity::default();
    match command {
        UsersCommand::List => {
            let users = human_users(
                &identity,
                &identity.passwd_entries(),
                read_uid_min(),
                &policy.group,
            );
            output(
                ctx,
                json!({
                    "users": users,
                    "odoo_user": policy.owner,
                    "odoo_group": policy.group,
                }),
            )
        }
        UsersCommand::AddToGroup { username, yes } => {
            let prompt = format!("Add {} to group {}?", username, policy.group);
            if !confirm_mutation(ctx, yes, prompt)? {
                return output(ctx, json!({"username": username, "aborted": true}));
            }
            let runner = SystemCommandRunner;
            let controller =
                ServiceController::new(&runner, &cfg.services, cfg.elevate_with_sudo());
            action_outcome(
                ctx,
                controller.add_user_to_group(&identity, &username, &policy.group),
            )
        }
    }
}

fn handle_group(ctx: &Context, command: GroupCommand) -> Result<(), OdmonError> {
    match command {
        GroupCommand::Members { group } => {
            let group = match group {
                Some(group) => group,
                None => load_config(ctx)?.permissions.group,
            };
            let membership = SystemIdentity::default().members_of(&group);
            output(ctx, serde_json::to_value(membership)?)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    severity: String,
    strict_fail: bool,
    message: String,
    remediation: String,
    details: serde_json::Value,
}

fn doctor_check(
    id: &str,
    ok: bool,
    severity: &str,
    strict_fail: bool,
    message: impl Into<String>,
    remediation: impl Into<String>,
    details: serde_json::Value,
) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        strict_fail,
        message: message.into(),
        remediation: remediation.into(),
        details,
    }
}

fn collect_doctor_checks(
    ctx: &Context,
    cfg: &Config,
    identity: &dyn IdentityResolver,
) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();

    let config_exists = ctx.config_path.exists();
    checks.push(doctor_check(
        "config_file",
        config_exists,
        "warn",
        false,
        if config_exists {
            "config file present"
        } else {
            "config file not found, built-in defaults in use"
        },
        "Run `odmon config init` and adjust the policy to this host.",
        json!({"path": ctx.config_path}),
    ));

    for (id, binary, severity, remediation) in [
        (
            "systemctl",
            "systemctl",
            "error",
            "Service status and control need systemd's systemctl in PATH.",
        ),
        (
            "usermod",
            "usermod",
            "warn",
            "Install the shadow utilities to enrol users in the odoo group.",
        ),
    ] {
        let found = which::which(binary).ok();
        checks.push(doctor_check(
            id,
            found.is_some(),
            severity,
            true,
            match &found {
                Some(path) => format!("{binary} found at {}", path.display()),
                None => format!("{binary} is not installed or not in PATH"),
            },
            remediation,
            json!({"path": found}),
        ));
    }

    if cfg.elevate_with_sudo() {
        let sudo = which::which("sudo").ok();
        checks.push(doctor_check(
            "sudo",
            sudo.is_some(),
            "warn",
            true,
            if sudo.is_some() {
                "sudo available for privileged actions"
            } else {
                "control.use_sudo is set but sudo is not installed"
            },
            "Install sudo, run odmon as root, or set control.use_sudo: false.",
            json!({"path": sudo}),
        ));
    }

    let addons = read_addon_paths(cfg);
    let odoo_conf_ok = addons.is_ok();
    checks.push(doctor_check(
        "odoo_config",
        odoo_conf_ok,
        "error",
        true,
        match &addons {
            Ok(addons) => format!("read {}", addons.config_file),
            Err(err) => err.to_string(),
        },
        "Point services.odoo.config_file at the odoo.conf used by the server.",
        json!({"path": cfg.odoo_config_path()}),
    ));
    if let Ok(addons) = &addons {
        let missing: Vec<String> = addons
            .paths
            .iter()
            .filter(|path| !path.is_dir())
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        let ok = !addons.paths.is_empty() && missing.is_empty();
        checks.push(doctor_check(
            "addons_paths",
            ok,
            "warn",
            true,
            if addons.paths.is_empty() {
                "odoo.conf declares no addons_path".to_string()
            } else if missing.is_empty() {
                format!("{} addon path(s) present", addons.paths.len())
            } else {
                format!("missing addon path(s): {}", missing.join(", "))
            },
            "Create the directories or fix addons_path in odoo.conf.",
            json!({"paths": addons.paths, "missing": missing}),
        ));
    }

    let policy_warnings = cfg.policy_warnings(identity);
    checks.push(doctor_check(
        "permission_policy",
        policy_warnings.is_empty(),
        "error",
        true,
        if policy_warnings.is_empty() {
            "policy owner and group resolve on this host".to_string()
        } else {
            policy_warnings.join("; ")
        },
        "Create the odoo user/group or set permissions.owner/group in the config.",
        json!({"owner": cfg.permissions.owner, "group": cfg.permissions.group}),
    ));

    let membership = identity.members_of(&cfg.permissions.group);
    let current_user = identity.current_user();
    let in_group = current_user
        .as_deref()
        .map(|user| membership.contains(user))
        .unwrap_or(false);
    checks.push(doctor_check(
        "current_user_group",
        in_group,
        "warn",
        true,
        match &current_user {
            Some(user) if in_group => format!("{user} is in group {}", cfg.permissions.group),
            Some(user) => format!("{user} is not in group {}", cfg.permissions.group),
            None => "invoking user could not be resolved".to_string(),
        },
        "Run `odmon users add-to-group <you>` and start a new login session.",
        json!({"user": current_user, "group": cfg.permissions.group}),
    ));

    checks
}

/// `(ok, primary error)` for a set of checks.
fn doctor_outcome(checks: &[DoctorCheck], strict: bool) -> (bool, Option<String>) {
    let has_error = checks
        .iter()
        .any(|check| !check.ok && check.severity == "error");
    let has_strict_warning = checks.iter().any(|check| !check.ok && check.strict_fail);
    let ok = !has_error && (!strict || !has_strict_warning);
    let primary_error = checks
        .iter()
        .find(|check| !check.ok && check.severity == "error")
        .or_else(|| {
            checks
                .iter()
                .find(|check| !check.ok && strict && check.strict_fail)
        })
        .map(|check| check.message.clone());
    (ok, if ok { None } else { primary_error })
}

fn handle_doctor(ctx: &Context, strict: bool) -> Result<(), OdmonError> {
    let cfg = load_config(ctx)?;
    let checks = collect_doctor_checks(ctx, &cfg, &SystemIdentity::default());
    let (ok, primary_error) = doctor_outcome(&checks, strict);

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks, "strict": strict })),
            error: primary_error,
        };
        print_json(&payload)?;
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok { "ok" } else { "fail" };
        println!(
            "[{}] {} ({}) - {}",
            state, check.id, check.severity, check.message
        );
        if !check.ok {
            println!("  remediation: {}", check.remediation);
        }
    }
    if ok {
        return Ok(());
    }
    Err(OdmonError::Process(primary_error.unwrap_or_else(|| {
        "one or more readiness checks failed".to_string()
    })))
}

fn handle_paths(ctx: &Context) -> Result<(), OdmonError> {
    let cfg = load_config(ctx)?;
    let paths = ctx.server_paths();
    let log_file = config::expand_path(cfg.logging.file.trim());
    output(
        ctx,
        json!({
            "config_path": ctx.config_path,
            "config_exists": ctx.config_path.exists(),
            "config_dir": config_dir_from_path(&ctx.config_path),
            "state_dir": paths.state_dir,
            "pid_path": paths.pid_path,
            "events_path": paths.events_path,
            "odoo_config_file": cfg.odoo_config_path(),
            "log_file": if log_file.is_empty() { None } else { Some(log_file) },
            "dashboard_url": server::base_url(&cfg),
        }),
    )
}

fn handle_server(ctx: &Context, command: ServerCommand) -> Result<(), OdmonError> {
    let cfg = load_config(ctx)?;
    let paths = ctx.server_paths();
    match command {
        ServerCommand::Up => output(ctx, server::up(&ctx.config_path, &cfg, &paths)?),
        ServerCommand::Down => output(ctx, server::down(&cfg, &paths)?),
        ServerCommand::Status => output(ctx, server::status_payload(&cfg, &paths)),
        ServerCommand::Serve => server::serve(cfg, &paths),
    }
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), OdmonError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn output_lines(
    ctx: &Context,
    payload: serde_json::Value,
    lines: Vec<String>,
) -> Result<(), OdmonError> {
    if ctx.json {
        return output(ctx, payload);
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

/// Failure that still carries a result body (partial repair, refused action).
fn fail_with_result(
    ctx: &Context,
    payload: serde_json::Value,
    message: String,
) -> Result<(), OdmonError> {
    if ctx.json {
        print_json(&JsonResult {
            ok: false,
            result: Some(payload),
            error: Some(message),
        })?;
        std::process::exit(1);
    }
    Err(OdmonError::Process(message))
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), OdmonError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
