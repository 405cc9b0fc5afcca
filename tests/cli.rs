use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("odmon");
    Command::new(path)
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

fn id_flag(flag: &str) -> String {
    let output = std::process::Command::new("id")
        .arg(flag)
        .output()
        .expect("run id");
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Config whose policy matches what the test process creates: current user/group, 0755/0644.
fn write_config(config_path: &Path, odoo_conf: &Path, port: u16) {
    fs::write(
        config_path,
        format!(
            "version: 1\nserver:\n  host: 127.0.0.1\n  port: {port}\nservices:\n  odoo:\n    config_file: {}\n  postgres:\n    auto_detect: false\npermissions:\n  owner: {}\n  group: {}\n  dir_mode: \"755\"\n  file_mode: \"644\"\ncontrol:\n  use_sudo: false\n",
            odoo_conf.display(),
            id_flag("-un"),
            id_flag("-gn"),
        ),
    )
    .unwrap();
}

fn make_addon(root: &Path, name: &str) -> PathBuf {
    let addon = root.join(name);
    let module = addon.join("sale_extra");
    fs::create_dir_all(&module).unwrap();
    fs::write(module.join("__init__.py"), "").unwrap();
    fs::write(module.join("__manifest__.py"), "{'name': 'Sale Extra'}\n").unwrap();
    for dir in [&addon, &module] {
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).unwrap();
    }
    for file in ["__init__.py", "__manifest__.py"] {
        fs::set_permissions(module.join(file), fs::Permissions::from_mode(0o644)).unwrap();
    }
    addon
}

struct Setup {
    _dir: tempfile::TempDir,
    root: PathBuf,
    config_path: PathBuf,
    addon: PathBuf,
}

fn setup() -> Setup {
    let dir = tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let addon = make_addon(&root, "custom_addons");
    let odoo_conf = root.join("odoo.conf");
    fs::write(
        &odoo_conf,
        format!(
            "[options]\ndb_user = odoo\naddons_path = {}, {}\n",
            addon.display(),
            root.join("missing_addons").display()
        ),
    )
    .unwrap();
    let config_path = root.join("config.yaml");
    write_config(&config_path, &odoo_conf, free_port());
    Setup {
        _dir: dir,
        root,
        config_path,
        addon,
    }
}

#[test]
fn config_init_creates_and_preserves_existing() {
    let dir = tempdir().unwrap();
    let config_dir = dir.path().join("config");

    let output = bin()
        .env("ODMON_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("config")
        .arg("init")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["ok"], true);
    assert_eq!(json["result"]["created"], true);
    let written = fs::read_to_string(config_dir.join("config.yaml")).unwrap();
    assert!(written.contains("max_reported_files: 50"));

    let output = bin()
        .env("ODMON_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("config")
        .arg("init")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(parse_json(&output)["result"]["created"], false);
}

#[test]
fn config_validate_rejects_unknown_fields_and_versions() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");

    fs::write(&config_path, "version: 1\nbogus_section: true\n").unwrap();
    bin()
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("validate")
        .assert()
        .failure()
        .stderr(contains("bogus_section"));

    fs::write(&config_path, "version: 7\n").unwrap();
    bin()
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("validate")
        .assert()
        .failure()
        .stderr(contains("version"));

    fs::write(&config_path, "version: 1\npermissions:\n  dir_mode: \"999\"\n").unwrap();
    let output = bin()
        .arg("--config")
        .arg(&config_path)
        .arg("--json")
        .arg("config")
        .arg("validate")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["ok"], false);
    assert!(json["error"].as_str().unwrap().contains("dir_mode"));
}

#[test]
fn config_validate_accepts_default_template() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::copy("config/default.yaml", &config_path).unwrap();
    let output = bin()
        .arg("--config")
        .arg(&config_path)
        .arg("--json")
        .arg("config")
        .arg("validate")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(parse_json(&output)["result"]["valid"], true);
}

#[test]
fn paths_reports_layout_under_config_dir() {
    let dir = tempdir().unwrap();
    let output = bin()
        .env("ODMON_CONFIG_DIR", dir.path())
        .arg("--json")
        .arg("paths")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    let result = &json["result"];
    assert_eq!(
        result["config_path"],
        dir.path().join("config.yaml").to_string_lossy().as_ref()
    );
    assert_eq!(result["config_exists"], false);
    assert_eq!(
        result["pid_path"],
        dir.path().join("run/server.pid").to_string_lossy().as_ref()
    );
    assert_eq!(result["dashboard_url"], "http://127.0.0.1:8008");
}

#[test]
fn modules_list_flags_missing_addon_paths() {
    let setup = setup();
    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("modules")
        .arg("list")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    let paths = json["result"]["paths"].as_array().unwrap();
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[0]["path"], setup.addon.to_string_lossy().as_ref());
    assert_eq!(paths[0]["exists"], true);
    assert_eq!(paths[1]["exists"], false);
}

#[test]
fn modules_check_reports_consistent_tree_as_ok() {
    let setup = setup();
    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("modules")
        .arg("check")
        .arg("--path")
        .arg(&setup.addon)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    let verdict = &json["result"];
    assert_eq!(verdict["status"], "ok");
    assert_eq!(verdict["mode"], "0755");
    assert_eq!(verdict["files_consistent"], true);
    assert_eq!(verdict["files_checked"], 3);
    assert_eq!(verdict["inconsistent_total"], 0);
}

#[test]
fn modules_check_all_paths_reports_drift_and_missing() {
    let setup = setup();
    fs::set_permissions(
        setup.addon.join("sale_extra/__init__.py"),
        fs::Permissions::from_mode(0o600),
    )
    .unwrap();

    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("modules")
        .arg("check")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    let modules = json["result"]["modules"].as_array().unwrap();
    assert_eq!(modules.len(), 2);
    assert_eq!(modules[0]["status"], "warning");
    assert_eq!(modules[0]["dir_mode_ok"], true);
    let inconsistent: Vec<&str> = modules[0]["inconsistent_files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|value| value.as_str().unwrap())
        .collect();
    assert_eq!(inconsistent.len(), 1);
    assert!(inconsistent[0].ends_with("sale_extra/__init__.py"));
    assert_eq!(modules[1]["status"], "not_found");
}

#[test]
fn modules_check_missing_path_fails() {
    let setup = setup();
    bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("modules")
        .arg("check")
        .arg("--path")
        .arg(setup.root.join("nope"))
        .assert()
        .failure()
        .stderr(contains("does not exist"));
}

#[test]
fn modules_fix_requires_yes_when_non_interactive() {
    let setup = setup();
    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("modules")
        .arg("fix")
        .arg(&setup.addon)
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["ok"], false);
    assert!(json["error"].as_str().unwrap().contains("--yes"));

    bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("modules")
        .arg("fix")
        .arg(setup.root.join("nope"))
        .arg("--yes")
        .assert()
        .failure()
        .stderr(contains("directory not found"));
}

#[test]
fn modules_fix_restores_modes_for_owned_tree() {
    let setup = setup();
    let init = setup.addon.join("sale_extra/__init__.py");
    fs::set_permissions(&init, fs::Permissions::from_mode(0o600)).unwrap();
    fs::set_permissions(
        setup.addon.join("sale_extra"),
        fs::Permissions::from_mode(0o700),
    )
    .unwrap();

    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("modules")
        .arg("fix")
        .arg(&setup.addon)
        .arg("--yes")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["result"]["success"], true);
    assert_eq!(json["result"]["status"], "ok");
    assert_eq!(json["result"]["failed_count"], 0);
    assert_eq!(
        fs::metadata(&init).unwrap().permissions().mode() & 0o7777,
        0o644
    );
    assert_eq!(
        fs::metadata(setup.addon.join("sale_extra"))
            .unwrap()
            .permissions()
            .mode()
            & 0o7777,
        0o755
    );
}

#[test]
fn group_members_of_missing_group_is_empty_with_warning() {
    let setup = setup();
    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("group")
        .arg("members")
        .arg("--group")
        .arg("odmon-no-such-group")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["result"]["exists"], false);
    assert_eq!(json["result"]["members"], serde_json::json!([]));
    assert!(json["result"]["warning"]
        .as_str()
        .unwrap()
        .contains("does not exist"));
}

#[test]
fn users_add_to_group_rejects_unknown_user() {
    let setup = setup();
    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("users")
        .arg("add-to-group")
        .arg("odmon-no-such-user")
        .arg("--yes")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["ok"], false);
    assert_eq!(json["result"]["success"], false);
    assert!(json["error"].as_str().unwrap().contains("does not exist"));
}

#[test]
fn users_list_reports_policy_group() {
    let setup = setup();
    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("users")
        .arg("list")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert!(json["result"]["users"].is_array());
    assert_eq!(json["result"]["odoo_group"], id_flag("-gn"));
}

#[test]
fn service_control_rejects_invalid_unit_names() {
    let setup = setup();
    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("service")
        .arg("restart")
        .arg("odoo;reboot")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["ok"], false);
    assert!(json["error"]
        .as_str()
        .unwrap()
        .contains("invalid service name"));
}

#[test]
fn doctor_json_lists_checks() {
    let setup = setup();
    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("doctor")
        .output()
        .unwrap();
    let json = parse_json(&output.stdout);
    let checks = json["result"]["checks"].as_array().unwrap();
    let ids: Vec<&str> = checks
        .iter()
        .map(|check| check["id"].as_str().unwrap())
        .collect();
    for id in ["config_file", "systemctl", "odoo_config", "addons_paths", "permission_policy"] {
        assert!(ids.contains(&id), "missing check {id}");
    }
    let addons = checks
        .iter()
        .find(|check| check["id"] == "addons_paths")
        .unwrap();
    assert_eq!(addons["ok"], false);
    let policy = checks
        .iter()
        .find(|check| check["id"] == "permission_policy")
        .unwrap();
    assert_eq!(policy["ok"], true);
    assert_eq!(json["ok"], output.status.success());
}

#[test]
fn server_up_status_down_cycle() {
    let setup = setup();
    let config_dir = setup.root.clone();

    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("server")
        .arg("up")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["result"]["running"], true);
    assert!(config_dir.join("run/server.pid").exists());

    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("server")
        .arg("status")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(parse_json(&output)["result"]["running"], true);

    let output = bin()
        .arg("--config")
        .arg(&setup.config_path)
        .arg("--json")
        .arg("server")
        .arg("down")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(parse_json(&output)["result"]["running"], false);

    let events = fs::read_to_string(config_dir.join("run/events.jsonl")).unwrap();
    assert!(events.contains("server.started"));
}
