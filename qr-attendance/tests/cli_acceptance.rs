use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn working_dir(&self) -> PathBuf {
        self.xdg_data.join("qr-attendance-logger")
    }

    fn fallback_path(&self) -> PathBuf {
        self.working_dir().join("failed_attendance.log")
    }

    fn config_path(&self) -> PathBuf {
        self.xdg_config.join("qr-attendance-logger/config.toml")
    }

    fn write_config(&self, content: &str) {
        let path = self.config_path();
        fs::create_dir_all(path.parent().expect("missing config parent"))
            .expect("failed to create config dir");
        fs::write(path, content).expect("failed to write config");
    }
}

fn command(env: &CliTestEnv, args: &[&str]) -> Command {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("qr-attendance"));
    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("QR_LOGGER_CONNECTION_STRING")
        .env_remove("QR_LOGGER_ACCOUNT_NAME")
        .env_remove("QR_LOGGER_SAS_TOKEN")
        .env_remove("RUST_LOG");
    command
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    command(env, args)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute qr-attendance: {e}"))
}

fn run_with_stdin(env: &CliTestEnv, args: &[&str], input: &str) -> Output {
    let mut child = command(env, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("failed to spawn qr-attendance: {e}"));

    child
        .stdin
        .take()
        .expect("stdin is piped")
        .write_all(input.as_bytes())
        .expect("failed to write stdin");

    child
        .wait_with_output()
        .expect("failed to wait for qr-attendance")
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "qr-attendance {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

#[test]
fn config_prints_config_path() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["config"]);
    assert_success(&["config"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), env.config_path().display().to_string());
}

#[test]
fn status_reports_pending_fallback_records() {
    let env = CliTestEnv::new();
    fs::create_dir_all(env.working_dir()).expect("failed to create working dir");
    fs::write(
        env.fallback_path(),
        "2022-06-01 10:00:00\talice\n2022-06-01 10:05:00\tbob\n",
    )
    .expect("failed to seed fallback file");

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("QR Attendance Logger Status"));
    assert!(stdout.contains("Pending records: 2"), "got:\n{stdout}");
    assert!(stdout.contains("Credentials:     <not set>"));
    assert!(stdout.contains("(not found, using defaults)"));
}

#[test]
fn status_json_reflects_config_file() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[remote]
container = "school-42"
connection_string = "UseDevelopmentStorage=true"
"#,
    );

    let output = run_bin(&env, &["status", "--json"]);
    assert_success(&["status", "--json"], &output);

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status --json should print JSON");
    assert_eq!(report["container"], "school-42");
    assert_eq!(report["config_found"], true);
    assert_eq!(report["credentials"], "connection string");
    assert_eq!(report["credential_source"], "config file");
    assert_eq!(report["pending_records"], 0);
}

#[test]
fn dry_run_delivers_piped_entries() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[delivery]
cycle_delay_ms = 0
"#,
    );

    let args = ["run", "--dry-run"];
    let output = run_with_stdin(&env, &args, "alice\n\n   \n  bob  \n");
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Working directory:"), "got:\n{stdout}");
    assert!(stdout.contains("Delivered:      2"), "got:\n{stdout}");
    assert!(stdout.contains("/attendance.log"));
    assert!(stdout.contains("\talice\n"));
    assert!(stdout.contains("\tbob\n"));
    assert!(!env.fallback_path().exists());
}

#[test]
fn dry_run_previews_leftover_records_without_consuming_them() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[delivery]
cycle_delay_ms = 0
"#,
    );
    let seeded = "2022-06-01 10:00:00\talice\n";
    fs::create_dir_all(env.working_dir()).expect("failed to create working dir");
    fs::write(env.fallback_path(), seeded).expect("failed to seed fallback file");

    let args = ["run", "--dry-run"];
    let output = run_with_stdin(&env, &args, "bob\n");
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Delivered:      2"), "got:\n{stdout}");
    assert!(stdout.contains("Re-added:       1"));
    assert!(stdout.contains("--- year=2022/month=06/attendance.log"));
    assert!(stdout.contains("2022-06-01 10:00:00\talice\n"));

    let remaining = fs::read_to_string(env.fallback_path())
        .expect("real fallback file must survive a dry run");
    assert_eq!(remaining, seeded);

    let status = run_bin(&env, &["status"]);
    assert_success(&["status"], &status);
    assert!(String::from_utf8_lossy(&status.stdout).contains("Pending records: 1"));
}

#[test]
fn run_without_credentials_fails() {
    let env = CliTestEnv::new();

    let output = run_with_stdin(&env, &["run"], "");
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("storage credentials are not configured"),
        "got:\n{stderr}"
    );
}
