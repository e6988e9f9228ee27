//! Heavy validation: install, migrate, seed, typecheck, build, test, boot
//!
//! Runs inside an isolated worktree. Every subprocess gets its own timeout
//! and its own process group so a timed-out command cannot leave children
//! behind. Failed commands are enriched with typed failures for the
//! classifier.

use crate::bas;
use crate::canon::sha256_hex;
use crate::checks;
use crate::failures::parse_check_output;
use crate::validation::{CheckResult, ValidationReport};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

/// Heavy pipeline knobs.
#[derive(Debug, Clone)]
pub struct HeavyOptions {
    /// Run `npm ci --include=dev` before anything else.
    pub install_deps: bool,
    /// Health endpoint polled during boot.
    pub health_path: String,
    pub install_timeout: Duration,
    pub migrate_timeout: Duration,
    pub build_timeout: Duration,
    pub test_timeout: Duration,
    pub boot_timeout: Duration,
    /// Check ids whose failure is recorded but not blocking.
    pub allow_failure: Vec<String>,
}

impl Default for HeavyOptions {
    fn default() -> Self {
        Self {
            install_deps: bas::read_bool("AGENT_HEAVY_INSTALL_DEPS")
                .ok()
                .flatten()
                .unwrap_or(true),
            health_path: "/health".to_string(),
            install_timeout: Duration::from_secs(300),
            migrate_timeout: Duration::from_secs(180),
            build_timeout: Duration::from_secs(180),
            test_timeout: Duration::from_secs(180),
            boot_timeout: Duration::from_secs(25),
            allow_failure: Vec::new(),
        }
    }
}

/// Raw result of one subprocess.
#[derive(Debug)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub combined_output: String,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Run a command with a timeout in its own process group.
pub async fn run_command(
    root: &Path,
    program: &str,
    args: &[&str],
    envs: &BTreeMap<String, String>,
    timeout: Duration,
) -> CommandOutcome {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            CommandOutcome {
                exit_code: output.status.code(),
                combined_output: combined,
                timed_out: false,
            }
        }
        Ok(Err(e)) => CommandOutcome {
            exit_code: None,
            combined_output: format!("failed to execute {program}: {e}"),
            timed_out: false,
        },
        Err(_) => CommandOutcome {
            exit_code: None,
            combined_output: format!("{program} timed out after {}s", timeout.as_secs()),
            timed_out: true,
        },
    }
}

/// Parsed package.json scripts.
fn package_scripts(root: &Path) -> BTreeMap<String, String> {
    std::fs::read_to_string(root.join("package.json"))
        .ok()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|v| {
            v.get("scripts").and_then(|s| {
                s.as_object().map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
            })
        })
        .unwrap_or_default()
}

fn first_script<'a>(scripts: &'a BTreeMap<String, String>, names: &[&'a str]) -> Option<&'a str> {
    names
        .iter()
        .find(|name| scripts.contains_key(**name))
        .copied()
}

/// Scope a Postgres URL to a run-unique schema so parallel heavy runs
/// never collide. URLs that already pin a schema, and non-Postgres URLs,
/// pass through unchanged.
pub fn scope_database_url(url: &str, run_id: &str) -> String {
    let is_postgres = url.starts_with("postgres://") || url.starts_with("postgresql://");
    if !is_postgres || url.contains("schema=") {
        return url.to_string();
    }
    let sanitized: String = run_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect::<String>()
        .to_lowercase();
    let suffix = &sha256_hex(run_id.as_bytes())[..8];
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}schema=deeprun_hv_{sanitized}_{suffix}")
}

/// Find a free localhost port by binding an ephemeral socket and releasing
/// it before the service starts.
fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Run the heavy pipeline. Light validation and worktree isolation are the
/// caller's responsibility; this function assumes `root` is the worktree.
pub async fn run_heavy_validation(root: &Path, options: &HeavyOptions) -> ValidationReport {
    let mut report = ValidationReport::new();
    report.worktree_path = Some(root.display().to_string());

    // Production-config invariants.
    let mut files = BTreeMap::new();
    for path in ["src/config/env.ts", "src/errors/errorHandler.ts"] {
        if let Ok(content) = std::fs::read_to_string(root.join(path)) {
            files.insert(path.to_string(), content);
        }
    }
    let prod_violations = checks::production_config_violations(&files);
    if prod_violations.is_empty() {
        report.add_check(CheckResult::pass("production_config", "production config valid"));
    } else {
        report.add_check(CheckResult::fail(
            "production_config",
            format!("{} production-config finding(s)", prod_violations.len()),
        ));
        report.add_violations(prod_violations);
    }

    let has_package = root.join("package.json").exists();
    if !has_package {
        report.add_check(CheckResult::skip("install", "no package.json"));
        report.finalize();
        return report;
    }
    let scripts = package_scripts(root);

    // Install.
    if options.install_deps {
        let outcome = run_command(
            root,
            "npm",
            &["ci", "--include=dev"],
            &BTreeMap::new(),
            options.install_timeout,
        )
        .await;
        if !record_command(&mut report, options, "install", &outcome) {
            report.finalize();
            return report;
        }
    } else {
        report.add_check(CheckResult::skip("install", "dependency install disabled"));
    }

    // Migration + seed, with a run-scoped database schema.
    let needs_prisma = root.join("prisma").join("schema.prisma").exists()
        || first_script(&scripts, &["prisma:migrate", "db:migrate"]).is_some();
    if needs_prisma {
        let migrate = first_script(&scripts, &["prisma:migrate", "db:migrate", "migrate"]);
        let seed = first_script(&scripts, &["prisma:seed", "db:seed", "seed"]);
        match (migrate, seed) {
            (Some(migrate), Some(seed)) => {
                let mut envs = BTreeMap::new();
                if let Ok(Some(url)) = bas::read_non_empty("DATABASE_URL") {
                    let run_scope = root
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "run".to_string());
                    envs.insert("DATABASE_URL".to_string(), scope_database_url(&url, &run_scope));
                }

                let outcome =
                    run_command(root, "npm", &["run", migrate], &envs, options.migrate_timeout)
                        .await;
                if record_command(&mut report, options, "migration", &outcome) {
                    let outcome =
                        run_command(root, "npm", &["run", seed], &envs, options.migrate_timeout)
                            .await;
                    record_command(&mut report, options, "seed", &outcome);
                }
            }
            _ => {
                report.add_check(CheckResult::fail(
                    "migration",
                    "prisma schema present but migrate/seed scripts are missing",
                ));
            }
        }
    } else {
        report.add_check(CheckResult::skip("migration", "no prisma schema"));
    }

    // Typecheck / build / tests.
    for (check_id, script_names, timeout) in [
        ("typecheck", &["check", "typecheck"][..], options.build_timeout),
        ("build", &["build"][..], options.build_timeout),
        ("tests", &["test"][..], options.test_timeout),
    ] {
        match first_script(&scripts, script_names) {
            Some(script) => {
                let outcome =
                    run_command(root, "npm", &["run", script], &BTreeMap::new(), timeout).await;
                record_command(&mut report, options, check_id, &outcome);
            }
            None => report.add_check(CheckResult::skip(check_id, "script not defined")),
        }
    }

    // Boot + health.
    if scripts.contains_key("start") {
        let boot = run_boot_check(root, options).await;
        report.add_check(boot.check);
        if let Some(failures) = boot.failures {
            report.add_failures(failures);
        }
    } else {
        report.add_check(CheckResult::skip("boot", "no start script"));
    }

    report.finalize();
    report
}

/// Record one command outcome. Returns true when downstream checks should
/// keep running.
fn record_command(
    report: &mut ValidationReport,
    options: &HeavyOptions,
    check_id: &str,
    outcome: &CommandOutcome,
) -> bool {
    if outcome.success() {
        report.add_check(CheckResult::pass(check_id, "command succeeded"));
        return true;
    }

    let allowed = options.allow_failure.iter().any(|id| id == check_id);
    let message = if outcome.timed_out {
        format!("command timed out (exit={:?})", outcome.exit_code)
    } else {
        format!("command failed (exit={:?})", outcome.exit_code)
    };
    let check = if allowed {
        CheckResult::skip(check_id, format!("{message}; failure allowed"))
    } else {
        CheckResult::fail(check_id, message)
    }
    .with_details(json!({ "timedOut": outcome.timed_out }));
    report.add_check(check);

    if !allowed {
        report.add_failures(parse_check_output(check_id, &outcome.combined_output));
    }
    allowed
}

struct BootOutcome {
    check: CheckResult,
    failures: Option<Vec<crate::failures::ValidationFailure>>,
}

/// Spawn `npm run start` in its own process group, poll the health
/// endpoint every 250 ms, then terminate the whole group (SIGTERM, then
/// SIGKILL after one second).
async fn run_boot_check(root: &Path, options: &HeavyOptions) -> BootOutcome {
    let port = match free_port() {
        Ok(port) => port,
        Err(e) => {
            return BootOutcome {
                check: CheckResult::fail("boot", format!("no free port: {e}")),
                failures: None,
            }
        }
    };

    let mut cmd = tokio::process::Command::new("npm");
    cmd.args(["run", "start"])
        .current_dir(root)
        .env("PORT", port.to_string())
        .env("NODE_ENV", "production")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return BootOutcome {
                check: CheckResult::fail("boot", format!("failed to spawn start: {e}")),
                failures: None,
            }
        }
    };

    let url = format!("http://127.0.0.1:{port}{}", options.health_path);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()
        .expect("reqwest client");

    let deadline = tokio::time::Instant::now() + options.boot_timeout;
    let mut healthy = false;
    let mut exited_early = false;

    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            exited_early = true;
            break;
        }
        if let Ok(response) = client.get(&url).send().await {
            if response.status().as_u16() == 200 {
                healthy = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    terminate_group(&mut child).await;
    let output = child
        .wait_with_output()
        .await
        .map(|o| {
            let mut combined = String::from_utf8_lossy(&o.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&o.stderr));
            combined
        })
        .unwrap_or_default();

    if healthy {
        BootOutcome {
            check: CheckResult::pass("boot", format!("healthy on port {port}"))
                .with_details(json!({ "port": port })),
            failures: None,
        }
    } else {
        let reason = if exited_early {
            "process exited before becoming healthy"
        } else {
            "health endpoint never returned 200"
        };
        BootOutcome {
            check: CheckResult::fail("boot", reason).with_details(json!({
                "port": port,
                "healthPath": options.health_path,
            })),
            failures: Some(parse_check_output("boot", &output)),
        }
    }
}

/// SIGTERM the child's process group, give it one second, then SIGKILL.
async fn terminate_group(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = tokio::process::Command::new("kill")
            .args(["-s", "TERM", &format!("-{pid}")])
            .output()
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_database_url_postgres() {
        let scoped = scope_database_url("postgresql://u:p@localhost:5432/app", "Run-ABC-123");
        assert!(scoped.starts_with("postgresql://u:p@localhost:5432/app?schema=deeprun_hv_"));
        assert!(scoped.contains("runabc123"));

        // Deterministic for the same run id
        assert_eq!(
            scoped,
            scope_database_url("postgresql://u:p@localhost:5432/app", "Run-ABC-123")
        );
        // Distinct across runs
        assert_ne!(
            scoped,
            scope_database_url("postgresql://u:p@localhost:5432/app", "other-run")
        );
    }

    #[test]
    fn test_scope_database_url_passthrough() {
        assert_eq!(
            scope_database_url("postgresql://u@h/db?schema=custom", "r"),
            "postgresql://u@h/db?schema=custom"
        );
        assert_eq!(scope_database_url("mysql://u@h/db", "r"), "mysql://u@h/db");
        let with_params = scope_database_url("postgres://u@h/db?sslmode=require", "r");
        assert!(with_params.contains("?sslmode=require&schema=deeprun_hv_"));
    }

    #[test]
    fn test_free_port_is_bindable() {
        let port = free_port().unwrap();
        assert!(port > 0);
        // Released: binding again succeeds.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[tokio::test]
    async fn test_run_command_captures_output_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_command(
            dir.path(),
            "sh",
            &["-c", "echo out; echo err 1>&2; exit 3"],
            &BTreeMap::new(),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.combined_output.contains("out"));
        assert!(outcome.combined_output.contains("err"));
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_command(
            dir.path(),
            "sh",
            &["-c", "sleep 30"],
            &BTreeMap::new(),
            Duration::from_millis(200),
        )
        .await;
        assert!(outcome.timed_out);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_heavy_without_package_json_skips() {
        let dir = tempfile::tempdir().unwrap();
        let options = HeavyOptions {
            install_deps: false,
            ..Default::default()
        };
        let report = run_heavy_validation(dir.path(), &options).await;
        // production_config fails (missing files), install is skipped.
        assert!(report
            .checks
            .iter()
            .any(|c| c.id == "install" && c.status == crate::validation::CheckStatus::Skip));
        assert!(report.failed_check_ids().contains(&"production_config".to_string()));
    }

    #[test]
    fn test_package_scripts_parsing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"build": "tsc", "test": "vitest run"}}"#,
        )
        .unwrap();
        let scripts = package_scripts(dir.path());
        assert_eq!(scripts.get("build").map(String::as_str), Some("tsc"));
        assert_eq!(first_script(&scripts, &["check", "typecheck"]), None);
        assert_eq!(first_script(&scripts, &["build"]), Some("build"));
    }
}
