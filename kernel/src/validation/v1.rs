//! V1 readiness: heavy validation plus docker build and in-container boot
//!
//! Verdict is `YES` iff every check passes. The image and container are
//! torn down unless `V1_DOCKER_KEEP_IMAGE=true`.

use crate::bas;
use crate::canon::sha256_hex;
use crate::validation::heavy::{self, run_command, HeavyOptions};
use crate::validation::{CheckResult, ValidationReport};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// The binary readiness verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum V1Verdict {
    #[serde(rename = "YES")]
    Yes,
    #[serde(rename = "NO")]
    No,
}

impl std::fmt::Display for V1Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yes => write!(f, "YES"),
            Self::No => write!(f, "NO"),
        }
    }
}

/// Docker-stage knobs, read from the declared BAS surface.
#[derive(Debug, Clone)]
pub struct V1Options {
    pub docker_bin: String,
    pub health_path: String,
    pub keep_image: bool,
    pub build_timeout: Duration,
    pub boot_timeout: Duration,
    /// Port the service listens on inside the container.
    pub container_port: u16,
}

impl Default for V1Options {
    fn default() -> Self {
        Self {
            docker_bin: bas::read_non_empty("V1_DOCKER_BIN")
                .ok()
                .flatten()
                .unwrap_or_else(|| "docker".to_string()),
            health_path: bas::read_non_empty("V1_DOCKER_HEALTH_PATH")
                .ok()
                .flatten()
                .unwrap_or_else(|| "/health".to_string()),
            keep_image: bas::read_bool("V1_DOCKER_KEEP_IMAGE").ok().flatten().unwrap_or(false),
            build_timeout: Duration::from_secs(600),
            boot_timeout: Duration::from_secs(60),
            container_port: 3000,
        }
    }
}

/// Combined readiness result.
#[derive(Debug)]
pub struct V1Report {
    pub verdict: V1Verdict,
    pub report: ValidationReport,
}

/// Image/container tag unique per run, with no randomness: run id plus a
/// content hash of the id.
fn image_tag(run_id: &str) -> String {
    let sanitized: String = run_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_lowercase();
    let suffix = &sha256_hex(run_id.as_bytes())[..8];
    format!("deeprun-v1-{sanitized}-{suffix}")
}

/// Run heavy validation plus the docker stages in a worktree.
pub async fn run_v1_readiness(
    worktree_root: &Path,
    run_id: &str,
    heavy_options: &HeavyOptions,
    options: &V1Options,
) -> V1Report {
    let mut report = heavy::run_heavy_validation(worktree_root, heavy_options).await;
    report.worktree_path = Some(worktree_root.display().to_string());

    run_docker_stages(worktree_root, run_id, options, &mut report).await;

    report.finalize();
    let verdict = if report.ok() { V1Verdict::Yes } else { V1Verdict::No };
    V1Report { verdict, report }
}

async fn run_docker_stages(
    root: &Path,
    run_id: &str,
    options: &V1Options,
    report: &mut ValidationReport,
) {
    let no_env = BTreeMap::new();

    // Docker CLI must exist.
    let version = run_command(
        root,
        &options.docker_bin,
        &["version", "--format", "{{.Server.Version}}"],
        &no_env,
        Duration::from_secs(20),
    )
    .await;
    if !version.success() {
        report.add_check(CheckResult::fail(
            "docker_available",
            format!("{} is not available", options.docker_bin),
        ));
        report.add_check(CheckResult::skip("docker_build", "docker unavailable"));
        report.add_check(CheckResult::skip("docker_boot", "docker unavailable"));
        return;
    }
    report.add_check(CheckResult::pass(
        "docker_available",
        format!("docker {}", version.combined_output.trim()),
    ));

    if !root.join("Dockerfile").exists() {
        report.add_check(CheckResult::fail("docker_build", "Dockerfile is missing"));
        report.add_check(CheckResult::skip("docker_boot", "no image to run"));
        return;
    }

    let tag = image_tag(run_id);
    let build = run_command(
        root,
        &options.docker_bin,
        &["build", "-t", &tag, "."],
        &no_env,
        options.build_timeout,
    )
    .await;
    if !build.success() {
        report.add_check(
            CheckResult::fail("docker_build", "docker build failed")
                .with_details(json!({ "tag": tag, "timedOut": build.timed_out })),
        );
        report.add_failures(crate::failures::parse_check_output(
            "build",
            &build.combined_output,
        ));
        report.add_check(CheckResult::skip("docker_boot", "image build failed"));
        return;
    }
    report.add_check(CheckResult::pass("docker_build", format!("built {tag}")));

    // Run the container bound to localhost only.
    let host_port = match std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
    {
        Ok(port) => port,
        Err(e) => {
            report.add_check(CheckResult::fail("docker_boot", format!("no free port: {e}")));
            teardown(root, options, &tag).await;
            return;
        }
    };
    let publish = format!("127.0.0.1:{host_port}:{}", options.container_port);
    let run = run_command(
        root,
        &options.docker_bin,
        &[
            "run", "-d", "--name", &tag, "-p", &publish, "-e", "NODE_ENV=production", &tag,
        ],
        &no_env,
        Duration::from_secs(30),
    )
    .await;
    if !run.success() {
        report.add_check(
            CheckResult::fail("docker_boot", "container failed to start")
                .with_details(json!({ "output": run.combined_output.trim() })),
        );
        teardown(root, options, &tag).await;
        return;
    }

    // Poll /health inside the container.
    let url = format!("http://127.0.0.1:{host_port}{}", options.health_path);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()
        .expect("reqwest client");
    let deadline = tokio::time::Instant::now() + options.boot_timeout;
    let mut healthy = false;
    while tokio::time::Instant::now() < deadline {
        let exited = run_command(
            root,
            &options.docker_bin,
            &["inspect", "--format", "{{.State.Running}}", &tag],
            &no_env,
            Duration::from_secs(10),
        )
        .await;
        if exited.success() && exited.combined_output.trim() == "false" {
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

    if healthy {
        report.add_check(
            CheckResult::pass("docker_boot", "container healthy")
                .with_details(json!({ "port": host_port })),
        );
    } else {
        let logs = run_command(
            root,
            &options.docker_bin,
            &["logs", &tag],
            &no_env,
            Duration::from_secs(20),
        )
        .await;
        report.add_check(
            CheckResult::fail("docker_boot", "container never became healthy")
                .with_details(json!({ "logs": tail(&logs.combined_output, 4_000) })),
        );
        report.add_failures(crate::failures::parse_check_output(
            "boot",
            &logs.combined_output,
        ));
    }

    teardown(root, options, &tag).await;
}

async fn teardown(root: &Path, options: &V1Options, tag: &str) {
    let no_env = BTreeMap::new();
    let _ = run_command(
        root,
        &options.docker_bin,
        &["rm", "-f", tag],
        &no_env,
        Duration::from_secs(30),
    )
    .await;
    if !options.keep_image {
        let _ = run_command(
            root,
            &options.docker_bin,
            &["rmi", "-f", tag],
            &no_env,
            Duration::from_secs(30),
        )
        .await;
    }
}

fn tail(text: &str, bytes: usize) -> String {
    if text.len() <= bytes {
        return text.to_string();
    }
    let mut start = text.len() - bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
