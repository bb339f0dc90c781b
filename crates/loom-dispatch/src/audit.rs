//! Periodic repo self-audit.
//!
//! Runs the project's build / test / lint commands, parses their output into
//! findings, and files a bead for each novel finding. Titles are the dedup
//! key: a finding whose title matches an open or in-progress bead is
//! suppressed, while closed duplicates are re-filed because the issue has
//! recurred.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use loom_core::config::AuditConfig;
use loom_core::store::Store;
use loom_core::types::{Bead, BeadType, Priority};

use crate::shutdown::{ShutdownGuard, ShutdownSignal};

/// Finding messages are truncated to this many characters in bead titles.
const TITLE_MESSAGE_CAP: usize = 80;

// ---------------------------------------------------------------------------
// Finding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingType {
    BuildError,
    TestFailure,
    LintError,
}

impl FindingType {
    pub fn label(&self) -> &'static str {
        match self {
            FindingType::BuildError => "build-error",
            FindingType::TestFailure => "test-failure",
            FindingType::LintError => "lint-error",
        }
    }

    fn bead_shape(&self) -> (BeadType, Priority) {
        match self {
            FindingType::BuildError | FindingType::TestFailure => (BeadType::Bug, Priority::P1),
            FindingType::LintError => (BeadType::Task, Priority::P2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub finding_type: FindingType,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub message: String,
    pub rule: Option<String>,
}

impl Finding {
    /// The dedup title for this finding.
    pub fn title(&self) -> String {
        let message: String = self.message.chars().take(TITLE_MESSAGE_CAP).collect();
        format!("[auto-audit] {}: {}", self.finding_type.label(), message)
    }
}

// ---------------------------------------------------------------------------
// CommandRunner seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a shell command in a workspace. Mocked in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, workspace: &Path, command: &str) -> Result<CommandOutput, String>;
}

/// Runs commands through `sh -c` with tokio's process support.
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, workspace: &Path, command: &str) -> Result<CommandOutput, String> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workspace)
            .output()
            .await
            .map_err(|e| e.to_string())?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Output parsers — line-oriented and tolerant; unparseable output simply
// yields zero findings.
// ---------------------------------------------------------------------------

/// Parse `cargo build`-style diagnostics: an `error:`/`error[Exxxx]:` line
/// followed by a `  --> file:line:col` location.
pub fn parse_build_output(output: &str) -> Vec<Finding> {
    parse_diagnostics(output, "error", FindingType::BuildError)
}

/// Parse libtest output: `test path::name ... FAILED` lines.
pub fn parse_test_output(output: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("test ") {
            if let Some(name) = rest.strip_suffix("... FAILED") {
                findings.push(Finding {
                    finding_type: FindingType::TestFailure,
                    file: None,
                    line: None,
                    message: format!("test {} failed", name.trim()),
                    rule: None,
                });
            }
        }
    }
    findings
}

/// Parse clippy/rustc lint output: `warning:` diagnostics with locations
/// and an optional `#[warn(...)]` note naming the lint.
pub fn parse_lint_output(output: &str) -> Vec<Finding> {
    parse_diagnostics(output, "warning", FindingType::LintError)
}

fn parse_diagnostics(output: &str, severity: &str, finding_type: FindingType) -> Vec<Finding> {
    let mut findings: Vec<Finding> = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();

        let message = diagnostic_message(trimmed, severity);
        if let Some(message) = message {
            // Summary lines ("error: could not compile ...", "N warnings
            // emitted") are noise, not findings.
            if message.starts_with("could not compile")
                || message.ends_with("emitted")
                || message.contains("generated")
            {
                continue;
            }
            findings.push(Finding {
                finding_type,
                file: None,
                line: None,
                message,
                rule: None,
            });
            continue;
        }

        // Location lines attach to the most recent finding.
        if let Some(rest) = trimmed.strip_prefix("--> ") {
            if let Some(last) = findings.last_mut() {
                if last.file.is_none() {
                    let mut parts = rest.split(':');
                    last.file = parts.next().map(str::to_string);
                    last.line = parts.next().and_then(|p| p.parse().ok());
                }
            }
            continue;
        }

        // Lint-name notes: `= note: \`#[warn(clippy::len_zero)]\` ...`
        if trimmed.starts_with("= note:") && trimmed.contains("#[") {
            if let Some(last) = findings.last_mut() {
                if last.rule.is_none() {
                    last.rule = extract_lint_name(trimmed);
                }
            }
        }
    }
    findings
}

/// `error[E0308]: mismatched types` -> `mismatched types`; plain
/// `error: ...` works too.
fn diagnostic_message(line: &str, severity: &str) -> Option<String> {
    let rest = line.strip_prefix(severity)?;
    let rest = if let Some(bracketed) = rest.strip_prefix('[') {
        bracketed.split_once(']').map(|(_, r)| r)?
    } else {
        rest
    };
    let message = rest.strip_prefix(':')?.trim();
    if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    }
}

fn extract_lint_name(line: &str) -> Option<String> {
    let start = line.find("#[")? + 2;
    let rest = &line[start..];
    let open = rest.find('(')? + 1;
    let close = rest.find(')')?;
    if open >= close {
        return None;
    }
    Some(rest[open..close].to_string())
}

// ---------------------------------------------------------------------------
// AuditReport / AuditRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub findings: usize,
    pub beads_created: usize,
    pub suppressed: usize,
    pub timestamp: DateTime<Utc>,
}

/// Periodically audits the project workspace and synthesizes beads for
/// novel findings.
pub struct AuditRunner {
    /// When absent, findings are logged only.
    store: Option<Arc<Store>>,
    runner: Arc<dyn CommandRunner>,
    config: AuditConfig,
    project_id: String,
}

impl AuditRunner {
    pub fn new(
        store: Option<Arc<Store>>,
        runner: Arc<dyn CommandRunner>,
        config: AuditConfig,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            runner,
            config,
            project_id: project_id.into(),
        }
    }

    /// Run one full audit sweep: build, test, and lint.
    pub async fn run_audit(&self) -> AuditReport {
        let workspace = self
            .config
            .workspace
            .clone()
            .unwrap_or_else(|| ".".to_string());
        let workspace = Path::new(&workspace);

        let checks: [(&str, fn(&str) -> Vec<Finding>); 3] = [
            (self.config.build_command.as_str(), parse_build_output),
            (self.config.test_command.as_str(), parse_test_output),
            (self.config.lint_command.as_str(), parse_lint_output),
        ];

        let mut report = AuditReport {
            findings: 0,
            beads_created: 0,
            suppressed: 0,
            timestamp: Utc::now(),
        };

        for (command, parse) in checks {
            let output = match self.runner.run(workspace, command).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(command, error = %e, "audit command failed to run");
                    continue;
                }
            };
            let combined = format!("{}\n{}", output.stdout, output.stderr);
            for finding in parse(&combined) {
                report.findings += 1;
                match self.file_finding(&finding).await {
                    Ok(true) => report.beads_created += 1,
                    Ok(false) => report.suppressed += 1,
                    Err(e) => warn!(error = %e, "failed to file audit finding"),
                }
            }
        }

        info!(
            project_id = %self.project_id,
            findings = report.findings,
            created = report.beads_created,
            suppressed = report.suppressed,
            "audit sweep complete"
        );
        report
    }

    /// File a bead for a finding unless an active duplicate exists.
    /// Returns true when a bead was created.
    async fn file_finding(&self, finding: &Finding) -> Result<bool, String> {
        let title = finding.title();
        let Some(store) = &self.store else {
            info!(title = %title, "audit finding (no bead creator wired)");
            return Ok(false);
        };

        let duplicate = store
            .find_active_bead_by_title(&title)
            .await
            .map_err(|e| e.to_string())?;
        if duplicate.is_some() {
            debug!(title = %title, "audit finding suppressed (active duplicate)");
            return Ok(false);
        }

        let (bead_type, priority) = finding.finding_type.bead_shape();
        let mut description = finding.message.clone();
        if let Some(file) = &finding.file {
            let line = finding.line.map(|l| format!(":{l}")).unwrap_or_default();
            description.push_str(&format!("\n\nLocation: {file}{line}"));
        }
        if let Some(rule) = &finding.rule {
            description.push_str(&format!("\nRule: {rule}"));
        }

        let mut bead = Bead::new(title, &self.project_id, bead_type, priority)
            .with_description(description);
        if let Some(rule) = &finding.rule {
            bead.context.insert("audit_rule".into(), rule.clone());
        }
        store.create_bead(&bead).await.map_err(|e| e.to_string())?;
        Ok(true)
    }

    /// The audit loop. An interval of zero disables the runner.
    pub async fn run_loop(&self, shutdown: ShutdownSignal) {
        let _drain = ShutdownGuard::new(shutdown.clone());
        if self.config.interval_minutes == 0 {
            info!("audit runner disabled");
            return;
        }

        let mut rx = shutdown.subscribe();
        let period = std::time::Duration::from_secs(self.config.interval_minutes * 60);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval_minutes = self.config.interval_minutes, "audit runner started");
        loop {
            tokio::select! {
                _ = rx.recv() => {
                    info!("audit runner shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.run_audit().await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
