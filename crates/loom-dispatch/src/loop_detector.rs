//! Per-bead behavioral memory.
//!
//! Every agent action on a bead is appended to a bounded ring in the bead's
//! context, keyed by a stable progress hash. A bead whose recent actions
//! keep hashing to the same key, with no mutating action inside the idle
//! window, is stuck; the detector reports why and suggests next steps.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use loom_core::context;
use loom_core::types::Bead;

/// Action history is truncated to this many entries per bead.
pub const MAX_HISTORY: usize = 50;

/// Stuck detection looks at the most recent `min(STUCK_WINDOW, n)` entries.
pub const STUCK_WINDOW: usize = 15;

/// Actions that count as progress: they contribute to last-progress and the
/// mutation counters.
pub const MUTATING_ACTIONS: &[&str] = &[
    "edit_file",
    "write_file",
    "apply_patch",
    "run_tests",
    "bash",
    "git_commit",
    "git_push",
    "close_bead",
];

pub fn is_mutating_action(action_type: &str) -> bool {
    MUTATING_ACTIONS.contains(&action_type)
}

// ---------------------------------------------------------------------------
// ActionRecord / ProgressMetrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub timestamp: DateTime<Utc>,
    pub agent_id: Uuid,
    pub action_type: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Stable 16-hex hash of (action_type, salient arg).
    pub progress_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressMetrics {
    #[serde(default)]
    pub files_read: u64,
    #[serde(default)]
    pub files_modified: u64,
    #[serde(default)]
    pub tests_run: u64,
    #[serde(default)]
    pub commands_executed: u64,
    /// Timestamp of the most recent mutating action.
    #[serde(default)]
    pub last_progress: Option<DateTime<Utc>>,
}

/// Stable progress key for an action: the first 16 hex chars of a SHA-256
/// over `action_type|salient`, where the salient argument is the file path
/// if present, else the command, else empty.
pub fn progress_key(action_type: &str, data: &BTreeMap<String, String>) -> String {
    let salient = data
        .get("file_path")
        .or_else(|| data.get("command"))
        .map(String::as_str)
        .unwrap_or("");
    let digest = Sha256::digest(format!("{action_type}|{salient}").as_bytes());
    let mut key = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        key.push_str(&format!("{byte:02x}"));
    }
    key
}

// ---------------------------------------------------------------------------
// LoopDetector
// ---------------------------------------------------------------------------

struct Tunables {
    repeat_threshold: usize,
    idle_window: Duration,
}

/// Recognizes an agent spinning on a bead without progress.
///
/// All state lives in the bead's context map under `action_history` and
/// `progress_metrics`, so a bead carries its loop-detector memory wherever
/// it goes.
pub struct LoopDetector {
    tunables: RwLock<Tunables>,
}

impl LoopDetector {
    pub fn new(repeat_threshold: usize, idle_window: Duration) -> Self {
        Self {
            tunables: RwLock::new(Tunables {
                repeat_threshold: repeat_threshold.max(2),
                idle_window,
            }),
        }
    }

    /// Set the repeat threshold, clamped to at least 2.
    pub fn set_repeat_threshold(&self, threshold: usize) {
        let mut tunables = self.tunables.write().expect("tunables lock poisoned");
        tunables.repeat_threshold = threshold.max(2);
    }

    pub fn repeat_threshold(&self) -> usize {
        self.tunables.read().expect("tunables lock poisoned").repeat_threshold
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Append an action to the bead's ring and update its progress metrics.
    pub fn record_action(
        &self,
        bead: &mut Bead,
        agent_id: Uuid,
        action_type: &str,
        data: BTreeMap<String, String>,
    ) {
        self.record_action_at(bead, agent_id, action_type, data, Utc::now());
    }

    pub fn record_action_at(
        &self,
        bead: &mut Bead,
        agent_id: Uuid,
        action_type: &str,
        data: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) {
        let record = ActionRecord {
            timestamp: now,
            agent_id,
            action_type: action_type.to_string(),
            progress_key: progress_key(action_type, &data),
            data,
        };

        let mut history = load_history(&bead.context);
        history.push(record);
        if history.len() > MAX_HISTORY {
            let excess = history.len() - MAX_HISTORY;
            history.drain(..excess);
        }
        store_history(&mut bead.context, &history);

        let mut metrics = load_metrics(&bead.context);
        match action_type {
            "read_file" => metrics.files_read += 1,
            "edit_file" | "write_file" | "apply_patch" => metrics.files_modified += 1,
            "run_tests" => metrics.tests_run += 1,
            "bash" => metrics.commands_executed += 1,
            _ => {}
        }
        if is_mutating_action(action_type) {
            metrics.last_progress = Some(now);
        }
        store_metrics(&mut bead.context, &metrics);
    }

    // -----------------------------------------------------------------------
    // Stuck detection
    // -----------------------------------------------------------------------

    /// Whether the bead is stuck, and why.
    pub fn is_stuck(&self, bead: &Bead) -> (bool, String) {
        self.is_stuck_at(bead, Utc::now())
    }

    pub fn is_stuck_at(&self, bead: &Bead, now: DateTime<Utc>) -> (bool, String) {
        let (threshold, idle_window) = {
            let tunables = self.tunables.read().expect("tunables lock poisoned");
            (tunables.repeat_threshold, tunables.idle_window)
        };

        let history = load_history(&bead.context);
        if history.is_empty() {
            return (false, String::new());
        }

        let window_start = history.len().saturating_sub(STUCK_WINDOW);
        let window = &history[window_start..];

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for record in window {
            *counts.entry(record.progress_key.as_str()).or_default() += 1;
        }
        let Some((top_key, top_count)) = counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        else {
            return (false, String::new());
        };

        if top_count < threshold {
            return (false, String::new());
        }

        // Recent progress overrides any amount of repetition. An action
        // exactly the idle window old no longer counts as recent.
        let metrics = load_metrics(&bead.context);
        if let Some(last_progress) = metrics.last_progress {
            if now.signed_duration_since(last_progress) < idle_window {
                return (false, String::new());
            }
        }

        let reason = format!(
            "action repeated {top_count} times without progress (progress key {top_key})"
        );
        debug!(bead_id = %bead.id, reason = %reason, "bead is stuck");
        (true, reason)
    }

    // -----------------------------------------------------------------------
    // Suggestions
    // -----------------------------------------------------------------------

    /// Rule-based next-step hints for a stuck bead.
    pub fn suggest_next_steps(&self, bead: &Bead, _reason: &str) -> Vec<String> {
        let history = load_history(&bead.context);

        if history.is_empty() {
            return vec![
                "Review the bead description for missing requirements".to_string(),
                "Provide more context in the bead before retrying".to_string(),
            ];
        }

        let has_reads = history
            .iter()
            .any(|r| matches!(r.action_type.as_str(), "read_file" | "search_text" | "read_tree"));
        if !has_reads {
            return vec![
                "Explore the codebase before making changes (read_file, search_text)".to_string(),
            ];
        }

        let has_edits = history
            .iter()
            .any(|r| matches!(r.action_type.as_str(), "edit_file" | "write_file" | "apply_patch"));
        let has_tests = history.iter().any(|r| r.action_type == "run_tests");
        if has_edits && !has_tests {
            return vec!["Run the tests to verify the edits made so far".to_string()];
        }

        vec![
            "Break the bead down into smaller, independently verifiable beads".to_string(),
            "Cite concrete examples from the codebase in the next attempt".to_string(),
        ]
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Clear the bead's loop-detector memory.
    pub fn reset_progress(&self, bead: &mut Bead) {
        bead.context.remove(context::ACTION_HISTORY);
        bead.context.remove(context::PROGRESS_METRICS);
    }

    /// The bead's raw action history as a JSON array string.
    pub fn get_action_history_json(&self, bead: &Bead) -> String {
        bead.context
            .get(context::ACTION_HISTORY)
            .cloned()
            .unwrap_or_else(|| "[]".to_string())
    }
}

// ---------------------------------------------------------------------------
// Context (de)serialization
// ---------------------------------------------------------------------------

fn load_history(ctx: &context::ContextMap) -> Vec<ActionRecord> {
    ctx.get(context::ACTION_HISTORY)
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default()
}

fn store_history(ctx: &mut context::ContextMap, history: &[ActionRecord]) {
    if let Ok(json) = serde_json::to_string(history) {
        ctx.insert(context::ACTION_HISTORY.into(), json);
    }
}

fn load_metrics(ctx: &context::ContextMap) -> ProgressMetrics {
    ctx.get(context::PROGRESS_METRICS)
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default()
}

fn store_metrics(ctx: &mut context::ContextMap, metrics: &ProgressMetrics) {
    if let Ok(json) = serde_json::to_string(metrics) {
        ctx.insert(context::PROGRESS_METRICS.into(), json);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
