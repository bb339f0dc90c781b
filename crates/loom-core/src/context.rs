//! Well-known bead context keys and typed accessors.
//!
//! Bead context is deliberately a flat string-to-string map: the loop
//! detector, the workflow engine, the escalator, and the dispatcher all write
//! disjoint keys, and the map survives schema evolution. Structured values
//! are JSON-encoded strings under a single key.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

// ---------------------------------------------------------------------------
// Key constants
// ---------------------------------------------------------------------------

/// Lifetime dispatch counter; monotonically non-decreasing.
pub const DISPATCH_COUNT: &str = "dispatch_count";

/// Workflow pointers written by the engine when a workflow is attached.
pub const WORKFLOW_ID: &str = "workflow_id";
pub const WORKFLOW_EXEC_ID: &str = "workflow_exec_id";
pub const WORKFLOW_NODE: &str = "workflow_node";
pub const REQUIRED_ROLE: &str = "required_role";

/// Loop detector state: JSON array of action records, JSON metrics object,
/// and the most recent stuck reason.
pub const ACTION_HISTORY: &str = "action_history";
pub const PROGRESS_METRICS: &str = "progress_metrics";
pub const LOOP_DETECTION_REASON: &str = "loop_detection_reason";

/// Error trail written by the dispatcher on agent results.
pub const LAST_RUN_ERROR: &str = "last_run_error";
pub const ERROR_HISTORY: &str = "error_history";

/// Escalation markers. Once `escalated_to_ceo_decision_id` is set the bead
/// is parked until that decision bead resolves.
pub const ESCALATION_BEAD_CREATED: &str = "escalation_bead_created";
pub const ESCALATED_TO_CEO_DECISION_ID: &str = "escalated_to_ceo_decision_id";
pub const DISPATCH_ESCALATED_AT: &str = "dispatch_escalated_at";
pub const DISPATCH_ESCALATION_REASON: &str = "dispatch_escalation_reason";

/// Replay suppression: the correlation id of the last processed result.
pub const LAST_RESULT_CORRELATION_ID: &str = "last_result_correlation_id";

/// Id of the remediation bead synthesized for a stuck bead.
pub const REMEDIATION_BEAD_ID: &str = "remediation_bead_id";

/// Cap on the JSON error-history list.
pub const ERROR_HISTORY_CAP: usize = 10;

// ---------------------------------------------------------------------------
// Typed accessors
// ---------------------------------------------------------------------------

pub type ContextMap = BTreeMap<String, String>;

/// Read an unsigned counter, defaulting to 0 on absence or parse failure.
pub fn get_counter(ctx: &ContextMap, key: &str) -> u64 {
    ctx.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// Increment a counter key and return the new value.
pub fn increment_counter(ctx: &mut ContextMap, key: &str) -> u64 {
    let next = get_counter(ctx, key) + 1;
    ctx.insert(key.to_string(), next.to_string());
    next
}

/// Read a boolean flag ("true"/"false"), defaulting to false.
pub fn get_flag(ctx: &ContextMap, key: &str) -> bool {
    ctx.get(key).map(|v| v == "true").unwrap_or(false)
}

pub fn set_flag(ctx: &mut ContextMap, key: &str) {
    ctx.insert(key.to_string(), "true".to_string());
}

/// Read an RFC 3339 timestamp value.
pub fn get_timestamp(ctx: &ContextMap, key: &str) -> Option<DateTime<Utc>> {
    ctx.get(key)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|d| d.with_timezone(&Utc))
}

pub fn set_timestamp(ctx: &mut ContextMap, key: &str, when: DateTime<Utc>) {
    ctx.insert(key.to_string(), when.to_rfc3339());
}

/// Read a JSON string-list value. Absent or malformed values yield an empty
/// list; the caller treats loss of history as recoverable.
pub fn get_string_list(ctx: &ContextMap, key: &str) -> Vec<String> {
    ctx.get(key)
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default()
}

/// Append to a JSON string-list value, truncating the oldest entries so at
/// most `cap` remain.
pub fn push_string_list(ctx: &mut ContextMap, key: &str, entry: String, cap: usize) {
    let mut list = get_string_list(ctx, key);
    list.push(entry);
    if list.len() > cap {
        let excess = list.len() - cap;
        list.drain(..excess);
    }
    // A Vec<String> always serializes.
    if let Ok(json) = serde_json::to_string(&list) {
        ctx.insert(key.to_string(), json);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_defaults_and_increments() {
        let mut ctx = ContextMap::new();
        assert_eq!(get_counter(&ctx, DISPATCH_COUNT), 0);
        assert_eq!(increment_counter(&mut ctx, DISPATCH_COUNT), 1);
        assert_eq!(increment_counter(&mut ctx, DISPATCH_COUNT), 2);
        assert_eq!(get_counter(&ctx, DISPATCH_COUNT), 2);
    }

    #[test]
    fn counter_ignores_garbage() {
        let mut ctx = ContextMap::new();
        ctx.insert(DISPATCH_COUNT.into(), "not-a-number".into());
        assert_eq!(get_counter(&ctx, DISPATCH_COUNT), 0);
    }

    #[test]
    fn flags() {
        let mut ctx = ContextMap::new();
        assert!(!get_flag(&ctx, ESCALATION_BEAD_CREATED));
        set_flag(&mut ctx, ESCALATION_BEAD_CREATED);
        assert!(get_flag(&ctx, ESCALATION_BEAD_CREATED));
    }

    #[test]
    fn timestamps_round_trip() {
        let mut ctx = ContextMap::new();
        let now = Utc::now();
        set_timestamp(&mut ctx, DISPATCH_ESCALATED_AT, now);
        let back = get_timestamp(&ctx, DISPATCH_ESCALATED_AT).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn string_list_caps_at_limit() {
        let mut ctx = ContextMap::new();
        for i in 0..15 {
            push_string_list(&mut ctx, ERROR_HISTORY, format!("err-{i}"), ERROR_HISTORY_CAP);
        }
        let list = get_string_list(&ctx, ERROR_HISTORY);
        assert_eq!(list.len(), ERROR_HISTORY_CAP);
        assert_eq!(list.first().unwrap(), "err-5");
        assert_eq!(list.last().unwrap(), "err-14");
    }

    #[test]
    fn string_list_tolerates_malformed_value() {
        let mut ctx = ContextMap::new();
        ctx.insert(ERROR_HISTORY.into(), "{broken".into());
        assert!(get_string_list(&ctx, ERROR_HISTORY).is_empty());
        push_string_list(&mut ctx, ERROR_HISTORY, "fresh".into(), ERROR_HISTORY_CAP);
        assert_eq!(get_string_list(&ctx, ERROR_HISTORY), vec!["fresh"]);
    }
}
