//! Classification of transient provider-infrastructure failures.
//!
//! A bead whose recent errors are provider errors is left alone: the
//! infrastructure recovers on its own, so the dispatcher neither counts a
//! workflow attempt nor synthesizes remediation for it.

use loom_core::context;
use loom_core::context::ContextMap;

/// Substrings that mark an error as transient infrastructure, checked
/// case-insensitively.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "connection refused",
    "context canceled",
    "context deadline exceeded",
    "dial tcp",
    "no such host",
    "i/o timeout",
    "connection reset",
    "broken pipe",
    "all providers failed",
    "no eligible models",
    "model not found",
    "rate limit",
    "quota exceeded",
    "overloaded",
    "service unavailable",
    "request timed out",
];

/// How many trailing error-history entries are consulted.
const ERROR_HISTORY_TAIL: usize = 3;

/// Whether an error message describes a transient provider failure.
pub fn is_provider_error(message: &str) -> bool {
    if message.is_empty() {
        return false;
    }
    let lower = message.to_lowercase();

    if TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        return true;
    }

    // Stream-end errors surface as a bare "EOF" token.
    if message.contains("EOF") {
        return true;
    }

    // HTTP statuses: auth, rate, and server-side failures are transient
    // from the dispatcher's point of view.
    if let Some(code) = extract_status_code(&lower) {
        return matches!(code, 401 | 403 | 429 | 500..=599);
    }

    false
}

/// Pull the numeric code out of a "status code NNN" fragment.
fn extract_status_code(lower: &str) -> Option<u16> {
    let idx = lower.find("status code ")?;
    let rest = &lower[idx + "status code ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Whether a bead's recent error trail points at provider infrastructure:
/// `last_run_error`, the last three `error_history` entries, or the stored
/// loop-detection reason.
pub fn bead_has_provider_errors(ctx: &ContextMap) -> bool {
    if let Some(last) = ctx.get(context::LAST_RUN_ERROR) {
        if is_provider_error(last) {
            return true;
        }
    }

    let history = context::get_string_list(ctx, context::ERROR_HISTORY);
    let tail_start = history.len().saturating_sub(ERROR_HISTORY_TAIL);
    if history[tail_start..].iter().any(|e| is_provider_error(e)) {
        return true;
    }

    if let Some(reason) = ctx.get(context::LOOP_DETECTION_REASON) {
        if is_provider_error(reason) {
            return true;
        }
    }

    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_signatures_classify() {
        for msg in [
            "dial tcp 10.0.0.1:443: connection refused",
            "context deadline exceeded",
            "LLM call failed: i/o timeout",
            "all providers failed",
            "rate limit exceeded for model",
            "upstream overloaded, try again",
            "503 service unavailable",
            "unexpected EOF",
            "no eligible models",
        ] {
            assert!(is_provider_error(msg), "expected provider error: {msg}");
        }
    }

    #[test]
    fn status_codes_classify() {
        assert!(is_provider_error("LLM call failed: status code 503"));
        assert!(is_provider_error("status code 429"));
        assert!(is_provider_error("status code 401"));
        assert!(is_provider_error("status code 403"));
        assert!(is_provider_error("status code 500"));
    }

    #[test]
    fn non_provider_errors_do_not_classify() {
        for msg in [
            "",
            "assertion failed in tests",
            "status code 404",
            "status code 400",
            "merge conflict in src/lib.rs",
            "agent declined the task",
        ] {
            assert!(!is_provider_error(msg), "unexpected provider error: {msg}");
        }
    }

    #[test]
    fn last_run_error_drives_bead_classification() {
        let mut ctx = ContextMap::new();
        assert!(!bead_has_provider_errors(&ctx));

        ctx.insert(context::LAST_RUN_ERROR.into(), "connection reset by peer".into());
        assert!(bead_has_provider_errors(&ctx));
    }

    #[test]
    fn only_history_tail_is_consulted() {
        let mut ctx = ContextMap::new();
        // A provider error followed by three domain errors: outside the tail.
        context::push_string_list(&mut ctx, context::ERROR_HISTORY, "status code 503".into(), 10);
        for _ in 0..3 {
            context::push_string_list(&mut ctx, context::ERROR_HISTORY, "test failed".into(), 10);
        }
        assert!(!bead_has_provider_errors(&ctx));

        // A provider error inside the tail flips the answer.
        context::push_string_list(&mut ctx, context::ERROR_HISTORY, "broken pipe".into(), 10);
        assert!(bead_has_provider_errors(&ctx));
    }

    #[test]
    fn loop_detection_reason_is_consulted() {
        let mut ctx = ContextMap::new();
        ctx.insert(
            context::LOOP_DETECTION_REASON.into(),
            "repeated failures: quota exceeded".into(),
        );
        assert!(bead_has_provider_errors(&ctx));
    }
}
