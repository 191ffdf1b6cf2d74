//! Decision policy applied after validation.

use serde_json::Value;

use crate::core::types::Decision;

/// Read the validator's verdict from `data.valid`.
///
/// Anything other than a literal `true` counts as invalid, including a missing
/// `data` object or a validator that failed at the transport level.
pub fn is_valid(validation: &Value) -> bool {
    validation
        .get("data")
        .and_then(|data| data.get("valid"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Decide what happens after attempt `attempt` of `max_attempts`.
///
/// - valid → `Success`
/// - invalid and `attempt >= max_attempts` → `Escalate`
/// - otherwise → `Retry`
pub fn decide(valid: bool, attempt: u32, max_attempts: u32) -> Decision {
    if valid {
        Decision::Success
    } else if attempt >= max_attempts {
        Decision::Escalate
    } else {
        Decision::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_true_is_success_even_on_last_attempt() {
        assert_eq!(decide(true, 3, 3), Decision::Success);
        assert_eq!(decide(true, 1, 3), Decision::Success);
    }

    #[test]
    fn invalid_with_attempts_left_retries() {
        assert_eq!(decide(false, 1, 3), Decision::Retry);
        assert_eq!(decide(false, 2, 3), Decision::Retry);
    }

    #[test]
    fn invalid_on_last_attempt_escalates() {
        assert_eq!(decide(false, 3, 3), Decision::Escalate);
        assert_eq!(decide(false, 1, 1), Decision::Escalate);
    }

    #[test]
    fn missing_valid_flag_is_fail_closed() {
        assert!(!is_valid(&json!({})));
        assert!(!is_valid(&json!({"data": {}})));
        assert!(!is_valid(&json!({"data": {"valid": "true"}})));
        assert!(!is_valid(&json!({"success": false, "error": "timeout"})));
        assert!(!is_valid(&json!({"valid": true})));
        assert!(is_valid(&json!({"data": {"valid": true}})));
    }
}
