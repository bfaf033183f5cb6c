use chrono::Utc;
use serde_json::{json, Value};

use nexus_actions::{ActionResult, ActionStatus};

/// Safety view over recent actions: execution mode, recent policy blocks,
/// and a compact action listing.
#[must_use]
pub fn safety_snapshot(execution_mode: &str, recent: &[ActionResult]) -> Value {
    let policy_blocked_recent = recent.iter().filter(|r| r.policy_blocked).count();
    let recent_actions: Vec<Value> = recent
        .iter()
        .rev()
        .take(20)
        .map(|r| {
            json!({
                "id": r.id,
                "action_type": r.action_type,
                "status": r.status,
                "policy_blocked": r.policy_blocked,
                "objective_success": r.objective_success,
            })
        })
        .collect();
    json!({
        "execution_mode": execution_mode,
        "policy_blocked_recent": policy_blocked_recent,
        "recent_actions": recent_actions,
    })
}

/// Trust metrics over recent actions: objective success, policy block, and
/// failure rates.
#[must_use]
pub fn trust_metrics(recent: &[ActionResult]) -> Value {
    let sample_size = recent.len();
    let denom = sample_size.max(1) as f64;
    let objective_success = recent
        .iter()
        .filter(|r| r.objective_success == Some(true))
        .count();
    let policy_blocked = recent.iter().filter(|r| r.policy_blocked).count();
    let failed = recent
        .iter()
        .filter(|r| matches!(r.status, ActionStatus::Failed | ActionStatus::Timeout))
        .count();
    json!({
        "sample_size": sample_size,
        "objective_success_rate": objective_success as f64 / denom,
        "policy_block_rate": policy_blocked as f64 / denom,
        "failure_rate": failed as f64 / denom,
        "generated_at": Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: ActionStatus, policy_blocked: bool, objective: Option<bool>) -> ActionResult {
        ActionResult {
            id: "action_test".into(),
            action_type: "write_file".into(),
            status,
            output: String::new(),
            error: None,
            data: Value::Null,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            duration_ms: 5,
            policy_blocked,
            objective_success: objective,
        }
    }

    #[test]
    fn snapshot_counts_policy_blocks() {
        let history = vec![
            result(ActionStatus::Success, false, Some(true)),
            result(ActionStatus::Failed, true, None),
        ];
        let snapshot = safety_snapshot("FULL_AUTO", &history);
        assert_eq!(snapshot["execution_mode"], "FULL_AUTO");
        assert_eq!(snapshot["policy_blocked_recent"], 1);
        assert_eq!(snapshot["recent_actions"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn trust_rates_are_fractions_of_the_sample() {
        let history = vec![
            result(ActionStatus::Success, false, Some(true)),
            result(ActionStatus::Failed, true, None),
            result(ActionStatus::Timeout, false, None),
            result(ActionStatus::Success, false, Some(true)),
        ];
        let metrics = trust_metrics(&history);
        assert_eq!(metrics["sample_size"], 4);
        assert_eq!(metrics["objective_success_rate"], 0.5);
        assert_eq!(metrics["policy_block_rate"], 0.25);
        assert_eq!(metrics["failure_rate"], 0.5);
    }

    #[test]
    fn empty_history_yields_zero_rates() {
        let metrics = trust_metrics(&[]);
        assert_eq!(metrics["sample_size"], 0);
        assert_eq!(metrics["objective_success_rate"], 0.0);
    }
}
