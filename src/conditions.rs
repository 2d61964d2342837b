//! Kubernetes-standard status condition helpers
//!
//! The manager reports a single `ClusterSynchro` condition per registration; the
//! reason carries which lifecycle state the synchro is in.

use crate::crd::ClusterCondition;
use chrono::Utc;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

// Condition types
pub const CLUSTER_SYNCHRO_CONDITION: &str = "ClusterSynchro";

// ClusterSynchro reasons
pub const REASON_RUNNING: &str = "Running";
pub const REASON_INVALID_CONFIG: &str = "InvalidConfig";
pub const REASON_INVALID_SYNC_RESOURCE: &str = "InvalidSyncResource";
pub const REASON_INITIAL_FAILED: &str = "InitialFailed";

// Finalizer names
pub const CLUSTER_SYNCHRO_FINALIZER: &str = "synchro.io/cluster-synchro-controller";

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> ClusterCondition {
    ClusterCondition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Build the `ClusterSynchro` condition for the given reason.
pub fn synchro_condition(status: &str, reason: &str, message: &str) -> ClusterCondition {
    build_condition(CLUSTER_SYNCHRO_CONDITION, status, reason, message)
}

/// Set or update a condition in a list.
///
/// A condition of the same type is replaced, with a fresh `lastTransitionTime`, only when
/// its status or reason differs. Otherwise only the message is refreshed.
pub fn set_condition(conditions: &mut Vec<ClusterCondition>, new: ClusterCondition) {
    let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) else {
        let mut new = new;
        if new.last_transition_time.is_none() {
            new.last_transition_time = Some(Utc::now().to_rfc3339());
        }
        conditions.push(new);
        return;
    };

    if existing.status != new.status || existing.reason != new.reason {
        let mut new = new;
        new.last_transition_time = Some(Utc::now().to_rfc3339());
        *existing = new;
    } else {
        existing.message = new.message;
    }
}

/// Find a condition by type.
pub fn find_condition<'a>(
    conditions: &'a [ClusterCondition],
    condition_type: &str,
) -> Option<&'a ClusterCondition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(status: &str, reason: &str, message: &str) -> ClusterCondition {
        ClusterCondition {
            r#type: CLUSTER_SYNCHRO_CONDITION.to_string(),
            status: status.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }

    #[test]
    fn test_build_condition() {
        let cond = synchro_condition(CONDITION_TRUE, REASON_RUNNING, "");
        assert_eq!(cond.r#type, "ClusterSynchro");
        assert_eq!(cond.status, "True");
        assert!(cond.last_transition_time.is_some());
        assert_eq!(cond.reason.as_deref(), Some("Running"));
    }

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, synchro_condition(CONDITION_TRUE, REASON_RUNNING, ""));
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_set_condition_keeps_transition_time_when_unchanged() {
        let mut conditions = vec![fixed(CONDITION_TRUE, REASON_RUNNING, "first")];
        set_condition(
            &mut conditions,
            synchro_condition(CONDITION_TRUE, REASON_RUNNING, "second"),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(conditions[0].message.as_deref(), Some("second"));
    }

    #[test]
    fn test_set_condition_rewrites_on_reason_change() {
        let mut conditions = vec![fixed(CONDITION_FALSE, REASON_INVALID_CONFIG, "bad")];
        set_condition(
            &mut conditions,
            synchro_condition(CONDITION_FALSE, REASON_INITIAL_FAILED, "unreachable"),
        );

        assert_eq!(conditions[0].reason.as_deref(), Some("InitialFailed"));
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_set_condition_rewrites_on_status_change() {
        let mut conditions = vec![fixed(CONDITION_FALSE, REASON_INVALID_CONFIG, "bad")];
        set_condition(
            &mut conditions,
            synchro_condition(CONDITION_TRUE, REASON_RUNNING, ""),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_find_condition() {
        let conditions = vec![fixed(CONDITION_TRUE, REASON_RUNNING, "")];
        assert!(find_condition(&conditions, CLUSTER_SYNCHRO_CONDITION).is_some());
        assert!(find_condition(&conditions, "Ready").is_none());
    }
}
