//! Condition list maintenance
//!
//! Conditions are keyed by type. Setting a condition whose status did not
//! change keeps the original `lastTransitionTime`, so repeated reconciles of
//! the same state leave the status untouched.

use crate::crd::Condition;

/// Insert or update `condition` in `conditions` by type.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                existing.last_transition_time = condition.last_transition_time;
            }
            existing.status = condition.status;
            existing.reason = condition.reason;
            existing.message = condition.message;
        }
        None => conditions.push(condition),
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ConditionStatus;
    use chrono::{Duration, Utc};

    fn has_status(conditions: &[Condition], type_: &str, status: ConditionStatus) -> bool {
        find_condition(conditions, type_).is_some_and(|c| c.status == status)
    }

    fn aged(type_: &str, status: ConditionStatus, reason: &str) -> Condition {
        let mut c = Condition::new(type_, status, reason, "");
        c.last_transition_time = Utc::now() - Duration::hours(1);
        c
    }

    #[test]
    fn new_condition_is_appended() {
        let mut conditions = vec![];
        set_condition(
            &mut conditions,
            Condition::new("CacheCRFound", ConditionStatus::True, "CacheCRFound", ""),
        );
        assert_eq!(conditions.len(), 1);
        assert!(has_status(&conditions, "CacheCRFound", ConditionStatus::True));
    }

    #[test]
    fn same_status_keeps_transition_time() {
        let original = aged("OperationReady", ConditionStatus::True, "CacheMiss");
        let stamp = original.last_transition_time;
        let mut conditions = vec![original];

        set_condition(
            &mut conditions,
            Condition::new("OperationReady", ConditionStatus::True, "CacheHit", "acquired"),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, stamp);
        assert_eq!(conditions[0].reason, "CacheHit");
        assert_eq!(conditions[0].message, "acquired");
    }

    #[test]
    fn status_flip_moves_transition_time() {
        let original = aged("CachedOpAcquired", ConditionStatus::False, "CacheMiss");
        let stamp = original.last_transition_time;
        let mut conditions = vec![original];

        set_condition(
            &mut conditions,
            Condition::new("CachedOpAcquired", ConditionStatus::True, "CacheHit", ""),
        );

        assert!(conditions[0].last_transition_time > stamp);
        assert!(has_status(&conditions, "CachedOpAcquired", ConditionStatus::True));
    }

    #[test]
    fn missing_condition_has_no_status() {
        assert!(find_condition(&[], "OperationReady").is_none());
        assert!(!has_status(&[], "OperationReady", ConditionStatus::False));
    }
}
