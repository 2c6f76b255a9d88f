//! Schema-evolution support for persisted objects (spec §4.7).
//!
//! Any object kind the Store saves (Task, TaskGroup record, resource config)
//! carries a `schema_version`. On load, if the stored version is older than
//! `current_version()`, the raw JSON is passed through its registered
//! `UpgradeStep` chain, one version at a time, before being deserialized
//! into the concrete Rust type. Every persisted struct also carries a
//! `#[serde(flatten)]` catch-all map (added by `#[gc3_macros::add_version]`)
//! so fields from a future schema version survive an unaffected round trip.

use serde_json::Value;

/// Implemented (usually via `#[gc3_macros::add_version]`) by every struct the
/// Store persists.
pub trait Versioned {
    /// The version this particular value was constructed/loaded with.
    fn schema_version(&self) -> usize;

    /// The latest schema version known to this build of the code.
    fn current_version() -> usize
    where
        Self: Sized;

    fn is_current(&self) -> bool
    where
        Self: Sized,
    {
        self.schema_version() == Self::current_version()
    }
}

/// One schema-upgrade step, taking the raw JSON representation of a
/// persisted object from `from_version` to `from_version + 1`. Registered,
/// in ascending `from_version` order, alongside the type it upgrades (see
/// `gc3_core::store::decode_task`/`decode_group_record`).
pub struct UpgradeStep {
    pub from_version: usize,
    pub apply: fn(Value) -> Value,
}

/// Run `value`'s `schema_version` field through `steps` until it reaches
/// `target_version`, or until no step claims the current version (the chain
/// is incomplete and the object is handed back at whatever version it got
/// to — callers see this later as an `is_current()` mismatch rather than a
/// load failure). Used by every `Store` back-end so the upgrade logic lives
/// in one place instead of being re-implemented per backend.
pub fn apply_upgrades(mut value: Value, steps: &[UpgradeStep], target_version: usize) -> Value {
    loop {
        let current = value.get("schema_version").and_then(Value::as_u64).unwrap_or(1) as usize;
        if current >= target_version {
            return value;
        }
        let Some(step) = steps.iter().find(|s| s.from_version == current) else {
            return value;
        };
        value = (step.apply)(value);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("schema_version".to_string(), Value::from(current + 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Thing {
        schema_version: usize,
    }

    impl Versioned for Thing {
        fn schema_version(&self) -> usize {
            self.schema_version
        }
        fn current_version() -> usize {
            2
        }
    }

    #[test]
    fn detects_stale_schema() {
        let old = Thing { schema_version: 1 };
        let current = Thing { schema_version: 2 };
        assert!(!old.is_current());
        assert!(current.is_current());
    }

    #[test]
    fn apply_upgrades_runs_the_matching_chain() {
        let steps = [UpgradeStep {
            from_version: 1,
            apply: |mut v| {
                if let Some(obj) = v.as_object_mut() {
                    obj.insert("renamed_field".into(), obj.remove("old_field").unwrap_or(json!(null)));
                }
                v
            },
        }];
        let stale = json!({ "schema_version": 1, "old_field": "x" });
        let upgraded = apply_upgrades(stale, &steps, 2);
        assert_eq!(upgraded["schema_version"], json!(2));
        assert_eq!(upgraded["renamed_field"], json!("x"));
        assert!(upgraded.get("old_field").is_none());
    }

    #[test]
    fn apply_upgrades_is_a_no_op_when_already_current() {
        let current = json!({ "schema_version": 2, "field": "x" });
        let out = apply_upgrades(current.clone(), &[], 2);
        assert_eq!(out, current);
    }

    #[test]
    fn apply_upgrades_stops_when_no_step_matches_and_leaves_value_untouched() {
        let stale = json!({ "schema_version": 1, "field": "x" });
        let out = apply_upgrades(stale.clone(), &[], 5);
        assert_eq!(out, stale);
    }
}
