//! Draft report document and its patch merge contract.
//!
//! Patches are partial, possibly deeply nested key/value documents. Applying
//! a patch is a deep merge: object fields merge recursively, everything else
//! (arrays included) replaces wholesale. Re-applying the same patch in full
//! yields the identical document.
//!
//! After every merge a fixed set of minimum-criteria flags is recomputed
//! from non-emptiness checks on specific nested fields. Recomputation always
//! runs, even when the patch touched none of the watched fields, because an
//! earlier merge may have changed them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Watched field paths for the minimum criteria, in flag order.
const CRITERIA_PATHS: [&str; 4] = [
    "reaction.symptoms",
    "reaction.onset",
    "exposure.trigger",
    "outcome.description",
];

/// Deep-merge `patch` into `doc`.
///
/// Object-into-object merges recursively; any other combination replaces the
/// existing value wholesale, including object-to-scalar and scalar-to-object
/// transitions.
pub fn deep_merge(doc: &mut Value, patch: &Value) {
    match (doc, patch) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, incoming) => {
            *slot = incoming.clone();
        }
    }
}

/// The four derived completeness flags, recomputed after every merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftCriteria {
    pub has_symptoms: bool,
    pub has_onset: bool,
    pub has_trigger: bool,
    pub has_outcome: bool,
}

impl DraftCriteria {
    /// Whether every minimum criterion is satisfied.
    pub fn complete(&self) -> bool {
        self.has_symptoms && self.has_onset && self.has_trigger && self.has_outcome
    }
}

/// A draft report: the merged document plus its derived criteria.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DraftReport {
    pub document: Value,
    pub criteria: DraftCriteria,
}

impl DraftReport {
    pub fn new() -> Self {
        Self {
            document: Value::Object(Default::default()),
            criteria: DraftCriteria::default(),
        }
    }

    /// Merge a patch into the document and recompute the criteria flags.
    pub fn apply_patch(&mut self, patch: &Value) {
        deep_merge(&mut self.document, patch);
        self.criteria = compute_criteria(&self.document);
    }
}

/// Recompute the criteria flags from the watched fields.
fn compute_criteria(doc: &Value) -> DraftCriteria {
    let flags: Vec<bool> = CRITERIA_PATHS
        .iter()
        .map(|path| field_non_empty(doc, path))
        .collect();
    DraftCriteria {
        has_symptoms: flags[0],
        has_onset: flags[1],
        has_trigger: flags[2],
        has_outcome: flags[3],
    }
}

/// Look up a dotted path and check the value for non-emptiness: non-blank
/// strings, non-empty arrays/objects, and any number or boolean count.
fn field_non_empty(doc: &Value, path: &str) -> bool {
    let mut current = doc;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return false,
        }
    }
    match current {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_recursive_object_merge() {
        let mut doc = json!({"a": {"x": 1, "y": 2}});
        deep_merge(&mut doc, &json!({"a": {"y": 3, "z": 4}}));
        assert_eq!(doc, json!({"a": {"x": 1, "y": 3, "z": 4}}));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let patch = json!({"a": {"y": 3, "z": 4}, "list": [1, 2]});
        let mut doc = json!({"a": {"x": 1, "y": 2}});
        deep_merge(&mut doc, &patch);
        let once = doc.clone();
        deep_merge(&mut doc, &patch);
        assert_eq!(doc, once);
    }

    #[test]
    fn test_non_objects_replace_wholesale() {
        // Arrays are scalars for merge purposes.
        let mut doc = json!({"tags": [1, 2, 3]});
        deep_merge(&mut doc, &json!({"tags": [9]}));
        assert_eq!(doc, json!({"tags": [9]}));

        // Object replaced by scalar.
        let mut doc = json!({"a": {"x": 1}});
        deep_merge(&mut doc, &json!({"a": 7}));
        assert_eq!(doc, json!({"a": 7}));

        // Scalar replaced by object.
        let mut doc = json!({"a": 7});
        deep_merge(&mut doc, &json!({"a": {"x": 1}}));
        assert_eq!(doc, json!({"a": {"x": 1}}));
    }

    #[test]
    fn test_criteria_recomputed_after_every_merge() {
        let mut report = DraftReport::new();
        assert!(!report.criteria.complete());

        report.apply_patch(&json!({"reaction": {"symptoms": ["hives"], "onset": "10 min"}}));
        assert!(report.criteria.has_symptoms);
        assert!(report.criteria.has_onset);
        assert!(!report.criteria.has_trigger);

        // A patch touching none of the watched fields still recomputes.
        report.apply_patch(&json!({"notes": "seen at home"}));
        assert!(report.criteria.has_symptoms);

        report.apply_patch(&json!({
            "exposure": {"trigger": "peanut"},
            "outcome": {"description": "resolved after antihistamine"}
        }));
        assert!(report.criteria.complete());
    }

    #[test]
    fn test_criteria_can_regress_when_field_emptied() {
        let mut report = DraftReport::new();
        report.apply_patch(&json!({"reaction": {"symptoms": ["hives"]}}));
        assert!(report.criteria.has_symptoms);

        report.apply_patch(&json!({"reaction": {"symptoms": []}}));
        assert!(!report.criteria.has_symptoms);
    }

    #[test]
    fn test_blank_strings_are_empty() {
        let mut report = DraftReport::new();
        report.apply_patch(&json!({"reaction": {"onset": "   "}}));
        assert!(!report.criteria.has_onset);

        report.apply_patch(&json!({"reaction": {"onset": "right away"}}));
        assert!(report.criteria.has_onset);
    }
}
