//! Shallow delta envelopes between successive published payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload change as sent to topic subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Envelope {
    /// Full replacement of the retained payload
    Snapshot { snapshot: Value },
    /// Top-level fields that changed or disappeared
    Delta {
        set: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        remove: Vec<String>,
    },
}

impl Envelope {
    pub fn snapshot(value: Value) -> Self {
        Envelope::Snapshot { snapshot: value }
    }

    pub fn is_delta(&self) -> bool {
        matches!(self, Envelope::Delta { .. })
    }

    /// Rebuild the payload a subscriber holding `previous` should now see.
    pub fn apply(&self, previous: Option<&Value>) -> Value {
        match self {
            Envelope::Snapshot { snapshot } => snapshot.clone(),
            Envelope::Delta { set, remove } => {
                let mut base = previous
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                for key in remove {
                    base.remove(key);
                }
                for (key, value) in set {
                    base.insert(key.clone(), value.clone());
                }
                Value::Object(base)
            }
        }
    }
}

/// Envelope describing the change from `previous` to `next`.
///
/// Non-object payloads on either side produce a snapshot envelope. Returns
/// `None` when two objects are equal.
pub fn delta_envelope(previous: Option<&Value>, next: &Value) -> Option<Envelope> {
    let (Some(Value::Object(prev)), Value::Object(curr)) = (previous, next) else {
        return Some(Envelope::snapshot(next.clone()));
    };

    let set: Map<String, Value> = curr
        .iter()
        .filter(|(key, value)| prev.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let remove: Vec<String> = prev
        .keys()
        .filter(|key| !curr.contains_key(*key))
        .cloned()
        .collect();

    if set.is_empty() && remove.is_empty() {
        return None;
    }
    Some(Envelope::Delta { set, remove })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_publish_is_snapshot() {
        let next = json!({"a": 1});
        let envelope = delta_envelope(None, &next).unwrap();
        assert_eq!(envelope, Envelope::snapshot(next.clone()));
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({"mode": "snapshot", "snapshot": {"a": 1}})
        );
    }

    #[test]
    fn shape_change_is_snapshot() {
        let prev = json!({"a": 1});
        let next = json!([1, 2]);
        assert!(!delta_envelope(Some(&prev), &next).unwrap().is_delta());
    }

    #[test]
    fn set_and_remove() {
        let prev = json!({"a": 1, "b": {"x": 1}, "c": true});
        let next = json!({"a": 1, "b": {"x": 2}, "d": "new"});
        let envelope = delta_envelope(Some(&prev), &next).unwrap();

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({"mode": "delta", "set": {"b": {"x": 2}, "d": "new"}, "remove": ["c"]})
        );
        assert_eq!(envelope.apply(Some(&prev)), next);
    }

    #[test]
    fn unchanged_yields_none() {
        let value = json!({"a": [1, 2, 3]});
        assert!(delta_envelope(Some(&value), &value.clone()).is_none());
    }

    #[test]
    fn delta_without_removals_omits_field() {
        let envelope = delta_envelope(Some(&json!({"a": 1})), &json!({"a": 2})).unwrap();
        assert_eq!(
            serde_json::to_value(envelope).unwrap(),
            json!({"mode": "delta", "set": {"a": 2}})
        );
    }
}
