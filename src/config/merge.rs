//! Field-by-field merging of configuration tiers.
//!
//! Tiers are parsed to JSON first so that a tier only needs to mention the
//! fields it changes. Sections merge recursively; scalars and lists from a
//! higher tier replace the lower value; `null` leaves the lower value alone.

use serde_json::Value;

/// Merge `overlay` into `base` in place.
fn merge_into(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Null => {}
        Value::Object(fields) => {
            if !base.is_object() {
                *base = Value::Object(Default::default());
            }
            if let Value::Object(target) = base {
                for (name, value) in fields {
                    merge_into(target.entry(name).or_insert(Value::Null), value);
                }
            }
        }
        other => *base = other,
    }
}

/// Return `base` with `overlay` merged over it.
///
/// ```
/// use serde_json::json;
/// use agent_tasks::config::deep_merge;
///
/// let defaults = json!({
///     "agents": { "heartbeat_interval_ms": 3000, "offline_threshold_ms": 10000 },
///     "store": { "backend": "file" }
/// });
/// let project = json!({
///     "agents": { "offline_threshold_ms": 20000 },
///     "store": null
/// });
/// let merged = deep_merge(defaults, project);
/// assert_eq!(merged["agents"]["heartbeat_interval_ms"], 3000);
/// assert_eq!(merged["agents"]["offline_threshold_ms"], 20000);
/// assert_eq!(merged["store"]["backend"], "file");
/// ```
pub fn deep_merge(mut base: Value, overlay: Value) -> Value {
    merge_into(&mut base, overlay);
    base
}

/// Merge tiers lowest first; later tiers win.
pub fn deep_merge_all(tiers: impl IntoIterator<Item = Value>) -> Value {
    let mut merged = Value::Null;
    for tier in tiers {
        merge_into(&mut merged, tier);
    }
    merged
}
