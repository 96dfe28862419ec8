use k8s_openapi::api::core::v1::Taint;
use std::collections::BTreeMap;

/// Sets `key = value` in `annotations`, returning whether the map
/// changed. Used so wrapper mutations can track `changed` without
/// rewriting annotations that are already correct (§4.2, "Upsert ...
/// sets changed=true only on an actual change").
pub fn set_annotation(annotations: &mut BTreeMap<String, String>, key: &str, value: String) -> bool {
    if annotations.get(key) == Some(&value) {
        return false;
    }
    annotations.insert(key.to_owned(), value);
    true
}

/// Removes `key` from `annotations`, returning whether it was present.
pub fn remove_annotation(annotations: &mut BTreeMap<String, String>, key: &str) -> bool {
    annotations.remove(key).is_some()
}

/// Adds `taint` to `taints` unless a taint with the same key+effect is
/// already present. Returns whether the list changed.
pub fn ensure_taint(taints: &mut Vec<Taint>, taint: Taint) -> bool {
    if taints
        .iter()
        .any(|t| t.key == taint.key && t.effect == taint.effect)
    {
        return false;
    }
    taints.push(taint);
    true
}

/// Removes every taint with the given key, returning whether any were
/// removed.
pub fn remove_taint(taints: &mut Vec<Taint>, key: &str) -> bool {
    let before = taints.len();
    taints.retain(|t| t.key != key);
    taints.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_annotation_reports_no_change_when_already_equal() {
        let mut annotations = BTreeMap::new();
        assert!(set_annotation(&mut annotations, "a", "1".to_owned()));
        assert!(!set_annotation(&mut annotations, "a", "1".to_owned()));
        assert!(set_annotation(&mut annotations, "a", "2".to_owned()));
    }

    #[test]
    fn taint_helpers_are_idempotent() {
        let mut taints = Vec::new();
        let taint = Taint {
            key: "k".to_owned(),
            effect: "NoSchedule".to_owned(),
            value: None,
            time_added: None,
        };
        assert!(ensure_taint(&mut taints, taint.clone()));
        assert!(!ensure_taint(&mut taints, taint.clone()));
        assert_eq!(taints.len(), 1);
        assert!(remove_taint(&mut taints, "k"));
        assert!(!remove_taint(&mut taints, "k"));
        assert!(taints.is_empty());
    }
}
