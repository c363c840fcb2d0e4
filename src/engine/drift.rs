//! One-way drift detection: every field present in the Git-sourced manifest
//! must also be present (and equal) on the live cluster object. Extra
//! fields the cluster or the API server added (status, defaults,
//! `managedFields`, …) are not drift — Git is a subset, not a mirror.

use serde_yaml::Value;
use similar::{ChangeTag, TextDiff};

const SKIP_ROOT_KEYS: &[&str] = &["apiVersion", "kind", "status"];
const SKIP_METADATA_KEYS: &[&str] = &[
    "uid",
    "resourceVersion",
    "creationTimestamp",
    "generation",
    "managedFields",
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DriftReport {
    pub has_drift: bool,
    pub reasons: Vec<String>,
}

impl DriftReport {
    fn push(&mut self, reason: impl Into<String>) {
        self.has_drift = true;
        self.reasons.push(reason.into());
    }
}

/// Compares a Git manifest (`desired`) against the live object (`actual`)
/// and reports whether the desired fields are all satisfied.
pub fn detect(key: &str, desired: &Value, actual: &Value) -> DriftReport {
    let mut report = DriftReport::default();
    check_subset(key, "", desired, actual, &mut report);
    report
}

fn check_subset(key: &str, path: &str, desired: &Value, actual: &Value, report: &mut DriftReport) {
    let Some(desired_map) = desired.as_mapping() else {
        if desired != actual {
            report.push(format!("{key}: field {path} differs"));
        }
        return;
    };
    let Some(actual_map) = actual.as_mapping() else {
        report.push(format!("{key}: field {path} missing on cluster"));
        return;
    };

    for (field, desired_value) in desired_map {
        let Some(field_name) = field.as_str() else {
            continue;
        };
        let child_path = if path.is_empty() {
            field_name.to_owned()
        } else {
            format!("{path}.{field_name}")
        };

        if path.is_empty() && SKIP_ROOT_KEYS.contains(&field_name) {
            continue;
        }
        if path == "metadata" && SKIP_METADATA_KEYS.contains(&field_name) {
            continue;
        }

        match actual_map.get(field) {
            None => report.push(format!("{key}: field {child_path} missing on cluster")),
            Some(actual_value) => {
                if desired_value.is_mapping() {
                    check_subset(key, &child_path, desired_value, actual_value, report);
                } else if desired_value != actual_value {
                    report.push(format!(
                        "{key}: field {child_path} expected {} got {}",
                        render(desired_value),
                        render(actual_value)
                    ));
                }
            }
        }
    }
}

fn render(v: &Value) -> String {
    serde_yaml::to_string(v).unwrap_or_default().trim().to_owned()
}

/// Renders a human-readable unified diff between the desired and actual
/// YAML representations of a resource, for inclusion in drift reports.
pub fn render_diff(desired: &Value, actual: &Value) -> String {
    let desired_text = serde_yaml::to_string(desired).unwrap_or_default();
    let actual_text = serde_yaml::to_string(actual).unwrap_or_default();
    let diff = TextDiff::from_lines(&actual_text, &desired_text);
    let mut out = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => "-",
            ChangeTag::Insert => "+",
            ChangeTag::Equal => " ",
        };
        out.push_str(sign);
        out.push_str(&change.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn no_drift_when_cluster_is_superset() {
        let desired = yaml("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  key: value\n");
        let actual = yaml("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  uid: xyz\n  resourceVersion: '1'\ndata:\n  key: value\n  extra: ignored\n");
        let report = detect("ConfigMap//a", &desired, &actual);
        assert!(!report.has_drift, "{:?}", report.reasons);
    }

    #[test]
    fn drift_on_changed_value() {
        let desired = yaml("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  key: value\n");
        let actual = yaml("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  key: different\n");
        let report = detect("ConfigMap//a", &desired, &actual);
        assert!(report.has_drift);
        assert_eq!(report.reasons.len(), 1);
    }

    #[test]
    fn drift_on_missing_field() {
        let desired = yaml("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  key: value\n  other: x\n");
        let actual = yaml("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  key: value\n");
        let report = detect("ConfigMap//a", &desired, &actual);
        assert!(report.has_drift);
    }

    #[test]
    fn ignores_managed_fields_and_status() {
        let desired = yaml("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  key: value\n");
        let actual = yaml("apiVersion: v1\nkind: ConfigMap\nstatus:\n  whatever: true\nmetadata:\n  name: a\n  managedFields: []\n  generation: 3\ndata:\n  key: value\n");
        let report = detect("ConfigMap//a", &desired, &actual);
        assert!(!report.has_drift, "{:?}", report.reasons);
    }
}
