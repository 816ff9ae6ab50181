//! WF-016: Drift detection — compare a fresh weave to the lock.
//!
//! A weave is deterministic for a fixed project, so any difference between
//! the locked fingerprints and a re-run means the project, the aspects, or
//! the weaver changed.

use crate::core::types::{WeaveEvent, WeaveLock};
use crate::tripwire::hasher;

/// What kind of difference was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftKind {
    /// The unit's linked output hashes differently.
    Changed,
    /// The unit is in the lock but no longer woven.
    Missing,
    /// The unit is woven but absent from the lock.
    New,
}

/// A single drift finding.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftFinding {
    pub unit: String,
    pub kind: DriftKind,
    pub expected_hash: String,
    pub actual_hash: String,
    pub detail: String,
}

impl DriftFinding {
    pub fn to_event(&self) -> WeaveEvent {
        WeaveEvent::DriftDetected {
            unit: self.unit.clone(),
            expected_hash: self.expected_hash.clone(),
            actual_hash: self.actual_hash.clone(),
        }
    }
}

/// Compare per-unit fingerprints and the layer order.
pub fn detect_drift(locked: &WeaveLock, fresh: &WeaveLock) -> Vec<DriftFinding> {
    let mut findings = Vec::new();

    if locked.layer_order != fresh.layer_order {
        findings.push(DriftFinding {
            unit: "*".to_string(),
            kind: DriftKind::Changed,
            expected_hash: layer_order_hash(locked),
            actual_hash: layer_order_hash(fresh),
            detail: format!(
                "layer order changed: [{}] -> [{}]",
                locked.layer_order.join(", "),
                fresh.layer_order.join(", ")
            ),
        });
    }

    for (name, entry) in &locked.units {
        match fresh.units.get(name) {
            None => findings.push(DriftFinding {
                unit: name.clone(),
                kind: DriftKind::Missing,
                expected_hash: entry.hash.clone(),
                actual_hash: "MISSING".to_string(),
                detail: format!("unit '{}' is no longer woven", name),
            }),
            Some(now) if now.hash != entry.hash => findings.push(DriftFinding {
                unit: name.clone(),
                kind: DriftKind::Changed,
                expected_hash: entry.hash.clone(),
                actual_hash: now.hash.clone(),
                detail: format!(
                    "unit '{}' output changed ({} -> {} members, {} -> {} synthetic)",
                    name, entry.members, now.members, entry.synthetic, now.synthetic
                ),
            }),
            Some(_) => {}
        }
    }

    for (name, now) in &fresh.units {
        if !locked.units.contains_key(name) {
            findings.push(DriftFinding {
                unit: name.clone(),
                kind: DriftKind::New,
                expected_hash: "NONE".to_string(),
                actual_hash: now.hash.clone(),
                detail: format!("unit '{}' is not in the lock", name),
            });
        }
    }

    if !findings.is_empty() {
        tracing::warn!(findings = findings.len(), "drift detected");
    }
    findings
}

fn layer_order_hash(lock: &WeaveLock) -> String {
    hasher::hash_string(&lock.layer_order.join("\n"))
}

/// One fingerprint for the whole weave: layer order plus every unit hash in
/// unit order.
pub fn weave_fingerprint(lock: &WeaveLock) -> String {
    let order = layer_order_hash(lock);
    let mut parts: Vec<&str> = vec![order.as_str()];
    parts.extend(lock.units.values().map(|u| u.hash.as_str()));
    hasher::composite_hash(&parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::new_lock;
    use crate::core::types::{UnitLock, UnitStatus};

    fn lock(units: &[(&str, &str)]) -> WeaveLock {
        let mut l = new_lock("bank", vec!["Audit".to_string()]);
        for (name, hash) in units {
            l.units.insert(
                name.to_string(),
                UnitLock {
                    hash: hash.to_string(),
                    members: 2,
                    synthetic: 1,
                    transformations: 1,
                    status: UnitStatus::Woven,
                },
            );
        }
        l
    }

    #[test]
    fn test_wf016_no_drift() {
        let a = lock(&[("Account", "blake3:1"), ("Ledger", "blake3:2")]);
        assert!(detect_drift(&a, &a.clone()).is_empty());
    }

    #[test]
    fn test_wf016_changed_unit() {
        let a = lock(&[("Account", "blake3:1")]);
        let b = lock(&[("Account", "blake3:9")]);
        let findings = detect_drift(&a, &b);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, DriftKind::Changed);
        assert_eq!(findings[0].actual_hash, "blake3:9");
        assert!(matches!(findings[0].to_event(), WeaveEvent::DriftDetected { .. }));
    }

    #[test]
    fn test_wf016_missing_and_new() {
        let a = lock(&[("Account", "blake3:1")]);
        let b = lock(&[("Ledger", "blake3:2")]);
        let kinds: Vec<DriftKind> = detect_drift(&a, &b).iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![DriftKind::Missing, DriftKind::New]);
    }

    #[test]
    fn test_wf016_layer_order_change() {
        let a = lock(&[]);
        let mut b = lock(&[]);
        b.layer_order.push("Cache".to_string());
        let findings = detect_drift(&a, &b);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].detail.contains("layer order changed"));
    }

    #[test]
    fn test_wf016_fingerprint() {
        let a = lock(&[("Account", "blake3:1")]);
        let mut b = a.clone();
        assert_eq!(weave_fingerprint(&a), weave_fingerprint(&b));
        b.generated_at = "2000-01-01T00:00:00Z".to_string();
        assert_eq!(weave_fingerprint(&a), weave_fingerprint(&b));
        b.units["Account"].hash = "blake3:2".to_string();
        assert_ne!(weave_fingerprint(&a), weave_fingerprint(&b));
    }
}
