//! WF-013: Lock file management — load, save (atomic), path derivation.

use super::types::{UnitLock, WeaveLock};
use std::path::{Path, PathBuf};

/// Lock file name, written next to the project file.
pub const LOCK_FILE: &str = "weft.lock.yaml";

/// Derive the lock file path for a project directory.
pub fn lock_file_path(project_dir: &Path) -> PathBuf {
    project_dir.join(LOCK_FILE)
}

/// Load a lock file. Returns None if the file doesn't exist.
pub fn load_lock(path: &Path) -> Result<Option<WeaveLock>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let lock: WeaveLock = serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid lock file {}: {}", path.display(), e))?;
    Ok(Some(lock))
}

/// Save a lock file atomically (write to temp, then rename).
pub fn save_lock(path: &Path, lock: &WeaveLock) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }

    let yaml = serde_yaml_ng::to_string(lock).map_err(|e| format!("serialize error: {}", e))?;

    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        format!(
            "cannot rename {} to {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;

    tracing::debug!(path = %path.display(), units = lock.units.len(), "lock saved");
    Ok(())
}

/// Create a new empty lock for a project.
pub fn new_lock(project: &str, layer_order: Vec<String>) -> WeaveLock {
    use crate::tripwire::eventlog::now_iso8601;
    WeaveLock {
        schema: "1.0".to_string(),
        project: project.to_string(),
        generated_at: now_iso8601(),
        generator: format!("weft {}", env!("CARGO_PKG_VERSION")),
        blake3_version: "1.8".to_string(),
        layer_order,
        units: indexmap::IndexMap::new(),
    }
}

/// Units whose entry differs between two locks, plus units present in only one.
pub fn changed_units<'a>(old: &'a WeaveLock, new: &'a WeaveLock) -> Vec<&'a str> {
    let mut out: Vec<&str> = new
        .units
        .iter()
        .filter(|(name, entry)| old.units.get(*name).map_or(true, |o: &UnitLock| o.hash != entry.hash))
        .map(|(name, _)| name.as_str())
        .collect();
    out.extend(
        old.units
            .keys()
            .filter(|name| !new.units.contains_key(*name))
            .map(String::as_str),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::UnitStatus;

    fn make_lock() -> WeaveLock {
        let mut lock = new_lock("bank", vec!["Audit".to_string(), "Audit:late".to_string()]);
        lock.units.insert(
            "Account".to_string(),
            UnitLock {
                hash: "blake3:abc123".to_string(),
                members: 3,
                synthetic: 1,
                transformations: 2,
                status: UnitStatus::Woven,
            },
        );
        lock
    }

    #[test]
    fn test_wf013_lock_file_path() {
        let p = lock_file_path(Path::new("/proj"));
        assert_eq!(p, PathBuf::from("/proj/weft.lock.yaml"));
    }

    #[test]
    fn test_wf013_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_file_path(dir.path());
        save_lock(&path, &make_lock()).unwrap();

        let loaded = load_lock(&path).unwrap().unwrap();
        assert_eq!(loaded.project, "bank");
        assert_eq!(loaded.layer_order, vec!["Audit", "Audit:late"]);
        assert_eq!(loaded.units["Account"].status, UnitStatus::Woven);
    }

    #[test]
    fn test_wf013_load_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_lock(&lock_file_path(dir.path())).unwrap().is_none());
    }

    #[test]
    fn test_wf013_load_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_file_path(dir.path());
        std::fs::write(&path, "units: [").unwrap();
        assert!(load_lock(&path).unwrap_err().contains("invalid lock file"));
    }

    #[test]
    fn test_wf013_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_file_path(dir.path());
        save_lock(&path, &make_lock()).unwrap();
        assert!(!dir.path().join("weft.lock.yaml.tmp").exists());
        assert!(path.exists());
    }

    #[test]
    fn test_wf013_new_lock() {
        let lock = new_lock("bank", Vec::new());
        assert!(lock.generated_at.contains('T'));
        assert!(lock.generator.starts_with("weft "));
        assert!(lock.units.is_empty());
    }

    #[test]
    fn test_wf013_changed_units() {
        let old = make_lock();
        let mut new = make_lock();
        assert!(changed_units(&old, &new).is_empty());
        new.units["Account"].hash = "blake3:def".to_string();
        new.units.insert(
            "Ledger".to_string(),
            UnitLock {
                hash: "blake3:1".to_string(),
                members: 0,
                synthetic: 0,
                transformations: 0,
                status: UnitStatus::Untouched,
            },
        );
        assert_eq!(changed_units(&old, &new), vec!["Account", "Ledger"]);
        assert_eq!(changed_units(&new, &old), vec!["Account", "Ledger"]);
    }

    #[test]
    fn test_wf013_roundtrip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_file_path(dir.path());
        let mut lock = make_lock();
        let mut entry = lock.units["Account"].clone();
        entry.hash = "blake3:xxx".to_string();
        lock.units.insert("Aaa".to_string(), entry);
        save_lock(&path, &lock).unwrap();
        let loaded = load_lock(&path).unwrap().unwrap();
        let keys: Vec<_> = loaded.units.keys().collect();
        assert_eq!(keys, vec!["Account", "Aaa"]);
    }
}
