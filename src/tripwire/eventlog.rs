//! WF-015: Append-only JSONL weave event log.

use crate::core::types::{TimestampedEvent, WeaveEvent};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Generate an ISO 8601 timestamp.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = dur.as_secs();
    let days = secs / 86400;
    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Days since epoch to Y-M-D (simplified Gregorian)
    let mut y = 1970i64;
    let mut remaining = days as i64;
    loop {
        let year_days = if is_leap(y) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        y += 1;
    }
    let leap = is_leap(y);
    let month_days = [
        31,
        if leap { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut m = 0;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md as i64 {
            m = i + 1;
            break;
        }
        remaining -= md as i64;
    }
    let d = remaining + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y, m, d, hours, minutes, seconds
    )
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Default event log name, next to the project file.
pub const EVENT_LOG: &str = "weft.events.jsonl";

/// Event log path: the policy's `event_log` if set, else the default name,
/// relative to the project directory.
pub fn event_log_path(project_dir: &Path, configured: Option<&str>) -> PathBuf {
    project_dir.join(configured.unwrap_or(EVENT_LOG))
}

/// Append events to the log, one JSON object per line.
pub fn append_events(path: &Path, events: &[WeaveEvent]) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create log dir: {}", e))?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;

    let ts = now_iso8601();
    for event in events {
        let te = TimestampedEvent {
            ts: ts.clone(),
            event: event.clone(),
        };
        let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;
        writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;
    }
    Ok(())
}

/// Append a single event.
pub fn append_event(path: &Path, event: WeaveEvent) -> Result<(), String> {
    append_events(path, std::slice::from_ref(&event))
}

/// Read every event in the log. A missing log reads as empty; malformed
/// lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<TimestampedEvent>, String> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read event log {}: {}", path.display(), e))?;
    Ok(content
        .lines()
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(te) => Some(te),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed event line");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(run_id: &str) -> WeaveEvent {
        WeaveEvent::WeaveStarted {
            project: "bank".to_string(),
            run_id: run_id.to_string(),
            weft_version: "0.3.0".to_string(),
        }
    }

    #[test]
    fn test_wf015_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }

    #[test]
    fn test_wf015_generate_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert!(id.len() > 4);
    }

    #[test]
    fn test_wf015_event_log_path() {
        let p = event_log_path(Path::new("/proj"), None);
        assert_eq!(p, PathBuf::from("/proj/weft.events.jsonl"));
        let p = event_log_path(Path::new("/proj"), Some("logs/w.jsonl"));
        assert_eq!(p, PathBuf::from("/proj/logs/w.jsonl"));
    }

    #[test]
    fn test_wf015_append_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        append_event(&path, started("r-abc")).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"event\":\"weave_started\""));
        assert!(content.contains("r-abc"));
    }

    #[test]
    fn test_wf015_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/events.jsonl");
        let events: Vec<WeaveEvent> = (0..3)
            .map(|i| WeaveEvent::LayerApplied {
                unit: "Account".to_string(),
                layer: format!("Audit:l{}", i),
                transformations: i,
            })
            .collect();
        append_events(&path, &events).unwrap();
        append_event(&path, started("r-2")).unwrap();

        let read = read_events(&path).unwrap();
        assert_eq!(read.len(), 4);
        assert!(matches!(read[1].event, WeaveEvent::LayerApplied { transformations: 1, .. }));
        assert!(matches!(read[3].event, WeaveEvent::WeaveStarted { .. }));
    }

    #[test]
    fn test_wf015_read_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        assert!(read_events(&path).unwrap().is_empty());
        std::fs::write(&path, "not json\n").unwrap();
        append_event(&path, started("r-3")).unwrap();
        assert_eq!(read_events(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_wf015_is_leap() {
        assert!(is_leap(2000));
        assert!(is_leap(1600));
        assert!(!is_leap(1900));
        assert!(!is_leap(2100));
        assert!(is_leap(2024));
        assert!(is_leap(1996));
        assert!(!is_leap(2023));
        assert!(!is_leap(2026));
    }
}
